//! Serial bus channel.
//!
//! [`BusChannel`] wraps one physical serial connection behind a
//! [`BusTransport`] trait object, so the whole control stack runs unchanged
//! against real hardware ([`serial::SerialTransport`]) or the scripted
//! [`mock::MockTransport`].
//!
//! The channel is a dumb transport: it frames outbound lines and collects
//! inbound ones, nothing more. Mutual exclusion on the shared bus is the task
//! supervisor's responsibility — every component holds the channel inside a
//! `Mutex` and keeps the guard across a full write(+read) exchange.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

use crate::error::{SpimError, SpimResult};
use std::time::Duration;
use tracing::debug;

/// Byte-level transport under a [`BusChannel`].
pub trait BusTransport: Send {
    /// Open the underlying port. Must be a no-op when already open.
    fn open(&mut self) -> SpimResult<()>;
    /// Close the underlying port. Must be a no-op when already closed.
    fn close(&mut self);
    /// True when the port is open.
    fn is_open(&self) -> bool;
    /// Transmit raw bytes.
    fn write(&mut self, bytes: &[u8]) -> SpimResult<()>;
    /// Read the next delimiter-terminated line, or time out.
    fn read_line(&mut self, timeout: Duration) -> SpimResult<String>;
    /// Discard any buffered inbound bytes.
    fn flush_input(&mut self);
}

/// One framed serial channel to a device.
pub struct BusChannel {
    device: String,
    transport: Box<dyn BusTransport>,
    line_terminator: String,
    read_timeout: Duration,
    /// Whether the device emits a boot banner that must be consumed on open.
    discard_banner: bool,
}

impl BusChannel {
    /// Create a channel over `transport` with a CR line terminator.
    pub fn new(device: impl Into<String>, transport: Box<dyn BusTransport>) -> Self {
        Self {
            device: device.into(),
            transport,
            line_terminator: "\r".to_string(),
            read_timeout: Duration::from_secs(5),
            discard_banner: false,
        }
    }

    /// Override the line terminator (the magnet driver wants CRLF).
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Override the read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Consume one line on open to clear the device's boot banner.
    pub fn with_boot_banner(mut self) -> Self {
        self.discard_banner = true;
        self
    }

    /// Device label used in log messages.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// True when the underlying port is open.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Open the channel. Idempotent: returns immediately when already open.
    ///
    /// When the device announces itself with a boot banner, one blocking read
    /// consumes it so the first real exchange starts clean; a silent device
    /// is tolerated (the read simply times out).
    pub fn open(&mut self) -> SpimResult<()> {
        if self.transport.is_open() {
            return Ok(());
        }
        self.transport.open()?;
        if self.discard_banner {
            match self.transport.read_line(self.read_timeout) {
                Ok(banner) => debug!(device = %self.device, banner = banner.trim(), "boot banner"),
                Err(_) => debug!(device = %self.device, "no boot banner before timeout"),
            }
        }
        Ok(())
    }

    /// Close the channel. Idempotent.
    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Append the line terminator and transmit `command`.
    pub fn write_command(&mut self, command: &str) -> SpimResult<()> {
        if !self.transport.is_open() {
            return Err(SpimError::NotOpen);
        }
        debug!(device = %self.device, command, "tx");
        let framed = format!("{}{}", command, self.line_terminator);
        self.transport.write(framed.as_bytes())
    }

    /// Read the next terminated line within the configured timeout.
    pub fn read_line(&mut self) -> SpimResult<String> {
        if !self.transport.is_open() {
            return Err(SpimError::NotOpen);
        }
        let line = self.transport.read_line(self.read_timeout)?;
        debug!(device = %self.device, line = line.trim(), "rx");
        Ok(line)
    }

    /// Discard any stale inbound bytes before a request/response exchange.
    pub fn flush_input(&mut self) {
        self.transport.flush_input();
    }

    /// Write `command` and return the response line, as one exchange.
    pub fn transact(&mut self, command: &str) -> SpimResult<String> {
        self.write_command(command)?;
        self.read_line()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[test]
    fn test_open_is_idempotent() {
        let transport = MockTransport::new();
        let opens = transport.open_count();
        let mut channel = BusChannel::new("stage", Box::new(transport));
        channel.open().unwrap();
        channel.open().unwrap();
        assert_eq!(opens.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_failure_is_connectivity_fault() {
        let transport = MockTransport::new().fail_to_open();
        let mut channel = BusChannel::new("stage", Box::new(transport));
        let err = channel.open().unwrap_err();
        assert!(matches!(err, SpimError::Connectivity { .. }));
    }

    #[test]
    fn test_boot_banner_consumed_before_first_exchange() {
        let transport = MockTransport::new().with_banner("SPIM rig v2 ready");
        let writes = transport.writes();
        let mut channel = BusChannel::new("stage", Box::new(transport))
            .with_boot_banner()
            .with_read_timeout(Duration::from_millis(50));
        channel.open().unwrap();
        // the banner must not surface as a command response
        assert!(channel.read_line().is_err());
        assert!(writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_write_command_appends_terminator() {
        let transport = MockTransport::new();
        let raw = transport.raw_writes();
        let mut channel = BusChannel::new("stage", Box::new(transport));
        channel.open().unwrap();
        channel.write_command("QRP").unwrap();
        assert_eq!(raw.lock().unwrap().as_slice(), ["QRP\r".to_string()]);
    }

    #[test]
    fn test_write_on_closed_channel_rejected() {
        let transport = MockTransport::new();
        let mut channel = BusChannel::new("stage", Box::new(transport));
        assert!(matches!(
            channel.write_command("QRP"),
            Err(SpimError::NotOpen)
        ));
    }

    #[test]
    fn test_transact_returns_scripted_reply() {
        let transport =
            MockTransport::new().with_responder(|cmd| (cmd == "QRP").then(|| "6.15".to_string()));
        let mut channel = BusChannel::new("stage", Box::new(transport))
            .with_read_timeout(Duration::from_millis(50));
        channel.open().unwrap();
        assert_eq!(channel.transact("QRP").unwrap().trim(), "6.15");
    }

    #[test]
    fn test_read_with_no_reply_times_out() {
        let transport = MockTransport::new();
        let mut channel = BusChannel::new("stage", Box::new(transport))
            .with_read_timeout(Duration::from_millis(20));
        channel.open().unwrap();
        assert!(matches!(
            channel.read_line(),
            Err(SpimError::ReadTimeout(_))
        ));
    }
}
