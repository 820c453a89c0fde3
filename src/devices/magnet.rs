//! Magnet current driver.
//!
//! Four coil supplies behind one serial link (19200 baud, CRLF-terminated).
//! The driver takes per-channel current programs (`PW <channel> <amps>`) and
//! a global output trigger (`P_ON` / `P_OFF`). Channel currents of exactly
//! zero are floored to 1 mA — the supply rejects a zero program.

use crate::bus::BusChannel;
use crate::error::SpimResult;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Minimum programmable channel current in A.
const MIN_CHANNEL_CURRENT_A: f64 = 0.001;

/// Driver for the four-channel magnet supply.
pub struct MagnetDriver {
    channel: Mutex<BusChannel>,
    /// Settle delay between consecutive channel writes.
    settle: Duration,
}

impl MagnetDriver {
    /// Wrap an unopened channel to the current driver.
    pub fn new(channel: BusChannel, settle: Duration) -> Self {
        Self {
            channel: Mutex::new(channel),
            settle,
        }
    }

    /// Open the link. Failure is logged and reported; the caller decides
    /// whether the experiment can continue without the magnet.
    pub fn connect(&self) -> bool {
        let mut channel = match self.channel.lock() {
            Ok(channel) => channel,
            Err(poisoned) => poisoned.into_inner(),
        };
        match channel.open() {
            Ok(()) => {
                info!("magnet driver connected");
                true
            }
            Err(err) => {
                warn!(%err, "could not connect to magnet driver");
                false
            }
        }
    }

    /// Close the link. Idempotent.
    pub fn close(&self) {
        if let Ok(mut channel) = self.channel.lock() {
            channel.close();
        }
    }

    /// Program all four channel currents (A), flooring zeros to 1 mA.
    pub fn set_channel_currents(&self, currents: [f64; 4]) -> SpimResult<()> {
        let mut channel = match self.channel.lock() {
            Ok(channel) => channel,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (index, current) in currents.iter().enumerate() {
            let amps = current.max(MIN_CHANNEL_CURRENT_A);
            channel.write_command(&format!("PW {} {}", index + 1, amps))?;
            thread::sleep(self.settle);
        }
        Ok(())
    }

    /// Switch the programmed outputs on or off.
    pub fn set_enabled(&self, enabled: bool) -> SpimResult<()> {
        let mut channel = match self.channel.lock() {
            Ok(channel) => channel,
            Err(poisoned) => poisoned.into_inner(),
        };
        channel.write_command(if enabled { "P_ON" } else { "P_OFF" })?;
        Ok(())
    }

    /// Timed pulse: program `currents`, enable, hold for `duration`, disable.
    pub fn pulse(&self, currents: [f64; 4], duration: Duration) -> SpimResult<()> {
        self.set_channel_currents(currents)?;
        self.set_enabled(true)?;
        thread::sleep(duration);
        self.set_enabled(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockTransport;

    fn driver_with_mock() -> (MagnetDriver, std::sync::Arc<Mutex<Vec<String>>>) {
        let transport = MockTransport::new();
        let writes = transport.writes();
        let channel =
            BusChannel::new("magnet driver", Box::new(transport)).with_line_terminator("\r\n");
        (
            MagnetDriver::new(channel, Duration::from_millis(1)),
            writes,
        )
    }

    #[test]
    fn test_zero_currents_floored() {
        let (driver, writes) = driver_with_mock();
        assert!(driver.connect());
        driver.set_channel_currents([0.0, 0.5, 1.0, 0.0]).unwrap();
        assert_eq!(
            writes.lock().unwrap().as_slice(),
            ["PW 1 0.001", "PW 2 0.5", "PW 3 1", "PW 4 0.001"]
        );
    }

    #[test]
    fn test_pulse_sequences_enable_then_disable() {
        let (driver, writes) = driver_with_mock();
        assert!(driver.connect());
        driver
            .pulse([0.5; 4], Duration::from_millis(5))
            .unwrap();
        let writes = writes.lock().unwrap();
        assert_eq!(writes[writes.len() - 2], "P_ON");
        assert_eq!(writes[writes.len() - 1], "P_OFF");
    }

    #[test]
    fn test_crlf_framing_on_the_wire() {
        let transport = MockTransport::new();
        let raw = transport.raw_writes();
        let channel =
            BusChannel::new("magnet driver", Box::new(transport)).with_line_terminator("\r\n");
        let driver = MagnetDriver::new(channel, Duration::from_millis(1));
        assert!(driver.connect());
        driver.set_enabled(true).unwrap();
        assert_eq!(raw.lock().unwrap().as_slice(), ["P_ON\r\n"]);
    }
}
