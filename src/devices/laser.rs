//! Standalone laser heads.
//!
//! Each laser sits on its own serial link (9600 baud, CR-terminated) and
//! accepts a small write-only command set: internal modulation select, power
//! level, emission on/off. The heads only resolve power to the nearest mW,
//! so requested powers are rounded before transmission.
//!
//! Connectivity is best-effort: a head that fails to open is logged and
//! skipped, and every set operation on it becomes a no-op warning. The rig
//! is usable with either laser absent.

use crate::bus::BusChannel;
use crate::error::SpimResult;
use std::sync::Mutex;
use tracing::{info, warn};

/// One laser head on its own serial channel.
pub struct LaserChannel {
    label: String,
    channel: Mutex<BusChannel>,
}

impl LaserChannel {
    /// Wrap an unopened channel to a laser head.
    pub fn new(label: impl Into<String>, channel: BusChannel) -> Self {
        Self {
            label: label.into(),
            channel: Mutex::new(channel),
        }
    }

    /// Channel label used in log messages.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Try to open the link. Returns whether the head is reachable; failure
    /// is logged and the rig continues without this head.
    pub fn connect(&self) -> bool {
        let Ok(mut channel) = self.channel.lock() else {
            return false;
        };
        match channel.open() {
            Ok(()) => {
                info!(laser = %self.label, "laser connected");
                true
            }
            Err(err) => {
                warn!(laser = %self.label, %err, "could not connect to laser");
                false
            }
        }
    }

    /// True when the serial link is open.
    pub fn is_connected(&self) -> bool {
        self.channel.lock().map(|c| c.is_open()).unwrap_or(false)
    }

    /// Close the link. Idempotent.
    pub fn close(&self) {
        if let Ok(mut channel) = self.channel.lock() {
            channel.close();
        }
    }

    /// Set the output power. Rejected (warning, nothing transmitted) for
    /// non-positive powers; otherwise rounded to the nearest mW.
    pub fn set_power(&self, power_w: f64) -> SpimResult<()> {
        if !self.is_connected() {
            warn!(laser = %self.label, "laser not connected");
            return Ok(());
        }
        if power_w <= 0.0 {
            warn!(laser = %self.label, power_w, "laser power must be positive");
            return Ok(());
        }
        let power = (power_w * 1000.0).round() / 1000.0;
        info!(laser = %self.label, power_mw = power * 1000.0, "setting laser power");
        let mut channel = match self.channel.lock() {
            Ok(channel) => channel,
            Err(poisoned) => poisoned.into_inner(),
        };
        channel.write_command("SOUR:AM:INT")?;
        channel.write_command(&format!("SOUR:POW:LEV:IMM:AMPL {power}"))?;
        Ok(())
    }

    /// Switch emission on or off.
    pub fn set_enabled(&self, enabled: bool) -> SpimResult<()> {
        if !self.is_connected() {
            warn!(laser = %self.label, "laser not connected");
            return Ok(());
        }
        let mut channel = match self.channel.lock() {
            Ok(channel) => channel,
            Err(poisoned) => poisoned.into_inner(),
        };
        channel.write_command(if enabled {
            "SOUR:AM:STAT ON"
        } else {
            "SOUR:AM:STAT OFF"
        })?;
        Ok(())
    }

    /// Push power then emission state, the order the heads expect.
    pub fn apply(&self, power_w: f64, enabled: bool) -> SpimResult<()> {
        self.set_power(power_w)?;
        self.set_enabled(enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockTransport;

    fn laser_with_mock() -> (LaserChannel, std::sync::Arc<Mutex<Vec<String>>>) {
        let transport = MockTransport::new();
        let writes = transport.writes();
        let channel = BusChannel::new("488nm laser", Box::new(transport));
        (LaserChannel::new("488nm laser", channel), writes)
    }

    #[test]
    fn test_power_rounds_to_milliwatt() {
        let (laser, writes) = laser_with_mock();
        assert!(laser.connect());
        laser.set_power(0.0104999).unwrap();
        let writes = writes.lock().unwrap();
        assert_eq!(
            writes.as_slice(),
            ["SOUR:AM:INT", "SOUR:POW:LEV:IMM:AMPL 0.01"]
        );
    }

    #[test]
    fn test_non_positive_power_not_transmitted() {
        let (laser, writes) = laser_with_mock();
        assert!(laser.connect());
        laser.set_power(0.0).unwrap();
        laser.set_power(-0.5).unwrap();
        assert!(writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_emission_commands() {
        let (laser, writes) = laser_with_mock();
        assert!(laser.connect());
        laser.set_enabled(true).unwrap();
        laser.set_enabled(false).unwrap();
        assert_eq!(
            writes.lock().unwrap().as_slice(),
            ["SOUR:AM:STAT ON", "SOUR:AM:STAT OFF"]
        );
    }

    #[test]
    fn test_unreachable_head_is_nonfatal() {
        let transport = MockTransport::new().fail_to_open();
        let channel = BusChannel::new("561nm laser", Box::new(transport));
        let laser = LaserChannel::new("561nm laser", channel);
        assert!(!laser.connect());
        // operations degrade to warnings, not errors
        assert!(laser.set_power(0.010).is_ok());
        assert!(laser.set_enabled(true).is_ok());
    }
}
