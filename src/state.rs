//! Shared mutable instrument state.
//!
//! One `InstrumentState` record is owned by the [`crate::controller::Microscope`]
//! and mutated, under its lock, by motion commands, setpoint changes, the PID
//! control loop and the telemetry poll loop. Deployment constants (calibration,
//! bounds, gains, loop periods) live in [`crate::config::Settings`] instead —
//! only values that change at runtime belong here.

use serde::{Deserialize, Serialize};

/// Peltier drive mode as understood by the heater driver board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaterMode {
    /// Drive disabled.
    #[default]
    Off,
    /// Peltier reversed, pumping heat out of the bath.
    Cool,
    /// Peltier heating the bath.
    Heat,
}

impl HeaterMode {
    /// Wire encoding used in the `SET` configuration record (0 off, 1 cool, 2 heat).
    pub fn code(self) -> u8 {
        match self {
            HeaterMode::Off => 0,
            HeaterMode::Cool => 1,
            HeaterMode::Heat => 2,
        }
    }
}

/// Runtime state shared between operator commands and the supervisor loops.
#[derive(Debug, Clone)]
pub struct InstrumentState {
    /// Last commanded stage position in mm. Optimistic: updated when a move is
    /// transmitted, confirmed only when the position is explicitly polled.
    pub position_mm: f64,
    /// Temperature setpoint in °C.
    pub setpoint_c: f64,
    /// Most recent successfully decoded bath temperature in °C.
    pub measured_c: f64,
    /// Whether the bath is within the on-target band of the setpoint.
    pub on_target: bool,
    /// Open-loop calibration step mode for the temperature controller.
    pub step_mode: bool,
    /// Heater drive mode pushed with the configuration record.
    pub heater_mode: HeaterMode,
    /// Heater PWM duty, 0..=799.
    pub heater_power: u16,
    /// Cooling fan state.
    pub fan_on: bool,
    /// Commanded laser powers in W, one per laser device.
    pub laser_power_w: [f64; 2],
    /// Laser emission state, one per laser device.
    pub laser_enabled: [bool; 2],
    /// Magnet coil currents in A, pushed in the extended configuration record.
    pub magnet_currents: [f64; 4],
    /// White LED intensity, 0..=1023.
    pub led_level: u16,
    /// Raw heater telemetry line most recently read by the poll loop.
    pub last_telemetry: Option<String>,
}

impl Default for InstrumentState {
    fn default() -> Self {
        Self {
            position_mm: 0.0,
            setpoint_c: 17.0,
            measured_c: 0.0,
            on_target: false,
            step_mode: false,
            heater_mode: HeaterMode::Off,
            heater_power: 0,
            fan_on: false,
            laser_power_w: [0.010, 0.010],
            laser_enabled: [false, false],
            magnet_currents: [0.0; 4],
            led_level: 0,
            last_telemetry: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heater_mode_wire_codes() {
        assert_eq!(HeaterMode::Off.code(), 0);
        assert_eq!(HeaterMode::Cool.code(), 1);
        assert_eq!(HeaterMode::Heat.code(), 2);
    }

    #[test]
    fn test_default_state_is_idle() {
        let state = InstrumentState::default();
        assert_eq!(state.heater_mode, HeaterMode::Off);
        assert_eq!(state.heater_power, 0);
        assert!(!state.fan_on);
        assert!(state.last_telemetry.is_none());
    }
}
