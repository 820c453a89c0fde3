//! Closed-loop temperature regulation.
//!
//! A proportional–integral controller with anti-windup drives the Peltier
//! heater board. The plant is asymmetric — the bath heats more willingly than
//! it cools — so heating and cooling use separate proportional gains, and
//! cooling authority is throttled relative to heating so the cooling drive's
//! own dissipation cannot dominate. The integrator is clamped to
//! `[0, max_signal / integral_gain]` and never goes negative.

use crate::config::ThermalSettings;
use crate::state::HeaterMode;
use tracing::debug;

/// Heater drive derived from one control tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeaterDrive {
    /// Peltier mode for the configuration record.
    pub heater_mode: HeaterMode,
    /// PWM duty, `0..=max_signal`.
    pub heater_power: u16,
    /// Fan runs exactly when cooling.
    pub fan_on: bool,
    /// Measured temperature within the on-target band of the setpoint.
    pub on_target: bool,
}

/// Stateful PI controller; one per instrument, reset when the temperature
/// control task starts.
#[derive(Debug, Clone)]
pub struct PidController {
    settings: ThermalSettings,
    integral_error: f64,
}

impl PidController {
    /// Create a controller with zeroed integral state.
    pub fn new(settings: ThermalSettings) -> Self {
        Self {
            settings,
            integral_error: 0.0,
        }
    }

    /// Accumulated integral error in °C·s, clamped non-negative.
    pub fn integral_error(&self) -> f64 {
        self.integral_error
    }

    /// Zero the integrator; called when the control loop (re)starts.
    pub fn reset(&mut self) {
        self.integral_error = 0.0;
    }

    /// Run one control tick and derive the heater drive.
    ///
    /// `step_mode` forces a fixed open-loop drive for calibration runs,
    /// bypassing the error terms but not the integrator bookkeeping.
    pub fn tick(&mut self, setpoint_c: f64, measured_c: f64, step_mode: bool) -> HeaterDrive {
        let cfg = &self.settings;
        let error = setpoint_c - measured_c;

        let on_target = error.abs() <= cfg.on_target_band_c;

        // integrator runs only near the setpoint; a large excursion resets it
        if error.abs() < cfg.windup_band_c {
            self.integral_error += error * cfg.control_period.as_secs_f64();
        } else {
            self.integral_error = 0.0;
        }
        self.integral_error = self
            .integral_error
            .clamp(0.0, cfg.max_signal / cfg.integral_gain);

        let signal = if step_mode {
            cfg.step_signal
        } else {
            let proportional_gain = if error < 0.0 {
                cfg.cooling_gain
            } else {
                cfg.heating_gain
            };
            error * proportional_gain + self.integral_error * cfg.integral_gain
        };
        let signal = signal.clamp(-(cfg.max_signal * cfg.cooling_throttle), cfg.max_signal);

        let (heater_mode, fan_on) = if signal >= 0.0 {
            (HeaterMode::Heat, false)
        } else {
            (HeaterMode::Cool, true)
        };

        debug!(
            setpoint_c,
            measured_c,
            signal,
            integral = self.integral_error,
            mode = ?heater_mode,
            on_target,
            "temperature control tick"
        );

        HeaterDrive {
            heater_mode,
            heater_power: signal.abs().round() as u16,
            fan_on,
            on_target,
        }
    }
}
