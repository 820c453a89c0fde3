//! Strongly-typed configuration for the instrument.
//!
//! Configuration is loaded from a TOML file (default `spim.toml`) merged with
//! `SPIM_`-prefixed environment variables, on top of compiled-in defaults for
//! the reference deployment. Use `__` as the section separator in overrides:
//!
//! ```text
//! SPIM_THERMAL__SETPOINT_C=25.0
//! SPIM_BUS__PORT=/dev/ttyACM1
//! ```
//!
//! Every per-deployment constant lives here rather than in code: the
//! stage↔mirror calibration, stage bounds, the small-move threshold (observed
//! to differ between rigs), PID gains, loop periods and the protocol schema
//! revision spoken by the bus-owning firmware.

use crate::error::{SpimError, SpimResult};
use crate::protocol::SchemaVersion;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level settings record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Bus-owning device serial link.
    pub bus: BusSettings,
    /// Standalone laser devices, in channel order.
    pub lasers: Vec<LaserPortSettings>,
    /// Magnet current-driver serial link.
    pub magnet: MagnetSettings,
    /// Stage bounds and move classification.
    pub stage: StageSettings,
    /// Stage↔mirror focus calibration.
    pub focus: FocusSettings,
    /// Temperature control loop constants.
    pub thermal: ThermalSettings,
    /// Camera and volume acquisition timing.
    pub acquisition: AcquisitionSettings,
    /// Wire protocol schema revision.
    pub protocol: ProtocolSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bus: BusSettings::default(),
            lasers: vec![
                LaserPortSettings {
                    label: "488nm laser".to_string(),
                    port: "/dev/ttyUSB1".to_string(),
                    baud_rate: 9600,
                },
                LaserPortSettings {
                    label: "561nm laser".to_string(),
                    port: "/dev/ttyUSB2".to_string(),
                    baud_rate: 9600,
                },
            ],
            magnet: MagnetSettings::default(),
            stage: StageSettings::default(),
            focus: FocusSettings::default(),
            thermal: ThermalSettings::default(),
            acquisition: AcquisitionSettings::default(),
            protocol: ProtocolSettings::default(),
        }
    }
}

/// Serial link parameters for the bus-owning device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Serial port path (e.g., "/dev/ttyACM0", "COM6").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout for command/response exchanges.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Serial link parameters for one laser device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaserPortSettings {
    /// Human-readable channel label used in log messages.
    pub label: String,
    /// Serial port path.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
}

impl Default for LaserPortSettings {
    fn default() -> Self {
        Self {
            label: "laser".to_string(),
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
        }
    }
}

/// Serial link parameters for the magnet current driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MagnetSettings {
    /// Serial port path.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Settle delay between consecutive channel writes.
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
}

impl Default for MagnetSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB3".to_string(),
            baud_rate: 19_200,
            settle: Duration::from_millis(20),
        }
    }
}

/// Stage bounds and move classification constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    /// Upper travel limit in mm; moves with |position| above this are rejected.
    pub bound_upper_mm: f64,
    /// Lower working limit in mm, pushed to the firmware with `SET`.
    pub bound_lower_mm: f64,
    /// Displacement above which the slow motion profile (`STS`) is selected.
    pub small_move_threshold_mm: f64,
    /// Distance of one volume-imaging step in mm (`ste`).
    pub small_move_step_mm: f64,
    /// Measured duration of one small move in ms (`smt`).
    pub small_move_time_ms: u32,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            bound_upper_mm: 6.3,
            bound_lower_mm: 6.0,
            small_move_threshold_mm: 0.010,
            small_move_step_mm: 0.02,
            small_move_time_ms: 20,
        }
    }
}

/// Linear stage-position → mirror-DAC calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusSettings {
    /// DAC counts per mm of stage travel (negative on the reference rig).
    pub slope: f64,
    /// Stage position in mm at which the mirror sits at full scale.
    pub recenter_offset_mm: f64,
}

impl Default for FocusSettings {
    fn default() -> Self {
        Self {
            slope: -4486.982,
            recenter_offset_mm: 6.1,
        }
    }
}

/// Temperature regulation constants.
///
/// The proportional gains are intentionally asymmetric: the bath responds
/// differently to heating and cooling drive, and cooling authority is
/// throttled to keep the cooling drive's own dissipation from dominating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalSettings {
    /// Initial temperature setpoint in °C.
    pub setpoint_c: f64,
    /// Control tick period.
    #[serde(with = "humantime_serde")]
    pub control_period: Duration,
    /// Heater telemetry polling period.
    #[serde(with = "humantime_serde")]
    pub poll_period: Duration,
    /// Temperature logging period.
    #[serde(with = "humantime_serde")]
    pub log_period: Duration,
    /// Proportional gain while heating.
    pub heating_gain: f64,
    /// Proportional gain while cooling.
    pub cooling_gain: f64,
    /// Integral gain.
    pub integral_gain: f64,
    /// Maximum drive signal accepted by the heater board.
    pub max_signal: f64,
    /// Fraction of `max_signal` permitted in cooling mode.
    pub cooling_throttle: f64,
    /// Error band in °C outside which the integrator resets.
    pub windup_band_c: f64,
    /// Error band in °C inside which the controller reports on-target.
    pub on_target_band_c: f64,
    /// Fixed drive used when step mode is engaged.
    pub step_signal: f64,
    /// Telemetry decode attempts per exchange before giving up.
    pub decode_retry_limit: u32,
    /// Delay between decode retries.
    #[serde(with = "humantime_serde")]
    pub decode_retry_delay: Duration,
    /// Polling interval while waiting for the first telemetry read.
    #[serde(with = "humantime_serde")]
    pub ready_poll_interval: Duration,
}

impl Default for ThermalSettings {
    fn default() -> Self {
        Self {
            setpoint_c: 17.0,
            control_period: Duration::from_secs(1),
            poll_period: Duration::from_millis(100),
            log_period: Duration::from_secs(1),
            heating_gain: 120.0,
            cooling_gain: 600.0,
            integral_gain: 1.5,
            max_signal: 799.0,
            cooling_throttle: 0.75,
            windup_band_c: 8.0,
            on_target_band_c: 1.0,
            step_signal: 500.0,
            decode_retry_limit: 3,
            decode_retry_delay: Duration::from_millis(100),
            ready_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Camera triggering and volume sequence timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Camera exposure in ms, passed with each `FRM` trigger.
    pub exposure_ms: u32,
    /// Target interval between triggered frames in ms.
    pub frame_interval_ms: u32,
    /// Time already consumed issuing one trigger, subtracted from the
    /// camera loop period so the configured frame rate is met net of
    /// protocol latency.
    pub trigger_overhead_ms: u32,
    /// Camera index addressed by frame triggers (extended schema only).
    pub camera_index: u8,
    /// Frames captured per volume sequence.
    pub frames_per_volume: u32,
    /// Inter-frame period within a volume sequence in ms.
    pub volume_frame_period_ms: u32,
    /// Pause between repeated volume sequences.
    #[serde(with = "humantime_serde")]
    pub volume_period: Duration,
    /// Duration of a timed volume acquisition run.
    #[serde(with = "humantime_serde")]
    pub imaging_time: Duration,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            exposure_ms: 10,
            frame_interval_ms: 25,
            trigger_overhead_ms: 10,
            camera_index: 4,
            frames_per_volume: 5,
            volume_frame_period_ms: 500,
            volume_period: Duration::from_millis(500),
            imaging_time: Duration::from_secs(30),
        }
    }
}

/// Wire protocol schema selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Schema revision spoken by the bus-owning firmware.
    pub schema: SchemaVersion,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            schema: SchemaVersion::V2,
        }
    }
}

impl Settings {
    /// Load settings from `path` (or `spim.toml` when absent) merged with
    /// `SPIM_`-prefixed environment overrides on top of the defaults.
    pub fn load(path: Option<&Path>) -> SpimResult<Self> {
        let toml = match path {
            Some(p) => Toml::file(p),
            None => Toml::file("spim.toml"),
        };
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(toml)
            .merge(Env::prefixed("SPIM_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks that pass parsing but would misbehave at runtime.
    pub fn validate(&self) -> SpimResult<()> {
        if self.stage.bound_upper_mm <= self.stage.bound_lower_mm {
            return Err(SpimError::Configuration(format!(
                "stage bound_upper_mm ({}) must exceed bound_lower_mm ({})",
                self.stage.bound_upper_mm, self.stage.bound_lower_mm
            )));
        }
        if self.stage.small_move_step_mm <= 0.0 {
            return Err(SpimError::Configuration(
                "stage small_move_step_mm must be positive".to_string(),
            ));
        }
        if self.thermal.integral_gain <= 0.0 {
            return Err(SpimError::Configuration(
                "thermal integral_gain must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.thermal.cooling_throttle) {
            return Err(SpimError::Configuration(format!(
                "thermal cooling_throttle ({}) must lie in [0, 1]",
                self.thermal.cooling_throttle
            )));
        }
        if self.thermal.decode_retry_limit == 0 {
            return Err(SpimError::Configuration(
                "thermal decode_retry_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.bus.baud_rate, 115_200);
        assert_eq!(settings.thermal.max_signal, 799.0);
        assert_eq!(settings.stage.small_move_threshold_mm, 0.010);
    }

    #[test]
    fn test_default_rig_has_two_lasers() {
        let settings = Settings::default();
        assert_eq!(settings.lasers.len(), 2);
        assert_eq!(settings.lasers[0].baud_rate, 9600);
        assert_eq!(settings.lasers[1].label, "561nm laser");
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(
                r#"
                [thermal]
                setpoint_c = 25.0
                control_period = "2s"

                [stage]
                small_move_threshold_mm = 0.020
                "#,
            ))
            .extract()
            .unwrap();
        assert_eq!(settings.thermal.setpoint_c, 25.0);
        assert_eq!(settings.thermal.control_period, Duration::from_secs(2));
        assert_eq!(settings.stage.small_move_threshold_mm, 0.020);
        // untouched sections keep their defaults
        assert_eq!(settings.thermal.heating_gain, 120.0);
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut settings = Settings::default();
        settings.stage.bound_upper_mm = 5.0;
        settings.stage.bound_lower_mm = 6.0;
        assert!(settings.validate().is_err());
    }
}
