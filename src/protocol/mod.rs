//! Wire protocol codec for the bus-owning device.
//!
//! Commands are framed ASCII lines: a fixed-arity verb followed by
//! space-separated decimal arguments. The line terminator (CR) is appended by
//! the bus channel, not here. Two firmware revisions are in the field and
//! differ in the width of the `SET` configuration record and the arity of the
//! `FRM` trigger; the differences are captured by [`SchemaVersion`] rather
//! than by parallel codec implementations.
//!
//! Telemetry decoding lives in [`telemetry`].

pub mod telemetry;

use crate::state::HeaterMode;
use serde::{Deserialize, Serialize};

/// Firmware protocol revision.
///
/// `V1` is the classic build: an 11-field `SET` record and `FRM <exposure>`.
/// `V2` extends the record with magnet coil currents, the LED level, the
/// camera index and the volume sequence shape, and addresses frame triggers
/// to a camera: `FRM <camera> <exposure>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    /// Classic 11-field configuration record.
    V1,
    /// Extended 19-field configuration record.
    V2,
}

impl SchemaVersion {
    /// Number of report lines the firmware emits in response to `REP`.
    pub fn report_lines(self) -> usize {
        match self {
            SchemaVersion::V1 => 11,
            SchemaVersion::V2 => 20,
        }
    }
}

/// Full configuration record pushed with `SET`.
///
/// Field order on the wire is fixed per schema; see [`SchemaVersion`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFrame {
    /// Small move duration in ms (`smt`).
    pub small_move_time_ms: u32,
    /// Interval between triggered frames in ms (`frt`).
    pub frame_interval_ms: u32,
    /// Camera exposure in ms (`exp`).
    pub exposure_ms: u32,
    /// Heater drive mode (`htm`).
    pub heater_mode: HeaterMode,
    /// Heater PWM duty (`hpw`).
    pub heater_power: u16,
    /// Cooling fan state (`fnm`).
    pub fan_on: bool,
    /// Magnet coil currents in A (`cur1..cur4`, extended schema only).
    pub magnet_currents: [f64; 4],
    /// White LED intensity (`led`, extended schema only).
    pub led_level: u16,
    /// Focus calibration slope in counts/mm (`slp`).
    pub slope: f64,
    /// Focus calibration DAC offset in counts (`off`).
    pub offset: i32,
    /// Upper stage bound in mm (`dup`).
    pub bound_upper_mm: f64,
    /// Lower stage bound in mm (`dlo`).
    pub bound_lower_mm: f64,
    /// Volume imaging step in mm (`ste`).
    pub step_mm: f64,
    /// Camera index for triggers (extended schema only).
    pub camera_index: u8,
    /// Frames per volume sequence (extended schema only).
    pub frames_per_volume: u32,
    /// Inter-frame period within a volume in ms (extended schema only).
    pub frame_period_ms: u32,
}

/// One outbound command for the bus-owning device.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `DAC <count>` — set the focusing mirror actuation count.
    MirrorDac(u16),
    /// `STA <mm>` — move the stage with the fast small-move profile.
    StageSmall(f64),
    /// `STS <mm>` — move the stage with the slow large-move profile.
    StageLarge(f64),
    /// `FRM ...` — trigger one camera frame.
    Frame {
        /// Camera index (extended schema only).
        camera: u8,
        /// Exposure in ms.
        exposure_ms: u32,
    },
    /// `RUN` — trigger one volume sequence.
    RunVolume,
    /// `RUNM` — trigger repeated volume sequences on-device.
    RunVolumeRepeat,
    /// `SET ...` — push the full configuration record.
    SetConfig(ConfigFrame),
    /// `STH` — push current heater parameters to the heater board.
    PushHeater,
    /// `RDH` — request heater telemetry.
    ReadHeater,
    /// `RDM` — request mirror/magnet status.
    ReadMirror,
    /// `QRP` — request the stage position.
    QueryPosition,
    /// `REP` — request a configuration report.
    ReportConfig,
    /// `ENG` — engage the stage drive.
    Engage,
    /// `DNG` — disengage the stage drive.
    Disengage,
    /// `RBT` — reboot the stage controller.
    Reboot,
    /// `STP` — halt stage motion.
    HaltStage,
    /// `ERR` — clear the stage driver error state.
    ClearError,
}

/// Round a stage position to the 1e-6 mm resolution the stage accepts.
pub fn round_position_mm(position_mm: f64) -> f64 {
    (position_mm * 1e6).round() / 1e6
}

impl Command {
    /// Encode the command as an unterminated ASCII line for `schema`.
    pub fn encode(&self, schema: SchemaVersion) -> String {
        match self {
            Command::MirrorDac(count) => format!("DAC {count}"),
            Command::StageSmall(mm) => format!("STA {}", round_position_mm(*mm)),
            Command::StageLarge(mm) => format!("STS {}", round_position_mm(*mm)),
            Command::Frame {
                camera,
                exposure_ms,
            } => match schema {
                SchemaVersion::V1 => format!("FRM {exposure_ms}"),
                SchemaVersion::V2 => format!("FRM {camera} {exposure_ms}"),
            },
            Command::RunVolume => "RUN".to_string(),
            Command::RunVolumeRepeat => "RUNM".to_string(),
            Command::SetConfig(frame) => encode_set(frame, schema),
            Command::PushHeater => "STH".to_string(),
            Command::ReadHeater => "RDH".to_string(),
            Command::ReadMirror => "RDM".to_string(),
            Command::QueryPosition => "QRP".to_string(),
            Command::ReportConfig => "REP".to_string(),
            Command::Engage => "ENG".to_string(),
            Command::Disengage => "DNG".to_string(),
            Command::Reboot => "RBT".to_string(),
            Command::HaltStage => "STP".to_string(),
            Command::ClearError => "ERR".to_string(),
        }
    }
}

fn encode_set(frame: &ConfigFrame, schema: SchemaVersion) -> String {
    let mut fields: Vec<String> = vec![
        frame.small_move_time_ms.to_string(),
        frame.frame_interval_ms.to_string(),
        frame.exposure_ms.to_string(),
        frame.heater_mode.code().to_string(),
        frame.heater_power.to_string(),
        u8::from(frame.fan_on).to_string(),
    ];
    if schema == SchemaVersion::V2 {
        for current in frame.magnet_currents {
            fields.push(current.to_string());
        }
        fields.push(frame.led_level.to_string());
    }
    fields.extend([
        frame.slope.to_string(),
        frame.offset.to_string(),
        frame.bound_upper_mm.to_string(),
        frame.bound_lower_mm.to_string(),
        frame.step_mm.to_string(),
    ]);
    if schema == SchemaVersion::V2 {
        fields.extend([
            frame.camera_index.to_string(),
            frame.frames_per_volume.to_string(),
            frame.frame_period_ms.to_string(),
        ]);
    }
    format!("SET {}", fields.join(" "))
}
