//! Stage↔mirror calibration and move classification.
//!
//! Pure functions only: the [`crate::controller::Microscope`] applies these to
//! decide what to transmit. The focusing mirror tracks the stage through a
//! linear map from stage position (mm) to DAC actuation count; the map is
//! calibrated per deployment ([`crate::config::FocusSettings`]).

use crate::config::{FocusSettings, StageSettings};

/// Full-scale mirror DAC count.
pub const DAC_FULL_SCALE: i64 = 4095;

/// A computed mirror actuation count, with a flag recording whether the raw
/// linear map landed outside the DAC range and had to be clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorCount {
    /// Count to transmit, clamped to `0..=4095`.
    pub count: u16,
    /// True when the raw value fell outside the DAC range.
    pub clamped: bool,
}

/// Map a stage position to the mirror count that keeps the sheet in focus.
///
/// `count = round((position_mm − recenter_offset) · slope) + 4095`, clamped
/// to the DAC range. Clamping is reported, not fatal: the caller logs a
/// warning and transmits the clamped count.
pub fn mirror_count_for(position_mm: f64, focus: &FocusSettings) -> MirrorCount {
    let raw = ((position_mm - focus.recenter_offset_mm) * focus.slope).round() as i64
        + DAC_FULL_SCALE;
    let count = raw.clamp(0, DAC_FULL_SCALE);
    MirrorCount {
        count: count as u16,
        clamped: raw != count,
    }
}

/// DAC offset pushed to the firmware with the configuration record, derived
/// from the calibration rather than stored separately.
pub fn dac_offset(focus: &FocusSettings) -> i32 {
    (focus.recenter_offset_mm * focus.slope).round() as i32
}

/// Which on-device motion profile a stage displacement requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveProfile {
    /// Below the small-move threshold: fast profile (`STA`).
    Small,
    /// Above the small-move threshold: slow profile (`STS`).
    Large,
}

/// Classify a displacement against the configured small-move threshold.
pub fn classify_move(distance_mm: f64, stage: &StageSettings) -> MoveProfile {
    if distance_mm > stage.small_move_threshold_mm {
        MoveProfile::Large
    } else {
        MoveProfile::Small
    }
}

/// Conservative upper bound on the time a stage move takes, in ms.
///
/// Extrapolated from the measured small-move time; used by callers to pace
/// subsequent commands. The protocol has no move-complete event, so this is
/// an estimate, never an acknowledgement.
pub fn estimate_wait_ms(distance_mm: f64, stage: &StageSettings) -> f64 {
    let wait = f64::from(stage.small_move_time_ms) * (distance_mm / stage.small_move_step_mm);
    (wait * 1e6).round() / 1e6
}
