//! Collaborator devices and interface-only capabilities.
//!
//! The control core owns the bus-owning device; everything else on the rig is
//! a collaborator reached through a narrow seam: the two standalone laser
//! heads ([`laser`]), the magnet current driver ([`magnet`]), the camera
//! capability ([`camera`], interface only) and the temperature logging sink
//! defined here.

pub mod camera;
pub mod laser;
pub mod magnet;

use chrono::{DateTime, Utc};
use tracing::info;

/// One temperature observation handed to a logging sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSample {
    /// Wall-clock time of the observation.
    pub timestamp: DateTime<Utc>,
    /// Measured bath temperature in °C.
    pub measured_c: f64,
    /// Setpoint at observation time in °C.
    pub setpoint_c: f64,
}

/// Destination for temperature log samples.
///
/// File encoding (CSV or otherwise) is a collaborator's concern; the core
/// only produces the tuples.
pub trait TelemetrySink: Send {
    /// Record one sample.
    fn record(&mut self, sample: TemperatureSample);
}

/// Default sink: samples go to the structured log.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&mut self, sample: TemperatureSample) {
        info!(
            timestamp = %sample.timestamp,
            measured_c = sample.measured_c,
            setpoint_c = sample.setpoint_c,
            "temperature sample"
        );
    }
}

/// Sink collecting samples in memory; used by tests. Clones share the same
/// buffer, so a clone kept outside the supervisor observes what the logging
/// loop recorded.
#[derive(Default, Clone)]
pub struct VecSink {
    samples: std::sync::Arc<std::sync::Mutex<Vec<TemperatureSample>>>,
}

impl VecSink {
    /// Snapshot of the collected samples, oldest first.
    pub fn samples(&self) -> Vec<TemperatureSample> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for VecSink {
    fn record(&mut self, sample: TemperatureSample) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(sample);
        }
    }
}
