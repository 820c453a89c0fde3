//! Lifecycle supervision for the five long-running control loops.
//!
//! Each named task runs on its own OS thread: `camera_trigger`,
//! `volume_acquisition`, `temperature_control`, `temperature_poll` and
//! `temperature_log`. Tasks communicate only through the shared
//! [`Microscope`] state and two kinds of signal:
//!
//! - a per-task cooperative halt flag, checked once per loop iteration —
//!   halting is never preemptive, so an in-flight bus exchange always
//!   completes before the worker exits;
//! - one readiness flag raised by the poll loop after its first successful
//!   telemetry read, which gates the two loops that consume telemetry.
//!
//! `temperature_control` and `temperature_log` auto-start `temperature_poll`
//! and block on readiness before entering their loop bodies. Halting either
//! of them also signals the poll loop to halt and pushes an idle heater
//! configuration once, so the device is never left driving its last
//! setpoint while unattended.
//!
//! Starting a running task, or halting a stopped one, is operator error:
//! logged as a warning, no state change.

use crate::controller::Microscope;
use crate::devices::{TelemetrySink, TemperatureSample, TracingSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One supervised loop: its halt flag and worker thread.
struct TaskHandle {
    name: &'static str,
    halt: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TaskHandle {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            halt: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Running means the worker thread exists and has not yet exited.
    fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Clear the halt flag and hand out a clone for the new worker.
    fn arm(&self) -> Arc<AtomicBool> {
        self.halt.store(false, Ordering::Relaxed);
        self.halt.clone()
    }

    /// Set the halt flag, honoring the reject-if-misused contract. Returns
    /// whether the signal was actually delivered.
    fn signal_halt(&self) -> bool {
        if !self.is_running() {
            warn!(task = self.name, "task not running");
            return false;
        }
        if self.halt.swap(true, Ordering::Relaxed) {
            warn!(task = self.name, "halt flag already set");
            return false;
        }
        info!(task = self.name, "halt requested");
        true
    }

    fn spawn<F>(&mut self, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match thread::Builder::new().name(self.name.to_string()).spawn(body) {
            Ok(handle) => self.thread = Some(handle),
            Err(err) => warn!(task = self.name, %err, "could not spawn task thread"),
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Supervisor owning the five control loops.
pub struct Supervisor {
    scope: Arc<Microscope>,
    data_ready: Arc<AtomicBool>,
    sink: Arc<Mutex<Box<dyn TelemetrySink>>>,
    camera_trigger: TaskHandle,
    volume_acquisition: TaskHandle,
    temperature_control: TaskHandle,
    temperature_poll: TaskHandle,
    temperature_log: TaskHandle,
}

impl Supervisor {
    /// Build a supervisor over `scope`, logging temperature samples to the
    /// structured log.
    pub fn new(scope: Arc<Microscope>) -> Self {
        Self::with_sink(scope, Box::new(TracingSink))
    }

    /// Build a supervisor that hands temperature samples to `sink`.
    pub fn with_sink(scope: Arc<Microscope>, sink: Box<dyn TelemetrySink>) -> Self {
        Self {
            scope,
            data_ready: Arc::new(AtomicBool::new(false)),
            sink: Arc::new(Mutex::new(sink)),
            camera_trigger: TaskHandle::new("camera_trigger"),
            volume_acquisition: TaskHandle::new("volume_acquisition"),
            temperature_control: TaskHandle::new("temperature_control"),
            temperature_poll: TaskHandle::new("temperature_poll"),
            temperature_log: TaskHandle::new("temperature_log"),
        }
    }

    /// True when the poll loop has decoded at least one telemetry line since
    /// it last started or failed.
    pub fn telemetry_ready(&self) -> bool {
        self.data_ready.load(Ordering::Relaxed)
    }

    // ---- camera trigger ---------------------------------------------------

    /// Start the frame trigger loop.
    ///
    /// The loop period is the configured frame interval minus the trigger
    /// overhead, so the frame rate is met net of protocol latency.
    pub fn start_camera_trigger(&mut self) {
        if self.camera_trigger.is_running() {
            warn!(task = "camera_trigger", "task already running");
            return;
        }
        let scope = self.scope.clone();
        let halt = self.camera_trigger.arm();
        let acquisition = &scope.settings().acquisition;
        let period = Duration::from_millis(u64::from(
            acquisition
                .frame_interval_ms
                .saturating_sub(acquisition.trigger_overhead_ms),
        ));
        self.camera_trigger.spawn(move || {
            info!("camera trigger running");
            while !halt.load(Ordering::Relaxed) {
                if let Err(err) = scope.trigger_frame() {
                    warn!(%err, "frame trigger failed");
                }
                thread::sleep(period);
            }
            info!("camera trigger halted");
        });
    }

    /// Signal the frame trigger loop to halt after its current iteration.
    pub fn halt_camera_trigger(&mut self) {
        self.camera_trigger.signal_halt();
    }

    // ---- volume acquisition ----------------------------------------------

    /// Start repeated volume sequences.
    ///
    /// The configuration record is pushed once before the first `RUN`; the
    /// device rejects a sequence start without it.
    pub fn start_volume_acquisition(&mut self) {
        if self.volume_acquisition.is_running() {
            warn!(task = "volume_acquisition", "task already running");
            return;
        }
        let scope = self.scope.clone();
        let halt = self.volume_acquisition.arm();
        let period = scope.settings().acquisition.volume_period;
        self.volume_acquisition.spawn(move || {
            if let Err(err) = scope.push_config() {
                warn!(%err, "could not push configuration, volume acquisition aborted");
                return;
            }
            info!("volume acquisition running");
            while !halt.load(Ordering::Relaxed) {
                if let Err(err) = scope.take_volume() {
                    warn!(%err, "volume trigger failed");
                }
                thread::sleep(period);
            }
            info!("volume acquisition halted");
        });
    }

    /// Signal the volume loop to halt after its current sequence trigger.
    pub fn halt_volume_acquisition(&mut self) {
        self.volume_acquisition.signal_halt();
    }

    /// Run volume acquisition for the configured imaging time, then halt and
    /// wait for the worker to exit.
    pub fn run_volume_acquisition_timed(&mut self) {
        let imaging_time = self.scope.settings().acquisition.imaging_time;
        self.start_volume_acquisition();
        thread::sleep(imaging_time);
        self.halt_volume_acquisition();
        self.volume_acquisition.join();
    }

    // ---- temperature poll -------------------------------------------------

    /// Start the heater telemetry poll loop.
    pub fn start_temperature_poll(&mut self) {
        if self.temperature_poll.is_running() {
            warn!(task = "temperature_poll", "task already running");
            return;
        }
        let scope = self.scope.clone();
        let halt = self.temperature_poll.arm();
        let ready = self.data_ready.clone();
        let period = scope.settings().thermal.poll_period;
        ready.store(false, Ordering::Relaxed);
        self.temperature_poll.spawn(move || {
            info!("temperature polling running");
            while !halt.load(Ordering::Relaxed) {
                match scope.poll_heater() {
                    Ok(_) => ready.store(true, Ordering::Relaxed),
                    Err(err) => {
                        warn!(%err, "temperature poll failed");
                        ready.store(false, Ordering::Relaxed);
                    }
                }
                thread::sleep(period);
            }
            ready.store(false, Ordering::Relaxed);
            info!("temperature polling halted");
        });
    }

    /// Signal the poll loop to halt after its current exchange.
    pub fn halt_temperature_poll(&mut self) {
        self.temperature_poll.signal_halt();
    }

    // ---- temperature control ----------------------------------------------

    /// Start closed-loop temperature control.
    ///
    /// Auto-starts the poll loop when it is not already running, then blocks
    /// (inside the worker) until the first telemetry line has decoded. The
    /// PID integrator is zeroed on every start.
    pub fn start_temperature_control(&mut self) {
        if self.temperature_control.is_running() {
            warn!(task = "temperature_control", "task already running");
            return;
        }
        if !self.temperature_poll.is_running() {
            self.start_temperature_poll();
        }
        self.scope.reset_pid();

        let scope = self.scope.clone();
        let halt = self.temperature_control.arm();
        let ready = self.data_ready.clone();
        let thermal = scope.settings().thermal.clone();
        self.temperature_control.spawn(move || {
            while !ready.load(Ordering::Relaxed) {
                if halt.load(Ordering::Relaxed) {
                    return;
                }
                debug!("waiting for telemetry");
                thread::sleep(thermal.ready_poll_interval);
            }
            info!("temperature control running");
            while !halt.load(Ordering::Relaxed) {
                if ready.load(Ordering::Relaxed) {
                    if let Err(err) = scope.control_tick() {
                        warn!(%err, "control tick skipped");
                    }
                }
                thread::sleep(thermal.control_period);
            }
            info!("temperature control halted");
        });
    }

    /// Halt temperature control, halt the poll loop with it, and leave the
    /// heater off: the idle configuration is pushed once before returning.
    pub fn halt_temperature_control(&mut self) {
        if !self.temperature_control.signal_halt() {
            return;
        }
        if self.temperature_poll.is_running() {
            self.temperature_poll.halt.store(true, Ordering::Relaxed);
        }
        if let Err(err) = self.scope.shutdown_heater() {
            warn!(%err, "could not push heater shutdown");
        }
    }

    // ---- temperature log --------------------------------------------------

    /// Start the temperature logging loop; auto-starts the poll loop and
    /// waits for the first telemetry read, like the control loop.
    pub fn start_temperature_log(&mut self) {
        if self.temperature_log.is_running() {
            warn!(task = "temperature_log", "task already running");
            return;
        }
        if !self.temperature_poll.is_running() {
            self.start_temperature_poll();
        }

        let scope = self.scope.clone();
        let halt = self.temperature_log.arm();
        let ready = self.data_ready.clone();
        let sink = self.sink.clone();
        let thermal = scope.settings().thermal.clone();
        self.temperature_log.spawn(move || {
            while !ready.load(Ordering::Relaxed) {
                if halt.load(Ordering::Relaxed) {
                    return;
                }
                debug!("waiting for telemetry");
                thread::sleep(thermal.ready_poll_interval);
            }
            info!("temperature logging running");
            while !halt.load(Ordering::Relaxed) {
                let snapshot = scope.snapshot();
                let sample = TemperatureSample {
                    timestamp: chrono::Utc::now(),
                    measured_c: snapshot.measured_c,
                    setpoint_c: snapshot.setpoint_c,
                };
                if let Ok(mut sink) = sink.lock() {
                    sink.record(sample);
                }
                thread::sleep(thermal.log_period);
            }
            info!("temperature logging halted");
        });
    }

    /// Halt temperature logging; the poll loop halts with it and the heater
    /// is shut down, exactly as for the control loop.
    pub fn halt_temperature_log(&mut self) {
        if !self.temperature_log.signal_halt() {
            return;
        }
        if self.temperature_poll.is_running() {
            self.temperature_poll.halt.store(true, Ordering::Relaxed);
        }
        if let Err(err) = self.scope.shutdown_heater() {
            warn!(%err, "could not push heater shutdown");
        }
    }

    // ---- shutdown ---------------------------------------------------------

    /// Wait for the named workers to observe their halt flags and exit.
    pub fn join_all(&mut self) {
        self.camera_trigger.join();
        self.volume_acquisition.join();
        self.temperature_control.join();
        self.temperature_log.join();
        self.temperature_poll.join();
    }

    /// Halt every running task, shut the heater down if the temperature
    /// loops were active, and wait for all workers to exit.
    pub fn shutdown(&mut self) {
        if self.camera_trigger.is_running() {
            self.halt_camera_trigger();
        }
        if self.volume_acquisition.is_running() {
            self.halt_volume_acquisition();
        }
        if self.temperature_control.is_running() {
            self.halt_temperature_control();
        }
        if self.temperature_log.is_running() {
            self.halt_temperature_log();
        }
        if self.temperature_poll.is_running()
            && !self.temperature_poll.halt.load(Ordering::Relaxed)
        {
            self.halt_temperature_poll();
        }
        self.join_all();
    }

    /// Whether the named task's worker is currently alive. Task names match
    /// the thread names: `camera_trigger`, `volume_acquisition`,
    /// `temperature_control`, `temperature_poll`, `temperature_log`.
    pub fn is_running(&self, task: &str) -> bool {
        match task {
            "camera_trigger" => self.camera_trigger.is_running(),
            "volume_acquisition" => self.volume_acquisition.is_running(),
            "temperature_control" => self.temperature_control.is_running(),
            "temperature_poll" => self.temperature_poll.is_running(),
            "temperature_log" => self.temperature_log.is_running(),
            _ => false,
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
