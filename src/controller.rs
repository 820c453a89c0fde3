//! The instrument controller.
//!
//! [`Microscope`] owns the bus channel, the shared [`InstrumentState`], the
//! PID controller and the laser heads, and exposes every operator-facing
//! operation: bounded motion, synchronized focus, frame and volume triggers,
//! heater exchange, stage lifecycle commands and laser control.
//!
//! Locking discipline: the state lock and the bus lock are never held
//! together. Each method snapshots or updates state first, releases it, then
//! performs the bus exchange while holding the bus guard across the full
//! write(+read) pair — that guard is the single mechanism that keeps the
//! supervisor's concurrent loops from interleaving commands on the wire.

use crate::bus::{BusChannel, BusTransport};
use crate::config::Settings;
use crate::devices::laser::LaserChannel;
use crate::error::{SpimError, SpimResult};
use crate::motion::{self, MoveProfile};
use crate::protocol::telemetry::{decode_heater_status, TelemetryFrame};
use crate::protocol::{round_position_mm, Command, ConfigFrame, SchemaVersion};
use crate::state::{HeaterMode, InstrumentState};
use crate::thermal::{HeaterDrive, PidController};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use tracing::{info, warn};

#[cfg(feature = "instrument_serial")]
use crate::bus::serial::SerialTransport;

/// The instrument control core.
pub struct Microscope {
    settings: Settings,
    schema: SchemaVersion,
    bus: Mutex<BusChannel>,
    state: Mutex<InstrumentState>,
    pid: Mutex<PidController>,
    lasers: Vec<LaserChannel>,
}

impl Microscope {
    /// Build the controller for real hardware from `settings`.
    #[cfg(feature = "instrument_serial")]
    pub fn new(settings: Settings) -> Self {
        let bus_transport = SerialTransport::new(
            "bus device",
            settings.bus.port.clone(),
            settings.bus.baud_rate,
        );
        let bus = BusChannel::new("bus device", Box::new(bus_transport))
            .with_read_timeout(settings.bus.read_timeout)
            .with_boot_banner();
        let lasers = settings
            .lasers
            .iter()
            .map(|laser| {
                let transport =
                    SerialTransport::new(laser.label.clone(), laser.port.clone(), laser.baud_rate);
                LaserChannel::new(
                    laser.label.clone(),
                    BusChannel::new(laser.label.clone(), Box::new(transport)),
                )
            })
            .collect();
        Self::assemble(settings, bus, lasers)
    }

    /// Build the controller over an arbitrary bus transport, without laser
    /// heads. The mock transport plugs in here for tests.
    pub fn with_bus(settings: Settings, transport: Box<dyn BusTransport>) -> Self {
        let read_timeout = settings.bus.read_timeout;
        let bus = BusChannel::new("bus device", transport)
            .with_read_timeout(read_timeout)
            .with_boot_banner();
        Self::assemble(settings, bus, Vec::new())
    }

    /// Build the controller over an arbitrary bus channel and laser set.
    pub fn with_devices(settings: Settings, bus: BusChannel, lasers: Vec<LaserChannel>) -> Self {
        Self::assemble(settings, bus, lasers)
    }

    fn assemble(settings: Settings, bus: BusChannel, lasers: Vec<LaserChannel>) -> Self {
        let state = InstrumentState {
            setpoint_c: settings.thermal.setpoint_c,
            ..InstrumentState::default()
        };
        let schema = settings.protocol.schema;
        let pid = PidController::new(settings.thermal.clone());
        Self {
            settings,
            schema,
            bus: Mutex::new(bus),
            state: Mutex::new(state),
            pid: Mutex::new(pid),
            lasers,
        }
    }

    /// Deployment settings this controller was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn state(&self) -> MutexGuard<'_, InstrumentState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn bus(&self) -> MutexGuard<'_, BusChannel> {
        match self.bus.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn send(&self, command: &Command) -> SpimResult<()> {
        self.bus().write_command(&command.encode(self.schema))
    }

    // ---- lifecycle --------------------------------------------------------

    /// Open every serial link and bring the device to a known configuration.
    ///
    /// Failure to reach the bus-owning device is fatal; an unreachable laser
    /// head is logged and skipped.
    pub fn connect(&self) -> SpimResult<()> {
        self.bus().open()?;
        for laser in &self.lasers {
            laser.connect();
        }
        self.push_config()?;
        if let Err(err) = self.query_position() {
            warn!(%err, "could not read initial stage position");
        }
        self.apply_laser_settings();
        Ok(())
    }

    /// Close every serial link. Idempotent.
    pub fn close(&self) {
        self.bus().close();
        for laser in &self.lasers {
            laser.close();
        }
    }

    // ---- configuration push ----------------------------------------------

    /// Assemble the full configuration record from settings and live state.
    pub fn config_frame(&self) -> ConfigFrame {
        let state = self.state();
        let stage = &self.settings.stage;
        let acquisition = &self.settings.acquisition;
        ConfigFrame {
            small_move_time_ms: stage.small_move_time_ms,
            frame_interval_ms: acquisition.frame_interval_ms,
            exposure_ms: acquisition.exposure_ms,
            heater_mode: state.heater_mode,
            heater_power: state.heater_power,
            fan_on: state.fan_on,
            magnet_currents: state.magnet_currents,
            led_level: state.led_level,
            slope: self.settings.focus.slope,
            offset: motion::dac_offset(&self.settings.focus),
            bound_upper_mm: stage.bound_upper_mm,
            bound_lower_mm: stage.bound_lower_mm,
            step_mm: stage.small_move_step_mm,
            camera_index: acquisition.camera_index,
            frames_per_volume: acquisition.frames_per_volume,
            frame_period_ms: acquisition.volume_frame_period_ms,
        }
    }

    /// Push the full configuration record (`SET`).
    pub fn push_config(&self) -> SpimResult<()> {
        let frame = self.config_frame();
        self.send(&Command::SetConfig(frame))
    }

    /// Push current heater parameters to the heater board (`STH`).
    pub fn push_heater(&self) -> SpimResult<()> {
        self.send(&Command::PushHeater)
    }

    // ---- motion -----------------------------------------------------------

    /// Move the stage to an absolute position in mm.
    ///
    /// Out-of-bounds positions are rejected before anything is transmitted.
    /// The stored position updates optimistically — the protocol has no
    /// move-complete event, so the returned wait estimate (ms) is the only
    /// pacing information available to the caller.
    pub fn move_to(&self, position_mm: f64) -> SpimResult<f64> {
        let position = round_position_mm(position_mm);
        if position.abs() > self.settings.stage.bound_upper_mm {
            warn!(position, "stage position out of bounds, move rejected");
            return Err(SpimError::OutOfRange(format!(
                "stage position {position} mm exceeds bound {} mm",
                self.settings.stage.bound_upper_mm
            )));
        }

        let distance = {
            let mut state = self.state();
            let distance = (position - state.position_mm).abs();
            state.position_mm = position;
            distance
        };

        let command = match motion::classify_move(distance, &self.settings.stage) {
            MoveProfile::Small => Command::StageSmall(position),
            MoveProfile::Large => Command::StageLarge(position),
        };
        self.send(&command)?;
        Ok(motion::estimate_wait_ms(distance, &self.settings.stage))
    }

    /// Move stage and focusing mirror together.
    ///
    /// The mirror is commanded strictly before the stage: moving the stage
    /// first would momentarily defocus the sheet while the mirror lags.
    pub fn focus_to(&self, position_mm: f64) -> SpimResult<f64> {
        let position = round_position_mm(position_mm);
        if position.abs() > self.settings.stage.bound_upper_mm {
            warn!(position, "focus position out of bounds, move rejected");
            return Err(SpimError::OutOfRange(format!(
                "focus position {position} mm exceeds bound {} mm",
                self.settings.stage.bound_upper_mm
            )));
        }

        let mirror = motion::mirror_count_for(position, &self.settings.focus);
        if mirror.clamped {
            warn!(position, count = mirror.count, "mirror out of range, count clamped");
        }
        self.send(&Command::MirrorDac(mirror.count))?;
        self.move_to(position)
    }

    /// Poll the stage position (`QRP`) and reconcile the stored value.
    pub fn query_position(&self) -> SpimResult<f64> {
        let line = {
            let mut bus = self.bus();
            bus.flush_input();
            bus.transact(&Command::QueryPosition.encode(self.schema))?
        };
        let position = line.trim().parse::<f64>().map_err(|err| {
            SpimError::Decode(format!("bad position reply {:?}: {err}", line.trim()))
        })?;
        self.state().position_mm = position;
        Ok(position)
    }

    /// Engage the stage drive (`ENG`).
    pub fn engage(&self) -> SpimResult<()> {
        self.send(&Command::Engage)
    }

    /// Disengage the stage drive (`DNG`).
    pub fn disengage(&self) -> SpimResult<()> {
        self.send(&Command::Disengage)
    }

    /// Reboot the stage controller (`RBT`).
    pub fn reboot(&self) -> SpimResult<()> {
        self.send(&Command::Reboot)
    }

    /// Halt stage motion (`STP`).
    pub fn halt_stage(&self) -> SpimResult<()> {
        self.send(&Command::HaltStage)
    }

    /// Clear the stage driver error state (`ERR`) and return its report.
    pub fn clear_error(&self) -> SpimResult<String> {
        let mut bus = self.bus();
        bus.flush_input();
        bus.write_command(&Command::ClearError.encode(self.schema))?;
        let mut report = bus.read_line()?;
        report.push_str(&bus.read_line()?);
        Ok(report)
    }

    // ---- acquisition ------------------------------------------------------

    /// Trigger one camera frame with the configured exposure (`FRM`).
    pub fn trigger_frame(&self) -> SpimResult<()> {
        self.send(&Command::Frame {
            camera: self.settings.acquisition.camera_index,
            exposure_ms: self.settings.acquisition.exposure_ms,
        })
    }

    /// Trigger one volume sequence (`RUN`). The configuration record must
    /// have been pushed since the last parameter change.
    pub fn take_volume(&self) -> SpimResult<()> {
        let mut bus = self.bus();
        bus.flush_input();
        bus.write_command(&Command::RunVolume.encode(self.schema))
    }

    /// Start on-device repeated volume sequences (`RUNM`).
    pub fn take_volumes_repeating(&self) -> SpimResult<()> {
        let mut bus = self.bus();
        bus.flush_input();
        bus.write_command(&Command::RunVolumeRepeat.encode(self.schema))
    }

    /// Read the mirror/magnet status line (`RDM`).
    pub fn read_mirror_status(&self) -> SpimResult<String> {
        let mut bus = self.bus();
        bus.flush_input();
        let line = bus.transact(&Command::ReadMirror.encode(self.schema))?;
        if line.contains("END") {
            Ok(line)
        } else {
            Err(SpimError::Decode(format!(
                "incomplete mirror status: {:?}",
                line.trim_end()
            )))
        }
    }

    /// Read the firmware configuration report (`REP`).
    pub fn read_config_report(&self) -> SpimResult<Vec<String>> {
        let mut bus = self.bus();
        bus.flush_input();
        bus.write_command(&Command::ReportConfig.encode(self.schema))?;
        (0..self.schema.report_lines())
            .map(|_| bus.read_line())
            .collect()
    }

    // ---- temperature ------------------------------------------------------

    /// Change the temperature setpoint in °C.
    pub fn set_setpoint(&self, setpoint_c: f64) {
        self.state().setpoint_c = setpoint_c;
        info!(setpoint_c, "temperature setpoint changed");
    }

    /// Engage or release open-loop step mode.
    pub fn set_step_mode(&self, step_mode: bool) {
        self.state().step_mode = step_mode;
    }

    /// Zero the PID integrator; the control task calls this on start.
    pub fn reset_pid(&self) {
        if let Ok(mut pid) = self.pid.lock() {
            pid.reset();
        }
    }

    /// Exchange `RDH` for a heater status line, retrying a bounded number of
    /// times when the reply arrives without its `END` completion marker.
    /// The accepted raw line is retained in state for the decode and logging
    /// consumers.
    pub fn poll_heater(&self) -> SpimResult<String> {
        let thermal = &self.settings.thermal;
        let mut attempts = 0;
        loop {
            let outcome = {
                let mut bus = self.bus();
                bus.flush_input();
                bus.transact(&Command::ReadHeater.encode(self.schema))
            };
            match outcome {
                Ok(line) if line.contains("END") => {
                    self.state().last_telemetry = Some(line.clone());
                    return Ok(line);
                }
                Ok(line) => {
                    warn!(line = line.trim(), "incomplete heater status, retrying");
                }
                Err(err) => {
                    warn!(%err, "heater poll failed, retrying");
                }
            }
            attempts += 1;
            if attempts >= thermal.decode_retry_limit {
                return Err(SpimError::Decode(format!(
                    "no complete heater status after {attempts} attempts"
                )));
            }
            thread::sleep(thermal.decode_retry_delay);
        }
    }

    /// Decode the most recently polled heater status.
    pub fn latest_telemetry(&self) -> SpimResult<TelemetryFrame> {
        let line = self
            .state()
            .last_telemetry
            .clone()
            .ok_or_else(|| SpimError::Decode("no heater telemetry received yet".to_string()))?;
        decode_heater_status(&line)
    }

    /// Run one temperature control tick.
    ///
    /// Decoding failures skip the tick after a bounded number of re-reads of
    /// the poll loop's latest line — the integrator and the stored measured
    /// temperature are only touched by a successful decode. On success the
    /// derived drive is pushed with `SET` followed by `STH`; both are
    /// required, the device keeps running stale parameters otherwise.
    pub fn control_tick(&self) -> SpimResult<HeaterDrive> {
        let thermal = &self.settings.thermal;
        let mut attempts = 0;
        let frame = loop {
            match self.latest_telemetry() {
                Ok(frame) => break frame,
                Err(err) => {
                    attempts += 1;
                    if attempts >= thermal.decode_retry_limit {
                        return Err(err);
                    }
                    thread::sleep(thermal.decode_retry_delay);
                }
            }
        };

        let drive = {
            let (setpoint_c, step_mode) = {
                let state = self.state();
                (state.setpoint_c, state.step_mode)
            };
            let mut pid = match self.pid.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            pid.tick(setpoint_c, frame.temperature_c, step_mode)
        };

        {
            let mut state = self.state();
            state.measured_c = frame.temperature_c;
            state.heater_mode = drive.heater_mode;
            state.heater_power = drive.heater_power;
            state.fan_on = drive.fan_on;
            state.on_target = drive.on_target;
        }

        self.push_config()?;
        self.push_heater()?;
        Ok(drive)
    }

    /// Force the heater off and push the idle configuration once, so the
    /// device is never left mid-setpoint with its last drive signal.
    pub fn shutdown_heater(&self) -> SpimResult<()> {
        {
            let mut state = self.state();
            state.heater_mode = HeaterMode::Off;
            state.fan_on = false;
        }
        self.push_config()?;
        self.push_heater()
    }

    // ---- lasers and magnet ------------------------------------------------

    /// Push the stored power and emission state to every reachable laser.
    pub fn apply_laser_settings(&self) {
        let (powers, enabled) = {
            let state = self.state();
            (state.laser_power_w, state.laser_enabled)
        };
        for (index, laser) in self.lasers.iter().enumerate() {
            if let Err(err) = laser.apply(powers[index], enabled[index]) {
                warn!(laser = laser.label(), %err, "could not apply laser settings");
            }
        }
    }

    /// Update one laser channel's power and emission state.
    pub fn set_laser(&self, index: usize, power_w: f64, enabled: bool) {
        {
            let mut state = self.state();
            if index >= state.laser_power_w.len() {
                warn!(index, "no such laser channel");
                return;
            }
            state.laser_power_w[index] = power_w;
            state.laser_enabled[index] = enabled;
        }
        if let Some(laser) = self.lasers.get(index) {
            if let Err(err) = laser.apply(power_w, enabled) {
                warn!(laser = laser.label(), %err, "could not apply laser settings");
            }
        }
    }

    /// Update the magnet coil currents carried in the configuration record
    /// and push the record.
    pub fn set_magnet_currents(&self, currents: [f64; 4]) -> SpimResult<()> {
        self.state().magnet_currents = currents;
        self.push_config()
    }

    /// Update the white LED level carried in the configuration record and
    /// push the record.
    pub fn set_led_level(&self, level: u16) -> SpimResult<()> {
        self.state().led_level = level.min(1023);
        self.push_config()
    }

    /// Clone of the live instrument state, for status displays and logging.
    pub fn snapshot(&self) -> InstrumentState {
        self.state().clone()
    }
}
