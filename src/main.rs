//! Operator CLI for the light-sheet microscope control core.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spim_control::config::Settings;
use spim_control::controller::Microscope;
use spim_control::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spim_control", about = "Light-sheet microscope control core")]
struct Cli {
    /// Configuration file (defaults to spim.toml in the working directory)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Operation,
}

#[derive(Subcommand)]
enum Operation {
    /// Query stage position and bath temperature once
    Status,
    /// Move the stage to an absolute position in mm
    Move {
        /// Target position in mm
        position: f64,
    },
    /// Move stage and focusing mirror together
    Focus {
        /// Target position in mm
        position: f64,
    },
    /// Engage the stage drive
    Engage,
    /// Disengage the stage drive
    Disengage,
    /// Clear the stage driver error state
    ClearError,
    /// Acquire volumes for a duration
    Volume {
        /// Acquisition duration in seconds (configured imaging time if omitted)
        #[arg(long)]
        duration_s: Option<u64>,
    },
    /// Hold the bath at a temperature setpoint for a duration
    Temp {
        /// Setpoint in °C
        setpoint_c: f64,
        /// Hold duration in seconds
        #[arg(long, default_value_t = 600)]
        duration_s: u64,
    },
    /// Set one laser channel's power and emission state
    Laser {
        /// Laser channel index (0 or 1)
        index: usize,
        /// Output power in W
        power_w: f64,
        /// Enable emission
        #[arg(long)]
        on: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("could not load settings")?;

    #[cfg(not(feature = "instrument_serial"))]
    {
        let _ = settings;
        anyhow::bail!("built without serial support; rebuild with --features instrument_serial");
    }

    #[cfg(feature = "instrument_serial")]
    {
        let scope = Arc::new(Microscope::new(settings));
        scope.connect().context("could not connect to the rig")?;

        match cli.command {
            Operation::Status => {
                let position = scope.query_position()?;
                let line = scope.poll_heater()?;
                let frame = scope.latest_telemetry()?;
                let state = scope.snapshot();
                info!(position_mm = position, "stage");
                info!(
                    measured_c = frame.temperature_c,
                    setpoint_c = state.setpoint_c,
                    raw = line.trim(),
                    "bath"
                );
            }
            Operation::Move { position } => {
                let wait_ms = scope.move_to(position)?;
                thread::sleep(Duration::from_millis(wait_ms.ceil() as u64));
                info!(position_mm = position, "move complete");
            }
            Operation::Focus { position } => {
                let wait_ms = scope.focus_to(position)?;
                thread::sleep(Duration::from_millis(wait_ms.ceil() as u64));
                info!(position_mm = position, "focus move complete");
            }
            Operation::Engage => scope.engage()?,
            Operation::Disengage => scope.disengage()?,
            Operation::ClearError => {
                let report = scope.clear_error()?;
                info!(report = report.trim(), "stage error cleared");
            }
            Operation::Volume { duration_s } => {
                let mut supervisor = Supervisor::new(scope.clone());
                match duration_s {
                    Some(seconds) => {
                        supervisor.start_volume_acquisition();
                        thread::sleep(Duration::from_secs(seconds));
                        supervisor.halt_volume_acquisition();
                        supervisor.join_all();
                    }
                    None => supervisor.run_volume_acquisition_timed(),
                }
            }
            Operation::Temp {
                setpoint_c,
                duration_s,
            } => {
                scope.set_setpoint(setpoint_c);
                let mut supervisor = Supervisor::new(scope.clone());
                supervisor.start_temperature_control();
                supervisor.start_temperature_log();
                thread::sleep(Duration::from_secs(duration_s));
                supervisor.shutdown();
            }
            Operation::Laser { index, power_w, on } => {
                scope.set_laser(index, power_w, on);
            }
        }

        scope.close();
        Ok(())
    }
}
