//! Control core for a custom light-sheet microscope.
//!
//! One shared-bus serial device sequences the stage, focusing mirror, camera
//! triggers, heater and magnet outputs; two standalone laser heads sit on
//! their own links. This crate provides the protocol codec for that bus, the
//! mutex-serialized channel discipline, stage↔mirror focus calibration with
//! bounded motion, a PID temperature controller with anti-windup and
//! asymmetric gains, and a supervisor for the five long-running control
//! loops (camera triggering, volume acquisition, temperature control,
//! telemetry polling and logging).
//!
//! Frame readout, image/CSV encoding and the operator GUI are collaborator
//! concerns reached through the traits in [`devices`].

pub mod bus;
pub mod config;
pub mod controller;
pub mod devices;
pub mod error;
pub mod motion;
pub mod protocol;
pub mod state;
pub mod supervisor;
pub mod thermal;
