//! Control core for a self-driving electrochemistry lab.
//!
//! This library sequences physical experiments on a liquid-handling robot with
//! a potentiostat and camera. It turns queued, declarative experiment records
//! into ordered, sensor-confirmed hardware actions on shared, depleting
//! resources, while an operator may pause, resume, or stop the system at any
//! time. It is used by the `sdl-daemon` binary and by integration tests that
//! drive it against simulated hardware.
//!
//! # Layout
//!
//! - [`labware`]: vessels, the persisted resource ledger, deck setup
//! - [`mixing`]: draw planning to hit a target concentration
//! - [`retry`]: bounded, sensor-confirmed actuation
//! - [`transfer`]: pipetting between vessels
//! - [`electrochem`]: OCP-checked CA and CV
//! - [`experiment`]: experiment records and the step state machine
//! - [`protocol`]: step lists by protocol id
//! - [`scheduler`]: queue selection and the system-state control loop
//! - [`store`]: persistence port and its SQLite implementation

pub mod config;
pub mod electrochem;
pub mod error;
pub mod experiment;
pub mod generator;
pub mod hardware;
pub mod labware;
pub mod logging;
pub mod mixing;
pub mod protocol;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod transfer;

pub use config::Config;
pub use error::{SdlError, SdlResult};
pub use scheduler::{RunOutcome, Scheduler};
