//! Custom error types for the control core.
//!
//! This module defines the primary error type, `SdlError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the different failure classes that occur while driving the robot.
//!
//! ## Error Hierarchy
//!
//! `SdlError` consolidates the failure taxonomy of the lab:
//!
//! - **`Resource`**: overfill, overdraft and "no vessel holds this solution". These
//!   are caller-correctable: pick another vessel, another volume, or defer.
//! - **`MixInfeasible`**: the mixing solver found no combination of source vials
//!   satisfying the volume and draw bounds.
//! - **`DeviceConfirmation`**: a confirmed actuation (decap, cap, ...) exhausted its
//!   attempts without the sensor reporting the expected state.
//! - **`Electrochem`**: OCP, CA, CV and deposition failures. Always fatal to the
//!   current experiment and always propagated to the scheduler.
//! - **`ShutDown`**: not a fault. The operator asked the loop to stop cleanly.
//!
//! By using `#[from]`, `SdlError` can be created from the underlying error types,
//! so the `?` operator works across the persistence and configuration layers.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type SdlResult<T> = std::result::Result<T, SdlError>;

/// Vessel bookkeeping failures. All of them are locally recoverable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("{vessel} would overflow: {volume} + {added} > {capacity}")]
    Overfill {
        vessel: String,
        volume: f64,
        added: f64,
        capacity: f64,
    },

    #[error("{vessel} would be overdrawn: {volume} - {requested} < 0")]
    Overdraft {
        vessel: String,
        volume: f64,
        requested: f64,
    },

    #[error("No available solution of {0} found")]
    NoAvailableSolution(String),

    #[error("Stock vial {0} cannot have contents added to it")]
    StockIsAppendOnly(String),

    #[error("Vessel {0} not found")]
    UnknownVessel(String),

    #[error("Invalid volume {0}")]
    InvalidVolume(f64),

    #[error("Vessel id {0} is used by more than one rack")]
    DuplicateVessel(String),
}

/// Electrochemistry failures. Fatal to the running experiment.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ElectrochemError {
    #[error("OCP failed before {stage}: {reason}")]
    Ocp { stage: String, reason: String },

    #[error("CA failed for experiment {experiment_id} well {well_id}")]
    Ca { experiment_id: i64, well_id: String },

    #[error("CV failed for experiment {experiment_id} well {well_id}")]
    Cv { experiment_id: i64, well_id: String },

    #[error("Deposition failed for experiment {experiment_id} well {well_id}")]
    Deposition { experiment_id: i64, well_id: String },
}

/// Crate-wide error.
///
/// The scheduler defers an experiment on [`SdlError::is_recoverable`] errors.
/// Anything else except [`SdlError::ShutDown`] fails it and stops the loop.
#[derive(Error, Debug)]
pub enum SdlError {
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("No mixing solution for {solution} at {concentration} mM")]
    MixInfeasible { solution: String, concentration: f64 },

    /// A sensor-confirmed action ran out of attempts.
    #[error("{action} not confirmed after {attempts} attempts")]
    DeviceConfirmation { action: String, attempts: u32 },

    #[error("Electrochemistry error: {0}")]
    Electrochem(#[from] ElectrochemError),

    /// Cooperative stop. Not a fault.
    #[error("The system has been commanded to shut down")]
    ShutDown,

    /// Stock on deck cannot cover the experiment's summed draws.
    #[error("Experiment {experiment_id} cannot be run: {reason}")]
    InsufficientVolume { experiment_id: i64, reason: String },

    /// The experiment was queued for a plate that is not on the deck.
    #[error("Experiment {experiment_id} targets plate {expected}, active plate is {active:?}")]
    PlateMismatch {
        experiment_id: i64,
        expected: i64,
        active: Option<i64>,
    },

    #[error("Experiment {experiment_id} is {from} and cannot move to {to}")]
    IllegalTransition {
        experiment_id: i64,
        from: String,
        to: String,
    },

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("Protocol {0} not found")]
    ProtocolNotFound(String),

    #[error("Experiment {0} not found")]
    ExperimentNotFound(i64),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("The experiment generator did not produce a follow-up experiment")]
    NoExperimentGenerated,

    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Opaque failure from a hardware driver.
    #[error("Driver error: {0}")]
    Driver(#[from] anyhow::Error),

    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SdlError {
    /// Errors the scheduler degrades to "defer this experiment".
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SdlError::Resource(_)
                | SdlError::MixInfeasible { .. }
                | SdlError::InsufficientVolume { .. }
                | SdlError::PlateMismatch { .. }
        )
    }

    /// Errors that end the run and require a human.
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable() && !self.is_shutdown()
    }

    /// The cooperative stop signal.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, SdlError::ShutDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SdlError::Hardware("decapper jammed".to_string());
        assert_eq!(err.to_string(), "Hardware error: decapper jammed");
    }

    #[test]
    fn test_resource_errors_are_recoverable() {
        let err: SdlError = ResourceError::Overdraft {
            vessel: "s1".into(),
            volume: 10.0,
            requested: 20.0,
        }
        .into();
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("overdrawn"));
    }

    #[test]
    fn test_electrochem_errors_are_fatal() {
        let err: SdlError = ElectrochemError::Ocp {
            stage: "CV".into(),
            reason: "out of solution".into(),
        }
        .into();
        assert!(err.is_fatal());
        assert!(!SdlError::ShutDown.is_fatal());
        assert!(SdlError::ShutDown.is_shutdown());
    }
}
