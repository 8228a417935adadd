//! Experiment status enumeration.
//!
//! The same value is mirrored onto the well the experiment is bound to, so a
//! well's status always reads as the phase of the experiment occupying it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Phase of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Created, not yet queued
    New,
    /// Waiting in the queue
    Queued,
    /// Promoted by the scheduler
    Running,
    /// Open-circuit potential pre-check
    OcpCheck,
    /// Dispensing solution into the well
    Depositing,
    /// Electrochemical deposition
    EDepositing,
    /// Mixing in the well
    Mixing,
    /// Gantry move
    Moving,
    /// Well rinse
    Rinsing,
    /// Electrode rinse
    ERinsing,
    /// Baseline measurement
    Baseline,
    /// Characterisation
    Characterizing,
    /// Chronoamperometry
    Ca,
    /// Cyclic voltammetry
    Cv,
    /// Emptying the well
    Clearing,
    /// Pipette flush
    Flushing,
    /// Camera capture
    Imaging,
    /// Generic liquid transfer
    Pipetting,
    /// Persisting results
    Saving,
    /// Post-run analysis
    Analyzing,
    /// Held by the operator
    Paused,
    /// Withdrawn before completion
    Cancelled,
    /// Waiting for a well assignment
    Pending,
    /// Finished successfully
    Complete,
    /// Failed
    Error,
}

impl ExperimentStatus {
    /// Every status, in declaration order.
    pub const ALL: [ExperimentStatus; 25] = [
        ExperimentStatus::New,
        ExperimentStatus::Queued,
        ExperimentStatus::Running,
        ExperimentStatus::OcpCheck,
        ExperimentStatus::Depositing,
        ExperimentStatus::EDepositing,
        ExperimentStatus::Mixing,
        ExperimentStatus::Moving,
        ExperimentStatus::Rinsing,
        ExperimentStatus::ERinsing,
        ExperimentStatus::Baseline,
        ExperimentStatus::Characterizing,
        ExperimentStatus::Ca,
        ExperimentStatus::Cv,
        ExperimentStatus::Clearing,
        ExperimentStatus::Flushing,
        ExperimentStatus::Imaging,
        ExperimentStatus::Pipetting,
        ExperimentStatus::Saving,
        ExperimentStatus::Analyzing,
        ExperimentStatus::Paused,
        ExperimentStatus::Cancelled,
        ExperimentStatus::Pending,
        ExperimentStatus::Complete,
        ExperimentStatus::Error,
    ];

    /// Stable string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::New => "new",
            ExperimentStatus::Queued => "queued",
            ExperimentStatus::Running => "running",
            ExperimentStatus::OcpCheck => "ocpcheck",
            ExperimentStatus::Depositing => "depositing",
            ExperimentStatus::EDepositing => "e_depositing",
            ExperimentStatus::Mixing => "mixing",
            ExperimentStatus::Moving => "moving",
            ExperimentStatus::Rinsing => "rinsing",
            ExperimentStatus::ERinsing => "rinsing_electrode",
            ExperimentStatus::Baseline => "baselining",
            ExperimentStatus::Characterizing => "characterizing",
            ExperimentStatus::Ca => "chrono_amperometry",
            ExperimentStatus::Cv => "cyclic_voltammetry",
            ExperimentStatus::Clearing => "clearing",
            ExperimentStatus::Flushing => "flushing",
            ExperimentStatus::Imaging => "imaging",
            ExperimentStatus::Pipetting => "pipetting",
            ExperimentStatus::Saving => "saving",
            ExperimentStatus::Analyzing => "analyzing",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Cancelled => "cancelled",
            ExperimentStatus::Pending => "pending",
            ExperimentStatus::Complete => "complete",
            ExperimentStatus::Error => "error",
        }
    }

    /// COMPLETE, ERROR and CANCELLED end an experiment's life.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExperimentStatus::Complete | ExperimentStatus::Error | ExperimentStatus::Cancelled
        )
    }

    /// Phases only reachable while the experiment is executing.
    pub fn is_active_phase(&self) -> bool {
        !self.is_terminal()
            && !matches!(
                self,
                ExperimentStatus::New | ExperimentStatus::Queued | ExperimentStatus::Pending
            )
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised status string read back from storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown experiment status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ExperimentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        ExperimentStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == lowered)
            .ok_or(UnknownStatus(lowered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        for status in ExperimentStatus::ALL {
            assert_eq!(status.as_str().parse::<ExperimentStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = ExperimentStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                &ExperimentStatus::Cancelled,
                &ExperimentStatus::Complete,
                &ExperimentStatus::Error
            ]
        );
        assert!(ExperimentStatus::Cv.is_active_phase());
        assert!(!ExperimentStatus::Queued.is_active_phase());
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        assert!("teleporting".parse::<ExperimentStatus>().is_err());
    }
}
