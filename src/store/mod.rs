//! Persistence port.
//!
//! The control loop never talks to a database directly; it goes through
//! [`Store`]. Calls are synchronous and short. Anything that must be observed
//! atomically (an experiment status and the status of its well) is written in
//! a single call so implementations can use one transaction.

pub mod sqlite;

pub use sqlite::SqliteStore;

use serde::{Deserialize, Serialize};

use crate::error::SdlResult;
use crate::experiment::{Artifact, Experiment, ExperimentStatus};
use crate::labware::Vessel;
use crate::scheduler::queue::QueueEntry;
use crate::scheduler::system_state::SystemState;

/// A wellplate known to the deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateRecord {
    pub id: i64,
    /// Catalogue number of the plate geometry
    pub type_id: i64,
}

/// Storage operations needed by the control core.
pub trait Store: Send + Sync {
    /// Register a plate. Activating it deactivates every other plate and its wells.
    fn add_plate(&self, plate: PlateRecord, activate: bool) -> SdlResult<()>;

    /// The plate currently on the deck.
    fn active_plate(&self) -> SdlResult<Option<PlateRecord>>;

    /// Insert or fully overwrite a vessel record.
    fn upsert_vessel(&self, vessel: &Vessel) -> SdlResult<()>;

    /// Persist volume and contents only. Well status is owned by
    /// [`Store::record_status`] and never overwritten here.
    fn save_vessel_contents(&self, vessel: &Vessel) -> SdlResult<()>;

    /// Active vials and the wells of the active plate.
    fn load_vessels(&self) -> SdlResult<Vec<Vessel>>;

    /// Status of a well on the active plate.
    fn well_status(&self, well_id: &str) -> SdlResult<Option<ExperimentStatus>>;

    /// Insert a new experiment, its parameters, and the matching well status.
    ///
    /// Assigns `experiment_id` when it is 0 and `plate_id` when unset.
    fn insert_experiment(&self, experiment: &mut Experiment) -> SdlResult<i64>;

    /// Experiment with parameters and results.
    fn load_experiment(&self, experiment_id: i64) -> SdlResult<Option<Experiment>>;

    /// Experiments waiting to run.
    fn queued_experiments(&self) -> SdlResult<Vec<QueueEntry>>;

    /// Write `experiment.status` to the experiment and its well together.
    fn record_status(&self, experiment: &Experiment) -> SdlResult<()>;

    fn set_priority(&self, experiment_id: i64, priority: i64) -> SdlResult<()>;

    /// Append one result row. Results are never updated or deleted.
    fn append_artifact(&self, experiment_id: i64, artifact: &Artifact) -> SdlResult<()>;

    fn set_needs_analysis(&self, experiment_id: i64, needs_analysis: bool) -> SdlResult<()>;

    /// Persisted system state, if any was ever written.
    fn system_state(&self) -> SdlResult<Option<SystemState>>;

    fn set_system_state(&self, state: SystemState, note: &str) -> SdlResult<()>;
}
