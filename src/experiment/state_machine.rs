//! Step-by-step execution record of one experiment.
//!
//! Protocol code announces each phase with [`ExperimentStateMachine::declare_step`].
//! Every declaration is persisted before the phase starts, and the store writes
//! the experiment status and the well status together, so the well never
//! shows a stale phase.

use chrono::Utc;
use std::sync::Arc;

use super::{Artifact, Experiment, ExperimentStatus};
use crate::error::{SdlError, SdlResult};
use crate::store::Store;

/// Owns one experiment while it runs and persists every phase change.
pub struct ExperimentStateMachine {
    experiment: Experiment,
    store: Arc<dyn Store>,
    step: u32,
}

impl ExperimentStateMachine {
    /// Wrap an experiment already in the store. Nothing is written until the
    /// first step is declared.
    pub fn new(experiment: Experiment, store: Arc<dyn Store>) -> Self {
        Self {
            experiment,
            store,
            step: 0,
        }
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    /// Number of steps declared so far.
    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn status(&self) -> ExperimentStatus {
        self.experiment.status
    }

    /// Enter the next phase and persist it.
    ///
    /// Terminal experiments cannot be moved; the in-memory status is only
    /// changed once the store accepted the write.
    pub fn declare_step(&mut self, name: &str, status: ExperimentStatus) -> SdlResult<()> {
        let current = self.experiment.status;
        if current.is_terminal() {
            return Err(SdlError::IllegalTransition {
                experiment_id: self.experiment.experiment_id,
                from: current.to_string(),
                to: status.to_string(),
            });
        }
        let mut next = self.experiment.clone();
        next.status = status;
        next.status_date = Utc::now();
        self.store.record_status(&next)?;
        self.experiment = next;
        self.step += 1;
        tracing::info!(step = self.step, name, %status, "Step");
        Ok(())
    }

    /// Persist an artifact and add it to the in-memory results.
    pub fn record_artifact(&mut self, artifact: Artifact) -> SdlResult<()> {
        self.store
            .append_artifact(self.experiment.experiment_id, &artifact)?;
        tracing::debug!(kind = %artifact.kind, context = %artifact.context, "Artifact recorded");
        self.experiment.results.push(artifact);
        Ok(())
    }

    /// Mark the experiment ERROR. Already-terminal experiments are left alone.
    pub fn fail(&mut self, error: &SdlError) -> SdlResult<()> {
        if self.experiment.status.is_terminal() {
            return Ok(());
        }
        tracing::error!(error = %error, status = %self.experiment.status, "Experiment failed");
        self.declare_step("error", ExperimentStatus::Error)
    }

    /// SAVING then COMPLETE, flagging the results for analysis.
    pub fn complete(&mut self) -> SdlResult<()> {
        self.declare_step("save results", ExperimentStatus::Saving)?;
        self.store
            .set_needs_analysis(self.experiment.experiment_id, true)?;
        self.experiment.needs_analysis = true;
        self.declare_step("complete", ExperimentStatus::Complete)
    }

    pub fn into_experiment(self) -> Experiment {
        self.experiment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ArtifactKind;
    use crate::labware::Vessel;
    use crate::protocol::RINSE_ONLY;
    use crate::scheduler::queue::enqueue;
    use crate::store::{PlateRecord, SqliteStore};

    fn machine() -> (Arc<SqliteStore>, ExperimentStateMachine) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .add_plate(PlateRecord { id: 1, type_id: 4 }, true)
            .unwrap();
        store.upsert_vessel(&Vessel::well("A1", 1, 300.0)).unwrap();
        let experiment =
            enqueue(store.as_ref(), Experiment::new("x", RINSE_ONLY).with_well("A1")).unwrap();
        let sm = ExperimentStateMachine::new(experiment, store.clone());
        (store, sm)
    }

    #[test]
    fn test_each_step_updates_experiment_and_well() {
        let (store, mut sm) = machine();
        let id = sm.experiment().experiment_id;
        for (name, status) in [
            ("start", ExperimentStatus::Running),
            ("fill", ExperimentStatus::Pipetting),
            ("rinse", ExperimentStatus::Rinsing),
        ] {
            sm.declare_step(name, status).unwrap();
            let stored = store.load_experiment(id).unwrap().unwrap();
            assert_eq!(stored.status, status);
            assert_eq!(store.well_status("A1").unwrap(), Some(status));
        }
        assert_eq!(sm.step(), 3);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let (_store, mut sm) = machine();
        sm.declare_step("start", ExperimentStatus::Running).unwrap();
        sm.complete().unwrap();
        assert_eq!(sm.status(), ExperimentStatus::Complete);
        assert!(sm.experiment().needs_analysis);
        assert!(matches!(
            sm.declare_step("again", ExperimentStatus::Running),
            Err(SdlError::IllegalTransition { .. })
        ));
        // fail() after completion does nothing
        sm.fail(&SdlError::ShutDown).unwrap();
        assert_eq!(sm.status(), ExperimentStatus::Complete);
    }

    #[test]
    fn test_fail_marks_error_and_keeps_artifacts() {
        let (store, mut sm) = machine();
        sm.declare_step("start", ExperimentStatus::Running).unwrap();
        sm.record_artifact(Artifact::new(ArtifactKind::Ocp, "CA").with_passed(true))
            .unwrap();
        sm.fail(&SdlError::Hardware("stall".into())).unwrap();

        let stored = store
            .load_experiment(sm.experiment().experiment_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ExperimentStatus::Error);
        assert_eq!(stored.results.len(), 1);
        assert_eq!(store.well_status("A1").unwrap(), Some(ExperimentStatus::Error));
    }
}
