//! Experiment queue: enqueue with well assignment and next-experiment selection.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Selection;
use crate::error::SdlResult;
use crate::experiment::{Experiment, ExperimentStatus};
use crate::labware::{well_order, VesselKind};
use crate::store::Store;

/// A queued experiment as seen by the selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub experiment_id: i64,
    pub priority: i64,
    pub well_id: String,
}

/// Pick the next entry: lowest priority value, ties broken by `selection`.
pub fn select_next<'a, R: Rng + ?Sized>(
    entries: &'a [QueueEntry],
    selection: Selection,
    rng: &mut R,
) -> Option<&'a QueueEntry> {
    let best = entries.iter().map(|e| e.priority).min()?;
    let tied: Vec<&QueueEntry> = entries.iter().filter(|e| e.priority == best).collect();
    match selection {
        Selection::LowestId => tied.into_iter().min_by_key(|e| e.experiment_id),
        Selection::Random => tied.choose(rng).copied(),
    }
}

/// Queue an experiment, assigning a fresh well when the requested one is taken.
///
/// With no NEW well left the experiment is stored as PENDING with no well.
pub fn enqueue(store: &dyn Store, mut experiment: Experiment) -> SdlResult<Experiment> {
    let requested_free = !experiment.well_id.is_empty()
        && store.well_status(&experiment.well_id)? == Some(ExperimentStatus::New);

    if requested_free {
        experiment.status = ExperimentStatus::Queued;
    } else {
        let free_well = store
            .load_vessels()?
            .into_iter()
            .filter(|v| v.kind == VesselKind::Well && v.status == Some(ExperimentStatus::New))
            .min_by_key(|w| well_order(&w.id));
        match free_well {
            Some(well) => {
                if !experiment.well_id.is_empty() {
                    tracing::info!(
                        requested = %experiment.well_id,
                        assigned = %well.id,
                        "Requested well is taken; reassigning"
                    );
                }
                experiment.well_id = well.id;
                experiment.status = ExperimentStatus::Queued;
            }
            None => {
                tracing::warn!(name = %experiment.name, "No free well; experiment left pending");
                experiment.well_id.clear();
                experiment.status = ExperimentStatus::Pending;
            }
        }
    }
    experiment.status_date = chrono::Utc::now();
    let id = store.insert_experiment(&mut experiment)?;
    tracing::info!(
        experiment_id = id,
        well_id = %experiment.well_id,
        priority = experiment.priority,
        status = %experiment.status,
        "Experiment enqueued"
    );
    Ok(experiment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::Vessel;
    use crate::protocol::RINSE_ONLY;
    use crate::store::{PlateRecord, SqliteStore};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn entry(id: i64, priority: i64) -> QueueEntry {
        QueueEntry {
            experiment_id: id,
            priority,
            well_id: format!("A{id}"),
        }
    }

    #[test]
    fn test_lowest_priority_then_lowest_id() {
        let entries = vec![entry(4, 2), entry(9, 1), entry(7, 1)];
        let mut rng = StdRng::seed_from_u64(1);
        let next = select_next(&entries, Selection::LowestId, &mut rng).unwrap();
        assert_eq!(next.experiment_id, 7);
    }

    #[test]
    fn test_random_stays_within_tied_set() {
        let entries = vec![entry(1, 3), entry(2, 1), entry(3, 1), entry(4, 1)];
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let next = select_next(&entries, Selection::Random, &mut rng).unwrap();
            assert_eq!(next.priority, 1);
        }
    }

    #[test]
    fn test_empty_queue() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(select_next(&[], Selection::LowestId, &mut rng).is_none());
    }

    fn store_with_wells(ids: &[&str]) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .add_plate(PlateRecord { id: 1, type_id: 4 }, true)
            .unwrap();
        for id in ids {
            store.upsert_vessel(&Vessel::well(id, 1, 300.0)).unwrap();
        }
        store
    }

    #[test]
    fn test_enqueue_keeps_free_well() {
        let store = store_with_wells(&["A1", "A2"]);
        let queued = enqueue(&store, Experiment::new("x", RINSE_ONLY).with_well("A2")).unwrap();
        assert_eq!(queued.well_id, "A2");
        assert_eq!(queued.status, ExperimentStatus::Queued);
        assert_eq!(
            store.well_status("A2").unwrap(),
            Some(ExperimentStatus::Queued)
        );
    }

    #[test]
    fn test_enqueue_reassigns_taken_well() {
        let store = store_with_wells(&["A1", "A2"]);
        enqueue(&store, Experiment::new("x", RINSE_ONLY).with_well("A1")).unwrap();
        let second = enqueue(&store, Experiment::new("y", RINSE_ONLY).with_well("A1")).unwrap();
        assert_eq!(second.well_id, "A2");
    }

    #[test]
    fn test_enqueue_without_free_well_is_pending() {
        let store = store_with_wells(&["A1"]);
        enqueue(&store, Experiment::new("x", RINSE_ONLY).with_well("A1")).unwrap();
        let second = enqueue(&store, Experiment::new("y", RINSE_ONLY)).unwrap();
        assert_eq!(second.status, ExperimentStatus::Pending);
        assert!(second.well_id.is_empty());
        assert_eq!(store.queued_experiments().unwrap().len(), 1);
    }
}
