//! Scheduler and system-state control loop.
//!
//! One loop owns the robot: it re-reads the deck, purges the pipette, picks
//! the next queued experiment, checks that its solutions are in stock, and
//! runs its protocol to completion. A background poller turns operator
//! messages into PAUSE, RESUME and SHUTDOWN on the shared system state, which
//! the loop honours at checkpoints between experiments, never mid-action.
//!
//! ```text
//!  ┌───────────────┐  pause/resume/shutdown  ┌──────────────────┐
//!  │ control poller│ ──────────────────────► │ SharedSystemState│
//!  └───────────────┘                         └────────┬─────────┘
//!                                                     │ checkpoint
//!  ┌──────────────────────────────────────────────────▼─────────┐
//!  │ run_loop: establish → purge → select → validate → execute  │
//!  └────────────────────────────────────────────────────────────┘
//! ```

pub mod control;
pub mod queue;
pub mod system_state;

pub use control::{spawn_control_poller, ControlCommand};
pub use queue::{enqueue, select_next, QueueEntry};
pub use system_state::{SharedSystemState, SystemState};

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::Instrument;

use crate::config::{Config, Selection};
use crate::electrochem::Electrochemistry;
use crate::error::{SdlError, SdlResult};
use crate::experiment::{Experiment, ExperimentStateMachine, ExperimentStatus};
use crate::generator::ExperimentGenerator;
use crate::hardware::{AlertChannel, Toolkit};
use crate::labware::ResourceLedger;
use crate::logging;
use crate::protocol::{ProtocolContext, ProtocolRegistry};
use crate::store::Store;
use crate::transfer::{Source, TransferEngine, TransferSettings};

/// Waste vials at or above this fill fraction count as full.
const WASTE_FULL_FRACTION: f64 = 0.95;

/// Why the loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Operator shutdown, or the deck needs attention
    Shutdown,
    /// One-off mode ran its experiment (or found none)
    OneOffComplete,
    /// The configured campaign length was reached
    CampaignComplete,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunOutcome::Shutdown => "shutdown",
            RunOutcome::OneOffComplete => "one-off run complete",
            RunOutcome::CampaignComplete => "campaign complete",
        };
        f.write_str(text)
    }
}

/// Owns the robot for the lifetime of a run.
///
/// Holds the resource ledger, the transfer and electrochemistry engines and
/// the protocol registry. [`Scheduler::run`] is the only entry point that
/// moves hardware; the rest is for inspection and tests.
pub struct Scheduler {
    config: Config,
    store: Arc<dyn Store>,
    toolkit: Toolkit,
    state: SharedSystemState,
    ledger: ResourceLedger,
    transfer: TransferEngine,
    echem: Electrochemistry,
    registry: ProtocolRegistry,
    generator: Option<Arc<dyn ExperimentGenerator>>,
    rng: StdRng,
    completed: u32,
    low_stock_alerted: HashSet<String>,
}

impl Scheduler {
    /// Restore the persisted system state and load the vessel inventory.
    pub fn new(config: Config, store: Arc<dyn Store>, toolkit: Toolkit) -> SdlResult<Self> {
        let state = SharedSystemState::restore(store.clone())?;
        let ledger = ResourceLedger::load(store.clone())?;
        let transfer = TransferEngine::new(toolkit.clone(), TransferSettings::from_config(&config));
        let echem = Electrochemistry::new(toolkit.clone(), &config);
        Ok(Self {
            config,
            store,
            toolkit,
            state,
            ledger,
            transfer,
            echem,
            registry: ProtocolRegistry::with_builtins(),
            generator: None,
            rng: StdRng::from_entropy(),
            completed: 0,
            low_stock_alerted: HashSet::new(),
        })
    }

    pub fn with_generator(mut self, generator: Arc<dyn ExperimentGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Replace the built-in protocols.
    pub fn with_registry(mut self, registry: ProtocolRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Deterministic tie-breaking for random selection.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Handle for the control surface.
    pub fn system_state(&self) -> SharedSystemState {
        self.state.clone()
    }

    /// Inventory as of the last refresh.
    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Experiments completed since this scheduler was created.
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Highest-priority queued experiment, ties broken by `selection`.
    pub fn next_experiment(&mut self, selection: Selection) -> SdlResult<Option<Experiment>> {
        let entries = self.store.queued_experiments()?;
        let Some(entry) = select_next(&entries, selection, &mut self.rng) else {
            return Ok(None);
        };
        let id = entry.experiment_id;
        self.store
            .load_experiment(id)?
            .map(Some)
            .ok_or(SdlError::ExperimentNotFound(id))
    }

    /// Run until shutdown, one-off completion, campaign end, or a fatal error.
    ///
    /// The control poller runs for exactly as long as this call.
    pub async fn run(&mut self) -> SdlResult<RunOutcome> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = spawn_control_poller(
            self.toolkit.alerts.clone(),
            self.state.clone(),
            self.config.scheduler.poll_interval(),
            stop_rx,
        );

        let result = self.run_loop().await;

        let _ = stop_tx.send(true);
        if let Err(e) = poller.await {
            tracing::warn!(error = %e, "Control poller did not stop cleanly");
        }
        match &result {
            Ok(outcome) => {
                tracing::info!(%outcome, completed = self.completed, "Scheduler stopped");
                self.toolkit
                    .notify(AlertChannel::Conversation, &format!("Stopped: {outcome}"))
                    .await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Scheduler stopped on error");
                if let Err(state_err) = self.state.set(SystemState::Error, &e.to_string()) {
                    tracing::error!(error = %state_err, "Failed to record ERROR state");
                }
            }
        }
        result
    }

    async fn run_loop(&mut self) -> SdlResult<RunOutcome> {
        self.toolkit.motion.home().await?;
        self.toolkit
            .motion
            .set_feed_rate(self.config.pipetting.feed_rate)
            .await?;
        tokio::fs::create_dir_all(&self.config.application.data_dir).await?;
        self.state.set_activity(SystemState::Idle, "started")?;
        self.toolkit
            .notify(AlertChannel::Conversation, "System started")
            .await;

        loop {
            if let Some(outcome) = self.checkpoint().await? {
                return Ok(outcome);
            }

            match self.establish_system_state().await {
                Ok(()) => {}
                Err(SdlError::ShutDown) => {
                    self.state
                        .set(SystemState::Shutdown, "deck needs attention")?;
                    return Ok(RunOutcome::Shutdown);
                }
                Err(e) => return Err(e),
            }
            self.transfer.purge_pipette(&mut self.ledger).await?;

            let Some(experiment) = self.next_experiment(self.config.scheduler.selection)? else {
                if self.config.scheduler.one_off {
                    tracing::info!("Queue empty in one-off mode");
                    return Ok(RunOutcome::OneOffComplete);
                }
                self.wait_for_work().await?;
                continue;
            };

            if let Err(e) = self.validate_resources(&experiment) {
                if e.is_recoverable() {
                    self.defer(experiment, &e).await?;
                    continue;
                }
                self.abandon(experiment, &e).await;
                return Err(e);
            }

            if !self.state.set_activity(SystemState::Busy, "running experiment")? {
                // A pause or shutdown arrived after the checkpoint; it wins.
                continue;
            }
            let done = self.execute(experiment).await?;
            self.completed += 1;
            self.state.set_activity(SystemState::Idle, "experiment done")?;

            if self.config.scheduler.one_off {
                return Ok(RunOutcome::OneOffComplete);
            }
            if let Some(length) = self.config.scheduler.campaign_length {
                if self.completed >= length {
                    return Ok(RunOutcome::CampaignComplete);
                }
                if let Some(generator) = self.generator.clone() {
                    let next = generator
                        .next_experiment(&done)
                        .await?
                        .ok_or(SdlError::NoExperimentGenerated)?;
                    enqueue(self.store.as_ref(), next)?;
                }
            }
        }
    }

    /// Honour operator signals. Blocks while paused.
    async fn checkpoint(&mut self) -> SdlResult<Option<RunOutcome>> {
        let mut announced = false;
        loop {
            match self.state.get() {
                SystemState::Shutdown => {
                    tracing::info!("Shutdown requested");
                    return Ok(Some(RunOutcome::Shutdown));
                }
                SystemState::Pause => {
                    if !announced {
                        tracing::info!("Paused");
                        self.toolkit
                            .notify(AlertChannel::Conversation, "Paused; send resume to continue")
                            .await;
                        announced = true;
                    }
                    sleep(self.config.scheduler.poll_interval()).await;
                }
                SystemState::Resume => {
                    self.state.set_activity(SystemState::Idle, "resumed")?;
                    self.toolkit
                        .notify(AlertChannel::Conversation, "Resumed")
                        .await;
                    return Ok(None);
                }
                _ => return Ok(None),
            }
        }
    }

    /// Re-read the deck and decide whether it can support another experiment.
    ///
    /// Returns [`SdlError::ShutDown`] when every waste vial is full, or when
    /// no NEW well remains and nothing is queued.
    pub async fn establish_system_state(&mut self) -> SdlResult<()> {
        self.ledger.refresh()?;

        let low: Vec<(String, String, f64)> = self
            .ledger
            .low_stock(self.config.resources.low_stock_ul)
            .into_iter()
            .map(|v| (v.id.clone(), v.name.clone(), v.volume))
            .collect();
        self.low_stock_alerted
            .retain(|id| low.iter().any(|(low_id, _, _)| low_id == id));
        for (id, name, volume) in low {
            if self.low_stock_alerted.insert(id.clone()) {
                tracing::warn!(vial = %id, solution = %name, volume, "Stock running low");
                self.toolkit
                    .notify(
                        AlertChannel::Alert,
                        &format!("Vial {id} ({name}) is low: {volume:.0} uL left"),
                    )
                    .await;
            }
        }

        if self.ledger.waste_full(WASTE_FULL_FRACTION) {
            self.toolkit
                .notify(AlertChannel::Alert, "All waste vials are full; empty them and restart")
                .await;
            return Err(SdlError::ShutDown);
        }
        if self.ledger.next_new_well().is_none() && self.store.queued_experiments()?.is_empty() {
            self.toolkit
                .notify(AlertChannel::Alert, "No new wells left; replace the wellplate")
                .await;
            return Err(SdlError::ShutDown);
        }
        Ok(())
    }

    /// Wait up to the configured window for new queue entries or an operator signal.
    async fn wait_for_work(&mut self) -> SdlResult<()> {
        self.state.set_activity(SystemState::Idle, "queue empty")?;
        tracing::info!(
            window_secs = self.config.scheduler.wait_window_secs,
            "Queue empty; waiting"
        );
        let deadline = Instant::now() + self.config.scheduler.wait_window();
        while Instant::now() < deadline {
            sleep(self.config.scheduler.poll_interval()).await;
            if self.state.get().is_pending_signal() {
                return Ok(());
            }
            if !self.store.queued_experiments()?.is_empty() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Check the experiment's plate and well, and that each solution it needs
    /// is in stock above the vial reserves, summed over every vial holding it.
    /// Mixed solutions must also have a feasible draw plan.
    pub fn validate_resources(&self, experiment: &Experiment) -> SdlResult<()> {
        self.registry.get(&experiment.protocol_id)?;
        if let Some(expected) = experiment.plate_id {
            let active = self.store.active_plate()?.map(|p| p.id);
            if active != Some(expected) {
                return Err(SdlError::PlateMismatch {
                    experiment_id: experiment.experiment_id,
                    expected,
                    active,
                });
            }
        }
        self.ledger.get(&experiment.well_id)?;
        let reserve = self.config.resources.stock_reserve_fraction;
        for (solution, required) in experiment.required_volumes() {
            let available = self.ledger.withdrawable_volume(&solution, reserve);
            if required > available {
                return Err(SdlError::InsufficientVolume {
                    experiment_id: experiment.experiment_id,
                    reason: format!(
                        "needs {required} uL of {solution}, {available} uL available above reserve"
                    ),
                });
            }
        }
        for (solution, spec) in experiment.solutions.iter().filter(|(_, s)| s.volume > 0.0) {
            if let Some(concentration) = spec.concentration {
                self.transfer.plan_draws(
                    &self.ledger,
                    &Source::mixed(solution, concentration),
                    spec.volume,
                )?;
            }
        }
        Ok(())
    }

    /// Push the experiment to the back of the queue and mark it ERROR.
    async fn defer(&mut self, experiment: Experiment, error: &SdlError) -> SdlResult<()> {
        let id = experiment.experiment_id;
        let priority = self.config.scheduler.deferred_priority;
        tracing::warn!(experiment_id = id, error = %error, priority, "Deferring experiment");
        self.store.set_priority(id, priority)?;
        let mut sm = ExperimentStateMachine::new(experiment.with_priority(priority), self.store.clone());
        sm.fail(error)?;
        self.toolkit
            .notify(
                AlertChannel::Alert,
                &format!("Experiment {id} deferred: {error}"),
            )
            .await;
        Ok(())
    }

    /// Record a fatal failure on an experiment that never started.
    async fn abandon(&mut self, experiment: Experiment, error: &SdlError) {
        let id = experiment.experiment_id;
        let mut sm = ExperimentStateMachine::new(experiment, self.store.clone());
        if let Err(e) = sm.fail(error) {
            tracing::error!(experiment_id = id, error = %e, "Failed to record ERROR status");
        }
        self.toolkit
            .notify(
                AlertChannel::Alert,
                &format!("Experiment {id} cannot run: {error}"),
            )
            .await;
    }

    /// Run one experiment's protocol to COMPLETE.
    ///
    /// On failure the experiment and its well are marked ERROR, everything
    /// recorded so far stays stored, the pipette is emptied if possible, the
    /// operator is alerted, and the error is returned.
    pub async fn execute(&mut self, experiment: Experiment) -> SdlResult<Experiment> {
        let span = logging::experiment_span(
            experiment.experiment_id,
            &experiment.well_id,
            &format!("{}.{}", experiment.project_id, experiment.project_campaign_id),
        );
        let id = experiment.experiment_id;
        let well_id = experiment.well_id.clone();
        let mut sm = ExperimentStateMachine::new(experiment, self.store.clone());

        let result = self.run_protocol(&mut sm).instrument(span.clone()).await;

        match result {
            Ok(()) => {
                span.in_scope(|| tracing::info!(steps = sm.step(), "Experiment complete"));
                self.toolkit
                    .notify(
                        AlertChannel::Conversation,
                        &format!("Experiment {id} in well {well_id} complete"),
                    )
                    .await;
                Ok(sm.into_experiment())
            }
            Err(e) => {
                if let Err(record_err) = sm.fail(&e) {
                    tracing::error!(experiment_id = id, error = %record_err, "Failed to record ERROR status");
                }
                if let Err(purge_err) = self.transfer.purge_pipette(&mut self.ledger).await {
                    tracing::error!(error = %purge_err, "Pipette purge after failure failed");
                }
                self.toolkit
                    .notify(
                        AlertChannel::Alert,
                        &format!("Experiment {id} in well {well_id} failed: {e}"),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn run_protocol(&mut self, sm: &mut ExperimentStateMachine) -> SdlResult<()> {
        sm.declare_step("start", ExperimentStatus::Running)?;
        let experiment = sm.experiment();
        self.toolkit
            .notify(
                AlertChannel::Conversation,
                &format!(
                    "Starting experiment {} ({}) in well {}",
                    experiment.experiment_id, experiment.name, experiment.well_id
                ),
            )
            .await;
        let protocol = self.registry.get(&sm.experiment().protocol_id)?;
        let mut ctx = ProtocolContext {
            sm: &mut *sm,
            ledger: &mut self.ledger,
            transfer: &mut self.transfer,
            echem: &self.echem,
            toolkit: &self.toolkit,
            data_dir: &self.config.application.data_dir,
            safe_z: self.config.pipetting.safe_z,
        };
        protocol.run(&mut ctx).await?;
        sm.complete()
    }
}
