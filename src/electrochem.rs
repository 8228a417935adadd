//! Electrochemical steps: OCP-checked deposition and characterisation.
//!
//! Every active technique is preceded by an open-circuit potential check at
//! the nominal electrode height. A reading near zero means the electrodes are
//! touching, so the electrode is raised and the check repeated. A reading far
//! from zero means the electrode is out of solution and the experiment stops.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::{Config, OcpConfig};
use crate::error::{ElectrochemError, SdlError, SdlResult};
use crate::experiment::{
    Artifact, ArtifactKind, EchemParams, ExperimentStateMachine, ExperimentStatus,
};
use crate::hardware::{OcpReading, Tool, Toolkit};
use crate::labware::{Coordinates, Vessel};
use crate::retry::{run_confirmed, ConfirmedAction, RetryPolicy};

/// Programmed length of a potentiostat hold.
fn hold_duration(technique: &str, secs: f64) -> SdlResult<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|e| SdlError::InvalidParameter {
        name: format!("{technique} duration"),
        reason: format!("{secs} s: {e}"),
    })
}

/// How an OCP reading is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcpVerdict {
    Passed,
    /// Near-zero potential: counter and working electrode touching
    Short,
    /// Implausibly large potential: electrode not in solution
    OutOfSolution,
    Failed,
}

pub fn classify(reading: &OcpReading, config: &OcpConfig) -> OcpVerdict {
    let magnitude = reading.final_voltage.abs();
    if reading.passed {
        OcpVerdict::Passed
    } else if magnitude < config.short_threshold_v {
        OcpVerdict::Short
    } else if magnitude > config.open_threshold_v {
        OcpVerdict::OutOfSolution
    } else {
        OcpVerdict::Failed
    }
}

struct OcpHeightCorrection<'a> {
    toolkit: &'a Toolkit,
    config: &'a OcpConfig,
    nominal: Coordinates,
    safe_z: f64,
    adjustment: f64,
    stage: &'a str,
    output_stem: PathBuf,
    readings: Vec<OcpReading>,
}

#[async_trait]
impl ConfirmedAction for OcpHeightCorrection<'_> {
    fn name(&self) -> &str {
        "ocp height correction"
    }

    async fn attempt(&mut self, attempt: u32) -> SdlResult<bool> {
        let target = self.nominal.with_z(self.nominal.z + self.adjustment);
        self.toolkit
            .safe_move(target, Tool::Electrode, self.safe_z)
            .await?;
        let output = self
            .output_stem
            .with_file_name(format!("{}_{attempt}.txt", file_name(&self.output_stem)));
        let reading = self.toolkit.potentiostat.run_ocp(&output).await?;
        let verdict = classify(&reading, self.config);
        tracing::info!(
            stage = self.stage,
            attempt,
            voltage = reading.final_voltage,
            ?verdict,
            adjustment_mm = self.adjustment,
            "OCP"
        );
        let voltage = reading.final_voltage;
        self.readings.push(reading);
        match verdict {
            OcpVerdict::Passed => Ok(true),
            OcpVerdict::Short => Ok(false),
            OcpVerdict::OutOfSolution => Err(ElectrochemError::Ocp {
                stage: self.stage.to_string(),
                reason: format!("{voltage} V, likely out of solution"),
            }
            .into()),
            OcpVerdict::Failed => Err(ElectrochemError::Ocp {
                stage: self.stage.to_string(),
                reason: format!("{voltage} V outside the accepted range"),
            }
            .into()),
        }
    }

    async fn recover(&mut self) -> SdlResult<()> {
        self.adjustment += self.config.raise_increment_mm;
        tracing::warn!(
            stage = self.stage,
            adjustment_mm = self.adjustment,
            "Raising electrode"
        );
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Background progress logger for long potentiostat holds.
pub struct ElapsedTicker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ElapsedTicker {
    pub fn start(label: &str, expected: Duration, every: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let label = label.to_string();
        let handle = tokio::spawn(
            async move {
                let started = Instant::now();
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            tracing::info!(
                                technique = %label,
                                elapsed_secs = started.elapsed().as_secs(),
                                expected_secs = expected.as_secs(),
                                "Running"
                            );
                        }
                        _ = stopped.changed() => break,
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );
        Self { stop, handle }
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            tracing::debug!(error = %e, "Elapsed ticker ended abnormally");
        }
    }
}

/// Runs OCP, CA and CV against a well.
pub struct Electrochemistry {
    toolkit: Toolkit,
    ocp: OcpConfig,
    policy: RetryPolicy,
    safe_z: f64,
    data_dir: PathBuf,
    tick_every: Duration,
}

impl Electrochemistry {
    pub fn new(toolkit: Toolkit, config: &Config) -> Self {
        Self {
            toolkit,
            ocp: config.ocp.clone(),
            policy: RetryPolicy::from(&config.retry)
                .with_max_attempts(config.ocp.max_raises.saturating_add(1)),
            safe_z: config.pipetting.safe_z,
            data_dir: config.application.data_dir.clone(),
            tick_every: Duration::from_secs(30),
        }
    }

    fn data_path(&self, sm: &ExperimentStateMachine, tag: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}_{tag}", sm.experiment().file_stem()))
    }

    fn nominal(&self, well: &Vessel) -> Coordinates {
        well.coordinates
            .with_z(well.bottom() + self.ocp.electrode_offset_mm)
    }

    /// Check the open-circuit potential before `stage`, raising the electrode
    /// on a short. Every reading is recorded.
    pub async fn ocp_check(
        &self,
        sm: &mut ExperimentStateMachine,
        well: &Vessel,
        stage: &str,
    ) -> SdlResult<OcpReading> {
        sm.declare_step(&format!("OCP before {stage}"), ExperimentStatus::OcpCheck)?;
        let mut action = OcpHeightCorrection {
            toolkit: &self.toolkit,
            config: &self.ocp,
            nominal: self.nominal(well),
            safe_z: self.safe_z,
            adjustment: 0.0,
            stage,
            output_stem: self.data_path(sm, &format!("OCP_{stage}")),
            readings: Vec::new(),
        };
        let result = run_confirmed(&mut action, &self.policy).await;
        for reading in &action.readings {
            sm.record_artifact(
                Artifact::new(ArtifactKind::Ocp, stage)
                    .with_path(&reading.data)
                    .with_passed(reading.passed)
                    .with_value(reading.final_voltage),
            )?;
        }
        let outcome = result?;
        if !outcome.confirmed {
            return Err(ElectrochemError::Ocp {
                stage: stage.to_string(),
                reason: format!(
                    "potential stayed below {} V after {} raises",
                    self.ocp.short_threshold_v,
                    outcome.attempts.saturating_sub(1)
                ),
            }
            .into());
        }
        action
            .readings
            .pop()
            .ok_or_else(|| SdlError::Hardware("OCP produced no reading".into()))
    }

    /// OCP-checked chronoamperometric deposition.
    pub async fn deposition(
        &self,
        sm: &mut ExperimentStateMachine,
        well: &Vessel,
        params: &EchemParams,
    ) -> SdlResult<PathBuf> {
        let expected = hold_duration("CA", params.ca.duration_secs())?;
        if params.run_ocp {
            self.ocp_check(sm, well, "CA").await?;
        }
        let experiment_id = sm.experiment().experiment_id;
        let well_id = well.id.clone();
        sm.declare_step("deposition", ExperimentStatus::EDepositing)
            .map_err(|e| deposition_failure(e, experiment_id, &well_id))?;
        self.toolkit
            .safe_move(self.nominal(well), Tool::Electrode, self.safe_z)
            .await
            .map_err(|e| deposition_failure(e, experiment_id, &well_id))?;

        let output = self.data_path(sm, "CA");
        let ticker = ElapsedTicker::start("CA", expected, self.tick_every);
        let result = self.toolkit.potentiostat.run_ca(&params.ca, &output).await;
        ticker.stop().await;
        let data = result.map_err(|e| {
            tracing::error!(error = %e, "CA failed");
            SdlError::from(ElectrochemError::Ca {
                experiment_id,
                well_id: well_id.clone(),
            })
        })?;
        sm.record_artifact(Artifact::new(ArtifactKind::CaData, "CA").with_path(&data))?;
        Ok(data)
    }

    /// OCP-checked cyclic voltammetry. The sweep starts from the measured OCP.
    pub async fn characterization(
        &self,
        sm: &mut ExperimentStateMachine,
        well: &Vessel,
        params: &EchemParams,
    ) -> SdlResult<PathBuf> {
        let mut waveform = params.cv.clone();
        let expected = hold_duration("CV", waveform.duration_secs())?;
        if params.run_ocp {
            let reading = self.ocp_check(sm, well, "CV").await?;
            waveform.initial_voltage = reading.final_voltage;
        }
        let (name, status, tag) = if params.run_baseline {
            ("baseline", ExperimentStatus::Baseline, "CV_baseline")
        } else {
            ("characterization", ExperimentStatus::Characterizing, "CV")
        };
        sm.declare_step(name, status)?;
        self.toolkit
            .safe_move(self.nominal(well), Tool::Electrode, self.safe_z)
            .await?;

        let output = self.data_path(sm, tag);
        let ticker = ElapsedTicker::start(tag, expected, self.tick_every);
        let result = self.toolkit.potentiostat.run_cv(&waveform, &output).await;
        ticker.stop().await;
        let data = result.map_err(|e| {
            tracing::error!(error = %e, "CV failed");
            SdlError::from(ElectrochemError::Cv {
                experiment_id: sm.experiment().experiment_id,
                well_id: well.id.clone(),
            })
        })?;
        sm.record_artifact(Artifact::new(ArtifactKind::CvData, tag).with_path(&data))?;
        Ok(data)
    }

    /// Lift the electrode clear of the plate.
    pub async fn retract(&self) -> SdlResult<()> {
        let current = self.toolkit.motion.position(Tool::Electrode).await?;
        self.toolkit
            .motion
            .move_to(current.with_z(self.safe_z), Tool::Electrode)
            .await?;
        Ok(())
    }
}

/// Non-electrochemical failures inside a deposition become deposition failures.
fn deposition_failure(error: SdlError, experiment_id: i64, well_id: &str) -> SdlError {
    match error {
        SdlError::Electrochem(_) | SdlError::Persistence(_) => error,
        other => {
            tracing::error!(error = %other, "Deposition aborted");
            ElectrochemError::Deposition {
                experiment_id,
                well_id: well_id.to_string(),
            }
            .into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Experiment;
    use crate::hardware::mock::MockRig;
    use crate::hardware::ports::MotionPort;
    use crate::protocol::ECHEM_DEPOSITION;
    use crate::scheduler::queue::enqueue;
    use crate::store::{PlateRecord, SqliteStore, Store};
    use std::sync::Arc;

    struct Bench {
        store: Arc<SqliteStore>,
        rig: MockRig,
        echem: Electrochemistry,
        sm: ExperimentStateMachine,
        well: Vessel,
    }

    fn bench() -> Bench {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .add_plate(PlateRecord { id: 1, type_id: 4 }, true)
            .unwrap();
        let well = Vessel::well("A1", 1, 300.0).at(Coordinates::new(-220.0, -45.0, -75.0));
        store.upsert_vessel(&well).unwrap();
        let experiment = enqueue(
            store.as_ref(),
            Experiment::new("dep", ECHEM_DEPOSITION).with_well("A1"),
        )
        .unwrap();
        let mut sm = ExperimentStateMachine::new(experiment, store.clone());
        sm.declare_step("start", ExperimentStatus::Running).unwrap();
        let rig = MockRig::new();
        let mut config = Config::default();
        config.retry.settle_delay_ms = 1;
        let echem = Electrochemistry::new(rig.toolkit(), &config);
        Bench {
            store,
            rig,
            echem,
            sm,
            well,
        }
    }

    fn ocp(passed: bool, final_voltage: f64) -> OcpReading {
        OcpReading {
            passed,
            final_voltage,
            data: PathBuf::from("ocp.txt"),
        }
    }

    #[test]
    fn test_classify_thresholds() {
        let config = OcpConfig::default();
        assert_eq!(classify(&ocp(true, 0.2), &config), OcpVerdict::Passed);
        assert_eq!(classify(&ocp(false, -0.0004), &config), OcpVerdict::Short);
        assert_eq!(classify(&ocp(false, 1.4), &config), OcpVerdict::OutOfSolution);
        assert_eq!(classify(&ocp(false, 0.4), &config), OcpVerdict::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ocp_passes_first_time() {
        let mut b = bench();
        let reading = b.echem.ocp_check(&mut b.sm, &b.well, "CA").await.unwrap();
        assert!(reading.passed);
        assert_eq!(b.sm.experiment().results.len(), 1);
        let z = b.rig.motion.position(Tool::Electrode).await.unwrap().z;
        assert!((z - -73.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_raises_electrode_and_retries() {
        let mut b = bench();
        b.rig
            .potentiostat
            .script_ocp([(false, 0.0002), (false, -0.0001), (true, 0.31)]);
        let reading = b.echem.ocp_check(&mut b.sm, &b.well, "CV").await.unwrap();
        assert_eq!(reading.final_voltage, 0.31);
        assert_eq!(b.sm.experiment().results.len(), 3);
        let z = b.rig.motion.position(Tool::Electrode).await.unwrap().z;
        assert!((z - -72.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_short_is_fatal_after_three_raises() {
        let mut b = bench();
        b.rig.potentiostat.script_ocp([(false, 0.0); 10]);
        let err = b
            .echem
            .ocp_check(&mut b.sm, &b.well, "CA")
            .await
            .unwrap_err();
        assert!(matches!(err, SdlError::Electrochem(ElectrochemError::Ocp { .. })));
        assert!(err.is_fatal());
        assert_eq!(b.rig.potentiostat.runs().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_solution_aborts_immediately() {
        let mut b = bench();
        b.rig.potentiostat.script_ocp([(false, 2.5)]);
        let err = b
            .echem
            .ocp_check(&mut b.sm, &b.well, "CV")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of solution"));
        assert_eq!(b.rig.potentiostat.runs().len(), 1);
        // the failed reading is still on record
        let stored = b
            .store
            .load_experiment(b.sm.experiment().experiment_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.results.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deposition_records_data() {
        let mut b = bench();
        let params = EchemParams::default();
        let data = b.echem.deposition(&mut b.sm, &b.well, &params).await.unwrap();
        assert!(data.to_string_lossy().ends_with("_A1_CA"));
        assert_eq!(b.sm.status(), ExperimentStatus::EDepositing);
        assert_eq!(b.rig.potentiostat.runs(), vec!["ocp", "ca"]);
        assert_eq!(
            b.sm.experiment().results.of_kind(ArtifactKind::CaData).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ca_failure_is_typed() {
        let mut b = bench();
        b.rig.potentiostat.set_fail_ca(true);
        let err = b
            .echem
            .deposition(&mut b.sm, &b.well, &EchemParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SdlError::Electrochem(ElectrochemError::Ca { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_characterization_and_baseline() {
        let mut b = bench();
        let mut params = EchemParams::default();
        b.echem
            .characterization(&mut b.sm, &b.well, &params)
            .await
            .unwrap();
        assert_eq!(b.sm.status(), ExperimentStatus::Characterizing);

        params.run_baseline = true;
        params.run_ocp = false;
        b.echem
            .characterization(&mut b.sm, &b.well, &params)
            .await
            .unwrap();
        assert_eq!(b.sm.status(), ExperimentStatus::Baseline);
        assert_eq!(b.rig.potentiostat.runs(), vec!["ocp", "cv", "cv"]);

        b.rig.potentiostat.set_fail_cv(true);
        let err = b
            .echem
            .characterization(&mut b.sm, &b.well, &params)
            .await
            .unwrap_err();
        assert!(matches!(err, SdlError::Electrochem(ElectrochemError::Cv { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_hold_is_rejected_before_measuring() {
        let mut b = bench();
        let mut params = EchemParams::default();
        params.ca.step_1_time = f64::INFINITY;
        let err = b
            .echem
            .deposition(&mut b.sm, &b.well, &params)
            .await
            .unwrap_err();
        assert!(matches!(err, SdlError::InvalidParameter { .. }));

        let mut params = EchemParams::default();
        params.cv.final_voltage = f64::NAN;
        let err = b
            .echem
            .characterization(&mut b.sm, &b.well, &params)
            .await
            .unwrap_err();
        assert!(matches!(err, SdlError::InvalidParameter { .. }));
        assert!(b.rig.potentiostat.runs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops() {
        let ticker = ElapsedTicker::start("CA", Duration::from_secs(60), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(3)).await;
        ticker.stop().await;
    }
}
