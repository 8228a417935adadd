//! Experiment generators.
//!
//! In campaign mode the scheduler asks a generator for a follow-up after each
//! completed experiment. Model-driven suggestion lives outside this crate and
//! plugs in through [`ExperimentGenerator`].

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SdlResult;
use crate::experiment::{EchemParams, Experiment, ProtocolParams};

#[async_trait]
pub trait ExperimentGenerator: Send + Sync {
    /// Follow-up to `completed`, or `None` when there is nothing left to try.
    async fn next_experiment(&self, completed: &Experiment) -> SdlResult<Option<Experiment>>;
}

/// Steps a deposition template through a list of CA step voltages.
pub struct VoltageSweep {
    template: Experiment,
    voltages: Vec<f64>,
    cursor: Mutex<usize>,
}

impl VoltageSweep {
    pub fn new(template: Experiment, voltages: Vec<f64>) -> Self {
        Self {
            template,
            voltages,
            cursor: Mutex::new(0),
        }
    }
}

#[async_trait]
impl ExperimentGenerator for VoltageSweep {
    async fn next_experiment(&self, completed: &Experiment) -> SdlResult<Option<Experiment>> {
        let mut cursor = self.cursor.lock();
        let Some(&voltage) = self.voltages.get(*cursor) else {
            return Ok(None);
        };
        *cursor += 1;

        let mut params = self.template.params.echem().cloned().unwrap_or_default();
        params.ca.step_1_voltage = voltage;
        let mut next = self.template.clone();
        next.name = format!("{} {voltage:+.2} V", self.template.name);
        next.project_id = completed.project_id;
        next.project_campaign_id = completed.project_campaign_id;
        next.params = ProtocolParams::Echem(params);
        tracing::info!(after = completed.experiment_id, voltage, "Generated follow-up");
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ECHEM_DEPOSITION;

    #[tokio::test]
    async fn test_sweep_runs_out() {
        let sweep = VoltageSweep::new(
            Experiment::new("edot", ECHEM_DEPOSITION),
            vec![-1.6, -1.8],
        );
        let done = Experiment::new("seed", ECHEM_DEPOSITION).with_project(16, 3);

        let first = sweep.next_experiment(&done).await.unwrap().unwrap();
        assert_eq!(first.params.echem().map(|p| p.ca.step_1_voltage), Some(-1.6));
        assert_eq!(first.project_campaign_id, 3);
        assert!(sweep.next_experiment(&done).await.unwrap().is_some());
        assert!(sweep.next_experiment(&done).await.unwrap().is_none());
    }

    #[test]
    fn test_default_params_fill_in() {
        let params: EchemParams = ProtocolParams::Base.echem().cloned().unwrap_or_default();
        assert!(params.run_ca);
    }
}
