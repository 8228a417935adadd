//! Experiment records and their lifecycle.
//!
//! An [`Experiment`] is a unit of work bound to one well. Its status is
//! advanced exclusively through [`ExperimentStateMachine::declare_step`], which
//! mirrors the status onto the well in the same store transaction.
//!
//! # Example
//!
//! ```rust,ignore
//! use sdl_core::experiment::{Experiment, SolutionSpec};
//!
//! let experiment = Experiment::new("edot sweep", "echem_deposition")
//!     .with_priority(1)
//!     .with_solution("edot", SolutionSpec::new(120.0).with_concentration(0.01));
//! ```

pub mod params;
pub mod results;
pub mod state_machine;
pub mod status;

pub use params::{CaWaveform, CvWaveform, EchemParams, ProtocolParams, RinseParams};
pub use results::{Artifact, ArtifactKind, ExperimentResults};
pub use state_machine::ExperimentStateMachine;
pub use status::ExperimentStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How much of a solution an experiment needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionSpec {
    /// Volume per use (uL)
    pub volume: f64,
    /// Target concentration (mM); `None` takes whatever the stock holds
    #[serde(default)]
    pub concentration: Option<f64>,
    /// Number of times the volume is dispensed
    #[serde(default = "one")]
    pub repeated: u32,
}

fn one() -> u32 {
    1
}

impl SolutionSpec {
    pub fn new(volume: f64) -> Self {
        Self {
            volume,
            concentration: None,
            repeated: 1,
        }
    }

    pub fn with_concentration(mut self, concentration: f64) -> Self {
        self.concentration = Some(concentration);
        self
    }

    pub fn with_repeated(mut self, repeated: u32) -> Self {
        self.repeated = repeated;
        self
    }

    /// Volume consumed over every repetition.
    pub fn total_volume(&self) -> f64 {
        self.volume * f64::from(self.repeated)
    }
}

/// A unit of work bound to one well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Assigned by the store on enqueue; 0 until then
    pub experiment_id: i64,
    pub name: String,
    /// Lower runs first
    pub priority: i64,
    pub well_id: String,
    /// Plate the well belongs to; the active plate when unset
    pub plate_id: Option<i64>,
    pub project_id: i64,
    pub project_campaign_id: i64,
    /// Registry key of the protocol to run
    pub protocol_id: String,
    /// Lowercase solution name to requirement
    pub solutions: BTreeMap<String, SolutionSpec>,
    pub status: ExperimentStatus,
    pub status_date: DateTime<Utc>,
    pub params: ProtocolParams,
    pub results: ExperimentResults,
    /// Set once results are saved, cleared by the analyzer
    pub needs_analysis: bool,
}

impl Experiment {
    /// New experiment with default parameters for `protocol_id`.
    pub fn new(name: &str, protocol_id: &str) -> Self {
        Self {
            experiment_id: 0,
            name: name.to_string(),
            priority: 0,
            well_id: String::new(),
            plate_id: None,
            project_id: 999,
            project_campaign_id: 0,
            protocol_id: protocol_id.to_string(),
            solutions: BTreeMap::new(),
            status: ExperimentStatus::New,
            status_date: Utc::now(),
            params: ProtocolParams::for_protocol(protocol_id),
            results: ExperimentResults::default(),
            needs_analysis: false,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_well(mut self, well_id: &str) -> Self {
        self.well_id = well_id.to_string();
        self
    }

    pub fn with_project(mut self, project_id: i64, campaign_id: i64) -> Self {
        self.project_id = project_id;
        self.project_campaign_id = campaign_id;
        self
    }

    pub fn with_solution(mut self, name: &str, spec: SolutionSpec) -> Self {
        self.solutions.insert(name.trim().to_lowercase(), spec);
        self
    }

    pub fn with_params(mut self, params: ProtocolParams) -> Self {
        self.params = params;
        self
    }

    /// Prefix for data files: `{project}_{campaign}_{experiment}_{well}`.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.project_id, self.project_campaign_id, self.experiment_id, self.well_id
        )
    }

    /// Total volume of each solution the experiment will draw, including
    /// solutions named only in protocol parameters.
    pub fn required_volumes(&self) -> BTreeMap<String, f64> {
        let mut required: BTreeMap<String, f64> = BTreeMap::new();
        for (name, spec) in &self.solutions {
            *required.entry(name.clone()).or_insert(0.0) += spec.total_volume();
        }
        if let Some(echem) = self.params.echem() {
            if !echem.flush_sol_name.is_empty() {
                *required.entry(echem.flush_sol_name.clone()).or_insert(0.0) +=
                    echem.flush_sol_vol * f64::from(echem.flush_count);
            }
            if !echem.char_sol_name.is_empty() && echem.run_cv {
                *required.entry(echem.char_sol_name.clone()).or_insert(0.0) += echem.char_vol;
            }
        }
        if let Some(rinse) = self.params.rinse() {
            if !rinse.rinse_sol_name.is_empty() && rinse.rinse_count > 0 {
                *required.entry(rinse.rinse_sol_name.clone()).or_insert(0.0) +=
                    rinse.rinse_vol * f64::from(rinse.rinse_count);
            }
        }
        required.retain(|_, v| *v > 0.0);
        required
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ECHEM_DEPOSITION, RINSE_ONLY};

    #[test]
    fn test_required_volumes_include_repeats_and_rinses() {
        let experiment = Experiment::new("dep", ECHEM_DEPOSITION)
            .with_solution("EDOT", SolutionSpec::new(100.0).with_repeated(2))
            .with_solution("rinse", SolutionSpec::new(10.0));
        let required = experiment.required_volumes();
        assert_eq!(required["edot"], 200.0);
        // 10 from the solution list plus 4 x 120 from the default rinse
        assert_eq!(required["rinse"], 490.0);
    }

    #[test]
    fn test_base_protocols_only_need_listed_solutions() {
        let experiment = Experiment::new("custom", "custom_protocol")
            .with_solution("water", SolutionSpec::new(50.0));
        assert_eq!(experiment.required_volumes().len(), 1);

        let rinse = Experiment::new("rinse", RINSE_ONLY);
        assert_eq!(rinse.required_volumes()["rinse"], 480.0);
    }

    #[test]
    fn test_file_stem() {
        let mut experiment = Experiment::new("x", RINSE_ONLY)
            .with_well("B3")
            .with_project(16, 2);
        experiment.experiment_id = 1042;
        assert_eq!(experiment.file_stem(), "16_2_1042_B3");
    }
}
