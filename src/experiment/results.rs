//! Append-only experiment results.
//!
//! Every file or value produced while an experiment runs is recorded as an
//! [`Artifact`]. Artifacts are written to the store as they are produced, so a
//! failed experiment keeps everything it generated up to the failure.
//!
//! ```text
//! Experiment
//!    ├── Artifact (ocp, "CA")      pass/fail + final voltage
//!    ├── Artifact (ca_data)        data file
//!    ├── Artifact (ocp, "CV")
//!    ├── Artifact (cv_data)
//!    └── Artifact (image)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// What an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Open-circuit potential check
    Ocp,
    /// Chronoamperometry data file
    CaData,
    /// Cyclic voltammetry data file
    CvData,
    /// Camera capture
    Image,
    /// Deposition charge or other derived scalar
    Metric,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Ocp => "ocp",
            ArtifactKind::CaData => "ca_data",
            ArtifactKind::CvData => "cv_data",
            ArtifactKind::Image => "image",
            ArtifactKind::Metric => "metric",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ocp" => Some(ArtifactKind::Ocp),
            "ca_data" => Some(ArtifactKind::CaData),
            "cv_data" => Some(ArtifactKind::CvData),
            "image" => Some(ArtifactKind::Image),
            "metric" => Some(ArtifactKind::Metric),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Step the artifact belongs to, e.g. "CA" or "CV"
    pub context: String,
    pub path: Option<PathBuf>,
    pub passed: Option<bool>,
    pub value: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, context: &str) -> Self {
        Self {
            kind,
            context: context.to_string(),
            path: None,
            passed: None,
            value: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_passed(mut self, passed: bool) -> Self {
        self.passed = Some(passed);
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }
}

/// Results accumulated by one experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    artifacts: Vec<Artifact>,
}

impl ExperimentResults {
    pub fn from_artifacts(artifacts: Vec<Artifact>) -> Self {
        Self { artifacts }
    }

    /// Append an artifact. There is no way to remove one.
    pub fn push(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Artifacts of one kind, in recording order.
    pub fn of_kind(&self, kind: ArtifactKind) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter().filter(move |a| a.kind == kind)
    }

    /// Paths of captured images.
    pub fn images(&self) -> Vec<&Path> {
        self.of_kind(ArtifactKind::Image)
            .filter_map(|a| a.path.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_keep_recording_order() {
        let mut results = ExperimentResults::default();
        results.push(
            Artifact::new(ArtifactKind::Ocp, "CA")
                .with_passed(true)
                .with_value(0.21),
        );
        results.push(Artifact::new(ArtifactKind::CaData, "CA").with_path("data/1_CA.txt"));
        results.push(Artifact::new(ArtifactKind::Image, "after").with_path("data/1.png"));

        assert_eq!(results.len(), 3);
        assert_eq!(results.artifacts()[0].kind, ArtifactKind::Ocp);
        assert_eq!(results.images(), vec![Path::new("data/1.png")]);
        assert_eq!(results.of_kind(ArtifactKind::CaData).count(), 1);
    }

    #[test]
    fn test_kind_strings() {
        for kind in [
            ArtifactKind::Ocp,
            ArtifactKind::CaData,
            ArtifactKind::CvData,
            ArtifactKind::Image,
            ArtifactKind::Metric,
        ] {
            assert_eq!(ArtifactKind::parse(kind.as_str()), Some(kind));
        }
    }
}
