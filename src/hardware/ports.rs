//! Capability traits for the lab hardware.
//!
//! Each device family is a narrow async trait. The control core only ever
//! holds `Arc<dyn ...>` handles, so simulated and real drivers are
//! interchangeable. Driver failures are reported as `anyhow::Error`; the core
//! wraps them into [`crate::error::SdlError::Driver`].

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::experiment::{CaWaveform, CvWaveform};
use crate::labware::Coordinates;

/// Tool mounted on the gantry head. Each has its own offset from the spindle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Pipette,
    Electrode,
    Decapper,
    Camera,
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tool::Pipette => "pipette",
            Tool::Electrode => "electrode",
            Tool::Decapper => "decapper",
            Tool::Camera => "camera",
        };
        f.write_str(name)
    }
}

/// Gantry motion.
#[async_trait]
pub trait MotionPort: Send + Sync {
    async fn home(&self) -> Result<()>;
    /// Move `tool` to `target`, returning the reached position.
    async fn move_to(&self, target: Coordinates, tool: Tool) -> Result<Coordinates>;
    async fn position(&self, tool: Tool) -> Result<Coordinates>;
    async fn set_feed_rate(&self, mm_per_min: f64) -> Result<()>;
}

/// Digital sensors on the controller board.
#[async_trait]
pub trait SensorPort: Send + Sync {
    /// `true` while the decapper line-break beam is interrupted (cap held).
    async fn line_break(&self) -> Result<bool>;
}

/// Electromagnet on the decapper head.
#[async_trait]
pub trait DecapperPort: Send + Sync {
    async fn engage(&self) -> Result<()>;
    async fn release(&self) -> Result<()>;
}

/// Syringe pump behind the pipette tip.
#[async_trait]
pub trait PumpPort: Send + Sync {
    async fn withdraw(&self, volume_ul: f64) -> Result<()>;
    /// Dispense `volume_ul` of liquid followed by `blowout_ul` of air.
    async fn infuse(&self, volume_ul: f64, blowout_ul: f64) -> Result<()>;
}

/// Result of an open-circuit potential measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcpReading {
    pub passed: bool,
    /// Potential at the end of the measurement (V)
    pub final_voltage: f64,
    pub data: PathBuf,
}

/// Potentiostat techniques.
#[async_trait]
pub trait PotentiostatPort: Send + Sync {
    async fn run_ocp(&self, output: &Path) -> Result<OcpReading>;
    /// Run chronoamperometry, returning the data file.
    async fn run_ca(&self, waveform: &CaWaveform, output: &Path) -> Result<PathBuf>;
    /// Run cyclic voltammetry, returning the data file.
    async fn run_cv(&self, waveform: &CvWaveform, output: &Path) -> Result<PathBuf>;
}

/// Inspection camera.
#[async_trait]
pub trait CameraPort: Send + Sync {
    /// Capture to `path`, returning the written file and whether it is usable.
    async fn capture(&self, path: &Path) -> Result<(PathBuf, bool)>;
}

/// Operator messaging channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertChannel {
    /// Faults needing a human
    Alert,
    /// Result files and images
    Data,
    /// Progress notices; also where operator commands arrive
    Conversation,
}

impl fmt::Display for AlertChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertChannel::Alert => "alert",
            AlertChannel::Data => "data",
            AlertChannel::Conversation => "conversation",
        };
        f.write_str(name)
    }
}

/// Operator notifications and the command channel.
#[async_trait]
pub trait AlertPort: Send + Sync {
    async fn send(&self, channel: AlertChannel, message: &str) -> Result<()>;
    async fn send_file(&self, channel: AlertChannel, path: &Path, caption: &str) -> Result<()>;
    /// Commands received since the last poll, oldest first.
    async fn poll_commands(&self) -> Result<Vec<String>>;
}
