//! Hardware capabilities, the confirmed decap/cap sequences, and simulated devices.

pub mod decapper;
pub mod mock;
pub mod ports;

pub use ports::{
    AlertChannel, AlertPort, CameraPort, DecapperPort, MotionPort, OcpReading, PotentiostatPort,
    PumpPort, SensorPort, Tool,
};

use std::path::Path;
use std::sync::Arc;

use crate::error::SdlResult;
use crate::labware::Coordinates;

/// Handles to every device the control core drives.
#[derive(Clone)]
pub struct Toolkit {
    pub motion: Arc<dyn MotionPort>,
    pub sensor: Arc<dyn SensorPort>,
    pub decapper: Arc<dyn DecapperPort>,
    pub pump: Arc<dyn PumpPort>,
    pub potentiostat: Arc<dyn PotentiostatPort>,
    pub camera: Arc<dyn CameraPort>,
    pub alerts: Arc<dyn AlertPort>,
}

impl Toolkit {
    /// Move `tool` to `target` by way of `safe_z`: up, across, then down.
    pub async fn safe_move(&self, target: Coordinates, tool: Tool, safe_z: f64) -> SdlResult<()> {
        let current = self.motion.position(tool).await?;
        if current.x != target.x || current.y != target.y {
            if current.z < safe_z {
                self.motion.move_to(current.with_z(safe_z), tool).await?;
            }
            self.motion.move_to(target.with_z(safe_z), tool).await?;
        }
        self.motion.move_to(target, tool).await?;
        Ok(())
    }

    /// Best-effort operator notification; a failing alert channel never stops the run.
    pub async fn notify(&self, channel: AlertChannel, message: &str) {
        if let Err(e) = self.alerts.send(channel, message).await {
            tracing::warn!(%channel, error = %e, "Failed to send notification");
        }
    }

    /// Best-effort file share.
    pub async fn share_file(&self, channel: AlertChannel, path: &Path, caption: &str) {
        if let Err(e) = self.alerts.send_file(channel, path, caption).await {
            tracing::warn!(%channel, path = %path.display(), error = %e, "Failed to share file");
        }
    }
}
