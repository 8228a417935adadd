//! Vial decapping and capping, confirmed by the line-break sensor.

use async_trait::async_trait;

use super::{Tool, Toolkit};
use crate::config::Config;
use crate::error::SdlResult;
use crate::labware::Coordinates;
use crate::retry::{run_confirmed, ConfirmedAction, Outcome, RetryPolicy};

/// Decapper settings derived from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DecapSettings {
    pub policy: RetryPolicy,
    /// Lift after gripping (mm)
    pub lift_mm: f64,
    /// Without the sensor every attempt is assumed to succeed
    pub sensor_available: bool,
}

impl DecapSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: RetryPolicy::from(&config.retry),
            lift_mm: config.resources.decap_lift_mm,
            sensor_available: config.retry.sensor_available,
        }
    }
}

struct Decap<'a> {
    toolkit: &'a Toolkit,
    top: Coordinates,
    settings: &'a DecapSettings,
}

#[async_trait]
impl ConfirmedAction for Decap<'_> {
    fn name(&self) -> &str {
        "decap"
    }

    async fn attempt(&mut self, _attempt: u32) -> SdlResult<bool> {
        self.toolkit.decapper.engage().await?;
        self.toolkit
            .motion
            .move_to(
                self.top.with_z(self.top.z + self.settings.lift_mm),
                Tool::Decapper,
            )
            .await?;
        if !self.settings.sensor_available {
            return Ok(true);
        }
        Ok(self.toolkit.sensor.line_break().await?)
    }

    async fn recover(&mut self) -> SdlResult<()> {
        self.toolkit.decapper.release().await?;
        self.toolkit.motion.move_to(self.top, Tool::Decapper).await?;
        Ok(())
    }
}

struct Cap<'a> {
    toolkit: &'a Toolkit,
    top: Coordinates,
    settings: &'a DecapSettings,
}

#[async_trait]
impl ConfirmedAction for Cap<'_> {
    fn name(&self) -> &str {
        "cap"
    }

    async fn attempt(&mut self, _attempt: u32) -> SdlResult<bool> {
        self.toolkit.motion.move_to(self.top, Tool::Decapper).await?;
        self.toolkit.decapper.release().await?;
        self.toolkit
            .motion
            .move_to(
                self.top.with_z(self.top.z + self.settings.lift_mm),
                Tool::Decapper,
            )
            .await?;
        if !self.settings.sensor_available {
            return Ok(true);
        }
        Ok(!self.toolkit.sensor.line_break().await?)
    }

    async fn recover(&mut self) -> SdlResult<()> {
        self.toolkit.decapper.engage().await?;
        Ok(())
    }
}

/// Remove the cap of the vial whose rim is at `top`.
pub async fn decap(toolkit: &Toolkit, top: Coordinates, settings: &DecapSettings) -> SdlResult<Outcome> {
    toolkit.motion.move_to(top, Tool::Decapper).await?;
    run_confirmed(
        &mut Decap {
            toolkit,
            top,
            settings,
        },
        &settings.policy,
    )
    .await
}

/// Put the held cap back on the vial whose rim is at `top`.
pub async fn cap(toolkit: &Toolkit, top: Coordinates, settings: &DecapSettings) -> SdlResult<Outcome> {
    run_confirmed(
        &mut Cap {
            toolkit,
            top,
            settings,
        },
        &settings.policy,
    )
    .await
}
