//! Protocols: the step list an experiment runs.
//!
//! Each experiment names a protocol id. The [`ProtocolRegistry`] maps ids to
//! [`Protocol`] implementations; protocols drive the hardware through a
//! [`ProtocolContext`] and announce every phase on the experiment's state
//! machine.
//!
//! # Built-ins
//!
//! - [`ECHEM_DEPOSITION`]: fill, OCP-checked CA deposition, rinse, OCP-checked
//!   CV characterisation, imaging
//! - [`RINSE_ONLY`]: fill with any listed solutions, then rinse and image

pub mod echem;
pub mod rinse;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::electrochem::Electrochemistry;
use crate::error::{SdlError, SdlResult};
use crate::experiment::{Artifact, ArtifactKind, ExperimentStateMachine, ExperimentStatus};
use crate::hardware::{AlertChannel, Tool, Toolkit};
use crate::labware::ResourceLedger;
use crate::transfer::{Source, TransferEngine};

pub use echem::EchemDeposition;
pub use rinse::RinseOnly;

/// Registry id of the electrodeposition protocol.
pub const ECHEM_DEPOSITION: &str = "echem_deposition";
/// Registry id of the rinse-only protocol.
pub const RINSE_ONLY: &str = "rinse_only";

/// Everything a protocol may touch while it runs.
pub struct ProtocolContext<'a> {
    pub sm: &'a mut ExperimentStateMachine,
    pub ledger: &'a mut ResourceLedger,
    pub transfer: &'a mut TransferEngine,
    pub echem: &'a Electrochemistry,
    pub toolkit: &'a Toolkit,
    pub data_dir: &'a Path,
    pub safe_z: f64,
}

impl ProtocolContext<'_> {
    pub fn well_id(&self) -> String {
        self.sm.experiment().well_id.clone()
    }
}

#[async_trait]
pub trait Protocol: Send + Sync {
    fn id(&self) -> &str;

    /// Run every step. Errors propagate to the scheduler, which marks the
    /// experiment ERROR.
    async fn run(&self, ctx: &mut ProtocolContext<'_>) -> SdlResult<()>;
}

/// Protocol lookup by id.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    protocols: HashMap<String, Arc<dyn Protocol>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in protocols.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchemDeposition));
        registry.register(Arc::new(RinseOnly));
        registry
    }

    /// Add or replace a protocol under its own id.
    pub fn register(&mut self, protocol: Arc<dyn Protocol>) {
        self.protocols.insert(protocol.id().to_string(), protocol);
    }

    pub fn get(&self, id: &str) -> SdlResult<Arc<dyn Protocol>> {
        self.protocols
            .get(id)
            .cloned()
            .ok_or_else(|| SdlError::ProtocolNotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.protocols.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Dispense every solution the experiment lists into its well.
pub async fn fill_well(ctx: &mut ProtocolContext<'_>) -> SdlResult<()> {
    let solutions = ctx.sm.experiment().solutions.clone();
    if solutions.is_empty() {
        return Ok(());
    }
    let well_id = ctx.well_id();
    ctx.sm
        .declare_step("fill well", ExperimentStatus::Pipetting)?;
    for (name, spec) in &solutions {
        let source = match spec.concentration {
            Some(c) => Source::mixed(name, c),
            None => Source::solution(name),
        };
        for _ in 0..spec.repeated {
            ctx.transfer
                .transfer(ctx.ledger, &source, &well_id, spec.volume)
                .await?;
        }
    }
    Ok(())
}

/// Photograph the well and share the image.
pub async fn image_well(ctx: &mut ProtocolContext<'_>, tag: &str) -> SdlResult<()> {
    let well = ctx.ledger.get(&ctx.well_id())?.clone();
    ctx.sm
        .declare_step(&format!("image {tag}"), ExperimentStatus::Imaging)?;
    ctx.toolkit
        .safe_move(
            well.coordinates.with_z(well.top()),
            Tool::Camera,
            ctx.safe_z,
        )
        .await?;
    let path = ctx
        .data_dir
        .join(format!("{}_image_{tag}.png", ctx.sm.experiment().file_stem()));
    let (path, ok) = ctx.toolkit.camera.capture(&path).await?;
    if !ok {
        tracing::warn!(tag, path = %path.display(), "Image capture reported failure");
    }
    ctx.sm.record_artifact(
        Artifact::new(ArtifactKind::Image, tag)
            .with_path(&path)
            .with_passed(ok),
    )?;
    if ok {
        ctx.toolkit
            .share_file(AlertChannel::Data, &path, &format!("well {} {tag}", well.id))
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = ProtocolRegistry::with_builtins();
        assert_eq!(registry.ids(), vec![ECHEM_DEPOSITION, RINSE_ONLY]);
        assert_eq!(registry.get(RINSE_ONLY).unwrap().id(), RINSE_ONLY);
        assert!(matches!(
            registry.get("pedot_v3"),
            Err(SdlError::ProtocolNotFound(id)) if id == "pedot_v3"
        ));
    }
}
