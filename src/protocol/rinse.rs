//! Fill, rinse and photograph a well.

use async_trait::async_trait;

use super::{fill_well, image_well, Protocol, ProtocolContext, RINSE_ONLY};
use crate::error::SdlResult;

/// `rinse_only`: no electrochemistry.
pub struct RinseOnly;

#[async_trait]
impl Protocol for RinseOnly {
    fn id(&self) -> &str {
        RINSE_ONLY
    }

    async fn run(&self, ctx: &mut ProtocolContext<'_>) -> SdlResult<()> {
        let rinse = ctx
            .sm
            .experiment()
            .params
            .rinse()
            .cloned()
            .unwrap_or_default();
        let well_id = ctx.well_id();

        fill_well(ctx).await?;
        ctx.transfer.clear_well(ctx.sm, ctx.ledger, &well_id).await?;
        ctx.transfer
            .rinse_well(
                ctx.sm,
                ctx.ledger,
                &well_id,
                &rinse.rinse_sol_name,
                rinse.rinse_vol,
                rinse.rinse_count,
            )
            .await?;
        image_well(ctx, "rinsed").await
    }
}
