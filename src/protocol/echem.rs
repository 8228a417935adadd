//! Electrodeposition followed by CV characterisation.

use async_trait::async_trait;

use super::{fill_well, image_well, Protocol, ProtocolContext, ECHEM_DEPOSITION};
use crate::error::{SdlError, SdlResult};
use crate::transfer::Source;

/// `echem_deposition`: fill with the deposition solution, CA deposit, rinse,
/// then CV in the characterisation solution before imaging and clearing.
///
/// Needs [`ProtocolParams::Echem`](crate::experiment::ProtocolParams) parameters.
pub struct EchemDeposition;

#[async_trait]
impl Protocol for EchemDeposition {
    fn id(&self) -> &str {
        ECHEM_DEPOSITION
    }

    async fn run(&self, ctx: &mut ProtocolContext<'_>) -> SdlResult<()> {
        let params = ctx
            .sm
            .experiment()
            .params
            .echem()
            .cloned()
            .ok_or_else(|| SdlError::InvalidParameter {
                name: "params".into(),
                reason: format!("{ECHEM_DEPOSITION} needs electrochemistry parameters"),
            })?;
        let well_id = ctx.well_id();

        if !params.flush_sol_name.is_empty() {
            ctx.transfer
                .flush_pipette(
                    ctx.sm,
                    ctx.ledger,
                    &params.flush_sol_name,
                    params.flush_sol_vol,
                    params.flush_count,
                )
                .await?;
        }

        fill_well(ctx).await?;
        ctx.transfer
            .mix_in_well(
                ctx.sm,
                ctx.ledger,
                &well_id,
                params.mix_volume,
                params.mix_count,
            )
            .await?;
        image_well(ctx, "before").await?;

        if params.run_ca {
            let well = ctx.ledger.get(&well_id)?.clone();
            ctx.echem.deposition(ctx.sm, &well, &params).await?;
            ctx.echem.retract().await?;
            ctx.transfer.clear_well(ctx.sm, ctx.ledger, &well_id).await?;
            ctx.transfer
                .rinse_well(
                    ctx.sm,
                    ctx.ledger,
                    &well_id,
                    &params.rinse.rinse_sol_name,
                    params.rinse.rinse_vol,
                    params.rinse.rinse_count,
                )
                .await?;
        }

        if params.run_cv {
            if !params.char_sol_name.is_empty() && params.char_vol > 0.0 {
                let source = if params.char_concentration > 0.0 {
                    Source::mixed(&params.char_sol_name, params.char_concentration)
                } else {
                    Source::solution(&params.char_sol_name)
                };
                ctx.transfer
                    .transfer(ctx.ledger, &source, &well_id, params.char_vol)
                    .await?;
            }
            let well = ctx.ledger.get(&well_id)?.clone();
            ctx.echem.characterization(ctx.sm, &well, &params).await?;
            ctx.echem.retract().await?;
            ctx.transfer.clear_well(ctx.sm, ctx.ledger, &well_id).await?;
        }

        image_well(ctx, "after").await
    }
}
