//! Liquid transfer between vessels.
//!
//! [`TransferEngine`] turns "move V uL of X into well A1" into pump and gantry
//! moves: it picks source vials (mixing several when a concentration is
//! requested), rejects illegal directions, splits volumes the pipette cannot
//! hold in one pass, compensates for viscosity, brackets the liquid with an
//! air gap and a drip stop, and uncaps and recaps vials on the way.
//!
//! The ledger is debited and credited pass by pass, so a failure in the middle
//! of a split transfer leaves the books matching what physically moved. Any
//! liquid stranded in the tip is dumped by [`TransferEngine::purge_pipette`].

use std::fmt;

use crate::config::Config;
use crate::error::{ResourceError, SdlError, SdlResult};
use crate::experiment::{ExperimentStateMachine, ExperimentStatus};
use crate::hardware::decapper::{self, DecapSettings};
use crate::hardware::{Tool, Toolkit};
use crate::labware::{Contents, ResourceLedger, Vessel, VesselKind};
use crate::mixing::{self, DrawBounds, MixSource};

const VOLUME_EPSILON: f64 = 1e-6;
const MAX_REPETITIONS: u32 = 100;

/// Waste vials are all named this.
pub const WASTE: &str = "waste";

/// Calibrated pump corrections: `(viscosity cP, slope, intercept)`.
const VISCOSITY_CORRECTIONS: [(f64, f64, f64); 4] = [
    (0.91, 1.01, 6.23),
    (3.06, 1.03, 4.91),
    (9.96, 1.03, 2.78),
    (31.88, 1.02, -3.68),
];

/// Volume the pump must move to deliver `volume` of a liquid with the given
/// viscosity. Uncalibrated viscosities are delivered as asked.
pub fn viscosity_corrected(volume: f64, viscosity_cp: f64) -> f64 {
    VISCOSITY_CORRECTIONS
        .iter()
        .find(|(cp, _, _)| (cp - viscosity_cp).abs() < 0.005)
        .map(|(_, slope, intercept)| (slope * volume + intercept).max(0.0))
        .unwrap_or(volume)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Where liquid comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Any stock of the named solution. With a concentration, several vials
    /// may be mixed to hit it.
    Solution {
        name: String,
        concentration: Option<f64>,
    },
    /// One specific vessel.
    Vessel(String),
}

impl Source {
    pub fn solution(name: &str) -> Self {
        Source::Solution {
            name: name.trim().to_lowercase(),
            concentration: None,
        }
    }

    pub fn mixed(name: &str, concentration: f64) -> Self {
        Source::Solution {
            name: name.trim().to_lowercase(),
            concentration: Some(concentration),
        }
    }

    pub fn vessel(id: &str) -> Self {
        Source::Vessel(id.to_string())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Solution {
                name,
                concentration: Some(c),
            } => write!(f, "{name} @ {c} mM"),
            Source::Solution { name, .. } => f.write_str(name),
            Source::Vessel(id) => write!(f, "vessel {id}"),
        }
    }
}

/// Reject directions that would contaminate a source.
pub fn check_direction(from: &Vessel, to: &Vessel) -> SdlResult<()> {
    let illegal = match (from.kind, to.kind) {
        (VesselKind::Well, VesselKind::Stock) => Some("well to stock"),
        (VesselKind::Waste, VesselKind::Well) => Some("waste to well"),
        (VesselKind::Stock, VesselKind::Stock) => Some("stock to stock"),
        _ => None,
    };
    match illegal {
        Some(what) => Err(SdlError::InvalidTransfer(format!(
            "{what} is not allowed ({} -> {})",
            from.id, to.id
        ))),
        None => Ok(()),
    }
}

/// Liquid and air currently held in the pipette tip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipette {
    pub capacity: f64,
    contents: Contents,
    liquid: f64,
    air: f64,
}

impl Pipette {
    pub fn new(capacity: f64) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Liquid only; air gap and drip stop are excluded.
    pub fn liquid_volume(&self) -> f64 {
        self.liquid
    }

    pub fn air_volume(&self) -> f64 {
        self.air
    }

    pub fn contents(&self) -> &Contents {
        &self.contents
    }

    pub fn is_empty(&self) -> bool {
        self.liquid < VOLUME_EPSILON && self.air < VOLUME_EPSILON
    }

    fn take_air(&mut self, volume: f64) {
        self.air += volume;
    }

    fn aspirate(&mut self, contents: &Contents, volume: f64) {
        for (key, qty) in contents {
            *self.contents.entry(key.clone()).or_insert(0.0) += qty;
        }
        self.liquid += volume;
    }

    /// Empty the tip, returning what was in it.
    fn expel(&mut self) -> (Contents, f64) {
        self.air = 0.0;
        let volume = std::mem::take(&mut self.liquid);
        (std::mem::take(&mut self.contents), volume)
    }
}

/// Pipetting parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSettings {
    pub pipette_capacity: f64,
    pub air_gap: f64,
    pub drip_stop: f64,
    /// Extra air drawn and blown out when the source is a well
    pub well_extra: f64,
    pub safe_z: f64,
    /// Fraction of stock capacity never drawn by solution lookups
    pub reserve_fraction: f64,
    pub bounds: DrawBounds,
    pub decap: DecapSettings,
}

impl TransferSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pipette_capacity: config.pipetting.pipette_capacity_ul,
            air_gap: config.pipetting.air_gap_ul,
            drip_stop: config.pipetting.drip_stop_ul,
            well_extra: config.pipetting.well_extra_withdraw_ul,
            safe_z: config.pipetting.safe_z,
            reserve_fraction: config.resources.stock_reserve_fraction,
            bounds: DrawBounds::from(&config.mixing),
            decap: DecapSettings::from_config(config),
        }
    }

    fn overhead(&self, source: &Vessel) -> f64 {
        let extra = if source.kind == VesselKind::Well {
            self.well_extra
        } else {
            0.0
        };
        self.air_gap + self.drip_stop + extra
    }

    /// Pass volumes for moving `volume` out of `source`.
    ///
    /// Each pass leaves room for the air gap, the drip stop and, from a well,
    /// the extra air. Passes are rounded to 0.01 uL with the last one taking
    /// the remainder, so they sum to `volume` and every one of them, after
    /// viscosity correction, fits the pipette.
    pub fn split(&self, volume: f64, source: &Vessel) -> SdlResult<Vec<f64>> {
        let overhead = self.overhead(source);
        let usable = self.pipette_capacity - overhead;
        if usable <= 0.0 {
            return Err(SdlError::Configuration(format!(
                "pipette capacity {} leaves no room after {} uL of air",
                self.pipette_capacity, overhead
            )));
        }
        let fits = |pass: &f64| {
            viscosity_corrected(*pass, source.viscosity_cp) + overhead
                <= self.pipette_capacity + VOLUME_EPSILON
        };
        let mut repetitions = ((volume / usable).ceil() as u32).max(1);
        loop {
            if repetitions > MAX_REPETITIONS {
                return Err(SdlError::InvalidTransfer(format!(
                    "{volume} uL from {} needs more than {MAX_REPETITIONS} passes",
                    source.id
                )));
            }
            let each = round2(volume / f64::from(repetitions));
            let mut passes = vec![each; repetitions as usize - 1];
            passes.push(volume - each * f64::from(repetitions - 1));
            if passes.iter().all(fits) {
                return Ok(passes);
            }
            repetitions += 1;
        }
    }
}

/// Moves liquid and keeps the ledger in step with it.
pub struct TransferEngine {
    toolkit: Toolkit,
    settings: TransferSettings,
    pipette: Pipette,
}

impl TransferEngine {
    pub fn new(toolkit: Toolkit, settings: TransferSettings) -> Self {
        let pipette = Pipette::new(settings.pipette_capacity);
        Self {
            toolkit,
            settings,
            pipette,
        }
    }

    pub fn pipette(&self) -> &Pipette {
        &self.pipette
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn toolkit(&self) -> &Toolkit {
        &self.toolkit
    }

    /// Decide which vessels to draw from and how much from each.
    pub fn plan_draws(
        &self,
        ledger: &ResourceLedger,
        source: &Source,
        volume: f64,
    ) -> SdlResult<Vec<(String, f64)>> {
        match source {
            Source::Vessel(id) => {
                ledger.get(id)?.check_withdraw(volume)?;
                Ok(vec![(id.clone(), volume)])
            }
            Source::Solution {
                name,
                concentration: None,
            } => {
                let reserve = self.settings.reserve_fraction;
                if let Ok(vial) = ledger.select_stock(name, volume, reserve) {
                    return Ok(vec![(vial.id.clone(), volume)]);
                }
                // No single vial has the headroom; take what each one can spare.
                let mut remaining = volume;
                let mut draws = Vec::new();
                for vial in ledger.stock_sources(name) {
                    if remaining <= VOLUME_EPSILON {
                        break;
                    }
                    let headroom = vial.volume - reserve * vial.capacity;
                    if headroom <= VOLUME_EPSILON {
                        continue;
                    }
                    let draw = remaining.min(headroom);
                    draws.push((vial.id.clone(), draw));
                    remaining -= draw;
                }
                if remaining > VOLUME_EPSILON {
                    return Err(ResourceError::NoAvailableSolution(name.clone()).into());
                }
                tracing::info!(solution = %name, volume, draws = ?draws, "Drawing from several vials");
                Ok(draws)
            }
            Source::Solution {
                name,
                concentration: Some(target),
            } => {
                let candidates: Vec<MixSource> = ledger
                    .stock_sources(name)
                    .into_iter()
                    .filter(|v| v.volume - self.settings.reserve_fraction * v.capacity > 0.0)
                    .map(|v| MixSource::new(&v.id, v.concentration))
                    .collect();
                if candidates.is_empty() {
                    return Err(ResourceError::NoAvailableSolution(name.clone()).into());
                }
                let plan = mixing::solve(&candidates, volume, *target, self.settings.bounds)
                    .ok_or_else(|| SdlError::MixInfeasible {
                        solution: name.clone(),
                        concentration: *target,
                    })?;
                for (id, draw) in plan.used() {
                    let vial = ledger.get(id)?;
                    if vial.volume - self.settings.reserve_fraction * vial.capacity <= draw {
                        return Err(ResourceError::NoAvailableSolution(name.clone()).into());
                    }
                }
                if plan.deviation > 0.0 {
                    tracing::warn!(solution = %name, target, deviation = plan.deviation, "Mix misses target");
                }
                tracing::debug!(solution = %name, target, draws = ?plan.draws, "Mix planned");
                Ok(plan
                    .used()
                    .map(|(id, draw)| (id.to_string(), draw))
                    .collect())
            }
        }
    }

    /// Move `volume` uL from `source` into vessel `destination`.
    ///
    /// Everything that can be checked without moving is checked first:
    /// source selection, direction, destination capacity.
    pub async fn transfer(
        &mut self,
        ledger: &mut ResourceLedger,
        source: &Source,
        destination: &str,
        volume: f64,
    ) -> SdlResult<()> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(ResourceError::InvalidVolume(volume).into());
        }
        if volume < VOLUME_EPSILON {
            return Ok(());
        }
        let dest = ledger.get(destination)?.clone();
        if let Source::Vessel(id) = source {
            check_direction(ledger.get(id)?, &dest)?;
        }
        let draws = self.plan_draws(ledger, source, volume)?;
        for (id, _) in &draws {
            check_direction(ledger.get(id)?, &dest)?;
        }
        dest.check_deposit(volume)?;

        tracing::info!(%source, destination, volume, vials = draws.len(), "Transfer");
        for (id, draw) in draws {
            let from = ledger.get(&id)?.clone();
            for pass in self.settings.split(draw, &from)? {
                self.single_pass(ledger, &id, destination, pass).await?;
            }
        }
        Ok(())
    }

    async fn single_pass(
        &mut self,
        ledger: &mut ResourceLedger,
        from_id: &str,
        to_id: &str,
        volume: f64,
    ) -> SdlResult<()> {
        let from = ledger.get(from_id)?.clone();
        let safe_z = self.settings.safe_z;
        let pump_volume = viscosity_corrected(volume, from.viscosity_cp);
        let extra = if from.kind == VesselKind::Well {
            self.settings.well_extra
        } else {
            0.0
        };

        self.toolkit.pump.withdraw(self.settings.air_gap).await?;
        self.pipette.take_air(self.settings.air_gap);

        let capped = self.uncap(&from).await?;
        self.toolkit
            .safe_move(
                from.coordinates.with_z(from.withdrawal_height()),
                Tool::Pipette,
                safe_z,
            )
            .await?;
        self.toolkit.pump.withdraw(pump_volume).await?;
        let removed = ledger.withdraw(from_id, volume)?;
        self.pipette.aspirate(&removed, volume);

        self.toolkit
            .motion
            .move_to(from.coordinates.with_z(from.top()), Tool::Pipette)
            .await?;
        self.toolkit
            .pump
            .withdraw(self.settings.drip_stop + extra)
            .await?;
        self.pipette.take_air(self.settings.drip_stop + extra);
        if capped {
            self.recap(&from).await?;
        }

        let to = ledger.get(to_id)?.clone();
        let capped = self.uncap(&to).await?;
        self.toolkit
            .safe_move(to.coordinates.with_z(to.top()), Tool::Pipette, safe_z)
            .await?;
        self.toolkit
            .pump
            .infuse(pump_volume, self.pipette.air_volume())
            .await?;
        let (contents, liquid) = self.pipette.expel();
        ledger.deposit(to_id, &contents, liquid)?;
        if capped {
            self.recap(&to).await?;
        }
        Ok(())
    }

    /// Vials are capped; wells are open.
    async fn uncap(&self, vessel: &Vessel) -> SdlResult<bool> {
        if vessel.kind == VesselKind::Well {
            return Ok(false);
        }
        let top = vessel.coordinates.with_z(vessel.top());
        decapper::decap(&self.toolkit, top, &self.settings.decap)
            .await?
            .require("decap")?;
        Ok(true)
    }

    async fn recap(&self, vessel: &Vessel) -> SdlResult<()> {
        let top = vessel.coordinates.with_z(vessel.top());
        decapper::cap(&self.toolkit, top, &self.settings.decap)
            .await?
            .require("cap")?;
        Ok(())
    }

    /// Dump anything left in the tip into a waste vial.
    pub async fn purge_pipette(&mut self, ledger: &mut ResourceLedger) -> SdlResult<()> {
        if self.pipette.is_empty() {
            return Ok(());
        }
        let liquid = self.pipette.liquid_volume();
        tracing::warn!(liquid, air = self.pipette.air_volume(), "Purging pipette");
        if liquid < VOLUME_EPSILON {
            self.toolkit.pump.infuse(0.0, self.pipette.air_volume()).await?;
            self.pipette.expel();
            return Ok(());
        }
        let waste = ledger.select_waste(WASTE, liquid)?.clone();
        let capped = self.uncap(&waste).await?;
        self.toolkit
            .safe_move(
                waste.coordinates.with_z(waste.top()),
                Tool::Pipette,
                self.settings.safe_z,
            )
            .await?;
        self.toolkit
            .pump
            .infuse(liquid, self.pipette.air_volume())
            .await?;
        let (contents, volume) = self.pipette.expel();
        ledger.deposit(&waste.id, &contents, volume)?;
        if capped {
            self.recap(&waste).await?;
        }
        Ok(())
    }

    /// Draw `volume` of a solution `count` times and discard it, priming the tip.
    pub async fn flush_pipette(
        &mut self,
        sm: &mut ExperimentStateMachine,
        ledger: &mut ResourceLedger,
        solution: &str,
        volume: f64,
        count: u32,
    ) -> SdlResult<()> {
        if count == 0 || volume <= 0.0 {
            return Ok(());
        }
        sm.declare_step("flush pipette", ExperimentStatus::Flushing)?;
        for _ in 0..count {
            let waste = ledger.select_waste(WASTE, volume)?.id.clone();
            self.transfer(ledger, &Source::solution(solution), &waste, volume)
                .await?;
        }
        Ok(())
    }

    /// Empty a well into waste.
    pub async fn clear_well(
        &mut self,
        sm: &mut ExperimentStateMachine,
        ledger: &mut ResourceLedger,
        well_id: &str,
    ) -> SdlResult<()> {
        sm.declare_step("clear well", ExperimentStatus::Clearing)?;
        self.drain(ledger, well_id).await
    }

    async fn drain(&mut self, ledger: &mut ResourceLedger, well_id: &str) -> SdlResult<()> {
        let volume = ledger.get(well_id)?.volume;
        if volume < VOLUME_EPSILON {
            return Ok(());
        }
        let waste = ledger.select_waste(WASTE, volume)?.id.clone();
        self.transfer(ledger, &Source::vessel(well_id), &waste, volume)
            .await
    }

    /// Fill the well with rinse solution and empty it, `count` times.
    pub async fn rinse_well(
        &mut self,
        sm: &mut ExperimentStateMachine,
        ledger: &mut ResourceLedger,
        well_id: &str,
        solution: &str,
        volume: f64,
        count: u32,
    ) -> SdlResult<()> {
        if count == 0 {
            return Ok(());
        }
        sm.declare_step("rinse well", ExperimentStatus::Rinsing)?;
        self.drain(ledger, well_id).await?;
        for i in 0..count {
            tracing::debug!(well_id, rinse = i + 1, count, "Rinse");
            self.transfer(ledger, &Source::solution(solution), well_id, volume)
                .await?;
            self.drain(ledger, well_id).await?;
        }
        Ok(())
    }

    /// Aspirate and dispense in place. The ledger does not change.
    pub async fn mix_in_well(
        &mut self,
        sm: &mut ExperimentStateMachine,
        ledger: &ResourceLedger,
        well_id: &str,
        volume: f64,
        cycles: u32,
    ) -> SdlResult<()> {
        if cycles == 0 {
            return Ok(());
        }
        sm.declare_step("mix", ExperimentStatus::Mixing)?;
        let well = ledger.get(well_id)?.clone();
        let volume = volume
            .min(well.volume)
            .min(self.settings.pipette_capacity - self.settings.air_gap);
        if volume <= 0.0 {
            return Ok(());
        }
        self.toolkit
            .safe_move(
                well.coordinates.with_z(well.withdrawal_height()),
                Tool::Pipette,
                self.settings.safe_z,
            )
            .await?;
        for _ in 0..cycles {
            self.toolkit.pump.withdraw(volume).await?;
            self.toolkit.pump.infuse(volume, 0.0).await?;
        }
        self.toolkit
            .motion
            .move_to(well.coordinates.with_z(well.top()), Tool::Pipette)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Experiment;
    use crate::hardware::mock::MockRig;
    use crate::labware::Coordinates;
    use crate::protocol::RINSE_ONLY;
    use crate::scheduler::queue::enqueue;
    use crate::store::{PlateRecord, SqliteStore, Store};
    use std::sync::Arc;

    struct Bench {
        store: Arc<SqliteStore>,
        rig: MockRig,
        ledger: ResourceLedger,
        engine: TransferEngine,
    }

    fn bench() -> Bench {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .add_plate(PlateRecord { id: 1, type_id: 4 }, true)
            .unwrap();
        let vials = [
            Vessel::stock("s0", "edot", 20000.0, 0.01).at(Coordinates::new(-20.0, -40.0, -70.0)),
            Vessel::stock("s1", "kcl", 20000.0, 10.0).at(Coordinates::new(-20.0, -70.0, -70.0)),
            Vessel::stock("s2", "kcl", 20000.0, 100.0).at(Coordinates::new(-20.0, -100.0, -70.0)),
            Vessel::stock("s3", "rinse", 20000.0, 0.0).at(Coordinates::new(-20.0, -130.0, -70.0)),
            Vessel::waste("w0", 20000.0).at(Coordinates::new(-20.0, -160.0, -70.0)),
            Vessel::well("A1", 1, 500.0).at(Coordinates::new(-220.0, -45.0, -75.0)),
            Vessel::well("A2", 1, 300.0).at(Coordinates::new(-211.0, -45.0, -75.0)),
        ];
        for v in &vials {
            store.upsert_vessel(v).unwrap();
        }
        let ledger = ResourceLedger::load(store.clone()).unwrap();
        let rig = MockRig::new();
        let mut config = Config::default();
        config.retry.settle_delay_ms = 1;
        let engine = TransferEngine::new(rig.toolkit(), TransferSettings::from_config(&config));
        Bench {
            store,
            rig,
            ledger,
            engine,
        }
    }

    fn total_liquid(ledger: &ResourceLedger) -> f64 {
        ledger.vessels().map(|v| v.volume).sum()
    }

    #[test]
    fn test_viscosity_table() {
        assert_eq!(viscosity_corrected(100.0, 1.0), 100.0);
        assert!((viscosity_corrected(100.0, 0.91) - 107.23).abs() < 1e-9);
        assert!((viscosity_corrected(100.0, 31.88) - 98.32).abs() < 1e-9);
    }

    #[test]
    fn test_split_respects_pipette_room() {
        let settings = TransferSettings::from_config(&Config::default());
        let vial = Vessel::stock("s0", "edot", 20000.0, 0.01);
        // 200 - 40 air gap - 5 drip stop leaves 155 per pass
        let passes = settings.split(400.0, &vial).unwrap();
        assert_eq!(passes.len(), 3);
        assert!((passes.iter().sum::<f64>() - 400.0).abs() < 1e-9);

        let well = Vessel::well("A1", 1, 300.0);
        // the extra 20 uL of air leaves 135 per pass
        assert_eq!(settings.split(140.0, &well).unwrap().len(), 2);
        assert_eq!(settings.split(0.5, &vial).unwrap(), vec![0.5]);
    }

    #[test]
    fn test_split_passes_fit_after_rounding() {
        let settings = TransferSettings::from_config(&Config::default());
        let sources = [
            Vessel::stock("s0", "edot", 20000.0, 0.01),
            Vessel::stock("s1", "dmso", 20000.0, 0.0).with_viscosity(0.91),
            Vessel::well("A1", 1, 300.0),
        ];
        for source in &sources {
            let room = settings.pipette_capacity - settings.overhead(source);
            for volume in [155.0, 310.0, 310.02, 465.02, 999.99, 1000.0] {
                let passes = settings.split(volume, source).unwrap();
                assert!((passes.iter().sum::<f64>() - volume).abs() < 1e-9);
                for pass in &passes {
                    assert!(*pass > 0.0);
                    assert!(
                        viscosity_corrected(*pass, source.viscosity_cp) <= room + 1e-6,
                        "{volume} uL from {} has a {pass} uL pass",
                        source.id
                    );
                }
            }
        }
    }

    #[test]
    fn test_direction_rules() {
        let stock = Vessel::stock("s0", "edot", 100.0, 1.0);
        let waste = Vessel::waste("w0", 100.0);
        let well = Vessel::well("A1", 1, 100.0);
        assert!(check_direction(&stock, &well).is_ok());
        assert!(check_direction(&well, &waste).is_ok());
        assert!(check_direction(&stock, &waste).is_ok());
        for (from, to) in [(&well, &stock), (&waste, &well), (&stock, &stock)] {
            assert!(matches!(
                check_direction(from, to),
                Err(SdlError::InvalidTransfer(_))
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_moves_liquid_and_recaps() {
        let mut b = bench();
        b.engine
            .transfer(&mut b.ledger, &Source::solution("EDOT"), "A1", 120.0)
            .await
            .unwrap();
        assert_eq!(b.ledger.get("A1").unwrap().volume, 120.0);
        assert_eq!(b.ledger.get("A1").unwrap().contents["edot"], 120.0);
        assert_eq!(b.ledger.get("s0").unwrap().volume, 19880.0);
        assert!(b.engine.pipette().is_empty());
        assert!(!b.rig.decapper.holding());
        assert_eq!(b.rig.pump.totals().infused_ul, 120.0);
        assert_eq!(b.rig.pump.totals().blown_out_ul, 45.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_transfer_conserves_volume() {
        let mut b = bench();
        let before = total_liquid(&b.ledger);
        b.engine
            .transfer(&mut b.ledger, &Source::solution("edot"), "A1", 400.0)
            .await
            .unwrap();
        b.engine
            .transfer(&mut b.ledger, &Source::vessel("A1"), "w0", 400.0)
            .await
            .unwrap();
        assert!((total_liquid(&b.ledger) - before).abs() < 1e-6);
        assert!((b.ledger.get("w0").unwrap().volume - 400.0).abs() < 1e-6);
        assert!(b.ledger.get("A1").unwrap().volume.abs() < 1e-6);
        // three passes in from the stock, three out to waste, one decap each
        assert_eq!(b.rig.decapper.engage_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_source_hits_concentration() {
        let mut b = bench();
        b.engine
            .transfer(&mut b.ledger, &Source::mixed("kcl", 55.0), "A1", 100.0)
            .await
            .unwrap();
        assert_eq!(b.ledger.get("s1").unwrap().volume, 19950.0);
        assert_eq!(b.ledger.get("s2").unwrap().volume, 19950.0);
        assert_eq!(b.ledger.get("A1").unwrap().volume, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_draw_spans_vials_above_reserve() {
        let mut b = bench();
        let low = Vessel::stock("s3", "rinse", 20000.0, 0.0)
            .at(Coordinates::new(-20.0, -130.0, -70.0))
            .with_volume(2100.0);
        let spare = Vessel::stock("s4", "rinse", 20000.0, 0.0)
            .at(Coordinates::new(-20.0, -190.0, -70.0))
            .with_volume(2060.0);
        b.store.upsert_vessel(&low).unwrap();
        b.store.upsert_vessel(&spare).unwrap();
        b.ledger.refresh().unwrap();

        let draws = b
            .engine
            .plan_draws(&b.ledger, &Source::solution("rinse"), 150.0)
            .unwrap();
        let ids: Vec<&str> = draws.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["s3", "s4"]);
        assert!((draws[0].1 - 100.0).abs() < 1e-6);
        assert!((draws[1].1 - 50.0).abs() < 1e-6);
        assert!(matches!(
            b.engine
                .plan_draws(&b.ledger, &Source::solution("rinse"), 200.0),
            Err(SdlError::Resource(ResourceError::NoAvailableSolution(_)))
        ));

        b.engine
            .transfer(&mut b.ledger, &Source::solution("rinse"), "A1", 150.0)
            .await
            .unwrap();
        assert!((b.ledger.get("s3").unwrap().volume - 2000.0).abs() < 1e-6);
        assert!((b.ledger.get("s4").unwrap().volume - 2010.0).abs() < 1e-6);
        assert!((b.ledger.get("A1").unwrap().volume - 150.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_infeasible_mix_moves_nothing() {
        let mut b = bench();
        let before = total_liquid(&b.ledger);
        let result = b
            .engine
            .transfer(&mut b.ledger, &Source::mixed("kcl", 55.0), "A1", 300.0)
            .await;
        assert!(matches!(result, Err(SdlError::MixInfeasible { .. })));
        assert_eq!(total_liquid(&b.ledger), before);
        assert_eq!(b.rig.motion.move_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overfill_is_caught_before_moving() {
        let mut b = bench();
        let result = b
            .engine
            .transfer(&mut b.ledger, &Source::solution("edot"), "A2", 400.0)
            .await;
        assert!(matches!(
            result,
            Err(SdlError::Resource(ResourceError::Overfill { .. }))
        ));
        assert_eq!(b.ledger.get("s0").unwrap().volume, 20000.0);
        assert_eq!(b.rig.pump.totals().withdrawn_ul, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_illegal_direction_is_rejected() {
        let mut b = bench();
        let result = b
            .engine
            .transfer(&mut b.ledger, &Source::vessel("w0"), "A1", 10.0)
            .await;
        assert!(matches!(result, Err(SdlError::InvalidTransfer(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_decap_aborts_before_drawing() {
        let mut b = bench();
        b.rig.decapper.fail_next_grips(u32::MAX);
        let result = b
            .engine
            .transfer(&mut b.ledger, &Source::solution("edot"), "A1", 50.0)
            .await;
        assert!(matches!(
            result,
            Err(SdlError::DeviceConfirmation { attempts: 5, .. })
        ));
        assert_eq!(b.ledger.get("s0").unwrap().volume, 20000.0);
        // only the air gap was drawn; the purge blows it out
        b.engine.purge_pipette(&mut b.ledger).await.unwrap();
        assert!(b.engine.pipette().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_dumps_stranded_liquid_to_waste() {
        let mut b = bench();
        let mut stranded = Contents::new();
        stranded.insert("edot".into(), 30.0);
        b.engine.pipette.aspirate(&stranded, 30.0);
        b.engine.pipette.take_air(40.0);
        b.engine.purge_pipette(&mut b.ledger).await.unwrap();
        assert!(b.engine.pipette().is_empty());
        assert_eq!(b.ledger.get("w0").unwrap().contents["edot"], 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rinse_and_clear_declare_steps() {
        let mut b = bench();
        let experiment = enqueue(
            b.store.as_ref(),
            Experiment::new("rinse", RINSE_ONLY).with_well("A1"),
        )
        .unwrap();
        let mut sm = ExperimentStateMachine::new(experiment, b.store.clone());
        sm.declare_step("start", ExperimentStatus::Running).unwrap();

        b.engine
            .transfer(&mut b.ledger, &Source::solution("edot"), "A1", 100.0)
            .await
            .unwrap();
        b.engine
            .mix_in_well(&mut sm, &b.ledger, "A1", 80.0, 3)
            .await
            .unwrap();
        assert_eq!(b.ledger.get("A1").unwrap().volume, 100.0);

        b.engine
            .rinse_well(&mut sm, &mut b.ledger, "A1", "rinse", 120.0, 2)
            .await
            .unwrap();
        assert_eq!(b.store.well_status("A1").unwrap(), Some(ExperimentStatus::Rinsing));
        assert_eq!(b.ledger.get("A1").unwrap().volume, 0.0);
        assert_eq!(b.ledger.get("w0").unwrap().volume, 340.0);

        b.engine
            .clear_well(&mut sm, &mut b.ledger, "A1")
            .await
            .unwrap();
        assert_eq!(sm.status(), ExperimentStatus::Clearing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_discards_into_waste() {
        let mut b = bench();
        let experiment = enqueue(
            b.store.as_ref(),
            Experiment::new("flush", RINSE_ONLY).with_well("A2"),
        )
        .unwrap();
        let mut sm = ExperimentStateMachine::new(experiment, b.store.clone());
        b.engine
            .flush_pipette(&mut sm, &mut b.ledger, "rinse", 100.0, 3)
            .await
            .unwrap();
        assert_eq!(b.ledger.get("w0").unwrap().volume, 300.0);
        assert_eq!(sm.status(), ExperimentStatus::Flushing);
    }
}
