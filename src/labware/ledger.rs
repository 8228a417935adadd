//! Resource ledger: the in-memory vessel inventory, persisted on every change.
//!
//! The ledger is the only writer of vessel volumes. A mutation is applied to a
//! copy, persisted, and only then swapped into the inventory, so a storage
//! failure leaves the in-memory view unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::vessel::{Contents, Vessel, VesselKind};
use super::well_order;
use crate::error::{ResourceError, SdlResult};
use crate::experiment::ExperimentStatus;
use crate::store::Store;

/// Vessel inventory keyed by vessel id.
///
/// Vial ids must be unique across racks; [`ResourceLedger::refresh`] rejects
/// an inventory where two racks reuse one.
pub struct ResourceLedger {
    store: Arc<dyn Store>,
    vessels: BTreeMap<String, Vessel>,
}

impl ResourceLedger {
    /// Load the active vessels from the store.
    pub fn load(store: Arc<dyn Store>) -> SdlResult<Self> {
        let mut ledger = Self {
            store,
            vessels: BTreeMap::new(),
        };
        ledger.refresh()?;
        Ok(ledger)
    }

    /// Re-read every vessel. Operators refill and swap labware between runs.
    /// Fails if two racks hold a vial with the same id.
    pub fn refresh(&mut self) -> SdlResult<()> {
        let mut vessels = BTreeMap::new();
        for vessel in self.store.load_vessels()? {
            if vessels.contains_key(&vessel.id) {
                return Err(ResourceError::DuplicateVessel(vessel.id).into());
            }
            vessels.insert(vessel.id.clone(), vessel);
        }
        self.vessels = vessels;
        tracing::debug!(vessels = self.vessels.len(), "Vessel inventory refreshed");
        Ok(())
    }

    /// Look up a vessel, failing with `UnknownVessel`.
    pub fn get(&self, id: &str) -> SdlResult<&Vessel> {
        self.vessels
            .get(id)
            .ok_or_else(|| ResourceError::UnknownVessel(id.to_string()).into())
    }

    /// Every vessel in id order.
    pub fn vessels(&self) -> impl Iterator<Item = &Vessel> {
        self.vessels.values()
    }

    pub fn of_kind(&self, kind: VesselKind) -> impl Iterator<Item = &Vessel> {
        self.vessels.values().filter(move |v| v.kind == kind)
    }

    /// Register or overwrite a vessel.
    pub fn add(&mut self, vessel: Vessel) -> SdlResult<()> {
        self.store.upsert_vessel(&vessel)?;
        self.vessels.insert(vessel.id.clone(), vessel);
        Ok(())
    }

    /// Remove `volume` from a vessel, returning the removed contents.
    pub fn withdraw(&mut self, id: &str, volume: f64) -> SdlResult<Contents> {
        let mut updated = self.get(id)?.clone();
        let removed = updated.withdraw(volume)?;
        self.store.save_vessel_contents(&updated)?;
        tracing::debug!(vessel = id, volume, remaining = updated.volume, "Withdrew");
        self.vessels.insert(id.to_string(), updated);
        Ok(removed)
    }

    /// Add `volume` of liquid with composition `contents` to a vessel.
    pub fn deposit(&mut self, id: &str, contents: &Contents, volume: f64) -> SdlResult<()> {
        let mut updated = self.get(id)?.clone();
        updated.deposit(contents, volume)?;
        self.store.save_vessel_contents(&updated)?;
        tracing::debug!(vessel = id, volume, total = updated.volume, "Deposited");
        self.vessels.insert(id.to_string(), updated);
        Ok(())
    }

    /// Restore a vessel to its setup state.
    pub fn reset(&mut self, id: &str) -> SdlResult<()> {
        let mut updated = self.get(id)?.clone();
        updated.reset();
        self.store.upsert_vessel(&updated)?;
        tracing::info!(vessel = id, kind = %updated.kind, "Vessel reset");
        self.vessels.insert(id.to_string(), updated);
        Ok(())
    }

    /// Stock vials of `solution` that still hold liquid, in position order.
    pub fn stock_sources(&self, solution: &str) -> Vec<&Vessel> {
        let key = solution.trim().to_lowercase();
        self.of_kind(VesselKind::Stock)
            .filter(|v| v.name == key && v.volume > 0.0)
            .collect()
    }

    /// First stock vial of `solution` that can give `volume` while keeping
    /// `reserve_fraction` of its capacity untouched.
    pub fn select_stock(
        &self,
        solution: &str,
        volume: f64,
        reserve_fraction: f64,
    ) -> SdlResult<&Vessel> {
        self.stock_sources(solution)
            .into_iter()
            .find(|v| v.volume - reserve_fraction * v.capacity > volume)
            .ok_or_else(|| ResourceError::NoAvailableSolution(solution.to_string()).into())
    }

    /// First waste vial named `name` with room for `volume`.
    pub fn select_waste(&self, name: &str, volume: f64) -> SdlResult<&Vessel> {
        let key = name.trim().to_lowercase();
        self.of_kind(VesselKind::Waste)
            .filter(|v| v.name == key)
            .find(|v| v.volume + volume < v.capacity)
            .ok_or_else(|| ResourceError::NoAvailableSolution(name.to_string()).into())
    }

    /// Stock of `solution` that can be drawn without touching any vial's
    /// reserve of `reserve_fraction` of its capacity.
    pub fn withdrawable_volume(&self, solution: &str, reserve_fraction: f64) -> f64 {
        self.stock_sources(solution)
            .iter()
            .map(|v| (v.volume - reserve_fraction * v.capacity).max(0.0))
            .sum()
    }

    /// Lowest-ordered well still marked NEW on the active plate.
    pub fn next_new_well(&self) -> Option<&Vessel> {
        self.of_kind(VesselKind::Well)
            .filter(|w| w.status == Some(ExperimentStatus::New))
            .min_by_key(|w| well_order(&w.id))
    }

    /// Stock vials below `threshold` uL.
    pub fn low_stock(&self, threshold: f64) -> Vec<&Vessel> {
        self.of_kind(VesselKind::Stock)
            .filter(|v| v.volume < threshold)
            .collect()
    }

    /// Whether every waste vial is at least `fill_fraction` full.
    pub fn waste_full(&self, fill_fraction: f64) -> bool {
        let mut waste = self.of_kind(VesselKind::Waste).peekable();
        if waste.peek().is_none() {
            return false;
        }
        waste.all(|v| v.volume >= fill_fraction * v.capacity)
    }
}
