//! Deck layout: the plate and vials placed on the bench at setup.

use serde::{Deserialize, Serialize};

use super::vessel::{Coordinates, Vessel};
use crate::error::SdlResult;
use crate::store::{PlateRecord, Store};

/// Grid geometry of a wellplate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateLayout {
    pub id: i64,
    pub type_id: i64,
    pub rows: u8,
    pub columns: u8,
    /// Base of well A1
    pub a1: Coordinates,
    /// Center-to-center distance (mm)
    pub pitch: f64,
    pub well_capacity: f64,
    pub well_height: f64,
    pub well_radius: f64,
}

impl PlateLayout {
    /// 96-well plate with 150 uL wells.
    pub fn standard_96(id: i64, a1: Coordinates) -> Self {
        Self {
            id,
            type_id: 4,
            rows: 8,
            columns: 12,
            a1,
            pitch: 9.0,
            well_capacity: 150.0,
            well_height: 10.9,
            well_radius: 3.48,
        }
    }

    /// Every well, row-major. Columns run along -x, rows along -y.
    pub fn wells(&self) -> Vec<Vessel> {
        let mut wells = Vec::with_capacity(usize::from(self.rows) * usize::from(self.columns));
        for r in 0..self.rows {
            let row = char::from(b'A' + r);
            for c in 0..self.columns {
                let id = format!("{row}{}", c + 1);
                let mut well = Vessel::well(&id, self.id, self.well_capacity).at(Coordinates::new(
                    self.a1.x - f64::from(c) * self.pitch,
                    self.a1.y - f64::from(r) * self.pitch,
                    self.a1.z,
                ));
                well.height = self.well_height;
                well.radius = self.well_radius;
                wells.push(well);
            }
        }
        wells
    }
}

/// Everything placed on the deck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeckLayout {
    pub plate: PlateLayout,
    pub vials: Vec<Vessel>,
}

impl DeckLayout {
    /// Bench layout used in simulation: a 96-well plate, a stock rack, and
    /// two waste vials.
    pub fn demo() -> Self {
        let rack = |i: u8| Coordinates::new(-20.0, -40.0 - f64::from(i) * 30.0, -70.0);
        let vials = vec![
            Vessel::stock("s0", "edot", 20000.0, 0.01).at(rack(0)),
            Vessel::stock("s1", "liclo4", 20000.0, 1.0).at(rack(1)),
            Vessel::stock("s2", "rinse", 20000.0, 0.0).at(rack(2)),
            Vessel::stock("s3", "acn", 20000.0, 0.0)
                .with_viscosity(0.34)
                .at(rack(3)),
            Vessel::stock("s4", "ferrocene", 20000.0, 1.0).at(rack(4)),
            Vessel::waste("w0", 20000.0).at(rack(5)),
            Vessel::waste("w1", 20000.0).at(rack(6)),
        ];
        Self {
            plate: PlateLayout::standard_96(1, Coordinates::new(-220.0, -45.0, -75.0)),
            vials,
        }
    }

    /// Write the layout to the store and activate the plate.
    pub fn install(&self, store: &dyn Store) -> SdlResult<()> {
        store.add_plate(
            PlateRecord {
                id: self.plate.id,
                type_id: self.plate.type_id,
            },
            true,
        )?;
        for well in self.plate.wells() {
            store.upsert_vessel(&well)?;
        }
        for vial in &self.vials {
            store.upsert_vessel(vial)?;
        }
        tracing::info!(
            plate = self.plate.id,
            wells = usize::from(self.plate.rows) * usize::from(self.plate.columns),
            vials = self.vials.len(),
            "Deck installed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::{ResourceLedger, VesselKind};
    use crate::store::SqliteStore;
    use std::sync::Arc;

    #[test]
    fn test_plate_grid() {
        let plate = PlateLayout::standard_96(3, Coordinates::new(0.0, 0.0, -70.0));
        let wells = plate.wells();
        assert_eq!(wells.len(), 96);
        assert_eq!(wells[0].id, "A1");
        assert_eq!(wells[95].id, "H12");
        assert_eq!(wells[13].coordinates, Coordinates::new(-9.0, -9.0, -70.0));
        assert!(wells.iter().all(|w| w.group == 3));
    }

    #[test]
    fn test_demo_deck_installs() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        DeckLayout::demo().install(store.as_ref()).unwrap();
        let ledger = ResourceLedger::load(store).unwrap();
        assert_eq!(ledger.of_kind(VesselKind::Well).count(), 96);
        assert_eq!(ledger.of_kind(VesselKind::Waste).count(), 2);
        assert_eq!(ledger.next_new_well().unwrap().id, "A1");
    }
}
