//! Labware: vessels, the resource ledger, and deck setup.

pub mod deck;
pub mod ledger;
pub mod vessel;

pub use deck::{DeckLayout, PlateLayout};
pub use ledger::ResourceLedger;
pub use vessel::{Contents, Coordinates, Vessel, VesselKind};

/// Sort key placing "A2" before "A10" and every row A well before row B.
pub fn well_order(well_id: &str) -> (String, u32) {
    let split = well_id
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(well_id.len());
    let (row, column) = well_id.split_at(split);
    (row.to_ascii_uppercase(), column.parse().unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_order() {
        let mut wells = vec!["B1", "A10", "A2", "A1"];
        wells.sort_by_key(|w| well_order(w));
        assert_eq!(wells, vec!["A1", "A2", "A10", "B1"]);
    }
}
