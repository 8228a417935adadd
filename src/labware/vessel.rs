//! Vessel volume and content model.
//!
//! A vessel is any container of liquid: a stock vial (append-only source), a
//! waste vial, or a well on the active wellplate. All volumes are in
//! microliters; since 1 uL is 1 mm^3, liquid heights follow directly from the
//! vessel radius in millimeters.
//!
//! Contents map a lowercase solute name to the volume of that solute. The
//! bookkeeping here is pure; persistence is the ledger's job.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;

use crate::error::ResourceError;
use crate::experiment::ExperimentStatus;

/// Solute name to volume.
pub type Contents = BTreeMap<String, f64>;

/// Decimal digits kept for per-solute withdrawal amounts.
pub const CONTENT_PRECISION: i32 = 6;

/// Below this magnitude a volume is treated as zero.
pub const VOLUME_EPSILON: f64 = 1e-9;

/// Key used when liquid of unknown composition enters a vessel.
pub const UNLABELLED: &str = "unknown";

/// Which variant of vessel this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VesselKind {
    /// Source vial; never receives liquid
    Stock,
    /// Sink vial
    Waste,
    /// Wellplate well
    Well,
}

impl VesselKind {
    /// Stable string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            VesselKind::Stock => "stock",
            VesselKind::Waste => "waste",
            VesselKind::Well => "well",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stock" => Some(VesselKind::Stock),
            "waste" => Some(VesselKind::Waste),
            "well" => Some(VesselKind::Well),
            _ => None,
        }
    }
}

impl fmt::Display for VesselKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deck coordinates of a vessel's base, in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Coordinates {
    /// Construct from components.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Same x/y at a different height.
    pub fn with_z(self, z: f64) -> Self {
        Self { z, ..self }
    }
}

/// A container of liquid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vessel {
    /// Position ("s0", "w1") for vials, well id ("A1") for wells
    pub id: String,
    /// Rack id for vials, plate id for wells
    pub group: i64,
    /// Vessel variant
    pub kind: VesselKind,
    /// Solution name for vials, well id for wells
    pub name: String,
    /// Current liquid volume
    pub volume: f64,
    /// Maximum liquid volume
    pub capacity: f64,
    /// Volume below which liquid cannot be withdrawn safely
    pub dead_volume: f64,
    /// Solute name to volume; sums to `volume`
    pub contents: Contents,
    /// Concentration of a single-solute stock vial (mM)
    pub concentration: f64,
    /// Base position on the deck
    pub coordinates: Coordinates,
    /// Outer height (mm)
    pub height: f64,
    /// Inner radius (mm)
    pub radius: f64,
    /// Floor thickness (mm)
    pub base_thickness: f64,
    /// Viscosity (cP)
    pub viscosity_cp: f64,
    /// Density (g/mL)
    pub density: f64,
    /// Inactive vessels are kept for history but never selected
    pub active: bool,
    /// Mirrored experiment status, wells only
    pub status: Option<ExperimentStatus>,
    /// Experiment bound to this well
    pub experiment_id: Option<i64>,
    /// Project of the bound experiment
    pub project_id: Option<i64>,
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

impl Vessel {
    /// Stock vial filled to capacity with one solution.
    pub fn stock(id: &str, name: &str, capacity: f64, concentration: f64) -> Self {
        let name = normalize_key(name);
        let mut contents = Contents::new();
        contents.insert(name.clone(), capacity);
        Self {
            id: id.to_string(),
            group: 0,
            kind: VesselKind::Stock,
            name,
            volume: capacity,
            capacity,
            dead_volume: 1000.0,
            contents,
            concentration,
            coordinates: Coordinates::default(),
            height: 57.0,
            radius: 13.5,
            base_thickness: 1.0,
            viscosity_cp: 1.0,
            density: 1.0,
            active: true,
            status: None,
            experiment_id: None,
            project_id: None,
        }
    }

    /// Empty waste vial.
    pub fn waste(id: &str, capacity: f64) -> Self {
        Self {
            kind: VesselKind::Waste,
            name: "waste".to_string(),
            volume: 0.0,
            contents: Contents::new(),
            concentration: 0.0,
            dead_volume: 0.0,
            ..Self::stock(id, "waste", capacity, 0.0)
        }
    }

    /// Empty, unused well on `plate_id`.
    pub fn well(id: &str, plate_id: i64, capacity: f64) -> Self {
        Self {
            id: id.to_string(),
            group: plate_id,
            kind: VesselKind::Well,
            name: id.to_string(),
            volume: 0.0,
            capacity,
            dead_volume: 0.0,
            contents: Contents::new(),
            concentration: 0.0,
            coordinates: Coordinates::default(),
            height: 6.0,
            radius: 3.25,
            base_thickness: 1.0,
            viscosity_cp: 1.0,
            density: 1.0,
            active: true,
            status: Some(ExperimentStatus::New),
            experiment_id: None,
            project_id: None,
        }
    }

    /// Builder: place the vessel on the deck.
    pub fn at(mut self, coordinates: Coordinates) -> Self {
        self.coordinates = coordinates;
        self
    }

    /// Builder: set the viscosity.
    pub fn with_viscosity(mut self, viscosity_cp: f64) -> Self {
        self.viscosity_cp = viscosity_cp;
        self
    }

    /// Builder: set the dead volume.
    pub fn with_dead_volume(mut self, dead_volume: f64) -> Self {
        self.dead_volume = dead_volume;
        self
    }

    /// Builder: set the current volume, keeping contents proportional.
    pub fn with_volume(mut self, volume: f64) -> Self {
        let total: f64 = self.contents.values().sum();
        if total > VOLUME_EPSILON {
            for qty in self.contents.values_mut() {
                *qty = *qty / total * volume;
            }
        } else if volume > VOLUME_EPSILON {
            self.contents.insert(self.name.clone(), volume);
        }
        self.volume = volume;
        self
    }

    /// Top rim z.
    pub fn top(&self) -> f64 {
        self.coordinates.z + self.height
    }

    /// Inner floor z.
    pub fn bottom(&self) -> f64 {
        self.coordinates.z + self.base_thickness
    }

    fn cross_section(&self) -> f64 {
        PI * self.radius * self.radius
    }

    /// Liquid surface z.
    pub fn liquid_height(&self) -> f64 {
        if self.radius <= 0.0 {
            return self.bottom();
        }
        self.bottom() + self.volume / self.cross_section()
    }

    /// Where the pipette tip goes to withdraw: 2 mm under the surface, never
    /// below the dead-volume line.
    pub fn withdrawal_height(&self) -> f64 {
        let dead_height = if self.dead_volume <= 0.0 || self.radius <= 0.0 {
            self.bottom()
        } else {
            self.bottom() + self.dead_volume / self.cross_section()
        };
        (self.liquid_height() - 2.0).max(dead_height)
    }

    /// Sum of tracked solute volumes.
    pub fn contents_total(&self) -> f64 {
        self.contents.values().sum()
    }

    /// Volume that may be withdrawn without dipping into the dead volume.
    pub fn usable_volume(&self) -> f64 {
        (self.volume - self.dead_volume).max(0.0)
    }

    /// Whether the vessel's tracked contents include `solution`.
    pub fn holds(&self, solution: &str) -> bool {
        let key = normalize_key(solution);
        self.name == key || self.contents.get(&key).is_some_and(|qty| *qty > VOLUME_EPSILON)
    }

    /// Check a withdrawal without performing it.
    pub fn check_withdraw(&self, volume: f64) -> Result<(), ResourceError> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(ResourceError::InvalidVolume(volume));
        }
        if volume > self.volume + VOLUME_EPSILON {
            return Err(ResourceError::Overdraft {
                vessel: self.id.clone(),
                volume: self.volume,
                requested: volume,
            });
        }
        Ok(())
    }

    /// Check a deposit without performing it.
    pub fn check_deposit(&self, volume: f64) -> Result<(), ResourceError> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(ResourceError::InvalidVolume(volume));
        }
        if self.kind == VesselKind::Stock {
            return Err(ResourceError::StockIsAppendOnly(self.id.clone()));
        }
        if self.volume + volume > self.capacity + VOLUME_EPSILON {
            return Err(ResourceError::Overfill {
                vessel: self.id.clone(),
                volume: self.volume,
                added: volume,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Remove `volume`, taking every solute in proportion to its share.
    ///
    /// Returns the removed contents, which sum to `volume`. Per-solute amounts
    /// are rounded to [`CONTENT_PRECISION`] digits; the largest solute absorbs
    /// the rounding remainder so the totals stay consistent.
    pub fn withdraw(&mut self, volume: f64) -> Result<Contents, ResourceError> {
        self.check_withdraw(volume)?;
        let volume = volume.min(self.volume);
        let total = self.contents_total();
        let mut removed = Contents::new();

        if total > VOLUME_EPSILON && volume > 0.0 {
            let largest = self
                .contents
                .iter()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(k, _)| k.clone());
            let mut assigned = 0.0;
            for (key, qty) in &self.contents {
                if Some(key) == largest.as_ref() {
                    continue;
                }
                let share = round_to(volume * (qty / total), CONTENT_PRECISION).min(*qty);
                assigned += share;
                removed.insert(key.clone(), share);
            }
            if let Some(key) = largest {
                let qty = self.contents.get(&key).copied().unwrap_or(0.0);
                removed.insert(key, (volume - assigned).clamp(0.0, qty));
            }
            for (key, amount) in &removed {
                if let Some(qty) = self.contents.get_mut(key) {
                    *qty -= amount;
                }
            }
            self.contents.retain(|_, qty| *qty > VOLUME_EPSILON);
        }

        self.volume -= volume;
        if self.volume.abs() < VOLUME_EPSILON {
            self.volume = 0.0;
        }
        Ok(removed)
    }

    /// Add `volume` of liquid with the given composition.
    ///
    /// The incoming contents are rescaled to sum to `volume`; liquid with no
    /// declared composition is booked as [`UNLABELLED`].
    pub fn deposit(&mut self, contents: &Contents, volume: f64) -> Result<(), ResourceError> {
        self.check_deposit(volume)?;
        if volume <= 0.0 {
            return Ok(());
        }
        let incoming: f64 = contents.values().sum();
        if incoming > VOLUME_EPSILON {
            for (key, qty) in contents {
                let scaled = qty / incoming * volume;
                *self.contents.entry(normalize_key(key)).or_insert(0.0) += scaled;
            }
        } else {
            *self.contents.entry(UNLABELLED.to_string()).or_insert(0.0) += volume;
        }
        self.volume += volume;
        Ok(())
    }

    /// Restore the setup state: stock vials full, everything else empty.
    pub fn reset(&mut self) {
        self.contents.clear();
        match self.kind {
            VesselKind::Stock => {
                self.volume = self.capacity;
                self.contents.insert(self.name.clone(), self.capacity);
            }
            VesselKind::Waste => {
                self.volume = 0.0;
            }
            VesselKind::Well => {
                self.volume = 0.0;
                self.status = Some(ExperimentStatus::New);
                self.experiment_id = None;
                self.project_id = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed_well() -> Vessel {
        let mut well = Vessel::well("A1", 1, 300.0);
        let mut contents = Contents::new();
        contents.insert("a".into(), 75.0);
        contents.insert("b".into(), 25.0);
        well.deposit(&contents, 100.0).unwrap();
        well
    }

    #[test]
    fn test_withdraw_preserves_ratio() {
        let mut well = mixed_well();
        let removed = well.withdraw(40.0).unwrap();
        assert!((removed["a"] - 30.0).abs() < 1e-6);
        assert!((removed["b"] - 10.0).abs() < 1e-6);
        assert!((well.volume - 60.0).abs() < 1e-9);
        assert!((well.contents_total() - well.volume).abs() < 1e-6);
        assert!((well.contents["a"] / well.contents["b"] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_overdraft_is_rejected_without_mutation() {
        let mut well = mixed_well();
        let err = well.withdraw(150.0).unwrap_err();
        assert!(matches!(err, ResourceError::Overdraft { .. }));
        assert_eq!(well.volume, 100.0);
    }

    #[test]
    fn test_overfill_is_rejected() {
        let mut waste = Vessel::waste("w0", 100.0);
        waste.deposit(&Contents::new(), 80.0).unwrap();
        let err = waste.deposit(&Contents::new(), 30.0).unwrap_err();
        assert!(matches!(err, ResourceError::Overfill { .. }));
        assert_eq!(waste.volume, 80.0);
        assert_eq!(waste.contents[UNLABELLED], 80.0);
    }

    #[test]
    fn test_stock_vials_are_append_only() {
        let mut stock = Vessel::stock("s0", "KCl", 20000.0, 1.0);
        let err = stock.deposit(&Contents::new(), 1.0).unwrap_err();
        assert!(matches!(err, ResourceError::StockIsAppendOnly(_)));
    }

    #[test]
    fn test_negative_volume_is_rejected() {
        let mut well = mixed_well();
        assert!(matches!(
            well.withdraw(-1.0),
            Err(ResourceError::InvalidVolume(_))
        ));
    }

    #[test]
    fn test_repeated_small_draws_never_go_negative() {
        let mut stock = Vessel::stock("s0", "edot", 1000.0, 0.01);
        let mut contents = Contents::new();
        contents.insert("edot".into(), 700.0);
        contents.insert("water".into(), 300.0);
        stock.contents = contents;
        let mut drawn = 0.0;
        while stock.volume > 0.0 {
            let step = (1.0 / 3.0f64).min(stock.volume);
            let removed = stock.withdraw(step).unwrap();
            drawn += removed.values().sum::<f64>();
            assert!(stock.volume >= 0.0);
            assert!(stock.contents.values().all(|q| *q >= 0.0));
        }
        assert!((drawn - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_reset_refills_stock_and_frees_wells() {
        let mut stock = Vessel::stock("s0", "acn", 20000.0, 0.0);
        stock.withdraw(5000.0).unwrap();
        stock.reset();
        assert_eq!(stock.volume, 20000.0);
        assert_eq!(stock.contents["acn"], 20000.0);

        let mut well = mixed_well();
        well.status = Some(ExperimentStatus::Complete);
        well.experiment_id = Some(7);
        well.reset();
        assert_eq!(well.volume, 0.0);
        assert!(well.contents.is_empty());
        assert_eq!(well.status, Some(ExperimentStatus::New));
        assert_eq!(well.experiment_id, None);
    }

    #[test]
    fn test_withdrawal_height_respects_dead_volume() {
        let stock = Vessel::stock("s0", "ipa", 20000.0, 0.0)
            .at(Coordinates::new(0.0, 0.0, -80.0))
            .with_dead_volume(1000.0)
            .with_volume(1000.0);
        let dead_height = stock.bottom() + 1000.0 / (PI * 13.5 * 13.5);
        assert!((stock.withdrawal_height() - dead_height).abs() < 1e-9);

        let full = stock.clone().with_volume(20000.0);
        assert!(full.withdrawal_height() > dead_height);
        assert!(full.withdrawal_height() < full.liquid_height());
    }
}
