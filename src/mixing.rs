//! Mixing solver.
//!
//! Given several stock vials of the same solution at different concentrations,
//! choose how much to draw from each so the mixture has the requested volume
//! and a concentration as close as possible to the target. Every vial that is
//! used must give between `min` and `max` microliters.
//!
//! Special cases come first:
//! - a single vial is usable only if it already has the target concentration;
//! - any vial at the target concentration supplies the whole volume.
//!
//! Otherwise every subset of vials whose size can meet the volume bounds is
//! examined. For a fixed subset the achievable solute amount is an interval:
//! its ends come from pouring the free volume into the most dilute (or most
//! concentrated) vials first. The best draw inside that interval is the linear
//! blend of the two extreme draws that lands on the target, or the nearest
//! end. Ties go to the subset with fewer vials.

use serde::{Deserialize, Serialize};

use crate::config::MixingConfig;

/// Subsets are enumerated exhaustively; racks never hold more vials than this.
pub const MAX_SOURCES: usize = 16;

const TOLERANCE: f64 = 1e-9;

/// A candidate vial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixSource {
    /// Vessel id the draw is taken from
    pub id: String,
    /// Stock concentration, mM
    pub concentration: f64,
}

impl MixSource {
    pub fn new(id: &str, concentration: f64) -> Self {
        Self {
            id: id.to_string(),
            concentration,
        }
    }
}

/// Per-vial draw limits for vials that are used at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DrawBounds {
    pub min: f64,
    pub max: f64,
}

impl From<&MixingConfig> for DrawBounds {
    fn from(config: &MixingConfig) -> Self {
        Self {
            min: config.min_draw_ul,
            max: config.max_draw_ul,
        }
    }
}

/// Solver result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixPlan {
    /// One entry per source, in input order; unused vials draw 0
    pub draws: Vec<(String, f64)>,
    /// |achieved - target| concentration (mM)
    pub deviation: f64,
}

impl MixPlan {
    pub fn draw(&self, id: &str) -> f64 {
        self.draws
            .iter()
            .find(|(d, _)| d == id)
            .map(|(_, v)| *v)
            .unwrap_or(0.0)
    }

    /// Vials actually drawn from.
    pub fn used(&self) -> impl Iterator<Item = (&str, f64)> {
        self.draws
            .iter()
            .filter(|(_, v)| *v > 0.0)
            .map(|(id, v)| (id.as_str(), *v))
    }

    pub fn total(&self) -> f64 {
        self.draws.iter().map(|(_, v)| v).sum()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn same(a: f64, b: f64) -> bool {
    (a - b).abs() <= TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

/// Call `f` with every k-subset of `0..n` in lexicographic order.
fn for_each_combination(n: usize, k: usize, mut f: impl FnMut(&[usize])) {
    if k == 0 || k > n {
        return;
    }
    let mut idx: Vec<usize> = (0..k).collect();
    loop {
        f(&idx);
        let mut i = k;
        loop {
            if i == 0 {
                return;
            }
            i -= 1;
            if idx[i] < i + n - k {
                break;
            }
        }
        idx[i] += 1;
        for j in i + 1..k {
            idx[j] = idx[j - 1] + 1;
        }
    }
}

/// Pour `remaining` into `order`, each vial taking at most `room` beyond `base`.
fn greedy_fill(order: &[usize], base: f64, room: f64, mut remaining: f64, n: usize) -> Vec<f64> {
    let mut draws = vec![0.0; n];
    for &i in order {
        let extra = remaining.min(room).max(0.0);
        draws[i] = base + extra;
        remaining -= extra;
    }
    draws
}

struct Candidate {
    deviation: f64,
    draws: Vec<f64>,
}

fn evaluate(
    subset: &[usize],
    sources: &[MixSource],
    volume: f64,
    target: f64,
    bounds: DrawBounds,
) -> Candidate {
    let n = sources.len();
    let k = subset.len() as f64;
    let remaining = (volume - k * bounds.min).max(0.0);
    let room = bounds.max - bounds.min;

    let mut ascending = subset.to_vec();
    ascending.sort_by(|a, b| sources[*a].concentration.total_cmp(&sources[*b].concentration));
    let descending: Vec<usize> = ascending.iter().rev().copied().collect();

    let low = greedy_fill(&ascending, bounds.min, room, remaining, n);
    let high = greedy_fill(&descending, bounds.min, room, remaining, n);
    let amount = |d: &[f64]| -> f64 {
        subset
            .iter()
            .map(|&i| sources[i].concentration * d[i])
            .sum()
    };
    let (q_low, q_high) = (amount(&low), amount(&high));
    let wanted = target * volume;
    let achieved = wanted.clamp(q_low, q_high);
    let t = if q_high - q_low > TOLERANCE {
        (achieved - q_low) / (q_high - q_low)
    } else {
        0.0
    };
    let draws = low
        .iter()
        .zip(&high)
        .map(|(l, h)| l + t * (h - l))
        .collect();
    Candidate {
        deviation: (achieved - wanted).abs(),
        draws,
    }
}

/// Round draws to 0.01 uL, pushing the rounding residual onto the largest
/// draw that can absorb it without leaving the bounds.
fn round_draws(draws: &mut [f64], volume: f64, bounds: DrawBounds) {
    for d in draws.iter_mut() {
        *d = round2(*d);
    }
    let residual = round2(volume - draws.iter().sum::<f64>());
    if residual == 0.0 {
        return;
    }
    let mut order: Vec<usize> = (0..draws.len()).filter(|&i| draws[i] > 0.0).collect();
    order.sort_by(|a, b| draws[*b].total_cmp(&draws[*a]));
    let target = order
        .iter()
        .copied()
        .find(|&i| {
            let adjusted = draws[i] + residual;
            adjusted >= bounds.min - TOLERANCE && adjusted <= bounds.max + TOLERANCE
        })
        .or_else(|| order.first().copied());
    if let Some(i) = target {
        draws[i] = round2(draws[i] + residual);
    }
}

fn plan(sources: &[MixSource], draws: Vec<f64>, volume: f64, target: f64) -> MixPlan {
    let achieved: f64 = sources
        .iter()
        .zip(&draws)
        .map(|(s, d)| s.concentration * d)
        .sum();
    let deviation = if volume > 0.0 {
        ((achieved / volume - target).abs() * 1e6).round() / 1e6
    } else {
        0.0
    };
    MixPlan {
        draws: sources
            .iter()
            .map(|s| s.id.clone())
            .zip(draws)
            .collect(),
        deviation,
    }
}

/// Compute draws from `sources` totalling `volume` at `target` concentration.
///
/// Returns `None` when no combination satisfies the volume and draw bounds.
pub fn solve(
    sources: &[MixSource],
    volume: f64,
    target: f64,
    bounds: DrawBounds,
) -> Option<MixPlan> {
    if sources.is_empty() || !volume.is_finite() || volume < 0.0 || !target.is_finite() {
        return None;
    }
    let n = sources.len();

    if let Some(exact) = sources.iter().position(|s| same(s.concentration, target)) {
        let mut draws = vec![0.0; n];
        draws[exact] = volume;
        return Some(plan(sources, draws, volume, target));
    }
    if n == 1 {
        return None;
    }

    let sources = if n > MAX_SOURCES {
        tracing::warn!(
            sources = n,
            limit = MAX_SOURCES,
            "Too many mixing sources; only the first are considered"
        );
        &sources[..MAX_SOURCES]
    } else {
        sources
    };
    let n = sources.len();
    if bounds.max <= 0.0 || bounds.min > bounds.max {
        return None;
    }

    let k_low = ((volume / bounds.max) - TOLERANCE).ceil().max(1.0) as usize;
    let k_high = if bounds.min > 0.0 {
        (((volume / bounds.min) + TOLERANCE).floor() as usize).min(n)
    } else {
        n
    };

    let mut best: Option<Candidate> = None;
    for k in k_low..=k_high {
        for_each_combination(n, k, |subset| {
            let candidate = evaluate(subset, sources, volume, target, bounds);
            let better = best
                .as_ref()
                .map_or(true, |b| candidate.deviation < b.deviation - TOLERANCE);
            if better {
                best = Some(candidate);
            }
        });
    }

    let mut draws = best?.draws;
    round_draws(&mut draws, volume, bounds);
    Some(plan(sources, draws, volume, target))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: DrawBounds = DrawBounds {
        min: 20.0,
        max: 120.0,
    };

    fn sources(concentrations: &[f64]) -> Vec<MixSource> {
        concentrations
            .iter()
            .enumerate()
            .map(|(i, c)| MixSource::new(&format!("s{i}"), *c))
            .collect()
    }

    fn assert_within_bounds(plan: &MixPlan, volume: f64, bounds: DrawBounds) {
        assert!((plan.total() - volume).abs() < 1e-9, "total {}", plan.total());
        for (id, draw) in plan.used() {
            assert!(
                draw >= bounds.min - 1e-9 && draw <= bounds.max + 1e-9,
                "{id} draws {draw}"
            );
        }
    }

    #[test]
    fn test_even_split_hits_target() {
        let plan = solve(&sources(&[10.0, 100.0]), 100.0, 55.0, BOUNDS).unwrap();
        assert_eq!(plan.draw("s0"), 50.0);
        assert_eq!(plan.draw("s1"), 50.0);
        assert!(plan.deviation.abs() < 1e-9);
    }

    #[test]
    fn test_high_minimum_stays_in_bounds() {
        let bounds = DrawBounds {
            min: 40.0,
            max: 120.0,
        };
        let plan = solve(&sources(&[10.0, 100.0]), 100.0, 99.0, bounds).unwrap();
        assert_within_bounds(&plan, 100.0, bounds);
        assert!(plan.deviation > 0.0);
    }

    #[test]
    fn test_volume_below_minimum_is_infeasible() {
        assert!(solve(&sources(&[10.0, 100.0]), 10.0, 55.0, BOUNDS).is_none());
    }

    #[test]
    fn test_volume_above_combined_maximum_is_infeasible() {
        assert!(solve(&sources(&[10.0, 100.0]), 300.0, 55.0, BOUNDS).is_none());
    }

    #[test]
    fn test_single_source_must_match_exactly() {
        assert!(solve(&sources(&[10.0]), 100.0, 12.0, BOUNDS).is_none());
        let plan = solve(&sources(&[10.0]), 500.0, 10.0, BOUNDS).unwrap();
        assert_eq!(plan.draw("s0"), 500.0);
        assert_eq!(plan.deviation, 0.0);
    }

    #[test]
    fn test_exact_match_takes_everything() {
        let plan = solve(&sources(&[10.0, 55.0, 100.0]), 100.0, 55.0, BOUNDS).unwrap();
        assert_eq!(plan.draw("s1"), 100.0);
        assert_eq!(plan.used().count(), 1);
    }

    #[test]
    fn test_ties_prefer_fewer_vials() {
        let plan = solve(&sources(&[20.0, 20.0]), 100.0, 30.0, BOUNDS).unwrap();
        assert_eq!(plan.used().count(), 1);
        assert_eq!(plan.deviation, 10.0);
    }

    #[test]
    fn test_draws_are_rounded_to_two_decimals() {
        let plan = solve(&sources(&[10.0, 100.0]), 100.0, 40.0, BOUNDS).unwrap();
        assert_within_bounds(&plan, 100.0, BOUNDS);
        for (_, draw) in plan.used() {
            assert!(((draw * 100.0).round() - draw * 100.0).abs() < 1e-6);
        }
        assert!(plan.deviation < 0.01);
    }

    #[test]
    fn test_three_vials_when_volume_requires_it() {
        let plan = solve(&sources(&[5.0, 10.0, 100.0]), 300.0, 40.0, BOUNDS).unwrap();
        assert_eq!(plan.used().count(), 3);
        assert_within_bounds(&plan, 300.0, BOUNDS);
        assert!(plan.deviation < 0.01);
    }

    #[test]
    fn test_combinations_are_exhaustive() {
        let mut seen = Vec::new();
        for_each_combination(4, 2, |c| seen.push(c.to_vec()));
        assert_eq!(seen.len(), 6);
        assert_eq!(seen.first().unwrap(), &vec![0, 1]);
        assert_eq!(seen.last().unwrap(), &vec![2, 3]);
    }
}
