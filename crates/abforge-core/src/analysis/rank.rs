//! Composite-score ranking of filtered candidates.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::quiver::Record;

pub const PAE_WEIGHT: f64 = 0.4;
pub const RMSD_WEIGHT: f64 = 0.3;
pub const DDG_WEIGHT: f64 = 0.3;

/// A ranked candidate: the record plus its derived composite score.
///
/// Composite scores are min-max normalized over the filtered population of
/// one analysis run, so they are only comparable within that run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedCandidate {
    pub rank: usize,
    pub tag: String,
    pub pae: Option<f64>,
    pub rmsd: Option<f64>,
    pub ddg: Option<f64>,
    pub composite_score: f64,
}

/// Rank candidates by a weighted composite of normalized metrics.
///
/// Each metric is min-max normalized to [0, 1] over the filtered
/// population; all metrics are oriented so lower raw values normalize
/// lower, making the composite lower-is-better. When a metric is absent
/// from the entire population its weight is renormalized away. Ties break
/// by raw pAE ascending, then tag lexicographically — a deterministic
/// total order independent of input order.
pub fn rank_candidates(filtered: &[Record]) -> Vec<RankedCandidate> {
    if filtered.is_empty() {
        return Vec::new();
    }

    let pae_range = metric_range(filtered, |r| r.pae);
    let rmsd_range = metric_range(filtered, |r| r.rmsd);
    let ddg_range = metric_range(filtered, |r| r.ddg);

    let mut candidates: Vec<RankedCandidate> = filtered
        .iter()
        .map(|r| {
            let mut composite = 0.0;
            let mut weight_sum = 0.0;
            for (range, value, weight) in [
                (&pae_range, r.pae, PAE_WEIGHT),
                (&rmsd_range, r.rmsd, RMSD_WEIGHT),
                (&ddg_range, r.ddg, DDG_WEIGHT),
            ] {
                if let Some(range) = range {
                    // Metric present in the population: a record missing
                    // its own value normalizes to the worst end.
                    composite += weight * value.map_or(1.0, |v| range.normalize(v));
                    weight_sum += weight;
                }
            }
            let total = PAE_WEIGHT + RMSD_WEIGHT + DDG_WEIGHT;
            let composite_score = if weight_sum > 0.0 {
                composite / weight_sum * total
            } else {
                0.0
            };
            RankedCandidate {
                rank: 0,
                tag: r.tag.clone(),
                pae: r.pae,
                rmsd: r.rmsd,
                ddg: r.ddg,
                composite_score,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.composite_score
            .total_cmp(&b.composite_score)
            .then_with(|| {
                a.pae
                    .unwrap_or(f64::INFINITY)
                    .total_cmp(&b.pae.unwrap_or(f64::INFINITY))
            })
            .then_with(|| a.tag.cmp(&b.tag))
    });
    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = i + 1;
    }

    info!(
        candidates = candidates.len(),
        best_composite = candidates.first().map(|c| c.composite_score),
        "ranked candidates"
    );
    candidates
}

struct Range {
    lo: f64,
    hi: f64,
}

impl Range {
    /// Min-max normalize to [0, 1]; constant populations normalize to 0.
    fn normalize(&self, value: f64) -> f64 {
        if self.hi - self.lo < 1e-12 {
            0.0
        } else {
            (value - self.lo) / (self.hi - self.lo)
        }
    }
}

/// Range of a metric over the population; `None` when no record has it.
fn metric_range(records: &[Record], get: impl Fn(&Record) -> Option<f64>) -> Option<Range> {
    let values: Vec<f64> = records.iter().filter_map(&get).collect();
    if values.is_empty() {
        return None;
    }
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(Range { lo, hi })
}
