//! Threshold filtering over scored designs.

use tracing::{info, warn};

use crate::config::FilteringConfig;
use crate::quiver::Record;

/// Keep records that pass every enabled threshold (logical AND).
///
/// A disabled threshold contributes no constraint, and an enabled
/// threshold whose metric is absent from the entire population is skipped
/// (a prediction run scored without ddG still yields candidates).
/// Comparison direction is per-metric: pAE and RMSD are lower-is-better,
/// ddG is more-negative-is-better; all comparisons are strict `<`. A
/// record individually missing a metric the population carries fails that
/// threshold.
pub fn apply_filters(records: &[Record], filters: &FilteringConfig) -> Vec<Record> {
    let effective = FilteringConfig {
        pae_threshold: binding_threshold(filters.pae_threshold, records, |r| r.pae, "pae"),
        rmsd_threshold: binding_threshold(filters.rmsd_threshold, records, |r| r.rmsd, "rmsd"),
        ddg_threshold: binding_threshold(filters.ddg_threshold, records, |r| r.ddg, "ddg"),
    };
    let passed: Vec<Record> = records
        .iter()
        .filter(|r| passes(r, &effective))
        .cloned()
        .collect();
    info!(
        passed = passed.len(),
        total = records.len(),
        pae = ?effective.pae_threshold,
        rmsd = ?effective.rmsd_threshold,
        ddg = ?effective.ddg_threshold,
        "applied filters"
    );
    passed
}

/// A threshold only binds when at least one record carries its metric.
fn binding_threshold(
    threshold: Option<f64>,
    records: &[Record],
    get: impl Fn(&Record) -> Option<f64>,
    metric: &str,
) -> Option<f64> {
    match threshold {
        Some(_) if !records.is_empty() && records.iter().all(|r| get(r).is_none()) => {
            warn!(metric, "threshold enabled but metric absent from all records; skipping");
            None
        }
        t => t,
    }
}

fn passes(record: &Record, filters: &FilteringConfig) -> bool {
    let checks = [
        (filters.pae_threshold, record.pae),
        (filters.rmsd_threshold, record.rmsd),
        (filters.ddg_threshold, record.ddg),
    ];
    checks.iter().all(|(threshold, value)| match threshold {
        None => true,
        Some(t) => value.is_some_and(|v| v < *t),
    })
}
