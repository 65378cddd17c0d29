//! Deterministic filter → rank → export analysis over a predictions
//! container. Recomputed fresh from the latest predictions each time it
//! runs; never mutated in place.

pub mod aggregate;
pub mod export;
pub mod filter;
pub mod rank;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CampaignConfig;
use crate::error::Result;
use crate::quiver;

pub use aggregate::{campaign_stats, combine_ranked, write_aggregates, CampaignStats};
pub use export::{export_candidates, read_ranked_csv, write_ranked_csv};
pub use filter::apply_filters;
pub use rank::{rank_candidates, RankedCandidate};

/// Campaign-level analysis summary, written as `summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisSummary {
    pub campaign: String,
    pub total_designs: usize,
    pub passed_filters: usize,
    pub pass_rate_pct: f64,
    pub best_tag: Option<String>,
    pub best_composite: Option<f64>,
}

/// Run the full analysis pass for one campaign.
///
/// Extracts scores from the predictions container, filters, ranks, writes
/// `analysis/ranked.csv` + `analysis/summary.json`, and exports the top-K
/// candidates. Pure apart from the declared file outputs.
pub fn run_analysis(
    config: &CampaignConfig,
    predictions: &Path,
) -> Result<(AnalysisSummary, Vec<RankedCandidate>)> {
    let scores = quiver::extract_scores(predictions)?;
    info!(designs = scores.len(), "extracted scores");

    let filtered = apply_filters(&scores, &config.filtering);
    if filtered.is_empty() {
        warn!("no designs passed filters");
    }
    let ranked = rank_candidates(&filtered);

    let analysis_dir = config.analysis_dir();
    std::fs::create_dir_all(&analysis_dir)?;
    write_ranked_csv(&ranked, &analysis_dir.join("ranked.csv"))?;

    let total = scores.len();
    let summary = AnalysisSummary {
        campaign: config.campaign.name.clone(),
        total_designs: total,
        passed_filters: ranked.len(),
        pass_rate_pct: if total > 0 {
            (ranked.len() as f64 / total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        },
        best_tag: ranked.first().map(|c| c.tag.clone()),
        best_composite: ranked.first().map(|c| c.composite_score),
    };
    std::fs::write(
        analysis_dir.join("summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;

    if !ranked.is_empty() {
        export_candidates(
            predictions,
            &ranked,
            config.output.top_n_candidates,
            &config.candidates_dir(),
        )?;
    }

    info!(
        campaign = %summary.campaign,
        passed = summary.passed_filters,
        total = summary.total_designs,
        pass_rate_pct = summary.pass_rate_pct,
        "analysis complete"
    );
    Ok((summary, ranked))
}
