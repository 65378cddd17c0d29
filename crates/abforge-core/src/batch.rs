//! Batch execution of many campaigns.
//!
//! Phases mirror a supervised production run: discover configs, validate
//! every one up front, execute sequentially or N-way concurrent, then
//! aggregate cross-campaign artifacts. Campaign failures are isolated —
//! one campaign cannot corrupt another's outputs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

use crate::analysis::{self, RankedCandidate};
use crate::config::CampaignConfig;
use crate::error::Result;
use crate::orchestrator::{prepare_invocation, Orchestrator};
use crate::parallel::WORKER_SLOT_ENV;
use crate::stage::Stage;

/// Batch execution options.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Number of concurrently running campaigns; 1 = sequential.
    pub parallel: usize,

    /// Keep running remaining campaigns after a failure.
    pub continue_on_error: bool,

    /// Restrict to these campaign names (config file stems).
    pub campaigns: Option<Vec<String>>,

    /// Validate and prepare inputs without invoking any stage.
    pub dry_run: bool,

    /// Cross-campaign summary output directory.
    pub summary_dir: PathBuf,
}

/// Outcome of one campaign within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRun {
    pub campaign: String,
    pub config_path: PathBuf,
    pub success: bool,
    pub elapsed_seconds: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a whole batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub runs: Vec<CampaignRun>,

    /// Campaigns skipped because the batch aborted after a failure.
    pub aborted: Vec<String>,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.aborted.is_empty() && self.runs.iter().all(|r| r.success)
    }

    pub fn failed_count(&self) -> usize {
        self.runs.iter().filter(|r| !r.success).count()
    }
}

/// Discover campaign config files (`*.toml`) in a directory, sorted by
/// name, optionally restricted to a subset of campaign names.
pub fn discover_configs(config_dir: &Path, filter: Option<&[String]>) -> Result<Vec<PathBuf>> {
    let mut configs: Vec<PathBuf> = std::fs::read_dir(config_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    configs.sort();

    if let Some(names) = filter {
        configs.retain(|p| {
            p.file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| names.iter().any(|n| n == stem))
        });
    }
    Ok(configs)
}

/// Run a batch of campaigns end to end.
pub async fn run_batch(
    config_dir: &Path,
    stage_root: &Path,
    options: &BatchOptions,
) -> Result<BatchReport> {
    info!(dir = %config_dir.display(), "discovering campaigns");
    let config_paths = discover_configs(config_dir, options.campaigns.as_deref())?;
    if config_paths.is_empty() {
        warn!(dir = %config_dir.display(), "no campaign configs found");
        return Ok(BatchReport {
            runs: Vec::new(),
            aborted: Vec::new(),
        });
    }
    info!(count = config_paths.len(), "found campaign configs");

    // Validation phase: every config gets a full report before any
    // compute starts.
    let mut valid: Vec<(PathBuf, CampaignConfig)> = Vec::new();
    let mut runs: Vec<CampaignRun> = Vec::new();
    for path in &config_paths {
        match CampaignConfig::load(path) {
            Ok(config) => {
                info!(campaign = %config.campaign.name, "config valid");
                valid.push((path.clone(), config));
            }
            Err(e) => {
                error!(config = %path.display(), error = %e, "config invalid");
                runs.push(CampaignRun {
                    campaign: stem_of(path),
                    config_path: path.clone(),
                    success: false,
                    elapsed_seconds: 0.0,
                    error: Some(e.to_string()),
                });
                if !options.continue_on_error {
                    // Every discovered campaign is accounted for: the ones
                    // that already validated are aborted too, not dropped.
                    let mut aborted: Vec<String> =
                        valid.iter().map(|(_, c)| c.campaign.name.clone()).collect();
                    aborted.extend(remaining_names(&config_paths, path));
                    write_batch_log(&runs, &options.summary_dir)?;
                    return Ok(BatchReport { runs, aborted });
                }
            }
        }
    }

    // Execution phase.
    let (mut executed_runs, aborted) = if options.parallel > 1 {
        run_concurrent(valid.clone(), stage_root, options).await?
    } else {
        run_sequential(&valid, stage_root, options).await
    };
    runs.append(&mut executed_runs);

    // Aggregation phase: regenerable purely from per-campaign outputs.
    if !options.dry_run {
        aggregate(&valid, &runs, &options.summary_dir)?;
    }
    write_batch_log(&runs, &options.summary_dir)?;

    Ok(BatchReport { runs, aborted })
}

/// Run campaigns one at a time, stopping at the first failure unless
/// `continue_on_error` is set.
async fn run_sequential(
    valid: &[(PathBuf, CampaignConfig)],
    stage_root: &Path,
    options: &BatchOptions,
) -> (Vec<CampaignRun>, Vec<String>) {
    let mut runs = Vec::new();
    let mut aborted = Vec::new();
    let mut abort = false;
    let total = valid.len();

    for (i, (path, config)) in valid.iter().enumerate() {
        if abort {
            aborted.push(config.campaign.name.clone());
            continue;
        }
        info!(
            campaign = %config.campaign.name,
            position = i + 1,
            total,
            "starting campaign"
        );
        let run = run_one(path, config.clone(), stage_root, options.dry_run, &[]).await;
        let failed = !run.success;
        log_run(&run);
        runs.push(run);
        if failed && !options.continue_on_error {
            error!("aborting batch; use --continue-on-error to skip failures");
            abort = true;
        }
    }
    (runs, aborted)
}

/// One single-permit semaphore per worker slot.
///
/// A campaign holds its slot's permit for its whole run, so two campaigns
/// pinned to the same slot can never execute concurrently; total
/// concurrency is bounded by the slot count as a consequence.
#[derive(Clone)]
struct SlotPool {
    slots: Vec<Arc<Semaphore>>,
}

impl SlotPool {
    fn new(n: usize) -> Self {
        Self {
            slots: (0..n.max(1)).map(|_| Arc::new(Semaphore::new(1))).collect(),
        }
    }

    async fn acquire(
        &self,
        slot: usize,
    ) -> std::result::Result<OwnedSemaphorePermit, AcquireError> {
        self.slots[slot % self.slots.len()].clone().acquire_owned().await
    }
}

/// Run up to `parallel` campaigns concurrently, each pinned to one worker
/// slot (round-robin by submission index). A campaign does not start
/// until its slot is free.
async fn run_concurrent(
    valid: Vec<(PathBuf, CampaignConfig)>,
    stage_root: &Path,
    options: &BatchOptions,
) -> Result<(Vec<CampaignRun>, Vec<String>)> {
    let pool = SlotPool::new(options.parallel);
    let abort = Arc::new(AtomicBool::new(false));
    let continue_on_error = options.continue_on_error;
    let dry_run = options.dry_run;

    let mut tasks = Vec::with_capacity(valid.len());
    for (i, (path, mut config)) in valid.into_iter().enumerate() {
        let slot = i % options.parallel;
        let pool = pool.clone();
        let abort = Arc::clone(&abort);
        let stage_root = stage_root.to_path_buf();

        // The campaign sees exactly one worker slot; in-campaign sharding
        // is disabled so the slot is never oversubscribed.
        config.compute.workers = 1;
        let env = vec![(WORKER_SLOT_ENV.to_string(), slot.to_string())];
        info!(campaign = %config.campaign.name, slot, "submitted campaign");

        tasks.push(tokio::spawn(async move {
            // Semaphores closed only on runtime shutdown.
            let Ok(_permit) = pool.acquire(slot).await else {
                return Err(config.campaign.name.clone());
            };
            if abort.load(Ordering::SeqCst) {
                return Err(config.campaign.name.clone());
            }
            let run = run_one(&path, config, &stage_root, dry_run, &env).await;
            if !run.success && !continue_on_error {
                abort.store(true, Ordering::SeqCst);
            }
            Ok(run)
        }));
    }

    let mut runs = Vec::new();
    let mut aborted = Vec::new();
    for task in tasks {
        match task.await? {
            Ok(run) => {
                log_run(&run);
                runs.push(run);
            }
            Err(name) => aborted.push(name),
        }
    }
    Ok((runs, aborted))
}

/// Execute one campaign: orchestrate the three stages, then analyze.
async fn run_one(
    config_path: &Path,
    config: CampaignConfig,
    stage_root: &Path,
    dry_run: bool,
    env: &[(String, String)],
) -> CampaignRun {
    let start = Instant::now();
    let name = config.campaign.name.clone();
    let invocation = prepare_invocation(&config);

    if dry_run {
        info!(
            campaign = %name,
            target = %invocation.target_pdb.display(),
            hotspots = %invocation.hotspot_string,
            "dry run: inputs prepared, stopping before stage execution"
        );
        return CampaignRun {
            campaign: name,
            config_path: config_path.to_path_buf(),
            success: true,
            elapsed_seconds: start.elapsed().as_secs_f64(),
            error: None,
        };
    }

    let orchestrator = Orchestrator::new(config.clone(), stage_root).base_env(env.to_vec());
    let result = orchestrator.run(&invocation).await;

    let (success, error) = match result {
        Ok(outcome) if outcome.success => {
            let predictions = config
                .pipeline_dir()
                .join(Stage::StructurePrediction.output_container());
            match analysis::run_analysis(&config, &predictions) {
                Ok(_) => (true, None),
                Err(e) => (false, Some(format!("analysis failed: {e}"))),
            }
        }
        Ok(outcome) => (false, outcome.error),
        Err(e) => (false, Some(e.to_string())),
    };

    CampaignRun {
        campaign: name,
        config_path: config_path.to_path_buf(),
        success,
        elapsed_seconds: start.elapsed().as_secs_f64(),
        error,
    }
}

/// Collect per-campaign ranked tables for successful runs and write the
/// cross-campaign artifacts.
fn aggregate(
    valid: &[(PathBuf, CampaignConfig)],
    runs: &[CampaignRun],
    summary_dir: &Path,
) -> Result<()> {
    let mut tables: Vec<(String, Vec<RankedCandidate>)> = Vec::new();
    for (_, config) in valid {
        let succeeded = runs
            .iter()
            .any(|r| r.campaign == config.campaign.name && r.success);
        if !succeeded {
            continue;
        }
        let ranked_csv = config.analysis_dir().join("ranked.csv");
        if !ranked_csv.exists() {
            continue;
        }
        match analysis::read_ranked_csv(&ranked_csv) {
            Ok(ranked) => tables.push((config.campaign.name.clone(), ranked)),
            Err(e) => warn!(campaign = %config.campaign.name, error = %e, "could not read ranked table"),
        }
    }

    if tables.is_empty() {
        info!("no ranked tables to aggregate");
        return Ok(());
    }
    analysis::write_aggregates(&tables, summary_dir)
}

fn write_batch_log(runs: &[CampaignRun], summary_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(summary_dir)?;
    let log_path = summary_dir.join("batch_run.json");
    std::fs::write(&log_path, serde_json::to_string_pretty(runs)?)?;
    info!(path = %log_path.display(), "wrote batch log");
    Ok(())
}

fn log_run(run: &CampaignRun) {
    if run.success {
        info!(
            campaign = %run.campaign,
            elapsed = %format_elapsed(run.elapsed_seconds),
            "campaign succeeded"
        );
    } else {
        error!(
            campaign = %run.campaign,
            elapsed = %format_elapsed(run.elapsed_seconds),
            error = run.error.as_deref().unwrap_or("unknown"),
            "campaign failed"
        );
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

fn remaining_names(all: &[PathBuf], failed: &Path) -> Vec<String> {
    all.iter()
        .skip_while(|p| p.as_path() != failed)
        .skip(1)
        .map(|p| stem_of(p))
        .collect()
}

/// Human-readable elapsed time for batch summaries.
pub fn format_elapsed(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{seconds:.0}s")
    } else if seconds < 3600.0 {
        format!("{:.1}m", seconds / 60.0)
    } else {
        format!("{:.1}h", seconds / 3600.0)
    }
}
