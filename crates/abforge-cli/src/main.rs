//! Antibody Campaign Harness CLI
//!
//! The `abforge` command drives computational antibody design campaigns.
//!
//! ## Commands
//!
//! - `run`: Execute one campaign end to end, resuming past checkpoints
//! - `validate`: Check a campaign config and report every violation
//! - `analyze`: Re-run filter/rank/export over existing predictions
//! - `batch`: Run every campaign config in a directory

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use abforge_core::batch::{run_batch, BatchOptions};
use abforge_core::orchestrator::{clear_checkpoints, prepare_invocation, Orchestrator};
use abforge_core::{analysis, CampaignConfig, Stage};

#[derive(Parser)]
#[command(name = "abforge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Campaign orchestrator for the antibody design pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Root directory of the external stage programs
    #[arg(long, global = true, env = "ABFORGE_STAGE_ROOT", default_value = "stages")]
    stage_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one campaign end to end (stages resume past existing checkpoints)
    Run {
        /// Path to the campaign config (TOML)
        config: PathBuf,

        /// Validate and prepare inputs without invoking any stage
        #[arg(long)]
        dry_run: bool,

        /// Discard existing checkpoints and re-run every stage
        #[arg(long)]
        fresh: bool,
    },

    /// Validate a campaign config, reporting every violation at once
    Validate {
        /// Path to the campaign config (TOML)
        config: PathBuf,
    },

    /// Re-run the analysis pass over an existing predictions container
    Analyze {
        /// Path to the campaign config (TOML)
        config: PathBuf,
    },

    /// Run every campaign config in a directory
    Batch {
        /// Directory containing campaign configs (*.toml)
        config_dir: PathBuf,

        /// Number of concurrently running campaigns
        #[arg(long, default_value_t = 1)]
        parallel: usize,

        /// Keep running remaining campaigns after a failure
        #[arg(long)]
        continue_on_error: bool,

        /// Comma-separated campaign names to run (default: all)
        #[arg(long, value_delimiter = ',')]
        campaigns: Option<Vec<String>>,

        /// Validate and prepare inputs without invoking any stage
        #[arg(long)]
        dry_run: bool,

        /// Cross-campaign summary output directory
        #[arg(long, default_value = "batch_summary")]
        summary_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    abforge_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            dry_run,
            fresh,
        } => cmd_run(&config, &cli.stage_root, dry_run, fresh).await,
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Analyze { config } => cmd_analyze(&config),
        Commands::Batch {
            config_dir,
            parallel,
            continue_on_error,
            campaigns,
            dry_run,
            summary_dir,
        } => {
            let options = BatchOptions {
                parallel,
                continue_on_error,
                campaigns,
                dry_run,
                summary_dir,
            };
            cmd_batch(&config_dir, &cli.stage_root, &options).await
        }
    }
}

async fn cmd_run(
    config_path: &PathBuf,
    stage_root: &PathBuf,
    dry_run: bool,
    fresh: bool,
) -> Result<()> {
    let config = CampaignConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let invocation = prepare_invocation(&config);

    if dry_run {
        info!(
            campaign = %config.campaign.name,
            target = %invocation.target_pdb.display(),
            hotspots = %invocation.hotspot_string,
            "dry run: config valid, inputs prepared"
        );
        return Ok(());
    }
    if fresh {
        clear_checkpoints(&config.pipeline_dir())?;
    }

    let orchestrator = Orchestrator::new(config.clone(), stage_root);
    let outcome = orchestrator.run(&invocation).await?;
    if !outcome.success {
        bail!(
            "campaign '{}' failed: {}",
            outcome.campaign,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }

    let predictions = config
        .pipeline_dir()
        .join(Stage::StructurePrediction.output_container());
    let (summary, _) = analysis::run_analysis(&config, &predictions)?;
    info!(
        campaign = %summary.campaign,
        passed = summary.passed_filters,
        total = summary.total_designs,
        "campaign finished"
    );
    Ok(())
}

fn cmd_validate(config_path: &PathBuf) -> Result<()> {
    let config = CampaignConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    info!(campaign = %config.campaign.name, "config valid");
    Ok(())
}

fn cmd_analyze(config_path: &PathBuf) -> Result<()> {
    let config = CampaignConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let predictions = config
        .pipeline_dir()
        .join(Stage::StructurePrediction.output_container());
    if !predictions.exists() {
        bail!(
            "no predictions container at {}; run `abforge run {}` first",
            predictions.display(),
            config_path.display()
        );
    }

    let (summary, ranked) = analysis::run_analysis(&config, &predictions)?;
    info!(
        campaign = %summary.campaign,
        passed = summary.passed_filters,
        total = summary.total_designs,
        exported = ranked.len().min(config.output.top_n_candidates),
        "analysis finished"
    );
    Ok(())
}

async fn cmd_batch(
    config_dir: &PathBuf,
    stage_root: &PathBuf,
    options: &BatchOptions,
) -> Result<()> {
    let report = run_batch(config_dir, stage_root, options).await?;
    let failed = report.failed_count();
    info!(
        campaigns = report.runs.len(),
        failed,
        aborted = report.aborted.len(),
        "batch finished"
    );
    if !report.all_succeeded() {
        bail!("{failed} campaign(s) failed, {} aborted", report.aborted.len());
    }
    Ok(())
}
