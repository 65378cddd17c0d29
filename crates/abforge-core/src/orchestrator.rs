//! Campaign orchestration: the 3-stage sequential state machine.
//!
//! All resume state lives on disk as checkpoint-marker files; the
//! in-memory state is recomputed from the filesystem on every entry, so a
//! crash mid-stage simply re-runs that stage on the next invocation
//! (at-least-once execution). Checkpoints are written strictly after the
//! stage's output container is complete, via atomic rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CampaignConfig;
use crate::error::{HarnessError, Result};
use crate::parallel;
use crate::quiver::{self, ContainerHandle};
use crate::stage::{
    CommandStageRunner, DiffusionInvocation, Stage, StageParams, StageReport, StageRunner,
};

/// Durable marker asserting a stage's output container is complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageCheckpoint {
    pub stage: Stage,
    pub completed_at: DateTime<Utc>,
}

/// Orchestrator state, derived purely from checkpoint presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    NotStarted,

    /// The named stage and everything before it are checkpointed.
    StageDone(Stage),

    /// All three stages are checkpointed.
    Complete,
}

/// Outcome of one orchestrator run. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignOutcome {
    pub campaign: String,
    pub success: bool,
    pub elapsed_ms: u64,
    pub stages: Vec<StageReport>,

    /// Final predictions container, present on success.
    pub predictions: Option<ContainerHandle>,

    /// Failure description when `success` is false.
    pub error: Option<String>,
}

/// Derive the resume state from checkpoint files alone.
///
/// Recomputed on every entry point; never cached across runs. A stage
/// counts as done only when it and all prior stages are checkpointed, so
/// an orphaned later checkpoint cannot skip an unfinished earlier stage.
pub fn derive_state(pipeline_dir: &Path) -> OrchestratorState {
    let mut last_done = None;
    for stage in Stage::ALL {
        if pipeline_dir.join(stage.checkpoint_file()).exists() {
            last_done = Some(stage);
        } else {
            break;
        }
    }
    match last_done {
        None => OrchestratorState::NotStarted,
        Some(Stage::StructurePrediction) => OrchestratorState::Complete,
        Some(stage) => OrchestratorState::StageDone(stage),
    }
}

/// Write a checkpoint marker via write-temp-then-rename.
///
/// Must be called only after the stage's output container is fully
/// written: ordering, not atomicity, is the resume guarantee.
pub fn write_checkpoint(pipeline_dir: &Path, stage: Stage) -> Result<()> {
    let checkpoint = StageCheckpoint {
        stage,
        completed_at: Utc::now(),
    };
    let body = serde_json::to_string_pretty(&checkpoint)?;
    let final_path = pipeline_dir.join(stage.checkpoint_file());
    let tmp_path = pipeline_dir.join(format!("{}.tmp", stage.checkpoint_file()));
    std::fs::write(&tmp_path, body)?;
    std::fs::rename(&tmp_path, &final_path)?;
    info!(stage = %stage, "checkpoint saved");
    Ok(())
}

/// Read a stage checkpoint, `None` when absent.
pub fn read_checkpoint(pipeline_dir: &Path, stage: Stage) -> Result<Option<StageCheckpoint>> {
    let path = pipeline_dir.join(stage.checkpoint_file());
    if !path.exists() {
        return Ok(None);
    }
    let body = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&body)?))
}

/// Remove all checkpoint markers and shard scratch to force a full re-run.
pub fn clear_checkpoints(pipeline_dir: &Path) -> Result<()> {
    for stage in Stage::ALL {
        let cp = pipeline_dir.join(stage.checkpoint_file());
        if cp.exists() {
            std::fs::remove_file(&cp)?;
            info!(stage = %stage, "removed checkpoint");
        }
        let workdir = pipeline_dir.join(stage.name());
        if workdir.exists() {
            std::fs::remove_dir_all(&workdir)?;
        }
    }
    Ok(())
}

/// Build the diffusion-stage invocation from a validated config.
///
/// Input preparation (structure fetch, truncation, framework conversion)
/// is an external collaborator; this only derives the paths and argument
/// strings the stage command line needs.
pub fn prepare_invocation(config: &CampaignConfig) -> DiffusionInvocation {
    let prep_dir = config.output_dir().join("prep");
    let target_pdb = match &config.target.pdb_file {
        Some(file) => file.clone(),
        None => prep_dir.join(format!(
            "{}.pdb",
            config.target.pdb_id.as_deref().unwrap_or("target")
        )),
    };
    let hotspot_string = config
        .target
        .hotspot_residues
        .iter()
        .map(|r| format!("{}{}", config.target.chain_id, r))
        .collect::<Vec<_>>()
        .join(",");
    let cdr_loop_string = config
        .antibody
        .cdr_loops
        .iter()
        .map(|(name, spec)| format!("{name}:{spec}"))
        .collect::<Vec<_>>()
        .join(",");
    DiffusionInvocation {
        target_pdb,
        framework_pdb: prep_dir.join("framework.pdb"),
        hotspot_string,
        cdr_loop_string,
        num_designs: config.pipeline.diffusion.num_designs,
        seed: config.pipeline.diffusion.seed,
    }
}

/// Drives the three stage runners in order with checkpointed resume.
pub struct Orchestrator {
    config: CampaignConfig,
    runners: HashMap<Stage, Arc<dyn StageRunner>>,
    base_env: Vec<(String, String)>,
}

impl Orchestrator {
    /// Build an orchestrator wrapping the external stage programs under
    /// `stage_root`.
    pub fn new(config: CampaignConfig, stage_root: &Path) -> Self {
        let runners = Stage::ALL
            .into_iter()
            .map(|stage| {
                let runner: Arc<dyn StageRunner> =
                    Arc::new(CommandStageRunner::new(stage, stage_root));
                (stage, runner)
            })
            .collect();
        Self {
            config,
            runners,
            base_env: Vec::new(),
        }
    }

    /// Build with explicit stage runners (tests and alternate backends).
    pub fn with_runners(
        config: CampaignConfig,
        runners: HashMap<Stage, Arc<dyn StageRunner>>,
    ) -> Self {
        Self {
            config,
            runners,
            base_env: Vec::new(),
        }
    }

    /// Environment applied to every stage invocation, for example a
    /// batch-level worker-slot pin.
    pub fn base_env(mut self, env: Vec<(String, String)>) -> Self {
        self.base_env = env;
        self
    }

    pub fn pipeline_dir(&self) -> PathBuf {
        self.config.pipeline_dir()
    }

    /// Execute all three stages sequentially, resuming past any stage
    /// whose checkpoint already exists.
    ///
    /// Stage failures yield a failed `CampaignOutcome` (partial outputs
    /// left on disk, no checkpoint written for the failed stage).
    /// Checkpoint inconsistencies and infrastructure errors propagate as
    /// `Err` — resume never silently proceeds past a bad marker.
    pub async fn run(&self, prepared: &DiffusionInvocation) -> Result<CampaignOutcome> {
        let start = Instant::now();
        let pipeline_dir = self.pipeline_dir();
        tokio::fs::create_dir_all(&pipeline_dir).await?;

        info!(
            campaign = %self.config.campaign.name,
            state = ?derive_state(&pipeline_dir),
            "starting campaign"
        );

        let mut reports = Vec::new();
        let mut current: Option<ContainerHandle> = None;

        for stage in Stage::ALL {
            let output = pipeline_dir.join(stage.output_container());

            if read_checkpoint(&pipeline_dir, stage)?.is_some() {
                // Checkpoint implies the output container is complete;
                // verify before trusting it.
                let records = if output.exists() { quiver::count(&output)? } else { 0 };
                if records == 0 {
                    return Err(HarnessError::CheckpointInconsistent {
                        stage,
                        path: output,
                    });
                }
                info!(stage = %stage, records, "checkpoint found, skipping stage");
                let handle = ContainerHandle {
                    path: output.clone(),
                    records,
                };
                reports.push(StageReport {
                    stage,
                    duration_ms: 0,
                    records,
                    log_path: pipeline_dir.join(stage.name()).join(format!("{}.log", stage.name())),
                    resumed: true,
                });
                current = Some(handle);
                continue;
            }

            let stage_start = Instant::now();
            let params = self.stage_params(stage, prepared);
            let workdir = pipeline_dir.join(stage.name());
            let result = self.run_stage(stage, current.as_ref(), &params, &workdir, &output).await;

            match result {
                Ok(handle) => {
                    // Output container is complete on disk; only now is
                    // the checkpoint allowed to exist.
                    write_checkpoint(&pipeline_dir, stage)?;
                    reports.push(StageReport {
                        stage,
                        duration_ms: stage_start.elapsed().as_millis() as u64,
                        records: handle.records,
                        log_path: workdir.join(format!("{}.log", stage.name())),
                        resumed: false,
                    });
                    current = Some(handle);
                }
                Err(e) if e.is_stage_failure() => {
                    warn!(
                        campaign = %self.config.campaign.name,
                        stage = %stage,
                        error = %e,
                        "stage failed; leaving partial outputs for inspection"
                    );
                    return Ok(CampaignOutcome {
                        campaign: self.config.campaign.name.clone(),
                        success: false,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                        stages: reports,
                        predictions: None,
                        error: Some(e.to_string()),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            campaign = %self.config.campaign.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "campaign complete"
        );
        Ok(CampaignOutcome {
            campaign: self.config.campaign.name.clone(),
            success: true,
            elapsed_ms: start.elapsed().as_millis() as u64,
            stages: reports,
            predictions: current,
            error: None,
        })
    }

    async fn run_stage(
        &self,
        stage: Stage,
        input: Option<&ContainerHandle>,
        params: &StageParams,
        workdir: &Path,
        output: &Path,
    ) -> Result<ContainerHandle> {
        let runner = Arc::clone(&self.runners[&stage]);
        match input {
            // Diffusion has no input container and runs monolithically.
            None => runner.run(&[], params, workdir, output, &self.base_env).await,
            Some(input) => {
                parallel::run_sharded(
                    runner,
                    input,
                    params,
                    self.config.compute.workers,
                    workdir,
                    output,
                    &self.base_env,
                )
                .await
            }
        }
    }

    fn stage_params(&self, stage: Stage, prepared: &DiffusionInvocation) -> StageParams {
        match stage {
            Stage::Diffusion => StageParams::Diffusion(prepared.clone()),
            Stage::SequenceDesign => {
                StageParams::SequenceDesign(self.config.pipeline.sequence_design.clone())
            }
            Stage::StructurePrediction => StageParams::StructurePrediction(
                self.config.pipeline.structure_prediction.clone(),
            ),
        }
    }
}
