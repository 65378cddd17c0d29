//! Stage definitions and external stage execution.
//!
//! Each heavy compute stage is an opaque external program invoked with
//! file paths and parameters. The engine launches exactly one process per
//! invocation, streams its output into a per-invocation log file, and
//! verifies the output container against the filesystem before reporting
//! success.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{SequenceDesignParams, StructurePredictionParams};
use crate::error::{HarnessError, Result};
use crate::quiver::{self, ContainerHandle};

/// Captured-output substrings that indicate the worker ran out of compute
/// resources rather than hitting a program error.
const RESOURCE_EXHAUSTION_SIGNATURES: &[&str] = &[
    "CUDA out of memory",
    "OutOfMemoryError",
    "RESOURCE_EXHAUSTED",
    "Killed",
];

/// How many trailing log lines go into a failure excerpt.
const LOG_EXCERPT_LINES: usize = 20;

/// The three sequential heavy-compute stages of a campaign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Backbone generation by diffusion sampling.
    Diffusion,

    /// Sequence design over generated backbones.
    SequenceDesign,

    /// Complex structure prediction and scoring.
    StructurePrediction,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 3] = [
        Stage::Diffusion,
        Stage::SequenceDesign,
        Stage::StructurePrediction,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Diffusion => "diffusion",
            Stage::SequenceDesign => "sequence_design",
            Stage::StructurePrediction => "structure_prediction",
        }
    }

    /// 1-based position in the pipeline.
    pub fn index(&self) -> usize {
        match self {
            Stage::Diffusion => 1,
            Stage::SequenceDesign => 2,
            Stage::StructurePrediction => 3,
        }
    }

    /// Output container filename under the pipeline directory.
    pub fn output_container(&self) -> &'static str {
        match self {
            Stage::Diffusion => "01_backbones.qv",
            Stage::SequenceDesign => "02_sequences.qv",
            Stage::StructurePrediction => "03_predictions.qv",
        }
    }

    /// Checkpoint marker filename under the pipeline directory.
    pub fn checkpoint_file(&self) -> String {
        format!(".checkpoint_{}", self.name())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Prepared target/scaffold inputs consumed by the diffusion stage.
///
/// Produced by the (external) input-preparation step; the engine only
/// forwards these paths and strings to the stage command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffusionInvocation {
    pub target_pdb: PathBuf,
    pub framework_pdb: PathBuf,

    /// Comma-joined hotspot residue identifiers, e.g. `"A56,A60,A62"`.
    pub hotspot_string: String,

    /// Comma-joined CDR loop specs, e.g. `"H1:7,H3:5-13"`.
    pub cdr_loop_string: String,

    pub num_designs: u64,
    pub seed: Option<u64>,
}

/// Stage-specific parameter bag drawn from a validated config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StageParams {
    Diffusion(DiffusionInvocation),
    SequenceDesign(SequenceDesignParams),
    StructurePrediction(StructurePredictionParams),
}

impl StageParams {
    pub fn stage(&self) -> Stage {
        match self {
            StageParams::Diffusion(_) => Stage::Diffusion,
            StageParams::SequenceDesign(_) => Stage::SequenceDesign,
            StageParams::StructurePrediction(_) => Stage::StructurePrediction,
        }
    }
}

/// Outcome bookkeeping for one completed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub duration_ms: u64,
    pub records: usize,
    pub log_path: PathBuf,

    /// Whether the stage was skipped because its checkpoint already existed.
    pub resumed: bool,
}

/// Capability interface over one external compute stage.
///
/// Implementations launch exactly one external process per `run` call and
/// must verify the output container exists before claiming success.
#[async_trait]
pub trait StageRunner: Send + Sync {
    fn stage(&self) -> Stage;

    /// Run the stage over `inputs`, writing the output container to
    /// `output`. `env` carries per-invocation variables (worker-slot
    /// pinning); `workdir` receives the invocation log.
    async fn run(
        &self,
        inputs: &[ContainerHandle],
        params: &StageParams,
        workdir: &Path,
        output: &Path,
        env: &[(String, String)],
    ) -> Result<ContainerHandle>;
}

/// Stage runner that shells out to the external stage programs.
pub struct CommandStageRunner {
    stage: Stage,

    /// Root of the external pipeline installation (scripts + weights).
    stage_root: PathBuf,

    /// Test seam: when set, this command is executed verbatim with the
    /// input and output paths appended, instead of the real stage program.
    command_override: Option<Vec<String>>,

    /// Timeout in seconds; 0 disables the timeout.
    timeout_secs: u64,
}

impl CommandStageRunner {
    pub fn new(stage: Stage, stage_root: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            stage_root: stage_root.into(),
            command_override: None,
            timeout_secs: 0,
        }
    }

    /// Replace the stage program with an arbitrary command (tests and
    /// local smoke runs). Input and output paths are appended as the
    /// final two arguments.
    pub fn with_command(stage: Stage, command: Vec<String>) -> Self {
        Self {
            stage,
            stage_root: PathBuf::new(),
            command_override: Some(command),
            timeout_secs: 0,
        }
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Build the command line for one invocation.
    fn build_command(
        &self,
        inputs: &[ContainerHandle],
        params: &StageParams,
        output: &Path,
    ) -> Vec<String> {
        if let Some(cmd) = &self.command_override {
            let mut full = cmd.clone();
            if let Some(input) = inputs.first() {
                full.push(input.path.display().to_string());
            }
            full.push(output.display().to_string());
            return full;
        }

        let scripts = self.stage_root.join("scripts");
        match params {
            StageParams::Diffusion(inv) => {
                let mut cmd = vec![
                    "python".to_string(),
                    scripts.join("diffusion_inference.py").display().to_string(),
                    "--config-name".to_string(),
                    "antibody".to_string(),
                    format!("antibody.target_pdb={}", inv.target_pdb.display()),
                    format!("antibody.framework_pdb={}", inv.framework_pdb.display()),
                    format!("ppi.hotspot_res=[{}]", inv.hotspot_string),
                    format!("antibody.design_loops=[{}]", inv.cdr_loop_string),
                    format!("inference.num_designs={}", inv.num_designs),
                    format!("inference.quiver={}", output.display()),
                ];
                if let Some(seed) = inv.seed {
                    cmd.push(format!("inference.seed={seed}"));
                }
                cmd
            }
            StageParams::SequenceDesign(p) => {
                let input = inputs.first().map(|h| h.path.clone()).unwrap_or_default();
                vec![
                    "python".to_string(),
                    scripts.join("sequence_design.py").display().to_string(),
                    "--input".to_string(),
                    input.display().to_string(),
                    "--output".to_string(),
                    output.display().to_string(),
                    "--seqs-per-backbone".to_string(),
                    p.sequences_per_backbone.to_string(),
                    "--temperature".to_string(),
                    p.temperature.to_string(),
                ]
            }
            StageParams::StructurePrediction(p) => {
                let input = inputs.first().map(|h| h.path.clone()).unwrap_or_default();
                vec![
                    "python".to_string(),
                    scripts.join("structure_predict.py").display().to_string(),
                    "--input".to_string(),
                    input.display().to_string(),
                    "--output".to_string(),
                    output.display().to_string(),
                    "--recycling-iterations".to_string(),
                    p.recycling_iterations.to_string(),
                ]
            }
        }
    }
}

#[async_trait]
impl StageRunner for CommandStageRunner {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn run(
        &self,
        inputs: &[ContainerHandle],
        params: &StageParams,
        workdir: &Path,
        output: &Path,
        env: &[(String, String)],
    ) -> Result<ContainerHandle> {
        let start = Instant::now();
        tokio::fs::create_dir_all(workdir).await?;

        for input in inputs {
            if !input.path.exists() {
                return Err(HarnessError::MissingInput(input.path.clone()));
            }
        }

        let command = self.build_command(inputs, params, output);
        debug!(stage = %self.stage, command = ?command, "launching stage process");

        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let log_path = workdir.join(format!("{}.log", self.stage.name()));
        let child = cmd.spawn()?;
        let result = if self.timeout_secs > 0 {
            match tokio::time::timeout(
                std::time::Duration::from_secs(self.timeout_secs),
                child.wait_with_output(),
            )
            .await
            {
                Ok(output) => output?,
                Err(_) => {
                    // Dropping the wait future reaps the child via
                    // kill_on_drop; the log still gets written.
                    let excerpt = format!("timed out after {} seconds", self.timeout_secs);
                    tokio::fs::write(&log_path, &excerpt).await?;
                    return Err(HarnessError::StageFailed {
                        stage: self.stage,
                        exit_code: -1,
                        log_excerpt: excerpt,
                    });
                }
            }
        } else {
            child.wait_with_output().await?
        };

        let stdout = String::from_utf8_lossy(&result.stdout);
        let stderr = String::from_utf8_lossy(&result.stderr);
        let log_body = format!("=== stdout ===\n{stdout}\n=== stderr ===\n{stderr}");
        tokio::fs::write(&log_path, &log_body).await?;

        let exit_code = result.status.code().unwrap_or(-1);
        if !result.status.success() {
            if let Some(sig) = RESOURCE_EXHAUSTION_SIGNATURES
                .iter()
                .find(|sig| log_body.contains(*sig))
            {
                warn!(stage = %self.stage, signature = sig, "resource exhaustion detected");
                return Err(HarnessError::ResourceExhausted {
                    stage: self.stage,
                    hint: format!(
                        "captured output matched '{sig}'; reduce shard size or raise compute.workers"
                    ),
                });
            }
            return Err(HarnessError::StageFailed {
                stage: self.stage,
                exit_code,
                log_excerpt: log_excerpt(&log_body),
            });
        }

        // A zero exit is a claim, not proof. Verify the artifact.
        let record_count = if output.exists() { quiver::count(output)? } else { 0 };
        if record_count == 0 {
            return Err(HarnessError::StageFailed {
                stage: self.stage,
                exit_code,
                log_excerpt: format!(
                    "process exited 0 but output container {} is missing or empty",
                    output.display()
                ),
            });
        }

        info!(
            stage = %self.stage,
            records = record_count,
            duration_ms = start.elapsed().as_millis() as u64,
            "stage complete"
        );
        Ok(ContainerHandle {
            path: output.to_path_buf(),
            records: record_count,
        })
    }
}

/// Last lines of a captured log, for failure reports.
fn log_excerpt(log: &str) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(LOG_EXCERPT_LINES);
    lines[start..].join("\n")
}
