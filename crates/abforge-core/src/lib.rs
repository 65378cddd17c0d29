//! Antibody Campaign Harness Core Library
//!
//! Orchestrates multi-stage computational antibody design campaigns:
//! validated TOML configs, three checkpointed external compute stages over
//! quiver containers, optional multi-worker sharding, deterministic
//! filter/rank/export analysis, and a batch runner over many campaigns.

pub mod analysis;
pub mod batch;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod parallel;
pub mod quiver;
pub mod stage;
pub mod telemetry;

pub use analysis::{
    apply_filters, rank_candidates, run_analysis, AnalysisSummary, CampaignStats, RankedCandidate,
};

pub use batch::{discover_configs, run_batch, BatchOptions, BatchReport, CampaignRun};

pub use config::{
    AntibodyFormat, CampaignConfig, ComputeConfig, FilteringConfig, OutputConfig, PipelineConfig,
    TargetConfig,
};

pub use error::{HarnessError, Result};

pub use orchestrator::{
    clear_checkpoints, derive_state, prepare_invocation, CampaignOutcome, Orchestrator,
    OrchestratorState, StageCheckpoint,
};

pub use parallel::{run_sharded, worker_slot, WORKER_SLOT_ENV};

pub use quiver::ContainerHandle;

pub use stage::{
    CommandStageRunner, DiffusionInvocation, Stage, StageParams, StageReport, StageRunner,
};

pub use telemetry::init_tracing;
