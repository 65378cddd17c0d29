//! Error taxonomy for the campaign harness.

use std::path::PathBuf;

use crate::stage::Stage;

/// Errors produced anywhere in the campaign engine.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Config validation failed. Carries the complete list of violated
    /// rules, never just the first one.
    #[error("config validation failed:\n{}", .0.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"))]
    ConfigValidation(Vec<String>),

    /// An external stage process exited non-zero, or claimed success
    /// without producing its output container.
    #[error("stage {stage} failed (exit {exit_code}):\n{log_excerpt}")]
    StageFailed {
        stage: Stage,
        exit_code: i32,
        log_excerpt: String,
    },

    /// Stage failure whose captured output matches a resource-exhaustion
    /// signature. Carries an actionable remediation hint.
    #[error("stage {stage} exhausted compute resources: {hint}")]
    ResourceExhausted { stage: Stage, hint: String },

    /// Duplicate tag encountered while merging shard outputs. Data
    /// corruption signal, never auto-resolved.
    #[error("merge conflict: duplicate tag '{tag}'")]
    MergeConflict { tag: String },

    /// A stage checkpoint is present but the stage's output container is
    /// missing or empty. Resume must not silently proceed past this.
    #[error("checkpoint for stage {stage} is inconsistent: output container {} missing or empty", path.display())]
    CheckpointInconsistent { stage: Stage, path: PathBuf },

    /// A required input file does not exist.
    #[error("missing input: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl HarnessError {
    /// Whether this error is a stage-level failure (including the
    /// resource-exhaustion sub-kind).
    pub fn is_stage_failure(&self) -> bool {
        matches!(
            self,
            HarnessError::StageFailed { .. } | HarnessError::ResourceExhausted { .. }
        )
    }
}

/// Result type for campaign engine operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation_lists_all_violations() {
        let err = HarnessError::ConfigValidation(vec![
            "target: exactly one source required".to_string(),
            "compute.workers must be >= 1".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("exactly one source"));
        assert!(msg.contains("workers must be >= 1"));
    }

    #[test]
    fn test_stage_failed_display() {
        let err = HarnessError::StageFailed {
            stage: Stage::Diffusion,
            exit_code: 137,
            log_excerpt: "killed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("diffusion"));
        assert!(msg.contains("137"));
    }

    #[test]
    fn test_stage_failure_classification() {
        let failed = HarnessError::StageFailed {
            stage: Stage::SequenceDesign,
            exit_code: 1,
            log_excerpt: String::new(),
        };
        let oom = HarnessError::ResourceExhausted {
            stage: Stage::StructurePrediction,
            hint: "reduce shard size".to_string(),
        };
        let merge = HarnessError::MergeConflict {
            tag: "design_7".to_string(),
        };
        assert!(failed.is_stage_failure());
        assert!(oom.is_stage_failure());
        assert!(!merge.is_stage_failure());
    }
}
