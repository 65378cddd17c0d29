//! Multi-worker sharding for one pipeline stage.
//!
//! Splits the input container into one partition per worker, runs all
//! partitions concurrently (one external invocation per worker slot),
//! waits for every shard, then merges outputs in partition order. A
//! stage's output represents all requested records or none: any shard
//! failure fails the whole stage with no partial merge.

use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;
use crate::quiver::{self, ContainerHandle};
use crate::stage::{StageParams, StageRunner};

/// Env var used to pin one external invocation to one accelerator.
pub const WORKER_SLOT_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Worker slot for a shard. Static round-robin for the lifetime of one
/// run; a pure function of the shard index, never process-env mutation.
pub fn worker_slot(shard_index: usize, workers: usize) -> usize {
    shard_index % workers.max(1)
}

/// Run one stage across `workers` concurrent shards.
///
/// Short-circuits to a single direct invocation when only one worker is
/// configured or the input is too small to shard. `base_env` is applied
/// to every invocation before the per-shard worker-slot pin.
pub async fn run_sharded(
    runner: Arc<dyn StageRunner>,
    input: &ContainerHandle,
    params: &StageParams,
    workers: usize,
    workdir: &Path,
    output: &Path,
    base_env: &[(String, String)],
) -> Result<ContainerHandle> {
    if workers <= 1 || input.records <= 1 {
        return runner
            .run(&[input.clone()], params, workdir, output, base_env)
            .await;
    }

    let shard_dir = workdir.join("shards");
    let shards = quiver::split(&input.path, workers, &shard_dir)?;
    info!(
        stage = %runner.stage(),
        shards = shards.len(),
        workers,
        "fanning out sharded stage"
    );

    let mut tasks: Vec<JoinHandle<Result<ContainerHandle>>> = Vec::with_capacity(shards.len());
    for (i, shard) in shards.iter().enumerate() {
        let runner = Arc::clone(&runner);
        let shard = shard.clone();
        let params = params.clone();
        let shard_workdir = workdir.join(format!("shard_{i:04}"));
        let shard_output = shard_dir.join(format!("shard_{i:04}_out.qv"));
        let mut env = base_env.to_vec();
        env.push((
            WORKER_SLOT_ENV.to_string(),
            worker_slot(i, workers).to_string(),
        ));

        tasks.push(tokio::spawn(async move {
            runner
                .run(&[shard], &params, &shard_workdir, &shard_output, &env)
                .await
        }));
    }

    // Barrier: await every shard before deciding the stage outcome, so a
    // failure never races a half-written sibling.
    let mut outputs = Vec::with_capacity(tasks.len());
    let mut first_error = None;
    for (i, joined) in join_all(tasks).await.into_iter().enumerate() {
        match joined? {
            Ok(handle) => outputs.push(handle),
            Err(e) => {
                warn!(shard = i, error = %e, "shard failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    quiver::merge(&outputs, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{CommandStageRunner, Stage};
    use std::fs;
    use tempfile::TempDir;

    fn write_quiver(dir: &Path, n: usize) -> ContainerHandle {
        let mut body = String::new();
        for i in 0..n {
            body.push_str(&format!("QV_TAG d{i}\nATOM ...\n"));
        }
        let path = dir.join("in.qv");
        fs::write(&path, body).unwrap();
        ContainerHandle { path, records: n }
    }

    fn copy_runner() -> Arc<dyn StageRunner> {
        Arc::new(CommandStageRunner::with_command(
            Stage::SequenceDesign,
            vec!["sh".to_string(), "-c".to_string(), "cp \"$0\" \"$1\"".to_string()],
        ))
    }

    fn design_params() -> StageParams {
        StageParams::SequenceDesign(Default::default())
    }

    #[test]
    fn test_worker_slot_round_robin() {
        assert_eq!(worker_slot(0, 4), 0);
        assert_eq!(worker_slot(3, 4), 3);
        assert_eq!(worker_slot(5, 4), 1);
        assert_eq!(worker_slot(7, 1), 0);
    }

    #[tokio::test]
    async fn test_sharded_run_preserves_all_records_in_order() {
        let dir = TempDir::new().unwrap();
        let input = write_quiver(dir.path(), 10);
        let output = dir.path().join("merged.qv");

        let handle = run_sharded(
            copy_runner(),
            &input,
            &design_params(),
            3,
            dir.path(),
            &output,
            &[],
        )
        .await
        .unwrap();

        assert_eq!(handle.records, 10);
        let body = fs::read_to_string(&output).unwrap();
        let tags: Vec<&str> = body
            .lines()
            .filter_map(|l| l.strip_prefix("QV_TAG "))
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("d{i}")).collect();
        assert_eq!(tags, expected);
    }

    #[tokio::test]
    async fn test_single_worker_short_circuits() {
        let dir = TempDir::new().unwrap();
        let input = write_quiver(dir.path(), 4);
        let output = dir.path().join("out.qv");

        let handle = run_sharded(
            copy_runner(),
            &input,
            &design_params(),
            1,
            dir.path(),
            &output,
            &[],
        )
        .await
        .unwrap();
        assert_eq!(handle.records, 4);
        // No shard directory for a direct run
        assert!(!dir.path().join("shards").exists());
    }

    #[tokio::test]
    async fn test_any_shard_failure_fails_whole_stage() {
        let dir = TempDir::new().unwrap();
        let input = write_quiver(dir.path(), 6);
        let output = dir.path().join("merged.qv");

        // Fails on whichever shard holds tag d4; others succeed.
        let runner: Arc<dyn StageRunner> = Arc::new(CommandStageRunner::with_command(
            Stage::SequenceDesign,
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "if grep -q 'QV_TAG d4' \"$0\"; then echo bad shard >&2; exit 1; fi; cp \"$0\" \"$1\"".to_string(),
            ],
        ));

        let err = run_sharded(runner, &input, &design_params(), 3, dir.path(), &output, &[])
            .await
            .unwrap_err();
        assert!(err.is_stage_failure());
        // No partial merge
        assert!(!output.exists());
    }
}
