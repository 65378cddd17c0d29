//! Integration tests driving a full campaign through the orchestrator and
//! analysis pipeline with script-backed stage runners.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use abforge_core::analysis::run_analysis;
use abforge_core::batch::{run_batch, BatchOptions};
use abforge_core::orchestrator::{derive_state, Orchestrator, OrchestratorState};
use abforge_core::stage::{CommandStageRunner, DiffusionInvocation, Stage, StageRunner};
use abforge_core::{CampaignConfig, HarnessError};

fn campaign_config(out_dir: &Path) -> CampaignConfig {
    CampaignConfig::parse(&format!(
        r#"
        [campaign]
        name = "it_campaign"

        [target]
        pdb_id = "1ABC"
        epitope_residues = [54, 56, 58, 60, 62]
        hotspot_residues = [56, 60, 62]

        [antibody]
        format = "vhh"
        [antibody.cdr_loops]
        H1 = "7"
        H3 = "5-13"

        [filtering]
        pae_threshold = 10.0
        rmsd_threshold = 2.0
        ddg_threshold = -20.0

        [compute]
        workers = 2

        [output]
        directory = "{}"
        top_n_candidates = 2
    "#,
        out_dir.display()
    ))
    .expect("config should validate")
}

fn invocation() -> DiffusionInvocation {
    DiffusionInvocation {
        target_pdb: "/tmp/target.pdb".into(),
        framework_pdb: "/tmp/framework.pdb".into(),
        hotspot_string: "A56,A60,A62".to_string(),
        cdr_loop_string: "H1:7,H3:5-13".to_string(),
        num_designs: 4,
        seed: Some(7),
    }
}

fn sh_runner(stage: Stage, script: &str) -> Arc<dyn StageRunner> {
    Arc::new(CommandStageRunner::with_command(
        stage,
        vec!["sh".to_string(), "-c".to_string(), script.to_string()],
    ))
}

/// Stage runners backed by shell scripts.
///
/// The generator emits four backbones; sequence design copies records
/// through; structure prediction copies and appends a score line per
/// record, with one design scoring past the thresholds and one failing
/// the pAE filter.
fn pipeline_runners() -> HashMap<Stage, Arc<dyn StageRunner>> {
    let generate = r#"
        for i in 0 1 2 3; do
            printf 'QV_TAG d%s\nATOM backbone %s\n' "$i" "$i" >> "$0"
        done
    "#;
    let copy = r#"cp "$0" "$1""#;
    let predict = r#"
        cp "$0" "$1"
        for tag in $(grep '^QV_TAG ' "$0" | cut -d' ' -f2); do
            case "$tag" in
                d0) printf 'QV_SCORE %s pae=4.0|rmsd=1.0|ddg=-30.0\n' "$tag" >> "$1" ;;
                d1) printf 'QV_SCORE %s pae=12.0|rmsd=1.0|ddg=-30.0\n' "$tag" >> "$1" ;;
                *)  printf 'QV_SCORE %s pae=8.0|rmsd=1.5|ddg=-25.0\n' "$tag" >> "$1" ;;
            esac
        done
    "#;

    let mut runners: HashMap<Stage, Arc<dyn StageRunner>> = HashMap::new();
    runners.insert(Stage::Diffusion, sh_runner(Stage::Diffusion, generate));
    runners.insert(Stage::SequenceDesign, sh_runner(Stage::SequenceDesign, copy));
    runners.insert(
        Stage::StructurePrediction,
        sh_runner(Stage::StructurePrediction, predict),
    );
    runners
}

#[tokio::test]
async fn test_full_campaign_through_analysis() {
    let dir = TempDir::new().unwrap();
    let config = campaign_config(&dir.path().join("out"));
    let orchestrator = Orchestrator::with_runners(config.clone(), pipeline_runners());

    let outcome = orchestrator.run(&invocation()).await.expect("run failed");
    assert!(outcome.success, "campaign should succeed");
    assert_eq!(outcome.stages.len(), 3);
    assert_eq!(derive_state(&config.pipeline_dir()), OrchestratorState::Complete);

    let predictions = outcome.predictions.expect("predictions handle");
    assert_eq!(predictions.records, 4);

    let (summary, ranked) = run_analysis(&config, &predictions.path).expect("analysis failed");
    assert_eq!(summary.total_designs, 4);
    // d1 fails the pAE threshold
    assert_eq!(summary.passed_filters, 3);
    assert_eq!(summary.best_tag.as_deref(), Some("d0"));
    assert_eq!(ranked[0].tag, "d0");

    // Top-2 export, not all three passers
    assert!(config.candidates_dir().join("d0.pdb").exists());
    assert!(!config.candidates_dir().join("d1.pdb").exists());
    assert!(config.analysis_dir().join("ranked.csv").exists());
    assert!(config.analysis_dir().join("summary.json").exists());

    let payload = fs::read_to_string(config.candidates_dir().join("d0.pdb")).unwrap();
    assert!(payload.contains("ATOM backbone 0"));
    assert!(!payload.contains("QV_"));
}

#[tokio::test]
async fn test_resume_after_mid_campaign_failure() {
    let dir = TempDir::new().unwrap();
    let config = campaign_config(&dir.path().join("out"));

    // First attempt: structure prediction crashes.
    let mut runners = pipeline_runners();
    runners.insert(
        Stage::StructurePrediction,
        sh_runner(Stage::StructurePrediction, "echo oom >&2; exit 3"),
    );
    let orchestrator = Orchestrator::with_runners(config.clone(), runners);
    let outcome = orchestrator.run(&invocation()).await.expect("run errored");
    assert!(!outcome.success);
    assert_eq!(
        derive_state(&config.pipeline_dir()),
        OrchestratorState::StageDone(Stage::SequenceDesign)
    );

    // Second attempt with a healthy runner resumes at stage 3 only.
    let orchestrator = Orchestrator::with_runners(config.clone(), pipeline_runners());
    let outcome = orchestrator.run(&invocation()).await.expect("resume failed");
    assert!(outcome.success);
    let resumed: Vec<bool> = outcome.stages.iter().map(|s| s.resumed).collect();
    assert_eq!(resumed, vec![true, true, false]);
}

#[tokio::test]
async fn test_tampered_checkpoint_stops_resume() {
    let dir = TempDir::new().unwrap();
    let config = campaign_config(&dir.path().join("out"));
    let orchestrator = Orchestrator::with_runners(config.clone(), pipeline_runners());
    let outcome = orchestrator.run(&invocation()).await.expect("run failed");
    assert!(outcome.success, "campaign should succeed");

    // Empty the diffusion output behind its checkpoint.
    fs::write(
        config.pipeline_dir().join(Stage::Diffusion.output_container()),
        "",
    )
    .unwrap();
    for stage in [Stage::SequenceDesign, Stage::StructurePrediction] {
        fs::remove_file(config.pipeline_dir().join(stage.checkpoint_file())).unwrap();
    }

    let err = orchestrator.run(&invocation()).await.unwrap_err();
    assert!(matches!(
        err,
        HarnessError::CheckpointInconsistent {
            stage: Stage::Diffusion,
            ..
        }
    ));
}

#[tokio::test]
async fn test_batch_dry_run_over_config_dir() {
    let dir = TempDir::new().unwrap();
    let configs = dir.path().join("configs");
    fs::create_dir_all(&configs).unwrap();
    for name in ["her2", "egfr"] {
        let body = format!(
            r#"
            [campaign]
            name = "{name}"

            [target]
            pdb_id = "1ABC"
            epitope_residues = [54, 56, 58, 60, 62]
            hotspot_residues = [56, 60, 62]

            [antibody]
            format = "vhh"

            [output]
            directory = "{}"
        "#,
            dir.path().join("out").join(name).display()
        );
        fs::write(configs.join(format!("{name}.toml")), body).unwrap();
    }

    let options = BatchOptions {
        parallel: 1,
        continue_on_error: false,
        campaigns: None,
        dry_run: true,
        summary_dir: dir.path().join("summary"),
    };
    let report = run_batch(&configs, Path::new("/nonexistent"), &options)
        .await
        .expect("batch failed");
    assert!(report.all_succeeded());
    assert_eq!(report.runs.len(), 2);
    assert!(dir.path().join("summary").join("batch_run.json").exists());
}
