//! Campaign configuration model and validation.
//!
//! A campaign config is a TOML document with recognized top-level sections
//! (`campaign`, `target`, `antibody`, `pipeline`, `filtering`, `compute`,
//! `output`). Unrecognized keys are rejected at parse time. Validation runs
//! a fixed rule list over the typed config and collects **all** violations
//! so the user gets one complete report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// One-letter codes of the chemically hydrophobic amino acids.
pub const HYDROPHOBIC_RESIDUES: &str = "AVLIMFWPY";

/// Minimum accepted design count for the diffusion stage. Below this the
/// config is rejected outright, not clamped.
pub const MIN_NUM_DESIGNS: u64 = 20;

/// Maximum biologically plausible CDR loop length.
const MAX_CDR_LENGTH: u32 = 25;

/// Campaign identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CampaignMeta {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Target structure description.
///
/// Exactly one of `pdb_id` / `pdb_file` must be set; validation enforces
/// the mutual exclusion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(default)]
    pub pdb_id: Option<String>,

    #[serde(default)]
    pub pdb_file: Option<PathBuf>,

    #[serde(default = "default_chain_id")]
    pub chain_id: String,

    #[serde(default)]
    pub epitope_residues: Vec<u32>,

    #[serde(default)]
    pub hotspot_residues: Vec<u32>,

    /// Optional residue-number -> one-letter-code map used by the
    /// hydrophobic hotspot rule. Keys are residue numbers as strings
    /// (TOML table keys).
    #[serde(default)]
    pub hotspot_identities: BTreeMap<String, char>,
}

fn default_chain_id() -> String {
    "A".to_string()
}

/// Antibody scaffold format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AntibodyFormat {
    /// Single-chain nanobody: heavy-chain loops only.
    Vhh,

    /// Paired-chain fragment: requires both heavy and light loops.
    Scfv,
}

impl AntibodyFormat {
    pub fn name(&self) -> &'static str {
        match self {
            AntibodyFormat::Vhh => "vhh",
            AntibodyFormat::Scfv => "scfv",
        }
    }
}

/// Antibody scaffold parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AntibodyConfig {
    pub format: AntibodyFormat,

    #[serde(default = "default_framework")]
    pub framework: String,

    /// CDR loop length specs, e.g. `H3 = "5-13"` or `H1 = "7"`.
    #[serde(default)]
    pub cdr_loops: BTreeMap<String, String>,
}

fn default_framework() -> String {
    "builtin:NbBCII10".to_string()
}

/// Stage 1 parameters: backbone diffusion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DiffusionParams {
    #[serde(default = "default_num_designs")]
    pub num_designs: u64,

    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_num_designs() -> u64 {
    10_000
}

impl Default for DiffusionParams {
    fn default() -> Self {
        Self {
            num_designs: default_num_designs(),
            seed: None,
        }
    }
}

/// Stage 2 parameters: sequence design.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SequenceDesignParams {
    #[serde(default = "default_sequences_per_backbone")]
    pub sequences_per_backbone: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_sequences_per_backbone() -> u32 {
    5
}

fn default_temperature() -> f64 {
    0.2
}

impl Default for SequenceDesignParams {
    fn default() -> Self {
        Self {
            sequences_per_backbone: default_sequences_per_backbone(),
            temperature: default_temperature(),
        }
    }
}

/// Stage 3 parameters: structure prediction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StructurePredictionParams {
    #[serde(default = "default_recycling_iterations")]
    pub recycling_iterations: u32,
}

fn default_recycling_iterations() -> u32 {
    10
}

impl Default for StructurePredictionParams {
    fn default() -> Self {
        Self {
            recycling_iterations: default_recycling_iterations(),
        }
    }
}

/// Per-stage numeric parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub diffusion: DiffusionParams,

    #[serde(default)]
    pub sequence_design: SequenceDesignParams,

    #[serde(default)]
    pub structure_prediction: StructurePredictionParams,
}

/// Filter thresholds. Each is independently disableable by omission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilteringConfig {
    #[serde(default = "default_pae_threshold")]
    pub pae_threshold: Option<f64>,

    #[serde(default = "default_rmsd_threshold")]
    pub rmsd_threshold: Option<f64>,

    #[serde(default = "default_ddg_threshold")]
    pub ddg_threshold: Option<f64>,
}

fn default_pae_threshold() -> Option<f64> {
    Some(10.0)
}

fn default_rmsd_threshold() -> Option<f64> {
    Some(2.0)
}

fn default_ddg_threshold() -> Option<f64> {
    Some(-20.0)
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            pae_threshold: default_pae_threshold(),
            rmsd_threshold: default_rmsd_threshold(),
            ddg_threshold: default_ddg_threshold(),
        }
    }
}

/// Compute topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ComputeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    1
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Output location and export count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub directory: PathBuf,

    #[serde(default = "default_top_n")]
    pub top_n_candidates: usize,

    #[serde(default)]
    pub keep_intermediates: bool,
}

fn default_top_n() -> usize {
    50
}

/// Fully-typed campaign configuration. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    pub campaign: CampaignMeta,
    pub target: TargetConfig,
    pub antibody: AntibodyConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub filtering: FilteringConfig,

    #[serde(default)]
    pub compute: ComputeConfig,

    pub output: OutputConfig,
}

impl CampaignConfig {
    /// Parse a TOML document and run the full rule list.
    ///
    /// Returns `ConfigValidation` carrying every violated rule, never a
    /// partial report.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| HarnessError::MissingInput(path.to_path_buf()))?;
        Self::parse(&raw)
    }

    /// Parse from a TOML string (unknown keys rejected) and validate.
    pub fn parse(raw: &str) -> Result<Self> {
        let config: CampaignConfig = toml::from_str(raw)?;
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(HarnessError::ConfigValidation(errors));
        }
        Ok(config)
    }

    /// Run every validation rule and collect all violations. Pure.
    pub fn validate(&self) -> Vec<String> {
        VALIDATION_RULES
            .iter()
            .flat_map(|rule| rule(self))
            .collect()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output.directory
    }

    pub fn pipeline_dir(&self) -> PathBuf {
        self.output.directory.join("pipeline")
    }

    pub fn analysis_dir(&self) -> PathBuf {
        self.output.directory.join("analysis")
    }

    pub fn candidates_dir(&self) -> PathBuf {
        self.output.directory.join("candidates")
    }
}

type Rule = fn(&CampaignConfig) -> Vec<String>;

/// The composable rule list. `validate()` is a pure reduction over this.
const VALIDATION_RULES: &[Rule] = &[
    rule_target_source,
    rule_hotspot_subset,
    rule_hotspot_hydrophobicity,
    rule_antibody_loops,
    rule_cdr_specs,
    rule_pipeline_bounds,
    rule_filter_thresholds,
    rule_compute_and_output,
];

fn rule_target_source(c: &CampaignConfig) -> Vec<String> {
    let has_id = c.target.pdb_id.is_some();
    let has_file = c.target.pdb_file.is_some();
    if has_id == has_file {
        vec!["target: exactly one of pdb_id or pdb_file must be set".to_string()]
    } else {
        Vec::new()
    }
}

fn rule_hotspot_subset(c: &CampaignConfig) -> Vec<String> {
    let mut errors = Vec::new();
    let extra: Vec<u32> = c
        .target
        .hotspot_residues
        .iter()
        .filter(|r| !c.target.epitope_residues.contains(r))
        .copied()
        .collect();
    if !extra.is_empty() {
        errors.push(format!(
            "target: hotspot residues {extra:?} not in epitope_residues"
        ));
    }
    if c.target.hotspot_residues.len() < 3 {
        errors.push(
            "target: hotspot_residues must contain >= 3 residues \
             (>= 3 hydrophobic needed for stable binding)"
                .to_string(),
        );
    }
    errors
}

fn rule_hotspot_hydrophobicity(c: &CampaignConfig) -> Vec<String> {
    if c.target.hotspot_identities.is_empty() {
        // Identities unavailable; the count rule above still applies and
        // chemistry is re-checked during structure validation.
        return Vec::new();
    }
    let hydrophobic = c
        .target
        .hotspot_residues
        .iter()
        .filter(|r| {
            c.target
                .hotspot_identities
                .get(&r.to_string())
                .is_some_and(|aa| HYDROPHOBIC_RESIDUES.contains(aa.to_ascii_uppercase()))
        })
        .count();
    if hydrophobic < 3 {
        vec![format!(
            "target: only {hydrophobic} hotspot residues are hydrophobic ({HYDROPHOBIC_RESIDUES}); need >= 3"
        )]
    } else {
        Vec::new()
    }
}

fn rule_antibody_loops(c: &CampaignConfig) -> Vec<String> {
    let mut errors = Vec::new();
    match c.antibody.format {
        AntibodyFormat::Vhh => {
            for loop_name in c.antibody.cdr_loops.keys() {
                if loop_name.starts_with('L') {
                    errors.push(format!(
                        "antibody: vhh format cannot have light chain loop {loop_name}"
                    ));
                }
            }
        }
        AntibodyFormat::Scfv => {
            let has_heavy = c.antibody.cdr_loops.keys().any(|k| k.starts_with('H'));
            let has_light = c.antibody.cdr_loops.keys().any(|k| k.starts_with('L'));
            if !(has_heavy && has_light) {
                errors.push("antibody: scfv format requires both H and L CDR loops".to_string());
            }
        }
    }
    errors
}

fn rule_cdr_specs(c: &CampaignConfig) -> Vec<String> {
    c.antibody
        .cdr_loops
        .iter()
        .filter_map(|(name, spec)| validate_cdr_spec(name, spec))
        .collect()
}

fn rule_pipeline_bounds(c: &CampaignConfig) -> Vec<String> {
    let mut errors = Vec::new();
    if c.pipeline.diffusion.num_designs < MIN_NUM_DESIGNS {
        errors.push(format!(
            "pipeline.diffusion.num_designs must be >= {MIN_NUM_DESIGNS}"
        ));
    }
    if c.pipeline.sequence_design.sequences_per_backbone < 1 {
        errors.push("pipeline.sequence_design.sequences_per_backbone must be >= 1".to_string());
    }
    let temp = c.pipeline.sequence_design.temperature;
    if !(temp > 0.0 && temp <= 1.0) || !temp.is_finite() {
        errors.push("pipeline.sequence_design.temperature must be in (0, 1]".to_string());
    }
    if c.pipeline.structure_prediction.recycling_iterations < 1 {
        errors.push("pipeline.structure_prediction.recycling_iterations must be >= 1".to_string());
    }
    errors
}

fn rule_filter_thresholds(c: &CampaignConfig) -> Vec<String> {
    let mut errors = Vec::new();
    // pAE and RMSD are magnitudes: enabled thresholds must be finite and > 0.
    for (name, value) in [
        ("pae_threshold", c.filtering.pae_threshold),
        ("rmsd_threshold", c.filtering.rmsd_threshold),
    ] {
        if let Some(v) = value {
            if !v.is_finite() || v <= 0.0 {
                errors.push(format!("filtering.{name} must be a finite number > 0"));
            }
        }
    }
    // ddG is an energy difference and may legitimately be negative.
    if let Some(v) = c.filtering.ddg_threshold {
        if !v.is_finite() {
            errors.push("filtering.ddg_threshold must be a finite number".to_string());
        }
    }
    errors
}

fn rule_compute_and_output(c: &CampaignConfig) -> Vec<String> {
    let mut errors = Vec::new();
    if c.compute.workers < 1 {
        errors.push("compute.workers must be >= 1".to_string());
    }
    if c.output.top_n_candidates < 1 {
        errors.push("output.top_n_candidates must be >= 1".to_string());
    }
    errors
}

/// Validate a CDR loop length spec like `"7"` or `"5-13"`.
fn validate_cdr_spec(loop_name: &str, spec: &str) -> Option<String> {
    let spec = spec.trim();
    if let Some((lo, hi)) = spec.split_once('-') {
        let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) else {
            return Some(format!("antibody: {loop_name}: non-integer range '{spec}'"));
        };
        if lo < 1 || hi < lo {
            return Some(format!("antibody: {loop_name}: invalid range {lo}-{hi}"));
        }
        if hi > MAX_CDR_LENGTH {
            return Some(format!(
                "antibody: {loop_name}: max length {hi} exceeds biological limit ({MAX_CDR_LENGTH})"
            ));
        }
    } else {
        let Ok(len) = spec.parse::<u32>() else {
            return Some(format!(
                "antibody: {loop_name}: non-integer length '{spec}'"
            ));
        };
        if len < 1 || len > MAX_CDR_LENGTH {
            return Some(format!(
                "antibody: {loop_name}: length {len} out of range [1, {MAX_CDR_LENGTH}]"
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> String {
        r#"
            [campaign]
            name = "her2_vhh"

            [target]
            pdb_id = "1N8Z"
            epitope_residues = [54, 56, 58, 60, 62]
            hotspot_residues = [56, 60, 62]

            [antibody]
            format = "vhh"

            [antibody.cdr_loops]
            H1 = "7"
            H3 = "5-13"

            [output]
            directory = "./results/her2_vhh"
        "#
        .to_string()
    }

    #[test]
    fn test_valid_config_parses_with_defaults() {
        let config = CampaignConfig::parse(&base_toml()).unwrap();
        assert_eq!(config.campaign.name, "her2_vhh");
        assert_eq!(config.pipeline.diffusion.num_designs, 10_000);
        assert_eq!(config.filtering.pae_threshold, Some(10.0));
        assert_eq!(config.compute.workers, 1);
        assert_eq!(config.output.top_n_candidates, 50);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let raw = base_toml() + "\n[bogus]\nkey = 1\n";
        assert!(CampaignConfig::parse(&raw).is_err());
    }

    #[test]
    fn test_both_target_sources_rejected() {
        let raw = base_toml().replace(
            "pdb_id = \"1N8Z\"",
            "pdb_id = \"1N8Z\"\npdb_file = \"local.pdb\"",
        );
        let err = CampaignConfig::parse(&raw).unwrap_err();
        match err {
            HarnessError::ConfigValidation(errors) => {
                assert!(errors.iter().any(|e| e.contains("exactly one")));
            }
            other => panic!("expected ConfigValidation, got {other:?}"),
        }
    }

    #[test]
    fn test_hotspot_subset_scenario() {
        // hotspots {56, 60, 115} with epitope {54, 56, 58, 60, 62}
        let raw = base_toml().replace(
            "hotspot_residues = [56, 60, 62]",
            "hotspot_residues = [56, 60, 115]",
        );
        let err = CampaignConfig::parse(&raw).unwrap_err();
        match err {
            HarnessError::ConfigValidation(errors) => {
                assert!(
                    errors.iter().any(|e| e.contains("115")),
                    "expected hotspot-subset violation, got {errors:?}"
                );
            }
            other => panic!("expected ConfigValidation, got {other:?}"),
        }

        // Subset holds -> passes
        let ok = base_toml().replace(
            "hotspot_residues = [56, 60, 62]",
            "hotspot_residues = [56, 60, 62]",
        );
        assert!(CampaignConfig::parse(&ok).is_ok());
    }

    #[test]
    fn test_hotspot_minimum_count() {
        let raw = base_toml().replace(
            "hotspot_residues = [56, 60, 62]",
            "hotspot_residues = [56, 60]",
        );
        let err = CampaignConfig::parse(&raw).unwrap_err();
        match err {
            HarnessError::ConfigValidation(errors) => {
                assert!(errors.iter().any(|e| e.contains(">= 3 residues")));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_hydrophobicity_rule_with_identities() {
        let raw = base_toml()
            + r#"
            [target.hotspot_identities]
            56 = "L"
            60 = "S"
            62 = "T"
        "#;
        let err = CampaignConfig::parse(&raw).unwrap_err();
        match err {
            HarnessError::ConfigValidation(errors) => {
                assert!(errors.iter().any(|e| e.contains("hydrophobic")));
            }
            other => panic!("{other:?}"),
        }

        let ok = base_toml()
            + r#"
            [target.hotspot_identities]
            56 = "L"
            60 = "F"
            62 = "W"
        "#;
        assert!(CampaignConfig::parse(&ok).is_ok());
    }

    #[test]
    fn test_vhh_forbids_light_chain_loops() {
        let raw = base_toml().replace("H1 = \"7\"", "H1 = \"7\"\nL1 = \"8-13\"");
        let err = CampaignConfig::parse(&raw).unwrap_err();
        match err {
            HarnessError::ConfigValidation(errors) => {
                assert!(errors.iter().any(|e| e.contains("light chain loop L1")));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_scfv_requires_both_chains() {
        let raw = base_toml().replace("format = \"vhh\"", "format = \"scfv\"");
        let err = CampaignConfig::parse(&raw).unwrap_err();
        match err {
            HarnessError::ConfigValidation(errors) => {
                assert!(errors.iter().any(|e| e.contains("both H and L")));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_num_designs_below_minimum_rejected_not_clamped() {
        let raw = base_toml()
            + r#"
            [pipeline.diffusion]
            num_designs = 10
        "#;
        let err = CampaignConfig::parse(&raw).unwrap_err();
        match err {
            HarnessError::ConfigValidation(errors) => {
                assert!(errors.iter().any(|e| e.contains("num_designs must be >= 20")));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn test_threshold_sign_rules() {
        // RMSD threshold must be > 0
        let raw = base_toml()
            + r#"
            [filtering]
            rmsd_threshold = -1.0
        "#;
        let err = CampaignConfig::parse(&raw).unwrap_err();
        match err {
            HarnessError::ConfigValidation(errors) => {
                assert!(errors.iter().any(|e| e.contains("rmsd_threshold")));
            }
            other => panic!("{other:?}"),
        }

        // ddG threshold may be negative
        let ok = base_toml()
            + r#"
            [filtering]
            ddg_threshold = -30.0
        "#;
        assert!(CampaignConfig::parse(&ok).is_ok());
    }

    #[test]
    fn test_all_violations_collected() {
        let raw = r#"
            [campaign]
            name = "broken"

            [target]
            epitope_residues = []
            hotspot_residues = [1]

            [antibody]
            format = "scfv"

            [pipeline.diffusion]
            num_designs = 5

            [compute]
            workers = 0

            [output]
            directory = "./out"
        "#;
        let config: CampaignConfig = toml::from_str(raw).unwrap();
        let errors = config.validate();
        // target source, hotspot subset+count, scfv loops, num_designs, workers
        assert!(errors.len() >= 5, "expected full report, got {errors:?}");
    }

    #[test]
    fn test_cdr_spec_grammar() {
        assert!(validate_cdr_spec("H1", "7").is_none());
        assert!(validate_cdr_spec("H3", "5-13").is_none());
        assert!(validate_cdr_spec("H3", "13-5").is_some());
        assert!(validate_cdr_spec("H3", "5-30").is_some());
        assert!(validate_cdr_spec("H1", "abc").is_some());
        assert!(validate_cdr_spec("H1", "0").is_some());
    }
}
