//! Quiver (.qv) container operations.
//!
//! A quiver file holds many named records. Each record starts with a
//! `QV_TAG {tag}` line followed by payload lines; `QV_SCORE {tag} k=v|k=v`
//! lines carry per-record numeric scores. The engine never interprets the
//! payload — it only counts, splits, merges, and extracts scores by tag.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};

const TAG_PREFIX: &str = "QV_TAG";
const SCORE_PREFIX: &str = "QV_SCORE";

/// Opaque reference to a quiver file plus its record count.
///
/// Produced by exactly one stage invocation and consumed by exactly one
/// downstream step (or merged from N shard outputs into one).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Path to the container file.
    pub path: PathBuf,

    /// Number of records it holds.
    pub records: usize,
}

impl ContainerHandle {
    /// Build a handle for an existing container, counting its records.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(HarnessError::MissingInput(path));
        }
        let records = count(&path)?;
        Ok(Self { path, records })
    }
}

/// One candidate design plus its scalar evaluation metrics.
///
/// A missing metric is `None`, never an error — downstream filters decide
/// what to do with incomplete rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub tag: String,
    pub pae: Option<f64>,
    pub rmsd: Option<f64>,
    pub ddg: Option<f64>,
}

/// Count the number of records in a quiver file.
pub fn count(path: &Path) -> Result<usize> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|l| l.starts_with(TAG_PREFIX))
        .count())
}

/// Split a container into `n` partitions as evenly as possible.
///
/// Partition sizes differ by at most one, partition order preserves the
/// original record order, and no record is duplicated or dropped. Empty
/// trailing partitions are not written, so fewer than `n` files come back
/// when the container holds fewer than `n` records.
pub fn split(path: &Path, n: usize, out_dir: &Path) -> Result<Vec<ContainerHandle>> {
    assert!(n >= 1, "partition count must be >= 1");
    let entries = read_entries(path)?;
    fs::create_dir_all(out_dir)?;

    let total = entries.len();
    let base = total / n;
    let remainder = total % n;

    let mut handles = Vec::new();
    let mut offset = 0usize;
    for i in 0..n {
        let size = base + usize::from(i < remainder);
        if size == 0 {
            break;
        }
        let part = &entries[offset..offset + size];
        offset += size;

        let part_path = out_dir.join(format!("shard_{i:04}.qv"));
        let mut body = String::new();
        for entry in part {
            body.push_str(&entry.block);
        }
        fs::write(&part_path, body)?;
        debug!(shard = i, records = size, path = %part_path.display(), "wrote shard");
        handles.push(ContainerHandle {
            path: part_path,
            records: size,
        });
    }

    info!(
        total,
        shards = handles.len(),
        source = %path.display(),
        "split container"
    );
    Ok(handles)
}

/// Merge containers by concatenation in input-list order.
///
/// Tags must be globally unique across inputs; a duplicate tag is a
/// corruption signal and fails the merge outright.
pub fn merge(parts: &[ContainerHandle], out_path: &Path) -> Result<ContainerHandle> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut body = String::new();
    let mut total = 0usize;

    for part in parts {
        for entry in read_entries(&part.path)? {
            if !seen.insert(entry.tag.clone()) {
                return Err(HarnessError::MergeConflict { tag: entry.tag });
            }
            body.push_str(&entry.block);
            total += 1;
        }
    }

    fs::write(out_path, body)?;
    info!(parts = parts.len(), records = total, out = %out_path.display(), "merged containers");
    Ok(ContainerHandle {
        path: out_path.to_path_buf(),
        records: total,
    })
}

/// Extract one score row per record from `QV_SCORE` lines.
///
/// Score lines are `QV_SCORE {tag} k=v|k=v|...`. The prediction stage
/// emits its structural metric as `target_aligned_cdr_rmsd`; that key is
/// aliased to `rmsd` here so filtering sees canonical names.
pub fn extract_scores(path: &Path) -> Result<Vec<Record>> {
    let content = fs::read_to_string(path)?;
    let mut records = Vec::new();

    for line in content.lines() {
        if !line.starts_with(SCORE_PREFIX) {
            continue;
        }
        let mut parts = line.splitn(3, char::is_whitespace);
        parts.next(); // prefix
        let Some(tag) = parts.next() else { continue };
        let Some(kvs) = parts.next() else { continue };

        let mut record = Record {
            tag: tag.to_string(),
            pae: None,
            rmsd: None,
            ddg: None,
        };
        for kv in kvs.split('|') {
            let Some((key, value)) = kv.split_once('=') else {
                continue;
            };
            let Ok(value) = value.trim().parse::<f64>() else {
                continue;
            };
            match key.trim() {
                "pae" => record.pae = Some(value),
                "rmsd" | "target_aligned_cdr_rmsd" => record.rmsd = Some(value),
                "ddg" | "dG_separated" => record.ddg = Some(value),
                _ => {}
            }
        }
        records.push(record);
    }

    if records.is_empty() {
        warn!(path = %path.display(), "no QV_SCORE lines found");
    }
    Ok(records)
}

/// Extract one record's payload block (score lines stripped) by tag.
///
/// Used for per-candidate artifact export; `None` when the tag is absent.
pub fn extract_record(path: &Path, tag: &str) -> Result<Option<String>> {
    for entry in read_entries(path)? {
        if entry.tag == tag {
            let payload: String = entry
                .block
                .lines()
                .filter(|l| !l.starts_with(TAG_PREFIX) && !l.starts_with(SCORE_PREFIX))
                .map(|l| format!("{l}\n"))
                .collect();
            return Ok(Some(payload));
        }
    }
    Ok(None)
}

struct Entry {
    tag: String,
    /// Full text block including the QV_TAG line and any score lines.
    block: String,
}

fn read_entries(path: &Path) -> Result<Vec<Entry>> {
    let content = fs::read_to_string(path)?;
    let mut entries: Vec<Entry> = Vec::new();

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix(TAG_PREFIX) {
            let tag = rest.trim().to_string();
            entries.push(Entry {
                tag,
                block: format!("{line}\n"),
            });
        } else if let Some(entry) = entries.last_mut() {
            entry.block.push_str(line);
            entry.block.push('\n');
        }
        // Lines before the first QV_TAG are dropped; nothing upstream
        // produces them.
    }

    Ok(entries)
}
