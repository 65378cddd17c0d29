//! Export of top-ranked candidates.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::analysis::rank::RankedCandidate;
use crate::error::Result;
use crate::quiver;

/// Export the top `top_k` candidates as individual payload files plus a
/// `summary.csv` table.
///
/// Asking for more candidates than exist exports everything available —
/// not an error. Returns the paths of the written candidate files.
pub fn export_candidates(
    predictions: &Path,
    ranked: &[RankedCandidate],
    top_k: usize,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)?;
    let top = &ranked[..top_k.min(ranked.len())];

    let mut written = Vec::with_capacity(top.len());
    for candidate in top {
        match quiver::extract_record(predictions, &candidate.tag)? {
            Some(payload) => {
                let path = out_dir.join(format!("{}.pdb", candidate.tag));
                std::fs::write(&path, payload)?;
                written.push(path);
            }
            None => {
                warn!(tag = %candidate.tag, "ranked tag missing from predictions container");
            }
        }
    }

    write_ranked_csv(top, &out_dir.join("summary.csv"))?;
    info!(exported = written.len(), dir = %out_dir.display(), "exported candidates");
    Ok(written)
}

/// Write a ranked table as CSV (rank, tag, metrics, composite).
pub fn write_ranked_csv(ranked: &[RankedCandidate], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for candidate in ranked {
        writer.serialize(candidate)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a ranked table back from CSV.
pub fn read_ranked_csv(path: &Path) -> Result<Vec<RankedCandidate>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn candidate(rank: usize, tag: &str, composite: f64) -> RankedCandidate {
        RankedCandidate {
            rank,
            tag: tag.to_string(),
            pae: Some(5.0),
            rmsd: Some(1.0),
            ddg: None,
            composite_score: composite,
        }
    }

    fn write_predictions(dir: &Path, tags: &[&str]) -> PathBuf {
        let mut body = String::new();
        for tag in tags {
            body.push_str(&format!(
                "QV_TAG {tag}\nATOM payload {tag}\nQV_SCORE {tag} pae=5.0\n"
            ));
        }
        let path = dir.join("predictions.qv");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_export_top_k() {
        let dir = TempDir::new().unwrap();
        let predictions = write_predictions(dir.path(), &["d0", "d1", "d2"]);
        let ranked = vec![
            candidate(1, "d2", 0.1),
            candidate(2, "d0", 0.5),
            candidate(3, "d1", 0.9),
        ];

        let out = dir.path().join("candidates");
        let written = export_candidates(&predictions, &ranked, 2, &out).unwrap();
        assert_eq!(written.len(), 2);
        assert!(out.join("d2.pdb").exists());
        assert!(out.join("d0.pdb").exists());
        assert!(!out.join("d1.pdb").exists());
        assert!(out.join("summary.csv").exists());

        let body = fs::read_to_string(out.join("d2.pdb")).unwrap();
        assert!(body.contains("ATOM payload d2"));
        assert!(!body.contains("QV_"));
    }

    #[test]
    fn test_export_more_than_available_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let predictions = write_predictions(dir.path(), &["d0"]);
        let ranked = vec![candidate(1, "d0", 0.0)];

        let written =
            export_candidates(&predictions, &ranked, 100, &dir.path().join("out")).unwrap();
        assert_eq!(written.len(), 1);
    }

    #[test]
    fn test_ranked_csv_round_trip() {
        let dir = TempDir::new().unwrap();
        let ranked = vec![candidate(1, "d0", 0.25), candidate(2, "d1", 0.75)];
        let path = dir.path().join("ranked.csv");

        write_ranked_csv(&ranked, &path).unwrap();
        let loaded = read_ranked_csv(&path).unwrap();
        assert_eq!(loaded, ranked);
    }
}
