//! Synthesis draft writer.

use std::path::PathBuf;

use chrono::Utc;

use crate::citations::read_citations;
use crate::error::{CoreError, ErrorCode, Result};
use crate::gates_eval::{extract_cid_markers, has_heading, REQUIRED_SYNTHESIS_HEADINGS};
use crate::paths::RunPaths;
use crate::schema::citations::CitationStatus;
use crate::schema::synthesis::SynthesisMeta;
use crate::store;
use crate::summary::summary_pack_read;

/// Where the draft comes from.
#[derive(Debug, Clone)]
pub enum SynthesisSource {
    /// Operator-provided markdown file.
    Fixture { path: PathBuf },
    /// Deterministic composition from the summary pack and citations.
    Generated,
}

impl SynthesisSource {
    fn mode_name(&self) -> &'static str {
        match self {
            Self::Fixture { .. } => "fixture",
            Self::Generated => "generated",
        }
    }
}

fn compose_draft(paths: &RunPaths) -> Result<String> {
    let pack = summary_pack_read(paths)?;
    let valid: Vec<String> = read_citations(paths)?
        .into_iter()
        .filter(|r| r.status == CitationStatus::Valid)
        .map(|r| r.cid)
        .collect();

    let mut md = String::from("## Summary\n\n");
    md.push_str(&format!(
        "Synthesis across {} perspective summaries.\n\n",
        pack.entries.len()
    ));

    md.push_str("## Key Findings\n\n");
    for entry in &pack.entries {
        for claim in &entry.key_claims {
            let markers: String = claim
                .citation_cids
                .iter()
                .filter(|cid| valid.contains(*cid))
                .map(|cid| format!(" [@{cid}]"))
                .collect();
            md.push_str(&format!("- {}{markers}\n", claim.text));
        }
    }

    md.push_str("\n## Evidence\n\n");
    for cid in valid.iter().take(10) {
        md.push_str(&format!("- [@{cid}]\n"));
    }

    md.push_str("\n## Caveats\n\n- Derived summaries bound the depth of this draft.\n");
    Ok(md)
}

/// Write `synthesis/final-synthesis.md` and its meta sidecar.
///
/// The draft must carry the four required headings and at least one
/// `[@cid]` marker that resolves to a `valid` citation.
pub fn synthesis_write(paths: &RunPaths, source: &SynthesisSource) -> Result<SynthesisMeta> {
    let markdown = match source {
        SynthesisSource::Fixture { path } => store::read_text(path)?,
        SynthesisSource::Generated => compose_draft(paths)?,
    };

    for heading in REQUIRED_SYNTHESIS_HEADINGS {
        if !has_heading(&markdown, heading) {
            return Err(CoreError::new(
                ErrorCode::MissingRequiredSection,
                format!("synthesis draft lacks the `## {heading}` heading"),
            ));
        }
    }

    let valid: std::collections::BTreeSet<String> = read_citations(paths)?
        .into_iter()
        .filter(|r| r.status == CitationStatus::Valid)
        .map(|r| r.cid)
        .collect();
    let markers = extract_cid_markers(&markdown);
    if !markers.iter().any(|cid| valid.contains(cid)) {
        return Err(CoreError::new(
            ErrorCode::UnknownCid,
            "synthesis draft cites no valid citation",
        )
        .with_details(serde_json::json!({ "markers": markers })));
    }

    store::atomic_write_text(&paths.synthesis_md(), &markdown)?;
    let meta = SynthesisMeta::new(
        source.mode_name(),
        store::sha256_digest_for_text(&markdown),
        Utc::now(),
    );
    let value = serde_json::to_value(&meta)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize meta: {e}")))?;
    store::atomic_write_json(&paths.synthesis_meta(), &value)?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::citations::CitationRecord;
    use crate::schema::summary::{KeyClaim, SummaryEntry, SummaryPack, SUMMARY_PACK_SCHEMA};
    use tempfile::tempdir;

    fn seed(paths: &RunPaths) {
        for dir in paths.seed_dirs() {
            std::fs::create_dir_all(dir).unwrap();
        }
        let record = CitationRecord {
            cid: "c-0001".into(),
            normalized_url: "https://a.example/x".into(),
            url: "https://a.example/x".into(),
            url_original: "https://a.example/x".into(),
            status: CitationStatus::Valid,
            checked_at: Utc::now(),
            found_by: vec![],
            http_status: None,
            title: None,
            publisher: None,
            evidence_snippet: None,
            notes: String::new(),
        };
        crate::citations::write_citations(paths, &mut vec![record]).unwrap();

        let pack = SummaryPack {
            schema_version: SUMMARY_PACK_SCHEMA.into(),
            generated_at: Utc::now(),
            total_size_kb: 1,
            entries: vec![SummaryEntry {
                perspective_id: "p-A".into(),
                path: "summaries/p-A.md".into(),
                size_kb: 1,
                key_claims: vec![KeyClaim {
                    text: "X grew substantially".into(),
                    citation_cids: vec!["c-0001".into()],
                }],
            }],
        };
        store::atomic_write_json(&paths.summary_pack(), &serde_json::to_value(&pack).unwrap())
            .unwrap();
    }

    #[test]
    fn test_generated_draft_passes_own_checks() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed(&paths);

        let meta = synthesis_write(&paths, &SynthesisSource::Generated).expect("write");
        assert_eq!(meta.mode, "generated");
        assert!(paths.synthesis_md().exists());

        let markdown = store::read_text(&paths.synthesis_md()).unwrap();
        assert!(markdown.contains("[@c-0001]"));
        assert_eq!(meta.digest, store::sha256_digest_for_text(&markdown));
    }

    #[test]
    fn test_fixture_missing_heading_rejected() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed(&paths);

        let draft = dir.path().join("draft.md");
        std::fs::write(&draft, "## Summary\nonly a summary [@c-0001]\n").unwrap();

        let err = synthesis_write(&paths, &SynthesisSource::Fixture { path: draft }).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingRequiredSection);
        assert!(!paths.synthesis_md().exists());
    }

    #[test]
    fn test_fixture_without_valid_cid_rejected() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed(&paths);

        let draft = dir.path().join("draft.md");
        std::fs::write(
            &draft,
            "## Summary\nx [@c-9999]\n## Key Findings\n-\n## Evidence\n-\n## Caveats\n-\n",
        )
        .unwrap();

        let err = synthesis_write(&paths, &SynthesisSource::Fixture { path: draft }).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownCid);
    }
}
