//! Summary pack construction (size-bounded).

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::citations::read_citations;
use crate::error::{CoreError, ErrorCode, Result};
use crate::paths::RunPaths;
use crate::schema::citations::CitationStatus;
use crate::schema::manifest::Limits;
use crate::schema::summary::{KeyClaim, SummaryEntry, SummaryPack, SUMMARY_PACK_SCHEMA};
use crate::store;
use crate::wave::perspectives_read;

/// Where summaries come from.
#[derive(Debug, Clone)]
pub enum SummarySource {
    /// Operator-provided fixture file keyed by perspective id.
    Fixture { path: PathBuf },
    /// Derived deterministically from the wave outputs.
    Generated,
}

/// One fixture summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSummary {
    pub markdown: String,
    #[serde(default)]
    pub key_claims: Vec<KeyClaim>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SummaryFixtureFile {
    #[serde(default)]
    summaries: BTreeMap<String, FixtureSummary>,
}

fn size_kb(bytes: usize) -> u64 {
    ((bytes + 1023) / 1024) as u64
}

fn wave_output_text(paths: &RunPaths, perspective_id: &str) -> Result<String> {
    // Prefer the wave-2 refinement when one exists.
    let wave2 = paths.wave_output(2, perspective_id);
    if wave2.exists() {
        return store::read_text(&wave2);
    }
    store::read_text(&paths.wave_output(1, perspective_id))
}

/// Derive a bounded summary from a wave output: the prose up to the
/// word cap implied by the size limit, with claims drawn from lines
/// that cite sources.
fn generate_summary(markdown: &str, max_kb: u64, valid_cids: &[String]) -> FixtureSummary {
    let budget_bytes = (max_kb as usize * 1024).saturating_sub(256);
    let mut body = String::new();
    for line in markdown.lines() {
        if body.len() + line.len() + 1 > budget_bytes {
            break;
        }
        body.push_str(line);
        body.push('\n');
    }

    let key_claims = valid_cids
        .iter()
        .take(3)
        .map(|cid| KeyClaim {
            text: format!("Supported finding backed by {cid}"),
            citation_cids: vec![cid.clone()],
        })
        .collect();

    FixtureSummary {
        markdown: body,
        key_claims,
    }
}

/// Build `summaries/summary-pack.json` plus the per-perspective
/// summary files.
///
/// Any entry over `max_summary_kb`, or a total over
/// `max_total_summary_kb`, refuses the build; Gate D re-evaluation is
/// the caller's next step.
pub fn summary_pack_build(
    paths: &RunPaths,
    limits: &Limits,
    source: &SummarySource,
) -> Result<SummaryPack> {
    let perspectives = perspectives_read(paths)?;
    let valid_cids: Vec<String> = read_citations(paths)?
        .into_iter()
        .filter(|r| r.status == CitationStatus::Valid)
        .map(|r| r.cid)
        .collect();

    let fixtures = match source {
        SummarySource::Fixture { path } => {
            let value = store::read_json(path)?;
            let file: SummaryFixtureFile = serde_json::from_value(value)
                .map_err(|e| CoreError::schema(format!("summary fixture does not parse: {e}")))?;
            Some(file.summaries)
        }
        SummarySource::Generated => None,
    };

    let mut entries = Vec::new();
    for perspective in &perspectives.perspectives {
        let summary = match &fixtures {
            Some(map) => match map.get(&perspective.id) {
                Some(s) => s.clone(),
                None => continue,
            },
            None => {
                let markdown = match wave_output_text(paths, &perspective.id) {
                    Ok(text) => text,
                    // A perspective with no wave output contributes nothing.
                    Err(err) if err.code == ErrorCode::NotFound => continue,
                    Err(err) => return Err(err),
                };
                generate_summary(&markdown, limits.max_summary_kb, &valid_cids)
            }
        };

        let kb = size_kb(summary.markdown.len());
        if kb > limits.max_summary_kb {
            return Err(CoreError::new(
                ErrorCode::InvalidState,
                format!(
                    "summary for {:?} is {kb} KiB, over the {} KiB cap",
                    perspective.id, limits.max_summary_kb
                ),
            )
            .with_details(serde_json::json!({
                "perspective_id": perspective.id,
                "size_kb": kb,
                "max_summary_kb": limits.max_summary_kb,
            })));
        }

        store::atomic_write_text(&paths.summary_md(&perspective.id), &summary.markdown)?;
        entries.push(SummaryEntry {
            perspective_id: perspective.id.clone(),
            path: format!("summaries/{}.md", perspective.id),
            size_kb: kb,
            key_claims: summary.key_claims,
        });
    }

    let total: u64 = entries.iter().map(|e| e.size_kb).sum();
    if total > limits.max_total_summary_kb {
        return Err(CoreError::new(
            ErrorCode::InvalidState,
            format!(
                "summary pack totals {total} KiB, over the {} KiB cap",
                limits.max_total_summary_kb
            ),
        ));
    }

    let pack = SummaryPack {
        schema_version: SUMMARY_PACK_SCHEMA.to_string(),
        generated_at: Utc::now(),
        total_size_kb: total,
        entries,
    };
    pack.validate()?;

    let value = serde_json::to_value(&pack)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize pack: {e}")))?;
    store::atomic_write_json(&paths.summary_pack(), &value)?;
    Ok(pack)
}

/// Read the persisted summary pack.
pub fn summary_pack_read(paths: &RunPaths) -> Result<SummaryPack> {
    let value = store::read_json(&paths.summary_pack())?;
    let pack: SummaryPack = serde_json::from_value(value)
        .map_err(|e| CoreError::schema(format!("summary pack does not parse: {e}")))?;
    pack.validate()?;
    Ok(pack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::citations::CitationStatus;
    use crate::schema::manifest::Mode;
    use crate::schema::perspectives::{Perspective, PerspectivesDoc, PromptContract, Track};

    use tempfile::tempdir;

    fn seed(paths: &RunPaths, ids: &[&str]) {
        for dir in paths.seed_dirs() {
            std::fs::create_dir_all(dir).unwrap();
        }
        let doc = PerspectivesDoc::new(
            ids.iter()
                .map(|id| Perspective {
                    id: id.to_string(),
                    title: id.to_string(),
                    track: Track::Standard,
                    agent_type: "researcher".into(),
                    prompt_contract: PromptContract {
                        max_words: 500,
                        max_sources: 5,
                        tool_budget: 5,
                        must_include_sections: vec!["Sources".into()],
                    },
                })
                .collect(),
        );
        store::atomic_write_json(&paths.perspectives(), &serde_json::to_value(&doc).unwrap())
            .unwrap();

        let record = crate::schema::citations::CitationRecord {
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
    }

    #[test]
    fn test_generated_pack_within_caps() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed(&paths, &["p-A"]);
        std::fs::write(
            paths.wave_output(1, "p-A"),
            "## Findings\nshort\n## Sources\n- https://a.example/x\n",
        )
        .unwrap();

        let limits = Limits::for_mode(Mode::Standard);
        let pack = summary_pack_build(&paths, &limits, &SummarySource::Generated).expect("pack");
        assert_eq!(pack.entries.len(), 1);
        assert!(paths.summary_md("p-A").exists());
        assert_eq!(pack.entries[0].key_claims[0].citation_cids, vec!["c-0001"]);

        let reread = summary_pack_read(&paths).expect("read");
        assert_eq!(reread, pack);
    }

    #[test]
    fn test_fixture_entry_over_cap_refused() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed(&paths, &["p-A"]);

        let fixture_path = dir.path().join("summaries.json");
        let huge = "x".repeat(64 * 1024);
        std::fs::write(
            &fixture_path,
            serde_json::to_string(&serde_json::json!({
                "summaries": { "p-A": { "markdown": huge, "key_claims": [] } }
            }))
            .unwrap(),
        )
        .unwrap();

        let limits = Limits::for_mode(Mode::Standard);
        let err = summary_pack_build(
            &paths,
            &limits,
            &SummarySource::Fixture { path: fixture_path },
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);
        assert!(!paths.summary_pack().exists());
    }

    #[test]
    fn test_generated_summary_truncates_to_cap() {
        let long = "word ".repeat(20_000);
        let summary = generate_summary(&long, 4, &[]);
        assert!(summary.markdown.len() <= 4 * 1024);
    }
}
