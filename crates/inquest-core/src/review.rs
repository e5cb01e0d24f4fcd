//! Review factory and the Gate E report sidecars.
//!
//! The review compares the synthesis draft against the summary pack
//! and the validated citation pool, writes three reports under
//! `reports/`, and emits `review/review-bundle.json` with a
//! PASS / CHANGES_REQUIRED decision.

use chrono::Utc;

use crate::citations::read_citations;
use crate::error::{CoreError, ErrorCode, Result};
use crate::gates_eval::{extract_cid_markers, has_heading, REQUIRED_SYNTHESIS_HEADINGS};
use crate::paths::RunPaths;
use crate::schema::citations::{CitationRecord, CitationStatus};
use crate::schema::review::{
    CitationUtilizationReport, NumericClaimsReport, ReviewBundle, ReviewDecision, ReviewFinding,
    SectionsReport, REVIEW_BUNDLE_SCHEMA,
};
use crate::store;

/// Minimum share of the valid citation pool the draft must use.
pub const MIN_CITATION_UTILIZATION: f64 = 0.25;

fn numeric_claim_lines(markdown: &str) -> Vec<(usize, String)> {
    let re = regex::Regex::new(r"\d+(\.\d+)?\s*(%|percent|million|billion|thousand|x\b)")
        .expect("static regex");
    markdown
        .lines()
        .enumerate()
        .filter(|(_, line)| re.is_match(line))
        .map(|(idx, line)| (idx + 1, line.to_string()))
        .collect()
}

/// Build the citation-utilization report.
pub fn citation_utilization_report(
    markdown: &str,
    citations: &[CitationRecord],
) -> CitationUtilizationReport {
    let valid: Vec<&str> = citations
        .iter()
        .filter(|r| r.status == CitationStatus::Valid)
        .map(|r| r.cid.as_str())
        .collect();
    let used: std::collections::BTreeSet<String> =
        extract_cid_markers(markdown).into_iter().collect();

    let used_cids: Vec<String> = valid
        .iter()
        .filter(|cid| used.contains(**cid))
        .map(|c| c.to_string())
        .collect();
    let unused_cids: Vec<String> = valid
        .iter()
        .filter(|cid| !used.contains(**cid))
        .map(|c| c.to_string())
        .collect();

    let utilization_ratio = if valid.is_empty() {
        0.0
    } else {
        used_cids.len() as f64 / valid.len() as f64
    };

    CitationUtilizationReport {
        used_cids,
        unused_cids,
        utilization_ratio,
        pass: utilization_ratio >= MIN_CITATION_UTILIZATION,
    }
}

/// Build the numeric-claims report: every line making a quantified
/// claim must carry a citation marker.
pub fn numeric_claims_report(markdown: &str) -> NumericClaimsReport {
    let claims = numeric_claim_lines(markdown);
    let cited = claims
        .iter()
        .filter(|(_, line)| !extract_cid_markers(line).is_empty())
        .count();
    NumericClaimsReport {
        claims_total: claims.len() as u32,
        claims_cited: cited as u32,
        pass: cited == claims.len(),
    }
}

/// Build the sections report against the required headings.
pub fn sections_report(markdown: &str) -> SectionsReport {
    let required: Vec<String> = REQUIRED_SYNTHESIS_HEADINGS
        .iter()
        .map(|h| h.to_string())
        .collect();
    let present: Vec<String> = required
        .iter()
        .filter(|h| has_heading(markdown, h))
        .cloned()
        .collect();
    let missing: Vec<String> = required
        .iter()
        .filter(|h| !present.contains(h))
        .cloned()
        .collect();
    let pass = missing.is_empty();
    SectionsReport {
        required,
        present,
        missing,
        pass,
    }
}

/// Write the three Gate E reports and return them.
pub fn gate_e_reports(
    paths: &RunPaths,
) -> Result<(CitationUtilizationReport, NumericClaimsReport, SectionsReport)> {
    let markdown = store::read_text(&paths.synthesis_md())?;
    let citations = read_citations(paths)?;

    let utilization = citation_utilization_report(&markdown, &citations);
    let numeric = numeric_claims_report(&markdown);
    let sections = sections_report(&markdown);

    for (name, value) in [
        ("citation-utilization", serde_json::to_value(&utilization)),
        ("numeric-claims", serde_json::to_value(&numeric)),
        ("sections", serde_json::to_value(&sections)),
    ] {
        let value = value
            .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize report: {e}")))?;
        store::atomic_write_json(&paths.gate_e_report(name), &value)?;
    }

    Ok((utilization, numeric, sections))
}

/// Run the review factory: derive findings, decide, and persist the
/// bundle. The iteration count continues from any previous bundle.
pub fn review_factory_run(paths: &RunPaths) -> Result<ReviewBundle> {
    let markdown = store::read_text(&paths.synthesis_md())?;
    let citations = read_citations(paths)?;
    let (utilization, numeric, sections) = gate_e_reports(paths)?;

    let mut findings = Vec::new();

    for heading in &sections.missing {
        findings.push(ReviewFinding {
            severity: "blocker".into(),
            summary: format!("Required section `{heading}` is missing"),
            section: Some(heading.clone()),
        });
    }

    let valid: std::collections::BTreeSet<&str> = citations
        .iter()
        .filter(|r| r.status == CitationStatus::Valid)
        .map(|r| r.cid.as_str())
        .collect();
    for cid in extract_cid_markers(&markdown) {
        if !valid.contains(cid.as_str()) {
            findings.push(ReviewFinding {
                severity: "blocker".into(),
                summary: format!("Marker [@{cid}] does not resolve to a valid citation"),
                section: None,
            });
        }
    }

    if numeric.claims_cited < numeric.claims_total {
        findings.push(ReviewFinding {
            severity: "major".into(),
            summary: format!(
                "{} of {} numeric claims lack a citation",
                numeric.claims_total - numeric.claims_cited,
                numeric.claims_total
            ),
            section: None,
        });
    }

    if !utilization.pass {
        findings.push(ReviewFinding {
            severity: "major".into(),
            summary: format!(
                "Only {:.0}% of valid citations are used in the draft",
                utilization.utilization_ratio * 100.0
            ),
            section: None,
        });
    }

    let blocking = findings
        .iter()
        .any(|f| f.severity == "blocker" || f.severity == "major");
    let decision = if blocking {
        ReviewDecision::ChangesRequired
    } else {
        ReviewDecision::Pass
    };

    let iteration = match read_review_bundle(paths) {
        Ok(previous) => previous.iteration + 1,
        Err(err) if err.code == ErrorCode::NotFound => 1,
        Err(err) => return Err(err),
    };

    let bundle = ReviewBundle {
        schema_version: REVIEW_BUNDLE_SCHEMA.to_string(),
        generated_at: Utc::now(),
        iteration,
        decision,
        findings,
    };
    bundle.validate()?;

    let value = serde_json::to_value(&bundle)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize bundle: {e}")))?;
    store::atomic_write_json(&paths.review_bundle(), &value)?;

    tracing::info!(
        event = "review.completed",
        iteration = bundle.iteration,
        decision = ?bundle.decision,
        findings = bundle.findings.len(),
    );
    Ok(bundle)
}

/// Read the persisted review bundle.
pub fn read_review_bundle(paths: &RunPaths) -> Result<ReviewBundle> {
    let value = store::read_json(&paths.review_bundle())?;
    let bundle: ReviewBundle = serde_json::from_value(value).map_err(|e| {
        CoreError::new(ErrorCode::BundleInvalid, format!("review bundle does not parse: {e}"))
    })?;
    bundle.validate()?;
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(cid: &str, status: CitationStatus) -> CitationRecord {
        CitationRecord {
            cid: cid.into(),
            normalized_url: format!("https://e.example/{cid}"),
            url: format!("https://e.example/{cid}"),
            url_original: format!("https://e.example/{cid}"),
            status,
            checked_at: Utc::now(),
            found_by: vec![],
            http_status: None,
            title: None,
            publisher: None,
            evidence_snippet: None,
            notes: String::new(),
        }
    }

    fn seed(paths: &RunPaths, draft: &str, cids: &[(&str, CitationStatus)]) {
        for dir in paths.seed_dirs() {
            std::fs::create_dir_all(dir).unwrap();
        }
        store::atomic_write_text(&paths.synthesis_md(), draft).unwrap();
        let mut records: Vec<CitationRecord> =
            cids.iter().map(|(cid, s)| record(cid, *s)).collect();
        crate::citations::write_citations(paths, &mut records).unwrap();
    }

    fn clean_draft() -> String {
        "## Summary\nAll good [@c-0001].\n## Key Findings\n- Growth of 40% [@c-0001]\n## Evidence\n- [@c-0001]\n## Caveats\n- none\n".into()
    }

    #[test]
    fn test_clean_draft_passes() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed(&paths, &clean_draft(), &[("c-0001", CitationStatus::Valid)]);

        let bundle = review_factory_run(&paths).expect("review");
        assert_eq!(bundle.decision, ReviewDecision::Pass);
        assert_eq!(bundle.iteration, 1);
        assert!(paths.gate_e_report("citation-utilization").exists());
        assert!(paths.gate_e_report("numeric-claims").exists());
        assert!(paths.gate_e_report("sections").exists());
    }

    #[test]
    fn test_uncited_numeric_claim_requires_changes() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        let draft = "## Summary\nx [@c-0001]\n## Key Findings\n- Revenue rose 80% last year\n## Evidence\n- [@c-0001]\n## Caveats\n- none\n";
        seed(&paths, draft, &[("c-0001", CitationStatus::Valid)]);

        let bundle = review_factory_run(&paths).expect("review");
        assert_eq!(bundle.decision, ReviewDecision::ChangesRequired);
        assert!(bundle
            .findings
            .iter()
            .any(|f| f.summary.contains("numeric claims")));
    }

    #[test]
    fn test_iteration_continues_from_previous_bundle() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed(&paths, &clean_draft(), &[("c-0001", CitationStatus::Valid)]);

        let first = review_factory_run(&paths).expect("first");
        let second = review_factory_run(&paths).expect("second");
        assert_eq!(first.iteration, 1);
        assert_eq!(second.iteration, 2);
    }

    #[test]
    fn test_unresolved_marker_is_blocker() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        let draft = "## Summary\nx [@c-0002]\n## Key Findings\n- y [@c-0002]\n## Evidence\n- [@c-0002]\n## Caveats\n- none\n";
        seed(&paths, draft, &[("c-0001", CitationStatus::Valid)]);

        let bundle = review_factory_run(&paths).expect("review");
        assert_eq!(bundle.decision, ReviewDecision::ChangesRequired);
        assert!(bundle.findings.iter().any(|f| f.severity == "blocker"));
    }

    #[test]
    fn test_utilization_report_ratio() {
        let citations = vec![
            record("c-0001", CitationStatus::Valid),
            record("c-0002", CitationStatus::Valid),
            record("c-0003", CitationStatus::Invalid),
        ];
        let report = citation_utilization_report("uses [@c-0001] only", &citations);
        assert_eq!(report.used_cids, vec!["c-0001"]);
        assert_eq!(report.unused_cids, vec!["c-0002"]);
        assert!((report.utilization_ratio - 0.5).abs() < 1e-9);
        assert!(report.pass);
    }
}
