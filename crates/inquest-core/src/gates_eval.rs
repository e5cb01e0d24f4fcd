//! Deterministic gate evaluators.
//!
//! Each evaluator is a pure function of already-parsed artifacts; it
//! never touches the filesystem or mutates state. The result carries
//! the status, the whitelisted patch for the gates writer, and the
//! digest of the inputs that produced it.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::citations::{CitationRecord, CitationStatus};
use crate::schema::gates::{GateId, GatePatch, GateStatus};
use crate::schema::manifest::{Limits, Sensitivity};
use crate::schema::perspectives::{PerspectivesDoc, Track};
use crate::schema::review::{NumericClaimsReport, SectionsReport};
use crate::schema::summary::SummaryPack;
use crate::schema::wave::WaveReview;
use crate::store;

/// Gate C threshold: minimum share of records classified `valid`.
pub const GATE_C_MIN_VALID_RATIO: f64 = 0.5;
/// Gate C threshold: maximum tolerated `blocked` records.
pub const GATE_C_MAX_BLOCKED: usize = 5;

/// Outcome of a gate evaluation, ready for the gates writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateEvaluation {
    pub gate: GateId,
    pub status: GateStatus,
    pub patch: GatePatch,
    pub inputs_digest: String,
}

fn evaluation(
    gate: GateId,
    status: GateStatus,
    metrics: serde_json::Value,
    artifacts: Vec<String>,
    warnings: Vec<String>,
    notes: String,
    inputs: &serde_json::Value,
) -> Result<GateEvaluation> {
    let inputs_digest = store::sha256_digest_for_json(inputs)?;
    Ok(GateEvaluation {
        gate,
        status,
        patch: GatePatch {
            status: Some(status),
            checked_at: Some(Utc::now()),
            metrics: Some(metrics),
            artifacts: Some(artifacts),
            warnings: Some(warnings),
            notes: Some(notes),
        },
        inputs_digest,
    })
}

// ---------------------------------------------------------------------------
// Gate A — planning completeness
// ---------------------------------------------------------------------------

/// A soft gate over the perspectives plan: structural validity, the
/// wave-1 cap, and track diversity (a plan with no independent or
/// contrarian lens passes with a warning).
pub fn gate_a_evaluate(perspectives: &PerspectivesDoc, limits: &Limits) -> Result<GateEvaluation> {
    let inputs = serde_json::to_value(perspectives).unwrap_or_default();
    let count = perspectives.perspectives.len();

    let mut warnings = Vec::new();
    let status = if perspectives.validate().is_err() {
        warnings.push("PERSPECTIVES_INVALID".to_string());
        GateStatus::Fail
    } else if count > limits.max_wave1_agents as usize {
        warnings.push("WAVE1_AGENT_CAP_EXCEEDED".to_string());
        GateStatus::Fail
    } else {
        let diverse = perspectives
            .perspectives
            .iter()
            .any(|p| p.track != Track::Standard);
        if !diverse {
            warnings.push("NO_INDEPENDENT_TRACK".to_string());
            GateStatus::Warn
        } else {
            GateStatus::Pass
        }
    };

    evaluation(
        GateId::A,
        status,
        serde_json::json!({ "perspectives": count }),
        vec!["perspectives.json".into()],
        warnings,
        String::new(),
        &inputs,
    )
}

// ---------------------------------------------------------------------------
// Gate B — wave output contract
// ---------------------------------------------------------------------------

/// Derive Gate B from `wave-review.json`.
///
/// Pass requires `ok && pass && validated > 0 && failed == 0`, no
/// outstanding retry directives, a result row per validated output,
/// and every row passing. Each violation is a named warning.
pub fn gate_b_derive(review: &WaveReview) -> Result<GateEvaluation> {
    let inputs = serde_json::to_value(review).unwrap_or_default();
    let mut warnings = Vec::new();

    if !review.ok {
        warnings.push("WAVE_REVIEW_NOT_OK".to_string());
    }
    if !review.pass {
        warnings.push("WAVE_REVIEW_FAILED".to_string());
    }
    if review.validated == 0 {
        warnings.push("NO_VALIDATED_OUTPUTS".to_string());
    }
    if review.failed != 0 {
        warnings.push("FAILED_OUTPUTS_PRESENT".to_string());
    }
    if !review.retry_directives.is_empty() {
        warnings.push("RETRY_DIRECTIVES_OUTSTANDING".to_string());
    }
    if review.results.len() != review.validated as usize {
        warnings.push("RESULT_COUNT_MISMATCH".to_string());
    }
    if review.results.iter().any(|r| !r.pass) {
        warnings.push("RESULT_ENTRY_FAILED".to_string());
    }

    let status = if warnings.is_empty() {
        GateStatus::Pass
    } else {
        GateStatus::Fail
    };

    evaluation(
        GateId::B,
        status,
        serde_json::json!({
            "validated": review.validated,
            "failed": review.failed,
            "retry_directives": review.retry_directives.len(),
        }),
        vec!["wave-review.json".into()],
        warnings,
        String::new(),
        &inputs,
    )
}

// ---------------------------------------------------------------------------
// Gate C — citation validation integrity
// ---------------------------------------------------------------------------

/// Thresholds over the validated citation pool.
pub fn gate_c_evaluate(records: &[CitationRecord]) -> Result<GateEvaluation> {
    let inputs = serde_json::to_value(records).unwrap_or_default();
    let total = records.len();
    let valid = records
        .iter()
        .filter(|r| r.status == CitationStatus::Valid)
        .count();
    let blocked = records
        .iter()
        .filter(|r| r.status == CitationStatus::Blocked)
        .count();
    let valid_ratio = if total == 0 { 0.0 } else { valid as f64 / total as f64 };

    let mut warnings = Vec::new();
    if total == 0 {
        warnings.push("NO_CITATIONS".to_string());
    }
    if valid_ratio < GATE_C_MIN_VALID_RATIO {
        warnings.push("VALID_RATIO_BELOW_THRESHOLD".to_string());
    }
    if blocked > GATE_C_MAX_BLOCKED {
        warnings.push("TOO_MANY_BLOCKED".to_string());
    }

    let status = if warnings.is_empty() {
        GateStatus::Pass
    } else {
        GateStatus::Fail
    };

    evaluation(
        GateId::C,
        status,
        serde_json::json!({
            "total": total,
            "valid": valid,
            "blocked": blocked,
            "valid_ratio": valid_ratio,
        }),
        vec!["citations/citations.jsonl".into()],
        warnings,
        String::new(),
        &inputs,
    )
}

// ---------------------------------------------------------------------------
// Gate D — summary pack boundedness
// ---------------------------------------------------------------------------

/// Size caps over the summary pack. Soft: a total within 20% of the
/// cap is a warning rather than a failure.
pub fn gate_d_evaluate(pack: &SummaryPack, limits: &Limits) -> Result<GateEvaluation> {
    let inputs = serde_json::to_value(pack).unwrap_or_default();
    let total: u64 = pack.entries.iter().map(|e| e.size_kb).sum();

    let mut warnings = Vec::new();
    for entry in &pack.entries {
        if entry.size_kb > limits.max_summary_kb {
            warnings.push(format!("ENTRY_OVER_CAP:{}", entry.perspective_id));
        }
    }
    if total > limits.max_total_summary_kb {
        warnings.push("TOTAL_OVER_CAP".to_string());
    }

    let status = if !warnings.is_empty() {
        GateStatus::Fail
    } else if total * 5 >= limits.max_total_summary_kb * 4 {
        warnings.push("TOTAL_NEAR_CAP".to_string());
        GateStatus::Warn
    } else {
        GateStatus::Pass
    };

    evaluation(
        GateId::D,
        status,
        serde_json::json!({
            "total_size_kb": total,
            "max_total_summary_kb": limits.max_total_summary_kb,
            "entries": pack.entries.len(),
        }),
        vec!["summaries/summary-pack.json".into()],
        warnings,
        String::new(),
        &inputs,
    )
}

// ---------------------------------------------------------------------------
// Gate E — synthesis quality
// ---------------------------------------------------------------------------

/// Headings the synthesis draft must carry.
pub const REQUIRED_SYNTHESIS_HEADINGS: [&str; 4] =
    ["Summary", "Key Findings", "Evidence", "Caveats"];

/// Extract `[@cid]` markers from a markdown draft, in order.
pub fn extract_cid_markers(markdown: &str) -> Vec<String> {
    let re = regex::Regex::new(r"\[@([A-Za-z0-9][A-Za-z0-9_-]*)\]").expect("static regex");
    re.captures_iter(markdown)
        .map(|c| c[1].to_string())
        .collect()
}

/// Whether a `## <heading>` line is present.
pub fn has_heading(markdown: &str, heading: &str) -> bool {
    markdown.lines().any(|line| {
        let trimmed = line.trim_start_matches('#').trim();
        line.trim_start().starts_with('#') && trimmed == heading
    })
}

/// Gate E: required headings, `[@cid]` resolution against the valid
/// citation pool, and both derived reports passing.
pub fn gate_e_evaluate(
    synthesis_md: &str,
    citations: &[CitationRecord],
    numeric_claims: &NumericClaimsReport,
    sections: &SectionsReport,
) -> Result<GateEvaluation> {
    let inputs = serde_json::json!({
        "synthesis_digest": store::sha256_digest_for_text(synthesis_md),
        "numeric_claims": numeric_claims,
        "sections": sections,
    });

    let mut warnings = Vec::new();

    for heading in REQUIRED_SYNTHESIS_HEADINGS {
        if !has_heading(synthesis_md, heading) {
            warnings.push(format!("MISSING_HEADING:{heading}"));
        }
    }

    let valid_cids: std::collections::BTreeSet<&str> = citations
        .iter()
        .filter(|r| r.status == CitationStatus::Valid)
        .map(|r| r.cid.as_str())
        .collect();
    let markers = extract_cid_markers(synthesis_md);
    if markers.is_empty() {
        warnings.push("NO_CITATION_MARKERS".to_string());
    }
    for cid in &markers {
        if !valid_cids.contains(cid.as_str()) {
            warnings.push(format!("UNRESOLVED_CID:{cid}"));
        }
    }

    if !numeric_claims.pass {
        warnings.push("NUMERIC_CLAIMS_REPORT_FAILED".to_string());
    }
    if !sections.pass {
        warnings.push("SECTIONS_REPORT_FAILED".to_string());
    }

    let status = if warnings.is_empty() {
        GateStatus::Pass
    } else {
        GateStatus::Fail
    };

    evaluation(
        GateId::E,
        status,
        serde_json::json!({
            "cid_markers": markers.len(),
            "valid_cids": valid_cids.len(),
        }),
        vec![
            "synthesis/final-synthesis.md".into(),
            "reports/gate-e-numeric-claims.json".into(),
            "reports/gate-e-sections.json".into(),
        ],
        warnings,
        String::new(),
        &inputs,
    )
}

// ---------------------------------------------------------------------------
// Gate F — rollout safety
// ---------------------------------------------------------------------------

/// Extractor endpoints visible to the ladder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractorEndpoints {
    pub bright_data: Option<String>,
    pub apify: Option<String>,
}

impl ExtractorEndpoints {
    /// Resolve from the environment.
    pub fn from_env() -> Self {
        Self {
            bright_data: std::env::var("INQUEST_BRIGHT_DATA_ENDPOINT").ok(),
            apify: std::env::var("INQUEST_APIFY_ENDPOINT").ok(),
        }
    }

    pub fn any_configured(&self) -> bool {
        self.bright_data.is_some() || self.apify.is_some()
    }
}

/// Gate F: in online mode at least one extraction endpoint must be
/// configured, unless the run is `no_web`.
pub fn gate_f_evaluate(
    citations_mode_online: bool,
    sensitivity: Sensitivity,
    endpoints: &ExtractorEndpoints,
) -> Result<GateEvaluation> {
    let inputs = serde_json::json!({
        "online": citations_mode_online,
        "sensitivity": sensitivity,
        "bright_data_configured": endpoints.bright_data.is_some(),
        "apify_configured": endpoints.apify.is_some(),
    });

    let mut warnings = Vec::new();
    let status = if citations_mode_online
        && sensitivity != Sensitivity::NoWeb
        && !endpoints.any_configured()
    {
        warnings.push("NO_EXTRACTION_ENDPOINT".to_string());
        GateStatus::Fail
    } else {
        GateStatus::Pass
    };

    evaluation(
        GateId::F,
        status,
        inputs.clone(),
        Vec::new(),
        warnings,
        String::new(),
        &inputs,
    )
}
