//! Review bundle and the Gate E report sidecars.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode, Result};

pub const REVIEW_BUNDLE_SCHEMA: &str = "review_bundle.v1";

/// Verdict of a review pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    Pass,
    ChangesRequired,
}

/// One issue the reviewer raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFinding {
    /// `blocker` | `major` | `minor`.
    pub severity: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// `review/review-bundle.json` (schema `review_bundle.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewBundle {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    /// 1-based count of review passes for this run.
    pub iteration: u32,
    pub decision: ReviewDecision,
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
}

impl ReviewBundle {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != REVIEW_BUNDLE_SCHEMA {
            return Err(CoreError::new(
                ErrorCode::BundleInvalid,
                format!(
                    "review bundle schema_version {:?}, expected {REVIEW_BUNDLE_SCHEMA:?}",
                    self.schema_version
                ),
            ));
        }
        if self.iteration == 0 {
            return Err(CoreError::new(
                ErrorCode::BundleInvalid,
                "review bundle iteration must be >= 1",
            ));
        }
        if self.decision == ReviewDecision::ChangesRequired && self.findings.is_empty() {
            return Err(CoreError::new(
                ErrorCode::BundleInvalid,
                "CHANGES_REQUIRED bundle must carry at least one finding",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gate E reports
// ---------------------------------------------------------------------------

/// `reports/gate-e-citation-utilization.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationUtilizationReport {
    pub used_cids: Vec<String>,
    pub unused_cids: Vec<String>,
    pub utilization_ratio: f64,
    pub pass: bool,
}

/// `reports/gate-e-numeric-claims.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericClaimsReport {
    pub claims_total: u32,
    pub claims_cited: u32,
    pub pass: bool,
}

/// `reports/gate-e-sections.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionsReport {
    pub required: Vec<String>,
    pub present: Vec<String>,
    pub missing: Vec<String>,
    pub pass: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_wire_form() {
        assert_eq!(
            serde_json::to_string(&ReviewDecision::ChangesRequired).unwrap(),
            "\"CHANGES_REQUIRED\""
        );
        assert_eq!(serde_json::to_string(&ReviewDecision::Pass).unwrap(), "\"PASS\"");
    }

    #[test]
    fn test_changes_required_needs_findings() {
        let bundle = ReviewBundle {
            schema_version: REVIEW_BUNDLE_SCHEMA.into(),
            generated_at: Utc::now(),
            iteration: 1,
            decision: ReviewDecision::ChangesRequired,
            findings: vec![],
        };
        let err = bundle.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::BundleInvalid);

        let ok = ReviewBundle {
            findings: vec![ReviewFinding {
                severity: "blocker".into(),
                summary: "Evidence section cites no sources".into(),
                section: Some("Evidence".into()),
            }],
            ..bundle
        };
        ok.validate().expect("valid");
    }
}
