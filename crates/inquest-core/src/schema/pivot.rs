//! Pivot decision between wave-1 and either wave-2 or citations.
//!
//! The document supports both the successor shape (nested
//! `decision.wave2_required`) and a legacy top-level `run_wave2`. The
//! core reads either but writes only the successor. When both are
//! present and disagree the document is rejected rather than guessed at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const PIVOT_SCHEMA: &str = "pivot.v1";

/// Successor decision shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotDecision {
    pub wave2_required: bool,
    #[serde(default)]
    pub wave2_gap_ids: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

/// `pivot.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotDoc {
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<PivotDecision>,
    /// Legacy top-level flag. Read, never written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_wave2: Option<bool>,
}

impl PivotDoc {
    /// Successor-shape constructor; the only form the core writes.
    pub fn new(decision: PivotDecision, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: Some(PIVOT_SCHEMA.to_string()),
            generated_at: Some(now),
            decision: Some(decision),
            run_wave2: None,
        }
    }

    /// Resolve the effective decision, preferring the nested form.
    ///
    /// Both forms present and disagreeing is a producer bug, not a
    /// tie to break.
    pub fn resolve(&self) -> Result<PivotDecision> {
        match (&self.decision, self.run_wave2) {
            (Some(decision), Some(legacy)) if decision.wave2_required != legacy => {
                Err(CoreError::schema(
                    "pivot.json decision.wave2_required disagrees with legacy run_wave2",
                ))
            }
            (Some(decision), _) => Ok(decision.clone()),
            (None, Some(legacy)) => Ok(PivotDecision {
                wave2_required: legacy,
                wave2_gap_ids: Vec::new(),
                rationale: String::new(),
            }),
            (None, None) => Err(CoreError::schema(
                "pivot.json carries neither decision nor run_wave2",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_form_preferred() {
        let doc = PivotDoc {
            schema_version: Some(PIVOT_SCHEMA.into()),
            generated_at: None,
            decision: Some(PivotDecision {
                wave2_required: true,
                wave2_gap_ids: vec!["p-C".into()],
                rationale: "coverage gap".into(),
            }),
            run_wave2: Some(true),
        };
        let resolved = doc.resolve().expect("resolve");
        assert!(resolved.wave2_required);
        assert_eq!(resolved.wave2_gap_ids, vec!["p-C".to_string()]);
    }

    #[test]
    fn test_legacy_only_accepted() {
        let doc: PivotDoc = serde_json::from_str(r#"{ "run_wave2": false }"#).unwrap();
        let resolved = doc.resolve().expect("resolve");
        assert!(!resolved.wave2_required);
    }

    #[test]
    fn test_disagreement_rejected() {
        let doc = PivotDoc {
            schema_version: None,
            generated_at: None,
            decision: Some(PivotDecision {
                wave2_required: false,
                wave2_gap_ids: vec![],
                rationale: String::new(),
            }),
            run_wave2: Some(true),
        };
        assert!(doc.resolve().is_err());
    }

    #[test]
    fn test_empty_doc_rejected() {
        let doc: PivotDoc = serde_json::from_str("{}").unwrap();
        assert!(doc.resolve().is_err());
    }

    #[test]
    fn test_writer_shape_omits_legacy_field() {
        let doc = PivotDoc::new(
            PivotDecision {
                wave2_required: false,
                wave2_gap_ids: vec![],
                rationale: "wave-1 sufficient".into(),
            },
            Utc::now(),
        );
        let json = serde_json::to_string(&doc).unwrap();
        assert!(!json.contains("run_wave2"));
    }
}
