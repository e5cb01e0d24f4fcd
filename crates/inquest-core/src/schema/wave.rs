//! Wave plan, output sidecars, wave review, and retry directives.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::schema::manifest::StageId;

pub const WAVE1_PLAN_SCHEMA: &str = "wave1_plan.v1";
pub const WAVE_OUTPUT_META_SCHEMA: &str = "wave_output_meta.v1";
pub const WAVE_REVIEW_SCHEMA: &str = "wave_review.v1";
pub const RETRY_DIRECTIVES_SCHEMA: &str = "retry_directives.v1";
pub const AGENT_RESULT_SCHEMA: &str = "agent_result.v1";

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One planned agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub perspective_id: String,
    pub agent_type: String,
    /// Full prompt handed to the driver.
    pub prompt_md: String,
    /// Output path relative to the run root.
    pub output_md: String,
}

/// `wave-1/wave1-plan.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wave1Plan {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    /// Digest of the perspectives document the plan was built from. A
    /// tick refuses a plan whose digest no longer matches.
    pub perspectives_digest: String,
    pub entries: Vec<PlanEntry>,
}

impl Wave1Plan {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != WAVE1_PLAN_SCHEMA {
            return Err(CoreError::schema(format!(
                "wave1 plan schema_version {:?}, expected {WAVE1_PLAN_SCHEMA:?}",
                self.schema_version
            )));
        }
        if self.entries.is_empty() {
            return Err(CoreError::schema("wave1 plan has no entries"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output sidecar
// ---------------------------------------------------------------------------

/// `<pid>.meta.json` next to every wave output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveOutputMeta {
    pub schema_version: String,
    /// `sha256:<hex>` of the exact prompt that produced the output;
    /// the freshness key for idempotent resume.
    pub prompt_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_run_id: Option<String>,
    pub ingested_at: DateTime<Utc>,
    pub source_input_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Per-tool invocation counters reported by the driver.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_usage: BTreeMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

/// Per-perspective validation outcome inside the wave review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveResultEntry {
    pub perspective_id: String,
    pub pass: bool,
    #[serde(default)]
    pub failure_codes: Vec<String>,
}

/// A structured instruction appended to the next prompt for a
/// perspective whose output failed contract validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDirective {
    pub perspective_id: String,
    pub failure_code: String,
    pub instruction: String,
}

/// `wave-review.json`: the aggregate Gate B input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveReview {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub wave: u8,
    pub ok: bool,
    pub pass: bool,
    pub validated: u32,
    pub failed: u32,
    #[serde(default)]
    pub retry_directives: Vec<RetryDirective>,
    pub results: Vec<WaveResultEntry>,
}

impl WaveReview {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != WAVE_REVIEW_SCHEMA {
            return Err(CoreError::schema(format!(
                "wave review schema_version {:?}, expected {WAVE_REVIEW_SCHEMA:?}",
                self.schema_version
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Retry directives artifact
// ---------------------------------------------------------------------------

/// `retry/retry-directives.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDirectivesDoc {
    pub schema_version: String,
    pub run_id: String,
    pub stage: StageId,
    pub generated_at: DateTime<Utc>,
    /// Set once a later successful wave consumed the directives.
    pub consumed_at: Option<DateTime<Utc>>,
    pub retry_directives: Vec<RetryDirective>,
    /// Failure codes that defer rather than fail the tick outright.
    #[serde(default)]
    pub deferred_validation_failures: Vec<String>,
}

impl RetryDirectivesDoc {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != RETRY_DIRECTIVES_SCHEMA {
            return Err(CoreError::schema(format!(
                "retry directives schema_version {:?}, expected {RETRY_DIRECTIVES_SCHEMA:?}",
                self.schema_version
            )));
        }
        Ok(())
    }

    /// Directive targeted at one perspective, if any.
    pub fn for_perspective(&self, perspective_id: &str) -> Option<&RetryDirective> {
        if self.consumed_at.is_some() {
            return None;
        }
        self.retry_directives
            .iter()
            .find(|d| d.perspective_id == perspective_id)
    }
}

// ---------------------------------------------------------------------------
// Operator-staged agent results (task driver)
// ---------------------------------------------------------------------------

/// `operator/agent-results/<pid>.json` staged by `inquest agent-result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResultDoc {
    pub schema_version: String,
    pub perspective_id: String,
    pub markdown: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_validation() {
        let plan = Wave1Plan {
            schema_version: WAVE1_PLAN_SCHEMA.into(),
            generated_at: Utc::now(),
            perspectives_digest: "sha256:abc".into(),
            entries: vec![PlanEntry {
                perspective_id: "p-A".into(),
                agent_type: "researcher".into(),
                prompt_md: "# Task".into(),
                output_md: "wave-1/p-A.md".into(),
            }],
        };
        plan.validate().expect("valid");

        let empty = Wave1Plan { entries: vec![], ..plan };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_retry_directive_lookup_skips_consumed() {
        let doc = RetryDirectivesDoc {
            schema_version: RETRY_DIRECTIVES_SCHEMA.into(),
            run_id: "r-1".into(),
            stage: StageId::Wave1,
            generated_at: Utc::now(),
            consumed_at: None,
            retry_directives: vec![RetryDirective {
                perspective_id: "p-A".into(),
                failure_code: "MISSING_REQUIRED_SECTION".into(),
                instruction: "Include a `## Sources` section.".into(),
            }],
            deferred_validation_failures: vec!["MISSING_REQUIRED_SECTION".into()],
        };
        assert!(doc.for_perspective("p-A").is_some());
        assert!(doc.for_perspective("p-B").is_none());

        let consumed = RetryDirectivesDoc {
            consumed_at: Some(Utc::now()),
            ..doc
        };
        assert!(consumed.for_perspective("p-A").is_none());
    }

    #[test]
    fn test_sidecar_serde_roundtrip() {
        let meta = WaveOutputMeta {
            schema_version: WAVE_OUTPUT_META_SCHEMA.into(),
            prompt_digest: "sha256:deadbeef".into(),
            agent_run_id: Some("agent-1".into()),
            ingested_at: Utc::now(),
            source_input_path: "driver:fixture".into(),
            started_at: None,
            finished_at: None,
            model: None,
            tool_usage: BTreeMap::from([("web_search".to_string(), 4u64)]),
        };
        let json = serde_json::to_string(&meta).expect("serialize");
        let back: WaveOutputMeta = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(meta, back);
    }
}
