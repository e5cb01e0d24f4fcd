//! Agent driver trait and the deterministic drivers shipped with the core.
//!
//! The driver is the boundary behind which subagent invocation, model
//! selection, and sandboxing live. The core owns the output file and
//! sidecar; a driver only turns a prompt into markdown and must not
//! write outside the run root.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode, Result};
use crate::paths::RunPaths;
use crate::schema::manifest::StageId;
use crate::schema::wave::AgentResultDoc;
use crate::store;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// What the orchestrator hands to a driver for one perspective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub run_id: String,
    pub stage: StageId,
    pub run_root: String,
    pub perspective_id: String,
    pub agent_type: String,
    pub prompt_md: String,
    /// Output path relative to the run root; informational for the
    /// driver, the core performs the write.
    pub output_md: String,
}

/// What a driver returns. `markdown` must be non-empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub markdown: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Per-tool invocation counters for contract validation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_usage: BTreeMap<String, u64>,
}

/// Driver backends (fixture, task, live host).
#[async_trait]
pub trait AgentDriver: Send + Sync {
    async fn run_agent(&self, request: &AgentRequest) -> Result<AgentResponse>;
}

// ---------------------------------------------------------------------------
// Fixture driver
// ---------------------------------------------------------------------------

/// On-disk shape of a fixture file: markdown keyed by perspective id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub responses: BTreeMap<String, AgentResponse>,
}

/// Deterministic driver replaying canned responses; used by tests and
/// offline replay.
pub struct FixtureDriver {
    responses: BTreeMap<String, AgentResponse>,
}

impl FixtureDriver {
    pub fn new(responses: BTreeMap<String, AgentResponse>) -> Self {
        Self { responses }
    }

    /// Load a fixture file written by the operator.
    pub fn from_file(path: &Path) -> Result<Self> {
        let value = store::read_json(path)?;
        let file: FixtureFile = serde_json::from_value(value)
            .map_err(|e| CoreError::schema(format!("fixture file does not parse: {e}")))?;
        Ok(Self::new(file.responses))
    }
}

#[async_trait]
impl AgentDriver for FixtureDriver {
    async fn run_agent(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let response = self
            .responses
            .get(&request.perspective_id)
            .cloned()
            .ok_or_else(|| {
                CoreError::new(
                    ErrorCode::RunAgentFailed,
                    format!("no fixture response for perspective {:?}", request.perspective_id),
                )
            })?;
        if response.markdown.trim().is_empty() {
            return Err(CoreError::new(
                ErrorCode::RunAgentFailed,
                format!("fixture markdown for {:?} is empty", request.perspective_id),
            ));
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Task driver
// ---------------------------------------------------------------------------

/// Driver that consumes results the operator staged with
/// `inquest agent-result`. A missing result defers the perspective to
/// a later tick instead of failing the run.
pub struct TaskDriver {
    paths: RunPaths,
}

impl TaskDriver {
    pub fn new(paths: RunPaths) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl AgentDriver for TaskDriver {
    async fn run_agent(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let path = self.paths.agent_result(&request.perspective_id);
        let value = store::read_json(&path).map_err(|err| {
            if err.code == ErrorCode::NotFound {
                CoreError::new(
                    ErrorCode::RunAgentRequired,
                    format!(
                        "no staged agent result for perspective {:?}; run `inquest agent-result`",
                        request.perspective_id
                    ),
                )
                .with_details(serde_json::json!({
                    "perspective_id": request.perspective_id,
                    "expected_path": path.display().to_string(),
                }))
            } else {
                err
            }
        })?;
        let doc: AgentResultDoc = serde_json::from_value(value)
            .map_err(|e| CoreError::schema(format!("agent result does not parse: {e}")))?;

        if doc.perspective_id != request.perspective_id {
            return Err(CoreError::schema(format!(
                "staged result names perspective {:?}, expected {:?}",
                doc.perspective_id, request.perspective_id
            )));
        }
        if doc.markdown.trim().is_empty() {
            return Err(CoreError::new(
                ErrorCode::RunAgentFailed,
                "staged agent result markdown is empty",
            ));
        }

        Ok(AgentResponse {
            markdown: doc.markdown,
            agent_run_id: doc.agent_run_id,
            started_at: doc.started_at,
            finished_at: doc.finished_at,
            model: doc.model,
            tool_usage: BTreeMap::new(),
        })
    }
}
