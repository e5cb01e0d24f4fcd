//! Telemetry event stream, index sidecar, and aggregated run metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::schema::manifest::{RunStatus, StageId};

pub const TELEMETRY_SCHEMA: &str = "telemetry.v1";
pub const TELEMETRY_INDEX_SCHEMA: &str = "telemetry_index.v1";
pub const RUN_METRICS_SCHEMA: &str = "run_metrics.v1";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Event classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryKind {
    RunStatus {
        status: RunStatus,
    },
    StageStarted {
        stage: StageId,
    },
    StageFinished {
        stage: StageId,
        /// `completed` | `retried` | `timed_out` | `failed`.
        outcome: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_s: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_kind: Option<String>,
    },
    StageRetryPlanned {
        stage: StageId,
        gate: String,
        attempt: u32,
    },
    WatchdogTimeout {
        stage: StageId,
        timeout_s: u64,
    },
}

/// One line of `logs/telemetry.jsonl` (schema `telemetry.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub schema_version: String,
    pub run_id: String,
    /// Strictly increasing positive integer across the file.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TelemetryKind,
}

impl TelemetryEvent {
    pub fn new(run_id: &str, seq: u64, kind: TelemetryKind, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: TELEMETRY_SCHEMA.to_string(),
            run_id: run_id.to_string(),
            seq,
            ts: now,
            kind,
        }
    }

    /// Validate against the manifest's run id and the event-specific
    /// constraints.
    pub fn validate(&self, expected_run_id: &str) -> Result<()> {
        if self.schema_version != TELEMETRY_SCHEMA {
            return Err(CoreError::schema(format!(
                "telemetry schema_version {:?}, expected {TELEMETRY_SCHEMA:?}",
                self.schema_version
            )));
        }
        if self.run_id != expected_run_id {
            return Err(CoreError::schema(format!(
                "telemetry run_id {:?} does not match manifest {expected_run_id:?}",
                self.run_id
            )));
        }
        if self.seq == 0 {
            return Err(CoreError::schema("telemetry seq must be positive"));
        }
        if let TelemetryKind::StageFinished { outcome, failure_kind, .. } = &self.kind {
            if outcome == "timed_out" && failure_kind.as_deref() != Some("timeout") {
                return Err(CoreError::schema(
                    "stage_finished with outcome=timed_out requires failure_kind=timeout",
                ));
            }
        }
        Ok(())
    }
}

/// `logs/telemetry.index.json`: cached tail position of the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryIndex {
    pub schema_version: String,
    pub last_seq: u64,
    pub updated_at: DateTime<Utc>,
}

impl TelemetryIndex {
    pub fn new(last_seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: TELEMETRY_INDEX_SCHEMA.to_string(),
            last_seq,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregated metrics
// ---------------------------------------------------------------------------

/// Per-stage aggregation bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub attempts_total: u64,
    pub retries_total: u64,
    pub failures_total: u64,
    pub timeouts_total: u64,
    pub duration_s: u64,
}

/// `metrics/run-metrics.json` (schema `run_metrics.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetricsDoc {
    pub schema_version: String,
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<u64>,
    /// Telemetry position the aggregation covers; unchanged position
    /// lets the writer short-circuit.
    pub last_seq: u64,
    pub stages: BTreeMap<String, StageMetrics>,
}
