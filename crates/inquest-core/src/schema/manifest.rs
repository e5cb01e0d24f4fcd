//! The manifest: authoritative record of a research run.
//!
//! `manifest.json` is the only document that names the run's stage,
//! status, limits, and failure history. It is mutated exclusively
//! through the manifest writer under optimistic revision locking.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode, Result};

/// Schema discriminator for `manifest.json`.
pub const MANIFEST_SCHEMA: &str = "manifest.v1";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Research depth requested by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Quick,
    Standard,
    Deep,
}

/// How far the run may reach out to the live web.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Normal,
    Restricted,
    NoWeb,
}

/// Lifecycle status of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Paused,
    Failed,
    Completed,
    Cancelled,
}

/// Pipeline stages in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Init,
    Perspectives,
    Wave1,
    Pivot,
    Wave2,
    Citations,
    Summaries,
    Synthesis,
    Review,
    Finalize,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Perspectives => "perspectives",
            Self::Wave1 => "wave1",
            Self::Pivot => "pivot",
            Self::Wave2 => "wave2",
            Self::Citations => "citations",
            Self::Summaries => "summaries",
            Self::Synthesis => "synthesis",
            Self::Review => "review",
            Self::Finalize => "finalize",
        }
    }

    pub fn all() -> [StageId; 10] {
        [
            Self::Init,
            Self::Perspectives,
            Self::Wave1,
            Self::Pivot,
            Self::Wave2,
            Self::Citations,
            Self::Summaries,
            Self::Synthesis,
            Self::Review,
            Self::Finalize,
        ]
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// The research question and its constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub text: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    pub sensitivity: Sensitivity,
}

/// One recorded stage transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    pub from: StageId,
    pub to: StageId,
    pub ts: DateTime<Utc>,
    pub reason: String,
    pub inputs_digest: String,
    pub gates_revision: u64,
}

/// Current stage plus progress markers and transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub current: StageId,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<StageHistoryEntry>,
}

/// Hard caps for the run, resolved from the mode at init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_wave1_agents: u32,
    pub max_wave2_agents: u32,
    pub max_summary_kb: u64,
    pub max_total_summary_kb: u64,
    pub max_review_iterations: u32,
}

impl Limits {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Quick => Self {
                max_wave1_agents: 3,
                max_wave2_agents: 2,
                max_summary_kb: 24,
                max_total_summary_kb: 96,
                max_review_iterations: 1,
            },
            Mode::Standard => Self {
                max_wave1_agents: 5,
                max_wave2_agents: 3,
                max_summary_kb: 32,
                max_total_summary_kb: 160,
                max_review_iterations: 2,
            },
            Mode::Deep => Self {
                max_wave1_agents: 8,
                max_wave2_agents: 5,
                max_summary_kb: 48,
                max_total_summary_kb: 320,
                max_review_iterations: 3,
            },
        }
    }
}

/// Pointer block from the manifest into the run root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestArtifacts {
    /// Absolute path of the run root.
    pub root: String,
    /// Named relative paths for the standard artifacts.
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
}

/// Counters maintained through the manifest writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Per-gate retry counts, keyed by gate id (`"B"`, `"C"`, …).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retry_counts: BTreeMap<String, u32>,
}

/// A recorded run failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub kind: String,
    pub stage: StageId,
    pub at: DateTime<Utc>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// The authoritative run record (`manifest.json`, schema `manifest.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Strictly increasing, starts at 1.
    pub revision: u64,
    pub mode: Mode,
    pub status: RunStatus,
    pub query: QuerySpec,
    pub stage: StageState,
    pub limits: Limits,
    pub artifacts: ManifestArtifacts,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub failures: Vec<FailureEntry>,
}

impl Manifest {
    /// Canonical manifest for a freshly initialized run.
    pub fn new(
        run_id: &str,
        root: &str,
        query: QuerySpec,
        mode: Mode,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA.to_string(),
            run_id: run_id.to_string(),
            created_at: now,
            updated_at: now,
            revision: 1,
            mode,
            status: RunStatus::Created,
            query,
            stage: StageState {
                current: StageId::Init,
                started_at: now,
                last_progress_at: None,
                history: Vec::new(),
            },
            limits: Limits::for_mode(mode),
            artifacts: ManifestArtifacts {
                root: root.to_string(),
                paths: standard_artifact_paths(),
            },
            metrics: Metrics::default(),
            failures: Vec::new(),
        }
    }

    /// Structural validation; run on every read and before every write.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != MANIFEST_SCHEMA {
            return Err(CoreError::schema(format!(
                "manifest schema_version {:?}, expected {MANIFEST_SCHEMA:?}",
                self.schema_version
            )));
        }
        validate_run_id(&self.run_id)?;
        if self.revision == 0 {
            return Err(CoreError::schema("manifest revision must be >= 1"));
        }
        if self.query.text.trim().is_empty() {
            return Err(CoreError::schema("query.text must be non-empty"));
        }
        Ok(())
    }

    /// How many review→synthesis cycles this run has already taken.
    pub fn review_cycle_count(&self) -> u32 {
        self.stage
            .history
            .iter()
            .filter(|h| h.from == StageId::Review && h.to == StageId::Synthesis)
            .count() as u32
    }

    /// Retry count for a gate, zero when never retried.
    pub fn retry_count(&self, gate_id: &str) -> u32 {
        self.metrics.retry_counts.get(gate_id).copied().unwrap_or(0)
    }
}

/// `run_id` rules: non-empty, no path separators, no `..`.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.is_empty() {
        return Err(CoreError::new(ErrorCode::InvalidArgs, "run_id must be non-empty"));
    }
    if run_id.contains('/') || run_id.contains('\\') || run_id.contains("..") {
        return Err(CoreError::new(
            ErrorCode::InvalidArgs,
            format!("run_id {run_id:?} may not contain path separators or '..'"),
        ));
    }
    Ok(())
}

fn standard_artifact_paths() -> BTreeMap<String, String> {
    let mut paths = BTreeMap::new();
    for (name, rel) in [
        ("manifest", "manifest.json"),
        ("gates", "gates.json"),
        ("perspectives", "perspectives.json"),
        ("pivot", "pivot.json"),
        ("wave_review", "wave-review.json"),
        ("citations", "citations/citations.jsonl"),
        ("summary_pack", "summaries/summary-pack.json"),
        ("synthesis", "synthesis/final-synthesis.md"),
        ("review_bundle", "review/review-bundle.json"),
        ("telemetry", "logs/telemetry.jsonl"),
        ("audit", "logs/audit.jsonl"),
        ("run_metrics", "metrics/run-metrics.json"),
    ] {
        paths.insert(name.to_string(), rel.to_string());
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest::new(
            "r-1",
            "/runs/r-1",
            QuerySpec {
                text: "What is X?".into(),
                constraints: vec![],
                sensitivity: Sensitivity::Normal,
            },
            Mode::Standard,
            Utc::now(),
        )
    }

    #[test]
    fn test_new_manifest_is_valid() {
        let m = sample();
        m.validate().expect("valid");
        assert_eq!(m.revision, 1);
        assert_eq!(m.status, RunStatus::Created);
        assert_eq!(m.stage.current, StageId::Init);
        assert!(m.stage.history.is_empty());
    }

    #[test]
    fn test_serde_roundtrip() {
        let m = sample();
        let json = serde_json::to_string(&m).expect("serialize");
        let back: Manifest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(m, back);
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        let json = serde_json::to_string(&StageId::Wave1).unwrap();
        assert_eq!(json, "\"wave1\"");
        let json = serde_json::to_string(&Sensitivity::NoWeb).unwrap();
        assert_eq!(json, "\"no_web\"");
    }

    #[test]
    fn test_run_id_rules() {
        assert!(validate_run_id("r-1").is_ok());
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id("a/b").is_err());
        assert!(validate_run_id("a\\b").is_err());
        assert!(validate_run_id("..").is_err());
    }

    #[test]
    fn test_zero_revision_rejected() {
        let mut m = sample();
        m.revision = 0;
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_review_cycle_count() {
        let mut m = sample();
        assert_eq!(m.review_cycle_count(), 0);
        m.stage.history.push(StageHistoryEntry {
            from: StageId::Review,
            to: StageId::Synthesis,
            ts: Utc::now(),
            reason: "changes requested".into(),
            inputs_digest: "sha256:0".into(),
            gates_revision: 3,
        });
        m.stage.history.push(StageHistoryEntry {
            from: StageId::Synthesis,
            to: StageId::Review,
            ts: Utc::now(),
            reason: "redraft".into(),
            inputs_digest: "sha256:1".into(),
            gates_revision: 4,
        });
        assert_eq!(m.review_cycle_count(), 1);
    }

    #[test]
    fn test_limits_scale_with_mode() {
        assert!(
            Limits::for_mode(Mode::Deep).max_wave1_agents
                > Limits::for_mode(Mode::Quick).max_wave1_agents
        );
    }
}
