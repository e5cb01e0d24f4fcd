//! Run policy: on-disk overrides for timeouts, ladder, and lock lease.
//!
//! `run-config/policy.json` is optional; the sanitizer coerces a
//! missing file, malformed JSON handed to it, or any invalid field to
//! the documented defaults rather than failing the tick.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schema::manifest::StageId;

pub const RUN_POLICY_SCHEMA: &str = "run_policy.v1";

/// Default per-stage timeouts in seconds.
pub fn default_stage_timeouts() -> BTreeMap<String, u64> {
    let mut map = BTreeMap::new();
    for (stage, secs) in [
        (StageId::Init, 120u64),
        (StageId::Perspectives, 86_400),
        (StageId::Wave1, 600),
        (StageId::Pivot, 120),
        (StageId::Wave2, 600),
        (StageId::Citations, 600),
        (StageId::Summaries, 600),
        (StageId::Synthesis, 600),
        (StageId::Review, 300),
        (StageId::Finalize, 120),
    ] {
        map.insert(stage.as_str().to_string(), secs);
    }
    map
}

/// Tier limits and backoff for the online citations ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationsLadderPolicy {
    pub direct_fetch_timeout_ms: u64,
    pub endpoint_timeout_ms: u64,
    pub max_redirects: u32,
    pub max_body_bytes: u64,
    pub direct_fetch_max_attempts: u32,
    pub bright_data_max_attempts: u32,
    pub apify_max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
}

impl Default for CitationsLadderPolicy {
    fn default() -> Self {
        Self {
            direct_fetch_timeout_ms: 10_000,
            endpoint_timeout_ms: 30_000,
            max_redirects: 5,
            max_body_bytes: 2_000_000,
            direct_fetch_max_attempts: 2,
            bright_data_max_attempts: 2,
            apify_max_attempts: 1,
            backoff_initial_ms: 250,
            backoff_multiplier: 2.0,
            backoff_max_ms: 4_000,
        }
    }
}

impl CitationsLadderPolicy {
    /// Backoff before attempt `k` (0-based), capped at `backoff_max_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let raw = self.backoff_initial_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        (raw as u64).min(self.backoff_max_ms)
    }
}

/// Lease parameters for the run lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLockPolicy {
    pub lease_seconds: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_max_failures: u32,
}

impl Default for RunLockPolicy {
    fn default() -> Self {
        Self {
            lease_seconds: 60,
            heartbeat_interval_ms: 15_000,
            heartbeat_max_failures: 3,
        }
    }
}

/// Sanitized run policy (`run_policy.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPolicy {
    pub schema_version: String,
    pub stage_timeouts_seconds_v1: BTreeMap<String, u64>,
    pub citations_ladder_policy_v1: CitationsLadderPolicy,
    pub run_lock_policy_v1: RunLockPolicy,
    /// Tick markers older than this are treated as a crashed tick.
    pub tick_marker_stale_seconds: u64,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            schema_version: RUN_POLICY_SCHEMA.to_string(),
            stage_timeouts_seconds_v1: default_stage_timeouts(),
            citations_ladder_policy_v1: CitationsLadderPolicy::default(),
            run_lock_policy_v1: RunLockPolicy::default(),
            tick_marker_stale_seconds: 300,
        }
    }
}

impl RunPolicy {
    /// Timeout for a stage, falling back to the default table.
    pub fn timeout_for_stage(&self, stage: StageId) -> u64 {
        self.stage_timeouts_seconds_v1
            .get(stage.as_str())
            .copied()
            .unwrap_or_else(|| {
                default_stage_timeouts()
                    .get(stage.as_str())
                    .copied()
                    .unwrap_or(600)
            })
    }

    /// Build a policy from raw JSON, coercing anything invalid to
    /// defaults field by field. `None` (missing file) yields defaults.
    pub fn sanitize(raw: Option<&serde_json::Value>) -> Self {
        let mut policy = Self::default();
        let Some(serde_json::Value::Object(map)) = raw else {
            return policy;
        };

        if let Some(serde_json::Value::Object(timeouts)) = map.get("stage_timeouts_seconds_v1") {
            for stage in StageId::all() {
                if let Some(v) = timeouts.get(stage.as_str()).and_then(|v| v.as_u64()) {
                    if v > 0 {
                        policy
                            .stage_timeouts_seconds_v1
                            .insert(stage.as_str().to_string(), v);
                    }
                }
            }
        }

        if let Some(value) = map.get("citations_ladder_policy_v1") {
            if let Ok(ladder) = serde_json::from_value::<CitationsLadderPolicy>(value.clone()) {
                if ladder.backoff_multiplier >= 1.0 && ladder.max_body_bytes > 0 {
                    policy.citations_ladder_policy_v1 = ladder;
                }
            }
        }

        if let Some(value) = map.get("run_lock_policy_v1") {
            if let Ok(lock) = serde_json::from_value::<RunLockPolicy>(value.clone()) {
                if lock.lease_seconds > 0 && lock.heartbeat_interval_ms > 0 {
                    policy.run_lock_policy_v1 = lock;
                }
            }
        }

        if let Some(v) = map.get("tick_marker_stale_seconds").and_then(|v| v.as_u64()) {
            if v > 0 {
                policy.tick_marker_stale_seconds = v;
            }
        }

        policy
    }
}
