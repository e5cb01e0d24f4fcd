//! Retry accounting and post-review revision control.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode, Result};
use crate::manifest_writer::manifest_write;
use crate::paths::RunPaths;
use crate::schema::gates::{GateId, GateStatus};
use crate::schema::review::{ReviewBundle, ReviewDecision};

/// Per-gate retry cap. Gates A and F never retry.
pub fn retry_cap(gate: GateId) -> u32 {
    match gate {
        GateId::A => 0,
        GateId::B => 2,
        GateId::C => 1,
        GateId::D => 1,
        GateId::E => 3,
        GateId::F => 0,
    }
}

/// Record one retry for a gate through the manifest writer.
///
/// Returns the new count, or `RETRY_CAP_EXHAUSTED` once the count
/// would exceed the per-gate cap. The manifest is not mutated in the
/// exhausted case.
pub fn retry_record(paths: &RunPaths, gate: GateId, change_note: &str) -> Result<u32> {
    let cap = retry_cap(gate);
    let manifest = crate::manifest_writer::manifest_read(paths)?;
    let current = manifest.retry_count(gate.as_str());
    if current >= cap {
        return Err(CoreError::new(
            ErrorCode::RetryCapExhausted,
            format!("gate {gate} retry cap of {cap} exhausted"),
        )
        .with_details(serde_json::json!({
            "gate": gate.as_str(),
            "cap": cap,
            "used": current,
        })));
    }

    let next = current + 1;
    manifest_write(paths, Some(manifest.revision), "retry_record", None, |m| {
        m.metrics
            .retry_counts
            .insert(gate.as_str().to_string(), next);
        Ok(())
    })?;

    tracing::info!(
        event = "gate.retry_recorded",
        gate = %gate,
        attempt = next,
        note = %change_note,
    );
    Ok(next)
}

/// What to do with the run after a review pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionAction {
    Approve,
    Revise,
    Abort,
}

/// Consume the review bundle and Gate E status into a single action.
///
/// Approve requires both the reviewer and Gate E to agree; a
/// changes-requested bundle revises while iterations remain, and
/// anything irreconcilable aborts.
pub fn revision_control(
    bundle: &ReviewBundle,
    gate_e_status: GateStatus,
    review_cycles_used: u32,
    max_review_iterations: u32,
) -> RevisionAction {
    match (bundle.decision, gate_e_status) {
        (ReviewDecision::Pass, GateStatus::Pass) => RevisionAction::Approve,
        (ReviewDecision::ChangesRequired, _) if review_cycles_used < max_review_iterations => {
            RevisionAction::Revise
        }
        (ReviewDecision::ChangesRequired, _) => RevisionAction::Abort,
        // Reviewer passed but the gate disagrees: revise if we can.
        (ReviewDecision::Pass, _) if review_cycles_used < max_review_iterations => {
            RevisionAction::Revise
        }
        (ReviewDecision::Pass, _) => RevisionAction::Abort,
    }
}
