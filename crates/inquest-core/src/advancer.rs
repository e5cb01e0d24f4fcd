//! Stage advancer: the only code allowed to move `stage.current`.
//!
//! Transitions follow a fixed adjacency graph with per-edge
//! preconditions over on-disk artifacts and gate statuses. A
//! successful advance persists a history entry and returns the
//! decision digest; every refusal is a typed error.

use chrono::Utc;

use crate::error::{CoreError, ErrorCode, Result};
use crate::gates_writer::gates_read;
use crate::manifest_writer::{manifest_read, manifest_write};
use crate::paths::RunPaths;
use crate::schema::gates::{GateId, GateStatus};
use crate::schema::manifest::{RunStatus, StageHistoryEntry, StageId};
use crate::schema::pivot::PivotDoc;
use crate::schema::review::{ReviewBundle, ReviewDecision};
use crate::store;

/// Result of a successful stage transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: StageId,
    pub to: StageId,
    pub inputs_digest: String,
    pub manifest_revision: u64,
}

/// Legal successors of a stage.
pub fn allowed_next(from: StageId) -> &'static [StageId] {
    match from {
        StageId::Init => &[StageId::Perspectives, StageId::Wave1],
        StageId::Perspectives => &[StageId::Wave1],
        StageId::Wave1 => &[StageId::Pivot],
        StageId::Pivot => &[StageId::Wave2, StageId::Citations],
        StageId::Wave2 => &[StageId::Citations],
        StageId::Citations => &[StageId::Summaries],
        StageId::Summaries => &[StageId::Synthesis],
        StageId::Synthesis => &[StageId::Review],
        StageId::Review => &[StageId::Synthesis, StageId::Finalize],
        StageId::Finalize => &[],
    }
}

fn require_artifact(paths: &RunPaths, rel: &str) -> Result<()> {
    if !paths.root().join(rel).exists() {
        return Err(CoreError::new(
            ErrorCode::MissingArtifact,
            format!("required artifact missing: {rel}"),
        )
        .with_details(serde_json::json!({ "path": rel })));
    }
    Ok(())
}

fn require_gate(paths: &RunPaths, gate: GateId) -> Result<u64> {
    let gates = gates_read(paths)?;
    let status = gates.status(gate);
    if status != GateStatus::Pass {
        return Err(CoreError::new(
            ErrorCode::GateBlocked,
            format!("gate {gate} is {status:?}, pass required"),
        )
        .with_details(serde_json::json!({
            "gate": gate.as_str(),
            "status": status,
        })));
    }
    Ok(gates.revision)
}

fn wave_dir_nonempty(paths: &RunPaths, wave: u8) -> Result<usize> {
    let dir = paths.wave_dir(wave);
    let entries = std::fs::read_dir(&dir).map_err(|e| CoreError::read_failed(&dir, &e))?;
    let count = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "md"))
        .count();
    if count == 0 {
        return Err(CoreError::new(
            ErrorCode::MissingArtifact,
            format!("wave-{wave} directory holds no outputs"),
        ));
    }
    Ok(count)
}

fn read_pivot(paths: &RunPaths) -> Result<PivotDoc> {
    let value = store::read_json(&paths.pivot())?;
    serde_json::from_value(value)
        .map_err(|e| CoreError::schema(format!("pivot.json does not parse: {e}")))
}

fn read_review_bundle(paths: &RunPaths) -> Result<ReviewBundle> {
    let value = store::read_json(&paths.review_bundle())?;
    let bundle: ReviewBundle = serde_json::from_value(value).map_err(|e| {
        CoreError::new(ErrorCode::BundleInvalid, format!("review bundle does not parse: {e}"))
    })?;
    bundle.validate()?;
    Ok(bundle)
}

/// Advance the run to `requested_next`.
///
/// `expected_from`, when provided, guards against ticking a manifest
/// that moved underneath the caller. `expected_revision` is the
/// optimistic-locking token passed through to the manifest writer.
pub fn advance(
    paths: &RunPaths,
    requested_next: StageId,
    reason: &str,
    expected_from: Option<StageId>,
    expected_revision: Option<u64>,
) -> Result<Transition> {
    let manifest = manifest_read(paths)?;
    let from = manifest.stage.current;

    if let Some(expected) = expected_from {
        if from != expected {
            return Err(CoreError::new(
                ErrorCode::StageMismatch,
                format!("stage is {from}, caller expected {expected}"),
            ));
        }
    }

    if !allowed_next(from).contains(&requested_next) {
        return Err(CoreError::new(
            ErrorCode::RequestedNextNotAllowed,
            format!("transition {from} -> {requested_next} is not in the lifecycle graph"),
        )
        .with_details(serde_json::json!({
            "from": from.as_str(),
            "requested": requested_next.as_str(),
        })));
    }

    // Per-edge preconditions; each contributes to the decision inputs.
    let mut decision_inputs = serde_json::json!({
        "from": from.as_str(),
        "to": requested_next.as_str(),
        "reason": reason,
    });
    let mut gates_revision = 0u64;

    match (from, requested_next) {
        (StageId::Init, StageId::Perspectives) => {}
        (StageId::Init, StageId::Wave1) | (StageId::Perspectives, StageId::Wave1) => {
            require_artifact(paths, "perspectives.json")?;
        }
        (StageId::Wave1, StageId::Pivot) => {
            let outputs = wave_dir_nonempty(paths, 1)?;
            require_artifact(paths, "wave-review.json")?;
            gates_revision = require_gate(paths, GateId::B)?;
            decision_inputs["wave1_outputs"] = serde_json::json!(outputs);
        }
        (StageId::Pivot, StageId::Wave2) => {
            let decision = read_pivot(paths)?.resolve()?;
            if !decision.wave2_required {
                return Err(CoreError::new(
                    ErrorCode::LifecycleRuleViolation,
                    "pivot decision does not require wave-2",
                ));
            }
            let cap = manifest.limits.max_wave2_agents as usize;
            if decision.wave2_gap_ids.len() > cap {
                return Err(CoreError::new(
                    ErrorCode::WaveCapExceeded,
                    format!(
                        "{} wave-2 gap perspectives exceed the cap of {cap}",
                        decision.wave2_gap_ids.len()
                    ),
                )
                .with_details(serde_json::json!({
                    "gap_ids": decision.wave2_gap_ids,
                    "max_wave2_agents": cap,
                })));
            }
            decision_inputs["pivot"] = serde_json::to_value(&decision).unwrap_or_default();
        }
        (StageId::Pivot, StageId::Citations) => {
            let decision = read_pivot(paths)?.resolve()?;
            if decision.wave2_required {
                return Err(CoreError::new(
                    ErrorCode::LifecycleRuleViolation,
                    "pivot decision requires wave-2 before citations",
                ));
            }
            decision_inputs["pivot"] = serde_json::to_value(&decision).unwrap_or_default();
        }
        (StageId::Wave2, StageId::Citations) => {
            let outputs = wave_dir_nonempty(paths, 2)?;
            decision_inputs["wave2_outputs"] = serde_json::json!(outputs);
        }
        (StageId::Citations, StageId::Summaries) => {
            require_artifact(paths, "citations/citations.jsonl")?;
            gates_revision = require_gate(paths, GateId::C)?;
        }
        (StageId::Summaries, StageId::Synthesis) => {
            require_artifact(paths, "summaries/summary-pack.json")?;
            gates_revision = require_gate(paths, GateId::D)?;
        }
        (StageId::Synthesis, StageId::Review) => {
            require_artifact(paths, "synthesis/final-synthesis.md")?;
        }
        (StageId::Review, StageId::Synthesis) => {
            let bundle = read_review_bundle(paths)?;
            if bundle.decision != ReviewDecision::ChangesRequired {
                return Err(CoreError::new(
                    ErrorCode::LifecycleRuleViolation,
                    "review decision does not request changes",
                ));
            }
            let cap = manifest.limits.max_review_iterations;
            let used = manifest.review_cycle_count();
            if used >= cap {
                return Err(CoreError::new(
                    ErrorCode::ReviewCapExceeded,
                    format!("review cycle cap of {cap} reached"),
                )
                .with_details(serde_json::json!({
                    "used": used,
                    "max_review_iterations": cap,
                })));
            }
            decision_inputs["review_iteration"] = serde_json::json!(bundle.iteration);
        }
        (StageId::Review, StageId::Finalize) => {
            let bundle = read_review_bundle(paths)?;
            if bundle.decision != ReviewDecision::Pass {
                return Err(CoreError::new(
                    ErrorCode::LifecycleRuleViolation,
                    "review decision is not PASS",
                ));
            }
            require_gate(paths, GateId::E)?;
            gates_revision = require_gate(paths, GateId::F)?;
            decision_inputs["review_iteration"] = serde_json::json!(bundle.iteration);
        }
        // Unreachable: adjacency already filtered everything else.
        (from, to) => {
            return Err(CoreError::new(
                ErrorCode::LifecycleRuleViolation,
                format!("unhandled transition {from} -> {to}"),
            ))
        }
    }

    decision_inputs["gates_revision"] = serde_json::json!(gates_revision);
    let inputs_digest = store::sha256_digest_for_json(&decision_inputs)?;

    let reason = reason.to_string();
    let digest_for_patch = inputs_digest.clone();
    let written = manifest_write(
        paths,
        expected_revision,
        "stage_advance",
        Some(&inputs_digest),
        move |m| {
            let now = Utc::now();
            m.stage.history.push(StageHistoryEntry {
                from,
                to: requested_next,
                ts: now,
                reason,
                inputs_digest: digest_for_patch,
                gates_revision,
            });
            m.stage.current = requested_next;
            m.stage.started_at = now;
            m.stage.last_progress_at = None;
            m.status = if requested_next == StageId::Finalize {
                RunStatus::Completed
            } else {
                RunStatus::Running
            };
            Ok(())
        },
    )?;

    tracing::info!(
        event = "stage.advanced",
        from = %from,
        to = %requested_next,
        revision = written.revision,
    );

    Ok(Transition {
        from,
        to: requested_next,
        inputs_digest,
        manifest_revision: written.revision,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::gates::{GatePatch, GatesDoc};
    use crate::schema::manifest::{Manifest, Mode, QuerySpec, Sensitivity};
    use crate::schema::pivot::{PivotDecision, PivotDoc};
    use tempfile::tempdir;

    fn seed_run(paths: &RunPaths) {
        for dir in paths.seed_dirs() {
            std::fs::create_dir_all(dir).unwrap();
        }
        let manifest = Manifest::new(
            "r-1",
            &paths.root().display().to_string(),
            QuerySpec {
                text: "What is X?".into(),
                constraints: vec![],
                sensitivity: Sensitivity::Normal,
            },
            Mode::Standard,
            Utc::now(),
        );
        store::atomic_write_json(&paths.manifest(), &serde_json::to_value(&manifest).unwrap())
            .unwrap();
        let gates = GatesDoc::initial(Utc::now());
        store::atomic_write_json(&paths.gates(), &serde_json::to_value(&gates).unwrap()).unwrap();
    }

    fn set_gate_pass(paths: &RunPaths, gate: GateId) {
        let patch = GatePatch {
            status: Some(GateStatus::Pass),
            checked_at: Some(Utc::now()),
            ..GatePatch::default()
        };
        crate::gates_writer::gates_write(paths, None, "sha256:test", &[(gate, patch)]).unwrap();
    }

    fn write_perspectives(paths: &RunPaths) {
        store::atomic_write_json(
            &paths.perspectives(),
            &serde_json::json!({ "schema_version": "perspectives.v1", "perspectives": [] }),
        )
        .unwrap();
    }

    #[test]
    fn test_init_to_wave1_needs_perspectives() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_run(&paths);

        let err = advance(&paths, StageId::Wave1, "start", None, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingArtifact);

        write_perspectives(&paths);
        let t = advance(&paths, StageId::Wave1, "start", None, None).expect("advance");
        assert_eq!(t.from, StageId::Init);
        assert_eq!(t.to, StageId::Wave1);
        assert_eq!(t.manifest_revision, 2);

        let m = manifest_read(&paths).unwrap();
        assert_eq!(m.stage.current, StageId::Wave1);
        assert_eq!(m.status, RunStatus::Running);
        assert_eq!(m.stage.history.len(), 1);
        assert_eq!(m.stage.history[0].ts, m.updated_at);
    }

    #[test]
    fn test_illegal_edge_refused() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_run(&paths);

        let err = advance(&paths, StageId::Review, "skip ahead", None, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestedNextNotAllowed);
    }

    #[test]
    fn test_wave1_to_pivot_requires_gate_b() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_run(&paths);
        write_perspectives(&paths);
        advance(&paths, StageId::Wave1, "start", None, None).unwrap();

        std::fs::write(paths.wave_output(1, "p-A"), "# output").unwrap();
        store::atomic_write_json(&paths.wave_review(), &serde_json::json!({"ok": true})).unwrap();

        let err = advance(&paths, StageId::Pivot, "wave done", None, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::GateBlocked);

        set_gate_pass(&paths, GateId::B);
        let t = advance(&paths, StageId::Pivot, "wave done", None, None).expect("advance");
        assert_eq!(t.to, StageId::Pivot);
    }

    #[test]
    fn test_pivot_wave2_cap() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_run(&paths);
        write_perspectives(&paths);
        advance(&paths, StageId::Wave1, "start", None, None).unwrap();
        std::fs::write(paths.wave_output(1, "p-A"), "# output").unwrap();
        store::atomic_write_json(&paths.wave_review(), &serde_json::json!({"ok": true})).unwrap();
        set_gate_pass(&paths, GateId::B);
        advance(&paths, StageId::Pivot, "wave done", None, None).unwrap();

        let doc = PivotDoc::new(
            PivotDecision {
                wave2_required: true,
                wave2_gap_ids: (0..9).map(|i| format!("p-{i}")).collect(),
                rationale: "gaps".into(),
            },
            Utc::now(),
        );
        store::atomic_write_json(&paths.pivot(), &serde_json::to_value(&doc).unwrap()).unwrap();

        let err = advance(&paths, StageId::Wave2, "gaps", None, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::WaveCapExceeded);
    }

    #[test]
    fn test_pivot_decision_mismatch() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_run(&paths);
        write_perspectives(&paths);
        advance(&paths, StageId::Wave1, "start", None, None).unwrap();
        std::fs::write(paths.wave_output(1, "p-A"), "# output").unwrap();
        store::atomic_write_json(&paths.wave_review(), &serde_json::json!({"ok": true})).unwrap();
        set_gate_pass(&paths, GateId::B);
        advance(&paths, StageId::Pivot, "wave done", None, None).unwrap();

        let doc = PivotDoc::new(
            PivotDecision {
                wave2_required: false,
                wave2_gap_ids: vec![],
                rationale: String::new(),
            },
            Utc::now(),
        );
        store::atomic_write_json(&paths.pivot(), &serde_json::to_value(&doc).unwrap()).unwrap();

        let err = advance(&paths, StageId::Wave2, "gaps", None, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::LifecycleRuleViolation);

        let t = advance(&paths, StageId::Citations, "no gaps", None, None).expect("advance");
        assert_eq!(t.to, StageId::Citations);
    }

    #[test]
    fn test_stage_mismatch_guard() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_run(&paths);
        write_perspectives(&paths);

        let err = advance(&paths, StageId::Wave1, "x", Some(StageId::Pivot), None).unwrap_err();
        assert_eq!(err.code, ErrorCode::StageMismatch);
    }

    #[test]
    fn test_revision_mismatch_propagates() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_run(&paths);
        write_perspectives(&paths);

        let err = advance(&paths, StageId::Wave1, "x", None, Some(9)).unwrap_err();
        assert_eq!(err.code, ErrorCode::RevisionMismatch);
    }

    #[test]
    fn test_idempotent_decision_digest() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_run(&paths);
        write_perspectives(&paths);

        let t1 = advance(&paths, StageId::Wave1, "start", None, None).unwrap();
        // Same state, same inputs: the second attempt is a typed error,
        // never a silent divergence.
        let err = advance(&paths, StageId::Wave1, "start", Some(StageId::Init), None).unwrap_err();
        assert_eq!(err.code, ErrorCode::StageMismatch);
        assert!(t1.inputs_digest.starts_with("sha256:"));
    }
}
