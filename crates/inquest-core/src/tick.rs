//! Tick orchestrators: one bounded progression per invocation.
//!
//! Both drivers share the same shell: validate the manifest, acquire
//! the run lock (with a heartbeat refresher), honor the crash sentinel,
//! read the run policy, run the stage body, then remove the marker on
//! success and release the lock on every path.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::advancer::{advance, Transition};
use crate::citations::{
    build_url_map, citations_extract_urls, citations_validate, read_citations, CitationsMode,
};
use crate::driver::AgentDriver;
use crate::error::{CoreError, ErrorCode, Result};
use crate::gates_eval::{
    gate_a_evaluate, gate_c_evaluate, gate_d_evaluate, gate_e_evaluate, gate_f_evaluate,
    ExtractorEndpoints,
};
use crate::gates_writer::gates_write;
use crate::lock::{Heartbeat, RunLock};
use crate::manifest_writer::manifest_read;
use crate::paths::RunPaths;
use crate::schema::gates::GateId;
use crate::schema::manifest::{Manifest, RunStatus, StageId};
use crate::schema::pivot::{PivotDecision, PivotDoc};
use crate::schema::policy::RunPolicy;
use crate::schema::review::ReviewDecision;
use crate::schema::telemetry::TelemetryKind;
use crate::store;
use crate::summary::{summary_pack_build, SummarySource};
use crate::synthesis::{synthesis_write, SynthesisSource};
use crate::telemetry::{run_metrics_write, telemetry_append};
use crate::watchdog::watchdog_check;
use crate::wave::{load_wave1_plan, perspectives_read, plan_wave1, plan_wave2_entries, run_wave};

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickOutcome {
    pub from: StageId,
    pub to: StageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wave_outputs_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_inputs_digest: Option<String>,
}

/// Configuration for the live/wave tick driver.
#[derive(Debug, Clone)]
pub struct TickLiveConfig {
    pub reason: String,
    pub citations_mode: CitationsMode,
}

/// Configuration for the post-summaries tick driver.
#[derive(Debug, Clone)]
pub struct TickPostConfig {
    pub reason: String,
    pub summary_source: SummarySource,
    pub synthesis_source: SynthesisSource,
}

/// Crash sentinel written while a tick holds the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TickMarker {
    ts: chrono::DateTime<Utc>,
    owner_id: String,
    stage: StageId,
}

fn refuse_inactive(manifest: &Manifest) -> Result<()> {
    match manifest.status {
        RunStatus::Paused => Err(CoreError::new(ErrorCode::Paused, "run is paused")),
        RunStatus::Cancelled => Err(CoreError::new(ErrorCode::Cancelled, "run is cancelled")),
        RunStatus::Failed => Err(CoreError::new(
            ErrorCode::InvalidState,
            "run has failed; operator recovery required",
        )),
        _ => Ok(()),
    }
}

/// Read and sanitize `run-config/policy.json`.
pub fn read_policy(paths: &RunPaths) -> RunPolicy {
    let raw = store::read_json(&paths.policy()).ok();
    RunPolicy::sanitize(raw.as_ref())
}

fn check_and_write_marker(
    paths: &RunPaths,
    policy: &RunPolicy,
    owner_id: &str,
    stage: StageId,
) -> Result<()> {
    if let Ok(value) = store::read_json(&paths.tick_marker()) {
        if let Ok(marker) = serde_json::from_value::<TickMarker>(value) {
            let age = (Utc::now() - marker.ts).num_seconds().max(0) as u64;
            if age > policy.tick_marker_stale_seconds {
                return Err(CoreError::new(
                    ErrorCode::PreviousTickIncomplete,
                    format!(
                        "tick marker from {} is {age}s old; a previous tick died mid-flight",
                        marker.owner_id
                    ),
                )
                .with_details(serde_json::json!({
                    "marker_owner": marker.owner_id,
                    "marker_stage": marker.stage,
                    "age_seconds": age,
                })));
            }
        }
    }

    let marker = TickMarker {
        ts: Utc::now(),
        owner_id: owner_id.to_string(),
        stage,
    };
    store::atomic_write_json(
        &paths.tick_marker(),
        &serde_json::to_value(&marker)
            .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize marker: {e}")))?,
    )
}

fn finish_tick(
    paths: &RunPaths,
    lock: RunLock,
    heartbeat: Heartbeat,
    result: Result<TickOutcome>,
) -> Result<TickOutcome> {
    drop(heartbeat);
    if result.is_ok() {
        let _ = std::fs::remove_file(paths.tick_marker());
    }
    match lock.release() {
        Ok(()) => result,
        Err(release_err) => match result {
            // The body's error wins; the release failure is logged.
            Err(body_err) => {
                tracing::warn!(event = "lock.release_failed", error = %release_err);
                Err(body_err)
            }
            Ok(_) => Err(release_err),
        },
    }
}

fn stage_duration_s(manifest: &Manifest) -> u64 {
    (Utc::now() - manifest.stage.started_at).num_seconds().max(0) as u64
}

fn emit_stage_bracket(paths: &RunPaths, manifest: &Manifest) -> Result<()> {
    telemetry_append(
        paths,
        &manifest.run_id,
        TelemetryKind::StageStarted {
            stage: manifest.stage.current,
        },
    )?;
    Ok(())
}

fn emit_stage_done(paths: &RunPaths, run_id: &str, stage: StageId, duration_s: u64) -> Result<()> {
    telemetry_append(
        paths,
        run_id,
        TelemetryKind::StageFinished {
            stage,
            outcome: "completed".to_string(),
            duration_s: Some(duration_s),
            failure_kind: None,
        },
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Live driver: init .. citations
// ---------------------------------------------------------------------------

/// Advance a run through the wave half of the pipeline by one step.
pub async fn tick_live(
    paths: &RunPaths,
    driver: &dyn AgentDriver,
    config: &TickLiveConfig,
) -> Result<TickOutcome> {
    let manifest = manifest_read(paths)?;
    refuse_inactive(&manifest)?;
    let policy = read_policy(paths);

    let lock = RunLock::acquire(paths.root(), &policy.run_lock_policy_v1, Some(&config.reason))?;
    let heartbeat = Heartbeat::spawn(paths.root(), lock.owner_id(), &policy.run_lock_policy_v1);

    let result = async {
        check_and_write_marker(paths, &policy, lock.owner_id(), manifest.stage.current)?;

        let watchdog = watchdog_check(paths, &policy, Utc::now())?;
        if watchdog.timed_out {
            return Err(CoreError::new(
                ErrorCode::WatchdogTimeout,
                format!("stage {} timed out before this tick", watchdog.stage),
            ));
        }

        crate::obs::emit_tick_started(&manifest.run_id, manifest.stage.current.as_str(), &config.reason);
        if manifest.status == RunStatus::Created {
            telemetry_append(
                paths,
                &manifest.run_id,
                TelemetryKind::RunStatus { status: RunStatus::Running },
            )?;
        }
        emit_stage_bracket(paths, &manifest)?;

        tick_live_body(paths, driver, config, &policy, &manifest).await
    }
    .await;

    finish_tick(paths, lock, heartbeat, result)
}

async fn tick_live_body(
    paths: &RunPaths,
    driver: &dyn AgentDriver,
    config: &TickLiveConfig,
    policy: &RunPolicy,
    manifest: &Manifest,
) -> Result<TickOutcome> {
    let from = manifest.stage.current;
    let run_id = manifest.run_id.clone();
    let started = stage_duration_s(manifest);

    match from {
        StageId::Init => {
            if paths.perspectives().exists() {
                advance(paths, StageId::Wave1, &config.reason, Some(from), None)?;
                let outputs = wave1_stage(paths, driver, &run_id).await?;
                let transition = advance(paths, StageId::Pivot, "wave-1 complete", Some(StageId::Wave1), None)?;
                emit_stage_done(paths, &run_id, StageId::Wave1, started)?;
                Ok(TickOutcome {
                    from,
                    to: transition.to,
                    wave_outputs_count: Some(outputs),
                    review_iteration: None,
                    decision_inputs_digest: Some(transition.inputs_digest),
                })
            } else {
                let transition = advance(paths, StageId::Perspectives, &config.reason, Some(from), None)?;
                Ok(outcome_for(transition))
            }
        }
        StageId::Perspectives => {
            // The planning agent (or operator) must have landed the document.
            let doc = perspectives_read(paths)?;
            let gate_a = gate_a_evaluate(&doc, &manifest.limits)?;
            gates_write(paths, None, &gate_a.inputs_digest, &[(GateId::A, gate_a.patch.clone())])?;

            advance(paths, StageId::Wave1, &config.reason, Some(from), None)?;
            let outputs = wave1_stage(paths, driver, &run_id).await?;
            let transition = advance(paths, StageId::Pivot, "wave-1 complete", Some(StageId::Wave1), None)?;
            emit_stage_done(paths, &run_id, StageId::Wave1, started)?;
            Ok(TickOutcome {
                from,
                to: transition.to,
                wave_outputs_count: Some(outputs),
                review_iteration: None,
                decision_inputs_digest: Some(transition.inputs_digest),
            })
        }
        StageId::Wave1 => {
            let outputs = wave1_stage(paths, driver, &run_id).await?;
            let transition = advance(paths, StageId::Pivot, "wave-1 complete", Some(from), None)?;
            emit_stage_done(paths, &run_id, StageId::Wave1, started)?;
            Ok(TickOutcome {
                from,
                to: transition.to,
                wave_outputs_count: Some(outputs),
                review_iteration: None,
                decision_inputs_digest: Some(transition.inputs_digest),
            })
        }
        StageId::Pivot => {
            let decision = ensure_pivot(paths)?;
            let next = if decision.wave2_required {
                StageId::Wave2
            } else {
                StageId::Citations
            };
            let transition = advance(paths, next, &config.reason, Some(from), None)?;
            emit_stage_done(paths, &run_id, StageId::Pivot, started)?;
            Ok(outcome_for(transition))
        }
        StageId::Wave2 => {
            let decision = ensure_pivot(paths)?;
            let entries = plan_wave2_entries(paths, manifest, &decision.wave2_gap_ids)?;
            let summary = match run_wave(paths, driver, &entries, 2).await {
                Ok(s) => s,
                Err(err) if err.code == ErrorCode::RetryRequired => {
                    telemetry_append(
                        paths,
                        &run_id,
                        TelemetryKind::StageRetryPlanned {
                            stage: StageId::Wave2,
                            gate: "B".into(),
                            attempt: manifest_read(paths)?.retry_count("B"),
                        },
                    )?;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            let transition = advance(paths, StageId::Citations, "wave-2 complete", Some(from), None)?;
            emit_stage_done(paths, &run_id, StageId::Wave2, started)?;
            Ok(TickOutcome {
                from,
                to: transition.to,
                wave_outputs_count: Some(summary.outputs),
                review_iteration: None,
                decision_inputs_digest: Some(transition.inputs_digest),
            })
        }
        StageId::Citations => {
            citations_stage(paths, config, policy, manifest).await?;
            let transition = advance(paths, StageId::Summaries, "citations validated", Some(from), None)?;
            emit_stage_done(paths, &run_id, StageId::Citations, started)?;
            Ok(outcome_for(transition))
        }
        other => Err(CoreError::new(
            ErrorCode::InvalidState,
            format!("stage {other} is driven by tick_post_summaries"),
        )),
    }
}

fn outcome_for(transition: Transition) -> TickOutcome {
    TickOutcome {
        from: transition.from,
        to: transition.to,
        wave_outputs_count: None,
        review_iteration: None,
        decision_inputs_digest: Some(transition.inputs_digest),
    }
}

async fn wave1_stage(paths: &RunPaths, driver: &dyn AgentDriver, run_id: &str) -> Result<u32> {
    let manifest = manifest_read(paths)?;
    let plan = match load_wave1_plan(paths) {
        Ok(plan) => plan,
        Err(err) if err.code == ErrorCode::NotFound => plan_wave1(paths, &manifest)?,
        // A stale plan is rebuilt from the current perspectives.
        Err(err) if err.code == ErrorCode::Wave1PlanStale => plan_wave1(paths, &manifest)?,
        Err(err) => return Err(err),
    };

    match run_wave(paths, driver, &plan.entries, 1).await {
        Ok(summary) => Ok(summary.outputs),
        Err(err) if err.code == ErrorCode::RetryRequired => {
            telemetry_append(
                paths,
                run_id,
                TelemetryKind::StageRetryPlanned {
                    stage: StageId::Wave1,
                    gate: "B".into(),
                    attempt: manifest_read(paths)?.retry_count("B"),
                },
            )?;
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Read `pivot.json`, writing the deterministic default (wave-1 was
/// sufficient) when no producer has landed one.
fn ensure_pivot(paths: &RunPaths) -> Result<PivotDecision> {
    match store::read_json(&paths.pivot()) {
        Ok(value) => {
            let doc: PivotDoc = serde_json::from_value(value)
                .map_err(|e| CoreError::schema(format!("pivot.json does not parse: {e}")))?;
            doc.resolve()
        }
        Err(err) if err.code == ErrorCode::NotFound => {
            let decision = PivotDecision {
                wave2_required: false,
                wave2_gap_ids: Vec::new(),
                rationale: "wave-1 coverage sufficient; no gap perspectives identified".to_string(),
            };
            let doc = PivotDoc::new(decision.clone(), Utc::now());
            store::atomic_write_json(
                &paths.pivot(),
                &serde_json::to_value(&doc)
                    .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize pivot: {e}")))?,
            )?;
            Ok(decision)
        }
        Err(err) => Err(err),
    }
}

async fn citations_stage(
    paths: &RunPaths,
    config: &TickLiveConfig,
    policy: &RunPolicy,
    manifest: &Manifest,
) -> Result<()> {
    let extracted = citations_extract_urls(paths)?;
    let map = build_url_map(paths, &extracted)?;
    citations_validate(
        paths,
        &map,
        &extracted.found_by,
        &config.citations_mode,
        &policy.citations_ladder_policy_v1,
    )
    .await?;

    let records = read_citations(paths)?;
    let gate_c = gate_c_evaluate(&records)?;
    let endpoints = match &config.citations_mode {
        CitationsMode::OnlineLive { endpoints } => endpoints.clone(),
        _ => ExtractorEndpoints::from_env(),
    };
    let gate_f = gate_f_evaluate(
        config.citations_mode.is_online(),
        manifest.query.sensitivity,
        &endpoints,
    )?;

    gates_write(
        paths,
        None,
        &gate_c.inputs_digest,
        &[(GateId::C, gate_c.patch.clone()), (GateId::F, gate_f.patch.clone())],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Post-summaries driver: summaries .. finalize
// ---------------------------------------------------------------------------

/// Advance a run through the synthesis half of the pipeline by one step.
pub async fn tick_post_summaries(paths: &RunPaths, config: &TickPostConfig) -> Result<TickOutcome> {
    let manifest = manifest_read(paths)?;
    refuse_inactive(&manifest)?;
    let policy = read_policy(paths);

    let lock = RunLock::acquire(paths.root(), &policy.run_lock_policy_v1, Some(&config.reason))?;
    let heartbeat = Heartbeat::spawn(paths.root(), lock.owner_id(), &policy.run_lock_policy_v1);

    let result = async {
        check_and_write_marker(paths, &policy, lock.owner_id(), manifest.stage.current)?;

        let watchdog = watchdog_check(paths, &policy, Utc::now())?;
        if watchdog.timed_out {
            return Err(CoreError::new(
                ErrorCode::WatchdogTimeout,
                format!("stage {} timed out before this tick", watchdog.stage),
            ));
        }

        crate::obs::emit_tick_started(&manifest.run_id, manifest.stage.current.as_str(), &config.reason);
        emit_stage_bracket(paths, &manifest)?;
        tick_post_body(paths, config, &manifest).await
    }
    .await;

    finish_tick(paths, lock, heartbeat, result)
}

async fn tick_post_body(
    paths: &RunPaths,
    config: &TickPostConfig,
    manifest: &Manifest,
) -> Result<TickOutcome> {
    let from = manifest.stage.current;
    let run_id = manifest.run_id.clone();
    let started = stage_duration_s(manifest);

    match from {
        StageId::Summaries => {
            let pack = summary_pack_build(paths, &manifest.limits, &config.summary_source)?;
            let gate_d = gate_d_evaluate(&pack, &manifest.limits)?;
            gates_write(paths, None, &gate_d.inputs_digest, &[(GateId::D, gate_d.patch.clone())])?;

            let transition = advance(paths, StageId::Synthesis, &config.reason, Some(from), None)?;
            emit_stage_done(paths, &run_id, StageId::Summaries, started)?;
            Ok(outcome_for(transition))
        }
        StageId::Synthesis => {
            synthesis_write(paths, &config.synthesis_source)?;
            let transition = advance(paths, StageId::Review, &config.reason, Some(from), None)?;
            emit_stage_done(paths, &run_id, StageId::Synthesis, started)?;
            Ok(outcome_for(transition))
        }
        StageId::Review => {
            let bundle = crate::review::review_factory_run(paths)?;
            let markdown = store::read_text(&paths.synthesis_md())?;
            let records = read_citations(paths)?;
            let (_, numeric, sections) = crate::review::gate_e_reports(paths)?;
            let gate_e = gate_e_evaluate(&markdown, &records, &numeric, &sections)?;
            let gate_f = gate_f_evaluate(
                paths.online_fixtures_latest().exists(),
                manifest.query.sensitivity,
                &ExtractorEndpoints::from_env(),
            )?;
            gates_write(
                paths,
                None,
                &gate_e.inputs_digest,
                &[(GateId::E, gate_e.patch.clone()), (GateId::F, gate_f.patch.clone())],
            )?;
            crate::obs::emit_gate_persisted(&run_id, "E", &format!("{:?}", gate_e.status));

            let transition = match bundle.decision {
                ReviewDecision::Pass => {
                    let t = advance(paths, StageId::Finalize, "review passed", Some(from), None)?;
                    run_metrics_write(paths)?;
                    telemetry_append(
                        paths,
                        &run_id,
                        TelemetryKind::RunStatus { status: RunStatus::Completed },
                    )?;
                    t
                }
                ReviewDecision::ChangesRequired => {
                    advance(paths, StageId::Synthesis, "changes required", Some(from), None)?
                }
            };
            emit_stage_done(paths, &run_id, StageId::Review, started)?;
            Ok(TickOutcome {
                from,
                to: transition.to,
                wave_outputs_count: None,
                review_iteration: Some(bundle.iteration),
                decision_inputs_digest: Some(transition.inputs_digest),
            })
        }
        StageId::Finalize => {
            // Terminal stage: refresh metrics, nothing to advance.
            run_metrics_write(paths)?;
            Ok(TickOutcome {
                from,
                to: StageId::Finalize,
                wave_outputs_count: None,
                review_iteration: None,
                decision_inputs_digest: None,
            })
        }
        other => Err(CoreError::new(
            ErrorCode::InvalidState,
            format!("stage {other} is driven by tick_live"),
        )),
    }
}
