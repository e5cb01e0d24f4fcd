//! Watchdog: stage-timeout detection and the failed-run transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode, Result};
use crate::manifest_writer::{manifest_read, manifest_write};
use crate::paths::RunPaths;
use crate::schema::manifest::{FailureEntry, RunStatus, StageId};
use crate::schema::policy::RunPolicy;
use crate::schema::telemetry::TelemetryKind;
use crate::store;
use crate::telemetry::telemetry_append;

/// What a watchdog pass observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogOutcome {
    pub stage: StageId,
    pub timed_out: bool,
    pub elapsed_s: u64,
    pub timeout_s: u64,
}

/// Timeout checkpoint written next to the logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutCheckpoint {
    pub run_id: String,
    pub stage: StageId,
    pub timer_origin: DateTime<Utc>,
    pub elapsed_s: u64,
    pub timeout_s: u64,
    pub detected_at: DateTime<Utc>,
}

/// Check the current stage against its policy timeout.
///
/// The timer origin is the later of `stage.started_at` and
/// `stage.last_progress_at`; a paused run never times out. On timeout
/// the checkpoint pair is written, a failure entry is recorded, the
/// run moves to `failed`, and the telemetry stream gets both the
/// `watchdog_timeout` and the `stage_finished(timed_out)` events.
pub fn watchdog_check(paths: &RunPaths, policy: &RunPolicy, now: DateTime<Utc>) -> Result<WatchdogOutcome> {
    let manifest = manifest_read(paths)?;
    let stage = manifest.stage.current;
    let timeout_s = policy.timeout_for_stage(stage);

    // Only a live run can time out; paused and terminal runs are quiet.
    if !matches!(manifest.status, RunStatus::Created | RunStatus::Running) {
        return Ok(WatchdogOutcome {
            stage,
            timed_out: false,
            elapsed_s: 0,
            timeout_s,
        });
    }

    let origin = match manifest.stage.last_progress_at {
        Some(progress) if progress > manifest.stage.started_at => progress,
        _ => manifest.stage.started_at,
    };
    let elapsed_s = (now - origin).num_seconds().max(0) as u64;

    if elapsed_s <= timeout_s {
        return Ok(WatchdogOutcome {
            stage,
            timed_out: false,
            elapsed_s,
            timeout_s,
        });
    }

    let checkpoint = TimeoutCheckpoint {
        run_id: manifest.run_id.clone(),
        stage,
        timer_origin: origin,
        elapsed_s,
        timeout_s,
        detected_at: now,
    };
    let value = serde_json::to_value(&checkpoint)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize checkpoint: {e}")))?;
    store::atomic_write_json(&paths.timeout_checkpoint_json(), &value)?;
    store::atomic_write_text(
        &paths.timeout_checkpoint_md(),
        &format!(
            "# Watchdog timeout\n\nRun `{}` exceeded the `{stage}` stage timeout: {elapsed_s}s elapsed against {timeout_s}s allowed (timer origin {origin}).\n",
            manifest.run_id
        ),
    )?;

    manifest_write(paths, Some(manifest.revision), "watchdog_timeout", None, |m| {
        m.status = RunStatus::Failed;
        m.failures.push(FailureEntry {
            kind: "timeout".to_string(),
            stage,
            at: now,
            message: format!("stage {stage} exceeded {timeout_s}s"),
        });
        Ok(())
    })?;

    telemetry_append(
        paths,
        &manifest.run_id,
        TelemetryKind::WatchdogTimeout { stage, timeout_s },
    )?;
    telemetry_append(
        paths,
        &manifest.run_id,
        TelemetryKind::StageFinished {
            stage,
            outcome: "timed_out".to_string(),
            duration_s: Some(elapsed_s),
            failure_kind: Some("timeout".to_string()),
        },
    )?;
    telemetry_append(
        paths,
        &manifest.run_id,
        TelemetryKind::RunStatus { status: RunStatus::Failed },
    )?;

    tracing::warn!(
        event = "watchdog.timeout",
        stage = %stage,
        elapsed_s = elapsed_s,
        timeout_s = timeout_s,
    );

    Ok(WatchdogOutcome {
        stage,
        timed_out: true,
        elapsed_s,
        timeout_s,
    })
}
