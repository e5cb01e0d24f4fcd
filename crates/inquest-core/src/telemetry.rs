//! Telemetry stream, index sidecar, and the metrics aggregator.
//!
//! `logs/telemetry.jsonl` is append-only with a strictly increasing
//! `seq`. The index sidecar caches the tail position; when missing or
//! corrupt it is re-derived from the stream itself.

use chrono::Utc;

use crate::error::{CoreError, ErrorCode, Result};
use crate::paths::RunPaths;
use crate::schema::telemetry::{
    RunMetricsDoc, StageMetrics, TelemetryEvent, TelemetryIndex, TelemetryKind, RUN_METRICS_SCHEMA,
};
use crate::store;

/// Read every event in the stream, validating monotone `seq`.
pub fn telemetry_read(paths: &RunPaths, expected_run_id: &str) -> Result<Vec<TelemetryEvent>> {
    let text = match store::read_text(&paths.telemetry_log()) {
        Ok(t) => t,
        Err(err) if err.code == ErrorCode::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut events = Vec::new();
    let mut last_seq = 0u64;
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: TelemetryEvent = serde_json::from_str(line).map_err(|e| {
            CoreError::new(
                ErrorCode::InvalidJson,
                format!("telemetry.jsonl line {}: {e}", idx + 1),
            )
        })?;
        event.validate(expected_run_id)?;
        if event.seq <= last_seq {
            return Err(CoreError::schema(format!(
                "telemetry seq {} at line {} does not increase over {last_seq}",
                event.seq,
                idx + 1
            )));
        }
        last_seq = event.seq;
        events.push(event);
    }
    Ok(events)
}

/// Last seq in the stream: from the index when fresh, otherwise
/// derived by scanning the stream.
pub fn telemetry_last_seq(paths: &RunPaths, expected_run_id: &str) -> Result<u64> {
    if let Ok(value) = store::read_json(&paths.telemetry_index()) {
        if let Ok(index) = serde_json::from_value::<TelemetryIndex>(value) {
            return Ok(index.last_seq);
        }
    }
    // Missing or corrupt index: derive.
    Ok(telemetry_read(paths, expected_run_id)?
        .last()
        .map(|e| e.seq)
        .unwrap_or(0))
}

/// Append one event, assigning the next seq and refreshing the index.
pub fn telemetry_append(
    paths: &RunPaths,
    run_id: &str,
    kind: TelemetryKind,
) -> Result<TelemetryEvent> {
    let last = telemetry_last_seq(paths, run_id)?;
    let event = TelemetryEvent::new(run_id, last + 1, kind, Utc::now());
    event.validate(run_id)?;

    let line = serde_json::to_string(&event)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize event: {e}")))?;
    store::append_line(&paths.telemetry_log(), &line)?;

    let index = TelemetryIndex::new(event.seq, event.ts);
    let value = serde_json::to_value(&index)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize index: {e}")))?;
    store::atomic_write_json(&paths.telemetry_index(), &value)?;

    Ok(event)
}

/// Aggregate the stream into `metrics/run-metrics.json`.
///
/// Short-circuits (returns the existing document) when the stream has
/// not advanced since the last aggregation.
pub fn run_metrics_write(paths: &RunPaths) -> Result<RunMetricsDoc> {
    let manifest = crate::manifest_writer::manifest_read(paths)?;
    let last_seq = telemetry_last_seq(paths, &manifest.run_id)?;

    if let Ok(value) = store::read_json(&paths.run_metrics()) {
        if let Ok(existing) = serde_json::from_value::<RunMetricsDoc>(value) {
            if existing.last_seq == last_seq {
                return Ok(existing);
            }
        }
    }

    let events = telemetry_read(paths, &manifest.run_id)?;
    let mut stages: std::collections::BTreeMap<String, StageMetrics> = Default::default();

    for event in &events {
        match &event.kind {
            TelemetryKind::StageStarted { stage } => {
                stages.entry(stage.as_str().to_string()).or_default().attempts_total += 1;
            }
            TelemetryKind::StageRetryPlanned { stage, .. } => {
                stages.entry(stage.as_str().to_string()).or_default().retries_total += 1;
            }
            TelemetryKind::StageFinished { stage, outcome, duration_s, .. } => {
                let bucket = stages.entry(stage.as_str().to_string()).or_default();
                if outcome == "failed" {
                    bucket.failures_total += 1;
                }
                if let Some(d) = duration_s {
                    bucket.duration_s += d;
                }
            }
            TelemetryKind::WatchdogTimeout { stage, .. } => {
                stages.entry(stage.as_str().to_string()).or_default().timeouts_total += 1;
            }
            TelemetryKind::RunStatus { .. } => {}
        }
    }

    let duration_s = match (events.first(), events.last()) {
        (Some(first), Some(last)) => {
            Some((last.ts - first.ts).num_seconds().max(0) as u64)
        }
        _ => None,
    };

    let doc = RunMetricsDoc {
        schema_version: RUN_METRICS_SCHEMA.to_string(),
        run_id: manifest.run_id.clone(),
        generated_at: Utc::now(),
        status: manifest.status,
        duration_s,
        last_seq,
        stages,
    };
    let value = serde_json::to_value(&doc)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize metrics: {e}")))?;
    store::atomic_write_json(&paths.run_metrics(), &value)?;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::manifest::{Manifest, Mode, QuerySpec, RunStatus, Sensitivity, StageId};
    use tempfile::tempdir;

    fn seed_manifest(paths: &RunPaths) {
        let manifest = Manifest::new(
            "r-1",
            &paths.root().display().to_string(),
            QuerySpec {
                text: "q".into(),
                constraints: vec![],
                sensitivity: Sensitivity::Normal,
            },
            Mode::Standard,
            Utc::now(),
        );
        store::atomic_write_json(&paths.manifest(), &serde_json::to_value(&manifest).unwrap())
            .unwrap();
    }

    #[test]
    fn test_append_assigns_monotone_seq() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());

        let e1 = telemetry_append(&paths, "r-1", TelemetryKind::RunStatus { status: RunStatus::Running }).unwrap();
        let e2 = telemetry_append(&paths, "r-1", TelemetryKind::StageStarted { stage: StageId::Wave1 }).unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);

        let events = telemetry_read(&paths, "r-1").unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_missing_index_is_derived() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());

        telemetry_append(&paths, "r-1", TelemetryKind::RunStatus { status: RunStatus::Running }).unwrap();
        telemetry_append(&paths, "r-1", TelemetryKind::StageStarted { stage: StageId::Wave1 }).unwrap();
        std::fs::remove_file(paths.telemetry_index()).unwrap();

        let e3 = telemetry_append(&paths, "r-1", TelemetryKind::StageStarted { stage: StageId::Pivot }).unwrap();
        assert_eq!(e3.seq, 3);
    }

    #[test]
    fn test_non_monotone_stream_rejected() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());

        let event = TelemetryEvent::new("r-1", 5, TelemetryKind::RunStatus { status: RunStatus::Running }, Utc::now());
        store::append_line(&paths.telemetry_log(), &serde_json::to_string(&event).unwrap()).unwrap();
        let event = TelemetryEvent::new("r-1", 3, TelemetryKind::RunStatus { status: RunStatus::Running }, Utc::now());
        store::append_line(&paths.telemetry_log(), &serde_json::to_string(&event).unwrap()).unwrap();

        assert!(telemetry_read(&paths, "r-1").is_err());
    }

    #[test]
    fn test_metrics_aggregation_and_short_circuit() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_manifest(&paths);

        telemetry_append(&paths, "r-1", TelemetryKind::StageStarted { stage: StageId::Wave1 }).unwrap();
        telemetry_append(
            &paths,
            "r-1",
            TelemetryKind::StageRetryPlanned { stage: StageId::Wave1, gate: "B".into(), attempt: 1 },
        )
        .unwrap();
        telemetry_append(
            &paths,
            "r-1",
            TelemetryKind::StageFinished {
                stage: StageId::Wave1,
                outcome: "completed".into(),
                duration_s: Some(42),
                failure_kind: None,
            },
        )
        .unwrap();

        let doc = run_metrics_write(&paths).expect("metrics");
        let wave1 = &doc.stages["wave1"];
        assert_eq!(wave1.attempts_total, 1);
        assert_eq!(wave1.retries_total, 1);
        assert_eq!(wave1.duration_s, 42);
        assert_eq!(doc.last_seq, 3);

        // No new events: identical document, unchanged generated_at.
        let again = run_metrics_write(&paths).expect("metrics again");
        assert_eq!(again.generated_at, doc.generated_at);
    }

    #[test]
    fn test_watchdog_timeout_counts() {
        let dir = tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        seed_manifest(&paths);

        telemetry_append(
            &paths,
            "r-1",
            TelemetryKind::WatchdogTimeout { stage: StageId::Wave1, timeout_s: 600 },
        )
        .unwrap();
        let doc = run_metrics_write(&paths).expect("metrics");
        assert_eq!(doc.stages["wave1"].timeouts_total, 1);
    }
}
