//! Tracing initialisation and structured lifecycle emits.
//!
//! Call [`init_tracing`] once at program start. Safe to call more than
//! once; subsequent calls are silently ignored (the global subscriber
//! can only be set once per process).

use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// * `json` — when `true`, emit newline-delimited JSON log lines.
/// * `level` — default verbosity when `RUST_LOG` is not set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

/// RAII guard that enters a run-scoped tracing span.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Create and enter a span tagged with the run id.
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("inquest.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: a tick began for a run at a stage.
pub fn emit_tick_started(run_id: &str, stage: &str, reason: &str) {
    info!(event = "tick.started", run_id = %run_id, stage = %stage, reason = %reason);
}

/// Emit event: a tick finished with its transition (if any).
pub fn emit_tick_finished(run_id: &str, from: &str, to: &str) {
    info!(event = "tick.finished", run_id = %run_id, from = %from, to = %to);
}

/// Emit event: a gate evaluation was persisted.
pub fn emit_gate_persisted(run_id: &str, gate: &str, status: &str) {
    info!(event = "gate.persisted", run_id = %run_id, gate = %gate, status = %status);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("r-test");
    }

    #[test]
    fn test_init_tracing_idempotent() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }
}
