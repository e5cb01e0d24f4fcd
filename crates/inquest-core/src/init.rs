//! Run initializer: create the run root and seed the runs ledger.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::audit;
use crate::error::{CoreError, ErrorCode, Result};
use crate::paths::RunPaths;
use crate::schema::gates::GatesDoc;
use crate::schema::manifest::{validate_run_id, Manifest, Mode, QuerySpec, RunStatus, Sensitivity};
use crate::schema::scope::ScopeDoc;
use crate::schema::telemetry::TelemetryKind;
use crate::store;
use crate::telemetry::telemetry_append;

/// Resolved flags for `run_init`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub runs_root: PathBuf,
    /// Generated (`r-<uuid>`) when absent.
    pub run_id: Option<String>,
    pub query: String,
    pub constraints: Vec<String>,
    pub mode: Mode,
    pub sensitivity: Sensitivity,
    pub session_id: Option<String>,
    /// Feature flag; a disabled orchestrator refuses to create runs.
    pub enabled: bool,
}

/// What `run_init` hands back to the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitResult {
    pub run_id: String,
    pub run_root: String,
    pub manifest_path: String,
    pub gates_path: String,
}

/// One line of `<runs_root>/runs-ledger.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub ts: chrono::DateTime<Utc>,
    pub run_id: String,
    pub root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub query: String,
    pub mode: Mode,
    pub sensitivity: Sensitivity,
}

/// Path of the shared ledger under a runs root.
pub fn ledger_path(runs_root: &Path) -> PathBuf {
    runs_root.join("runs-ledger.jsonl")
}

/// Create a run root, write the canonical manifest / gates / scope, and
/// append the ledger line.
pub fn run_init(opts: &InitOptions) -> Result<InitResult> {
    if !opts.enabled {
        return Err(CoreError::new(
            ErrorCode::Disabled,
            "run orchestration is disabled",
        ));
    }
    if opts.query.trim().is_empty() {
        return Err(CoreError::new(ErrorCode::InvalidArgs, "query must be non-empty"));
    }

    let run_id = match &opts.run_id {
        Some(id) => {
            validate_run_id(id)?;
            id.clone()
        }
        None => format!("r-{}", uuid::Uuid::new_v4().simple()),
    };

    if !store::is_path_within(&opts.runs_root, Path::new(&run_id)) {
        return Err(CoreError::new(
            ErrorCode::PathTraversal,
            format!("run id {run_id:?} escapes the runs root"),
        ));
    }

    let run_root = opts.runs_root.join(&run_id);
    if run_root.exists() {
        // A re-init never repairs a partial root; the operator decides.
        return Err(CoreError::new(
            ErrorCode::AlreadyExistsConflict,
            format!("run root already exists: {}", run_root.display()),
        )
        .with_details(serde_json::json!({
            "run_root": run_root.display().to_string(),
            "manifest_present": run_root.join("manifest.json").exists(),
            "gates_present": run_root.join("gates.json").exists(),
        })));
    }

    let paths = RunPaths::new(&run_root);
    for dir in paths.seed_dirs() {
        std::fs::create_dir_all(&dir).map_err(|e| CoreError::write_failed(&dir, &e))?;
    }

    let now = Utc::now();
    let query = QuerySpec {
        text: opts.query.clone(),
        constraints: opts.constraints.clone(),
        sensitivity: opts.sensitivity,
    };

    let manifest = Manifest::new(
        &run_id,
        &run_root.display().to_string(),
        query.clone(),
        opts.mode,
        now,
    );
    manifest.validate()?;
    store::atomic_write_json(
        &paths.manifest(),
        &serde_json::to_value(&manifest)
            .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize manifest: {e}")))?,
    )?;

    let gates = GatesDoc::initial(now);
    store::atomic_write_json(
        &paths.gates(),
        &serde_json::to_value(&gates)
            .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize gates: {e}")))?,
    )?;

    let scope = ScopeDoc::new(&run_id, query, opts.mode, now);
    store::atomic_write_json(
        &paths.scope(),
        &serde_json::to_value(&scope)
            .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize scope: {e}")))?,
    )?;

    let ledger = LedgerEntry {
        ts: now,
        run_id: run_id.clone(),
        root: run_root.display().to_string(),
        session_id: opts.session_id.clone(),
        query: opts.query.clone(),
        mode: opts.mode,
        sensitivity: opts.sensitivity,
    };
    let line = serde_json::to_string(&ledger)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize ledger: {e}")))?;
    store::append_line(&ledger_path(&opts.runs_root), &line)?;

    audit::append(&paths, &audit::ok_entry("run_init", "manifest.json", Some(1), None))?;
    telemetry_append(
        &paths,
        &run_id,
        TelemetryKind::RunStatus {
            status: RunStatus::Created,
        },
    )?;

    tracing::info!(event = "run.initialized", run_id = %run_id, root = %run_root.display());

    Ok(InitResult {
        run_id,
        run_root: run_root.display().to_string(),
        manifest_path: paths.manifest().display().to_string(),
        gates_path: paths.gates().display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opts(runs_root: &Path, run_id: Option<&str>) -> InitOptions {
        InitOptions {
            runs_root: runs_root.to_path_buf(),
            run_id: run_id.map(String::from),
            query: "What is X?".into(),
            constraints: vec![],
            mode: Mode::Standard,
            sensitivity: Sensitivity::Normal,
            session_id: None,
            enabled: true,
        }
    }

    #[test]
    fn test_fresh_init() {
        let dir = tempdir().unwrap();
        let result = run_init(&opts(dir.path(), Some("r-1"))).expect("init");

        assert_eq!(result.run_id, "r-1");
        let paths = RunPaths::new(dir.path().join("r-1"));
        let manifest = crate::manifest_writer::manifest_read(&paths).unwrap();
        assert_eq!(manifest.revision, 1);
        assert_eq!(manifest.stage.current, crate::schema::manifest::StageId::Init);
        let gates = crate::gates_writer::gates_read(&paths).unwrap();
        assert_eq!(gates.revision, 1);

        let ledger = std::fs::read_to_string(ledger_path(dir.path())).unwrap();
        assert_eq!(ledger.lines().count(), 1);
        assert!(!paths.lock().exists());
        assert!(paths.scope().exists());
    }

    #[test]
    fn test_double_init_conflicts_even_with_partial_root() {
        let dir = tempdir().unwrap();
        run_init(&opts(dir.path(), Some("r-1"))).expect("first init");

        // Losing gates.json does not make re-init legal.
        std::fs::remove_file(dir.path().join("r-1/gates.json")).unwrap();
        let err = run_init(&opts(dir.path(), Some("r-1"))).unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExistsConflict);
        assert_eq!(err.details["gates_present"], false);
    }

    #[test]
    fn test_disabled_refuses() {
        let dir = tempdir().unwrap();
        let mut o = opts(dir.path(), Some("r-1"));
        o.enabled = false;
        let err = run_init(&o).unwrap_err();
        assert_eq!(err.code, ErrorCode::Disabled);
    }

    #[test]
    fn test_bad_run_ids_rejected() {
        let dir = tempdir().unwrap();
        for bad in ["", "a/b", "a\\b", ".."] {
            let err = run_init(&opts(dir.path(), Some(bad))).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidArgs, "run_id {bad:?}");
        }
    }

    #[test]
    fn test_generated_run_id() {
        let dir = tempdir().unwrap();
        let result = run_init(&opts(dir.path(), None)).expect("init");
        assert!(result.run_id.starts_with("r-"));
    }
}
