//! Append-only audit trail of every mutating action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::paths::RunPaths;
use crate::store;

/// One line of `logs/audit.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    /// e.g. `manifest_write`, `gates_write`, `run_init`.
    pub action: String,
    /// Run-root-relative path of the document touched.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_digest: Option<String>,
    /// `ok` or a terse failure note.
    pub outcome: String,
}

/// Append an audit entry. Best-effort from the caller's point of view
/// only in that the primary write has already landed; an audit failure
/// is still surfaced.
pub fn append(paths: &RunPaths, entry: &AuditEntry) -> Result<()> {
    let line = serde_json::to_string(entry)
        .map_err(|e| crate::error::CoreError::new(crate::error::ErrorCode::WriteFailed, format!("serialize audit entry: {e}")))?;
    store::append_line(&paths.audit_log(), &line)
}

/// Convenience constructor for a successful mutation.
pub fn ok_entry(action: &str, path: &str, revision: Option<u64>, inputs_digest: Option<String>) -> AuditEntry {
    AuditEntry {
        ts: Utc::now(),
        action: action.to_string(),
        path: path.to_string(),
        revision,
        inputs_digest,
        outcome: "ok".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_accumulates_lines() {
        let dir = tempdir().expect("tempdir");
        let paths = RunPaths::new(dir.path());

        append(&paths, &ok_entry("manifest_write", "manifest.json", Some(2), None)).unwrap();
        append(&paths, &ok_entry("gates_write", "gates.json", Some(2), Some("sha256:x".into()))).unwrap();

        let text = std::fs::read_to_string(paths.audit_log()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.action, "manifest_write");
        assert_eq!(first.revision, Some(2));
    }
}
