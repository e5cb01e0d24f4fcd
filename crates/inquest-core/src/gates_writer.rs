//! Revision-safe gate patching.
//!
//! Gate patches are whitelisted to `status | checked_at | metrics |
//! artifacts | warnings | notes`; identity, name, and class are fixed
//! at init. A status update must carry `checked_at`.

use chrono::Utc;

use crate::audit;
use crate::error::{CoreError, ErrorCode, Result};
use crate::paths::RunPaths;
use crate::schema::gates::{GateId, GatePatch, GatesDoc};
use crate::store;

/// Read and validate the gates document.
pub fn gates_read(paths: &RunPaths) -> Result<GatesDoc> {
    let value = store::read_json(&paths.gates())?;
    let doc: GatesDoc = serde_json::from_value(value)
        .map_err(|e| CoreError::schema(format!("gates do not match gates.v1: {e}")))?;
    doc.validate()?;
    Ok(doc)
}

/// Apply whitelisted patches to one or more gates.
///
/// `inputs_digest` names the evaluated inputs that justify the patch
/// and is stored on the document. Returns the written document.
pub fn gates_write(
    paths: &RunPaths,
    expected_revision: Option<u64>,
    inputs_digest: &str,
    patches: &[(GateId, GatePatch)],
) -> Result<GatesDoc> {
    let current = gates_read(paths)?;

    if let Some(expected) = expected_revision {
        if current.revision != expected {
            return Err(CoreError::new(
                ErrorCode::RevisionMismatch,
                format!(
                    "gates revision is {}, caller expected {expected}",
                    current.revision
                ),
            )
            .with_details(serde_json::json!({
                "actual": current.revision,
                "expected": expected,
            })));
        }
    }

    let mut next = current.clone();
    for (id, patch) in patches {
        let gate = next
            .gates
            .get_mut(id.as_str())
            .ok_or_else(|| CoreError::new(ErrorCode::UnknownGateId, format!("gate {id} missing")))?;

        if patch.status.is_some() && patch.checked_at.is_none() {
            return Err(CoreError::schema(format!(
                "gate {id} status update requires checked_at"
            )));
        }
        if let Some(status) = patch.status {
            gate.status = status;
        }
        if let Some(checked_at) = patch.checked_at {
            gate.checked_at = Some(checked_at);
        }
        if let Some(metrics) = &patch.metrics {
            gate.metrics = metrics.clone();
        }
        if let Some(artifacts) = &patch.artifacts {
            gate.artifacts = artifacts.clone();
        }
        if let Some(warnings) = &patch.warnings {
            gate.warnings = warnings.clone();
        }
        if let Some(notes) = &patch.notes {
            gate.notes = notes.clone();
        }
    }

    next.revision = current.revision + 1;
    next.updated_at = Utc::now();
    next.inputs_digest = inputs_digest.to_string();
    next.validate()?;

    let value = serde_json::to_value(&next)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize gates: {e}")))?;
    store::atomic_write_json(&paths.gates(), &value)?;

    audit::append(
        paths,
        &audit::ok_entry(
            "gates_write",
            "gates.json",
            Some(next.revision),
            Some(inputs_digest.to_string()),
        ),
    )?;

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::gates::{GateStatus, GATES_SCHEMA};
    use tempfile::tempdir;

    fn seed(paths: &RunPaths) -> GatesDoc {
        let doc = GatesDoc::initial(Utc::now());
        assert_eq!(doc.schema_version, GATES_SCHEMA);
        store::atomic_write_json(&paths.gates(), &serde_json::to_value(&doc).unwrap()).unwrap();
        doc
    }

    fn pass_patch() -> GatePatch {
        GatePatch {
            status: Some(GateStatus::Pass),
            checked_at: Some(Utc::now()),
            metrics: Some(serde_json::json!({ "validated": 2 })),
            artifacts: Some(vec!["wave-review.json".into()]),
            warnings: Some(vec![]),
            notes: Some("all outputs validated".into()),
        }
    }

    #[test]
    fn test_patch_bumps_revision_and_sets_digest() {
        let dir = tempdir().expect("tempdir");
        let paths = RunPaths::new(dir.path());
        seed(&paths);

        let written = gates_write(&paths, Some(1), "sha256:abc", &[(GateId::B, pass_patch())])
            .expect("write");
        assert_eq!(written.revision, 2);
        assert_eq!(written.inputs_digest, "sha256:abc");
        assert_eq!(written.status(GateId::B), GateStatus::Pass);
        assert_eq!(written.status(GateId::C), GateStatus::NotRun);
    }

    #[test]
    fn test_status_without_checked_at_rejected() {
        let dir = tempdir().expect("tempdir");
        let paths = RunPaths::new(dir.path());
        seed(&paths);

        let patch = GatePatch {
            status: Some(GateStatus::Fail),
            ..GatePatch::default()
        };
        let err = gates_write(&paths, None, "sha256:x", &[(GateId::B, patch)]).unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaValidationFailed);
    }

    #[test]
    fn test_hard_gate_warn_rejected_at_write() {
        let dir = tempdir().expect("tempdir");
        let paths = RunPaths::new(dir.path());
        seed(&paths);

        let patch = GatePatch {
            status: Some(GateStatus::Warn),
            checked_at: Some(Utc::now()),
            ..GatePatch::default()
        };
        let err = gates_write(&paths, None, "sha256:x", &[(GateId::E, patch)]).unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaValidationFailed);

        // Unchanged on disk.
        assert_eq!(gates_read(&paths).unwrap().revision, 1);
    }

    #[test]
    fn test_revision_mismatch() {
        let dir = tempdir().expect("tempdir");
        let paths = RunPaths::new(dir.path());
        seed(&paths);

        let err = gates_write(&paths, Some(5), "sha256:x", &[(GateId::B, pass_patch())])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RevisionMismatch);
    }
}
