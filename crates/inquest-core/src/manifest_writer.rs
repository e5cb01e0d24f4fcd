//! Revision-safe manifest mutation.
//!
//! Every manifest change in the system goes through [`manifest_write`]:
//! read, optimistic revision check, caller patch, identity-field guard,
//! schema re-validation, revision bump, atomic write, audit append.

use chrono::Utc;

use crate::audit;
use crate::error::{CoreError, ErrorCode, Result};
use crate::paths::RunPaths;
use crate::schema::manifest::Manifest;
use crate::store;

/// Read and validate the manifest.
pub fn manifest_read(paths: &RunPaths) -> Result<Manifest> {
    let value = store::read_json(&paths.manifest())?;
    let manifest: Manifest = serde_json::from_value(value)
        .map_err(|e| CoreError::schema(format!("manifest does not match manifest.v1: {e}")))?;
    manifest.validate()?;
    Ok(manifest)
}

/// Apply `patch` to the manifest under optimistic locking.
///
/// `expected_revision`, when provided, must equal the on-disk revision
/// or the write fails with `REVISION_MISMATCH` and the caller re-reads.
/// The patch may mutate anything except the identity fields
/// (`run_id`, `created_at`, `schema_version`) and the writer-owned
/// bookkeeping (`revision`, `updated_at`), which are restored and
/// stamped here. Returns the written manifest.
pub fn manifest_write(
    paths: &RunPaths,
    expected_revision: Option<u64>,
    action: &str,
    inputs_digest: Option<&str>,
    patch: impl FnOnce(&mut Manifest) -> Result<()>,
) -> Result<Manifest> {
    let current = manifest_read(paths)?;

    if let Some(expected) = expected_revision {
        if current.revision != expected {
            return Err(CoreError::new(
                ErrorCode::RevisionMismatch,
                format!(
                    "manifest revision is {}, caller expected {expected}",
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
    patch(&mut next)?;

    // Identity and bookkeeping are writer-owned.
    next.schema_version = current.schema_version.clone();
    next.run_id = current.run_id.clone();
    next.created_at = current.created_at;
    next.revision = current.revision + 1;
    next.updated_at = Utc::now();

    // History entries written by a transition must be stamped with the
    // same instant as updated_at.
    if next.stage.history.len() > current.stage.history.len() {
        if let Some(last) = next.stage.history.last_mut() {
            last.ts = next.updated_at;
        }
    }

    next.validate()?;

    let value = serde_json::to_value(&next)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize manifest: {e}")))?;
    store::atomic_write_json(&paths.manifest(), &value)?;

    audit::append(
        paths,
        &audit::ok_entry(
            action,
            "manifest.json",
            Some(next.revision),
            inputs_digest.map(String::from),
        ),
    )?;

    Ok(next)
}
