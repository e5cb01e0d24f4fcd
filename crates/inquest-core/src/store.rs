//! Artifact store: atomic writes, canonical JSON, digests, containment.
//!
//! Every on-disk mutation in a run root funnels through this module.
//! Writes are temp-file-then-rename in the destination directory so a
//! crash never leaves a partially written document. Digests are SHA-256
//! over canonical JSON (recursively sorted object keys, compact form)
//! and are rendered as `sha256:<hex>`.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::{CoreError, ErrorCode, Result};

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// Serialize `value` as pretty JSON and atomically write it to `path`.
///
/// Parent directories are created on demand. The write goes to a temp
/// file in the destination directory followed by a rename.
pub fn atomic_write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize: {e}")))?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

/// Atomically write raw text to `path`.
pub fn atomic_write_text(path: &Path, text: &str) -> Result<()> {
    atomic_write_bytes(path, text.as_bytes())
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| CoreError::new(ErrorCode::InvalidArgs, "path has no parent directory"))?;
    fs::create_dir_all(dir).map_err(|e| CoreError::write_failed(path, &e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| CoreError::write_failed(path, &e))?;
    tmp.write_all(bytes)
        .map_err(|e| CoreError::write_failed(path, &e))?;
    tmp.persist(path)
        .map_err(|e| CoreError::write_failed(path, &e.error))?;
    Ok(())
}

/// Append one line (adds the trailing newline) to an append-only file.
///
/// Relies on OS-level atomic append of a single line; used for the runs
/// ledger, audit trail, and telemetry stream.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| CoreError::new(ErrorCode::InvalidArgs, "path has no parent directory"))?;
    fs::create_dir_all(dir).map_err(|e| CoreError::write_failed(path, &e))?;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CoreError::write_failed(path, &e))?;
    file.write_all(line.as_bytes())
        .map_err(|e| CoreError::write_failed(path, &e))?;
    file.write_all(b"\n")
        .map_err(|e| CoreError::write_failed(path, &e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Read and parse a JSON document.
///
/// Missing file → `NOT_FOUND`; unparseable content → `INVALID_JSON`.
pub fn read_json(path: &Path) -> Result<serde_json::Value> {
    let bytes = fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CoreError::not_found(path)
        } else {
            CoreError::read_failed(path, &e)
        }
    })?;
    serde_json::from_slice(&bytes).map_err(|e| CoreError::invalid_json(path, &e))
}

/// Read a UTF-8 text file.
pub fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CoreError::not_found(path)
        } else {
            CoreError::read_failed(path, &e)
        }
    })
}

// ---------------------------------------------------------------------------
// Canonical JSON + digests
// ---------------------------------------------------------------------------

/// Recursively sort object keys, producing a deterministic value.
///
/// Arrays keep their order; scalars pass through.
pub fn canonicalize_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), canonicalize_json(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(canonicalize_json).collect())
        }
        other => other.clone(),
    }
}

/// Compact canonical serialization of `value`.
pub fn canonical_json_string(value: &serde_json::Value) -> Result<String> {
    serde_json::to_string(&canonicalize_json(value))
        .map_err(|e| CoreError::new(ErrorCode::InvalidJson, format!("canonicalize: {e}")))
}

/// SHA-256 over a UTF-8 string, lowercase hex.
pub fn sha256_hex_lower_utf8(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// `sha256:<hex>` digest of the canonical form of a JSON value.
pub fn sha256_digest_for_json(value: &serde_json::Value) -> Result<String> {
    let canonical = canonical_json_string(value)?;
    Ok(format!("sha256:{}", sha256_hex_lower_utf8(&canonical)))
}

/// `sha256:<hex>` digest of a markdown/text payload.
pub fn sha256_digest_for_text(text: &str) -> String {
    format!("sha256:{}", sha256_hex_lower_utf8(text))
}

// ---------------------------------------------------------------------------
// Path containment
// ---------------------------------------------------------------------------

/// Lexical containment: `candidate` stays inside `base` without any
/// `..` escape. Does not touch the filesystem.
pub fn is_path_within(base: &Path, candidate: &Path) -> bool {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return false;
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized.starts_with(base)
}

/// Containment check after symlink resolution.
///
/// The deepest existing ancestor of `candidate` is canonicalized so a
/// symlink planted anywhere along the path cannot escape `base`.
/// Returns the (possibly non-existent) resolved path on success,
/// `PATH_TRAVERSAL` on escape.
pub fn resolve_within(base: &Path, candidate: &Path) -> Result<PathBuf> {
    if !is_path_within(base, candidate) {
        return Err(CoreError::new(
            ErrorCode::PathTraversal,
            format!("path escapes run root: {}", candidate.display()),
        ));
    }

    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };

    let canonical_base = base
        .canonicalize()
        .map_err(|e| CoreError::read_failed(base, &e))?;

    // Walk up to the deepest existing ancestor, canonicalize it, then
    // re-append the non-existent tail.
    let mut existing = joined.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }

    let mut resolved = existing
        .canonicalize()
        .map_err(|e| CoreError::read_failed(&existing, &e))?;
    for part in tail.iter().rev() {
        resolved.push(part);
    }

    if !resolved.starts_with(&canonical_base) {
        return Err(CoreError::new(
            ErrorCode::PathTraversal,
            format!("path escapes run root after resolution: {}", candidate.display()),
        ));
    }
    Ok(resolved)
}
