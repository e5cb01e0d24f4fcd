//! Citations pipeline: extraction, URL mapping, and validation.
//!
//! Phase 1 scans wave outputs for `## Sources` URLs, phase 2 normalizes
//! and de-duplicates them into a stable-cid url map, phase 3 classifies
//! each URL as `valid | invalid | blocked` either from offline fixtures
//! or through the tiered online ladder.

mod extract;
mod normalize;
mod validate;

pub use extract::{citations_extract_urls, ExtractedUrls};
pub use normalize::{build_url_map, normalize_url, NormalizedUrl};
pub use validate::{citations_validate, CitationsMode, ValidationSummary};

use crate::error::{CoreError, ErrorCode, Result};
use crate::paths::RunPaths;
use crate::schema::citations::CitationRecord;
use crate::store;

/// Cap on `found_by` entries kept per URL.
pub const FOUND_BY_CAP: usize = 20;

/// Read `citations/citations.jsonl` into records.
pub fn read_citations(paths: &RunPaths) -> Result<Vec<CitationRecord>> {
    let text = store::read_text(&paths.citations_jsonl())?;
    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: CitationRecord = serde_json::from_str(line).map_err(|e| {
            CoreError::new(
                ErrorCode::InvalidJson,
                format!("citations.jsonl line {}: {e}", idx + 1),
            )
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Write citation records as sorted canonical JSONL.
///
/// Records are sorted by `(normalized_url, url_original)` and the file
/// holds at most one record per normalized URL; re-running with the
/// same inputs yields identical bytes apart from `checked_at`.
pub fn write_citations(paths: &RunPaths, records: &mut Vec<CitationRecord>) -> Result<()> {
    records.sort_by(|a, b| {
        a.normalized_url
            .cmp(&b.normalized_url)
            .then_with(|| a.url_original.cmp(&b.url_original))
    });

    let mut seen = std::collections::BTreeSet::new();
    for record in records.iter() {
        if !seen.insert(record.normalized_url.as_str()) {
            return Err(CoreError::schema(format!(
                "duplicate citation record for {}",
                record.normalized_url
            )));
        }
    }

    let mut body = String::new();
    for record in records.iter() {
        let value = serde_json::to_value(record)
            .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize citation: {e}")))?;
        body.push_str(&store::canonical_json_string(&value)?);
        body.push('\n');
    }
    store::atomic_write_text(&paths.citations_jsonl(), &body)
}
