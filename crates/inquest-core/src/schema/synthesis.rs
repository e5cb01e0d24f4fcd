//! Synthesis meta sidecar.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SYNTHESIS_META_SCHEMA: &str = "synthesis_meta.v1";

/// `synthesis/final-synthesis.meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisMeta {
    pub schema_version: String,
    /// `fixture` or `generated`.
    pub mode: String,
    /// `sha256:<hex>` of the draft markdown.
    pub digest: String,
    pub generated_at: DateTime<Utc>,
}

impl SynthesisMeta {
    pub fn new(mode: &str, digest: String, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SYNTHESIS_META_SCHEMA.to_string(),
            mode: mode.to_string(),
            digest,
            generated_at: now,
        }
    }
}
