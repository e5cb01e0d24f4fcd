//! Size-bounded summary pack.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const SUMMARY_PACK_SCHEMA: &str = "summary_pack.v1";

/// A claim a summary makes, tied to the citations backing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyClaim {
    pub text: String,
    #[serde(default)]
    pub citation_cids: Vec<String>,
}

/// Index entry for one perspective's summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub perspective_id: String,
    /// Path of the summary markdown, relative to the run root.
    pub path: String,
    pub size_kb: u64,
    #[serde(default)]
    pub key_claims: Vec<KeyClaim>,
}

/// `summaries/summary-pack.json` (schema `summary_pack.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryPack {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub total_size_kb: u64,
    pub entries: Vec<SummaryEntry>,
}

impl SummaryPack {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SUMMARY_PACK_SCHEMA {
            return Err(CoreError::schema(format!(
                "summary pack schema_version {:?}, expected {SUMMARY_PACK_SCHEMA:?}",
                self.schema_version
            )));
        }
        let sum: u64 = self.entries.iter().map(|e| e.size_kb).sum();
        if sum != self.total_size_kb {
            return Err(CoreError::schema(format!(
                "summary pack total_size_kb {} does not match entry sum {sum}",
                self.total_size_kb
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_must_match_entries() {
        let pack = SummaryPack {
            schema_version: SUMMARY_PACK_SCHEMA.into(),
            generated_at: Utc::now(),
            total_size_kb: 12,
            entries: vec![
                SummaryEntry {
                    perspective_id: "p-A".into(),
                    path: "summaries/p-A.md".into(),
                    size_kb: 8,
                    key_claims: vec![KeyClaim {
                        text: "X grew 40% in 2024".into(),
                        citation_cids: vec!["c-0001".into()],
                    }],
                },
                SummaryEntry {
                    perspective_id: "p-B".into(),
                    path: "summaries/p-B.md".into(),
                    size_kb: 4,
                    key_claims: vec![],
                },
            ],
        };
        pack.validate().expect("valid");

        let bad = SummaryPack { total_size_kb: 99, ..pack };
        assert!(bad.validate().is_err());
    }
}
