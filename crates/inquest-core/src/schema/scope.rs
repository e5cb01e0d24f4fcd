//! Operator scope snapshot written at init.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::manifest::{Mode, QuerySpec, Sensitivity};

pub const SCOPE_SCHEMA: &str = "scope.v1";

/// `operator/scope.json`: the resolved intake, frozen at init time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeDoc {
    pub schema_version: String,
    pub run_id: String,
    pub query: QuerySpec,
    pub mode: Mode,
    pub sensitivity: Sensitivity,
    pub created_at: DateTime<Utc>,
}

impl ScopeDoc {
    pub fn new(run_id: &str, query: QuerySpec, mode: Mode, now: DateTime<Utc>) -> Self {
        let sensitivity = query.sensitivity;
        Self {
            schema_version: SCOPE_SCHEMA.to_string(),
            run_id: run_id.to_string(),
            query,
            mode,
            sensitivity,
            created_at: now,
        }
    }
}
