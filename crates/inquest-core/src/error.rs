//! Typed error taxonomy for the Inquest core.
//!
//! Every public operation returns a tagged result: success carries a
//! structured value, failure carries a [`CoreError`] with a stable
//! [`ErrorCode`], a human-readable message, and JSON `details` locating
//! the offending artifact. The codes are the public contract between the
//! core and the operator surface; they never change meaning.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Stable error codes grouped by concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Input / state
    InvalidArgs,
    InvalidState,
    InvalidJson,
    SchemaValidationFailed,
    NotFound,
    AlreadyExistsConflict,
    PathTraversal,
    Disabled,

    // Concurrency
    RevisionMismatch,
    LockHeld,
    LockNotHeld,
    LockNotOwned,
    LockReadFailed,
    LockWriteFailed,
    LockReleaseFailed,
    PreviousTickIncomplete,
    Paused,
    Cancelled,

    // Lifecycle
    LifecycleRuleViolation,
    RequestedNextNotAllowed,
    GateBlocked,
    MissingArtifact,
    WaveCapExceeded,
    ReviewCapExceeded,
    WatchdogTimeout,
    TickCapExceeded,
    StageMismatch,
    Wave1PlanStale,
    RunAgentRequired,
    RunAgentFailed,
    RetryRequired,
    RetryCapExhausted,
    UnknownGateId,

    // Content
    MissingRequiredSection,
    TooManyWords,
    MalformedSources,
    TooManySources,
    InvalidToolUsage,
    ToolBudgetExceeded,
    InvalidToolBudget,
    PerspectiveNotFound,
    DuplicatePerspectiveId,
    UnknownCid,
    BundleInvalid,

    // I/O
    WriteFailed,
    ReadFailed,
}

impl ErrorCode {
    /// The wire form of the code (`SCREAMING_SNAKE_CASE`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgs => "INVALID_ARGS",
            Self::InvalidState => "INVALID_STATE",
            Self::InvalidJson => "INVALID_JSON",
            Self::SchemaValidationFailed => "SCHEMA_VALIDATION_FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExistsConflict => "ALREADY_EXISTS_CONFLICT",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::Disabled => "DISABLED",
            Self::RevisionMismatch => "REVISION_MISMATCH",
            Self::LockHeld => "LOCK_HELD",
            Self::LockNotHeld => "LOCK_NOT_HELD",
            Self::LockNotOwned => "LOCK_NOT_OWNED",
            Self::LockReadFailed => "LOCK_READ_FAILED",
            Self::LockWriteFailed => "LOCK_WRITE_FAILED",
            Self::LockReleaseFailed => "LOCK_RELEASE_FAILED",
            Self::PreviousTickIncomplete => "PREVIOUS_TICK_INCOMPLETE",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
            Self::LifecycleRuleViolation => "LIFECYCLE_RULE_VIOLATION",
            Self::RequestedNextNotAllowed => "REQUESTED_NEXT_NOT_ALLOWED",
            Self::GateBlocked => "GATE_BLOCKED",
            Self::MissingArtifact => "MISSING_ARTIFACT",
            Self::WaveCapExceeded => "WAVE_CAP_EXCEEDED",
            Self::ReviewCapExceeded => "REVIEW_CAP_EXCEEDED",
            Self::WatchdogTimeout => "WATCHDOG_TIMEOUT",
            Self::TickCapExceeded => "TICK_CAP_EXCEEDED",
            Self::StageMismatch => "STAGE_MISMATCH",
            Self::Wave1PlanStale => "WAVE1_PLAN_STALE",
            Self::RunAgentRequired => "RUN_AGENT_REQUIRED",
            Self::RunAgentFailed => "RUN_AGENT_FAILED",
            Self::RetryRequired => "RETRY_REQUIRED",
            Self::RetryCapExhausted => "RETRY_CAP_EXHAUSTED",
            Self::UnknownGateId => "UNKNOWN_GATE_ID",
            Self::MissingRequiredSection => "MISSING_REQUIRED_SECTION",
            Self::TooManyWords => "TOO_MANY_WORDS",
            Self::MalformedSources => "MALFORMED_SOURCES",
            Self::TooManySources => "TOO_MANY_SOURCES",
            Self::InvalidToolUsage => "INVALID_TOOL_USAGE",
            Self::ToolBudgetExceeded => "TOOL_BUDGET_EXCEEDED",
            Self::InvalidToolBudget => "INVALID_TOOL_BUDGET",
            Self::PerspectiveNotFound => "PERSPECTIVE_NOT_FOUND",
            Self::DuplicatePerspectiveId => "DUPLICATE_PERSPECTIVE_ID",
            Self::UnknownCid => "UNKNOWN_CID",
            Self::BundleInvalid => "BUNDLE_INVALID",
            Self::WriteFailed => "WRITE_FAILED",
            Self::ReadFailed => "READ_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Error value
// ---------------------------------------------------------------------------

/// Failure envelope carried by every fallible core operation.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    /// Extra context locating the offending artifact (paths, revisions,
    /// gate ids). `null` when there is nothing useful to attach.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// `READ_FAILED` wrapping an I/O error at `path`.
    pub fn read_failed(path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::new(
            ErrorCode::ReadFailed,
            format!("failed to read {}: {err}", path.display()),
        )
        .with_details(serde_json::json!({ "path": path.display().to_string() }))
    }

    /// `WRITE_FAILED` wrapping an I/O error at `path`.
    pub fn write_failed(path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::new(
            ErrorCode::WriteFailed,
            format!("failed to write {}: {err}", path.display()),
        )
        .with_details(serde_json::json!({ "path": path.display().to_string() }))
    }

    /// `NOT_FOUND` for a missing artifact at `path`.
    pub fn not_found(path: &std::path::Path) -> Self {
        Self::new(ErrorCode::NotFound, format!("not found: {}", path.display()))
            .with_details(serde_json::json!({ "path": path.display().to_string() }))
    }

    /// `INVALID_JSON` for an unparseable document at `path`.
    pub fn invalid_json(path: &std::path::Path, err: &serde_json::Error) -> Self {
        Self::new(
            ErrorCode::InvalidJson,
            format!("invalid JSON in {}: {err}", path.display()),
        )
        .with_details(serde_json::json!({ "path": path.display().to_string() }))
    }

    /// `SCHEMA_VALIDATION_FAILED` with a reason.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SchemaValidationFailed, message)
    }
}

/// Result type for Inquest core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_form() {
        assert_eq!(ErrorCode::Wave1PlanStale.as_str(), "WAVE1_PLAN_STALE");
        assert_eq!(ErrorCode::RevisionMismatch.as_str(), "REVISION_MISMATCH");
        assert_eq!(ErrorCode::Cancelled.as_str(), "CANCELLED");
    }

    #[test]
    fn test_error_code_serde_matches_as_str() {
        for code in [
            ErrorCode::InvalidArgs,
            ErrorCode::Wave1PlanStale,
            ErrorCode::PreviousTickIncomplete,
            ErrorCode::TooManySources,
            ErrorCode::WriteFailed,
        ] {
            let json = serde_json::to_string(&code).expect("serialize");
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::new(ErrorCode::GateBlocked, "gate B is not pass");
        assert_eq!(err.to_string(), "GATE_BLOCKED: gate B is not pass");
    }

    #[test]
    fn test_core_error_details_roundtrip() {
        let err = CoreError::new(ErrorCode::MissingArtifact, "no perspectives.json")
            .with_details(serde_json::json!({ "path": "perspectives.json" }));
        let json = serde_json::to_string(&err).expect("serialize");
        let back: CoreError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.code, ErrorCode::MissingArtifact);
        assert_eq!(back.details["path"], "perspectives.json");
    }
}
