//! Typed on-disk documents and their validators.
//!
//! Every document the orchestrator reads or writes has a struct here
//! with a `schema_version` discriminator and a `validate()` method.
//! Ingress documents are validated on read; the two writers re-validate
//! before every write.

pub mod citations;
pub mod gates;
pub mod manifest;
pub mod perspectives;
pub mod pivot;
pub mod policy;
pub mod review;
pub mod scope;
pub mod summary;
pub mod synthesis;
pub mod telemetry;
pub mod wave;

pub use citations::{
    BlockedUrl, BlockedUrlsDoc, CitationRecord, CitationStatus, FoundBy, FoundByDoc,
    OnlineFixtures, OnlineOutcome, UrlMap, UrlMapEntry,
};
pub use gates::{Gate, GateClass, GateId, GatePatch, GateStatus, GatesDoc};
pub use manifest::{
    FailureEntry, Limits, Manifest, ManifestArtifacts, Metrics, Mode, QuerySpec, RunStatus,
    Sensitivity, StageHistoryEntry, StageId, StageState,
};
pub use perspectives::{Perspective, PerspectivesDoc, PromptContract, Track};
pub use pivot::{PivotDecision, PivotDoc};
pub use policy::{CitationsLadderPolicy, RunLockPolicy, RunPolicy};
pub use review::{
    CitationUtilizationReport, NumericClaimsReport, ReviewBundle, ReviewDecision, ReviewFinding,
    SectionsReport,
};
pub use scope::ScopeDoc;
pub use summary::{KeyClaim, SummaryEntry, SummaryPack};
pub use synthesis::SynthesisMeta;
pub use telemetry::{RunMetricsDoc, StageMetrics, TelemetryEvent, TelemetryIndex, TelemetryKind};
pub use wave::{
    AgentResultDoc, PlanEntry, RetryDirective, RetryDirectivesDoc, Wave1Plan, WaveOutputMeta,
    WaveResultEntry, WaveReview,
};
