//! Inquest Core Library
//!
//! Deterministic, resumable research-run orchestration: the run
//! lifecycle state machine, gate evaluation, wave execution, citation
//! validation, synthesis review, and the telemetry that observes it
//! all. Every side effect lands inside a single run root directory.

pub mod advancer;
pub mod audit;
pub mod citations;
pub mod driver;
pub mod error;
pub mod gates_eval;
pub mod gates_writer;
pub mod init;
pub mod lock;
pub mod manifest_writer;
pub mod obs;
pub mod paths;
pub mod retry;
pub mod review;
pub mod schema;
pub mod store;
pub mod summary;
pub mod synthesis;
pub mod telemetry;
pub mod tick;
pub mod watchdog;
pub mod wave;

pub use advancer::{advance, allowed_next, Transition};
pub use citations::{
    build_url_map, citations_extract_urls, citations_validate, read_citations, CitationsMode,
};
pub use driver::{AgentDriver, AgentRequest, AgentResponse, FixtureDriver, TaskDriver};
pub use error::{CoreError, ErrorCode, Result};
pub use gates_eval::{
    gate_a_evaluate, gate_b_derive, gate_c_evaluate, gate_d_evaluate, gate_e_evaluate,
    gate_f_evaluate, ExtractorEndpoints, GateEvaluation,
};
pub use gates_writer::{gates_read, gates_write};
pub use init::{run_init, InitOptions, InitResult};
pub use lock::{Heartbeat, LockInfo, RunLock};
pub use manifest_writer::{manifest_read, manifest_write};
pub use obs::{init_tracing, RunSpan};
pub use paths::RunPaths;
pub use retry::{retry_cap, retry_record, revision_control, RevisionAction};
pub use review::{gate_e_reports, review_factory_run};
pub use schema::{
    Gate, GateClass, GateId, GateStatus, GatesDoc, Limits, Manifest, Mode, PerspectivesDoc,
    ReviewBundle, ReviewDecision, RunPolicy, RunStatus, Sensitivity, StageId,
};
pub use summary::{summary_pack_build, SummarySource};
pub use synthesis::{synthesis_write, SynthesisSource};
pub use telemetry::{run_metrics_write, telemetry_append, telemetry_read};
pub use tick::{
    read_policy, tick_live, tick_post_summaries, TickLiveConfig, TickOutcome, TickPostConfig,
};
pub use watchdog::{watchdog_check, WatchdogOutcome};
pub use wave::{plan_wave1, run_wave, WaveRunSummary};

/// Inquest version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
