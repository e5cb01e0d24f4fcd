//! Run-root layout.
//!
//! One place that knows where every artifact lives under a run root, so
//! the rest of the core never spells out relative paths by hand.

use std::path::{Path, PathBuf};

/// Resolved locations of every artifact inside a run root.
#[derive(Debug, Clone)]
pub struct RunPaths {
    root: PathBuf,
}

impl RunPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn gates(&self) -> PathBuf {
        self.root.join("gates.json")
    }

    pub fn perspectives(&self) -> PathBuf {
        self.root.join("perspectives.json")
    }

    pub fn pivot(&self) -> PathBuf {
        self.root.join("pivot.json")
    }

    pub fn wave_dir(&self, wave: u8) -> PathBuf {
        self.root.join(format!("wave-{wave}"))
    }

    pub fn wave_output(&self, wave: u8, perspective_id: &str) -> PathBuf {
        self.wave_dir(wave).join(format!("{perspective_id}.md"))
    }

    pub fn wave_sidecar(&self, wave: u8, perspective_id: &str) -> PathBuf {
        self.wave_dir(wave).join(format!("{perspective_id}.meta.json"))
    }

    pub fn wave1_plan(&self) -> PathBuf {
        self.wave_dir(1).join("wave1-plan.json")
    }

    pub fn wave_review(&self) -> PathBuf {
        self.root.join("wave-review.json")
    }

    pub fn citations_dir(&self) -> PathBuf {
        self.root.join("citations")
    }

    pub fn extracted_urls(&self) -> PathBuf {
        self.citations_dir().join("extracted-urls.txt")
    }

    pub fn found_by(&self) -> PathBuf {
        self.citations_dir().join("found-by.json")
    }

    pub fn url_map(&self) -> PathBuf {
        self.citations_dir().join("url-map.json")
    }

    pub fn citations_jsonl(&self) -> PathBuf {
        self.citations_dir().join("citations.jsonl")
    }

    pub fn online_fixtures_latest(&self) -> PathBuf {
        self.citations_dir().join("online-fixtures.latest.json")
    }

    pub fn online_fixtures_stamped(&self, ts_compact: &str) -> PathBuf {
        self.citations_dir()
            .join(format!("online-fixtures.{ts_compact}.json"))
    }

    pub fn blocked_urls(&self) -> PathBuf {
        self.citations_dir().join("blocked-urls.json")
    }

    pub fn blocked_urls_queue(&self) -> PathBuf {
        self.citations_dir().join("blocked-urls.queue.md")
    }

    pub fn summaries_dir(&self) -> PathBuf {
        self.root.join("summaries")
    }

    pub fn summary_pack(&self) -> PathBuf {
        self.summaries_dir().join("summary-pack.json")
    }

    pub fn summary_md(&self, perspective_id: &str) -> PathBuf {
        self.summaries_dir().join(format!("{perspective_id}.md"))
    }

    pub fn synthesis_dir(&self) -> PathBuf {
        self.root.join("synthesis")
    }

    pub fn synthesis_md(&self) -> PathBuf {
        self.synthesis_dir().join("final-synthesis.md")
    }

    pub fn synthesis_meta(&self) -> PathBuf {
        self.synthesis_dir().join("final-synthesis.meta.json")
    }

    pub fn review_bundle(&self) -> PathBuf {
        self.root.join("review").join("review-bundle.json")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn gate_e_report(&self, name: &str) -> PathBuf {
        self.reports_dir().join(format!("gate-e-{name}.json"))
    }

    pub fn run_metrics(&self) -> PathBuf {
        self.root.join("metrics").join("run-metrics.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.logs_dir().join("audit.jsonl")
    }

    pub fn telemetry_log(&self) -> PathBuf {
        self.logs_dir().join("telemetry.jsonl")
    }

    pub fn telemetry_index(&self) -> PathBuf {
        self.logs_dir().join("telemetry.index.json")
    }

    pub fn tick_marker(&self) -> PathBuf {
        self.logs_dir().join("tick-in-progress.json")
    }

    pub fn timeout_checkpoint_json(&self) -> PathBuf {
        self.logs_dir().join("timeout-checkpoint.json")
    }

    pub fn timeout_checkpoint_md(&self) -> PathBuf {
        self.logs_dir().join("timeout-checkpoint.md")
    }

    pub fn retry_directives(&self) -> PathBuf {
        self.root.join("retry").join("retry-directives.json")
    }

    pub fn operator_dir(&self) -> PathBuf {
        self.root.join("operator")
    }

    pub fn scope(&self) -> PathBuf {
        self.operator_dir().join("scope.json")
    }

    pub fn agent_result(&self, perspective_id: &str) -> PathBuf {
        self.operator_dir()
            .join("agent-results")
            .join(format!("{perspective_id}.json"))
    }

    pub fn policy(&self) -> PathBuf {
        self.root.join("run-config").join("policy.json")
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Directories seeded by the run initializer.
    pub fn seed_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.wave_dir(1),
            self.wave_dir(2),
            self.citations_dir(),
            self.summaries_dir(),
            self.synthesis_dir(),
            self.root.join("review"),
            self.reports_dir(),
            self.root.join("metrics"),
            self.logs_dir(),
            self.root.join("retry"),
            self.operator_dir(),
            self.root.join("run-config"),
        ]
    }
}
