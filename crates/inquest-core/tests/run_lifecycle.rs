//! End-to-end lifecycle coverage: init, ticking through the pipeline,
//! the review cycle cap, and the watchdog.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;

use inquest_core::citations::CitationsMode;
use inquest_core::driver::{AgentResponse, FixtureDriver};
use inquest_core::error::ErrorCode;
use inquest_core::init::{ledger_path, run_init, InitOptions};
use inquest_core::schema::manifest::{Mode, RunStatus, Sensitivity, StageId};
use inquest_core::schema::perspectives::{Perspective, PerspectivesDoc, PromptContract, Track};
use inquest_core::schema::policy::RunPolicy;
use inquest_core::summary::SummarySource;
use inquest_core::synthesis::SynthesisSource;
use inquest_core::tick::{tick_live, tick_post_summaries, TickLiveConfig, TickPostConfig};
use inquest_core::watchdog::watchdog_check;
use inquest_core::{gates_read, manifest_read, manifest_write, store, GateId, GateStatus, RunPaths};

fn init_opts(runs_root: &Path, mode: Mode) -> InitOptions {
    InitOptions {
        runs_root: runs_root.to_path_buf(),
        run_id: Some("r-1".into()),
        query: "What is X?".into(),
        constraints: vec![],
        mode,
        sensitivity: Sensitivity::Normal,
        session_id: Some("sess-42".into()),
        enabled: true,
    }
}

fn seed_perspectives(paths: &RunPaths, ids: &[&str]) {
    let doc = PerspectivesDoc::new(
        ids.iter()
            .map(|id| Perspective {
                id: id.to_string(),
                title: format!("Perspective {id}"),
                track: Track::Independent,
                agent_type: "researcher".into(),
                prompt_contract: PromptContract {
                    max_words: 800,
                    max_sources: 6,
                    tool_budget: 12,
                    must_include_sections: vec!["Findings".into(), "Sources".into()],
                },
            })
            .collect(),
    );
    store::atomic_write_json(&paths.perspectives(), &serde_json::to_value(&doc).unwrap()).unwrap();
}

fn fixture_driver(ids: &[&str]) -> FixtureDriver {
    let mut responses = BTreeMap::new();
    for id in ids {
        responses.insert(
            id.to_string(),
            AgentResponse {
                markdown: format!(
                    "## Findings\nEvidence gathered for {id}.\n\n## Sources\n- https://{}.example/source\n",
                    id.to_lowercase()
                ),
                agent_run_id: Some(format!("agent-{id}")),
                ..AgentResponse::default()
            },
        );
    }
    FixtureDriver::new(responses)
}

fn citation_fixture(dir: &Path, ids: &[&str]) -> PathBuf {
    let mut outcomes = serde_json::Map::new();
    for id in ids {
        outcomes.insert(
            format!("https://{}.example/source", id.to_lowercase()),
            serde_json::json!({ "status": "valid", "http_status": 200 }),
        );
    }
    let path = dir.join("citation-fixtures.json");
    std::fs::write(
        &path,
        serde_json::to_string_pretty(&serde_json::json!({
            "schema_version": "online_fixtures.v1",
            "generated_at": "2026-07-01T00:00:00Z",
            "outcomes": outcomes,
        }))
        .unwrap(),
    )
    .unwrap();
    path
}

fn live_config(fixture: &Path) -> TickLiveConfig {
    TickLiveConfig {
        reason: "integration tick".into(),
        citations_mode: CitationsMode::Offline {
            fixture_path: fixture.to_path_buf(),
        },
    }
}

fn post_config() -> TickPostConfig {
    TickPostConfig {
        reason: "integration tick".into(),
        summary_source: SummarySource::Generated,
        synthesis_source: SynthesisSource::Generated,
    }
}

#[test]
fn fresh_init_seeds_run_root_and_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_init(&init_opts(dir.path(), Mode::Standard)).expect("init");

    assert_eq!(result.run_id, "r-1");
    assert!(result.run_root.ends_with("r-1"));

    let paths = RunPaths::new(&result.run_root);
    let manifest = manifest_read(&paths).unwrap();
    assert_eq!(manifest.revision, 1);
    assert_eq!(manifest.stage.current, StageId::Init);
    assert_eq!(manifest.status, RunStatus::Created);

    let gates = gates_read(&paths).unwrap();
    assert_eq!(gates.revision, 1);
    for gate in gates.gates.values() {
        assert_eq!(gate.status, GateStatus::NotRun);
    }

    let ledger = std::fs::read_to_string(ledger_path(dir.path())).unwrap();
    assert_eq!(ledger.lines().count(), 1);
    let entry: serde_json::Value = serde_json::from_str(ledger.lines().next().unwrap()).unwrap();
    assert_eq!(entry["run_id"], "r-1");
    assert_eq!(entry["session_id"], "sess-42");

    assert!(!paths.lock().exists());
}

#[test]
fn double_init_is_a_conflict_even_after_partial_damage() {
    let dir = tempfile::tempdir().unwrap();
    run_init(&init_opts(dir.path(), Mode::Standard)).expect("first init");

    std::fs::remove_file(dir.path().join("r-1/gates.json")).unwrap();
    let err = run_init(&init_opts(dir.path(), Mode::Standard)).unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyExistsConflict);
}

#[tokio::test]
async fn wave1_happy_path_reaches_pivot_with_fresh_sidecars() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_init(&init_opts(dir.path(), Mode::Standard)).expect("init");
    let paths = RunPaths::new(&result.run_root);
    seed_perspectives(&paths, &["p-A", "p-B"]);
    let fixture = citation_fixture(dir.path(), &["p-A", "p-B"]);

    let driver = fixture_driver(&["p-A", "p-B"]);
    let outcome = tick_live(&paths, &driver, &live_config(&fixture)).await.expect("tick");

    assert_eq!(outcome.from, StageId::Init);
    assert_eq!(outcome.to, StageId::Pivot);
    assert_eq!(outcome.wave_outputs_count, Some(2));
    assert!(outcome.decision_inputs_digest.unwrap().starts_with("sha256:"));

    for pid in ["p-A", "p-B"] {
        assert!(paths.wave_output(1, pid).exists());
        let sidecar: serde_json::Value =
            store::read_json(&paths.wave_sidecar(1, pid)).unwrap();
        assert!(sidecar["prompt_digest"].as_str().unwrap().starts_with("sha256:"));
    }

    let review: serde_json::Value = store::read_json(&paths.wave_review()).unwrap();
    assert_eq!(review["pass"], true);
    assert_eq!(gates_read(&paths).unwrap().status(GateId::B), GateStatus::Pass);
}

#[tokio::test]
async fn review_cycle_cap_blocks_second_revision() {
    let dir = tempfile::tempdir().unwrap();
    // Quick mode: max_review_iterations = 1.
    let result = run_init(&init_opts(dir.path(), Mode::Quick)).expect("init");
    let paths = RunPaths::new(&result.run_root);
    seed_perspectives(&paths, &["p-A"]);
    let fixture = citation_fixture(dir.path(), &["p-A"]);
    let driver = fixture_driver(&["p-A"]);

    tick_live(&paths, &driver, &live_config(&fixture)).await.expect("wave tick");
    tick_live(&paths, &driver, &live_config(&fixture)).await.expect("pivot tick");
    tick_live(&paths, &driver, &live_config(&fixture)).await.expect("citations tick");
    tick_post_summaries(&paths, &post_config()).await.expect("summaries tick");

    // A synthesis fixture with an uncited numeric claim forces
    // CHANGES_REQUIRED on every review pass.
    let draft = dir.path().join("draft.md");
    std::fs::write(
        &draft,
        "## Summary\nContext [@c-0001].\n## Key Findings\n- The market grew 45% in 2024\n## Evidence\n- [@c-0001]\n## Caveats\n- none\n",
    )
    .unwrap();
    let bad_post = TickPostConfig {
        reason: "integration tick".into(),
        summary_source: SummarySource::Generated,
        synthesis_source: SynthesisSource::Fixture { path: draft },
    };

    let t = tick_post_summaries(&paths, &bad_post).await.expect("synthesis tick");
    assert_eq!((t.from, t.to), (StageId::Synthesis, StageId::Review));

    // First review: changes required, one revision cycle is allowed.
    let t = tick_post_summaries(&paths, &bad_post).await.expect("review tick 1");
    assert_eq!((t.from, t.to), (StageId::Review, StageId::Synthesis));
    assert_eq!(t.review_iteration, Some(1));

    // Redraft (same bad fixture) and review again.
    let t = tick_post_summaries(&paths, &bad_post).await.expect("synthesis tick 2");
    assert_eq!(t.to, StageId::Review);

    let before = manifest_read(&paths).unwrap();
    let err = tick_post_summaries(&paths, &bad_post).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ReviewCapExceeded);

    // The failed advance left the stage untouched.
    let after = manifest_read(&paths).unwrap();
    assert_eq!(after.stage.current, StageId::Review);
    assert_eq!(after.review_cycle_count(), before.review_cycle_count());
}

#[test]
fn watchdog_times_out_stalled_wave1() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_init(&init_opts(dir.path(), Mode::Standard)).expect("init");
    let paths = RunPaths::new(&result.run_root);

    // Put the run in wave1 with progress stamped 10 minutes ago.
    manifest_write(&paths, None, "test_setup", None, |m| {
        m.status = RunStatus::Running;
        m.stage.current = StageId::Wave1;
        m.stage.started_at = Utc::now() - chrono::Duration::seconds(900);
        m.stage.last_progress_at = Some(Utc::now() - chrono::Duration::seconds(601));
        Ok(())
    })
    .unwrap();

    let outcome = watchdog_check(&paths, &RunPolicy::default(), Utc::now()).expect("watchdog");
    assert!(outcome.timed_out);
    assert_eq!(outcome.timeout_s, 600);

    assert!(paths.timeout_checkpoint_json().exists());
    assert!(paths.timeout_checkpoint_md().exists());

    let manifest = manifest_read(&paths).unwrap();
    assert_eq!(manifest.status, RunStatus::Failed);
    assert_eq!(manifest.failures[0].kind, "timeout");
    assert_eq!(manifest.failures[0].stage, StageId::Wave1);
}

#[tokio::test]
async fn telemetry_seq_is_strictly_monotone_across_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_init(&init_opts(dir.path(), Mode::Standard)).expect("init");
    let paths = RunPaths::new(&result.run_root);
    seed_perspectives(&paths, &["p-A"]);
    let fixture = citation_fixture(dir.path(), &["p-A"]);
    let driver = fixture_driver(&["p-A"]);

    tick_live(&paths, &driver, &live_config(&fixture)).await.expect("wave tick");
    tick_live(&paths, &driver, &live_config(&fixture)).await.expect("pivot tick");
    tick_live(&paths, &driver, &live_config(&fixture)).await.expect("citations tick");

    let events = inquest_core::telemetry_read(&paths, "r-1").expect("read");
    assert!(!events.is_empty());
    for pair in events.windows(2) {
        assert!(pair[1].seq > pair[0].seq);
    }
}
