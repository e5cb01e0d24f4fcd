//! Wave pipeline: plan, execute, ingest, validate, review, Gate B.
//!
//! Wave execution is resumable: an output whose sidecar records the
//! digest of the exact prompt we would send is fresh and the driver is
//! not re-invoked. Ingestion is transactional per wave; a hard failure
//! restores the rename-backups taken at the start of the tick.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;

use crate::driver::{AgentDriver, AgentRequest};
use crate::error::{CoreError, ErrorCode, Result};
use crate::gates_eval::gate_b_derive;
use crate::gates_writer::gates_write;
use crate::manifest_writer::{manifest_read, manifest_write};
use crate::paths::RunPaths;
use crate::retry::retry_record;
use crate::schema::gates::GateId;
use crate::schema::manifest::{Manifest, QuerySpec};
use crate::schema::perspectives::{Perspective, PerspectivesDoc, PromptContract};
use crate::schema::wave::{
    PlanEntry, RetryDirective, RetryDirectivesDoc, Wave1Plan, WaveOutputMeta, WaveResultEntry,
    WaveReview, RETRY_DIRECTIVES_SCHEMA, WAVE1_PLAN_SCHEMA, WAVE_OUTPUT_META_SCHEMA,
    WAVE_REVIEW_SCHEMA,
};
use crate::store;

/// Validation failure codes that defer to a retry directive instead of
/// failing the tick outright.
pub const DEFERRED_FAILURE_CODES: [&str; 4] = [
    "MISSING_REQUIRED_SECTION",
    "TOO_MANY_WORDS",
    "MALFORMED_SOURCES",
    "TOO_MANY_SOURCES",
];

// ---------------------------------------------------------------------------
// Prompt and plan
// ---------------------------------------------------------------------------

/// Render the prompt for one perspective.
pub fn build_prompt(query: &QuerySpec, perspective: &Perspective) -> String {
    let contract = &perspective.prompt_contract;
    let mut prompt = format!(
        "# Research Task: {}\n\n{}\n",
        perspective.title, query.text
    );
    if !query.constraints.is_empty() {
        prompt.push_str("\n## Constraints\n");
        for constraint in &query.constraints {
            prompt.push_str(&format!("- {constraint}\n"));
        }
    }
    prompt.push_str("\n## Output Contract\n");
    for section in &contract.must_include_sections {
        prompt.push_str(&format!("- Include a `## {section}` section.\n"));
    }
    prompt.push_str(&format!(
        "- At most {} words and {} sources; list sources under `## Sources`.\n",
        contract.max_words, contract.max_sources
    ));
    prompt
}

/// Append an active retry directive to the base prompt.
pub fn effective_prompt(base: &str, directive: Option<&RetryDirective>) -> String {
    match directive {
        Some(d) => format!(
            "{base}\n## Retry Directive\n\n{} ({})\n",
            d.instruction, d.failure_code
        ),
        None => base.to_string(),
    }
}

/// Read and validate `perspectives.json`.
pub fn perspectives_read(paths: &RunPaths) -> Result<PerspectivesDoc> {
    let value = store::read_json(&paths.perspectives())?;
    let doc: PerspectivesDoc = serde_json::from_value(value)
        .map_err(|e| CoreError::schema(format!("perspectives do not match perspectives.v1: {e}")))?;
    doc.validate()?;
    Ok(doc)
}

fn perspectives_digest(doc: &PerspectivesDoc) -> Result<String> {
    let value = serde_json::to_value(doc)
        .map_err(|e| CoreError::new(ErrorCode::InvalidJson, format!("serialize perspectives: {e}")))?;
    store::sha256_digest_for_json(&value)
}

/// Build and persist `wave-1/wave1-plan.json` from the perspectives.
pub fn plan_wave1(paths: &RunPaths, manifest: &Manifest) -> Result<Wave1Plan> {
    let perspectives = perspectives_read(paths)?;
    if perspectives.perspectives.len() > manifest.limits.max_wave1_agents as usize {
        return Err(CoreError::new(
            ErrorCode::WaveCapExceeded,
            format!(
                "{} perspectives exceed max_wave1_agents {}",
                perspectives.perspectives.len(),
                manifest.limits.max_wave1_agents
            ),
        ));
    }

    let entries = perspectives
        .perspectives
        .iter()
        .map(|p| PlanEntry {
            perspective_id: p.id.clone(),
            agent_type: p.agent_type.clone(),
            prompt_md: build_prompt(&manifest.query, p),
            output_md: format!("wave-1/{}.md", p.id),
        })
        .collect();

    let plan = Wave1Plan {
        schema_version: WAVE1_PLAN_SCHEMA.to_string(),
        generated_at: Utc::now(),
        perspectives_digest: perspectives_digest(&perspectives)?,
        entries,
    };
    plan.validate()?;
    let value = serde_json::to_value(&plan)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize plan: {e}")))?;
    store::atomic_write_json(&paths.wave1_plan(), &value)?;
    Ok(plan)
}

/// Load the persisted wave-1 plan, refusing one built from a
/// perspectives document that has since changed.
pub fn load_wave1_plan(paths: &RunPaths) -> Result<Wave1Plan> {
    let value = store::read_json(&paths.wave1_plan())?;
    let plan: Wave1Plan = serde_json::from_value(value)
        .map_err(|e| CoreError::schema(format!("wave1 plan does not parse: {e}")))?;
    plan.validate()?;

    let current = perspectives_digest(&perspectives_read(paths)?)?;
    if plan.perspectives_digest != current {
        return Err(CoreError::new(
            ErrorCode::Wave1PlanStale,
            "wave1 plan was built from a different perspectives document",
        )
        .with_details(serde_json::json!({
            "plan_digest": plan.perspectives_digest,
            "current_digest": current,
        })));
    }
    Ok(plan)
}

/// Plan entries for wave-2, derived from the pivot gap list.
pub fn plan_wave2_entries(paths: &RunPaths, manifest: &Manifest, gap_ids: &[String]) -> Result<Vec<PlanEntry>> {
    let perspectives = perspectives_read(paths)?;
    gap_ids
        .iter()
        .map(|id| {
            let p = perspectives.find(id)?;
            Ok(PlanEntry {
                perspective_id: p.id.clone(),
                agent_type: p.agent_type.clone(),
                prompt_md: build_prompt(&manifest.query, p),
                output_md: format!("wave-2/{}.md", p.id),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Contract validation
// ---------------------------------------------------------------------------

/// Lines of the `## Sources` section, if present.
fn sources_section(markdown: &str) -> Option<Vec<&str>> {
    let mut in_sources = false;
    let mut lines = Vec::new();
    for line in markdown.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("##") {
            let heading = trimmed.trim_start_matches('#').trim();
            in_sources = heading == "Sources";
            continue;
        }
        if in_sources {
            lines.push(line);
        }
    }
    if markdown.lines().any(|l| {
        let t = l.trim();
        t.starts_with("##") && t.trim_start_matches('#').trim() == "Sources"
    }) {
        Some(lines)
    } else {
        None
    }
}

/// Validate one wave output against its perspective contract.
///
/// Returns the deferred failure codes found (empty when the output is
/// clean). Codes outside the deferred set are hard errors.
pub fn validate_output(
    markdown: &str,
    contract: &PromptContract,
    tool_usage: &BTreeMap<String, u64>,
) -> Result<Vec<String>> {
    let mut deferred = Vec::new();

    for section in &contract.must_include_sections {
        if !crate::gates_eval::has_heading(markdown, section) {
            deferred.push(format!("MISSING_REQUIRED_SECTION:{section}"));
        }
    }

    let words = markdown.split_whitespace().count();
    if words > contract.max_words as usize {
        deferred.push("TOO_MANY_WORDS".to_string());
    }

    match sources_section(markdown) {
        Some(lines) => {
            let mut items = 0usize;
            let mut malformed = false;
            for line in lines {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed.starts_with("- ") || trimmed.starts_with("* ") {
                    items += 1;
                } else {
                    malformed = true;
                }
            }
            if malformed {
                deferred.push("MALFORMED_SOURCES".to_string());
            }
            if items > contract.max_sources as usize {
                deferred.push("TOO_MANY_SOURCES".to_string());
            }
        }
        None => {
            // Absence of the list is covered by the section check when
            // the contract requires it; nothing further to count.
        }
    }

    // Tool budget violations fail the tick immediately.
    let total_calls: u64 = tool_usage.values().sum();
    if total_calls > contract.tool_budget as u64 {
        return Err(CoreError::new(
            ErrorCode::ToolBudgetExceeded,
            format!(
                "{total_calls} tool calls exceed the budget of {}",
                contract.tool_budget
            ),
        )
        .with_details(serde_json::json!({ "tool_usage": tool_usage })));
    }

    Ok(deferred)
}

fn root_failure_code(code: &str) -> &str {
    code.split(':').next().unwrap_or(code)
}

fn directive_instruction(code: &str) -> String {
    match root_failure_code(code) {
        "MISSING_REQUIRED_SECTION" => {
            let section = code.split_once(':').map(|(_, s)| s).unwrap_or("required");
            format!("Add the missing `## {section}` section.")
        }
        "TOO_MANY_WORDS" => "Shorten the output to fit the word cap.".to_string(),
        "MALFORMED_SOURCES" => {
            "Format `## Sources` as a bullet list, one URL per line.".to_string()
        }
        "TOO_MANY_SOURCES" => "Trim the source list to the allowed count.".to_string(),
        other => format!("Resolve validation failure {other}."),
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Outcome for one perspective within a wave tick.
#[derive(Debug, Clone)]
pub struct PerspectiveOutcome {
    pub perspective_id: String,
    pub failure_codes: Vec<String>,
    pub skipped_fresh: bool,
}

struct Backup {
    original: PathBuf,
    backup: Option<PathBuf>,
}

fn take_backup(path: &PathBuf) -> Result<Backup> {
    if path.exists() {
        let backup = path.with_extension("md.bak");
        std::fs::rename(path, &backup).map_err(|e| CoreError::write_failed(path, &e))?;
        Ok(Backup {
            original: path.clone(),
            backup: Some(backup),
        })
    } else {
        Ok(Backup {
            original: path.clone(),
            backup: None,
        })
    }
}

fn restore_backups(backups: &[Backup]) {
    for b in backups {
        match &b.backup {
            Some(backup) => {
                let _ = std::fs::rename(backup, &b.original);
            }
            None => {
                let _ = std::fs::remove_file(&b.original);
            }
        }
    }
}

fn discard_backups(backups: &[Backup]) {
    for b in backups {
        if let Some(backup) = &b.backup {
            let _ = std::fs::remove_file(backup);
        }
    }
}

/// Execute a wave: invoke the driver for every stale entry, ingest and
/// validate outputs, refresh sidecars, and stamp stage progress.
///
/// The whole wave commits or restores together on hard failure.
pub async fn execute_wave(
    paths: &RunPaths,
    driver: &dyn AgentDriver,
    manifest: &Manifest,
    entries: &[PlanEntry],
    wave: u8,
) -> Result<Vec<PerspectiveOutcome>> {
    let perspectives = perspectives_read(paths)?;
    let retry_doc = read_retry_directives(paths)?;

    let mut outcomes = Vec::new();
    let mut backups: Vec<Backup> = Vec::new();

    for entry in entries {
        let perspective = perspectives.find(&entry.perspective_id)?;
        let directive = retry_doc
            .as_ref()
            .and_then(|d| d.for_perspective(&entry.perspective_id));
        let prompt = effective_prompt(&entry.prompt_md, directive);
        let prompt_digest = store::sha256_digest_for_text(&prompt);

        let output_path = paths.wave_output(wave, &entry.perspective_id);
        let sidecar_path = paths.wave_sidecar(wave, &entry.perspective_id);

        // Freshness: matching prompt digest means the driver already
        // ran for exactly this prompt.
        let fresh = match read_sidecar(&sidecar_path)? {
            Some(meta) => meta.prompt_digest == prompt_digest && output_path.exists(),
            None => false,
        };

        let (markdown, tool_usage, skipped) = if fresh {
            let markdown = store::read_text(&output_path)?;
            let meta = read_sidecar(&sidecar_path)?.expect("sidecar read above");
            (markdown, meta.tool_usage, true)
        } else {
            let request = AgentRequest {
                run_id: manifest.run_id.clone(),
                stage: manifest.stage.current,
                run_root: paths.root().display().to_string(),
                perspective_id: entry.perspective_id.clone(),
                agent_type: entry.agent_type.clone(),
                prompt_md: prompt.clone(),
                output_md: entry.output_md.clone(),
            };
            let response = match driver.run_agent(&request).await {
                Ok(r) => r,
                Err(err) => {
                    restore_backups(&backups);
                    return Err(err);
                }
            };
            if response.markdown.trim().is_empty() {
                restore_backups(&backups);
                return Err(CoreError::new(
                    ErrorCode::RunAgentFailed,
                    format!("driver returned empty markdown for {:?}", entry.perspective_id),
                ));
            }

            backups.push(take_backup(&output_path)?);
            store::atomic_write_text(&output_path, &response.markdown)?;

            let meta = WaveOutputMeta {
                schema_version: WAVE_OUTPUT_META_SCHEMA.to_string(),
                prompt_digest: prompt_digest.clone(),
                agent_run_id: response.agent_run_id.clone(),
                ingested_at: Utc::now(),
                source_input_path: format!("driver:{}", entry.agent_type),
                started_at: response.started_at,
                finished_at: response.finished_at,
                model: response.model.clone(),
                tool_usage: response.tool_usage.clone(),
            };
            let value = serde_json::to_value(&meta)
                .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize sidecar: {e}")))?;
            store::atomic_write_json(&sidecar_path, &value)?;

            (response.markdown, response.tool_usage, false)
        };

        let failure_codes = match validate_output(&markdown, &perspective.prompt_contract, &tool_usage) {
            Ok(codes) => codes,
            Err(err) => {
                restore_backups(&backups);
                return Err(err);
            }
        };

        manifest_write(paths, None, "wave_progress", None, |m| {
            m.stage.last_progress_at = Some(Utc::now());
            Ok(())
        })?;

        tracing::info!(
            event = "wave.perspective_done",
            wave = wave,
            perspective = %entry.perspective_id,
            fresh = skipped,
            failures = failure_codes.len(),
        );

        outcomes.push(PerspectiveOutcome {
            perspective_id: entry.perspective_id.clone(),
            failure_codes,
            skipped_fresh: skipped,
        });
    }

    discard_backups(&backups);
    Ok(outcomes)
}

// ---------------------------------------------------------------------------
// Review and Gate B
// ---------------------------------------------------------------------------

fn read_sidecar(path: &PathBuf) -> Result<Option<WaveOutputMeta>> {
    match store::read_json(path) {
        Ok(value) => {
            let meta: WaveOutputMeta = serde_json::from_value(value)
                .map_err(|e| CoreError::schema(format!("wave sidecar does not parse: {e}")))?;
            Ok(Some(meta))
        }
        Err(err) if err.code == ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Read `retry/retry-directives.json` when present.
pub fn read_retry_directives(paths: &RunPaths) -> Result<Option<RetryDirectivesDoc>> {
    match store::read_json(&paths.retry_directives()) {
        Ok(value) => {
            let doc: RetryDirectivesDoc = serde_json::from_value(value)
                .map_err(|e| CoreError::schema(format!("retry directives do not parse: {e}")))?;
            doc.validate()?;
            Ok(Some(doc))
        }
        Err(err) if err.code == ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Build `wave-review.json` from per-perspective outcomes.
pub fn build_wave_review(wave: u8, outcomes: &[PerspectiveOutcome]) -> WaveReview {
    let results: Vec<WaveResultEntry> = outcomes
        .iter()
        .map(|o| WaveResultEntry {
            perspective_id: o.perspective_id.clone(),
            pass: o.failure_codes.is_empty(),
            failure_codes: o.failure_codes.clone(),
        })
        .collect();

    let retry_directives: Vec<RetryDirective> = outcomes
        .iter()
        .flat_map(|o| {
            o.failure_codes.iter().map(|code| RetryDirective {
                perspective_id: o.perspective_id.clone(),
                failure_code: code.clone(),
                instruction: directive_instruction(code),
            })
        })
        .collect();

    let failed = results.iter().filter(|r| !r.pass).count() as u32;
    let validated = results.iter().filter(|r| r.pass).count() as u32;
    let pass = failed == 0 && validated > 0;

    WaveReview {
        schema_version: WAVE_REVIEW_SCHEMA.to_string(),
        generated_at: Utc::now(),
        wave,
        ok: true,
        pass,
        validated,
        failed,
        retry_directives,
        // Gate B demands one row per validated output.
        results: results.into_iter().filter(|r| r.pass).collect(),
    }
}

/// Summary returned by a completed wave tick.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveRunSummary {
    pub wave: u8,
    pub outputs: u32,
    pub gate_b_pass: bool,
}

/// Run one wave end to end: execute, review, persist Gate B, and
/// account for retries.
///
/// Emits `RETRY_REQUIRED` when directives were planned within the cap
/// and `RETRY_CAP_EXHAUSTED` once Gate B's retry budget is spent.
pub async fn run_wave(
    paths: &RunPaths,
    driver: &dyn AgentDriver,
    entries: &[PlanEntry],
    wave: u8,
) -> Result<WaveRunSummary> {
    let manifest = manifest_read(paths)?;
    let outcomes = execute_wave(paths, driver, &manifest, entries, wave).await?;
    let review = build_wave_review(wave, &outcomes);

    let review_value = serde_json::to_value(&review)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize wave review: {e}")))?;
    store::atomic_write_json(&paths.wave_review(), &review_value)?;

    let evaluation = gate_b_derive(&review)?;
    gates_write(
        paths,
        None,
        &evaluation.inputs_digest,
        &[(GateId::B, evaluation.patch.clone())],
    )?;

    if review.retry_directives.is_empty() {
        consume_retry_directives(paths)?;
        return Ok(WaveRunSummary {
            wave,
            outputs: review.validated,
            gate_b_pass: review.pass,
        });
    }

    // Persist the directives for the next tick, then account the retry.
    let doc = RetryDirectivesDoc {
        schema_version: RETRY_DIRECTIVES_SCHEMA.to_string(),
        run_id: manifest.run_id.clone(),
        stage: manifest.stage.current,
        generated_at: Utc::now(),
        consumed_at: None,
        retry_directives: review.retry_directives.clone(),
        deferred_validation_failures: DEFERRED_FAILURE_CODES
            .iter()
            .map(|c| c.to_string())
            .collect(),
    };
    let value = serde_json::to_value(&doc)
        .map_err(|e| CoreError::new(ErrorCode::WriteFailed, format!("serialize directives: {e}")))?;
    store::atomic_write_json(&paths.retry_directives(), &value)?;

    let attempt = retry_record(paths, GateId::B, "wave output contract violations")?;
    Err(CoreError::new(
        ErrorCode::RetryRequired,
        format!("wave {wave} requires a retry (attempt {attempt})"),
    )
    .with_details(serde_json::json!({
        "wave": wave,
        "attempt": attempt,
        "directives": review.retry_directives.len(),
    })))
}

/// Mark outstanding retry directives consumed once a clean wave lands.
fn consume_retry_directives(paths: &RunPaths) -> Result<()> {
    if let Some(mut doc) = read_retry_directives(paths)? {
        if doc.consumed_at.is_none() {
            doc.consumed_at = Some(Utc::now());
            let value = serde_json::to_value(&doc).map_err(|e| {
                CoreError::new(ErrorCode::WriteFailed, format!("serialize directives: {e}"))
            })?;
            store::atomic_write_json(&paths.retry_directives(), &value)?;
        }
    }
    Ok(())
}
