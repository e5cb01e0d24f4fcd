//! Inquest - research-run orchestrator CLI
//!
//! The `inquest` command drives runs through the staged pipeline.
//!
//! ## Commands
//!
//! - `init`: Create a run root and seed the runs ledger
//! - `tick`: Advance a run by one bounded step
//! - `agent-result`: Stage a subagent result for the task driver
//! - `triage`: Summarize a run's stage, gates, and retry counts
//! - `pause` / `resume` / `cancel`: Operate on the manifest lifecycle

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

use inquest_core::citations::CitationsMode;
use inquest_core::driver::{AgentDriver, FixtureDriver, TaskDriver};
use inquest_core::error::{CoreError, ErrorCode};
use inquest_core::gates_eval::ExtractorEndpoints;
use inquest_core::init::{run_init, InitOptions};
use inquest_core::schema::manifest::{Mode, RunStatus, Sensitivity, StageId};
use inquest_core::schema::wave::{AgentResultDoc, AGENT_RESULT_SCHEMA};
use inquest_core::summary::SummarySource;
use inquest_core::synthesis::SynthesisSource;
use inquest_core::tick::{tick_live, tick_post_summaries, TickLiveConfig, TickPostConfig};
use inquest_core::{init_tracing, manifest_read, manifest_write, RunPaths};

#[derive(Parser)]
#[command(name = "inquest")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deterministic research-run orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Quick,
    Standard,
    Deep,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Quick => Mode::Quick,
            ModeArg::Standard => Mode::Standard,
            ModeArg::Deep => Mode::Deep,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SensitivityArg {
    Normal,
    Restricted,
    NoWeb,
}

impl From<SensitivityArg> for Sensitivity {
    fn from(value: SensitivityArg) -> Self {
        match value {
            SensitivityArg::Normal => Sensitivity::Normal,
            SensitivityArg::Restricted => Sensitivity::Restricted,
            SensitivityArg::NoWeb => Sensitivity::NoWeb,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DriverArg {
    Fixture,
    Task,
    Live,
}

#[derive(Clone, Copy, ValueEnum)]
enum CitationsArg {
    Offline,
    DryRun,
    Live,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new research run
    Init {
        /// The research question
        #[arg(long)]
        query: String,

        /// Research depth
        #[arg(long, value_enum, default_value = "standard")]
        mode: ModeArg,

        /// Web sensitivity of the run
        #[arg(long, value_enum, default_value = "normal")]
        sensitivity: SensitivityArg,

        /// Run id (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// Root directory holding runs (default: .inquest/runs)
        #[arg(long)]
        root_override: Option<PathBuf>,

        /// Constraint lines attached to the query
        #[arg(long = "constraint")]
        constraints: Vec<String>,

        /// Session id recorded in the runs ledger
        #[arg(long)]
        session_id: Option<String>,
    },

    /// Advance a run by one bounded step
    Tick {
        /// Path to the run's manifest.json
        #[arg(long)]
        manifest: PathBuf,

        /// Why this tick is running (recorded in history)
        #[arg(long, default_value = "operator tick")]
        reason: String,

        /// Agent driver backing wave execution
        #[arg(long, value_enum, default_value = "task")]
        driver: DriverArg,

        /// Fixture file for the fixture driver
        #[arg(long)]
        fixture_agents_path: Option<PathBuf>,

        /// Citation validation mode
        #[arg(long, value_enum, default_value = "dry-run")]
        citations: CitationsArg,

        /// Offline citation fixtures (required with --citations offline)
        #[arg(long)]
        fixture_citations_path: Option<PathBuf>,

        /// Summary fixtures for the post-summaries stages
        #[arg(long)]
        fixture_summaries_path: Option<PathBuf>,

        /// Synthesis draft fixture
        #[arg(long)]
        fixture_synthesis_path: Option<PathBuf>,
    },

    /// Stage a subagent result for the task driver
    AgentResult {
        /// Path to the run's manifest.json
        #[arg(long)]
        manifest: PathBuf,

        /// Perspective the result belongs to
        #[arg(long)]
        perspective_id: String,

        /// File holding the result markdown
        #[arg(long)]
        markdown_file: PathBuf,

        /// Agent run id reported by the host
        #[arg(long)]
        agent_run_id: Option<String>,

        /// Model that produced the result
        #[arg(long)]
        model: Option<String>,
    },

    /// Summarize a run's stage, gates, and retry counts
    Triage {
        /// Path to the run's manifest.json
        #[arg(long)]
        manifest: PathBuf,
    },

    /// Pause a run (the next tick refuses)
    Pause {
        #[arg(long)]
        manifest: PathBuf,
    },

    /// Resume a paused run
    Resume {
        #[arg(long)]
        manifest: PathBuf,
    },

    /// Cancel a run permanently
    Cancel {
        #[arg(long)]
        manifest: PathBuf,
    },
}

/// Map a typed core error to the documented exit codes.
fn exit_code_for(err: &CoreError) -> u8 {
    match err.code {
        // Operator errors
        ErrorCode::InvalidArgs
        | ErrorCode::NotFound
        | ErrorCode::AlreadyExistsConflict
        | ErrorCode::Disabled
        | ErrorCode::RevisionMismatch => 2,

        // I/O failures
        ErrorCode::ReadFailed
        | ErrorCode::WriteFailed
        | ErrorCode::LockReadFailed
        | ErrorCode::LockWriteFailed
        | ErrorCode::LockReleaseFailed => 4,

        // Internal faults
        ErrorCode::InvalidJson | ErrorCode::SchemaValidationFailed | ErrorCode::InvalidState => 5,

        // Everything else is a lifecycle violation
        _ => 3,
    }
}

fn run_root_for(manifest: &PathBuf) -> Result<RunPaths, CoreError> {
    let root = manifest.parent().ok_or_else(|| {
        CoreError::new(ErrorCode::InvalidArgs, "manifest path has no parent directory")
    })?;
    Ok(RunPaths::new(root))
}

fn print_value(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

fn set_status(
    manifest_path: &PathBuf,
    target: RunStatus,
    allowed_from: &[RunStatus],
    action: &str,
) -> Result<(), CoreError> {
    let paths = run_root_for(manifest_path)?;
    let current = manifest_read(&paths)?;
    if !allowed_from.contains(&current.status) {
        return Err(CoreError::new(
            ErrorCode::InvalidState,
            format!("cannot {action} a run with status {:?}", current.status),
        ));
    }
    let written = manifest_write(&paths, Some(current.revision), action, None, |m| {
        m.status = target;
        Ok(())
    })?;
    print_value(&serde_json::json!({
        "run_id": written.run_id,
        "status": written.status,
        "revision": written.revision,
    }));
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CoreError> {
    match cli.command {
        Commands::Init {
            query,
            mode,
            sensitivity,
            run_id,
            root_override,
            constraints,
            session_id,
        } => {
            let runs_root = root_override.unwrap_or_else(|| PathBuf::from(".inquest/runs"));
            let enabled = std::env::var("INQUEST_DISABLE").ok().as_deref() != Some("1");
            let result = run_init(&InitOptions {
                runs_root,
                run_id,
                query,
                constraints,
                mode: mode.into(),
                sensitivity: sensitivity.into(),
                session_id,
                enabled,
            })?;
            print_value(&serde_json::to_value(&result).unwrap_or_default());
            Ok(())
        }

        Commands::Tick {
            manifest,
            reason,
            driver,
            fixture_agents_path,
            citations,
            fixture_citations_path,
            fixture_summaries_path,
            fixture_synthesis_path,
        } => {
            let paths = run_root_for(&manifest)?;
            let current = manifest_read(&paths)?;
            let _span = inquest_core::RunSpan::enter(&current.run_id);

            let outcome = match current.stage.current {
                StageId::Init
                | StageId::Perspectives
                | StageId::Wave1
                | StageId::Pivot
                | StageId::Wave2
                | StageId::Citations => {
                    let agent_driver: Box<dyn AgentDriver> = match driver {
                        DriverArg::Fixture => {
                            let path = fixture_agents_path.ok_or_else(|| {
                                CoreError::new(
                                    ErrorCode::InvalidArgs,
                                    "--fixture-agents-path is required with --driver fixture",
                                )
                            })?;
                            Box::new(FixtureDriver::from_file(&path)?)
                        }
                        DriverArg::Task => Box::new(TaskDriver::new(paths.clone())),
                        DriverArg::Live => {
                            return Err(CoreError::new(
                                ErrorCode::InvalidArgs,
                                "the live driver is provided by the embedding host, not the CLI",
                            ))
                        }
                    };

                    let citations_mode = match citations {
                        CitationsArg::Offline => {
                            let path = fixture_citations_path.ok_or_else(|| {
                                CoreError::new(
                                    ErrorCode::InvalidArgs,
                                    "--fixture-citations-path is required with --citations offline",
                                )
                            })?;
                            CitationsMode::Offline { fixture_path: path }
                        }
                        CitationsArg::DryRun => CitationsMode::OnlineDryRun,
                        CitationsArg::Live => CitationsMode::OnlineLive {
                            endpoints: ExtractorEndpoints::from_env(),
                        },
                    };

                    tick_live(
                        &paths,
                        agent_driver.as_ref(),
                        &TickLiveConfig {
                            reason,
                            citations_mode,
                        },
                    )
                    .await?
                }
                _ => {
                    let summary_source = match fixture_summaries_path {
                        Some(path) => SummarySource::Fixture { path },
                        None => SummarySource::Generated,
                    };
                    let synthesis_source = match fixture_synthesis_path {
                        Some(path) => SynthesisSource::Fixture { path },
                        None => SynthesisSource::Generated,
                    };
                    tick_post_summaries(
                        &paths,
                        &TickPostConfig {
                            reason,
                            summary_source,
                            synthesis_source,
                        },
                    )
                    .await?
                }
            };

            print_value(&serde_json::to_value(&outcome).unwrap_or_default());
            Ok(())
        }

        Commands::AgentResult {
            manifest,
            perspective_id,
            markdown_file,
            agent_run_id,
            model,
        } => {
            let paths = run_root_for(&manifest)?;
            manifest_read(&paths)?;

            if perspective_id.contains('/') || perspective_id.contains('\\') || perspective_id.contains("..") {
                return Err(CoreError::new(
                    ErrorCode::InvalidArgs,
                    format!("perspective id {perspective_id:?} is not a safe file stem"),
                ));
            }

            let markdown = inquest_core::store::read_text(&markdown_file)?;
            let doc = AgentResultDoc {
                schema_version: AGENT_RESULT_SCHEMA.to_string(),
                perspective_id: perspective_id.clone(),
                markdown,
                agent_run_id,
                started_at: None,
                finished_at: None,
                model,
            };
            let target = paths.agent_result(&perspective_id);
            inquest_core::store::atomic_write_json(
                &target,
                &serde_json::to_value(&doc).map_err(|e| {
                    CoreError::new(ErrorCode::WriteFailed, format!("serialize result: {e}"))
                })?,
            )?;
            print_value(&serde_json::json!({
                "perspective_id": perspective_id,
                "staged_at": target.display().to_string(),
            }));
            Ok(())
        }

        Commands::Triage { manifest } => {
            let paths = run_root_for(&manifest)?;
            let m = manifest_read(&paths)?;
            let gates = inquest_core::gates_read(&paths)?;

            let gate_summary: serde_json::Map<String, serde_json::Value> = gates
                .gates
                .iter()
                .map(|(id, gate)| {
                    (
                        id.clone(),
                        serde_json::json!({
                            "status": gate.status,
                            "warnings": gate.warnings,
                        }),
                    )
                })
                .collect();

            print_value(&serde_json::json!({
                "run_id": m.run_id,
                "status": m.status,
                "stage": m.stage.current,
                "revision": m.revision,
                "retry_counts": m.metrics.retry_counts,
                "failures": m.failures,
                "gates": gate_summary,
                "review_cycles": m.review_cycle_count(),
            }));
            Ok(())
        }

        Commands::Pause { manifest } => set_status(
            &manifest,
            RunStatus::Paused,
            &[RunStatus::Created, RunStatus::Running],
            "pause",
        ),

        Commands::Resume { manifest } => set_status(
            &manifest,
            RunStatus::Running,
            &[RunStatus::Paused],
            "resume",
        ),

        Commands::Cancel { manifest } => set_status(
            &manifest,
            RunStatus::Cancelled,
            &[
                RunStatus::Created,
                RunStatus::Running,
                RunStatus::Paused,
                RunStatus::Failed,
            ],
            "cancel",
        ),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            if !err.details.is_null() {
                eprintln!("{}", serde_json::to_string_pretty(&err.details).unwrap_or_default());
            }
            ExitCode::from(exit_code_for(&err))
        }
    }
}
