use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qralph::config::QralphConfig;
use qralph::errors::{PipelineError, RegistryError};
use qralph::paths::QralphPaths;
use qralph::pipeline::Pipeline;
use qralph::registry::{ProcessKind, RegistryStore};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "qralph")]
#[command(version, about = "Deterministic multi-agent orchestration pipeline")]
pub struct Cli {
    /// Working directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub working_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a project, suggest a template, emit plan-agent configs
    Plan {
        /// The user's request
        request: String,
        /// Directory for implementation files (relative to the working
        /// directory, or absolute)
        #[arg(long)]
        target_dir: Option<PathBuf>,
        /// Show the template suggestion without creating a project
        #[arg(long)]
        dry_run: bool,
    },
    /// Read agent-outputs/, write manifest skeleton and PLAN.md
    PlanCollect,
    /// Require non-empty manifest tasks, compute groups, transition to EXECUTE
    PlanFinalize,
    /// Emit execution-agent configs for all groups
    Execute,
    /// Check execution completeness, transition to VERIFY
    ExecuteCollect,
    /// Emit the verifier config
    Verify,
    /// Write SUMMARY.md, require non-FAIL verdict, transition to COMPLETE
    Finalize,
    /// Report current phase and suggested next action
    Resume,
    /// Report project state
    Status,
    /// Execute the single next transition (the canonical driver)
    Next {
        /// Confirm the pending gate (template/plan approval)
        #[arg(long)]
        confirm: bool,
    },
    /// Process-registry operations
    Process {
        #[command(subcommand)]
        command: ProcessCommands,
    },
}

#[derive(Subcommand)]
pub enum ProcessCommands {
    /// Register a spawned process
    Register {
        #[arg(long)]
        pid: u32,
        #[arg(long = "type")]
        kind: String,
        #[arg(long)]
        purpose: String,
    },
    /// Sweep registered processes for orphans
    Sweep {
        /// Report only, don't kill
        #[arg(long)]
        dry_run: bool,
        /// Treat past-grace processes as orphans even while the parent lives
        #[arg(long)]
        force: bool,
    },
    /// Kill all still-live processes for a project
    Cleanup {
        #[arg(long)]
        project_id: String,
    },
    /// Show registered-process status
    Status,
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Failed to serialize output: {e}"),
    }
}

fn ok<T: Serialize>(value: T) -> ExitCode {
    print_json(&value);
    ExitCode::SUCCESS
}

fn pipeline_result<T: Serialize>(result: Result<T, PipelineError>) -> ExitCode {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            print_json(&json!({"error": e.to_string()}));
            ExitCode::FAILURE
        }
    }
}

fn registry_result<T: Serialize>(result: Result<T, RegistryError>) -> ExitCode {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            print_json(&json!({"error": e.to_string()}));
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if cfg!(windows) {
        tracing::warn!(
            "Running on Windows: process-identity verification is unavailable, \
             so the registry will refuse every orphan kill."
        );
    }

    match run().await {
        Ok(code) => code,
        Err(e) => {
            // Bootstrap failure: missing/malformed config or arguments.
            print_json(&json!({"error": e.to_string()}));
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let working_dir = match cli.working_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let paths = QralphPaths::from_working_dir(&working_dir);
    let config = QralphConfig::load(&paths.config_file())?;
    let pipeline = Pipeline::new(paths.clone(), config);

    let code = match cli.command {
        Commands::Plan {
            request,
            target_dir,
            dry_run,
        } => {
            if dry_run {
                pipeline_result(pipeline.plan_dry_run(&request))
            } else {
                match pipeline.plan(&request, target_dir.as_deref()) {
                    Ok(report) => {
                        // Bind the registry so orphan sweeps can pause this project.
                        let registry = RegistryStore::new(&paths);
                        if let Err(e) = registry.set_project(&report.project_id) {
                            tracing::warn!(error = %e, "failed to bind process registry");
                        }
                        ok(report)
                    }
                    Err(e) => {
                        print_json(&json!({"error": e.to_string()}));
                        ExitCode::FAILURE
                    }
                }
            }
        }
        Commands::PlanCollect => pipeline_result(pipeline.plan_collect()),
        Commands::PlanFinalize => pipeline_result(pipeline.plan_finalize()),
        Commands::Execute => pipeline_result(pipeline.execute()),
        Commands::ExecuteCollect => pipeline_result(pipeline.execute_collect()),
        Commands::Verify => pipeline_result(pipeline.verify()),
        Commands::Finalize => pipeline_result(pipeline.finalize()),
        Commands::Resume => pipeline_result(pipeline.resume()),
        Commands::Status => ok(pipeline.status()),
        Commands::Next { confirm } => match pipeline.next(confirm).await {
            Ok(action) => {
                let failed = action.is_error();
                print_json(&action);
                if failed {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(e) => {
                print_json(&json!({"error": e.to_string()}));
                ExitCode::FAILURE
            }
        },
        Commands::Process { command } => {
            let registry = RegistryStore::new(&paths);
            match command {
                ProcessCommands::Register { pid, kind, purpose } => {
                    registry_result(registry.register(pid, ProcessKind::from(kind), &purpose))
                }
                ProcessCommands::Sweep { dry_run, force } => {
                    registry_result(registry.sweep(dry_run, force))
                }
                ProcessCommands::Cleanup { project_id } => {
                    registry_result(registry.cleanup(&project_id))
                }
                ProcessCommands::Status => ok(registry.status()),
            }
        }
    };

    Ok(code)
}
