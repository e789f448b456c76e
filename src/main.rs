use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use orchestrate::config::{self, OrchestrateConfig};
use orchestrate::definition;
use orchestrate::engine::{AdvanceOutcome, CompleteOptions, WorkflowEngine};
use orchestrate::error::OrchError;
use orchestrate::gate::{install_signal_handlers, kill_all_children};
use orchestrate::lock;
use orchestrate::log::LogLevel;
use orchestrate::paths::{PathMode, Paths};
use orchestrate::review::HttpReviewExecutor;
use orchestrate::session::SessionManager;
use orchestrate::{log_error, log_info};

#[derive(Parser)]
#[command(name = "orchestrate", about = "Workflow enforcement engine for AI coding agents")]
struct Cli {
    /// Repo root or any directory inside it (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {repo_root}/orchestrate.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Keep session artifacts visible to git instead of ignoring them
    #[arg(long)]
    portable: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold the containment directory, a starter workflow.yaml, and orchestrate.toml
    Init,
    /// Start a new workflow in a fresh session
    Start {
        /// Task description
        task: String,
        /// Constraints the agent must honor (repeatable)
        #[arg(long, action = clap::ArgAction::Append)]
        constraints: Vec<String>,
    },
    /// Show cursor, current item, and gate hints
    Status,
    /// Complete an item (runs its verification gate)
    Complete {
        item_id: String,
        #[arg(long)]
        notes: Option<String>,
        /// Who completed the item (defaults to the detected operator mode)
        #[arg(long)]
        by: Option<String>,
    },
    /// Skip an item with a justification
    Skip {
        item_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Approve an item guarded by a manual gate
    Approve {
        item_id: String,
        #[arg(long)]
        rationale: String,
    },
    /// Advance to the next phase; reports blockers if refused
    Advance,
    /// Finish the workflow
    Finish {
        /// Abandon instead of requiring all phases complete
        #[arg(long)]
        abandon: bool,
    },
    /// Snapshot the current workflow state
    Checkpoint {
        #[arg(long, default_value = "checkpoint")]
        label: String,
        /// Decision notes to record (repeatable)
        #[arg(long, action = clap::ArgAction::Append)]
        decisions: Vec<String>,
    },
    /// Restore state from a checkpoint
    Resume {
        #[arg(long = "from")]
        checkpoint_id: String,
    },
    /// List sessions, or switch the current one
    Sessions {
        #[arg(long)]
        switch: Option<String>,
    },
    /// Audit chain maintenance
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Walk the audit chain and report the first broken entry
    Verify,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.log_level.parse::<LogLevel>() {
        Ok(level) => orchestrate::log::set_verbosity(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let mode = if cli.portable {
        PathMode::Portable
    } else {
        PathMode::Normal
    };

    let result = run(&cli, mode).await;

    kill_all_children();

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Single-line headline plus an optional remediation hint.
fn render(e: OrchError) -> String {
    match e.hint() {
        Some(hint) => format!("{}\n{}", e, hint),
        None => e.to_string(),
    }
}

async fn run(cli: &Cli, mode: PathMode) -> Result<(), String> {
    if let Commands::Init = cli.command {
        return handle_init(&cli.root).map_err(render);
    }

    let paths = Paths::new(&cli.root, None, mode).map_err(render)?;
    let config = config::load_config_from(cli.config.as_deref(), paths.repo_root())?;
    let lock_timeout = Duration::from_secs(config.execution.lock_timeout_secs);
    let manager = SessionManager::new(paths.clone(), lock_timeout);

    dispatch(cli, &paths, &config, &manager).await.map_err(render)
}

async fn dispatch(
    cli: &Cli,
    paths: &Paths,
    config: &OrchestrateConfig,
    manager: &SessionManager,
) -> Result<(), OrchError> {
    match &cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Sessions { switch } => handle_sessions(manager, switch.as_deref()),
        Commands::Start { task, constraints } => {
            if let Err(e) = install_signal_handlers() {
                log_error!("{}", e);
            }
            let _guard = instance_lock(paths)?;
            let session_id = manager.create_session()?;
            let engine = build_engine(paths, &session_id, config)?;
            let state = engine.start(task, constraints.clone())?;
            println!(
                "Started workflow {} (session {}) in phase '{}'",
                state.workflow_id, session_id, state.phases[0].id
            );
            Ok(())
        }
        Commands::Status => {
            let session_id = current_or_probe(manager)?;
            let engine = build_engine(paths, &session_id, config)?;
            let report = engine.status()?;
            println!("Workflow:   {} ({})", report.workflow_id, report.telemetry_id);
            println!("Task:       {}", report.task);
            println!("Status:     {:?}", report.status);
            match report.phase_id {
                Some(ref phase) => println!(
                    "Phase:      {} ({}/{})",
                    phase,
                    report.phase_index + 1,
                    report.total_phases
                ),
                None => println!("Phase:      terminal"),
            }
            if let Some(ref item) = report.next_item {
                println!("Next item:  {}", item);
            }
            if let Some(ref hint) = report.gate_hint {
                println!("Gate:       {}", hint);
            }
            if !report.blockers.is_empty() {
                println!("Blockers:   {}", report.blockers.join(", "));
            }
            if report.read_from_legacy {
                println!("(read from legacy state file)");
            }
            Ok(())
        }
        Commands::Complete { item_id, notes, by } => {
            if let Err(e) = install_signal_handlers() {
                log_error!("{}", e);
            }
            let _guard = instance_lock(paths)?;
            let session_id = current_or_probe(manager)?;
            let engine = build_engine(paths, &session_id, config)?;
            let outcome = engine
                .complete(
                    item_id,
                    CompleteOptions {
                        notes: notes.clone(),
                        completed_by: by.clone(),
                        approval_rationale: None,
                    },
                )
                .await?;
            println!("Completed '{}'", item_id);
            for detail in &outcome.gate.details {
                println!("  {}", detail);
            }
            Ok(())
        }
        Commands::Approve { item_id, rationale } => {
            let _guard = instance_lock(paths)?;
            let session_id = current_or_probe(manager)?;
            let engine = build_engine(paths, &session_id, config)?;
            let outcome = engine
                .complete(
                    item_id,
                    CompleteOptions {
                        approval_rationale: Some(rationale.clone()),
                        ..CompleteOptions::default()
                    },
                )
                .await?;
            println!("Approved '{}'", item_id);
            for detail in &outcome.gate.details {
                println!("  {}", detail);
            }
            Ok(())
        }
        Commands::Skip { item_id, reason } => {
            let _guard = instance_lock(paths)?;
            let session_id = current_or_probe(manager)?;
            let engine = build_engine(paths, &session_id, config)?;
            engine.skip(item_id, reason)?;
            println!("Skipped '{}': {}", item_id, reason);
            Ok(())
        }
        Commands::Advance => {
            let _guard = instance_lock(paths)?;
            let session_id = current_or_probe(manager)?;
            let engine = build_engine(paths, &session_id, config)?;
            match engine.advance()? {
                AdvanceOutcome::NextPhase(phase) => println!("Advanced to phase '{}'", phase),
                AdvanceOutcome::Terminal => println!("Workflow complete"),
            }
            Ok(())
        }
        Commands::Finish { abandon } => {
            let _guard = instance_lock(paths)?;
            let session_id = current_or_probe(manager)?;
            let engine = build_engine(paths, &session_id, config)?;
            let state = engine.finish(*abandon)?;
            println!("Workflow {} is {:?}", state.workflow_id, state.status);
            Ok(())
        }
        Commands::Checkpoint { label, decisions } => {
            let _guard = instance_lock(paths)?;
            let session_id = current_or_probe(manager)?;
            let engine = build_engine(paths, &session_id, config)?;
            let id = engine.checkpoint(label, decisions.clone())?;
            println!("Checkpoint {} created", id);
            Ok(())
        }
        Commands::Resume { checkpoint_id } => {
            let _guard = instance_lock(paths)?;
            let session_id = current_or_probe(manager)?;
            let engine = build_engine(paths, &session_id, config)?;
            let state = engine.resume(checkpoint_id)?;
            println!(
                "Resumed workflow {} at phase cursor {}",
                state.workflow_id, state.phase_cursor
            );
            Ok(())
        }
        Commands::Audit { command } => match command {
            AuditCommands::Verify => {
                let session_id = current_or_probe(manager)?;
                let engine = build_engine(paths, &session_id, config)?;
                let count = engine.verify_audit()?;
                println!("Audit chain intact: {} entries verified", count);
                Ok(())
            }
        },
    }
}

fn build_engine(
    paths: &Paths,
    session_id: &str,
    config: &OrchestrateConfig,
) -> Result<WorkflowEngine<HttpReviewExecutor>, OrchError> {
    let session_paths = paths.with_session(session_id);
    let def_path = session_paths.workflow_def_file();
    if !def_path.exists() {
        return Err(OrchError::InvalidDefinition(vec![format!(
            "{} not found; run `orchestrate init` first",
            def_path.display()
        )]));
    }
    let def = definition::load(&def_path)?;
    let executor = HttpReviewExecutor::new(
        config.providers.clone(),
        Duration::from_secs(config.retry.call_timeout_secs),
    )
    .map_err(|e| OrchError::InvalidDefinition(vec![e]))?;
    WorkflowEngine::for_session(def, session_paths, config, executor)
}

/// The current session id, or a stable probe binding for legacy-only
/// repos so read paths still resolve (dual-read picks up the legacy files).
fn current_or_probe(manager: &SessionManager) -> Result<String, OrchError> {
    match manager.get_current()? {
        Some(id) => Ok(id),
        None => Ok("legacy".to_string()),
    }
}

fn instance_lock(paths: &Paths) -> Result<lock::LockGuard, OrchError> {
    lock::try_acquire(&paths.orchestrator_dir())
        .map_err(OrchError::SessionConflict)
}

fn handle_sessions(manager: &SessionManager, switch: Option<&str>) -> Result<(), OrchError> {
    if let Some(id) = switch {
        let current = manager.get_current()?;
        manager.switch_session(id, current.as_deref())?;
        println!("Switched to session {}", id);
        return Ok(());
    }

    let sessions = manager.list_sessions()?;
    if sessions.is_empty() {
        println!("No sessions yet. Run `orchestrate start <task>` to create one.");
        return Ok(());
    }
    for session in sessions {
        let marker = if session.is_current { "*" } else { " " };
        println!(
            "{} {}  {}",
            marker,
            session.id,
            session.created_at.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn handle_init(root: &Path) -> Result<(), OrchError> {
    std::fs::create_dir_all(root).map_err(|e| OrchError::io(root.to_path_buf(), e))?;

    let workflow_path = root.join("workflow.yaml");
    if !workflow_path.exists() {
        std::fs::write(&workflow_path, STARTER_WORKFLOW)
            .map_err(|e| OrchError::io(workflow_path.clone(), e))?;
        log_info!("Created {}", workflow_path.display());
    }

    let config_path = root.join("orchestrate.toml");
    if !config_path.exists() {
        std::fs::write(&config_path, STARTER_CONFIG)
            .map_err(|e| OrchError::io(config_path.clone(), e))?;
        log_info!("Created {}", config_path.display());
    }

    let orch_dir = root.join(".orchestrator");
    std::fs::create_dir_all(orch_dir.join("sessions"))
        .map_err(|e| OrchError::io(orch_dir.clone(), e))?;

    println!("Initialized orchestrate in {}", root.display());
    Ok(())
}

const STARTER_WORKFLOW: &str = r#"name: changes
version: "1"

settings:
  supervision_mode: supervised
  test_command: "cargo test"
  build_command: "cargo build"
  salt_env_var: ORCHESTRATOR_TELEMETRY_SALT
  review:
    required_reviews: []
    minimum_required: 0
    on_insufficient: warn
    max_fallback_attempts: 2
    fallback_chains: {}

phases:
  - id: plan
    name: Plan
    phase_type: strict
    items:
      - id: plan_file
        name: Write the plan
        required: true
        verification:
          kind: artifact
          path: docs/plan.md
  - id: execute
    name: Execute
    phase_type: guided
    items:
      - id: build
        name: Build passes
        required: true
        verification:
          kind: command
          argv: ["{{build_command}}"]
      - id: tests
        name: Tests pass
        required: true
        verification:
          kind: command
          argv: ["{{test_command}}"]
  - id: review
    name: Review
    phase_type: strict
    items:
      - id: human_signoff
        name: Human sign-off
        required: true
        risk: high
        verification:
          kind: manual
          rationale_required: true
"#;

const STARTER_CONFIG: &str = r#"[supervision]
# mode = "supervised"      # override workflow.yaml: supervised, zero_human, hybrid

[execution]
lock_timeout_secs = 10

[retry]
base_delay_ms = 1000
factor = 2
max_attempts = 3
jitter = 0.2
call_timeout_secs = 120

# [providers.primary-reviewer]
# endpoint = "https://reviews.example.com/v1/review"
# api_key_env = "REVIEW_API_KEY"
# model = "reviewer-large"
"#;
