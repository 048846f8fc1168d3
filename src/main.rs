use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, error};

use conductor::cleanup::CleanupReport;
use conductor::config::{Config, FailurePolicy};
use conductor::core::{GraphAnalysis, Submission, TaskSpec, TaskState};
use conductor::orchestration::{RunEvent, RunOutcome, RunReport, Scheduler};
use conductor::session::{error_lines, Disposal, SessionId, SessionManager, SessionSummary};
use conductor::Result;

/// Exit code for a run that finished without every task completing.
const EXIT_RUN_INCOMPLETE: u8 = 4;

/// Conductor - dependency-aware parallel task orchestrator
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_LOG   Log filter directive (e.g. conductor=trace)")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.conductor/conductor.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute every task in a submission
    Run {
        /// Submission file (JSON, or TOML by extension)
        submission: PathBuf,

        /// Maximum concurrent sessions (overrides config)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Cancel everything on the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print levels, critical path and speedup for a submission
    Analyze {
        submission: PathBuf,
    },

    /// Start a detached session for one command
    Create {
        task_id: String,

        /// Estimated cost, used for the hang threshold
        #[arg(long, default_value_t = 1.0)]
        cost: f64,

        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// List sessions
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show a session's status and error hints
    Status {
        session_id: String,
    },

    /// Print the tail of a session's log
    Capture {
        session_id: String,

        /// Number of lines
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },

    /// Stop a session and remove (or archive) its files
    Destroy {
        session_id: String,
    },

    /// Reconcile orphans, then destroy every session
    CleanupAll,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    conductor::log::init(cli.debug);

    match execute(cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn execute(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(cli.config.as_deref())?;
    debug!(?config, "configuration loaded");
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Command::Run {
            submission,
            concurrency,
            fail_fast,
            json,
        } => rt.block_on(run(&config, &submission, concurrency, fail_fast, json)),
        Command::Analyze { submission } => {
            let graph = Submission::from_path(&submission)?.into_graph()?;
            let analysis = GraphAnalysis::of(&graph)?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Create {
            task_id,
            cost,
            command,
        } => rt.block_on(create(&config, task_id, cost, command)),
        Command::List { json } => {
            let sessions = SessionManager::new(config.session_config()?).list_sessions()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions(&sessions);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { session_id } => {
            let sessions = SessionManager::new(config.session_config()?);
            let id = SessionId::parse(&session_id)?;
            let summary = sessions.summary(&id)?;
            let tail = sessions.capture(&id, 50).unwrap_or_default();
            print_status(&summary, &error_lines(&tail));
            Ok(ExitCode::SUCCESS)
        }
        Command::Capture { session_id, lines } => {
            let sessions = SessionManager::new(config.session_config()?);
            let output = sessions.capture(&SessionId::parse(&session_id)?, lines)?;
            println!("{output}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Destroy { session_id } => rt.block_on(destroy(&config, &session_id)),
        Command::CleanupAll => rt.block_on(cleanup_all(&config)),
    }
}

async fn run(
    config: &Config,
    submission: &Path,
    concurrency: Option<usize>,
    fail_fast: bool,
    json: bool,
) -> Result<ExitCode> {
    let graph = Submission::from_path(submission)?.into_graph()?;

    let mut scheduler_config = config.scheduler_config()?;
    if let Some(limit) = concurrency {
        scheduler_config = scheduler_config.with_concurrency(limit);
    }
    if fail_fast {
        scheduler_config.failure_policy = FailurePolicy::FailFast;
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(graph, scheduler_config, event_tx)?;

    let token = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, cancelling run...");
            token.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if !json {
                print_event(&event);
            }
        }
    });

    let report = scheduler.run().await?;
    let _ = printer.await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(match report.outcome {
        RunOutcome::Success => ExitCode::SUCCESS,
        RunOutcome::Partial | RunOutcome::Failure => ExitCode::from(EXIT_RUN_INCOMPLETE),
    })
}

async fn create(config: &Config, task_id: String, cost: f64, command: Vec<String>) -> Result<ExitCode> {
    let task = TaskSpec::new(task_id, command.join(" ")).with_cost(cost);
    task.validate()?;
    let mut sessions = SessionManager::new(config.session_config()?);
    sessions.preflight()?;
    let session = sessions.create(&task).await?;
    println!("{}", session.id);
    Ok(ExitCode::SUCCESS)
}

async fn destroy(config: &Config, session_id: &str) -> Result<ExitCode> {
    let mut sessions = SessionManager::new(config.session_config()?);
    let disposal = sessions.destroy(&SessionId::parse(session_id)?).await?;
    match disposal {
        Disposal::Archived(path) => println!("Archived {session_id} to {}", path.display()),
        Disposal::Removed(_) => println!("Destroyed {session_id}"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn cleanup_all(config: &Config) -> Result<ExitCode> {
    let mut sessions = SessionManager::new(config.session_config()?);
    let report = sessions.cleanup_all().await?;
    print_cleanup(&report);
    Ok(ExitCode::SUCCESS)
}

fn state_icon(state: TaskState) -> &'static str {
    match state {
        TaskState::Complete => "✓",
        TaskState::Failed => "✗",
        TaskState::TimedOut => "⏱",
        TaskState::Cancelled => "⊘",
        _ => "…",
    }
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::TaskTerminal { task_id, state } => {
            println!("  {} {:<24} {}", state_icon(*state), task_id, state)
        }
        RunEvent::LevelComplete { level } => println!("── level {level} complete"),
        RunEvent::GraphComplete { outcome } => println!("── graph complete: {outcome}"),
    }
}

fn print_report(report: &RunReport) {
    let elapsed = report.finished_at - report.started_at;
    println!();
    println!("Run {}", report.run_id);
    println!("  Outcome:       {}", report.outcome);
    println!(
        "  Tasks:         {} complete, {} failed, {} timed out, {} cancelled",
        report.count(TaskState::Complete),
        report.count(TaskState::Failed),
        report.count(TaskState::TimedOut),
        report.count(TaskState::Cancelled)
    );
    println!("  Levels:        {}", report.levels.len());
    let path: Vec<&str> = report.critical_path.tasks.iter().map(|id| id.as_str()).collect();
    println!(
        "  Critical path: {} (cost {:.1})",
        path.join(" -> "),
        report.critical_path.total_cost
    );
    println!("  Peak sessions: {}", report.peak_concurrency);
    println!("  Elapsed:       {:.1}s", elapsed.num_milliseconds() as f64 / 1000.0);

    let unfinished: Vec<_> = report
        .tasks
        .iter()
        .filter(|r| r.state != TaskState::Complete)
        .collect();
    if !unfinished.is_empty() {
        println!();
        for record in unfinished {
            let detail = record
                .log_path
                .as_ref()
                .map(|p| format!(" (log: {})", p.display()))
                .unwrap_or_default();
            println!("  {} {} {}{}", state_icon(record.state), record.id, record.state, detail);
        }
    }
}

fn print_sessions(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No sessions");
        return;
    }
    println!("{:<40} {:<20} {:<9} {:<5} CREATED", "SESSION", "TASK", "STATUS", "EXIT");
    for s in sessions {
        let exit = s.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "{:<40} {:<20} {:<9} {:<5} {}",
            s.session_id,
            s.task_id,
            s.status,
            exit,
            s.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
}

fn print_status(summary: &SessionSummary, errors: &[String]) {
    println!("Session:   {}", summary.session_id);
    println!("Task:      {}", summary.task_id);
    println!("Status:    {}", summary.status);
    println!(
        "Exit code: {}",
        summary.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
    );
    println!("Alive:     {}", summary.alive);
    println!("Created:   {}", summary.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Workspace: {}", summary.workspace.display());
    println!("Log:       {}", summary.log_path.display());
    if !errors.is_empty() {
        println!();
        println!("Error hints:");
        for line in errors {
            println!("  {line}");
        }
    }
}

fn print_cleanup(report: &CleanupReport) {
    if report.is_empty() {
        println!("Nothing to clean up");
        return;
    }
    println!("Reconciled: {}", report.reconciled.len());
    println!("Terminated: {}", report.terminated.len());
    println!("Removed:    {}", report.removed.len());
    println!("Archived:   {}", report.archived.len());
    for (session, reason) in &report.failed {
        println!("Failed:     {session}: {reason}");
    }
}
