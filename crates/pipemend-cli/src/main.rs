//! pipemend - self-healing loop for data pipeline builds
//!
//! ## Commands
//!
//! - `run`: run the build and heal it until it passes or the loop gives up
//! - `classify`: classify an error message without running anything
//! - `rollback`: restore an artifact from a backup file
//! - `mode`: print the resolved execution mode
//! - `report`: print a stored loop report

use std::io::{IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use pipemend_core::config::DEFAULT_CONFIG_FILE;
use pipemend_core::telemetry::init_tracing;
use pipemend_core::{
    read_report_artifact, render_markdown, write_report_artifact, ApprovalChannel,
    ApprovalRequest, ApprovalResponse, BackupManager, BackupRef, CatalogFile, Config,
    ErrorClassifier, FailureReport, HealingLoop, JsonlAuditLog, LoopOutcome, ModeKind,
    NonInteractive, Overrides, ProjectArtifacts, StaticCatalog,
};
use pipemend_runner::CommandRunner;

/// Exit status for a loop stopped by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "pipemend")]
#[command(version = pipemend_core::VERSION)]
#[command(about = "Self-healing runs for data pipeline builds", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON logs and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the build and repair failures until it passes or the loop stops
    Run {
        /// Execution mode (autonomous, human-in-loop, autonomous-ci)
        #[arg(long)]
        mode: Option<ModeKind>,

        /// Override the retry budget
        #[arg(long)]
        max_retries: Option<u32>,

        /// Never prompt; fixes needing approval are left pending review
        #[arg(long)]
        non_interactive: bool,
    },

    /// Classify an error message ("-" reads stdin)
    Classify {
        /// Unit the error came from
        #[arg(long)]
        unit: Option<String>,

        /// Error text, or "-" for stdin
        text: String,
    },

    /// Restore an artifact from a backup file
    Rollback {
        /// Artifact path, relative to the project root
        #[arg(long)]
        artifact: String,

        /// Backup file to restore from
        #[arg(long)]
        backup: PathBuf,
    },

    /// Print the resolved execution mode
    Mode {
        #[arg(long)]
        mode: Option<ModeKind>,
    },

    /// Print the stored report of a loop
    Report {
        /// Loop id
        loop_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            mode,
            max_retries,
            non_interactive,
        } => {
            let overrides = Overrides { mode, max_retries };
            cmd_run(&cli.config, &overrides, non_interactive, cli.json).await
        }
        Commands::Classify { unit, text } => cmd_classify(unit, &text, cli.json),
        Commands::Rollback { artifact, backup } => cmd_rollback(&cli.config, &artifact, &backup),
        Commands::Mode { mode } => cmd_mode(&cli.config, mode, cli.json),
        Commands::Report { loop_id } => cmd_report(&cli.config, &loop_id, cli.json),
    }
}

/// Load the config and anchor a relative project root at the config file's directory.
fn load_config(path: &Path, overrides: &Overrides) -> Result<Config> {
    let mut config = Config::resolve(path, overrides)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    if config.runner.work_dir.is_relative() {
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        config.runner.work_dir = base.join(&config.runner.work_dir);
    }
    Ok(config)
}

fn load_catalog(path: &Path) -> StaticCatalog {
    if !path.exists() {
        warn!(path = %path.display(), "no schema catalog; schema fixes will be unavailable");
        return StaticCatalog::new();
    }
    match CatalogFile::load(path) {
        Ok(catalog) => catalog,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable schema catalog, continuing without it");
            StaticCatalog::new()
        }
    }
}

/// Run the healing loop.
async fn cmd_run(
    config_path: &Path,
    overrides: &Overrides,
    non_interactive: bool,
    json: bool,
) -> Result<ExitCode> {
    let config = load_config(config_path, overrides)?;
    let mode = config.execution_mode();
    let project = config.runner.work_dir.clone();

    let runner = CommandRunner::from_config(&config.runner);
    let artifacts =
        ProjectArtifacts::new(&project).with_search_dirs(config.artifacts.search_dirs.clone());
    let catalog = load_catalog(&config.project_path(&config.catalog.path));
    let backup_dir = config.project_path(&config.backup.dir);
    let backups = BackupManager::new(&project, &backup_dir)
        .retain_on_success(config.backup.retain_on_success);
    let audit_dir = config.project_path(&config.audit.dir);
    let audit = JsonlAuditLog::new(&audit_dir)
        .with_context(|| format!("Failed to open audit log in {}", audit_dir.display()))?;

    let interactive = !non_interactive
        && mode.kind != ModeKind::AutonomousCi
        && std::io::stdin().is_terminal();
    let approvals: Arc<dyn ApprovalChannel> = if interactive {
        Arc::new(StdinApproval)
    } else {
        Arc::new(NonInteractive)
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after cleanup");
            on_signal.cancel();
        }
    });

    info!(mode = %mode.kind, max_retries = mode.max_retries, project = %project.display(), "starting pipemend");
    let healing = HealingLoop::new(
        Arc::new(runner),
        Arc::new(artifacts),
        Arc::new(catalog),
        backups,
        mode,
    )
    .with_settings(config.loop_settings())
    .with_approvals(approvals)
    .with_audit(Arc::new(audit))
    .with_cancellation(cancel);

    let state = healing
        .run()
        .await
        .context("Failed to invoke the build tool")?;

    if let Some(keep) = config.backup.keep {
        let pruned = BackupManager::new(&project, &backup_dir)
            .prune_backups(keep)
            .context("Failed to prune backups")?;
        if pruned > 0 {
            info!(pruned, "pruned old backups");
        }
    }

    let report = FailureReport::from_state(&state);
    let report_dir = config.project_path(&config.report.dir);
    let written = write_report_artifact(&report, &report_dir)
        .with_context(|| format!("Failed to write report to {}", report_dir.display()))?;
    info!(path = %written.display(), "report written");

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", render_markdown(&report));
    }

    Ok(match state.outcome {
        Some(LoopOutcome::Succeeded) => ExitCode::SUCCESS,
        Some(LoopOutcome::Cancelled) => ExitCode::from(EXIT_CANCELLED),
        _ => ExitCode::FAILURE,
    })
}

/// Classify an error message.
fn cmd_classify(unit: Option<String>, text: &str, json: bool) -> Result<ExitCode> {
    let text = if text == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read error text from stdin")?;
        buf
    } else {
        text.to_string()
    };

    let classification = ErrorClassifier::default().classify_text(unit, &text);
    if json {
        println!("{}", serde_json::to_string_pretty(&classification)?);
    } else {
        println!("kind:        {}", classification.kind);
        println!("root cause:  {}", classification.root_cause);
        println!("confidence:  {:.2}", classification.confidence_seed);
        if let Some(unit) = &classification.unit_id {
            println!("unit:        {unit}");
        }
        if let Some(subject) = &classification.subject {
            println!("subject:     {subject}");
        }
        if let Some(artifact) = &classification.artifact_hint {
            println!("artifact:    {artifact}");
        }
        if let Some(rule) = &classification.rule {
            println!("rule:        {rule}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Restore an artifact from a backup.
fn cmd_rollback(config_path: &Path, artifact: &str, backup: &Path) -> Result<ExitCode> {
    let config = load_config(config_path, &Overrides::default())?;
    let project = config.runner.work_dir.clone();
    let manager = BackupManager::new(&project, config.project_path(&config.backup.dir));

    let backup_ref = BackupRef::from_path(artifact, backup)
        .with_context(|| format!("Not a pipemend backup: {}", backup.display()))?;
    manager
        .rollback(&backup_ref)
        .with_context(|| format!("Failed to roll back {artifact}"))?;

    println!("restored {artifact} from {}", backup.display());
    Ok(ExitCode::SUCCESS)
}

/// Print the mode the loop would run with.
fn cmd_mode(config_path: &Path, mode: Option<ModeKind>, json: bool) -> Result<ExitCode> {
    let overrides = Overrides {
        mode,
        max_retries: None,
    };
    let config = load_config(config_path, &overrides)?;
    let resolved = config.execution_mode();
    if json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
    } else {
        println!("mode:            {}", resolved.kind);
        println!("min confidence:  {:.2}", resolved.min_confidence);
        println!("max retries:     {}", resolved.max_retries);
    }
    Ok(ExitCode::SUCCESS)
}

/// Print a stored report, verifying its digest.
fn cmd_report(config_path: &Path, loop_id: &str, json: bool) -> Result<ExitCode> {
    let config = load_config(config_path, &Overrides::default())?;
    let report_dir = config.project_path(&config.report.dir);
    let report = read_report_artifact(loop_id, &report_dir)
        .with_context(|| format!("Failed to read report for loop {loop_id}"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", render_markdown(&report));
    }
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Asks on the terminal whether a fix may be applied.
struct StdinApproval;

fn parse_answer(line: &str) -> ApprovalResponse {
    let answer = line.trim();
    match answer.to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalResponse::Approved,
        "" | "n" | "no" => ApprovalResponse::Denied { reason: None },
        _ => ApprovalResponse::Denied {
            reason: Some(answer.to_string()),
        },
    }
}

fn print_request(request: &ApprovalRequest) {
    let fix = &request.proposal;
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "\n{} failure: {}", request.kind, request.root_cause);
    let _ = writeln!(
        err,
        "proposed fix in {} (confidence {:.2}): {}",
        fix.artifact, fix.confidence, fix.description
    );
    let _ = writeln!(err, "  - {}", fix.old_text);
    let _ = writeln!(err, "  + {}", fix.new_text);
    let _ = write!(err, "apply? [y/N, or a reason to deny] ");
    let _ = err.flush();
}

#[async_trait]
impl ApprovalChannel for StdinApproval {
    async fn request(&self, request: &ApprovalRequest) -> ApprovalResponse {
        print_request(request);
        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(0) | Err(_) => ApprovalResponse::Unavailable,
            Ok(_) => parse_answer(&line),
        }
    }
}
