#![forbid(unsafe_code)]

//! `research-checkpoint`: operator CLI for research-run checkpoints.
//!
//! Lists, validates, resumes, prunes, and writes emergency checkpoints, and
//! can run a shell command as a supervised stage. Every subcommand prints a
//! JSON document to stdout; logs go to stderr.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use research_checkpoint::config::GlobalConfig;
use research_checkpoint::models::manifest::InterruptReason;
use research_checkpoint::models::stage::StageEnvelope;
use research_checkpoint::orchestrator::executor::ExecutionOutput;
use research_checkpoint::orchestrator::{
    CheckpointManager, EmergencyDetails, RunHandle, RunLock,
};
use research_checkpoint::supervisor::{ChildProcess, StageHandles, StageSupervisor};
use research_checkpoint::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum ReasonArg {
    Timeout,
    Abort,
    Error,
}

impl From<ReasonArg> for InterruptReason {
    fn from(reason: ReasonArg) -> Self {
        match reason {
            ReasonArg::Timeout => Self::Timeout,
            ReasonArg::Abort => Self::Abort,
            ReasonArg::Error => Self::Error,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "research-checkpoint",
    about = "Checkpoint and resume research runs",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Project root override (directory holding `reports/` and `notebooks/`).
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List checkpoints in creation order.
    List {
        /// Report title.
        report: String,
        /// Restrict to one run.
        #[arg(long)]
        run: Option<String>,
    },

    /// Verify a checkpoint's seal and artifacts.
    Validate {
        /// Report title.
        report: String,
        /// Run identifier.
        run: String,
        /// Checkpoint identifier.
        checkpoint: String,
    },

    /// Select the newest valid checkpoint and print its rehydration code.
    Resume {
        /// Report title.
        report: String,
        /// Restrict to one run.
        #[arg(long)]
        run: Option<String>,
    },

    /// Delete checkpoints beyond the retention count.
    Prune {
        /// Report title.
        report: String,
        /// Run identifier.
        run: String,
        /// Checkpoints to keep (defaults to `retention.keep_count`).
        #[arg(long)]
        keep: Option<usize>,
    },

    /// Write an emergency checkpoint for a stage.
    Emergency {
        /// Research session identifier.
        #[arg(long)]
        session: String,
        /// Report title.
        report: String,
        /// Run identifier.
        run: String,
        /// Stage identifier.
        stage: String,
        /// Why the stage is being stopped.
        #[arg(long, value_enum, default_value_t = ReasonArg::Abort)]
        reason: ReasonArg,
        /// Artifact paths (relative to the project root) to record.
        #[arg(long = "artifact")]
        artifacts: Vec<String>,
    },

    /// Run a command as a supervised stage.
    RunStage {
        /// Research session identifier.
        #[arg(long)]
        session: String,
        /// Report title.
        report: String,
        /// Run identifier.
        run: String,
        /// Stage identifier.
        stage: String,
        /// Stage goal.
        #[arg(long)]
        goal: String,
        /// Declared stage duration in seconds.
        #[arg(long, default_value_t = 240)]
        max_duration: u64,
        /// Declared outputs as `name=relative/path`.
        #[arg(long = "output", value_parser = parse_output)]
        outputs: Vec<(String, String)>,
        /// Command and arguments.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn parse_output(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, path)| (name.to_owned(), path.to_owned()))
        .ok_or_else(|| format!("expected name=path, got '{raw}'"))
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::with_project_root(".")?,
    };
    if let Some(root) = args.project_root {
        config.project_root = root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid project root override: {err}")))?;
    }
    info!(project_root = %config.project_root.display(), "configuration loaded");

    let manager = Arc::new(CheckpointManager::with_ipynb(config.project_root.clone()));

    match args.command {
        Command::List { report, run } => {
            let entries = blocking(&manager, move |m| m.list(&report, run.as_deref())).await?;
            print_json(&entries)
        }
        Command::Validate {
            report,
            run,
            checkpoint,
        } => {
            let result =
                blocking(&manager, move |m| m.validate(&report, &run, &checkpoint)).await?;
            print_json(&result)
        }
        Command::Resume { report, run } => {
            let outcome = blocking(&manager, move |m| m.resume(&report, run.as_deref())).await?;
            print_json(&outcome)
        }
        Command::Prune { report, run, keep } => {
            let keep = keep.unwrap_or(config.retention.keep_count);
            let layout = manager.layout().clone();
            let pruned = blocking(&manager, move |m| {
                let _lock = RunLock::acquire(&layout, &report, &run)?;
                m.prune(&report, &run, keep)
            })
            .await?;
            print_json(&pruned)
        }
        Command::Emergency {
            session,
            report,
            run,
            stage,
            reason,
            artifacts,
        } => {
            let handle = RunHandle::new(session, report, run);
            let details = EmergencyDetails {
                artifacts,
                ..EmergencyDetails::default()
            };
            let manifest = blocking(&manager, move |m| {
                m.emergency(&handle, &stage, reason.into(), details)
            })
            .await?;
            print_json(&manifest)
        }
        Command::RunStage {
            session,
            report,
            run,
            stage,
            goal,
            max_duration,
            outputs,
            command,
        } => {
            let handle = RunHandle::new(session, report, run);
            let mut envelope = StageEnvelope::new(stage, goal);
            envelope.max_duration_sec = max_duration;
            envelope.outputs = outputs.into_iter().collect::<BTreeMap<_, _>>();

            let _lock = RunLock::acquire(manager.layout(), &handle.report_title, &handle.run_id)?;
            let supervisor = StageSupervisor::new(config.supervisor_config(), Arc::clone(&manager));
            let report = run_stage(&supervisor, &handle, &envelope, &command).await?;
            print_json(&report)
        }
    }
}

async fn run_stage(
    supervisor: &StageSupervisor,
    run: &RunHandle,
    envelope: &StageEnvelope,
    command: &[String],
) -> Result<research_checkpoint::supervisor::StageReport> {
    let Some((program, program_args)) = command.split_first() else {
        return Err(AppError::Config("run-stage requires a command".into()));
    };
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(program_args);

    let (mut process, output) = ChildProcess::spawn(cmd)?;
    let exit = process.wait();
    let execution = async move {
        let state = exit.await?;
        Ok(ExecutionOutput {
            error: (!state.success).then(|| match state.code {
                Some(code) => format!("exited with code {code}"),
                None => "terminated by signal".to_owned(),
            }),
            ..ExecutionOutput::default()
        })
    };

    let abort = CancellationToken::new();
    let abort_on_signal = abort.clone();
    let signal_task = tokio::spawn(async move {
        shutdown_signal().await;
        warn!("shutdown signal received; aborting stage");
        abort_on_signal.cancel();
    });

    let report = supervisor
        .supervise(
            run,
            envelope,
            StageHandles {
                process: &mut process,
                execution,
                output,
                abort,
            },
        )
        .await;
    signal_task.abort();
    report
}

/// Run a synchronous manager operation off the async runtime.
async fn blocking<T, F>(manager: &Arc<CheckpointManager>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&CheckpointManager) -> Result<T> + Send + 'static,
{
    let manager = Arc::clone(manager);
    tokio::task::spawn_blocking(move || op(&manager))
        .await
        .map_err(|err| AppError::Io(format!("worker task failed: {err}")))?
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
