//! Drives one stage through its lifecycle state machine.
//!
//! ```text
//! PENDING → RUNNING → COMPLETED
//!                   → INTERRUPTING → INTERRUPTED → RESUMABLE | BLOCKED
//!                   → FAILED → RESUMABLE | BLOCKED
//! ```
//!
//! On a hard timeout or an abort request the supervisor asks for an emergency
//! checkpoint and escalates signals concurrently, then preserves whatever
//! output the stage produced before it died.
//!
//! A stage that returns normally has its declared outputs saved as a regular
//! checkpoint when `checkpoint_after` is set. If that save fails the stage is
//! treated as failed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::escalation::{escalate, EscalationOutcome, EscalationPolicy, DEFAULT_GRACE_PERIOD};
use super::process::ProcessControl;
use super::watchdog::{
    Watchdog, WatchdogEvent, DEFAULT_HARD_TIMEOUT_MARGIN, DEFAULT_POLL_INTERVAL,
};
use crate::markers::{parse_line, Marker, StageMarkerKind};
use crate::models::manifest::InterruptReason;
use crate::models::stage::{StageEnvelope, StageState};
use crate::models::validation::ValidationError;
use crate::orchestrator::checkpoint_manager::{CheckpointManager, EmergencyDetails, RunHandle};
use crate::orchestrator::executor::ExecutionOutput;
use crate::{AppError, Result};

/// Default cap on captured stdout + stderr.
pub const DEFAULT_MAX_CAPTURED_OUTPUT_BYTES: usize = 1024 * 1024;

/// Supervisor timing and capture limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Wait after the interrupt signal before escalating.
    pub grace_period: Duration,
    /// Watchdog polling cadence.
    pub poll_interval: Duration,
    /// Gap between the soft and hard timeouts.
    pub hard_timeout_margin: Duration,
    /// Cap on captured output; later lines are dropped.
    pub max_captured_output_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            hard_timeout_margin: DEFAULT_HARD_TIMEOUT_MARGIN,
            max_captured_output_bytes: DEFAULT_MAX_CAPTURED_OUTPUT_BYTES,
        }
    }
}

/// Which stream a captured line came from.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One line of stage output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Source stream.
    pub stream: OutputStream,
    /// Line text without the trailing newline.
    pub text: String,
}

/// Everything the supervisor needs to watch one running stage.
pub struct StageHandles<'a, P: ?Sized, F> {
    /// Process running the stage.
    pub process: &'a mut P,
    /// Future resolving when the stage's code returns.
    pub execution: F,
    /// Live output lines.
    pub output: mpsc::Receiver<OutputLine>,
    /// Cancelled by the orchestrator to abort the stage.
    pub abort: CancellationToken,
}

/// Final record of a supervised stage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    /// Stage identifier.
    pub stage_id: String,
    /// Terminal state.
    pub state: StageState,
    /// Every state visited, in order.
    pub history: Vec<StageState>,
    /// Wall-clock time from start to terminal state, in milliseconds.
    pub elapsed_ms: u64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Whether output beyond the capture limit was dropped.
    pub output_truncated: bool,
    /// Lifecycle markers seen in the output.
    pub markers: Vec<Marker>,
    /// Signal escalation, if the stage had to be stopped.
    pub escalation: Option<EscalationOutcome>,
    /// Checkpoint of the stage's outputs saved on completion.
    pub checkpoint_id: Option<String>,
    /// Emergency checkpoint written while stopping or after failure.
    pub emergency_checkpoint_id: Option<String>,
    /// Checkpoint a restart would resume from.
    pub resume_checkpoint_id: Option<String>,
    /// Error that ended the stage, if any.
    pub error: Option<String>,
}

/// Runs stages under a watchdog and escalates when they overrun.
#[derive(Debug, Clone)]
pub struct StageSupervisor {
    config: SupervisorConfig,
    manager: Arc<CheckpointManager>,
}

enum Trigger {
    Finished(Result<ExecutionOutput>),
    Stop(InterruptReason),
}

impl StageSupervisor {
    /// Construct a supervisor that records checkpoints through `manager`.
    #[must_use]
    pub fn new(config: SupervisorConfig, manager: Arc<CheckpointManager>) -> Self {
        Self { config, manager }
    }

    /// Supervisor settings.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Supervise one stage until it reaches a terminal state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the envelope is malformed. Stage
    /// failures, timeouts, and aborts are reported through the returned
    /// [`StageReport`], not as errors.
    pub async fn supervise<P, F>(
        &self,
        run: &RunHandle,
        envelope: &StageEnvelope,
        handles: StageHandles<'_, P, F>,
    ) -> Result<StageReport>
    where
        P: ProcessControl + ?Sized,
        F: Future<Output = Result<ExecutionOutput>> + Send,
    {
        let stage_id = envelope.validate()?;
        let span = info_span!(
            "supervise_stage",
            stage_id = %stage_id,
            run_id = %run.run_id,
            max_duration_sec = envelope.max_duration_sec,
        );
        self.run_stage(run, envelope, handles).instrument(span).await
    }

    async fn run_stage<P, F>(
        &self,
        run: &RunHandle,
        envelope: &StageEnvelope,
        handles: StageHandles<'_, P, F>,
    ) -> Result<StageReport>
    where
        P: ProcessControl + ?Sized,
        F: Future<Output = Result<ExecutionOutput>> + Send,
    {
        let StageHandles {
            process,
            execution,
            mut output,
            abort,
        } = handles;

        let mut report = StageReport {
            stage_id: envelope.stage_id.clone(),
            state: StageState::Pending,
            history: vec![StageState::Pending],
            elapsed_ms: 0,
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            markers: Vec::new(),
            escalation: None,
            checkpoint_id: None,
            emergency_checkpoint_id: None,
            resume_checkpoint_id: None,
            error: None,
        };
        let mut capture = OutputCapture::new(self.config.max_captured_output_bytes);

        advance(&mut report, StageState::Running)?;
        info!("{}", Marker::stage(StageMarkerKind::Begin, envelope.stage_id.clone()));
        let started = Instant::now();

        let (event_tx, mut event_rx) = mpsc::channel(4);
        let watchdog = Watchdog::new(
            envelope.stage_id.clone(),
            Duration::from_secs(envelope.max_duration_sec),
            self.config.hard_timeout_margin,
            self.config.poll_interval,
            event_tx,
            CancellationToken::new(),
        )
        .spawn();

        tokio::pin!(execution);
        let mut output_open = true;

        let trigger = loop {
            tokio::select! {
                result = &mut execution => break Trigger::Finished(result),
                line = output.recv(), if output_open => match line {
                    Some(line) => {
                        watchdog.record_activity();
                        observe(&line, &mut capture, &mut report);
                    }
                    None => output_open = false,
                },
                Some(event) = event_rx.recv() => match event {
                    WatchdogEvent::SoftTimeout { elapsed_secs, .. } => {
                        warn!(elapsed_secs, "stage exceeded its declared duration");
                    }
                    WatchdogEvent::HardTimeout { elapsed_secs, idle_secs, .. } => {
                        warn!(elapsed_secs, idle_secs, "stage unresponsive; stopping");
                        break Trigger::Stop(InterruptReason::Timeout);
                    }
                },
                () = abort.cancelled() => {
                    info!("abort requested");
                    break Trigger::Stop(InterruptReason::Abort);
                }
            }
        };
        watchdog.await_completion().await;

        match trigger {
            Trigger::Finished(Ok(result)) if result.is_success() => {
                absorb(&result, &mut capture, &mut report);
                drain(&mut output, &mut capture, &mut report);
                let saved = if envelope.checkpoint_after {
                    self.completion_checkpoint(run, envelope).await.map(Some)
                } else {
                    Ok(None)
                };
                match saved {
                    Ok(checkpoint_id) => {
                        report.checkpoint_id = checkpoint_id;
                        advance(&mut report, StageState::Completed)?;
                        info!("{}", Marker::stage(StageMarkerKind::End, envelope.stage_id.clone()));
                    }
                    Err(err) => {
                        report.error = Some(format!("checkpoint after stage failed: {err}"));
                        self.fail(run, envelope, &mut report).await?;
                    }
                }
            }
            Trigger::Finished(finished) => {
                match finished {
                    Ok(result) => {
                        absorb(&result, &mut capture, &mut report);
                        report.error = result.error;
                    }
                    Err(err) => report.error = Some(err.to_string()),
                }
                drain(&mut output, &mut capture, &mut report);
                self.fail(run, envelope, &mut report).await?;
            }
            Trigger::Stop(reason) => {
                advance(&mut report, StageState::Interrupting)?;
                let policy = EscalationPolicy::new(self.config.grace_period);
                let (emergency_id, escalation) = tokio::join!(
                    self.emergency_checkpoint(run, envelope, reason),
                    escalate(process, &policy),
                );
                report.emergency_checkpoint_id = emergency_id;
                report.escalation = Some(escalation);
                drain(&mut output, &mut capture, &mut report);
                advance(&mut report, StageState::Interrupted)?;
                report.error = Some(format!("stage stopped: {reason}"));
                self.settle(run, &mut report).await?;
            }
        }

        if !report.state.is_terminal() {
            return Err(AppError::Process(format!(
                "stage supervision ended in non-terminal state {:?}",
                report.state
            )));
        }

        report.stdout = capture.stdout;
        report.stderr = capture.stderr;
        report.output_truncated = capture.truncated;
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            state = ?report.state,
            elapsed_ms = report.elapsed_ms,
            "stage supervision finished"
        );
        Ok(report)
    }

    /// Save the envelope's outputs as a regular checkpoint.
    async fn completion_checkpoint(
        &self,
        run: &RunHandle,
        envelope: &StageEnvelope,
    ) -> Result<String> {
        let manager = Arc::clone(&self.manager);
        let run = run.clone();
        let envelope = envelope.clone();

        let manifest = tokio::task::spawn_blocking(move || {
            manager.save_stage_outputs(&run, &envelope, None)
        })
        .await
        .map_err(|err| AppError::Io(format!("checkpoint task aborted: {err}")))??;
        Ok(manifest.checkpoint_id)
    }

    /// Record a failed stage, write its emergency checkpoint, then settle.
    async fn fail(
        &self,
        run: &RunHandle,
        envelope: &StageEnvelope,
        report: &mut StageReport,
    ) -> Result<()> {
        advance(report, StageState::Failed)?;
        warn!(error = ?report.error, "stage failed");
        report.emergency_checkpoint_id = self
            .emergency_checkpoint(run, envelope, InterruptReason::Error)
            .await;
        self.settle(run, report).await
    }

    /// Write an emergency checkpoint off the async runtime; failures are logged.
    async fn emergency_checkpoint(
        &self,
        run: &RunHandle,
        envelope: &StageEnvelope,
        reason: InterruptReason,
    ) -> Option<String> {
        let manager = Arc::clone(&self.manager);
        let run = run.clone();
        let stage_id = envelope.stage_id.clone();
        let details = EmergencyDetails {
            artifacts: envelope.outputs.values().cloned().collect(),
            ..EmergencyDetails::default()
        };

        match tokio::task::spawn_blocking(move || {
            manager.emergency(&run, &stage_id, reason, details)
        })
        .await
        {
            Ok(Ok(manifest)) => Some(manifest.checkpoint_id),
            Ok(Err(err)) => {
                error!(%err, "emergency checkpoint failed");
                None
            }
            Err(err) => {
                error!(%err, "emergency checkpoint task aborted");
                None
            }
        }
    }

    /// Move an interrupted or failed stage to `Resumable` or `Blocked`.
    async fn settle(&self, run: &RunHandle, report: &mut StageReport) -> Result<()> {
        let manager = Arc::clone(&self.manager);
        let report_title = run.report_title.clone();
        let run_id = run.run_id.clone();

        let selected = match tokio::task::spawn_blocking(move || {
            manager.resume(&report_title, Some(&run_id))
        })
        .await
        {
            Ok(Ok(outcome)) => outcome.checkpoint.map(|m| m.checkpoint_id),
            Ok(Err(err)) => {
                warn!(%err, "resume lookup failed");
                None
            }
            Err(err) => {
                warn!(%err, "resume lookup task aborted");
                None
            }
        };

        if let Some(checkpoint_id) = selected {
            info!(%checkpoint_id, "stage resumable");
            report.resume_checkpoint_id = Some(checkpoint_id);
            advance(report, StageState::Resumable)
        } else {
            warn!("no valid checkpoint; stage blocked");
            advance(report, StageState::Blocked)
        }
    }
}

fn advance(report: &mut StageReport, next: StageState) -> Result<()> {
    if !report.state.can_transition_to(next) {
        return Err(AppError::Validation(vec![ValidationError::new(
            "state",
            format!("illegal transition {:?} -> {next:?}", report.state),
        )]));
    }
    debug!(from = ?report.state, to = ?next, "stage transition");
    report.state = next;
    report.history.push(next);
    Ok(())
}

/// Note any marker on `line`, then capture it.
fn observe(line: &OutputLine, capture: &mut OutputCapture, report: &mut StageReport) {
    if let Some(marker) = parse_line(&line.text) {
        debug!(%marker, "marker observed");
        report.markers.push(marker);
    }
    capture.push(line);
}

/// Collect lines that arrived before the output channel was abandoned.
fn drain(
    output: &mut mpsc::Receiver<OutputLine>,
    capture: &mut OutputCapture,
    report: &mut StageReport,
) {
    while let Ok(line) = output.try_recv() {
        observe(&line, capture, report);
    }
}

/// Fold in output returned by the execution itself.
fn absorb(result: &ExecutionOutput, capture: &mut OutputCapture, report: &mut StageReport) {
    for (stream, text) in [
        (OutputStream::Stdout, &result.stdout),
        (OutputStream::Stderr, &result.stderr),
    ] {
        for line in text.lines() {
            let line = OutputLine {
                stream,
                text: line.to_owned(),
            };
            observe(&line, capture, report);
        }
    }
}

/// Bounded stdout/stderr accumulator.
struct OutputCapture {
    stdout: String,
    stderr: String,
    used: usize,
    limit: usize,
    truncated: bool,
}

impl OutputCapture {
    fn new(limit: usize) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            used: 0,
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, line: &OutputLine) {
        let cost = line.text.len() + 1;
        if self.used + cost > self.limit {
            self.truncated = true;
            return;
        }
        self.used += cost;
        let target = match line.stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        };
        target.push_str(&line.text);
        target.push('\n');
    }
}
