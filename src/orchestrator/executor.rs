//! Orchestrator/executor boundary.
//!
//! The orchestrator never decides stage contents itself: it hands a validated
//! [`StageEnvelope`] to a [`StageExecutor`] and receives a
//! [`StageReport`]. Resuming is the reverse direction: the orchestrator runs
//! the rehydration code from a [`ResumeOutcome`] through an
//! [`InterpreterSession`] and confirms the `REHYDRATED` marker came back.
//!
//! [`SessionStageExecutor`] is the stock executor: it brackets the stage's
//! code with `[STAGE:begin]`/`[STAGE:end]` prints and runs it in a session
//! under a [`StageSupervisor`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::checkpoint_manager::{ResumeOutcome, RunHandle};
use crate::markers::{find_rehydrated, Marker, StageMarkerKind};
use crate::models::stage::StageEnvelope;
use crate::supervisor::{ProcessControl, StageHandles, StageReport, StageSupervisor};
use crate::{AppError, Result};

/// Result of executing one code block in the interpreter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Error description if the code raised.
    pub error: Option<String>,
}

impl ExecutionOutput {
    /// Whether the code ran without raising.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Persistent interpreter session that executes code blocks.
pub trait InterpreterSession: Send + Sync {
    /// Execute `code` and return its captured output.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the session is unreachable. Errors
    /// raised by the code itself are reported in [`ExecutionOutput::error`].
    fn execute(
        &self,
        code: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionOutput>> + Send + '_>>;
}

/// Runs one stage on behalf of the orchestrator.
pub trait StageExecutor: Send + Sync {
    /// Execute the stage described by `envelope` to completion or interruption.
    ///
    /// # Errors
    ///
    /// Returns an error only when the stage could not be started or
    /// supervised; stage failures are described by the report's state.
    fn request_stage(
        &self,
        envelope: StageEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<StageReport>> + Send + '_>>;
}

/// Builds the code a stage runs from its envelope.
pub type StageCode = Arc<dyn Fn(&StageEnvelope) -> String + Send + Sync>;

/// [`StageExecutor`] running stage code in a persistent interpreter session.
///
/// `process` is the interpreter's own process, signalled by the supervisor
/// when the stage overruns. Stages run one at a time.
pub struct SessionStageExecutor<S, P> {
    session: Arc<S>,
    process: Mutex<P>,
    supervisor: StageSupervisor,
    run: RunHandle,
    code: StageCode,
    abort: CancellationToken,
}

impl<S, P> SessionStageExecutor<S, P>
where
    S: InterpreterSession + 'static,
    P: ProcessControl,
{
    /// Construct an executor for `run`.
    #[must_use]
    pub fn new(
        session: Arc<S>,
        process: P,
        supervisor: StageSupervisor,
        run: RunHandle,
        code: StageCode,
    ) -> Self {
        Self {
            session,
            process: Mutex::new(process),
            supervisor,
            run,
            code,
            abort: CancellationToken::new(),
        }
    }

    /// Token that aborts the running stage, and every later one, when cancelled.
    #[must_use]
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }
}

impl<S, P> StageExecutor for SessionStageExecutor<S, P>
where
    S: InterpreterSession + 'static,
    P: ProcessControl,
{
    fn request_stage(
        &self,
        envelope: StageEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<StageReport>> + Send + '_>> {
        Box::pin(async move {
            envelope.validate()?;
            let code = wrap_stage_code(&envelope.stage_id, &(self.code)(&envelope));
            debug!(stage_id = %envelope.stage_id, bytes = code.len(), "stage code prepared");

            let session = Arc::clone(&self.session);
            let execution = async move { session.execute(&code).await };

            // The session hands its output back with the result; nothing streams.
            let (tx, output) = mpsc::channel(1);
            drop(tx);

            let mut process = self.process.lock().await;
            self.supervisor
                .supervise(
                    &self.run,
                    &envelope,
                    StageHandles {
                        process: &mut *process,
                        execution,
                        output,
                        abort: self.abort.child_token(),
                    },
                )
                .await
        })
    }
}

/// Bracket `body` with prints of the stage's begin and end markers.
///
/// `stage_id` must already be validated; it is embedded in a string literal.
#[must_use]
pub fn wrap_stage_code(stage_id: &str, body: &str) -> String {
    format!(
        "print('{}', flush=True)\n{}\nprint('{}', flush=True)\n",
        Marker::stage(StageMarkerKind::Begin, stage_id),
        body.trim_end(),
        Marker::stage(StageMarkerKind::End, stage_id),
    )
}

/// Validate `envelope` and hand it to `executor`.
///
/// # Errors
///
/// Returns `AppError::Validation` without contacting the executor when the
/// envelope is malformed, otherwise whatever the executor returns.
pub async fn delegate<E>(executor: &E, envelope: StageEnvelope) -> Result<StageReport>
where
    E: StageExecutor + ?Sized,
{
    let stage_id = envelope.validate()?;
    let span = info_span!("delegate_stage", stage_id = %stage_id);

    async move {
        info!(
            goal = %envelope.goal,
            max_duration_sec = envelope.max_duration_sec,
            "delegating stage"
        );
        executor.request_stage(envelope).await
    }
    .instrument(span)
    .await
}

/// Run the rehydration cells from `outcome` in `session`.
///
/// Returns `true` when the interpreter echoed the `REHYDRATED` marker for the
/// selected checkpoint, `false` when there was nothing to resume or the marker
/// did not appear.
///
/// # Errors
///
/// Returns `AppError::Process` if the session cannot execute code or the
/// rehydration code raised.
pub async fn apply_rehydration<S>(session: &S, outcome: &ResumeOutcome) -> Result<bool>
where
    S: InterpreterSession + ?Sized,
{
    let Some(checkpoint) = outcome.checkpoint.as_ref().filter(|_| outcome.found) else {
        return Ok(false);
    };

    let code = outcome.rehydration_cells.join("\n");
    let output = session.execute(&code).await?;
    if let Some(error) = output.error {
        return Err(AppError::Process(format!(
            "rehydration from {} raised: {error}",
            checkpoint.checkpoint_id
        )));
    }

    match find_rehydrated(&output.stdout) {
        Some(from) if from == checkpoint.checkpoint_id => {
            info!(checkpoint_id = %from, "session rehydrated");
            Ok(true)
        }
        other => {
            warn!(
                expected = %checkpoint.checkpoint_id,
                observed = ?other,
                "rehydration marker not observed"
            );
            Ok(false)
        }
    }
}
