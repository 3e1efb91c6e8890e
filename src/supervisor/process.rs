//! Process-control capability and its OS-backed implementation.

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use super::line_codec::StageLineCodec;
use super::stage_supervisor::{OutputLine, OutputStream};
use crate::{AppError, Result};

/// Capacity of the captured-output channel returned by [`ChildProcess::spawn`].
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Signals the supervisor can deliver to a running stage.
///
/// `interrupt` and `terminate` request a stop the stage may ignore; `kill`
/// cannot be ignored. All three treat an already-exited process as success.
pub trait ProcessControl: Send {
    /// OS process id, if the process is still running.
    fn id(&self) -> Option<u32>;

    /// Send a soft stop request (SIGINT on Unix).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the signal cannot be delivered.
    fn interrupt(&mut self) -> Result<()>;

    /// Send a termination request (SIGTERM on Unix).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the signal cannot be delivered.
    fn terminate(&mut self) -> Result<()>;

    /// Force-kill the process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the kill cannot be issued.
    fn kill(&mut self) -> Result<()>;

    /// Whether the process is still running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the status cannot be queried.
    fn is_alive(&mut self) -> Result<bool>;
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    /// Exit code, absent when ended by a signal.
    pub code: Option<i32>,
    /// Whether the process exited with status 0.
    pub success: bool,
}

/// [`ProcessControl`] over a spawned child.
///
/// A background task owns the [`tokio::process::Child`] and reaps it, so
/// [`wait`](Self::wait) can be awaited while the supervisor still holds this
/// handle for signalling.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Option<u32>,
    status: watch::Receiver<Option<ExitState>>,
    kill: Arc<Notify>,
}

impl ChildProcess {
    /// Spawn `command` with piped output and forward each line to a channel.
    ///
    /// The child is killed if the reaper task is dropped with the runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the command cannot be spawned.
    pub fn spawn(mut command: Command) -> Result<(Self, mpsc::Receiver<OutputLine>)> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| AppError::Process(format!("failed to spawn stage process: {err}")))?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx));
        }

        let (status_tx, status_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        let kill_requested = Arc::clone(&kill);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                () = kill_requested.notified() => {
                    if let Err(err) = child.start_kill() {
                        warn!(%err, "force kill failed");
                    }
                    child.wait().await
                }
            };
            let state = match status {
                Ok(status) => ExitState {
                    code: status.code(),
                    success: status.success(),
                },
                Err(err) => {
                    warn!(%err, "failed to reap stage process");
                    ExitState {
                        code: None,
                        success: false,
                    }
                }
            };
            debug!(?state, "stage process exited");
            let _ = status_tx.send(Some(state));
        });

        debug!(?pid, "stage process spawned");
        Ok((
            Self {
                pid,
                status: status_rx,
                kill,
            },
            rx,
        ))
    }

    /// Future resolving when the process exits.
    ///
    /// Independent of `self`, so it can run alongside supervision.
    pub fn wait(&self) -> impl Future<Output = Result<ExitState>> + Send + 'static {
        let mut status = self.status.clone();
        async move {
            let state = *status
                .wait_for(Option::is_some)
                .await
                .map_err(|_| AppError::Process("process reaper stopped".into()))?;
            state.ok_or_else(|| AppError::Process("exit status unavailable".into()))
        }
    }

    fn exited(&self) -> bool {
        self.status.borrow().is_some()
    }

    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Some(pid) = self.pid.filter(|_| !self.exited()) else {
            return Ok(());
        };
        let raw = i32::try_from(pid)
            .map_err(|_| AppError::Process(format!("pid {pid} out of range")))?;

        match kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(AppError::Process(format!(
                "failed to send {signal} to {pid}: {errno}"
            ))),
        }
    }
}

impl ProcessControl for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.pid.filter(|_| !self.exited())
    }

    #[cfg(unix)]
    fn interrupt(&mut self) -> Result<()> {
        self.signal(nix::sys::signal::Signal::SIGINT)
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) -> Result<()> {
        Err(AppError::Process(
            "interrupt is not supported on this platform".into(),
        ))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        self.signal(nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        Err(AppError::Process(
            "terminate is not supported on this platform".into(),
        ))
    }

    fn kill(&mut self) -> Result<()> {
        if !self.exited() {
            self.kill.notify_one();
        }
        Ok(())
    }

    fn is_alive(&mut self) -> Result<bool> {
        Ok(!self.exited())
    }
}

/// Forward decoded lines until EOF.
///
/// Keeps draining after the receiver is gone so the child never blocks on a
/// full pipe.
async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(reader, StageLineCodec::new());
    let mut forwarding = true;
    while let Some(item) = framed.next().await {
        match item {
            Ok(text) => {
                if forwarding && tx.send(OutputLine { stream, text }).await.is_err() {
                    debug!(?stream, "output receiver closed, draining");
                    forwarding = false;
                }
            }
            Err(err) => {
                warn!(%err, ?stream, "stage output read failed");
                break;
            }
        }
    }
}
