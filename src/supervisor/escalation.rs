//! Graduated interrupt → terminate → kill escalation.
//!
//! Every phase has a fixed upper bound, so the total time to guaranteed
//! termination is `G + max(G/2, 1s) + 1s` for grace period `G` no matter how
//! the process behaves.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

use super::process::ProcessControl;

/// Interval between liveness polls inside a wait window.
const POLL_STEP: Duration = Duration::from_millis(25);

/// Lower bound on the terminate window.
const MIN_TERMINATE_WINDOW: Duration = Duration::from_secs(1);

/// Time allowed for the OS to reap a force-killed process.
const KILL_WINDOW: Duration = Duration::from_secs(1);

/// Default interrupt grace period.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(5000);

/// Wait windows for each escalation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// Wait after the interrupt signal.
    pub grace: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            grace: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl EscalationPolicy {
    /// Construct a policy with grace period `grace`.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// `max(G/2, 1s)`
    #[must_use]
    pub fn terminate_window(&self) -> Duration {
        (self.grace / 2).max(MIN_TERMINATE_WINDOW)
    }

    /// Reap window after the kill.
    #[must_use]
    pub fn kill_window(&self) -> Duration {
        KILL_WINDOW
    }

    /// Upper bound on the whole escalation.
    #[must_use]
    pub fn max_total(&self) -> Duration {
        self.grace + self.terminate_window() + self.kill_window()
    }
}

/// Signal that ended the process.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationSignal {
    /// The process was gone before any signal was sent.
    AlreadyExited,
    /// Soft stop.
    Interrupt,
    /// Termination request.
    Terminate,
    /// Force kill.
    Kill,
}

impl TerminationSignal {
    fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyExited => "already_exited",
            Self::Interrupt => "interrupt",
            Self::Terminate => "terminate",
            Self::Kill => "kill",
        }
    }
}

/// One phase of an escalation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationStep {
    /// Signal sent in this phase.
    pub signal: TerminationSignal,
    /// Whether the signal was delivered.
    pub delivered: bool,
    /// Time spent waiting for exit, in milliseconds.
    pub waited_ms: u64,
}

/// How an escalation ended.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationOutcome {
    /// Signal that achieved termination.
    pub terminated_by: TerminationSignal,
    /// Total escalation time in milliseconds.
    pub elapsed_ms: u64,
    /// Whether exit was observed. `false` only when the OS never reaped the
    /// process after the kill.
    pub confirmed: bool,
    /// Phases in order.
    pub steps: Vec<EscalationStep>,
}

impl EscalationOutcome {
    /// Total escalation time.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Stop `process`, escalating through interrupt, terminate, and kill.
pub async fn escalate<P>(process: &mut P, policy: &EscalationPolicy) -> EscalationOutcome
where
    P: ProcessControl + ?Sized,
{
    let span = info_span!("escalate", pid = ?process.id(), grace_ms = millis(policy.grace));
    run_phases(process, policy).instrument(span).await
}

async fn run_phases<P>(process: &mut P, policy: &EscalationPolicy) -> EscalationOutcome
where
    P: ProcessControl + ?Sized,
{
    let started = Instant::now();

    if !probe(process) {
        info!("process already exited; no signal sent");
        return EscalationOutcome {
            terminated_by: TerminationSignal::AlreadyExited,
            elapsed_ms: millis(started.elapsed()),
            confirmed: true,
            steps: Vec::new(),
        };
    }

    let phases = [
        (TerminationSignal::Interrupt, policy.grace),
        (TerminationSignal::Terminate, policy.terminate_window()),
        (TerminationSignal::Kill, policy.kill_window()),
    ];

    let mut steps = Vec::with_capacity(phases.len());
    for (signal, window) in phases {
        let delivered = match send(process, signal) {
            Ok(()) => true,
            Err(err) => {
                warn!(signal = signal.as_str(), %err, "signal delivery failed");
                false
            }
        };

        let phase_start = Instant::now();
        // An undelivered soft signal cannot stop anything; move on without waiting.
        let exited = if delivered || signal == TerminationSignal::Kill {
            wait_for_exit(process, window).await
        } else {
            !probe(process)
        };
        steps.push(EscalationStep {
            signal,
            delivered,
            waited_ms: millis(phase_start.elapsed()),
        });

        if exited {
            let elapsed_ms = millis(started.elapsed());
            info!(signal = signal.as_str(), elapsed_ms, "process terminated");
            return EscalationOutcome {
                terminated_by: signal,
                elapsed_ms,
                confirmed: true,
                steps,
            };
        }
        warn!(
            signal = signal.as_str(),
            window_ms = millis(window),
            "process still alive after signal"
        );
    }

    let elapsed_ms = millis(started.elapsed());
    error!(elapsed_ms, "process not reaped after kill");
    EscalationOutcome {
        terminated_by: TerminationSignal::Kill,
        elapsed_ms,
        confirmed: false,
        steps,
    }
}

fn send<P>(process: &mut P, signal: TerminationSignal) -> crate::Result<()>
where
    P: ProcessControl + ?Sized,
{
    match signal {
        TerminationSignal::AlreadyExited => Ok(()),
        TerminationSignal::Interrupt => process.interrupt(),
        TerminationSignal::Terminate => process.terminate(),
        TerminationSignal::Kill => process.kill(),
    }
}

/// Liveness check; an unanswerable probe counts as alive.
fn probe<P>(process: &mut P) -> bool
where
    P: ProcessControl + ?Sized,
{
    process.is_alive().unwrap_or_else(|err| {
        warn!(%err, "liveness probe failed");
        true
    })
}

async fn wait_for_exit<P>(process: &mut P, window: Duration) -> bool
where
    P: ProcessControl + ?Sized,
{
    let deadline = Instant::now() + window;
    loop {
        if !probe(process) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
