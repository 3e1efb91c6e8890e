//! Per-stage wall-clock watchdog.
//!
//! A [`Watchdog`] polls at a fixed cadence. A timeout only counts when the
//! stage produced no output and no marker since the previous poll: the soft
//! timeout at `maxDurationSec` warns once, the hard timeout at
//! `maxDurationSec + margin` asks the supervisor to escalate and ends the task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

/// Default gap between the soft and hard timeouts.
pub const DEFAULT_HARD_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

/// Default polling cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Events emitted by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// Stage exceeded its declared duration while silent.
    SoftTimeout {
        /// Stage being watched.
        stage_id: String,
        /// Seconds since the stage started.
        elapsed_secs: u64,
    },
    /// Stage exceeded its duration plus margin while silent; escalate.
    HardTimeout {
        /// Stage being watched.
        stage_id: String,
        /// Seconds since the stage started.
        elapsed_secs: u64,
        /// Seconds since the last observed output or marker.
        idle_secs: u64,
    },
}

/// Builder for a per-stage watchdog.
///
/// Call [`spawn`](Self::spawn) to start the background task.
pub struct Watchdog {
    stage_id: String,
    soft_after: Duration,
    hard_after: Duration,
    poll_interval: Duration,
    event_tx: mpsc::Sender<WatchdogEvent>,
    cancel: CancellationToken,
}

impl Watchdog {
    /// Construct a watchdog (does not start it yet).
    #[must_use]
    pub fn new(
        stage_id: String,
        max_duration: Duration,
        hard_margin: Duration,
        poll_interval: Duration,
        event_tx: mpsc::Sender<WatchdogEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stage_id,
            soft_after: max_duration,
            hard_after: max_duration + hard_margin,
            poll_interval,
            event_tx,
            cancel,
        }
    }

    /// Spawn the background task and return a handle for feeding it activity.
    #[must_use]
    pub fn spawn(self) -> WatchdogHandle {
        let activity = Arc::new(AtomicU64::new(0));
        let cancel = self.cancel.clone();
        let stage_id = self.stage_id.clone();

        let join_handle = tokio::spawn(
            self.run(Arc::clone(&activity))
                .instrument(info_span!("watchdog", stage_id = %stage_id)),
        );

        WatchdogHandle {
            activity,
            stage_id,
            join_handle: Some(join_handle),
            cancel,
        }
    }

    async fn run(self, activity: Arc<AtomicU64>) {
        let started = Instant::now();
        let mut last_seen = activity.load(Ordering::SeqCst);
        let mut last_activity_at = started;
        let mut soft_sent = false;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("watchdog cancelled");
                    return;
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            let now = Instant::now();
            let current = activity.load(Ordering::SeqCst);
            if current != last_seen {
                last_seen = current;
                last_activity_at = now;
                continue;
            }

            let elapsed = now.duration_since(started);
            if elapsed >= self.hard_after {
                let idle_secs = now.duration_since(last_activity_at).as_secs();
                warn!(elapsed_secs = elapsed.as_secs(), idle_secs, "hard timeout");
                let _ = self
                    .event_tx
                    .send(WatchdogEvent::HardTimeout {
                        stage_id: self.stage_id.clone(),
                        elapsed_secs: elapsed.as_secs(),
                        idle_secs,
                    })
                    .await;
                return;
            }

            if !soft_sent && elapsed >= self.soft_after {
                soft_sent = true;
                warn!(elapsed_secs = elapsed.as_secs(), "soft timeout");
                let _ = self
                    .event_tx
                    .send(WatchdogEvent::SoftTimeout {
                        stage_id: self.stage_id.clone(),
                        elapsed_secs: elapsed.as_secs(),
                    })
                    .await;
            }
        }
    }
}

/// Handle returned from [`Watchdog::spawn`].
pub struct WatchdogHandle {
    activity: Arc<AtomicU64>,
    stage_id: String,
    join_handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl WatchdogHandle {
    /// Record stage output or a lifecycle marker.
    pub fn record_activity(&self) {
        self.activity.fetch_add(1, Ordering::SeqCst);
    }

    /// Stage this handle watches.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Stop the watchdog and wait for its task to exit.
    pub async fn await_completion(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}
