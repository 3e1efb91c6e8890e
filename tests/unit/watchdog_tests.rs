//! Unit tests for the stage watchdog on paused tokio time.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use research_checkpoint::supervisor::{Watchdog, WatchdogEvent, WatchdogHandle};

fn start(max_secs: u64) -> (WatchdogHandle, mpsc::Receiver<WatchdogEvent>) {
    let (tx, rx) = mpsc::channel(8);
    let handle = Watchdog::new(
        "S03_fit_model".into(),
        Duration::from_secs(max_secs),
        Duration::from_secs(30),
        Duration::from_secs(5),
        tx,
        CancellationToken::new(),
    )
    .spawn();
    (handle, rx)
}

#[tokio::test(start_paused = true)]
async fn silent_stage_gets_soft_then_hard_timeout() {
    let (handle, mut rx) = start(60);
    assert_eq!(handle.stage_id(), "S03_fit_model");

    let soft = rx.recv().await.expect("soft timeout");
    assert_eq!(
        soft,
        WatchdogEvent::SoftTimeout {
            stage_id: "S03_fit_model".into(),
            elapsed_secs: 60,
        }
    );

    match rx.recv().await.expect("hard timeout") {
        WatchdogEvent::HardTimeout {
            elapsed_secs,
            idle_secs,
            ..
        } => {
            assert_eq!(elapsed_secs, 90);
            assert_eq!(idle_secs, 90);
        }
        other => panic!("expected hard timeout, got {other:?}"),
    }

    // The task ends after the hard timeout.
    assert!(rx.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn continuous_activity_prevents_timeouts() {
    let (handle, mut rx) = start(30);
    let until = Instant::now() + Duration::from_secs(300);

    while Instant::now() < until {
        tokio::select! {
            event = rx.recv() => panic!("unexpected watchdog event {event:?}"),
            () = tokio::time::sleep(Duration::from_secs(2)) => handle.record_activity(),
        }
    }

    handle.await_completion().await;
}

#[tokio::test(start_paused = true)]
async fn silence_after_activity_triggers_hard_timeout() {
    let (handle, mut rx) = start(30);
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.record_activity();
    }

    match rx.recv().await.expect("hard timeout") {
        WatchdogEvent::HardTimeout { idle_secs, .. } => assert!(idle_secs <= 10),
        other => panic!("expected hard timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn dropping_handle_stops_watchdog() {
    let (handle, mut rx) = start(30);
    drop(handle);
    assert!(rx.recv().await.is_none());
}
