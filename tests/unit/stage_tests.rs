//! Unit tests for stage identifiers, envelopes, and the lifecycle state machine.

use research_checkpoint::models::stage::{StageEnvelope, StageId, StageState};

#[test]
fn next_stage_prefix_increments_sequence() {
    let cases = [
        ("S05_save_results", Some("S06_")),
        ("S09_final_step", Some("S10_")),
        ("S00_load_data", Some("S01_")),
        ("S99_wrap_up", None),
    ];
    for (raw, expected) in cases {
        let id = StageId::parse(raw).expect("valid id");
        assert_eq!(id.next_prefix().as_deref(), expected, "{raw}");
    }
}

#[test]
fn sequence_reads_two_digits() {
    assert_eq!(StageId::parse("S42_fit_model").expect("id").sequence(), 42);
}

#[test]
fn stage_id_deserializes_through_validation() {
    let ok: Result<StageId, _> = serde_json::from_str("\"S01_load_data\"");
    assert!(ok.is_ok());

    let bad: Result<StageId, _> = serde_json::from_str("\"load_data\"");
    assert!(bad.is_err());
}

// ── Envelope validation ──────────────────────────────────────

fn envelope() -> StageEnvelope {
    let mut env = StageEnvelope::new("S02_eda_analysis", "Explore churn distributions");
    env.outputs.insert(
        "summary".into(),
        "reports/churn/run-1/S02_eda_analysis/summary.parquet".into(),
    );
    env
}

#[test]
fn envelope_defaults_follow_protocol() {
    let env: StageEnvelope = serde_json::from_str(
        r#"{"stageId": "S01_load_data", "goal": "Load the raw churn export"}"#,
    )
    .expect("parse");

    assert_eq!(env.max_duration_sec, 240);
    assert!(env.retryable);
    assert!(env.checkpoint_after);
    assert!(env.dependencies.is_empty());
}

#[test]
fn valid_envelope_returns_stage_id() {
    let id = envelope().validate().expect("valid");
    assert_eq!(id.as_str(), "S02_eda_analysis");
}

#[test]
fn malformed_envelope_reports_every_field() {
    let mut env = envelope();
    env.stage_id = "eda".into();
    env.goal = "short".into();
    env.max_duration_sec = 601;
    env.dependencies.push("S1_bad".into());
    env.inputs.insert("raw".into(), "../outside.csv".into());

    let fields: Vec<String> = env
        .validate()
        .expect_err("invalid")
        .into_iter()
        .map(|e| e.field)
        .collect();

    for expected in ["stageId", "goal", "maxDurationSec", "dependencies", "inputs"] {
        assert!(fields.contains(&expected.to_owned()), "missing {expected}");
    }
}

#[test]
fn duration_bounds_are_inclusive() {
    let mut env = envelope();
    env.max_duration_sec = 30;
    assert!(env.validate().is_ok());
    env.max_duration_sec = 600;
    assert!(env.validate().is_ok());
    env.max_duration_sec = 29;
    assert!(env.validate().is_err());
}

// ── State machine ────────────────────────────────────────────

#[test]
fn permitted_transitions() {
    use StageState::{
        Blocked, Completed, Failed, Interrupted, Interrupting, Pending, Resumable, Running,
    };

    let allowed = [
        (Pending, Running),
        (Running, Completed),
        (Running, Interrupting),
        (Running, Failed),
        (Interrupting, Interrupted),
        (Interrupted, Resumable),
        (Interrupted, Blocked),
        (Failed, Resumable),
        (Failed, Blocked),
    ];
    for (from, to) in allowed {
        assert!(from.can_transition_to(to), "{from:?} -> {to:?}");
    }

    let forbidden = [
        (Pending, Completed),
        (Completed, Running),
        (Running, Interrupted),
        (Interrupting, Blocked),
        (Resumable, Running),
        (Blocked, Resumable),
    ];
    for (from, to) in forbidden {
        assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
    }
}

#[test]
fn terminal_states() {
    assert!(StageState::Completed.is_terminal());
    assert!(StageState::Resumable.is_terminal());
    assert!(StageState::Blocked.is_terminal());
    assert!(!StageState::Interrupted.is_terminal());
    assert!(!StageState::Failed.is_terminal());
}
