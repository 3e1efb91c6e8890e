//! Process supervision for running stages.
//!
//! A [`Watchdog`] watches wall-clock time and activity, [`escalate`] stops an
//! unresponsive process through bounded signal phases, and
//! [`StageSupervisor`] combines both with emergency checkpoints.

pub mod escalation;
pub mod line_codec;
pub mod process;
pub mod stage_supervisor;
pub mod watchdog;

pub use escalation::{escalate, EscalationOutcome, EscalationPolicy, TerminationSignal};
pub use line_codec::StageLineCodec;
pub use process::{ChildProcess, ExitState, ProcessControl};
pub use stage_supervisor::{
    OutputLine, OutputStream, StageHandles, StageReport, StageSupervisor, SupervisorConfig,
};
pub use watchdog::{Watchdog, WatchdogEvent, WatchdogHandle};
