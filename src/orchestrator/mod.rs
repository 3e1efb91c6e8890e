//! Checkpoint orchestration.
//!
//! Covers the on-disk layout, checkpoint persistence and resume, rehydration
//! code generation, the run lock, and the executor seam.

pub mod checkpoint_manager;
pub mod executor;
pub mod layout;
pub mod rehydration;
pub mod run_lock;

pub use checkpoint_manager::{
    CheckpointManager, EmergencyDetails, ResumeOutcome, RunHandle, SaveRequest,
    DEFAULT_KEEP_COUNT,
};
pub use layout::ProjectLayout;
pub use run_lock::RunLock;
