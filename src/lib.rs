#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod integrity;
pub mod markers;
pub mod models;
pub mod notebook;
pub mod orchestrator;
pub mod supervisor;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
