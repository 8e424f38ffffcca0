//! Host Backup Library
//!
//! Full-system backup/restore orchestration over an external deduplicating,
//! encrypted archive engine: phase state machine, hook compensation, system
//! state capture/reapply, and progress plumbing.

pub mod archive;
pub mod config;
pub mod error;
pub mod hooks;
pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod restore;
pub mod state;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::BackupError;
pub use job::{BackupJob, JobContext, JobMode, JobOutcome, JobReport};
pub type Result<T> = std::result::Result<T, BackupError>;
