//! Error taxonomy for the backup orchestrator.
//!
//! The classes matter for policy: transport errors are retried with bounded
//! backoff, data errors never are, and a locked repository is surfaced
//! distinctly so schedulers can tell "someone else is backing up" apart from
//! "the backup is broken". Underlying tool output is carried verbatim.

use thiserror::Error;

use crate::state::StateKind;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Fatal before any mutating action: unreachable repository, absent or
    /// rejected passphrase, missing external tool.
    #[error("preflight check failed: {0}")]
    Preflight(String),

    /// A pre/post hook failed. The orchestrator decides compensation.
    #[error("hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("state capture failed for {kind}: {cause}")]
    Capture { kind: StateKind, cause: String },

    #[error("state apply failed for {kind}: {cause}")]
    Apply { kind: StateKind, cause: String },

    /// Network or auth failure talking to the repository. Retriable.
    #[error("archive transport error: {0}")]
    ArchiveTransport(String),

    /// Corruption, decryption failure, duplicate archive id. Never retried.
    #[error("archive data error: {0}")]
    ArchiveData(String),

    /// Another job holds the repository lock. Fatal for this invocation.
    #[error("repository locked by another process: {0}")]
    RepositoryLocked(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid archive tag '{tag}': {reason}")]
    InvalidTag { tag: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// True for the one class that may be retried with bounded backoff.
    pub fn is_transport(&self) -> bool {
        matches!(self, BackupError::ArchiveTransport(_))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
