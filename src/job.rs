//! Job descriptors, outcomes and the per-run context object.
//!
//! A `BackupJob` is immutable once the phase machine starts. The `JobContext`
//! is passed to every component instead of ambient global state, so several
//! orchestrator instances can coexist in-process (tests rely on this).

use chrono::{DateTime, Local};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BackupError, Result};
use crate::progress::{EventSender, Phase, PhaseEvent, PhaseStatus};

/// Characters that may not appear in an archive tag: path separators plus
/// characters the archive engine reserves for globs and placeholders.
const TAG_RESERVED: &[char] = &['/', '\\', ':', '*', '?', '{', '}', '[', ']', '"', '\'', '\n', '\t'];

/// How much of the host a backup covers, and how strict state capture is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    /// Whole-host backup. Any state-capture failure aborts the job.
    Full,
    /// Selected paths, best-effort state capture (failures become warnings).
    Partial,
}

/// One backup invocation. Immutable once the phase machine starts.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub target_paths: Vec<PathBuf>,
    pub tag: Option<String>,
    pub timestamp: DateTime<Local>,
    pub mode: JobMode,
}

impl BackupJob {
    pub fn new(target_paths: Vec<PathBuf>, tag: Option<String>, mode: JobMode) -> Result<Self> {
        if let Some(ref tag) = tag {
            validate_tag(tag)?;
        }
        Ok(Self {
            target_paths,
            tag,
            timestamp: Local::now(),
            mode,
        })
    }

    /// Archive identifier: `YYYY-Mon-DD_HH-MM-SS[-tag]`.
    /// Collisions are the repository's problem; a duplicate-id failure on
    /// create is fatal, never auto-renamed.
    pub fn archive_id(&self) -> String {
        let stamp = self.timestamp.format("%Y-%b-%d_%H-%M-%S");
        match &self.tag {
            Some(tag) => format!("{stamp}-{tag}"),
            None => stamp.to_string(),
        }
    }
}

pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(BackupError::InvalidTag {
            tag: tag.to_string(),
            reason: "tag is empty".to_string(),
        });
    }
    if tag.trim() != tag {
        return Err(BackupError::InvalidTag {
            tag: tag.to_string(),
            reason: "leading or trailing whitespace".to_string(),
        });
    }
    if let Some(c) = tag.chars().find(|c| TAG_RESERVED.contains(c)) {
        return Err(BackupError::InvalidTag {
            tag: tag.to_string(),
            reason: format!("reserved character {c:?}"),
        });
    }
    Ok(())
}

/// Terminal outcome of a job. Exit codes are distinct so an unattended
/// scheduler can alert on degraded runs without treating them as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    /// Data archived/restored, but a post-hook failed to fully resume
    /// normal operation.
    DegradedSuccess,
    Failed,
}

impl JobOutcome {
    /// 2 is left to clap for usage errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            JobOutcome::Success => 0,
            JobOutcome::DegradedSuccess => 3,
            JobOutcome::Failed => 1,
        }
    }
}

/// What the orchestrator hands back for a finished (non-failed) job.
#[derive(Debug)]
pub struct JobReport {
    pub outcome: JobOutcome,
    pub warnings: Vec<String>,
    /// Archive that was created (backup) or restored from (restore).
    pub archive_id: Option<String>,
}

impl JobReport {
    pub fn success(archive_id: Option<String>, warnings: Vec<String>) -> Self {
        Self {
            outcome: JobOutcome::Success,
            warnings,
            archive_id,
        }
    }

    pub fn degraded(archive_id: Option<String>, warnings: Vec<String>) -> Self {
        Self {
            outcome: JobOutcome::DegradedSuccess,
            warnings,
            archive_id,
        }
    }
}

/// Which part of the archive a restore touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreScope {
    All,
    /// Only the given paths are extracted; state kinds whose snapshots fall
    /// outside the selection are not reapplied.
    Paths(Vec<PathBuf>),
}

/// Consumed once by the restore path.
#[derive(Debug, Clone)]
pub struct RestoreSelection {
    pub archive_id: String,
    pub target: PathBuf,
    pub scope: RestoreScope,
}

/// Per-run context threaded through every component: progress event sink and
/// cooperative cancellation. No global mutable state.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run_id: Uuid,
    events: EventSender,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(events: EventSender, cancel: CancellationToken) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            events,
            cancel,
        }
    }

    /// Fire-and-forget: the reporter draining the channel must never be able
    /// to block the orchestrator, so send failures are ignored.
    pub fn emit(&self, phase: Phase, status: PhaseStatus) {
        let _ = self.events.send(PhaseEvent { phase, status });
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(BackupError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn archive_id_includes_tag_and_timestamp() {
        let ts = Local.with_ymd_and_hms(2026, 1, 25, 15, 5, 12).unwrap();
        let job = BackupJob {
            target_paths: vec![PathBuf::from("/")],
            tag: Some("nightly".to_string()),
            timestamp: ts,
            mode: JobMode::Full,
        };
        assert_eq!(job.archive_id(), "2026-Jan-25_15-05-12-nightly");
    }

    #[test]
    fn archive_id_without_tag() {
        let ts = Local.with_ymd_and_hms(2026, 1, 25, 15, 5, 12).unwrap();
        let job = BackupJob {
            target_paths: vec![PathBuf::from("/")],
            tag: None,
            timestamp: ts,
            mode: JobMode::Partial,
        };
        assert_eq!(job.archive_id(), "2026-Jan-25_15-05-12");
    }

    #[test]
    fn tag_validation_rejects_reserved_characters() {
        assert!(validate_tag("nightly").is_ok());
        assert!(validate_tag("pre-upgrade_2").is_ok());
        for bad in ["a/b", "a\\b", "a:b", "a*b", "a?b", "{now}", "a[1]", "", " pad "] {
            assert!(validate_tag(bad).is_err(), "tag {bad:?} should be rejected");
        }
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            JobOutcome::Success.exit_code(),
            JobOutcome::DegradedSuccess.exit_code(),
            JobOutcome::Failed.exit_code(),
        ];
        assert_eq!(codes[0], 0);
        assert_ne!(codes[1], codes[0]);
        assert_ne!(codes[1], codes[2]);
        assert_ne!(codes[2], codes[0]);
    }
}
