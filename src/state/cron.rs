//! Root crontab state.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{StateHandler, StateKind, StateSnapshot};
use crate::error::{BackupError, Result};
use crate::job::JobContext;
use crate::utils::cmd;

pub struct CronState;

#[async_trait]
impl StateHandler for CronState {
    fn kind(&self) -> StateKind {
        StateKind::Cron
    }

    /// An absent crontab is not an error; `crontab -l` exits non-zero with
    /// "no crontab for ..." and we capture an empty snapshot.
    async fn capture(&self, _ctx: &JobContext) -> Result<StateSnapshot> {
        let output = Command::new("crontab")
            .arg("-l")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackupError::Capture {
                kind: StateKind::Cron,
                cause: e.to_string(),
            })?;

        let payload = if output.status.success() {
            output.stdout
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no crontab") {
                Vec::new()
            } else {
                return Err(BackupError::Capture {
                    kind: StateKind::Cron,
                    cause: stderr.trim().to_string(),
                });
            }
        };

        Ok(StateSnapshot {
            kind: StateKind::Cron,
            payload,
        })
    }

    /// `crontab -` replaces the whole table, so reapplying is idempotent by
    /// construction.
    async fn apply(&self, _ctx: &JobContext, snapshot: &StateSnapshot) -> Result<()> {
        cmd::run_with_stdin("crontab", &["-"], &snapshot.payload)
            .await
            .map_err(|e| BackupError::Apply {
                kind: StateKind::Cron,
                cause: e.to_string(),
            })
    }
}
