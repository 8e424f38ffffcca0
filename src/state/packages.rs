//! Installed-package state via dpkg selections.

use async_trait::async_trait;

use super::{StateHandler, StateKind, StateSnapshot};
use crate::error::{BackupError, Result};
use crate::job::JobContext;
use crate::utils::cmd;

pub struct PackageState;

#[async_trait]
impl StateHandler for PackageState {
    fn kind(&self) -> StateKind {
        StateKind::Packages
    }

    async fn capture(&self, _ctx: &JobContext) -> Result<StateSnapshot> {
        let payload = cmd::run_capture("dpkg", &["--get-selections"])
            .await
            .map_err(|e| BackupError::Capture {
                kind: StateKind::Packages,
                cause: e.to_string(),
            })?;
        Ok(StateSnapshot {
            kind: StateKind::Packages,
            payload,
        })
    }

    /// `dpkg --set-selections` followed by `dselect-upgrade` converges to the
    /// captured selection set; already-installed packages are left alone, so
    /// a second run is a no-op.
    async fn apply(&self, _ctx: &JobContext, snapshot: &StateSnapshot) -> Result<()> {
        cmd::run_with_stdin("dpkg", &["--set-selections"], &snapshot.payload)
            .await
            .map_err(|e| BackupError::Apply {
                kind: StateKind::Packages,
                cause: e.to_string(),
            })?;
        cmd::run_capture("apt-get", &["dselect-upgrade", "-y"])
            .await
            .map_err(|e| BackupError::Apply {
                kind: StateKind::Packages,
                cause: e.to_string(),
            })?;
        Ok(())
    }
}
