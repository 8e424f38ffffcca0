//! Enabled systemd unit state.

use async_trait::async_trait;
use tracing::warn;

use super::{StateHandler, StateKind, StateSnapshot};
use crate::error::{BackupError, Result};
use crate::job::JobContext;
use crate::utils::cmd;

pub struct ServiceState;

/// Unit names marked `enabled` in a `systemctl list-unit-files` listing.
/// Header and footer lines do not have `enabled` in the second column.
pub fn parse_enabled_units(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let unit = parts.next()?;
            let state = parts.next()?;
            (state == "enabled").then(|| unit.to_string())
        })
        .collect()
}

#[async_trait]
impl StateHandler for ServiceState {
    fn kind(&self) -> StateKind {
        StateKind::Services
    }

    async fn capture(&self, _ctx: &JobContext) -> Result<StateSnapshot> {
        let payload = cmd::run_capture("systemctl", &["list-unit-files", "--state=enabled"])
            .await
            .map_err(|e| BackupError::Capture {
                kind: StateKind::Services,
                cause: e.to_string(),
            })?;
        Ok(StateSnapshot {
            kind: StateKind::Services,
            payload,
        })
    }

    /// `systemctl enable` on an already-enabled unit is a no-op, so the
    /// whole pass is idempotent. Units that no longer exist on the restored
    /// system are logged and skipped, not fatal.
    async fn apply(&self, _ctx: &JobContext, snapshot: &StateSnapshot) -> Result<()> {
        cmd::run_capture("systemctl", &["daemon-reload"])
            .await
            .map_err(|e| BackupError::Apply {
                kind: StateKind::Services,
                cause: e.to_string(),
            })?;

        let listing = String::from_utf8_lossy(&snapshot.payload);
        for unit in parse_enabled_units(&listing) {
            if let Err(e) = cmd::run_capture("systemctl", &["enable", &unit]).await {
                warn!("could not enable unit {}: {}", unit, e);
            }
        }
        Ok(())
    }
}
