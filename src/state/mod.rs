//! Non-filesystem system state: capture and reapplication.
//!
//! Each state kind (packages, services, cron) is captured into an opaque
//! snapshot blob written into the state directory inside the backup source
//! tree, and read back during restore. The blob format is private to the
//! (capture, apply) pair of the same kind and never interpreted elsewhere.
//!
//! Reapplication converges: applying the same snapshot twice leaves the
//! system in the same observable state as applying it once.

pub mod cron;
pub mod packages;
pub mod services;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::job::JobContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Packages,
    Services,
    Cron,
}

impl StateKind {
    /// Snapshot file name inside the state directory.
    pub fn snapshot_file(&self) -> &'static str {
        match self {
            StateKind::Packages => "packages.list",
            StateKind::Services => "services.list",
            StateKind::Cron => "crontab.backup",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKind::Packages => "packages",
            StateKind::Services => "services",
            StateKind::Cron => "cron",
        };
        f.write_str(name)
    }
}

/// One captured blob. Payload bytes are opaque outside the owning handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub kind: StateKind,
    pub payload: Vec<u8>,
}

/// Capture/apply pair for one state kind.
#[async_trait]
pub trait StateHandler: Send + Sync {
    fn kind(&self) -> StateKind;

    async fn capture(&self, ctx: &JobContext) -> Result<StateSnapshot>;

    /// Must be idempotent against a system that already partially or fully
    /// matches the snapshot.
    async fn apply(&self, ctx: &JobContext, snapshot: &StateSnapshot) -> Result<()>;
}

/// Real handlers for the configured kinds.
pub fn handlers_for(kinds: &[StateKind]) -> Vec<Box<dyn StateHandler>> {
    kinds
        .iter()
        .map(|kind| -> Box<dyn StateHandler> {
            match kind {
                StateKind::Packages => Box::new(packages::PackageState),
                StateKind::Services => Box::new(services::ServiceState),
                StateKind::Cron => Box::new(cron::CronState),
            }
        })
        .collect()
}

pub fn write_snapshot(state_dir: &Path, snapshot: &StateSnapshot) -> Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let path = state_dir.join(snapshot.kind.snapshot_file());
    std::fs::write(path, &snapshot.payload)?;
    Ok(())
}

/// Read a snapshot back if its file exists; `None` means the kind was not
/// captured (or not extracted, for a path-scoped restore).
pub fn read_snapshot(state_dir: &Path, kind: StateKind) -> Result<Option<StateSnapshot>> {
    let path = state_dir.join(kind.snapshot_file());
    if !path.exists() {
        return Ok(None);
    }
    let payload = std::fs::read(path)?;
    Ok(Some(StateSnapshot { kind, payload }))
}

/// Where the state directory of an archived tree lands after extraction
/// into `destination` (the engine strips the leading `/`).
pub fn extracted_state_dir(destination: &Path, state_dir: &Path) -> PathBuf {
    match state_dir.strip_prefix("/") {
        Ok(rel) => destination.join(rel),
        Err(_) => destination.join(state_dir),
    }
}

/// Capture every kind, writing snapshots into `state_dir`. Returns the kinds
/// captured and the per-kind failures; strictness policy belongs to the
/// orchestrator, not here.
pub async fn capture_all(
    ctx: &JobContext,
    handlers: &[Box<dyn StateHandler>],
    state_dir: &Path,
) -> (Vec<StateKind>, Vec<(StateKind, String)>) {
    let mut captured = Vec::new();
    let mut failures = Vec::new();

    for handler in handlers {
        let kind = handler.kind();
        match handler.capture(ctx).await {
            Ok(snapshot) => match write_snapshot(state_dir, &snapshot) {
                Ok(()) => {
                    info!("captured {} state ({} bytes)", kind, snapshot.payload.len());
                    captured.push(kind);
                }
                Err(e) => {
                    warn!("failed to write {} snapshot: {}", kind, e);
                    failures.push((kind, e.to_string()));
                }
            },
            Err(e) => {
                warn!("failed to capture {} state: {}", kind, e);
                failures.push((kind, e.to_string()));
            }
        }
    }

    (captured, failures)
}

/// Apply every kind whose snapshot file is present under `state_dir`.
/// Kinds without a snapshot are skipped, which is what makes path-scoped
/// restores naturally skip unrelated state.
pub async fn apply_present(
    ctx: &JobContext,
    handlers: &[Box<dyn StateHandler>],
    state_dir: &Path,
) -> (Vec<StateKind>, Vec<(StateKind, String)>) {
    let mut applied = Vec::new();
    let mut failures = Vec::new();

    for handler in handlers {
        let kind = handler.kind();
        let snapshot = match read_snapshot(state_dir, kind) {
            Ok(Some(s)) => s,
            Ok(None) => {
                info!("no {} snapshot in extracted tree, skipping", kind);
                continue;
            }
            Err(e) => {
                failures.push((kind, e.to_string()));
                continue;
            }
        };
        match handler.apply(ctx, &snapshot).await {
            Ok(()) => {
                info!("reapplied {} state", kind);
                applied.push(kind);
            }
            Err(e) => {
                warn!("failed to reapply {} state: {}", kind, e);
                failures.push((kind, e.to_string()));
            }
        }
    }

    (applied, failures)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trips_through_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = StateSnapshot {
            kind: StateKind::Cron,
            payload: b"0 3 * * * /usr/local/bin/host-backup backup\n".to_vec(),
        };
        write_snapshot(dir.path(), &snapshot).unwrap();
        let read = read_snapshot(dir.path(), StateKind::Cron).unwrap().unwrap();
        assert_eq!(read, snapshot);
    }

    #[test]
    fn missing_snapshot_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_snapshot(dir.path(), StateKind::Packages)
            .unwrap()
            .is_none());
    }

    #[test]
    fn extracted_state_dir_strips_leading_slash() {
        let dest = Path::new("/mnt/restore");
        let state_dir = Path::new("/var/lib/host-backup/state");
        assert_eq!(
            extracted_state_dir(dest, state_dir),
            PathBuf::from("/mnt/restore/var/lib/host-backup/state")
        );
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(StateKind::Packages.snapshot_file(), "packages.list");
        assert_eq!(StateKind::Services.snapshot_file(), "services.list");
        assert_eq!(StateKind::Cron.snapshot_file(), "crontab.backup");
    }
}
