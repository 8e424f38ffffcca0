//! Container runtime stop/start around the capture window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::Hook;
use crate::error::{BackupError, Result};
use crate::job::JobContext;
use crate::utils::cmd;

/// Stops the configured runtime units before the snapshot window and starts
/// them again afterwards. Stop/start are idempotent at the systemctl level;
/// the hook additionally remembers whether it stopped anything so a restart
/// is only issued for units that were actually running.
pub struct ContainerHook {
    units: Vec<String>,
    ctl: String,
    stop_settle: Duration,
    start_settle: Duration,
    stopped: AtomicBool,
}

impl ContainerHook {
    pub fn new(units: Vec<String>, stop_settle_secs: u64, start_settle_secs: u64) -> Self {
        Self {
            units,
            ctl: "systemctl".to_string(),
            stop_settle: Duration::from_secs(stop_settle_secs),
            start_settle: Duration::from_secs(start_settle_secs),
            stopped: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    fn with_ctl(mut self, ctl: &str) -> Self {
        self.ctl = ctl.to_string();
        self
    }

    async fn unit_active(&self, unit: &str) -> Result<bool> {
        cmd::run_status(&self.ctl, &["is-active", "--quiet", unit]).await
    }
}

#[async_trait]
impl Hook for ContainerHook {
    fn name(&self) -> &str {
        "containers"
    }

    async fn pre(&self, _ctx: &JobContext) -> Result<()> {
        let mut stopped_any = false;
        for unit in &self.units {
            if !self.unit_active(unit).await? {
                info!("unit {} not active, leaving it alone", unit);
                continue;
            }
            info!("stopping {}", unit);
            cmd::run_capture(&self.ctl, &["stop", unit])
                .await
                .map_err(|e| BackupError::Hook {
                    hook: self.name().to_string(),
                    message: format!("stopping {unit}: {e}"),
                })?;
            stopped_any = true;
        }
        self.stopped.store(stopped_any, Ordering::SeqCst);
        if stopped_any {
            tokio::time::sleep(self.stop_settle).await;
        }
        Ok(())
    }

    async fn post(&self, _ctx: &JobContext) -> Result<()> {
        if !self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Reverse of stop order. A unit that refuses to start must not keep
        // the remaining ones down, so every start is attempted and the
        // failures are reported together.
        let mut failures = Vec::new();
        for unit in self.units.iter().rev() {
            info!("starting {}", unit);
            if let Err(e) = cmd::run_capture(&self.ctl, &["start", unit]).await {
                warn!("starting {} failed: {}", unit, e);
                failures.push(format!("starting {unit}: {e}"));
            }
        }
        tokio::time::sleep(self.start_settle).await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BackupError::Hook {
                hook: self.name().to_string(),
                message: failures.join("; "),
            })
        }
    }
}

/// Post-restore fixup for LXD guests: the agent loader must be reinstalled
/// after a whole-host restore or the VM loses its guest channel.
pub struct LxdAgentFixHook;

#[async_trait]
impl Hook for LxdAgentFixHook {
    fn name(&self) -> &str {
        "lxd-agent-fix"
    }

    async fn pre(&self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }

    async fn post(&self, _ctx: &JobContext) -> Result<()> {
        if !std::path::Path::new("/dev/vsock").exists() {
            return Ok(());
        }
        info!("vsock present, reinstalling lxd-agent-loader");
        cmd::run_capture("apt-get", &["install", "-y", "lxd-agent-loader"])
            .await
            .map_err(|e| BackupError::Hook {
                hook: self.name().to_string(),
                message: e.to_string(),
            })?;
        cmd::run_capture("systemctl", &["start", "lxd-agent"])
            .await
            .map_err(|e| BackupError::Hook {
                hook: self.name().to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobContext;
    use crate::progress::ProgressReporter;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tokio_util::sync::CancellationToken;

    fn test_ctx() -> JobContext {
        let (tx, _reporter) = ProgressReporter::channel();
        JobContext::new(tx, CancellationToken::new())
    }

    /// A stand-in unit controller that logs its invocations and refuses to
    /// start one particular unit.
    fn fake_ctl(dir: &std::path::Path, log: &std::path::Path, refuse: &str) -> String {
        let path = dir.join("fakectl");
        fs::write(
            &path,
            format!(
                "#!/bin/sh\necho \"$1 $2\" >> {}\nif [ \"$1\" = start ] && [ \"$2\" = {refuse} ]; then exit 1; fi\nexit 0\n",
                log.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn post_attempts_every_unit_despite_a_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let ctl = fake_ctl(dir.path(), &log, "containerd");

        let hook = ContainerHook::new(vec!["docker".to_string(), "containerd".to_string()], 0, 0)
            .with_ctl(&ctl);
        hook.stopped.store(true, Ordering::SeqCst);

        let err = hook.post(&test_ctx()).await.unwrap_err();

        let calls = fs::read_to_string(&log).unwrap();
        assert!(calls.contains("start containerd"));
        assert!(calls.contains("start docker"), "docker was never restarted");
        // Restart stays in reverse stop order.
        assert!(calls.find("start containerd").unwrap() < calls.find("start docker").unwrap());
        // Only the unit that actually failed shows up in the error.
        assert!(err.to_string().contains("containerd"));
        assert!(!err.to_string().contains("starting docker"));
    }

    #[tokio::test]
    async fn post_succeeds_when_every_unit_starts() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let ctl = fake_ctl(dir.path(), &log, "no-such-unit");

        let hook = ContainerHook::new(vec!["docker".to_string(), "containerd".to_string()], 0, 0)
            .with_ctl(&ctl);
        hook.stopped.store(true, Ordering::SeqCst);

        hook.post(&test_ctx()).await.unwrap();
        let calls = fs::read_to_string(&log).unwrap();
        assert_eq!(calls, "start containerd\nstart docker\n");
    }
}
