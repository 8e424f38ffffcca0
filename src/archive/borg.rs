//! Borg adapter: drives the `borg` binary over its environment-based
//! repository wiring and turns its output into phase events and classified
//! errors.
//!
//! Engine stderr is both streamed live (progress) and kept as a bounded tail
//! so a failure can be reported with the tool's own words.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use super::{with_retry, ArchiveDescriptor, ArchiveStore};
use crate::config::{Config, RetryConfig};
use crate::error::{BackupError, Result};
use crate::job::{JobContext, RestoreScope};
use crate::progress::{Phase, PhaseStatus};

/// Lines of engine output retained for error reporting.
const STDERR_TAIL_LINES: usize = 40;

pub struct BorgStore {
    binary: String,
    repo_url: String,
    passphrase: String,
    ssh_key: Option<PathBuf>,
    compression: String,
    auto_init: bool,
    retry: RetryConfig,
}

impl BorgStore {
    pub fn new(config: &Config, passphrase: String) -> Self {
        Self {
            binary: config.repository.engine_binary.clone(),
            repo_url: config.repository.url.clone(),
            passphrase,
            ssh_key: config.repository.ssh_key.clone(),
            compression: config.backup.compression.clone(),
            auto_init: config.repository.auto_init,
            retry: config.retry.clone(),
        }
    }

    fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("BORG_REPO".to_string(), self.repo_url.clone()),
            ("BORG_PASSPHRASE".to_string(), self.passphrase.clone()),
            (
                "BORG_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK".to_string(),
                "yes".to_string(),
            ),
        ];
        if let Some(key) = &self.ssh_key {
            env.push((
                "BORG_RSH".to_string(),
                format!("ssh -i {} -o StrictHostKeyChecking=no", key.display()),
            ));
        }
        env
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).envs(self.env()).stdin(Stdio::null());
        cmd
    }

    /// Run a short engine command, capturing stdout. Errors are classified
    /// from the exit status and stderr.
    async fn run_quiet(&self, args: &[String]) -> Result<String> {
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| BackupError::Preflight(format!("cannot launch {}: {e}", self.binary)))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_failure(
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    /// Run a long engine command, streaming every output line as a
    /// `PhaseEvent`. Cancellation kills the child; the caller decides what
    /// compensation that implies.
    async fn run_streamed(
        &self,
        ctx: &JobContext,
        phase: Phase,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<()> {
        let mut cmd = self.command(args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BackupError::Preflight(format!("cannot launch {}: {e}", self.binary)))?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, ctx.clone(), phase, Arc::clone(&tail)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, ctx.clone(), phase, Arc::clone(&tail)));
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = ctx.cancel_token().cancelled() => {
                warn!("cancelling engine invocation");
                let _ = child.kill().await;
                for reader in readers {
                    let _ = reader.await;
                }
                return Err(BackupError::Cancelled);
            }
        };
        for reader in readers {
            let _ = reader.await;
        }

        if status.success() {
            Ok(())
        } else {
            let tail = tail.lock().expect("tail lock");
            let stderr: Vec<String> = tail.iter().cloned().collect();
            Err(classify_failure(status.code(), &stderr.join("\n")))
        }
    }

    async fn init_repo(&self, ctx: &JobContext) -> Result<()> {
        info!("repository not found, initializing {}", self.repo_url);
        self.run_streamed(
            ctx,
            Phase::Precheck,
            &[
                "init".to_string(),
                "--encryption".to_string(),
                "repokey-blake2".to_string(),
            ],
            None,
        )
        .await
    }
}

fn spawn_line_reader<R>(
    stream: R,
    ctx: JobContext,
    phase: Phase,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            ctx.emit(phase, PhaseStatus::Output(line.clone()));
            let mut tail = tail.lock().expect("tail lock");
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

/// Map an engine failure to the error taxonomy from its exit status and
/// stderr, carrying the tool's own message verbatim.
pub fn classify_failure(exit_code: Option<i32>, stderr: &str) -> BackupError {
    let message = match exit_code {
        Some(code) => format!("engine exited with status {code}: {}", stderr.trim()),
        None => format!("engine killed by signal: {}", stderr.trim()),
    };
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("failed to create/acquire the lock")
        || lower.contains("lock timeout")
        || lower.contains("lockerror")
    {
        return BackupError::RepositoryLocked(message);
    }
    // Duplicate archive id: fatal, never auto-renamed, never retried.
    if lower.contains("archive already exists") || lower.contains("already exists") {
        return BackupError::ArchiveData(message);
    }
    if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("connection closed")
        || lower.contains("broken pipe")
        || lower.contains("timed out")
        || lower.contains("temporary failure")
        || lower.contains("name or service not known")
        || lower.contains("ssh:")
        || lower.contains("permission denied (publickey")
        || lower.contains("passphrase")
        || lower.contains("authentication")
    {
        return BackupError::ArchiveTransport(message);
    }
    // Corruption, decryption, integrity: data-class, and so is anything we
    // cannot positively identify as transport.
    BackupError::ArchiveData(message)
}

/// True when stderr says the repository itself is missing (auto-init case),
/// as opposed to unreachable or broken.
pub fn stderr_indicates_missing_repo(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("does not exist") || lower.contains("is not a valid repository")
}

/// Parse `borg list --json` output into descriptors ordered by creation
/// time, most recent last.
pub fn parse_list_output(json: &str) -> Result<Vec<ArchiveDescriptor>> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let archives = value
        .get("archives")
        .and_then(|a| a.as_array())
        .ok_or_else(|| {
            BackupError::ArchiveData("engine list output missing 'archives' array".to_string())
        })?;

    let mut result = Vec::with_capacity(archives.len());
    for entry in archives {
        let id = entry
            .get("name")
            .or_else(|| entry.get("archive"))
            .and_then(|n| n.as_str())
            .ok_or_else(|| {
                BackupError::ArchiveData("engine list entry missing archive name".to_string())
            })?
            .to_string();
        let created = entry
            .get("time")
            .or_else(|| entry.get("start"))
            .and_then(|t| t.as_str())
            .and_then(parse_engine_time)
            .ok_or_else(|| {
                BackupError::ArchiveData(format!("engine list entry for '{id}' has no timestamp"))
            })?;
        result.push(ArchiveDescriptor {
            id,
            size: None,
            created,
        });
    }
    result.sort_by_key(|d| d.created);
    Ok(result)
}

fn parse_engine_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Borg emits local naive timestamps like `2026-01-25T15:05:12.000000`.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[async_trait]
impl ArchiveStore for BorgStore {
    async fn check_reachable(&self, ctx: &JobContext) -> Result<()> {
        let probe = with_retry(ctx, &self.retry, "repository probe", || async {
            self.run_quiet(&["list".to_string(), "--short".to_string()])
                .await
                .map(|_| ())
        })
        .await;

        match probe {
            Ok(()) => Ok(()),
            Err(BackupError::ArchiveData(msg))
                if self.auto_init && stderr_indicates_missing_repo(&msg) =>
            {
                self.init_repo(ctx).await
            }
            Err(e) => Err(e),
        }
    }

    async fn create(
        &self,
        ctx: &JobContext,
        id: &str,
        paths: &[PathBuf],
        excludes: &[String],
    ) -> Result<ArchiveDescriptor> {
        let mut args = vec![
            "create".to_string(),
            format!("::{id}"),
        ];
        args.extend(paths.iter().map(|p| p.display().to_string()));
        args.extend([
            "--stats".to_string(),
            "--progress".to_string(),
            "--compression".to_string(),
            self.compression.clone(),
            "--exclude-caches".to_string(),
        ]);
        for exclude in excludes {
            args.push("--exclude".to_string());
            args.push(exclude.clone());
        }

        // Single attempt only. A failed create is reported verbatim; a
        // partial archive must never pass as valid.
        self.run_streamed(ctx, Phase::Archive, &args, None).await?;

        Ok(ArchiveDescriptor {
            id: id.to_string(),
            size: None,
            created: Utc::now(),
        })
    }

    async fn list(&self, ctx: &JobContext) -> Result<Vec<ArchiveDescriptor>> {
        let json = with_retry(ctx, &self.retry, "archive list", || async {
            self.run_quiet(&["list".to_string(), "--json".to_string()])
                .await
        })
        .await?;
        parse_list_output(&json)
    }

    async fn extract(
        &self,
        ctx: &JobContext,
        id: &str,
        destination: &Path,
        scope: &RestoreScope,
        excludes: &[String],
    ) -> Result<()> {
        let mut args = vec![
            "extract".to_string(),
            format!("::{id}"),
            "--list".to_string(),
        ];
        for exclude in excludes {
            args.push("--exclude".to_string());
            args.push(exclude.clone());
        }
        if let RestoreScope::Paths(paths) = scope {
            // Archived paths have no leading slash.
            for path in paths {
                let rel = path.strip_prefix("/").unwrap_or(path);
                args.push(rel.display().to_string());
            }
        }

        with_retry(ctx, &self.retry, "archive extract", || async {
            self.run_streamed(ctx, Phase::Extract, &args, Some(destination))
                .await
        })
        .await
    }

    async fn info(&self, ctx: &JobContext, id: &str) -> Result<()> {
        self.run_streamed(
            ctx,
            Phase::Repository,
            &["info".to_string(), format!("::{id}")],
            None,
        )
        .await?;
        self.run_streamed(
            ctx,
            Phase::Repository,
            &[
                "list".to_string(),
                format!("::{id}"),
                "--last".to_string(),
                "5".to_string(),
            ],
            None,
        )
        .await
    }

    async fn delete_one(&self, ctx: &JobContext, id: &str) -> Result<()> {
        self.run_streamed(
            ctx,
            Phase::Repository,
            &[
                "delete".to_string(),
                format!("::{id}"),
                "--stats".to_string(),
            ],
            None,
        )
        .await
    }

    async fn delete_all(&self, ctx: &JobContext) -> Result<()> {
        self.run_streamed(
            ctx,
            Phase::Repository,
            &[
                "delete".to_string(),
                "--progress".to_string(),
                "--stats".to_string(),
                "--glob-archives".to_string(),
                "*".to_string(),
            ],
            None,
        )
        .await?;
        self.run_streamed(ctx, Phase::Repository, &["compact".to_string()], None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_failures_classify_as_repository_locked() {
        let err = classify_failure(
            Some(2),
            "Failed to create/acquire the lock /repo/lock.exclusive (timeout).",
        );
        assert!(matches!(err, BackupError::RepositoryLocked(_)));
    }

    #[test]
    fn network_and_auth_failures_classify_as_transport() {
        for stderr in [
            "ssh: connect to host vault port 22: Connection refused",
            "Connection closed by remote host",
            "passphrase supplied in BORG_PASSPHRASE is incorrect",
            "Remote: Permission denied (publickey).",
        ] {
            let err = classify_failure(Some(2), stderr);
            assert!(
                matches!(err, BackupError::ArchiveTransport(_)),
                "{stderr} should be transport"
            );
        }
    }

    #[test]
    fn corruption_and_unknown_failures_classify_as_data() {
        for stderr in [
            "Data integrity error: invalid object in segment",
            "some totally unrecognized failure",
        ] {
            let err = classify_failure(Some(2), stderr);
            assert!(matches!(err, BackupError::ArchiveData(_)), "{stderr}");
        }
    }

    #[test]
    fn duplicate_archive_id_is_a_fatal_data_error() {
        let err = classify_failure(Some(2), "Archive already exists");
        assert!(matches!(err, BackupError::ArchiveData(_)));
    }

    #[test]
    fn verbatim_stderr_is_preserved() {
        let err = classify_failure(Some(2), "Connection refused by peer xyzzy");
        assert!(err.to_string().contains("Connection refused by peer xyzzy"));
        assert!(err.to_string().contains("status 2"));
    }

    #[test]
    fn missing_repo_detection() {
        assert!(stderr_indicates_missing_repo(
            "Repository /srv/backup does not exist."
        ));
        assert!(!stderr_indicates_missing_repo("Connection refused"));
    }

    #[test]
    fn list_output_parses_and_orders_by_creation_time() {
        let json = r#"{
            "archives": [
                {"name": "2026-Jan-25_15-05-12-nightly", "time": "2026-01-25T15:05:12.000000"},
                {"name": "2026-Jan-24_03-00-01", "time": "2026-01-24T03:00:01.000000"},
                {"name": "2026-Jan-26_03-00-02", "time": "2026-01-26T03:00:02.000000"}
            ],
            "repository": {"id": "abc"}
        }"#;
        let archives = parse_list_output(json).unwrap();
        assert_eq!(archives.len(), 3);
        // Most recent last.
        assert_eq!(archives[0].id, "2026-Jan-24_03-00-01");
        assert_eq!(archives[2].id, "2026-Jan-26_03-00-02");
        assert!(archives.windows(2).all(|w| w[0].created <= w[1].created));
    }

    #[test]
    fn list_output_without_archives_is_an_error() {
        assert!(parse_list_output("{}").is_err());
        assert!(parse_list_output(r#"{"archives": []}"#).unwrap().is_empty());
    }

    #[tokio::test]
    async fn maintenance_commands_stream_under_the_repository_phase() {
        use std::os::unix::fs::PermissionsExt;
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("engine");
        std::fs::write(&fake, "#!/bin/sh\necho \"deleted $*\"\nexit 0\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::with_repository("/srv/backup".to_string());
        config.repository.engine_binary = fake.display().to_string();
        let store = BorgStore::new(&config, "secret".to_string());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = JobContext::new(tx, CancellationToken::new());
        store.delete_all(&ctx).await.unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            phases.push(event.phase);
        }
        assert!(!phases.is_empty());
        assert!(
            phases.iter().all(|p| *p == Phase::Repository),
            "standalone maintenance output must not masquerade as a job phase"
        );
    }
}
