//! Archive store client: the seam to the external deduplicating engine.
//!
//! The engine owns dedup, encryption and repository locking. This side only
//! needs create/list/extract/delete with a usable error taxonomy, plus a
//! retry policy that is applied to transport-class failures and nothing
//! else.

pub mod borg;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{BackupError, Result};
use crate::job::{JobContext, RestoreScope};

/// One archive as reported by the engine. The orchestrator reads these,
/// never mutates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    pub id: String,
    #[serde(default)]
    pub size: Option<u64>,
    pub created: DateTime<Utc>,
}

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Cheap reachability/credentials probe, run before any mutation.
    async fn check_reachable(&self, ctx: &JobContext) -> Result<()>;

    /// Create an archive from `paths`. Never retried by the adapter: a
    /// failed create must surface as-is, a partial archive is not valid.
    async fn create(
        &self,
        ctx: &JobContext,
        id: &str,
        paths: &[PathBuf],
        excludes: &[String],
    ) -> Result<ArchiveDescriptor>;

    /// Archives ordered by creation time, most recent last.
    async fn list(&self, ctx: &JobContext) -> Result<Vec<ArchiveDescriptor>>;

    /// Extract into `destination`, honoring a path scope and restore
    /// excludes.
    async fn extract(
        &self,
        ctx: &JobContext,
        id: &str,
        destination: &Path,
        scope: &RestoreScope,
        excludes: &[String],
    ) -> Result<()>;

    /// Render archive statistics (post-backup report).
    async fn info(&self, ctx: &JobContext, id: &str) -> Result<()>;

    async fn delete_one(&self, ctx: &JobContext, id: &str) -> Result<()>;

    /// Delete every archive and compact the repository.
    async fn delete_all(&self, ctx: &JobContext) -> Result<()>;
}

/// Retry `op` with exponential backoff, but only while it fails with a
/// transport-class error. Any other error, and the final transport error
/// once attempts are exhausted, propagate verbatim.
pub async fn with_retry<T, F, Fut>(
    ctx: &JobContext,
    retry: &RetryConfig,
    op_name: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = retry.max_attempts.max(1);
    let mut delay = Duration::from_millis(retry.base_delay_ms);

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transport() && attempt < attempts => {
                warn!(
                    "{} failed with transport error (attempt {}/{}), retrying in {:?}: {}",
                    op_name, attempt, attempts, delay, e
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancel_token().cancelled() => return Err(BackupError::Cancelled),
                }
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop returns on the final attempt");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressReporter;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn test_ctx() -> JobContext {
        let (tx, _reporter) = ProgressReporter::channel();
        JobContext::new(tx, CancellationToken::new())
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn transport_errors_are_retried_up_to_the_bound() {
        let ctx = test_ctx();
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&ctx, &fast_retry(3), "probe", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackupError::ArchiveTransport("connection refused".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(BackupError::ArchiveTransport(_))));
    }

    #[tokio::test]
    async fn transient_transport_error_recovers() {
        let ctx = test_ctx();
        let calls = AtomicU32::new(0);

        let result = with_retry(&ctx, &fast_retry(3), "list", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(BackupError::ArchiveTransport("reset".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn data_errors_are_never_retried() {
        let ctx = test_ctx();
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&ctx, &fast_retry(5), "extract", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackupError::ArchiveData("decryption failed".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(BackupError::ArchiveData(_))));
    }

    #[tokio::test]
    async fn locked_repository_is_never_retried() {
        let ctx = test_ctx();
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&ctx, &fast_retry(5), "list", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackupError::RepositoryLocked("lock held".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(BackupError::RepositoryLocked(_))));
    }
}
