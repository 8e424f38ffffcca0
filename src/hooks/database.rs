//! Database dump/restore hooks.
//!
//! Dumps are staged inside the state directory so they travel with the
//! archive. The dump is not reversible mid-dump: on failure the half-written
//! file is deleted, never resumed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use super::Hook;
use crate::error::{BackupError, Result};
use crate::job::JobContext;
use crate::utils::cmd;

pub const MYSQL_DUMP_FILE: &str = "mysql_dump.sql";
pub const POSTGRES_DUMP_FILE: &str = "postgres_dump.sql";

fn remove_if_exists(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Pre: dump every database server whose dump client is installed.
/// Post: clear the staged dump files (they are part of the archive by then,
/// or worthless because the job failed).
pub struct DatabaseDumpHook {
    stage_dir: PathBuf,
}

impl DatabaseDumpHook {
    pub fn new(stage_dir: PathBuf) -> Self {
        Self { stage_dir }
    }

    async fn dump(
        &self,
        ctx: &JobContext,
        dest: &Path,
        program: &str,
        args: &[&str],
    ) -> Result<()> {
        ctx.check_cancelled()?;
        info!("dumping databases via {} to {}", program, dest.display());
        if let Err(e) = cmd::run_to_file(program, args, dest).await {
            // A partial dump must never survive.
            remove_if_exists(dest);
            return Err(BackupError::Hook {
                hook: "database-dump".to_string(),
                message: e.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Hook for DatabaseDumpHook {
    fn name(&self) -> &str {
        "database-dump"
    }

    fn is_reversible(&self) -> bool {
        false
    }

    async fn pre(&self, ctx: &JobContext) -> Result<()> {
        std::fs::create_dir_all(&self.stage_dir)?;

        if cmd::have_cmd("mysqldump") {
            self.dump(
                ctx,
                &self.stage_dir.join(MYSQL_DUMP_FILE),
                "mysqldump",
                &["--all-databases", "--single-transaction"],
            )
            .await?;
        }
        if cmd::have_cmd("pg_dumpall") {
            self.dump(
                ctx,
                &self.stage_dir.join(POSTGRES_DUMP_FILE),
                "sudo",
                &["-u", "postgres", "pg_dumpall"],
            )
            .await?;
        }
        Ok(())
    }

    async fn post(&self, _ctx: &JobContext) -> Result<()> {
        remove_if_exists(&self.stage_dir.join(MYSQL_DUMP_FILE));
        remove_if_exists(&self.stage_dir.join(POSTGRES_DUMP_FILE));
        Ok(())
    }
}

/// Pre: feed extracted dump files back into their servers, deleting each on
/// success. Post: clear leftovers.
pub struct DatabaseRestoreHook {
    state_dir: PathBuf,
}

impl DatabaseRestoreHook {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    async fn restore(
        &self,
        ctx: &JobContext,
        dump: &Path,
        program: &str,
        args: &[&str],
    ) -> Result<()> {
        ctx.check_cancelled()?;
        let payload = std::fs::read(dump)?;
        info!("restoring databases from {} via {}", dump.display(), program);
        cmd::run_with_stdin(program, args, &payload)
            .await
            .map_err(|e| BackupError::Hook {
                hook: "database-restore".to_string(),
                message: e.to_string(),
            })?;
        remove_if_exists(dump);
        Ok(())
    }
}

#[async_trait]
impl Hook for DatabaseRestoreHook {
    fn name(&self) -> &str {
        "database-restore"
    }

    async fn pre(&self, ctx: &JobContext) -> Result<()> {
        let mysql_dump = self.state_dir.join(MYSQL_DUMP_FILE);
        if mysql_dump.exists() && cmd::have_cmd("mysql") {
            self.restore(ctx, &mysql_dump, "mysql", &[]).await?;
        }

        let pg_dump = self.state_dir.join(POSTGRES_DUMP_FILE);
        if pg_dump.exists() && cmd::have_cmd("psql") {
            self.restore(ctx, &pg_dump, "sudo", &["-u", "postgres", "psql"])
                .await?;
        }
        Ok(())
    }

    async fn post(&self, _ctx: &JobContext) -> Result<()> {
        remove_if_exists(&self.state_dir.join(MYSQL_DUMP_FILE));
        remove_if_exists(&self.state_dir.join(POSTGRES_DUMP_FILE));
        Ok(())
    }
}
