//! Host Backup - Main entry point
//!
//! Full-system backup/restore orchestrator driving an external
//! deduplicating archive engine.

use anyhow::Result;
use clap::{Parser, Subcommand};
use host_backup::archive::borg::BorgStore;
use host_backup::archive::ArchiveStore;
use host_backup::hooks::{self, HookManager};
use host_backup::job::{JobContext, RestoreScope};
use host_backup::orchestrator::Orchestrator;
use host_backup::progress::ProgressReporter;
use host_backup::restore::{self, RestoreCoordinator};
use host_backup::{state, utils, BackupError, BackupJob, Config, JobMode, JobOutcome};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Repository location (overrides config)
    #[arg(long)]
    repo: Option<String>,

    /// SSH identity file for remote repositories (overrides config)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Repository passphrase (otherwise BORG_PASSPHRASE or a prompt)
    #[arg(long)]
    password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Append log output to this file as well
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a backup of the host
    Backup {
        /// Paths to archive (defaults to the configured target paths)
        paths: Vec<PathBuf>,

        /// Free-form tag appended to the archive id
        #[arg(short, long)]
        tag: Option<String>,

        /// Best-effort state capture instead of strict whole-host mode
        #[arg(long)]
        partial: bool,
    },

    /// Restore an archive onto the host
    Restore {
        /// Archive id (otherwise an interactive listing is shown)
        archive: Option<String>,

        /// Directory the archive is extracted into
        #[arg(long, default_value = "/")]
        target: PathBuf,

        /// Restore only these paths from the archive
        #[arg(long = "path")]
        paths: Vec<PathBuf>,

        /// Skip the overwrite confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// List archives in the repository, most recent first
    List,

    /// Show statistics for one archive
    Info { archive: String },

    /// Delete one archive
    Delete { archive: String },

    /// Delete every archive and compact the repository
    ClearAll {
        /// Skip the typed confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match (&args.config, &args.repo) {
        (Some(path), _) => Config::from_file(path)?,
        (None, Some(repo)) => Config::with_repository(repo.clone()),
        (None, None) => {
            anyhow::bail!("either --config or --repo is required");
        }
    };
    if let Some(repo) = args.repo {
        config.repository.url = repo;
    }
    if let Some(key) = args.key {
        config.repository.ssh_key = Some(key);
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let log_file = args.log_file.clone().or_else(|| config.log.file.clone());
    utils::logger::init(log_level, log_file.as_deref())?;

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    tracing::info!(
        "host-backup v{} on {} (repository: {})",
        env!("CARGO_PKG_VERSION"),
        host,
        config.repository.url
    );

    let passphrase = config.resolve_passphrase(args.password.clone())?;
    let store = BorgStore::new(&config, passphrase);

    // Progress reporting and operator cancellation (SIGINT)
    let (events, reporter) = ProgressReporter::channel();
    let reporter_handle = reporter.spawn();
    let cancel = CancellationToken::new();
    let ctx = JobContext::new(events, cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received SIGINT, cancelling current job");
            cancel.cancel();
        }
    });

    let exit_code = run_command(args.command, &config, &store, &ctx).await;

    // Let the reporter drain before exiting.
    drop(ctx);
    let _ = reporter_handle.await;
    std::process::exit(exit_code);
}

async fn run_command(
    command: Command,
    config: &Config,
    store: &BorgStore,
    ctx: &JobContext,
) -> i32 {
    match command {
        Command::Backup {
            paths,
            tag,
            partial,
        } => {
            let mode = if partial { JobMode::Partial } else { JobMode::Full };
            let targets = if paths.is_empty() {
                config.backup.target_paths.clone()
            } else {
                paths
            };
            let job = match BackupJob::new(targets, tag, mode) {
                Ok(job) => job,
                Err(e) => return fail(&e),
            };
            let orchestrator = Orchestrator::new(
                store,
                HookManager::new(hooks::backup_hooks(&config.hooks, &config.state)),
                state::handlers_for(&config.state.kinds),
                config,
            );
            match orchestrator.run_backup(ctx, &job).await {
                Ok(report) => finish(report),
                Err(e) => fail(&e),
            }
        }

        Command::Restore {
            archive,
            target,
            paths,
            yes,
        } => {
            let scope = if paths.is_empty() {
                RestoreScope::All
            } else {
                RestoreScope::Paths(paths)
            };
            let coordinator = RestoreCoordinator::new(store);
            let selection = match coordinator
                .select(ctx, archive, target, scope, yes)
                .await
            {
                Ok(s) => s,
                Err(e) => return fail(&e),
            };
            let extracted_state =
                state::extracted_state_dir(&selection.target, &config.state.state_dir);
            let orchestrator = Orchestrator::new(
                store,
                HookManager::new(hooks::restore_hooks(&config.hooks, extracted_state)),
                state::handlers_for(&config.state.kinds),
                config,
            );
            match orchestrator.run_restore(ctx, &selection).await {
                Ok(report) => finish(report),
                Err(e) => fail(&e),
            }
        }

        Command::List => match store.list(ctx).await {
            Ok(archives) if archives.is_empty() => {
                println!("no archives");
                0
            }
            Ok(archives) => {
                for line in restore::present(&archives) {
                    println!("{line}");
                }
                0
            }
            Err(e) => fail(&e),
        },

        Command::Info { archive } => match store.info(ctx, &archive).await {
            Ok(()) => 0,
            Err(e) => fail(&e),
        },

        Command::Delete { archive } => match store.delete_one(ctx, &archive).await {
            Ok(()) => {
                tracing::info!("deleted archive {archive}");
                0
            }
            Err(e) => fail(&e),
        },

        Command::ClearAll { yes } => {
            if !yes && !confirm_clear_all(&config.repository.url).await {
                tracing::info!("clear-all aborted");
                return JobOutcome::Failed.exit_code();
            }
            match store.delete_all(ctx).await {
                Ok(()) => {
                    tracing::info!("repository cleared and compacted");
                    0
                }
                Err(e) => fail(&e),
            }
        }
    }
}

fn finish(report: host_backup::JobReport) -> i32 {
    match report.outcome {
        JobOutcome::Success => tracing::info!(
            archive = report.archive_id.as_deref().unwrap_or("-"),
            "job finished successfully"
        ),
        JobOutcome::DegradedSuccess => tracing::warn!(
            archive = report.archive_id.as_deref().unwrap_or("-"),
            "job finished degraded: data is safe but normal operation was not fully resumed"
        ),
        JobOutcome::Failed => {}
    }
    report.outcome.exit_code()
}

/// Report the error exactly as classified, then map to the failure code.
fn fail(error: &BackupError) -> i32 {
    tracing::error!("{error}");
    JobOutcome::Failed.exit_code()
}

async fn confirm_clear_all(repo: &str) -> bool {
    println!("this deletes EVERY archive in {repo}");
    matches!(
        restore::read_line("type 'DELETE ALL' to continue: ").await,
        Ok(answer) if answer.trim() == "DELETE ALL"
    )
}
