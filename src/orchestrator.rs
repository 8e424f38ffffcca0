//! The phase state machine.
//!
//! Backup: Init → Precheck → HooksPre → CaptureState → Archive → HooksPost →
//! Done. Restore: Init → Precheck → SelectArchive → Extract →
//! HooksPreRestore → ApplyState → HooksPostRestore → Done. Failed is
//! terminal and reachable from any non-terminal phase.
//!
//! The ordering contract: nothing mutates the host before Precheck passes,
//! and once any pre-hook has run, its compensation runs no matter what
//! happens later. A backup that archived but could not fully resume normal
//! operation is a degraded success, not a failure.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::archive::ArchiveStore;
use crate::config::Config;
use crate::error::{BackupError, Result};
use crate::hooks::HookManager;
use crate::job::{BackupJob, JobContext, JobMode, JobReport, RestoreSelection};
use crate::progress::{Phase, PhaseStatus};
use crate::state::{self, StateHandler};
use crate::utils::cmd;

pub struct Orchestrator<'a> {
    store: &'a dyn ArchiveStore,
    /// Pre/post pairs for the direction this orchestrator will run
    /// (backup hooks or restore hooks).
    hooks: HookManager,
    handlers: Vec<Box<dyn StateHandler>>,
    config: &'a Config,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        store: &'a dyn ArchiveStore,
        hooks: HookManager,
        handlers: Vec<Box<dyn StateHandler>>,
        config: &'a Config,
    ) -> Self {
        Self {
            store,
            hooks,
            handlers,
            config,
        }
    }

    fn begin(&self, ctx: &JobContext, phase: Phase) {
        info!(phase = %phase, "entering phase");
        ctx.emit(phase, PhaseStatus::Started);
    }

    fn complete(&self, ctx: &JobContext, phase: Phase) {
        ctx.emit(phase, PhaseStatus::Completed);
    }

    fn fail(&self, ctx: &JobContext, phase: Phase, error: &BackupError) {
        warn!(phase = %phase, "phase failed: {error}");
        ctx.emit(phase, PhaseStatus::Failed(error.to_string()));
        ctx.emit(Phase::Failed, PhaseStatus::Started);
    }

    /// Verify everything the job needs before any mutating action, so a
    /// doomed job never disrupts running services. A locked repository is
    /// surfaced as its own class; everything else becomes a preflight error
    /// carrying the underlying message.
    async fn precheck(&self, ctx: &JobContext) -> Result<()> {
        let binary = &self.config.repository.engine_binary;
        let binary_present = if binary.contains('/') {
            std::path::Path::new(binary).is_file()
        } else {
            cmd::have_cmd(binary)
        };
        if !binary_present {
            return Err(BackupError::Preflight(format!(
                "archive engine binary '{binary}' not found"
            )));
        }

        match self.store.check_reachable(ctx).await {
            Ok(()) => Ok(()),
            Err(e @ BackupError::RepositoryLocked(_)) => Err(e),
            Err(e @ BackupError::Cancelled) => Err(e),
            Err(e) => Err(BackupError::Preflight(e.to_string())),
        }
    }

    /// Source paths for the archive: the job's targets plus the state
    /// directory, unless a target already covers it.
    fn assemble_sources(&self, job: &BackupJob) -> Vec<PathBuf> {
        let mut paths = job.target_paths.clone();
        let state_dir = &self.config.state.state_dir;
        let covered = paths.iter().any(|p| state_dir.starts_with(p));
        if !covered && state_dir.exists() {
            paths.push(state_dir.clone());
        }
        paths
    }

    fn backup_excludes(&self, job: &BackupJob) -> Vec<String> {
        let mut excludes = self.config.backup.base_excludes.clone();
        if job.mode == JobMode::Full {
            excludes.extend(self.config.backup.identity_excludes.iter().cloned());
        }
        excludes
    }

    pub async fn run_backup(&self, ctx: &JobContext, job: &BackupJob) -> Result<JobReport> {
        let archive_id = job.archive_id();

        self.begin(ctx, Phase::Init);
        info!(
            run_id = %ctx.run_id,
            archive = %archive_id,
            mode = ?job.mode,
            targets = ?job.target_paths,
            "starting backup job"
        );
        self.complete(ctx, Phase::Init);

        self.begin(ctx, Phase::Precheck);
        if let Err(e) = self.precheck(ctx).await {
            self.fail(ctx, Phase::Precheck, &e);
            return Err(e);
        }
        self.complete(ctx, Phase::Precheck);

        // From here on, the host may be disrupted; every early exit below
        // must run compensation for the hooks that already executed.
        self.begin(ctx, Phase::HooksPre);
        let executed = match self.hooks.run_pre(ctx).await {
            Ok(outcomes) => outcomes.into_iter().map(|o| o.hook).collect::<Vec<_>>(),
            Err(failure) => {
                let error = BackupError::Hook {
                    hook: failure.failed.hook.clone(),
                    message: failure.failed.error.unwrap_or_default(),
                };
                self.fail(ctx, Phase::HooksPre, &error);
                self.hooks.run_compensation(ctx, &failure.executed).await;
                return Err(error);
            }
        };
        self.complete(ctx, Phase::HooksPre);

        if let Err(e) = ctx.check_cancelled() {
            self.fail(ctx, Phase::CaptureState, &e);
            self.hooks.run_compensation(ctx, &executed).await;
            return Err(e);
        }

        self.begin(ctx, Phase::CaptureState);
        let state_dir = &self.config.state.state_dir;
        let (captured, capture_failures) =
            state::capture_all(ctx, &self.handlers, state_dir).await;
        ctx.emit(
            Phase::CaptureState,
            PhaseStatus::Progress {
                done: captured.len() as u64,
                total: self.handlers.len() as u64,
            },
        );
        let mut warnings: Vec<String> = capture_failures
            .iter()
            .map(|(kind, cause)| format!("state capture failed for {kind}: {cause}"))
            .collect();
        if job.mode == JobMode::Full {
            if let Some((kind, cause)) = capture_failures.into_iter().next() {
                let error = BackupError::Capture { kind, cause };
                self.fail(ctx, Phase::CaptureState, &error);
                self.hooks.run_compensation(ctx, &executed).await;
                return Err(error);
            }
        }
        self.complete(ctx, Phase::CaptureState);

        if let Err(e) = ctx.check_cancelled() {
            self.fail(ctx, Phase::Archive, &e);
            self.hooks.run_compensation(ctx, &executed).await;
            return Err(e);
        }

        self.begin(ctx, Phase::Archive);
        let sources = self.assemble_sources(job);
        let excludes = self.backup_excludes(job);
        let descriptor = match self
            .store
            .create(ctx, &archive_id, &sources, &excludes)
            .await
        {
            Ok(d) => d,
            Err(e) => {
                self.fail(ctx, Phase::Archive, &e);
                self.hooks.run_compensation(ctx, &executed).await;
                return Err(e);
            }
        };
        self.complete(ctx, Phase::Archive);
        info!(archive = %descriptor.id, "archive created");

        if let Err(e) = self.store.info(ctx, &descriptor.id).await {
            warn!("could not render archive info: {e}");
        }

        // Always runs: pre-hooks already disrupted the host. Failures here
        // degrade the outcome but never fail the job.
        self.begin(ctx, Phase::HooksPost);
        let post_outcomes = self.hooks.run_post(ctx).await;
        let mut degraded = false;
        for outcome in &post_outcomes {
            if !outcome.succeeded {
                degraded = true;
                warnings.push(format!(
                    "post-hook '{}' failed: {}",
                    outcome.hook,
                    outcome.error.clone().unwrap_or_default()
                ));
            }
        }
        self.complete(ctx, Phase::HooksPost);

        ctx.emit(Phase::Done, PhaseStatus::Completed);
        for warning in &warnings {
            warn!("{warning}");
        }
        if degraded {
            Ok(JobReport::degraded(Some(descriptor.id), warnings))
        } else {
            Ok(JobReport::success(Some(descriptor.id), warnings))
        }
    }

    pub async fn run_restore(
        &self,
        ctx: &JobContext,
        selection: &RestoreSelection,
    ) -> Result<JobReport> {
        self.begin(ctx, Phase::Init);
        info!(
            run_id = %ctx.run_id,
            archive = %selection.archive_id,
            target = %selection.target.display(),
            scope = ?selection.scope,
            "starting restore job"
        );
        self.complete(ctx, Phase::Init);

        self.begin(ctx, Phase::Precheck);
        if !selection.target.is_dir() {
            let e = BackupError::Preflight(format!(
                "restore target {} does not exist",
                selection.target.display()
            ));
            self.fail(ctx, Phase::Precheck, &e);
            return Err(e);
        }
        if let Err(e) = self.precheck(ctx).await {
            self.fail(ctx, Phase::Precheck, &e);
            return Err(e);
        }
        self.complete(ctx, Phase::Precheck);

        self.begin(ctx, Phase::SelectArchive);
        let archives = match self.store.list(ctx).await {
            Ok(a) => a,
            Err(e) => {
                self.fail(ctx, Phase::SelectArchive, &e);
                return Err(e);
            }
        };
        if !archives.iter().any(|a| a.id == selection.archive_id) {
            let e = BackupError::ArchiveData(format!(
                "archive '{}' not found in repository",
                selection.archive_id
            ));
            self.fail(ctx, Phase::SelectArchive, &e);
            return Err(e);
        }
        self.complete(ctx, Phase::SelectArchive);

        self.begin(ctx, Phase::Extract);
        if let Err(e) = self
            .store
            .extract(
                ctx,
                &selection.archive_id,
                &selection.target,
                &selection.scope,
                &self.config.backup.restore_excludes,
            )
            .await
        {
            // No hooks have run yet, nothing to compensate.
            self.fail(ctx, Phase::Extract, &e);
            return Err(e);
        }
        self.complete(ctx, Phase::Extract);

        self.begin(ctx, Phase::HooksPreRestore);
        let _executed = match self.hooks.run_pre(ctx).await {
            Ok(outcomes) => outcomes.into_iter().map(|o| o.hook).collect::<Vec<_>>(),
            Err(failure) => {
                let error = BackupError::Hook {
                    hook: failure.failed.hook.clone(),
                    message: failure.failed.error.unwrap_or_default(),
                };
                self.fail(ctx, Phase::HooksPreRestore, &error);
                self.hooks.run_compensation(ctx, &failure.executed).await;
                return Err(error);
            }
        };
        self.complete(ctx, Phase::HooksPreRestore);

        // Only kinds whose snapshots were actually extracted are reapplied;
        // a path-scoped restore that skipped the state dir applies nothing.
        self.begin(ctx, Phase::ApplyState);
        let extracted_state =
            state::extracted_state_dir(&selection.target, &self.config.state.state_dir);
        let (applied, apply_failures) =
            state::apply_present(ctx, &self.handlers, &extracted_state).await;
        ctx.emit(
            Phase::ApplyState,
            PhaseStatus::Progress {
                done: applied.len() as u64,
                total: self.handlers.len() as u64,
            },
        );
        if let Some((kind, cause)) = apply_failures.into_iter().next() {
            let error = BackupError::Apply { kind, cause };
            self.fail(ctx, Phase::ApplyState, &error);
            // Pre-restore hooks already ran; their posts still must.
            self.hooks.run_post(ctx).await;
            return Err(error);
        }
        self.complete(ctx, Phase::ApplyState);

        self.begin(ctx, Phase::HooksPostRestore);
        let post_outcomes = self.hooks.run_post(ctx).await;
        let mut warnings = Vec::new();
        let mut degraded = false;
        for outcome in &post_outcomes {
            if !outcome.succeeded {
                degraded = true;
                warnings.push(format!(
                    "post-hook '{}' failed: {}",
                    outcome.hook,
                    outcome.error.clone().unwrap_or_default()
                ));
            }
        }
        self.complete(ctx, Phase::HooksPostRestore);

        ctx.emit(Phase::Done, PhaseStatus::Completed);
        for warning in &warnings {
            warn!("{warning}");
        }
        info!("restore finished; a reboot is recommended after a full restore");
        if degraded {
            Ok(JobReport::degraded(Some(selection.archive_id.clone()), warnings))
        } else {
            Ok(JobReport::success(Some(selection.archive_id.clone()), warnings))
        }
    }
}
