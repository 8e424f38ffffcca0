//! Pre/post hooks around the data-capture window.
//!
//! Hooks are a declared, ordered list of reversible-action pairs: stop/start
//! of container workloads, dump/restore of live databases. The manager is
//! stateless per invocation: it reports which pre-hooks ran, and the
//! orchestrator explicitly asks for compensation. It never compensates on
//! its own.

pub mod containers;
pub mod database;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{HooksConfig, StateConfig};
use crate::error::Result;
use crate::job::JobContext;

/// Result of one hook action, consumed immediately by the orchestrator.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub hook: String,
    pub succeeded: bool,
    pub error: Option<String>,
}

impl HookOutcome {
    fn ok(hook: &str) -> Self {
        Self {
            hook: hook.to_string(),
            succeeded: true,
            error: None,
        }
    }

    fn failed(hook: &str, error: String) -> Self {
        Self {
            hook: hook.to_string(),
            succeeded: false,
            error: Some(error),
        }
    }
}

/// A paired pre/post action. Concrete hooks implement the subset they need.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `post` can undo the disruption `pre` caused. A database dump
    /// is not reversible mid-dump: a half-written dump file is discarded by
    /// the hook itself, never resumed.
    fn is_reversible(&self) -> bool {
        true
    }

    async fn pre(&self, ctx: &JobContext) -> Result<()>;

    async fn post(&self, ctx: &JobContext) -> Result<()>;
}

/// A pre-hook run that stopped at the first failure. `executed` names the
/// hooks whose pre action completed before the failing one, in run order.
#[derive(Debug)]
pub struct PreFailure {
    pub failed: HookOutcome,
    pub executed: Vec<String>,
}

pub struct HookManager {
    hooks: Vec<Box<dyn Hook>>,
}

impl HookManager {
    pub fn new(hooks: Vec<Box<dyn Hook>>) -> Self {
        Self { hooks }
    }

    /// Run all pre actions in declared order, stopping at the first failure.
    pub async fn run_pre(&self, ctx: &JobContext) -> std::result::Result<Vec<HookOutcome>, PreFailure> {
        let mut outcomes = Vec::with_capacity(self.hooks.len());
        for hook in &self.hooks {
            info!("running pre-hook '{}'", hook.name());
            match hook.pre(ctx).await {
                Ok(()) => outcomes.push(HookOutcome::ok(hook.name())),
                Err(e) => {
                    let executed = outcomes.into_iter().map(|o| o.hook).collect();
                    return Err(PreFailure {
                        failed: HookOutcome::failed(hook.name(), e.to_string()),
                        executed,
                    });
                }
            }
        }
        Ok(outcomes)
    }

    /// Run the post actions of exactly the named hooks, in reverse order.
    /// Compensation failures are collected, never propagated: there is
    /// nothing further to unwind.
    pub async fn run_compensation(&self, ctx: &JobContext, executed: &[String]) -> Vec<HookOutcome> {
        let mut outcomes = Vec::new();
        for hook in self.hooks.iter().rev() {
            if !executed.iter().any(|name| name == hook.name()) {
                continue;
            }
            if !hook.is_reversible() {
                warn!(
                    "hook '{}' is not reversible; running cleanup only",
                    hook.name()
                );
            }
            info!("compensating hook '{}'", hook.name());
            match hook.post(ctx).await {
                Ok(()) => outcomes.push(HookOutcome::ok(hook.name())),
                Err(e) => {
                    warn!("compensation for '{}' failed: {}", hook.name(), e);
                    outcomes.push(HookOutcome::failed(hook.name(), e.to_string()));
                }
            }
        }
        outcomes
    }

    /// Run every post action in reverse order, regardless of individual
    /// failures. Used on the normal path once all pre-hooks have run.
    pub async fn run_post(&self, ctx: &JobContext) -> Vec<HookOutcome> {
        let mut outcomes = Vec::with_capacity(self.hooks.len());
        for hook in self.hooks.iter().rev() {
            info!("running post-hook '{}'", hook.name());
            match hook.post(ctx).await {
                Ok(()) => outcomes.push(HookOutcome::ok(hook.name())),
                Err(e) => {
                    warn!("post-hook '{}' failed: {}", hook.name(), e);
                    outcomes.push(HookOutcome::failed(hook.name(), e.to_string()));
                }
            }
        }
        outcomes
    }
}

/// Declared hook order for a backup: stop containers first, then dump
/// databases into the staging directory while writers are quiet.
pub fn backup_hooks(hooks: &HooksConfig, state: &StateConfig) -> Vec<Box<dyn Hook>> {
    let mut list: Vec<Box<dyn Hook>> = Vec::new();
    if !hooks.container_units.is_empty() {
        list.push(Box::new(containers::ContainerHook::new(
            hooks.container_units.clone(),
            hooks.stop_settle_secs,
            hooks.start_settle_secs,
        )));
    }
    if hooks.database {
        list.push(Box::new(database::DatabaseDumpHook::new(
            state.state_dir.clone(),
        )));
    }
    list
}

/// Hooks bracketing a restore's state reapplication: feed staged dumps back
/// into the database servers, then clean up and patch up the guest agent.
pub fn restore_hooks(
    hooks: &HooksConfig,
    extracted_state_dir: std::path::PathBuf,
) -> Vec<Box<dyn Hook>> {
    let mut list: Vec<Box<dyn Hook>> = Vec::new();
    if hooks.database {
        list.push(Box::new(database::DatabaseRestoreHook::new(
            extracted_state_dir,
        )));
    }
    list.push(Box::new(containers::LxdAgentFixHook));
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackupError;
    use crate::progress::ProgressReporter;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    fn test_ctx() -> JobContext {
        let (tx, _reporter) = ProgressReporter::channel();
        JobContext::new(tx, CancellationToken::new())
    }

    /// Records pre/post invocations into a shared trace; pre fails when told.
    struct TraceHook {
        name: String,
        fail_pre: bool,
        fail_post: bool,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl TraceHook {
        fn boxed(
            name: &str,
            fail_pre: bool,
            fail_post: bool,
            trace: &Arc<Mutex<Vec<String>>>,
        ) -> Box<dyn Hook> {
            Box::new(Self {
                name: name.to_string(),
                fail_pre,
                fail_post,
                trace: Arc::clone(trace),
            })
        }
    }

    #[async_trait]
    impl Hook for TraceHook {
        fn name(&self) -> &str {
            &self.name
        }

        async fn pre(&self, _ctx: &JobContext) -> Result<()> {
            self.trace.lock().unwrap().push(format!("pre:{}", self.name));
            if self.fail_pre {
                Err(BackupError::Hook {
                    hook: self.name.clone(),
                    message: "pre failed".to_string(),
                })
            } else {
                Ok(())
            }
        }

        async fn post(&self, _ctx: &JobContext) -> Result<()> {
            self.trace.lock().unwrap().push(format!("post:{}", self.name));
            if self.fail_post {
                Err(BackupError::Hook {
                    hook: self.name.clone(),
                    message: "post failed".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn pre_failure_reports_executed_hooks_in_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let manager = HookManager::new(vec![
            TraceHook::boxed("a", false, false, &trace),
            TraceHook::boxed("b", false, false, &trace),
            TraceHook::boxed("c", true, false, &trace),
            TraceHook::boxed("d", false, false, &trace),
        ]);
        let ctx = test_ctx();

        let failure = manager.run_pre(&ctx).await.unwrap_err();
        assert_eq!(failure.failed.hook, "c");
        assert_eq!(failure.executed, vec!["a", "b"]);
        // d's pre never ran
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["pre:a", "pre:b", "pre:c"]
        );
    }

    #[tokio::test]
    async fn compensation_runs_exactly_executed_hooks_in_reverse() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let manager = HookManager::new(vec![
            TraceHook::boxed("a", false, false, &trace),
            TraceHook::boxed("b", false, false, &trace),
            TraceHook::boxed("c", true, false, &trace),
        ]);
        let ctx = test_ctx();

        let failure = manager.run_pre(&ctx).await.unwrap_err();
        trace.lock().unwrap().clear();

        let outcomes = manager.run_compensation(&ctx, &failure.executed).await;
        assert_eq!(*trace.lock().unwrap(), vec!["post:b", "post:a"]);
        assert!(outcomes.iter().all(|o| o.succeeded));
    }

    #[tokio::test]
    async fn compensation_continues_past_failures() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let manager = HookManager::new(vec![
            TraceHook::boxed("a", false, false, &trace),
            TraceHook::boxed("b", false, true, &trace),
        ]);
        let ctx = test_ctx();

        let executed = vec!["a".to_string(), "b".to_string()];
        let outcomes = manager.run_compensation(&ctx, &executed).await;
        // b's post failed but a's still ran
        assert_eq!(*trace.lock().unwrap(), vec!["post:b", "post:a"]);
        assert!(!outcomes[0].succeeded);
        assert!(outcomes[1].succeeded);
    }

    #[tokio::test]
    async fn run_post_covers_all_hooks_in_reverse_despite_failures() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let manager = HookManager::new(vec![
            TraceHook::boxed("a", false, true, &trace),
            TraceHook::boxed("b", false, false, &trace),
            TraceHook::boxed("c", false, false, &trace),
        ]);
        let ctx = test_ctx();

        let outcomes = manager.run_post(&ctx).await;
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["post:c", "post:b", "post:a"]
        );
        assert_eq!(outcomes.len(), 3);
        assert!(!outcomes[2].succeeded); // a
    }
}
