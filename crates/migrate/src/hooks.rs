//! Lifecycle hooks
//!
//! Every hook is optional. `HookChain` fans a call out to the registered
//! hooks in registration order and stops at the first failure, which is then
//! propagated to the caller.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{DatabaseError, MigrationError, MigrationResult};
use crate::script::{MigrationScript, ScriptSet};
use crate::transaction::TransactionContext;
use crate::workflow::MigrationRunResult;

#[async_trait]
pub trait MigrationHooks: Send + Sync {
    // process

    async fn on_start(&self, _scripts: &ScriptSet) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_complete(&self, _result: &MigrationRunResult) -> MigrationResult<()> {
        Ok(())
    }

    /// Should not fail; a failure still aborts the remaining hooks
    async fn on_error(&self, _error: &MigrationError) -> MigrationResult<()> {
        Ok(())
    }

    // per script

    async fn on_before_migrate(&self, _script: &MigrationScript) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_after_migrate(
        &self,
        _script: &MigrationScript,
        _result: &str,
    ) -> MigrationResult<()> {
        Ok(())
    }

    /// Should not fail; a failure still aborts the remaining hooks
    async fn on_migration_error(
        &self,
        _script: &MigrationScript,
        _error: &MigrationError,
    ) -> MigrationResult<()> {
        Ok(())
    }

    // backup

    async fn on_before_backup(&self) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_after_backup(&self, _path: &Path) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_before_restore(&self, _path: &Path) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_after_restore(&self, _path: &Path) -> MigrationResult<()> {
        Ok(())
    }

    // transaction

    async fn before_transaction_begin(&self, _ctx: &TransactionContext) -> MigrationResult<()> {
        Ok(())
    }

    async fn after_transaction_begin(&self, _ctx: &TransactionContext) -> MigrationResult<()> {
        Ok(())
    }

    async fn before_commit(&self, _ctx: &TransactionContext) -> MigrationResult<()> {
        Ok(())
    }

    async fn after_commit(&self, _ctx: &TransactionContext) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_commit_retry(
        &self,
        _ctx: &TransactionContext,
        _error: &DatabaseError,
    ) -> MigrationResult<()> {
        Ok(())
    }

    async fn before_rollback(&self, _ctx: &TransactionContext, _reason: &str) -> MigrationResult<()> {
        Ok(())
    }

    async fn after_rollback(&self, _ctx: &TransactionContext) -> MigrationResult<()> {
        Ok(())
    }

    // locking

    async fn on_before_acquire_lock(&self, _executor_id: &str) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_lock_acquired(&self, _executor_id: &str) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_acquire_retry(&self, _executor_id: &str, _attempt: u32) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_lock_acquisition_failed(&self, _executor_id: &str) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_ownership_verification_failed(&self, _executor_id: &str) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_lock_released(&self, _executor_id: &str) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_lock_error(&self, _executor_id: &str, _error: &MigrationError) -> MigrationResult<()> {
        Ok(())
    }

    async fn on_force_release_lock(&self) -> MigrationResult<()> {
        Ok(())
    }
}

/// Ordered composite of hooks
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn MigrationHooks>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn register(&mut self, hook: Arc<dyn MigrationHooks>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl MigrationHooks for HookChain {
    async fn on_start(&self, scripts: &ScriptSet) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_start(scripts).await?;
        }
        Ok(())
    }

    async fn on_complete(&self, result: &MigrationRunResult) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_complete(result).await?;
        }
        Ok(())
    }

    async fn on_error(&self, error: &MigrationError) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_error(error).await?;
        }
        Ok(())
    }

    async fn on_before_migrate(&self, script: &MigrationScript) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_before_migrate(script).await?;
        }
        Ok(())
    }

    async fn on_after_migrate(&self, script: &MigrationScript, result: &str) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_after_migrate(script, result).await?;
        }
        Ok(())
    }

    async fn on_migration_error(
        &self,
        script: &MigrationScript,
        error: &MigrationError,
    ) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_migration_error(script, error).await?;
        }
        Ok(())
    }

    async fn on_before_backup(&self) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_before_backup().await?;
        }
        Ok(())
    }

    async fn on_after_backup(&self, path: &Path) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_after_backup(path).await?;
        }
        Ok(())
    }

    async fn on_before_restore(&self, path: &Path) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_before_restore(path).await?;
        }
        Ok(())
    }

    async fn on_after_restore(&self, path: &Path) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_after_restore(path).await?;
        }
        Ok(())
    }

    async fn before_transaction_begin(&self, ctx: &TransactionContext) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.before_transaction_begin(ctx).await?;
        }
        Ok(())
    }

    async fn after_transaction_begin(&self, ctx: &TransactionContext) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.after_transaction_begin(ctx).await?;
        }
        Ok(())
    }

    async fn before_commit(&self, ctx: &TransactionContext) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.before_commit(ctx).await?;
        }
        Ok(())
    }

    async fn after_commit(&self, ctx: &TransactionContext) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.after_commit(ctx).await?;
        }
        Ok(())
    }

    async fn on_commit_retry(
        &self,
        ctx: &TransactionContext,
        error: &DatabaseError,
    ) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_commit_retry(ctx, error).await?;
        }
        Ok(())
    }

    async fn before_rollback(&self, ctx: &TransactionContext, reason: &str) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.before_rollback(ctx, reason).await?;
        }
        Ok(())
    }

    async fn after_rollback(&self, ctx: &TransactionContext) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.after_rollback(ctx).await?;
        }
        Ok(())
    }

    async fn on_before_acquire_lock(&self, executor_id: &str) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_before_acquire_lock(executor_id).await?;
        }
        Ok(())
    }

    async fn on_lock_acquired(&self, executor_id: &str) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_lock_acquired(executor_id).await?;
        }
        Ok(())
    }

    async fn on_acquire_retry(&self, executor_id: &str, attempt: u32) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_acquire_retry(executor_id, attempt).await?;
        }
        Ok(())
    }

    async fn on_lock_acquisition_failed(&self, executor_id: &str) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_lock_acquisition_failed(executor_id).await?;
        }
        Ok(())
    }

    async fn on_ownership_verification_failed(&self, executor_id: &str) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_ownership_verification_failed(executor_id).await?;
        }
        Ok(())
    }

    async fn on_lock_released(&self, executor_id: &str) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_lock_released(executor_id).await?;
        }
        Ok(())
    }

    async fn on_lock_error(&self, executor_id: &str, error: &MigrationError) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_lock_error(executor_id, error).await?;
        }
        Ok(())
    }

    async fn on_force_release_lock(&self) -> MigrationResult<()> {
        for hook in &self.hooks {
            hook.on_force_release_lock().await?;
        }
        Ok(())
    }
}

/// Logs lifecycle events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHooks;

#[async_trait]
impl MigrationHooks for TracingHooks {
    async fn on_start(&self, scripts: &ScriptSet) -> MigrationResult<()> {
        info!(
            "Starting migration run: {} pending, {} migrated, {} ignored",
            scripts.pending.len(),
            scripts.migrated.len(),
            scripts.ignored.len()
        );
        Ok(())
    }

    async fn on_complete(&self, result: &MigrationRunResult) -> MigrationResult<()> {
        info!(
            "Migration run finished (success: {}, executed: {}, {} ms)",
            result.success,
            result.executed.len(),
            result.elapsed_ms
        );
        Ok(())
    }

    async fn on_error(&self, error: &MigrationError) -> MigrationResult<()> {
        warn!("Migration run failed: {}", error);
        Ok(())
    }

    async fn on_before_migrate(&self, script: &MigrationScript) -> MigrationResult<()> {
        info!("Applying migration: {} - {}", script.version, script.name);
        Ok(())
    }

    async fn on_after_migrate(&self, script: &MigrationScript, _result: &str) -> MigrationResult<()> {
        info!(
            "Applied migration: {} - {} ({} ms)",
            script.version,
            script.name,
            script.duration_ms().unwrap_or_default()
        );
        Ok(())
    }

    async fn on_migration_error(
        &self,
        script: &MigrationScript,
        error: &MigrationError,
    ) -> MigrationResult<()> {
        warn!("Migration {} - {} failed: {}", script.version, script.name, error);
        Ok(())
    }

    async fn on_after_backup(&self, path: &Path) -> MigrationResult<()> {
        info!("Backup written to {}", path.display());
        Ok(())
    }

    async fn on_after_restore(&self, path: &Path) -> MigrationResult<()> {
        info!("Database restored from {}", path.display());
        Ok(())
    }

    async fn on_commit_retry(
        &self,
        ctx: &TransactionContext,
        error: &DatabaseError,
    ) -> MigrationResult<()> {
        warn!(
            "Commit of {} failed on attempt {}, retrying: {}",
            ctx.transaction_id, ctx.attempt, error
        );
        Ok(())
    }

    async fn on_lock_acquired(&self, executor_id: &str) -> MigrationResult<()> {
        info!("Migration lock acquired by {}", executor_id);
        Ok(())
    }

    async fn on_lock_released(&self, executor_id: &str) -> MigrationResult<()> {
        info!("Migration lock released by {}", executor_id);
        Ok(())
    }

    async fn on_force_release_lock(&self) -> MigrationResult<()> {
        warn!("Migration lock force released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        events: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl MigrationHooks for Recorder {
        async fn on_before_migrate(&self, script: &MigrationScript) -> MigrationResult<()> {
            self.events
                .lock()
                .push(format!("{}: {}", self.name, script.name));
            if self.fail {
                return Err(MigrationError::hook(format!("{} refused", self.name)));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hooks_run_in_registration_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut chain = HookChain::new();
        for name in ["first", "second"] {
            chain.register(Arc::new(Recorder {
                name,
                events: events.clone(),
                fail: false,
            }));
        }

        let script = MigrationScript::new("init", 1, "V1_init.sql");
        chain.on_before_migrate(&script).await.unwrap();

        assert_eq!(*events.lock(), vec!["first: init", "second: init"]);
    }

    #[tokio::test]
    async fn test_first_failure_aborts_chain() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut chain = HookChain::new();
        chain.register(Arc::new(Recorder {
            name: "failing",
            events: events.clone(),
            fail: true,
        }));
        chain.register(Arc::new(Recorder {
            name: "never",
            events: events.clone(),
            fail: false,
        }));

        let script = MigrationScript::new("init", 1, "V1_init.sql");
        let result = chain.on_before_migrate(&script).await;

        assert!(matches!(result, Err(MigrationError::Hook(_))));
        assert_eq!(*events.lock(), vec!["failing: init"]);
    }

    #[tokio::test]
    async fn test_empty_chain_is_a_no_op() {
        let chain = HookChain::new();
        assert!(chain.is_empty());
        chain.on_force_release_lock().await.unwrap();
        chain.on_before_backup().await.unwrap();
    }
}
