//! Transaction manager for backends with explicit begin/commit/rollback

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::{with_timeout, TransactionContext, TransactionManager, UnitOfWork};
use crate::config::TransactionConfig;
use crate::database::ImperativeTransactions;
use crate::error::{MigrationError, MigrationResult};
use crate::hooks::{HookChain, MigrationHooks};

pub struct ImperativeTransactionManager {
    backend: Arc<dyn ImperativeTransactions>,
    config: TransactionConfig,
    hooks: Arc<HookChain>,
}

impl ImperativeTransactionManager {
    pub fn new(
        backend: Arc<dyn ImperativeTransactions>,
        config: TransactionConfig,
        hooks: Arc<HookChain>,
    ) -> Self {
        Self {
            backend,
            config,
            hooks,
        }
    }

    /// Open a transaction, applying the isolation level when the backend honors it
    pub async fn begin(&self, ctx: &TransactionContext) -> MigrationResult<()> {
        self.hooks.before_transaction_begin(ctx).await?;

        let isolation = ctx.isolation.filter(|level| {
            let supported = self.backend.supports_isolation(*level);
            if !supported {
                debug!("Isolation level {} not supported by backend, using default", level);
            }
            supported
        });

        self.backend
            .begin(isolation)
            .await
            .map_err(MigrationError::Transaction)?;
        debug!("Transaction {} started", ctx.transaction_id);

        if let Err(hook_error) = self.hooks.after_transaction_begin(ctx).await {
            self.abort(ctx, &hook_error.to_string()).await;
            return Err(hook_error);
        }
        Ok(())
    }

    /// Commit, retrying transient failures within the configured budget.
    ///
    /// A commit that cannot succeed rolls the transaction back and fails.
    pub async fn commit(&self, ctx: &mut TransactionContext) -> MigrationResult<()> {
        if let Err(hook_error) = self.hooks.before_commit(ctx).await {
            self.abort(ctx, &hook_error.to_string()).await;
            return Err(hook_error);
        }

        loop {
            match self.backend.commit().await {
                Ok(()) => {
                    debug!(
                        "Transaction {} committed on attempt {}",
                        ctx.transaction_id, ctx.attempt
                    );
                    return self.hooks.after_commit(ctx).await;
                }
                Err(commit_error) => {
                    if self.backend.is_retryable(&commit_error) && ctx.attempt <= self.config.retries {
                        if let Err(hook_error) = self.hooks.on_commit_retry(ctx, &commit_error).await {
                            self.abort(ctx, &hook_error.to_string()).await;
                            return Err(hook_error);
                        }
                        let delay = self.config.delay_for_attempt(ctx.attempt);
                        warn!(
                            "Commit of {} failed on attempt {} ({}), retrying in {:?}",
                            ctx.transaction_id, ctx.attempt, commit_error, delay
                        );
                        tokio::time::sleep(delay).await;
                        ctx.attempt += 1;
                        continue;
                    }

                    error!(
                        "Commit of {} failed after {} attempt(s): {}",
                        ctx.transaction_id, ctx.attempt, commit_error
                    );
                    self.abort(ctx, &format!("commit failed: {}", commit_error))
                        .await;
                    return Err(MigrationError::CommitFailed {
                        attempts: ctx.attempt,
                        source: commit_error,
                    });
                }
            }
        }
    }

    pub async fn rollback(&self, ctx: &TransactionContext, reason: &str) -> MigrationResult<()> {
        // the backend rollback runs even when the hook refuses
        let hooked = self.hooks.before_rollback(ctx, reason).await;
        self.backend
            .rollback()
            .await
            .map_err(MigrationError::Transaction)?;
        hooked?;
        debug!("Transaction {} rolled back ({})", ctx.transaction_id, reason);
        self.hooks.after_rollback(ctx).await
    }

    /// Roll back on a failure path; the original error wins over a rollback error
    async fn abort(&self, ctx: &TransactionContext, reason: &str) {
        if let Err(rollback_error) = self.rollback(ctx, reason).await {
            error!(
                "Rollback of {} failed: {}",
                ctx.transaction_id, rollback_error
            );
        }
    }
}

#[async_trait]
impl TransactionManager for ImperativeTransactionManager {
    fn kind(&self) -> &'static str {
        "imperative"
    }

    async fn run<'a>(
        &self,
        ctx: &mut TransactionContext,
        work: &UnitOfWork<'a>,
        dry_run: bool,
    ) -> MigrationResult<()> {
        self.begin(ctx).await?;

        match with_timeout(self.config.timeout, work()).await {
            Ok(()) if dry_run => self.rollback(ctx, "dry run").await,
            Ok(()) => self.commit(ctx).await,
            Err(work_error) => {
                self.abort(ctx, &work_error.to_string()).await;
                Err(work_error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IsolationLevel, TransactionMode};
    use crate::error::{DatabaseError, DatabaseResult};
    use crate::hooks::MigrationHooks;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedBackend {
        ops: Mutex<Vec<String>>,
        commit_failures: Mutex<VecDeque<DatabaseError>>,
    }

    #[async_trait]
    impl ImperativeTransactions for ScriptedBackend {
        async fn begin(&self, isolation: Option<IsolationLevel>) -> DatabaseResult<()> {
            self.ops.lock().push(format!("begin:{:?}", isolation));
            Ok(())
        }

        async fn commit(&self) -> DatabaseResult<()> {
            self.ops.lock().push("commit".to_string());
            match self.commit_failures.lock().pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn rollback(&self) -> DatabaseResult<()> {
            self.ops.lock().push("rollback".to_string());
            Ok(())
        }

        fn supports_isolation(&self, level: IsolationLevel) -> bool {
            level != IsolationLevel::ReadUncommitted
        }
    }

    #[derive(Default)]
    struct CountingHooks {
        retries: Mutex<u32>,
        commits: Mutex<u32>,
        rollbacks: Mutex<u32>,
    }

    #[async_trait]
    impl MigrationHooks for CountingHooks {
        async fn on_commit_retry(
            &self,
            _ctx: &TransactionContext,
            _error: &DatabaseError,
        ) -> MigrationResult<()> {
            *self.retries.lock() += 1;
            Ok(())
        }

        async fn after_commit(&self, _ctx: &TransactionContext) -> MigrationResult<()> {
            *self.commits.lock() += 1;
            Ok(())
        }

        async fn after_rollback(&self, _ctx: &TransactionContext) -> MigrationResult<()> {
            *self.rollbacks.lock() += 1;
            Ok(())
        }
    }

    fn setup(
        retries: u32,
        failures: Vec<DatabaseError>,
    ) -> (ImperativeTransactionManager, Arc<ScriptedBackend>, Arc<CountingHooks>) {
        let backend = Arc::new(ScriptedBackend::default());
        backend.commit_failures.lock().extend(failures);
        let counting = Arc::new(CountingHooks::default());
        let mut hooks = HookChain::new();
        hooks.register(counting.clone());

        let config = TransactionConfig {
            retries,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let manager = ImperativeTransactionManager::new(backend.clone(), config, Arc::new(hooks));
        (manager, backend, counting)
    }

    fn ok_work<'a>() -> impl Fn() -> BoxFuture<'a, MigrationResult<()>> + Send + Sync + 'a {
        || Box::pin(async { Ok(()) })
    }

    #[tokio::test]
    async fn test_commit_retries_then_succeeds() {
        let (manager, backend, counting) = setup(
            3,
            vec![
                DatabaseError::with_code("serialization failure", "40001"),
                DatabaseError::with_code("deadlock detected", "40P01"),
            ],
        );
        let mut ctx = TransactionContext::new(TransactionMode::PerBatch, None, Vec::new());

        manager.run(&mut ctx, &ok_work(), false).await.unwrap();

        assert_eq!(ctx.attempt, 3);
        assert_eq!(*counting.retries.lock(), 2);
        assert_eq!(*counting.commits.lock(), 1);
        assert_eq!(
            *backend.ops.lock(),
            vec!["begin:None", "commit", "commit", "commit"]
        );
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_rolls_back() {
        let (manager, backend, counting) = setup(
            1,
            vec![
                DatabaseError::retryable("conflict"),
                DatabaseError::retryable("conflict"),
            ],
        );
        let mut ctx = TransactionContext::new(TransactionMode::PerMigration, None, Vec::new());

        let result = manager.run(&mut ctx, &ok_work(), false).await;

        match result {
            Err(MigrationError::CommitFailed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("Expected commit failure, got {:?}", other),
        }
        assert_eq!(*counting.retries.lock(), 1);
        assert_eq!(*counting.commits.lock(), 0);
        assert_eq!(backend.ops.lock().last().map(String::as_str), Some("rollback"));
    }

    #[tokio::test]
    async fn test_non_retryable_commit_error_is_not_retried() {
        let (manager, _backend, counting) =
            setup(5, vec![DatabaseError::with_code("unique violation", "23505")]);
        let mut ctx = TransactionContext::new(TransactionMode::PerMigration, None, Vec::new());

        let result = manager.run(&mut ctx, &ok_work(), false).await;

        assert!(matches!(
            result,
            Err(MigrationError::CommitFailed { attempts: 1, .. })
        ));
        assert_eq!(*counting.retries.lock(), 0);
        assert_eq!(*counting.rollbacks.lock(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_never_commits() {
        let (manager, backend, counting) = setup(3, Vec::new());
        let mut ctx = TransactionContext::new(TransactionMode::PerMigration, None, Vec::new());

        manager.run(&mut ctx, &ok_work(), true).await.unwrap();

        assert_eq!(*backend.ops.lock(), vec!["begin:None", "rollback"]);
        assert_eq!(*counting.commits.lock(), 0);
    }

    #[tokio::test]
    async fn test_work_failure_rolls_back_and_propagates() {
        let (manager, backend, _counting) = setup(3, Vec::new());
        let mut ctx = TransactionContext::new(TransactionMode::PerMigration, None, Vec::new());
        let failing = || -> BoxFuture<'static, MigrationResult<()>> {
            Box::pin(async {
                Err(MigrationError::Execution {
                    script: "V1_init".to_string(),
                    source: "boom".into(),
                })
            })
        };

        let result = manager.run(&mut ctx, &failing, false).await;

        assert!(matches!(result, Err(MigrationError::Execution { .. })));
        assert_eq!(*backend.ops.lock(), vec!["begin:None", "rollback"]);
    }

    struct RefuseCommit;

    #[async_trait]
    impl MigrationHooks for RefuseCommit {
        async fn before_commit(&self, _ctx: &TransactionContext) -> MigrationResult<()> {
            Err(MigrationError::hook("commit vetoed"))
        }
    }

    #[tokio::test]
    async fn test_hook_failure_after_begin_rolls_back() {
        let backend = Arc::new(ScriptedBackend::default());
        let mut hooks = HookChain::new();
        hooks.register(Arc::new(RefuseCommit));
        let manager =
            ImperativeTransactionManager::new(backend.clone(), TransactionConfig::default(), Arc::new(hooks));
        let mut ctx = TransactionContext::new(TransactionMode::PerMigration, None, Vec::new());

        let result = manager.run(&mut ctx, &ok_work(), false).await;

        assert!(matches!(result, Err(MigrationError::Hook(_))));
        assert_eq!(*backend.ops.lock(), vec!["begin:None", "rollback"]);
    }

    #[tokio::test]
    async fn test_unsupported_isolation_is_ignored() {
        let (manager, backend, _counting) = setup(0, Vec::new());

        let mut ctx = TransactionContext::new(
            TransactionMode::PerMigration,
            Some(IsolationLevel::ReadUncommitted),
            Vec::new(),
        );
        manager.run(&mut ctx, &ok_work(), false).await.unwrap();

        let mut ctx = TransactionContext::new(
            TransactionMode::PerMigration,
            Some(IsolationLevel::Serializable),
            Vec::new(),
        );
        manager.run(&mut ctx, &ok_work(), false).await.unwrap();

        let ops = backend.ops.lock();
        assert_eq!(ops[0], "begin:None");
        assert_eq!(ops[2], "begin:Some(Serializable)");
    }
}
