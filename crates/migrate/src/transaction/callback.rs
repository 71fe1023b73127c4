//! Transaction manager for backends whose only primitive wraps a unit of work
//!
//! The backend begins, commits or aborts on its own; begin, commit and
//! rollback hook events are synthesized around the callback boundary. A
//! transient failure reported after the work finished is a commit failure.
//! Since the backend already aborted that transaction, a retry invokes the
//! primitive again, which runs the work in a fresh transaction.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::{with_timeout, TransactionContext, TransactionManager, UnitOfWork};
use crate::config::TransactionConfig;
use crate::database::{CallbackTransactions, TransactionWork};
use crate::error::{DatabaseError, MigrationError, MigrationResult};
use crate::hooks::{HookChain, MigrationHooks};

pub struct CallbackTransactionManager {
    backend: Arc<dyn CallbackTransactions>,
    config: TransactionConfig,
    hooks: Arc<HookChain>,
}

impl CallbackTransactionManager {
    pub fn new(
        backend: Arc<dyn CallbackTransactions>,
        config: TransactionConfig,
        hooks: Arc<HookChain>,
    ) -> Self {
        Self {
            backend,
            config,
            hooks,
        }
    }

    /// Fire rollback hooks for a transaction the backend already aborted
    async fn aborted(&self, ctx: &TransactionContext, reason: &str) -> MigrationResult<()> {
        self.hooks.before_rollback(ctx, reason).await?;
        debug!("Transaction {} aborted ({})", ctx.transaction_id, reason);
        self.hooks.after_rollback(ctx).await
    }
}

#[async_trait]
impl TransactionManager for CallbackTransactionManager {
    fn kind(&self) -> &'static str {
        "callback"
    }

    async fn run<'a>(
        &self,
        ctx: &mut TransactionContext,
        work: &UnitOfWork<'a>,
        dry_run: bool,
    ) -> MigrationResult<()> {
        self.hooks.before_transaction_begin(ctx).await?;

        let isolation = ctx
            .isolation
            .filter(|level| self.backend.supports_isolation(*level));

        loop {
            let failure: Mutex<Option<MigrationError>> = Mutex::new(None);
            let dry_run_abort = AtomicBool::new(false);

            let outcome = {
                let view: &TransactionContext = ctx;
                let hooks = &self.hooks;
                let failure = &failure;
                let dry_run_abort = &dry_run_abort;
                let timeout = self.config.timeout;

                let wrapped: TransactionWork<'_> = Box::pin(async move {
                    let result = async {
                        hooks.after_transaction_begin(view).await?;
                        with_timeout(timeout, work()).await?;
                        if !dry_run {
                            hooks.before_commit(view).await?;
                        }
                        Ok::<(), MigrationError>(())
                    }
                    .await;

                    match result {
                        Ok(()) if dry_run => {
                            dry_run_abort.store(true, Ordering::SeqCst);
                            Err(DatabaseError::new("dry run, aborting transaction"))
                        }
                        Ok(()) => Ok(()),
                        Err(work_error) => {
                            let message = format!("unit of work failed: {}", work_error);
                            *failure.lock() = Some(work_error);
                            Err(DatabaseError::new(message))
                        }
                    }
                });

                self.backend.run_in_transaction(isolation, wrapped).await
            };

            let commit_error = match outcome {
                Ok(()) => {
                    debug!(
                        "Transaction {} committed on attempt {}",
                        ctx.transaction_id, ctx.attempt
                    );
                    return self.hooks.after_commit(ctx).await;
                }
                Err(commit_error) => commit_error,
            };

            if let Some(work_error) = failure.into_inner() {
                if let Err(hook_error) = self.aborted(ctx, &work_error.to_string()).await {
                    error!("Rollback hooks for {} failed: {}", ctx.transaction_id, hook_error);
                }
                return Err(work_error);
            }

            if dry_run_abort.load(Ordering::SeqCst) {
                return self.aborted(ctx, "dry run").await;
            }

            if self.backend.is_retryable(&commit_error) && ctx.attempt <= self.config.retries {
                self.hooks.on_commit_retry(ctx, &commit_error).await?;
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
            if let Err(hook_error) = self
                .aborted(ctx, &format!("commit failed: {}", commit_error))
                .await
            {
                error!("Rollback hooks for {} failed: {}", ctx.transaction_id, hook_error);
            }
            return Err(MigrationError::CommitFailed {
                attempts: ctx.attempt,
                source: commit_error,
            });
        }
    }
}
