//! Transaction Management
//!
//! Wraps units of migration work in database transactions. Two managers
//! share one contract: `ImperativeTransactionManager` drives explicit
//! begin/commit/rollback primitives, `CallbackTransactionManager` adapts a
//! backend whose only primitive wraps a unit of work. Which one is used is
//! decided once, from the capability the database handle advertises.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::{IsolationLevel, TransactionConfig, TransactionMode};
use crate::database::TransactionSupport;
use crate::error::{DatabaseError, MigrationError, MigrationResult};
use crate::hooks::HookChain;
use crate::script::MigrationScript;

pub mod callback;
pub mod imperative;

pub use callback::CallbackTransactionManager;
pub use imperative::ImperativeTransactionManager;

/// State of one managed transaction
#[derive(Debug, Clone)]
pub struct TransactionContext {
    /// Derived from mode and start time
    pub transaction_id: String,
    pub mode: TransactionMode,
    pub isolation: Option<IsolationLevel>,
    /// Scripts covered by the transaction
    pub migrations: Vec<MigrationScript>,
    pub start_time: DateTime<Utc>,
    /// Commit attempt counter, only the commit-retry loop writes it
    pub attempt: u32,
    /// Free-form values for correlating hook calls
    pub metadata: HashMap<String, String>,
}

impl TransactionContext {
    pub fn new(
        mode: TransactionMode,
        isolation: Option<IsolationLevel>,
        migrations: Vec<MigrationScript>,
    ) -> Self {
        let start_time = Utc::now();
        let migrations = match mode {
            TransactionMode::None => Vec::new(),
            _ => migrations,
        };

        Self {
            transaction_id: format!(
                "{}-{}",
                mode.to_string().to_lowercase(),
                start_time.timestamp_micros()
            ),
            mode,
            isolation,
            migrations,
            start_time,
            attempt: 1,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Re-invocable unit of work run inside a transaction
pub type UnitOfWork<'a> = dyn Fn() -> BoxFuture<'a, MigrationResult<()>> + Send + Sync + 'a;

/// Common contract of both transaction managers
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Short name of the strategy, for logs
    fn kind(&self) -> &'static str;

    /// Run `work` inside a transaction described by `ctx`.
    ///
    /// Commits on success with retry on transient commit failures, rolls
    /// back on failure. With `dry_run` the transaction is always rolled back.
    async fn run<'a>(
        &self,
        ctx: &mut TransactionContext,
        work: &UnitOfWork<'a>,
        dry_run: bool,
    ) -> MigrationResult<()>;
}

/// Pick the manager matching the backend capability.
///
/// Returns `None` when no wrapping should happen, either because the mode is
/// `NONE` or because the backend has no transaction primitive.
pub fn manager_for(
    support: TransactionSupport,
    config: &TransactionConfig,
    hooks: Arc<HookChain>,
) -> Option<Box<dyn TransactionManager>> {
    if config.mode == TransactionMode::None {
        return None;
    }

    match support {
        TransactionSupport::Imperative(backend) => Some(Box::new(
            ImperativeTransactionManager::new(backend, config.clone(), hooks),
        )),
        TransactionSupport::Callback(backend) => Some(Box::new(CallbackTransactionManager::new(
            backend,
            config.clone(),
            hooks,
        ))),
        TransactionSupport::Unsupported => {
            warn!(
                "Transaction mode {} requested but the database has no transaction support; scripts run unwrapped",
                config.mode
            );
            None
        }
    }
}

/// Await `work`, bounded by the configured transaction timeout
pub(crate) async fn with_timeout(
    timeout: Option<Duration>,
    work: BoxFuture<'_, MigrationResult<()>>,
) -> MigrationResult<()> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => Err(MigrationError::Transaction(DatabaseError::new(format!(
                "unit of work exceeded transaction timeout of {} ms",
                limit.as_millis()
            )))),
        },
        None => work.await,
    }
}
