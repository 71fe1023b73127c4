//! Database handle contract consumed by the engine
//!
//! Adapters implement `Database` plus whichever capabilities their backend
//! offers: schema history is mandatory, transactions (imperative or
//! callback style), backups and the lock store are optional. The engine
//! inspects the capabilities once, when it is built.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::IsolationLevel;
use crate::error::{DatabaseError, DatabaseResult};

/// Persisted history row, keyed by version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub name: String,
    pub version: i64,
    pub checksum: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub result: Option<String>,
}

/// Schema history table or collection
#[async_trait]
pub trait SchemaHistory: Send + Sync {
    /// Create the history storage if it does not exist yet
    async fn init(&self) -> DatabaseResult<()>;

    /// Every executed migration, in any order
    async fn get_all_executed(&self) -> DatabaseResult<Vec<MigrationRecord>>;

    async fn save(&self, record: MigrationRecord) -> DatabaseResult<()>;

    async fn remove(&self, version: i64) -> DatabaseResult<()>;
}

/// Explicit BEGIN / COMMIT / ROLLBACK primitives
#[async_trait]
pub trait ImperativeTransactions: Send + Sync {
    async fn begin(&self, isolation: Option<IsolationLevel>) -> DatabaseResult<()>;

    async fn commit(&self) -> DatabaseResult<()>;

    async fn rollback(&self) -> DatabaseResult<()>;

    /// Levels the backend cannot honor are dropped before `begin`
    fn supports_isolation(&self, _level: IsolationLevel) -> bool {
        true
    }

    /// Whether a failed commit may be attempted again
    fn is_retryable(&self, error: &DatabaseError) -> bool {
        error.is_retryable()
    }
}

/// Work executed inside a callback transaction
pub type TransactionWork<'a> = BoxFuture<'a, DatabaseResult<()>>;

/// Single "run inside a transaction" primitive that commits when the work
/// succeeds and aborts when it fails
#[async_trait]
pub trait CallbackTransactions: Send + Sync {
    async fn run_in_transaction<'a>(
        &self,
        isolation: Option<IsolationLevel>,
        work: TransactionWork<'a>,
    ) -> DatabaseResult<()>;

    fn supports_isolation(&self, _level: IsolationLevel) -> bool {
        true
    }

    fn is_retryable(&self, error: &DatabaseError) -> bool {
        error.is_retryable()
    }
}

/// Transaction capability advertised by a database handle
#[derive(Clone)]
pub enum TransactionSupport {
    Imperative(Arc<dyn ImperativeTransactions>),
    Callback(Arc<dyn CallbackTransactions>),
    Unsupported,
}

impl std::fmt::Debug for TransactionSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionSupport::Imperative(_) => write!(f, "Imperative"),
            TransactionSupport::Callback(_) => write!(f, "Callback"),
            TransactionSupport::Unsupported => write!(f, "Unsupported"),
        }
    }
}

/// Backup and restore mechanics
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Take a backup and return where it was written
    async fn backup(&self) -> DatabaseResult<PathBuf>;

    async fn restore(&self, path: &Path) -> DatabaseResult<()>;

    /// Remove a working backup; missing files are not an error
    async fn delete(&self, path: &Path) -> DatabaseResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DatabaseError::new(format!(
                "Failed to delete backup {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Projection of the persisted lock record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    pub is_locked: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockStatus {
    pub fn unlocked() -> Self {
        Self {
            is_locked: false,
            locked_by: None,
            locked_at: None,
            expires_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Storage for the cross-process advisory lock
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Create the lock table or collection
    async fn init_lock_storage(&self) -> DatabaseResult<()>;

    /// Whether the lock storage can be read and written
    async fn ensure_lock_storage_accessible(&self) -> DatabaseResult<bool>;

    /// Try to take the lock; `false` when somebody else holds it
    async fn acquire_lock(&self, executor_id: &str, ttl: Duration) -> DatabaseResult<bool>;

    /// Release a lock held by `executor_id`; must not touch other holders' locks
    async fn release_lock(&self, executor_id: &str) -> DatabaseResult<()>;

    /// Read back the persisted record and confirm `executor_id` holds it
    async fn verify_lock_ownership(&self, executor_id: &str) -> DatabaseResult<bool>;

    async fn get_lock_status(&self) -> DatabaseResult<Option<LockStatus>>;

    /// Clear the lock whoever holds it
    async fn force_release_lock(&self) -> DatabaseResult<()>;

    /// Clear the lock if its expiry has passed; `true` when one was reclaimed
    async fn check_and_release_expired_lock(&self) -> DatabaseResult<bool>;
}

/// An already-connected database handle
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn check_connection(&self) -> DatabaseResult<bool>;

    fn schema_history(&self) -> Arc<dyn SchemaHistory>;

    fn transactions(&self) -> TransactionSupport {
        TransactionSupport::Unsupported
    }

    fn backup_store(&self) -> Option<Arc<dyn BackupStore>> {
        None
    }

    fn lock_store(&self) -> Option<Arc<dyn LockStore>> {
        None
    }
}
