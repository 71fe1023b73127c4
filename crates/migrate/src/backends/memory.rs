//! In-memory database for development and testing
//!
//! Implements every capability the engine can consume: schema history,
//! imperative or callback transactions, file backed backups and a TTL lock
//! store. Transactions snapshot the whole state at begin and restore it on
//! rollback. Failures can be injected to exercise the recovery paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::IsolationLevel;
use crate::database::{
    BackupStore, CallbackTransactions, Database, ImperativeTransactions, LockStatus, LockStore,
    MigrationRecord, SchemaHistory, TransactionSupport, TransactionWork,
};
use crate::error::{DatabaseError, DatabaseResult};

/// Transaction primitive advertised by a `MemoryDatabase`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStyle {
    Imperative,
    Callback,
    Unsupported,
}

/// Everything a transaction or a backup has to capture
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Snapshot {
    data: BTreeMap<String, String>,
    history: BTreeMap<i64, MigrationRecord>,
}

#[derive(Debug, Clone)]
struct LockRecord {
    holder: String,
    locked_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LockRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

struct MemoryState {
    tables: Mutex<Snapshot>,
    /// State captured by an open imperative transaction
    transaction: Mutex<Option<Snapshot>>,
    commit_failures: Mutex<VecDeque<DatabaseError>>,
    lock: Mutex<Option<LockRecord>>,
    operations: Mutex<Vec<String>>,
    connected: AtomicBool,
    fail_verification: AtomicBool,
    lock_storage_broken: AtomicBool,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            tables: Mutex::new(Snapshot::default()),
            transaction: Mutex::new(None),
            commit_failures: Mutex::new(VecDeque::new()),
            lock: Mutex::new(None),
            operations: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            fail_verification: AtomicBool::new(false),
            lock_storage_broken: AtomicBool::new(false),
        }
    }
}

/// In-memory database handle; clones share the same state
#[derive(Clone)]
pub struct MemoryDatabase {
    state: Arc<MemoryState>,
    style: TransactionStyle,
    backups: bool,
    locking: bool,
    backup_dir: PathBuf,
}

impl MemoryDatabase {
    /// Database with imperative transactions, backups and a lock store
    pub fn new() -> Self {
        Self {
            state: Arc::new(MemoryState::default()),
            style: TransactionStyle::Imperative,
            backups: true,
            locking: true,
            backup_dir: std::env::temp_dir(),
        }
    }

    pub fn with_transactions(mut self, style: TransactionStyle) -> Self {
        self.style = style;
        self
    }

    pub fn without_backups(mut self) -> Self {
        self.backups = false;
        self
    }

    pub fn without_lock_store(mut self) -> Self {
        self.locking = false;
        self
    }

    /// Directory receiving backup files
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    fn record(&self, operation: impl Into<String>) {
        self.state.operations.lock().push(operation.into());
    }

    // Data access used by migration bodies

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.tables.lock().data.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.state.tables.lock().data.get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.state.tables.lock().data.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.tables.lock().data.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.tables.lock().data.keys().cloned().collect()
    }

    /// Persisted history rows, ascending version
    pub fn history(&self) -> Vec<MigrationRecord> {
        self.state.tables.lock().history.values().cloned().collect()
    }

    /// Seed a history row without running anything
    pub fn insert_history(&self, record: MigrationRecord) {
        self.state
            .tables
            .lock()
            .history
            .insert(record.version, record);
    }

    pub fn in_transaction(&self) -> bool {
        self.state.transaction.lock().is_some()
    }

    // Introspection and fault injection

    /// Every backend operation performed so far, in order
    pub fn operations(&self) -> Vec<String> {
        self.state.operations.lock().clone()
    }

    /// Number of recorded operations named `operation`
    pub fn count(&self, operation: &str) -> usize {
        self.state
            .operations
            .lock()
            .iter()
            .filter(|op| op.as_str() == operation)
            .count()
    }

    pub fn clear_operations(&self) {
        self.state.operations.lock().clear();
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    /// Fail the next commits with the given errors, one per commit
    pub fn fail_next_commits(&self, errors: impl IntoIterator<Item = DatabaseError>) {
        self.state.commit_failures.lock().extend(errors);
    }

    /// Make ownership verification fail even for the actual holder
    pub fn set_fail_verification(&self, fail: bool) {
        self.state.fail_verification.store(fail, Ordering::SeqCst);
    }

    pub fn set_lock_storage_broken(&self, broken: bool) {
        self.state.lock_storage_broken.store(broken, Ordering::SeqCst);
    }

    /// Record a lock held by another executor
    pub fn hold_lock(&self, executor_id: &str, ttl: Duration) {
        let now = Utc::now();
        *self.state.lock.lock() = Some(LockRecord {
            holder: executor_id.to_string(),
            locked_at: now,
            expires_at: now + to_chrono(ttl),
        });
    }

    fn next_commit_failure(&self) -> Option<DatabaseError> {
        self.state.commit_failures.lock().pop_front()
    }

    fn check_lock_storage(&self) -> DatabaseResult<()> {
        if self.state.lock_storage_broken.load(Ordering::SeqCst) {
            return Err(DatabaseError::new("lock storage unavailable"));
        }
        Ok(())
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl SchemaHistory for MemoryDatabase {
    async fn init(&self) -> DatabaseResult<()> {
        self.record("history_init");
        Ok(())
    }

    async fn get_all_executed(&self) -> DatabaseResult<Vec<MigrationRecord>> {
        Ok(self.history())
    }

    async fn save(&self, record: MigrationRecord) -> DatabaseResult<()> {
        self.record(format!("history_save:{}", record.version));
        self.insert_history(record);
        Ok(())
    }

    async fn remove(&self, version: i64) -> DatabaseResult<()> {
        self.record(format!("history_remove:{}", version));
        self.state.tables.lock().history.remove(&version);
        Ok(())
    }
}

#[async_trait]
impl ImperativeTransactions for MemoryDatabase {
    async fn begin(&self, _isolation: Option<IsolationLevel>) -> DatabaseResult<()> {
        self.record("begin");
        let snapshot = self.state.tables.lock().clone();
        let mut transaction = self.state.transaction.lock();
        if transaction.is_some() {
            return Err(DatabaseError::new("transaction already in progress"));
        }
        *transaction = Some(snapshot);
        Ok(())
    }

    async fn commit(&self) -> DatabaseResult<()> {
        self.record("commit");
        if let Some(error) = self.next_commit_failure() {
            return Err(error);
        }
        match self.state.transaction.lock().take() {
            Some(_) => Ok(()),
            None => Err(DatabaseError::new("no transaction in progress")),
        }
    }

    async fn rollback(&self) -> DatabaseResult<()> {
        self.record("rollback");
        let snapshot = self
            .state
            .transaction
            .lock()
            .take()
            .ok_or_else(|| DatabaseError::new("no transaction in progress"))?;
        *self.state.tables.lock() = snapshot;
        Ok(())
    }
}

#[async_trait]
impl CallbackTransactions for MemoryDatabase {
    async fn run_in_transaction<'a>(
        &self,
        _isolation: Option<IsolationLevel>,
        work: TransactionWork<'a>,
    ) -> DatabaseResult<()> {
        self.record("begin");
        let snapshot = self.state.tables.lock().clone();

        let mut outcome = work.await;
        if outcome.is_ok() {
            if let Some(error) = self.next_commit_failure() {
                outcome = Err(error);
            }
        }

        match outcome {
            Ok(()) => {
                self.record("commit");
                Ok(())
            }
            Err(error) => {
                self.record("rollback");
                *self.state.tables.lock() = snapshot;
                Err(error)
            }
        }
    }
}

#[async_trait]
impl BackupStore for MemoryDatabase {
    async fn backup(&self) -> DatabaseResult<PathBuf> {
        self.record("backup");
        let snapshot = self.state.tables.lock().clone();
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| DatabaseError::new(format!("Failed to serialize backup: {}", e)))?;

        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| DatabaseError::new(format!("Failed to create backup directory: {}", e)))?;
        let path = self
            .backup_dir
            .join(format!("memory-backup-{}.json", Uuid::new_v4()));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| DatabaseError::new(format!("Failed to write backup: {}", e)))?;

        Ok(path)
    }

    async fn restore(&self, path: &Path) -> DatabaseResult<()> {
        self.record("restore");
        if self.in_transaction() {
            return Err(DatabaseError::new(
                "cannot restore a backup while a transaction is open",
            ));
        }
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            DatabaseError::new(format!("Failed to read backup {}: {}", path.display(), e))
        })?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| DatabaseError::new(format!("Corrupt backup {}: {}", path.display(), e)))?;

        *self.state.tables.lock() = snapshot;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> DatabaseResult<()> {
        self.record("delete_backup");
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

#[async_trait]
impl LockStore for MemoryDatabase {
    async fn init_lock_storage(&self) -> DatabaseResult<()> {
        self.record("init_lock_storage");
        self.check_lock_storage()
    }

    async fn ensure_lock_storage_accessible(&self) -> DatabaseResult<bool> {
        Ok(!self.state.lock_storage_broken.load(Ordering::SeqCst))
    }

    async fn acquire_lock(&self, executor_id: &str, ttl: Duration) -> DatabaseResult<bool> {
        self.record("acquire_lock");
        self.check_lock_storage()?;

        let now = Utc::now();
        let mut lock = self.state.lock.lock();
        if let Some(existing) = lock.as_ref() {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }

        *lock = Some(LockRecord {
            holder: executor_id.to_string(),
            locked_at: now,
            expires_at: now + to_chrono(ttl),
        });
        Ok(true)
    }

    async fn release_lock(&self, executor_id: &str) -> DatabaseResult<()> {
        self.record("release_lock");
        self.check_lock_storage()?;

        let mut lock = self.state.lock.lock();
        if lock.as_ref().map(|l| l.holder == executor_id).unwrap_or(false) {
            *lock = None;
        }
        Ok(())
    }

    async fn verify_lock_ownership(&self, executor_id: &str) -> DatabaseResult<bool> {
        self.check_lock_storage()?;
        if self.state.fail_verification.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let now = Utc::now();
        Ok(self
            .state
            .lock
            .lock()
            .as_ref()
            .map(|l| l.holder == executor_id && !l.is_expired(now))
            .unwrap_or(false))
    }

    async fn get_lock_status(&self) -> DatabaseResult<Option<LockStatus>> {
        self.check_lock_storage()?;
        Ok(self.state.lock.lock().as_ref().map(|l| LockStatus {
            is_locked: true,
            locked_by: Some(l.holder.clone()),
            locked_at: Some(l.locked_at),
            expires_at: Some(l.expires_at),
        }))
    }

    async fn force_release_lock(&self) -> DatabaseResult<()> {
        self.record("force_release_lock");
        self.check_lock_storage()?;
        *self.state.lock.lock() = None;
        Ok(())
    }

    async fn check_and_release_expired_lock(&self) -> DatabaseResult<bool> {
        self.check_lock_storage()?;
        let now = Utc::now();
        let mut lock = self.state.lock.lock();
        match lock.as_ref() {
            Some(existing) if existing.is_expired(now) => {
                *lock = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn check_connection(&self) -> DatabaseResult<bool> {
        Ok(self.state.connected.load(Ordering::SeqCst))
    }

    fn schema_history(&self) -> Arc<dyn SchemaHistory> {
        Arc::new(self.clone())
    }

    fn transactions(&self) -> TransactionSupport {
        match self.style {
            TransactionStyle::Imperative => TransactionSupport::Imperative(Arc::new(self.clone())),
            TransactionStyle::Callback => TransactionSupport::Callback(Arc::new(self.clone())),
            TransactionStyle::Unsupported => TransactionSupport::Unsupported,
        }
    }

    fn backup_store(&self) -> Option<Arc<dyn BackupStore>> {
        if self.backups {
            Some(Arc::new(self.clone()))
        } else {
            None
        }
    }

    fn lock_store(&self) -> Option<Arc<dyn LockStore>> {
        if self.locking {
            Some(Arc::new(self.clone()))
        } else {
            None
        }
    }
}
