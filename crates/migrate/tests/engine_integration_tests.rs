//! Integration tests for the migration engine
//!
//! Drives complete runs against the in-memory backend: selection, idempotent
//! reruns, transaction modes with commit retry, dry runs, failure recovery,
//! locking and reverse runs.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use elif_migrate::selector;
use elif_migrate::{
    DatabaseError, EmbeddedSource, FileLoader, MemoryDatabase, MigrationConfig, MigrationEngine,
    MigrationError, MigrationHooks, MigrationRecord, MigrationResult, MigrationScript,
    RollbackStrategy, Runnable, ScriptResult, TransactionContext, TransactionMode,
    TransactionStyle, WorkflowState,
};

/// Writes one key on `up`, removes it on `down`
struct Put {
    key: &'static str,
    reversible: bool,
    fail: bool,
    fail_down: bool,
    own_transaction: bool,
}

impl Put {
    fn new(key: &'static str) -> Self {
        Self {
            key,
            reversible: true,
            fail: false,
            fail_down: false,
            own_transaction: false,
        }
    }

    fn failing(key: &'static str) -> Self {
        Self {
            fail: true,
            ..Self::new(key)
        }
    }

    /// Fails in both directions
    fn stuck(key: &'static str) -> Self {
        Self {
            fail: true,
            fail_down: true,
            ..Self::new(key)
        }
    }

    fn own_transaction(key: &'static str) -> Self {
        Self {
            own_transaction: true,
            ..Self::new(key)
        }
    }
}

#[async_trait]
impl Runnable<MemoryDatabase> for Put {
    async fn up(&self, db: &MemoryDatabase, _script: &MigrationScript) -> ScriptResult<String> {
        if self.fail {
            return Err(format!("cannot create {}", self.key).into());
        }
        db.put(self.key, "created");
        Ok(format!("created {}", self.key))
    }

    fn has_down(&self) -> bool {
        self.reversible
    }

    async fn down(&self, db: &MemoryDatabase, _script: &MigrationScript) -> ScriptResult<String> {
        if self.fail_down {
            return Err(format!("cannot drop {}", self.key).into());
        }
        db.remove(self.key);
        Ok(format!("dropped {}", self.key))
    }

    fn manages_own_transaction(&self) -> bool {
        self.own_transaction
    }
}

/// Records hook calls for assertions
#[derive(Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl MigrationHooks for Recorder {
    async fn on_start(&self, scripts: &elif_migrate::ScriptSet) -> MigrationResult<()> {
        self.push(format!("start:{}", scripts.pending.len()));
        Ok(())
    }

    async fn on_error(&self, error: &MigrationError) -> MigrationResult<()> {
        self.push(format!("error:{}", error));
        Ok(())
    }

    async fn on_after_migrate(&self, script: &MigrationScript, _result: &str) -> MigrationResult<()> {
        self.push(format!("migrated:{}", script.version));
        Ok(())
    }

    async fn after_commit(&self, ctx: &TransactionContext) -> MigrationResult<()> {
        self.push(format!("commit:attempt={}", ctx.attempt));
        Ok(())
    }

    async fn on_commit_retry(
        &self,
        ctx: &TransactionContext,
        _error: &DatabaseError,
    ) -> MigrationResult<()> {
        self.push(format!("retry:attempt={}", ctx.attempt));
        Ok(())
    }

    async fn on_after_restore(&self, _path: &Path) -> MigrationResult<()> {
        self.push("restored".to_string());
        Ok(())
    }
}

/// Fails the hook named by `stage`, passes every other one
struct Refuse {
    stage: &'static str,
}

impl Refuse {
    fn at(stage: &'static str) -> Arc<Self> {
        Arc::new(Self { stage })
    }

    fn check(&self, stage: &str) -> MigrationResult<()> {
        if self.stage == stage {
            return Err(MigrationError::hook(format!("{} refused", stage)));
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationHooks for Refuse {
    async fn on_migration_error(
        &self,
        _script: &MigrationScript,
        _error: &MigrationError,
    ) -> MigrationResult<()> {
        self.check("migration_error")
    }

    async fn before_commit(&self, _ctx: &TransactionContext) -> MigrationResult<()> {
        self.check("before_commit")
    }

    async fn on_lock_acquired(&self, _executor_id: &str) -> MigrationResult<()> {
        self.check("lock_acquired")
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config(backups: &TempDir) -> MigrationConfig {
    init_tracing();
    let mut config = MigrationConfig::default();
    config.folder = backups.path().join("unused");
    config.executor_id = Some("test-executor".to_string());
    config.transaction.retry_delay = Duration::from_millis(1);
    config.locking.set_retry_delay(Duration::from_millis(1));
    config
}

fn core_scripts() -> EmbeddedSource<MemoryDatabase> {
    EmbeddedSource::new("core")
        .with_script("users", 1, Put::new("users"))
        .with_script("posts", 2, Put::new("posts"))
        .with_script("comments", 3, Put::new("comments"))
}

fn engine_with(
    db: &MemoryDatabase,
    config: MigrationConfig,
    source: EmbeddedSource<MemoryDatabase>,
    hook: Arc<dyn MigrationHooks>,
) -> MigrationEngine<MemoryDatabase> {
    MigrationEngine::builder(db.clone())
        .config(config)
        .embedded(source)
        .hook(hook)
        .build()
        .expect("Failed to build engine")
}

fn record(version: i64, name: &str) -> MigrationRecord {
    MigrationRecord {
        name: name.to_string(),
        version,
        checksum: None,
        executed_at: Utc::now(),
        duration_ms: Some(1),
        result: None,
    }
}

#[test]
fn test_selector_partitions_against_history() {
    let all: Vec<MigrationScript> = [1, 2, 3, 4]
        .iter()
        .map(|v| MigrationScript::new(format!("m{}", v), *v, format!("V{}_m.sql", v)))
        .collect();
    let migrated = vec![all[1].clone()];

    let pending: Vec<i64> = selector::get_pending(&migrated, &all).iter().map(|s| s.version).collect();
    assert_eq!(pending, vec![3, 4]);

    let ignored: Vec<i64> = selector::get_ignored(&migrated, &all).iter().map(|s| s.version).collect();
    assert_eq!(ignored, vec![1]);

    let up_to: Vec<i64> = selector::get_pending_up_to(&migrated, &all, 3)
        .iter()
        .map(|s| s.version)
        .collect();
    assert_eq!(up_to, vec![3]);

    let applied = all[..3].to_vec();
    let down_to: Vec<i64> = selector::get_migrated_down_to(&applied, 1)
        .iter()
        .map(|s| s.version)
        .collect();
    assert_eq!(down_to, vec![3, 2]);
}

#[tokio::test]
async fn test_migrate_applies_pending_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    let recorder = Arc::new(Recorder::default());
    let engine = engine_with(&db, test_config(&dir), core_scripts(), recorder.clone());

    let result = engine.migrate().await.unwrap();

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.executed_versions(), vec![1, 2, 3]);
    assert!(result.executed.iter().all(|s| s.result.is_some() && s.finished_at.is_some()));
    assert_eq!(db.history().iter().map(|r| r.version).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(db.contains("users") && db.contains("posts") && db.contains("comments"));

    // one transaction per script by default
    assert_eq!(db.count("begin"), 3);
    assert_eq!(db.count("commit"), 3);
    assert_eq!(db.count("acquire_lock"), 1);
    assert_eq!(db.count("release_lock"), 1);
    assert_eq!(db.count("backup"), 1);
    assert!(!db.in_transaction());

    // the working backup is gone once the run succeeded
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    assert_eq!(recorder.events().first().map(String::as_str), Some("start:3"));
}

#[tokio::test]
async fn test_second_run_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    let engine = engine_with(&db, test_config(&dir), core_scripts(), Arc::new(Recorder::default()));

    assert!(engine.migrate().await.unwrap().success);
    db.clear_operations();

    let result = engine.migrate().await.unwrap();

    assert!(result.success);
    assert!(result.executed.is_empty());
    assert_eq!(result.migrated.len(), 3);
    assert_eq!(db.operations(), vec!["history_init".to_string()]);
}

#[tokio::test]
async fn test_out_of_order_scripts_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    db.insert_history(record(2, "posts"));
    let engine = engine_with(&db, test_config(&dir), core_scripts(), Arc::new(Recorder::default()));

    let status = engine.status().await.unwrap();
    assert_eq!(status.pending.iter().map(|s| s.version).collect::<Vec<_>>(), vec![3]);
    assert_eq!(status.ignored.iter().map(|s| s.version).collect::<Vec<_>>(), vec![1]);

    let result = engine.migrate().await.unwrap();
    assert!(result.success);
    assert_eq!(result.executed_versions(), vec![3]);
    assert_eq!(result.ignored.len(), 1);
    assert!(!db.contains("users"));
}

#[tokio::test]
async fn test_migrate_to_version_stops_at_target() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    let engine = engine_with(&db, test_config(&dir), core_scripts(), Arc::new(Recorder::default()));

    let result = engine.migrate_to_version(2).await.unwrap();

    assert!(result.success);
    assert_eq!(result.executed_versions(), vec![1, 2]);
    assert!(!db.contains("comments"));
}

#[tokio::test]
async fn test_per_batch_commit_retries_until_success() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    db.fail_next_commits(vec![
        DatabaseError::retryable("could not serialize access"),
        DatabaseError::retryable("could not serialize access"),
    ]);

    let mut config = test_config(&dir);
    config.transaction.mode = TransactionMode::PerBatch;
    let recorder = Arc::new(Recorder::default());
    let engine = engine_with(&db, config, core_scripts(), recorder.clone());

    let result = engine.migrate().await.unwrap();

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(db.count("begin"), 1);
    assert_eq!(db.count("commit"), 3);
    assert_eq!(db.count("rollback"), 0);

    let events = recorder.events();
    let retries: Vec<&String> = events.iter().filter(|e| e.starts_with("retry:")).collect();
    assert_eq!(retries, vec!["retry:attempt=1", "retry:attempt=2"]);
    assert!(events.contains(&"commit:attempt=3".to_string()));
    assert_eq!(db.history().len(), 3);
}

#[tokio::test]
async fn test_exhausted_commit_retries_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    db.fail_next_commits((0..4).map(|_| DatabaseError::retryable("deadlock detected")));

    let mut config = test_config(&dir);
    config.transaction.mode = TransactionMode::PerBatch;
    let engine = engine_with(&db, config, core_scripts(), Arc::new(Recorder::default()));

    let result = engine.migrate().await.unwrap();

    assert!(!result.success);
    assert!(matches!(
        result.first_error(),
        Some(MigrationError::CommitFailed { attempts: 4, .. })
    ));
    assert!(db.history().is_empty());
    assert!(db.keys().is_empty());
}

#[tokio::test]
async fn test_dry_run_executes_without_persisting() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());

    let mut config = test_config(&dir);
    config.dry_run = true;
    let engine = engine_with(&db, config, core_scripts(), Arc::new(Recorder::default()));

    let result = engine.migrate().await.unwrap();

    assert!(result.success);
    assert!(result.dry_run);
    assert_eq!(result.executed_versions(), vec![1, 2, 3]);
    assert!(result.executed.iter().all(|s| s.dry_run));
    assert_eq!(db.count("commit"), 0);
    assert_eq!(db.count("rollback"), 3);
    assert!(db.history().is_empty());
    assert!(db.keys().is_empty());
}

#[tokio::test]
async fn test_failure_restores_backup() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    db.put("existing", "kept");

    let source = EmbeddedSource::new("core")
        .with_script("users", 1, Put::new("users"))
        .with_script("posts", 2, Put::failing("posts"))
        .with_script("comments", 3, Put::new("comments"));
    let recorder = Arc::new(Recorder::default());
    let engine = engine_with(&db, test_config(&dir), source, recorder.clone());

    let result = engine.migrate().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.errors.len(), 1);
    assert!(result.first_error().map(MigrationError::is_execution).unwrap_or(false));
    assert_eq!(result.executed_versions(), vec![1, 2]);

    assert_eq!(db.count("restore"), 1);
    assert!(db.history().is_empty());
    assert_eq!(db.keys(), vec!["existing".to_string()]);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    let events = recorder.events();
    assert!(events.contains(&"restored".to_string()));
    assert!(events.iter().any(|e| e.starts_with("error:")));
    // the lock is released even though the run failed
    assert_eq!(db.count("release_lock"), 1);
    assert!(!engine.lock_status().await.unwrap().is_locked);
}

#[tokio::test]
async fn test_failure_with_down_strategy_reverts_committed_scripts() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());

    let mut config = test_config(&dir);
    config.rollback_strategy = RollbackStrategy::Down;
    let source = EmbeddedSource::new("core")
        .with_script("users", 1, Put::new("users"))
        .with_script("posts", 2, Put::failing("posts"));
    let engine = engine_with(&db, config, source, Arc::new(Recorder::default()));

    let result = engine.migrate().await.unwrap();

    assert!(!result.success);
    assert_eq!(db.count("backup"), 0);
    assert!(!db.contains("users"));
    assert!(db.history().is_empty());
}

#[tokio::test]
async fn test_hybrid_batch_is_rejected_before_execution() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    let source = EmbeddedSource::new("core")
        .with_script("users", 1, Put::own_transaction("users"))
        .with_script("posts", 2, Put::new("posts"));
    let engine = engine_with(&db, test_config(&dir), source, Arc::new(Recorder::default()));

    let result = engine.migrate().await.unwrap();

    assert!(!result.success);
    assert!(matches!(result.first_error(), Some(MigrationError::HybridBatch(_))));
    assert!(result.executed.is_empty());
    assert_eq!(db.count("begin"), 0);
    assert_eq!(db.count("backup"), 0);
    // rejected from the first scan, the lock is never taken
    assert_eq!(db.count("acquire_lock"), 0);
    assert_eq!(db.count("release_lock"), 0);
}

#[tokio::test]
async fn test_failed_recovery_still_releases_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());

    let mut config = test_config(&dir);
    config.rollback_strategy = RollbackStrategy::Down;
    let source = EmbeddedSource::new("core")
        .with_script("users", 1, Put::new("users"))
        .with_script("posts", 2, Put::stuck("posts"));
    let engine = engine_with(&db, config, source, Arc::new(Recorder::default()));

    let result = engine.migrate().await.unwrap();

    assert!(!result.success);
    assert_eq!(db.count("backup"), 0);
    assert!(result.first_error().map(MigrationError::is_execution).unwrap_or(false));
    assert!(matches!(result.errors.get(1), Some(MigrationError::Rollback(_))));
    assert_eq!(db.count("release_lock"), 1);
    assert!(!engine.lock_status().await.unwrap().is_locked);
}

#[tokio::test]
async fn test_refused_commit_rolls_the_transaction_back() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());

    let mut config = test_config(&dir);
    config.rollback_strategy = RollbackStrategy::Down;
    let engine = engine_with(&db, config, core_scripts(), Refuse::at("before_commit"));

    let result = engine.migrate().await.unwrap();

    assert!(!result.success);
    assert!(matches!(result.first_error(), Some(MigrationError::Hook(_))));
    assert!(!db.in_transaction());
    assert_eq!(db.count("begin"), 1);
    assert_eq!(db.count("commit"), 0);
    assert_eq!(db.count("rollback"), 1);
    assert!(!db.contains("users"));
    assert!(db.history().is_empty());
    assert!(!engine.lock_status().await.unwrap().is_locked);
}

#[tokio::test]
async fn test_refused_lock_hook_releases_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    let engine = engine_with(&db, test_config(&dir), core_scripts(), Refuse::at("lock_acquired"));

    let error = engine.migrate().await.unwrap_err();

    assert!(matches!(error, MigrationError::Hook(_)));
    assert_eq!(db.count("acquire_lock"), 1);
    assert_eq!(db.count("release_lock"), 1);
    assert_eq!(db.count("begin"), 0);
    assert!(!engine.lock_status().await.unwrap().is_locked);
}

#[tokio::test]
async fn test_failing_error_hook_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    let source = EmbeddedSource::new("core")
        .with_script("users", 1, Put::new("users"))
        .with_script("posts", 2, Put::failing("posts"));
    let engine = engine_with(&db, test_config(&dir), source, Refuse::at("migration_error"));

    let result = engine.migrate().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.errors.len(), 2);
    assert!(result.first_error().map(MigrationError::is_execution).unwrap_or(false));
    match &result.errors[1] {
        MigrationError::Hook(message) => assert!(message.contains("migration_error")),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(db.count("restore"), 1);
    assert!(db.history().is_empty());
}

#[tokio::test]
async fn test_own_transaction_scripts_run_unwrapped_in_mode_none() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    let mut config = test_config(&dir);
    config.transaction.mode = TransactionMode::None;
    let source = EmbeddedSource::new("core")
        .with_script("users", 1, Put::own_transaction("users"))
        .with_script("posts", 2, Put::new("posts"));
    let engine = engine_with(&db, config, source, Arc::new(Recorder::default()));

    assert_eq!(engine.transaction_strategy(), None);
    let result = engine.migrate().await.unwrap();

    assert!(result.success);
    assert_eq!(db.count("begin"), 0);
    assert_eq!(db.history().len(), 2);
}

#[tokio::test]
async fn test_held_lock_blocks_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    db.hold_lock("deploy-42", Duration::from_secs(60));

    let mut config = test_config(&dir);
    config.locking.set_retry_attempts(2);
    let engine = engine_with(&db, config, core_scripts(), Arc::new(Recorder::default()));

    let error = engine.migrate().await.unwrap_err();

    match error {
        MigrationError::LockAcquisition(message) => assert!(message.contains("deploy-42")),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(db.count("acquire_lock"), 3);
    assert_eq!(db.count("begin"), 0);
    assert!(db.history().is_empty());

    let status = engine.lock_status().await.unwrap();
    assert_eq!(status.locked_by.as_deref(), Some("deploy-42"));

    engine.force_release_lock().await.unwrap();
    assert!(engine.migrate().await.unwrap().success);
}

#[tokio::test]
async fn test_expired_lock_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    db.hold_lock("crashed", Duration::ZERO);
    let engine = engine_with(&db, test_config(&dir), core_scripts(), Arc::new(Recorder::default()));

    let result = engine.migrate().await.unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn test_unverified_lock_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    db.set_fail_verification(true);
    let engine = engine_with(&db, test_config(&dir), core_scripts(), Arc::new(Recorder::default()));

    let error = engine.migrate().await.unwrap_err();
    assert!(matches!(error, MigrationError::OwnershipVerification(_)));
    assert_eq!(db.count("begin"), 0);
}

#[tokio::test]
async fn test_rollback_to_version_reverts_latest_first() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    let engine = engine_with(&db, test_config(&dir), core_scripts(), Arc::new(Recorder::default()));
    assert!(engine.migrate().await.unwrap().success);

    let result = engine.rollback_to_version(1).await.unwrap();

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.executed_versions(), vec![3, 2]);
    assert_eq!(db.history().iter().map(|r| r.version).collect::<Vec<_>>(), vec![1]);
    assert_eq!(db.keys(), vec!["users".to_string()]);

    // nothing newer than 1 is left
    db.clear_operations();
    let again = engine.rollback_to_version(1).await.unwrap();
    assert!(again.success && again.executed.is_empty());
    assert_eq!(db.count("acquire_lock"), 0);
}

#[tokio::test]
async fn test_rollback_range_needs_down_operations() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    let source = EmbeddedSource::new("core")
        .with_script("users", 1, Put::new("users"))
        .with_script(
            "seed",
            2,
            Put {
                reversible: false,
                ..Put::new("seed")
            },
        );
    let engine = engine_with(&db, test_config(&dir), source, Arc::new(Recorder::default()));
    assert!(engine.migrate().await.unwrap().success);

    let result = engine.rollback_range(0, 2).await.unwrap();

    assert!(!result.success);
    assert!(matches!(result.first_error(), Some(MigrationError::Validation(_))));
    assert_eq!(db.history().len(), 2);
    assert!(db.contains("seed"));
}

#[tokio::test]
async fn test_callback_transactions_rerun_work_after_commit_failure() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new()
        .with_transactions(TransactionStyle::Callback)
        .with_backup_dir(dir.path());
    db.fail_next_commits(vec![DatabaseError::retryable("serialization failure")]);

    let mut config = test_config(&dir);
    config.transaction.mode = TransactionMode::PerBatch;
    let recorder = Arc::new(Recorder::default());
    let engine = engine_with(&db, config, core_scripts(), recorder.clone());
    assert_eq!(engine.transaction_strategy(), Some("callback"));

    let result = engine.migrate().await.unwrap();

    assert!(result.success, "{:?}", result.errors);
    // the whole batch ran twice, but every script is reported once
    assert_eq!(result.executed_versions(), vec![1, 2, 3]);
    assert_eq!(db.count("begin"), 2);
    assert_eq!(db.count("rollback"), 1);
    assert_eq!(db.count("commit"), 1);
    assert_eq!(db.history().len(), 3);
    assert!(recorder.events().contains(&"commit:attempt=2".to_string()));
}

#[tokio::test]
async fn test_unsupported_transactions_run_unwrapped() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new()
        .with_transactions(TransactionStyle::Unsupported)
        .without_lock_store()
        .with_backup_dir(dir.path());
    let engine = engine_with(&db, test_config(&dir), core_scripts(), Arc::new(Recorder::default()));

    let result = engine.migrate().await.unwrap();

    assert!(result.success);
    assert_eq!(db.count("begin"), 0);
    assert_eq!(db.count("acquire_lock"), 0);
    assert_eq!(db.history().len(), 3);
}

#[tokio::test]
async fn test_unreachable_database_fails_before_anything_else() {
    let dir = tempfile::tempdir().unwrap();
    let db = MemoryDatabase::new().with_backup_dir(dir.path());
    db.set_connected(false);
    let engine = engine_with(&db, test_config(&dir), core_scripts(), Arc::new(Recorder::default()));

    let error = engine.migrate().await.unwrap_err();

    assert!(matches!(error, MigrationError::Connection(_)));
    assert!(db.operations().is_empty());
}

#[tokio::test]
async fn test_directory_scripts_with_file_loader() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("migrations");
    std::fs::create_dir(&folder).unwrap();
    std::fs::write(folder.join("V1_users.kv"), "users").unwrap();
    std::fs::write(folder.join("V2_posts.kv"), "posts").unwrap();

    struct KeyFile(String);

    #[async_trait]
    impl Runnable<MemoryDatabase> for KeyFile {
        async fn up(&self, db: &MemoryDatabase, _script: &MigrationScript) -> ScriptResult<String> {
            db.put(self.0.clone(), "from file");
            Ok(self.0.clone())
        }
    }

    let db = MemoryDatabase::new().with_backup_dir(dir.path().join("backups"));
    let mut config = test_config(&dir);
    config.folder = folder;
    let loader = FileLoader::new("kv", |_script: &MigrationScript, content: String| {
        let unit: Arc<dyn Runnable<MemoryDatabase>> = Arc::new(KeyFile(content.trim().to_string()));
        Ok(unit)
    });

    let engine = MigrationEngine::builder(db.clone())
        .config(config)
        .loader(Arc::new(loader))
        .build()
        .unwrap();

    let warnings = engine.validate().await.unwrap();
    assert!(warnings.is_empty());

    let result = engine.migrate().await.unwrap();
    assert!(result.success);
    assert!(db.contains("users") && db.contains("posts"));
    assert!(db.history().iter().all(|r| r.checksum.is_some()));
}

#[tokio::test]
async fn test_unresolvable_scripts_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("migrations");
    std::fs::create_dir(&folder).unwrap();
    std::fs::write(folder.join("V1_users.unknown"), "users").unwrap();

    let db = MemoryDatabase::new().with_backup_dir(dir.path().join("backups"));
    let mut config = test_config(&dir);
    config.folder = folder;
    config.validate_before_run = false;

    let engine = MigrationEngine::builder(db.clone()).config(config).build().unwrap();
    let result = engine.migrate().await.unwrap();

    assert!(!result.success);
    assert!(matches!(result.first_error(), Some(MigrationError::Validation(_))));
    assert_eq!(db.count("backup"), 0);
}

#[test]
fn test_workflow_states_are_exposed() {
    assert!(WorkflowState::Executing.can_transition_to(WorkflowState::Recovering));
    assert_eq!(WorkflowState::CleaningUp.to_string(), "cleaning_up");
}
