//! Migration workflow
//!
//! `MigrationEngine` drives a run through its stages: connection check,
//! history initialization, scan, lock, validation, backup, transactional
//! execution, cleanup and lock release. Failures after the scan are routed
//! to the `RollbackCoordinator` and reported inside the run result; setup
//! failures and happy-path hook failures are returned as errors.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod result;
pub mod state;

pub use result::MigrationRunResult;
pub use state::{StateMachine, WorkflowState};

use crate::config::{IsolationLevel, MigrationConfig, TransactionMode};
use crate::database::{Database, LockStatus};
use crate::error::{MigrationError, MigrationResult, ValidationIssue};
use crate::hooks::{HookChain, MigrationHooks};
use crate::loader::{LoaderRegistry, ScriptLoader};
use crate::locking::LockingOrchestrator;
use crate::rollback::RollbackCoordinator;
use crate::script::{MigrationScript, ScriptSet, UnitMap};
use crate::selector;
use crate::source::{DirectorySource, EmbeddedSource, ScriptSource};
use crate::transaction::{manager_for, TransactionContext, TransactionManager};
use crate::validation::{check_hybrid_batch, PreExecutionValidator, ScriptValidator, ValidationContext};

/// What a unit of work does with each script
enum Direction<'r, D: Database> {
    Up {
        units: &'r UnitMap<D>,
        attempted: &'r Mutex<Vec<MigrationScript>>,
        hook_errors: &'r Mutex<Vec<MigrationError>>,
    },
    Down {
        units: &'r UnitMap<D>,
        reverted: &'r Mutex<Vec<MigrationScript>>,
        hook_errors: &'r Mutex<Vec<MigrationError>>,
    },
}

/// Record `script` as attempted, replacing an earlier entry of the same
/// version when a unit of work is re-run after a commit retry
fn track(log: &Mutex<Vec<MigrationScript>>, script: &MigrationScript) {
    let mut log = log.lock();
    if let Some(index) = log.iter().position(|s| s.version == script.version) {
        log[index] = script.clone();
    } else {
        log.push(script.clone());
    }
}

/// Scanned scripts for the applied versions to revert, latest first.
///
/// History rows carry no source location, so each one is looked up in the
/// scan; versions without a script are reported as errors.
fn reverse_targets(
    scripts: &ScriptSet,
    applied: &[MigrationScript],
) -> (Vec<MigrationScript>, Vec<ValidationIssue>) {
    let mut issues = Vec::new();
    let mut targets = Vec::with_capacity(applied.len());
    for record in applied {
        match scripts.all.iter().find(|s| s.version == record.version) {
            Some(found) => targets.push(found.clone()),
            None => issues.push(ValidationIssue::error(
                Some(record.name.as_str()),
                format!("no script found for applied version {}", record.version),
            )),
        }
    }
    (targets, issues)
}

/// Builder for `MigrationEngine`
pub struct MigrationEngineBuilder<D: Database> {
    db: Arc<D>,
    config: MigrationConfig,
    sources: Vec<Arc<dyn ScriptSource>>,
    loaders: LoaderRegistry<D>,
    hooks: HookChain,
    validators: Vec<Arc<dyn ScriptValidator<D>>>,
}

impl<D: Database> MigrationEngineBuilder<D> {
    pub fn new(db: D) -> Self {
        Self::from_arc(Arc::new(db))
    }

    pub fn from_arc(db: Arc<D>) -> Self {
        Self {
            db,
            config: MigrationConfig::default(),
            sources: Vec::new(),
            loaders: LoaderRegistry::new(),
            hooks: HookChain::new(),
            validators: Vec::new(),
        }
    }

    pub fn config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a script source; without any, the configured folder is scanned
    pub fn source(mut self, source: Arc<dyn ScriptSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Register a loader; loaders are tried in registration order
    pub fn loader(mut self, loader: Arc<dyn ScriptLoader<D>>) -> Self {
        self.loaders.register(loader);
        self
    }

    /// Register embedded scripts as both a source and their loader
    pub fn embedded(mut self, source: EmbeddedSource<D>) -> Self {
        let source = Arc::new(source);
        self.sources.push(source.clone());
        self.loaders.register(source);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn MigrationHooks>) -> Self {
        self.hooks.register(hook);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn ScriptValidator<D>>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn build(self) -> MigrationResult<MigrationEngine<D>> {
        let Self {
            db,
            config,
            mut sources,
            loaders,
            hooks,
            validators,
        } = self;

        config.validate()?;

        if sources.is_empty() {
            sources.push(Arc::new(DirectorySource::from_config(&config)?));
        }

        let executor_id = config
            .executor_id
            .clone()
            .unwrap_or_else(|| format!("migrate-{}", Uuid::new_v4()));
        let hooks = Arc::new(hooks);

        let transactions = manager_for(db.transactions(), &config.transaction, hooks.clone());

        let locking = match (*config.locking.get_enabled(), db.lock_store()) {
            (true, Some(store)) => Some(LockingOrchestrator::new(
                store,
                config.locking.clone(),
                hooks.clone(),
            )),
            (true, None) => {
                warn!("Locking is enabled but the database has no lock store; runs are not serialized");
                None
            }
            (false, _) => None,
        };

        let rollback = RollbackCoordinator::new(
            db.clone(),
            config.rollback_strategy,
            config.backup.clone(),
            hooks.clone(),
        );
        let validator = PreExecutionValidator::new(validators, config.strict_validation);

        info!(
            "Migration engine ready (executor {}, transactions {}, rollback {})",
            executor_id,
            transactions.as_ref().map(|m| m.kind()).unwrap_or("none"),
            config.rollback_strategy
        );

        Ok(MigrationEngine {
            db,
            config: Arc::new(config),
            executor_id,
            sources,
            loaders,
            validator,
            hooks,
            transactions,
            locking,
            rollback,
        })
    }
}

/// Migration execution engine bound to one database handle
pub struct MigrationEngine<D: Database> {
    db: Arc<D>,
    config: Arc<MigrationConfig>,
    executor_id: String,
    sources: Vec<Arc<dyn ScriptSource>>,
    loaders: LoaderRegistry<D>,
    validator: PreExecutionValidator<D>,
    hooks: Arc<HookChain>,
    transactions: Option<Box<dyn TransactionManager>>,
    locking: Option<LockingOrchestrator>,
    rollback: RollbackCoordinator<D>,
}

impl<D: Database> MigrationEngine<D> {
    pub fn builder(db: D) -> MigrationEngineBuilder<D> {
        MigrationEngineBuilder::new(db)
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Name of the transaction manager in use, `None` when scripts run unwrapped
    pub fn transaction_strategy(&self) -> Option<&'static str> {
        self.transactions.as_ref().map(|manager| manager.kind())
    }

    /// Apply every pending migration
    pub async fn migrate(&self) -> MigrationResult<MigrationRunResult> {
        self.run_forward(None).await
    }

    /// Apply pending migrations up to and including `target`
    pub async fn migrate_to_version(&self, target: i64) -> MigrationResult<MigrationRunResult> {
        self.run_forward(Some(target)).await
    }

    /// Revert every applied migration newer than `target`, latest first
    pub async fn rollback_to_version(&self, target: i64) -> MigrationResult<MigrationRunResult> {
        self.run_reverse(move |migrated| selector::get_migrated_down_to(migrated, target))
            .await
    }

    /// Revert applied migrations with `from < version <= to`, latest first
    pub async fn rollback_range(&self, from: i64, to: i64) -> MigrationResult<MigrationRunResult> {
        self.run_reverse(move |migrated| selector::get_migrated_in_range(migrated, from, to))
            .await
    }

    /// Scan sources and history without executing anything
    pub async fn status(&self) -> MigrationResult<ScriptSet> {
        self.check_connection().await?;
        self.db.schema_history().init().await?;
        self.scan(None).await
    }

    /// Run the pre-execution checks against the pending scripts.
    ///
    /// Returns the non-fatal findings; fatal ones are a `Validation` error.
    pub async fn validate(&self) -> MigrationResult<Vec<ValidationIssue>> {
        let scripts = self.status().await?;
        let (units, resolution) = self.loaders.resolve(&scripts.pending).await;
        self.check(&scripts, &units, resolution, true).await
    }

    /// Current lock record, straight from the lock store
    pub async fn lock_status(&self) -> MigrationResult<LockStatus> {
        match &self.locking {
            Some(locking) => Ok(locking
                .get_lock_status()
                .await?
                .unwrap_or_else(LockStatus::unlocked)),
            None => Ok(LockStatus::unlocked()),
        }
    }

    /// Clear the lock whoever holds it; for recovering from crashed executors
    pub async fn force_release_lock(&self) -> MigrationResult<()> {
        match &self.locking {
            Some(locking) => locking.force_release_lock().await,
            None => Err(MigrationError::LockAcquisition(
                "locking is disabled or the database has no lock store".to_string(),
            )),
        }
    }

    async fn check_connection(&self) -> MigrationResult<()> {
        match self.db.check_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(MigrationError::Connection(
                "database is not reachable".to_string(),
            )),
            Err(e) => Err(MigrationError::Connection(e.to_string())),
        }
    }

    async fn scan(&self, target: Option<i64>) -> MigrationResult<ScriptSet> {
        let mut all = Vec::new();
        for source in &self.sources {
            let found = source.scan().await?;
            debug!("Source {} returned {} script(s)", source.name(), found.len());
            all.extend(found);
        }
        all.sort_by_key(|script| script.version);

        let mut migrated: Vec<MigrationScript> = self
            .db
            .schema_history()
            .get_all_executed()
            .await?
            .into_iter()
            .map(MigrationScript::from)
            .collect();
        migrated.sort_by_key(|script| script.version);

        let pending = match target {
            Some(target) => selector::get_pending_up_to(&migrated, &all, target),
            None => selector::get_pending(&migrated, &all),
        };
        let ignored = selector::get_ignored(&migrated, &all);

        Ok(ScriptSet {
            all,
            migrated,
            pending,
            ignored,
            executed: Vec::new(),
        })
    }

    /// Connection check, history initialization and the first scan
    async fn prepare(
        &self,
        states: &mut StateMachine,
        target: Option<i64>,
    ) -> MigrationResult<ScriptSet> {
        states.advance(WorkflowState::CheckingConnection);
        self.check_connection().await?;

        states.advance(WorkflowState::InitializingHistory);
        self.db.schema_history().init().await?;

        states.advance(WorkflowState::Scanning);
        self.scan(target).await
    }

    /// Take the lock and rescan, since another executor may have run
    /// migrations while we waited
    async fn lock_and_rescan(
        &self,
        states: &mut StateMachine,
        target: Option<i64>,
    ) -> MigrationResult<Option<ScriptSet>> {
        let locking = match &self.locking {
            Some(locking) => locking,
            None => return Ok(None),
        };

        states.advance(WorkflowState::Locking);
        locking.init_lock_storage().await?;
        if !locking.acquire_lock(&self.executor_id).await? {
            let holder = locking
                .get_lock_status()
                .await
                .ok()
                .flatten()
                .and_then(|status| status.locked_by)
                .unwrap_or_else(|| "another executor".to_string());
            return Err(MigrationError::LockAcquisition(format!(
                "migration lock is held by {}",
                holder
            )));
        }

        states.advance(WorkflowState::Scanning);
        match self.scan(target).await {
            Ok(scripts) => Ok(Some(scripts)),
            Err(e) => {
                self.release_lock().await;
                Err(e)
            }
        }
    }

    async fn release_lock(&self) {
        if let Some(locking) = &self.locking {
            if let Err(e) = locking.release_lock(&self.executor_id).await {
                error!(
                    "Failed to release migration lock for {}: {}",
                    self.executor_id, e
                );
            }
        }
    }

    async fn run_forward(&self, target: Option<i64>) -> MigrationResult<MigrationRunResult> {
        let started = Instant::now();
        let mut states = StateMachine::new();

        if self.config.dry_run && self.transactions.is_none() {
            warn!("Dry run without transactions: script effects cannot be rolled back");
        }

        let scripts = match self.prepare(&mut states, target).await {
            Ok(scripts) => scripts,
            Err(e) => {
                states.fail();
                return Err(e);
            }
        };

        if !scripts.has_pending() {
            return self.up_to_date(scripts, &mut states, started).await;
        }

        let checked = self.check_transactions(&scripts.pending).await;
        if let Err(e) = checked {
            states.advance(WorkflowState::Validating);
            return self
                .failed(scripts, e, Vec::new(), Vec::new(), &mut states, started)
                .await;
        }

        let scripts = match self.lock_and_rescan(&mut states, target).await {
            Ok(Some(rescanned)) => rescanned,
            Ok(None) => scripts,
            Err(e) => {
                states.fail();
                return Err(e);
            }
        };

        let outcome = self.migrate_locked(scripts, &mut states, started).await;
        self.release_lock().await;
        outcome
    }

    async fn up_to_date(
        &self,
        scripts: ScriptSet,
        states: &mut StateMachine,
        started: Instant,
    ) -> MigrationResult<MigrationRunResult> {
        info!("Database is up to date");
        self.hooks.on_start(&scripts).await?;
        states.advance(WorkflowState::Completed);

        let result = self.result(scripts, Vec::new(), Vec::new(), true, started);
        self.hooks.on_complete(&result).await?;
        Ok(result)
    }

    async fn migrate_locked(
        &self,
        mut scripts: ScriptSet,
        states: &mut StateMachine,
        started: Instant,
    ) -> MigrationResult<MigrationRunResult> {
        if !scripts.has_pending() {
            return self.up_to_date(scripts, states, started).await;
        }

        for script in &scripts.ignored {
            warn!(
                "Ignoring out-of-order migration {} (version {})",
                script.name, script.version
            );
        }
        info!(
            "{} pending migration(s) to apply as {}",
            scripts.pending.len(),
            self.executor_id
        );
        self.hooks.on_start(&scripts).await?;

        states.advance(WorkflowState::Validating);
        let (units, resolution) = self.loaders.resolve(&scripts.pending).await;
        let validate_all = self.config.validate_before_run;
        let warnings = match self.check(&scripts, &units, resolution, validate_all).await {
            Ok(warnings) => warnings,
            Err(e) => return self.failed(scripts, e, Vec::new(), Vec::new(), states, started).await,
        };

        states.advance(WorkflowState::BackingUp);
        let backup_path = match self.rollback.create_backup().await {
            Ok(path) => path,
            Err(e) => return self.failed(scripts, e, Vec::new(), warnings, states, started).await,
        };

        states.advance(WorkflowState::Executing);
        let attempted = Mutex::new(Vec::new());
        let hook_errors = Mutex::new(Vec::new());
        let direction = Direction::Up {
            units: &units,
            attempted: &attempted,
            hook_errors: &hook_errors,
        };
        let outcome = self.run_wrapped(&scripts.pending, &direction).await;
        scripts.executed = attempted.into_inner();

        if let Err(e) = outcome {
            states.advance(WorkflowState::Recovering);
            let mut secondary = hook_errors.into_inner();
            if let Err(recovery_error) = self.recover(&scripts.executed, &units, backup_path).await {
                secondary.push(recovery_error);
            }
            return self
                .failed(scripts, e, secondary, warnings, states, started)
                .await;
        }

        states.advance(WorkflowState::Committing);
        states.advance(WorkflowState::CleaningUp);
        if let Some(path) = &backup_path {
            if let Err(e) = self.rollback.delete_backup(path).await {
                warn!("Failed to delete backup {}: {}", path.display(), e);
            }
        }

        states.advance(WorkflowState::Completed);
        let result = self.result(scripts, Vec::new(), warnings, true, started);
        info!("{}", result.summary());
        self.hooks.on_complete(&result).await?;
        Ok(result)
    }

    /// Reject a batch mixing self-managed and wrapped transactions before
    /// anything is locked or backed up
    async fn check_transactions(&self, scripts: &[MigrationScript]) -> MigrationResult<()> {
        let (units, _) = self.loaders.resolve(scripts).await;
        check_hybrid_batch(scripts, &units, self.config.transaction.mode)
    }

    /// Hybrid batch check, then resolution and validation findings
    async fn check(
        &self,
        scripts: &ScriptSet,
        units: &UnitMap<D>,
        resolution: Vec<ValidationIssue>,
        validate_all: bool,
    ) -> MigrationResult<Vec<ValidationIssue>> {
        check_hybrid_batch(&scripts.pending, units, self.config.transaction.mode)?;

        if validate_all {
            let ctx = ValidationContext {
                scripts,
                units,
                config: self.config.as_ref(),
            };
            return self.validator.validate(&ctx, resolution).await;
        }

        // unresolved scripts cannot run even when validation is off
        if resolution.iter().any(ValidationIssue::is_error) {
            return Err(MigrationError::Validation(resolution));
        }
        Ok(resolution)
    }

    async fn recover(
        &self,
        attempted: &[MigrationScript],
        units: &UnitMap<D>,
        backup_path: Option<PathBuf>,
    ) -> MigrationResult<()> {
        match self
            .rollback
            .rollback(attempted, units, backup_path.as_deref())
            .await
        {
            Ok(()) => {
                if let Some(path) = &backup_path {
                    if let Err(e) = self.rollback.delete_backup(path).await {
                        warn!("Failed to delete backup {}: {}", path.display(), e);
                    }
                }
                Ok(())
            }
            Err(e) => {
                error!("Recovery failed: {}", e);
                if let Some(path) = &backup_path {
                    warn!("Backup kept at {}", path.display());
                }
                Err(e)
            }
        }
    }

    /// Close a failed run: fire `on_error` and build the result.
    ///
    /// `secondary` holds errors raised while handling `error`: failed
    /// per-script error hooks and a failed recovery, in that order.
    async fn failed(
        &self,
        scripts: ScriptSet,
        error: MigrationError,
        secondary: Vec<MigrationError>,
        warnings: Vec<ValidationIssue>,
        states: &mut StateMachine,
        started: Instant,
    ) -> MigrationResult<MigrationRunResult> {
        error!("Migration run failed: {}", error);
        if states.current() != WorkflowState::Recovering {
            states.advance(WorkflowState::Recovering);
        }

        let hook_error = self.hooks.on_error(&error).await.err();
        states.advance(WorkflowState::Failed);

        let mut errors = vec![error];
        errors.extend(secondary);
        errors.extend(hook_error);

        let result = self.result(scripts, errors, warnings, false, started);
        warn!("{}", result.summary());
        Ok(result)
    }

    fn result(
        &self,
        scripts: ScriptSet,
        errors: Vec<MigrationError>,
        warnings: Vec<ValidationIssue>,
        success: bool,
        started: Instant,
    ) -> MigrationRunResult {
        MigrationRunResult {
            success,
            executed: scripts.executed,
            migrated: scripts.migrated,
            ignored: scripts.ignored,
            errors,
            warnings,
            dry_run: self.config.dry_run,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn transaction_context(
        &self,
        mode: TransactionMode,
        isolation: Option<IsolationLevel>,
        scripts: Vec<MigrationScript>,
    ) -> TransactionContext {
        TransactionContext::new(mode, isolation, scripts)
            .with_metadata("executor_id", self.executor_id.clone())
    }

    /// Run `scripts` in order, wrapped according to the transaction mode
    async fn run_wrapped<'a>(
        &'a self,
        scripts: &'a [MigrationScript],
        direction: &'a Direction<'a, D>,
    ) -> MigrationResult<()> {
        let dry_run = self.config.dry_run;
        let mode = self.config.transaction.mode;
        let isolation = self.config.transaction.isolation;

        match &self.transactions {
            Some(manager) if mode == TransactionMode::PerBatch => {
                let mut ctx = self.transaction_context(mode, isolation, scripts.to_vec());
                let work = move || {
                    async move {
                        for script in scripts {
                            self.step(direction, script).await?;
                        }
                        Ok::<(), MigrationError>(())
                    }
                    .boxed()
                };
                manager.run(&mut ctx, &work, dry_run).await
            }
            Some(manager) => {
                for script in scripts {
                    let mut ctx = self.transaction_context(mode, isolation, vec![script.clone()]);
                    let work = move || self.step(direction, script);
                    manager.run(&mut ctx, &work, dry_run).await?;
                }
                Ok(())
            }
            None => {
                for script in scripts {
                    self.step(direction, script).await?;
                }
                Ok(())
            }
        }
    }

    fn step<'a>(
        &'a self,
        direction: &'a Direction<'a, D>,
        script: &'a MigrationScript,
    ) -> BoxFuture<'a, MigrationResult<()>> {
        match direction {
            Direction::Up {
                units,
                attempted,
                hook_errors,
            } => self.apply(script, units, attempted, hook_errors).boxed(),
            Direction::Down {
                units,
                reverted,
                hook_errors,
            } => self.revert(script, units, reverted, hook_errors).boxed(),
        }
    }

    /// Run one forward operation and record it in the history
    async fn apply(
        &self,
        script: &MigrationScript,
        units: &UnitMap<D>,
        attempted: &Mutex<Vec<MigrationScript>>,
        hook_errors: &Mutex<Vec<MigrationError>>,
    ) -> MigrationResult<()> {
        let mut current = script.clone();
        current.started_at = Some(Utc::now());
        current.finished_at = None;
        current.result = None;
        current.dry_run = self.config.dry_run;
        track(attempted, &current);

        let outcome = self.apply_unit(&mut current, units).await;
        if current.finished_at.is_none() {
            current.finished_at = Some(Utc::now());
        }
        track(attempted, &current);

        if let Err(error) = &outcome {
            if let Err(hook_error) = self.hooks.on_migration_error(&current, error).await {
                warn!("Migration error hook failed for {}: {}", current.name, hook_error);
                hook_errors.lock().push(hook_error);
            }
        }
        outcome
    }

    async fn apply_unit(&self, current: &mut MigrationScript, units: &UnitMap<D>) -> MigrationResult<()> {
        let unit = units.get(&current.version).ok_or_else(|| {
            MigrationError::Loader(format!("{} was not resolved to an executable unit", current.name))
        })?;

        self.hooks.on_before_migrate(current).await?;
        let message = unit
            .up(self.db.as_ref(), current)
            .await
            .map_err(|source| MigrationError::Execution {
                script: current.name.clone(),
                source,
            })?;

        current.finished_at = Some(Utc::now());
        current.result = Some(message.clone());
        if !self.config.dry_run {
            self.db.schema_history().save(current.to_record()).await?;
        }

        self.hooks.on_after_migrate(current, &message).await
    }

    /// Run one inverse operation and drop its history row
    async fn revert(
        &self,
        script: &MigrationScript,
        units: &UnitMap<D>,
        reverted: &Mutex<Vec<MigrationScript>>,
        hook_errors: &Mutex<Vec<MigrationError>>,
    ) -> MigrationResult<()> {
        let mut current = script.clone();
        current.started_at = Some(Utc::now());
        current.finished_at = None;
        current.dry_run = self.config.dry_run;
        track(reverted, &current);

        let outcome = async {
            let unit = units.get(&current.version).ok_or_else(|| {
                MigrationError::Loader(format!("{} was not resolved to an executable unit", current.name))
            })?;
            let message = unit
                .down(self.db.as_ref(), &current)
                .await
                .map_err(|source| MigrationError::Execution {
                    script: current.name.clone(),
                    source,
                })?;
            if !self.config.dry_run {
                self.db.schema_history().remove(current.version).await?;
            }
            Ok::<String, MigrationError>(message)
        }
        .await;

        current.finished_at = Some(Utc::now());
        match outcome {
            Ok(message) => {
                current.result = Some(message);
                track(reverted, &current);
                info!("Reverted migration {} - {}", current.version, current.name);
                Ok(())
            }
            Err(error) => {
                track(reverted, &current);
                if let Err(hook_error) = self.hooks.on_migration_error(&current, &error).await {
                    warn!("Migration error hook failed for {}: {}", current.name, hook_error);
                    hook_errors.lock().push(hook_error);
                }
                Err(error)
            }
        }
    }

    async fn run_reverse<S>(&self, select: S) -> MigrationResult<MigrationRunResult>
    where
        S: Fn(&[MigrationScript]) -> Vec<MigrationScript> + Send + Sync,
    {
        let started = Instant::now();
        let mut states = StateMachine::new();

        let scripts = match self.prepare(&mut states, None).await {
            Ok(scripts) => scripts,
            Err(e) => {
                states.fail();
                return Err(e);
            }
        };

        let applied = select(&scripts.migrated);
        if applied.is_empty() {
            info!("Nothing to revert");
            return self.up_to_date(scripts, &mut states, started).await;
        }

        let (targets, _) = reverse_targets(&scripts, &applied);
        if let Err(e) = self.check_transactions(&targets).await {
            states.advance(WorkflowState::Validating);
            return self
                .failed(scripts, e, Vec::new(), Vec::new(), &mut states, started)
                .await;
        }

        let scripts = match self.lock_and_rescan(&mut states, None).await {
            Ok(Some(rescanned)) => rescanned,
            Ok(None) => scripts,
            Err(e) => {
                states.fail();
                return Err(e);
            }
        };

        let outcome = self.revert_locked(scripts, &select, &mut states, started).await;
        self.release_lock().await;
        outcome
    }

    async fn revert_locked<S>(
        &self,
        mut scripts: ScriptSet,
        select: &S,
        states: &mut StateMachine,
        started: Instant,
    ) -> MigrationResult<MigrationRunResult>
    where
        S: Fn(&[MigrationScript]) -> Vec<MigrationScript> + Send + Sync,
    {
        let applied = select(&scripts.migrated);
        if applied.is_empty() {
            return self.up_to_date(scripts, states, started).await;
        }
        info!(
            "{} migration(s) to revert as {}",
            applied.len(),
            self.executor_id
        );

        states.advance(WorkflowState::Validating);
        let (targets, mut issues) = reverse_targets(&scripts, &applied);

        let (units, resolution) = self.loaders.resolve(&targets).await;
        issues.extend(resolution);
        for script in &targets {
            if units.get(&script.version).map(|u| !u.has_down()).unwrap_or(false) {
                issues.push(ValidationIssue::error(
                    Some(script.name.as_str()),
                    "no down operation, cannot be reverted",
                ));
            }
        }

        let checked = match check_hybrid_batch(&targets, &units, self.config.transaction.mode) {
            Ok(()) if issues.iter().any(ValidationIssue::is_error) => {
                Err(MigrationError::Validation(issues))
            }
            Ok(()) => Ok(issues),
            Err(e) => Err(e),
        };
        let warnings = match checked {
            Ok(warnings) => warnings,
            Err(e) => return self.failed(scripts, e, Vec::new(), Vec::new(), states, started).await,
        };

        states.advance(WorkflowState::BackingUp);
        let backup_path = match self.rollback.create_backup().await {
            Ok(path) => path,
            Err(e) => return self.failed(scripts, e, Vec::new(), warnings, states, started).await,
        };

        states.advance(WorkflowState::Executing);
        let reverted = Mutex::new(Vec::new());
        let hook_errors = Mutex::new(Vec::new());
        let direction = Direction::Down {
            units: &units,
            reverted: &reverted,
            hook_errors: &hook_errors,
        };
        let outcome = self.run_wrapped(&targets, &direction).await;
        scripts.executed = reverted.into_inner();

        if let Err(e) = outcome {
            states.advance(WorkflowState::Recovering);
            let mut secondary = hook_errors.into_inner();
            // inverse operations are not themselves reversible, only a backup helps
            if let Some(path) = &backup_path {
                if let Err(recovery_error) = self.rollback.restore_backup(Some(path.as_path())).await {
                    secondary.push(recovery_error);
                }
            }
            return self.failed(scripts, e, secondary, warnings, states, started).await;
        }

        states.advance(WorkflowState::Committing);
        states.advance(WorkflowState::CleaningUp);
        if let Some(path) = &backup_path {
            if let Err(e) = self.rollback.delete_backup(path).await {
                warn!("Failed to delete backup {}: {}", path.display(), e);
            }
        }

        states.advance(WorkflowState::Completed);
        let result = self.result(scripts, Vec::new(), warnings, true, started);
        info!("{}", result.summary());
        self.hooks.on_complete(&result).await?;
        Ok(result)
    }
}
