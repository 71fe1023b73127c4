//! Failure recovery
//!
//! `RollbackCoordinator` owns the backup lifecycle of a run and, when the
//! run fails, dispatches recovery according to the configured
//! `RollbackStrategy`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{BackupConfig, BackupMode, RollbackStrategy};
use crate::database::{BackupStore, Database};
use crate::error::{MigrationError, MigrationResult};
use crate::hooks::{HookChain, MigrationHooks};
use crate::script::{MigrationScript, UnitMap};

pub struct RollbackCoordinator<D: Database> {
    db: Arc<D>,
    backup_store: Option<Arc<dyn BackupStore>>,
    strategy: RollbackStrategy,
    backup: BackupConfig,
    hooks: Arc<HookChain>,
}

impl<D: Database> RollbackCoordinator<D> {
    pub fn new(
        db: Arc<D>,
        strategy: RollbackStrategy,
        backup: BackupConfig,
        hooks: Arc<HookChain>,
    ) -> Self {
        let backup_store = db.backup_store();
        Self {
            db,
            backup_store,
            strategy,
            backup,
            hooks,
        }
    }

    pub fn strategy(&self) -> RollbackStrategy {
        self.strategy
    }

    /// A backup is only worth taking when a strategy may restore it
    pub fn should_create_backup(&self) -> bool {
        matches!(
            self.strategy,
            RollbackStrategy::Backup | RollbackStrategy::Both
        ) && self.backup.get_mode().creates_backup()
            && self.backup_store.is_some()
    }

    /// Take the pre-execution backup; `None` when no backup is needed
    pub async fn create_backup(&self) -> MigrationResult<Option<PathBuf>> {
        let store = match &self.backup_store {
            Some(store) if self.should_create_backup() => store,
            _ => {
                debug!("Skipping backup (strategy {}, mode {})", self.strategy, self.backup.get_mode());
                return Ok(None);
            }
        };

        self.hooks.on_before_backup().await?;
        let path = store
            .backup()
            .await
            .map_err(|e| MigrationError::Backup(format!("Failed to create backup: {}", e)))?;
        info!("Backup created at {}", path.display());
        self.hooks.on_after_backup(&path).await?;

        Ok(Some(path))
    }

    /// Remove a working backup once it is no longer needed
    pub async fn delete_backup(&self, path: &Path) -> MigrationResult<()> {
        if !*self.backup.get_delete_backup() {
            debug!("Keeping backup {}", path.display());
            return Ok(());
        }
        if self.backup.get_existing_backup_path().as_deref() == Some(path) {
            // operator supplied, never ours to delete
            return Ok(());
        }

        let store = self
            .backup_store
            .as_ref()
            .ok_or_else(|| MigrationError::Backup("Database has no backup capability".to_string()))?;
        store
            .delete(path)
            .await
            .map_err(|e| MigrationError::Backup(format!("Failed to delete backup: {}", e)))?;
        debug!("Deleted backup {}", path.display());
        Ok(())
    }

    /// Recover from a failed run.
    ///
    /// `attempted` lists the scripts in the order they were attempted, the
    /// failing one last.
    pub async fn rollback(
        &self,
        attempted: &[MigrationScript],
        units: &UnitMap<D>,
        backup_path: Option<&Path>,
    ) -> MigrationResult<()> {
        info!(
            "Rolling back {} attempted migration(s) with strategy {}",
            attempted.len(),
            self.strategy
        );

        match self.strategy {
            RollbackStrategy::Backup => self.restore_backup(backup_path).await,
            RollbackStrategy::Down => self.run_down(attempted, units).await,
            RollbackStrategy::Both => match self.run_down(attempted, units).await {
                Ok(()) => Ok(()),
                Err(down_error) => {
                    warn!("Down migrations failed ({}), restoring backup", down_error);
                    self.restore_backup(backup_path).await.map_err(|restore_error| {
                        MigrationError::Rollback(format!(
                            "down migrations failed ({}) and backup restore failed ({})",
                            down_error, restore_error
                        ))
                    })
                }
            },
            RollbackStrategy::None => {
                warn!("Rollback strategy is NONE; the database may be left in an inconsistent state");
                Ok(())
            }
        }
    }

    /// Restore the backup selected by the backup mode
    pub async fn restore_backup(&self, backup_path: Option<&Path>) -> MigrationResult<()> {
        if !self.backup.get_mode().restores_on_failure() {
            warn!(
                "Backup mode {} does not restore automatically; skipping restore",
                self.backup.get_mode()
            );
            return Ok(());
        }

        let path = match *self.backup.get_mode() {
            BackupMode::RestoreOnly => self.backup.get_existing_backup_path().as_deref().ok_or_else(|| {
                MigrationError::Backup("RESTORE_ONLY mode requires an existing backup path".to_string())
            })?,
            _ => backup_path.ok_or_else(|| {
                MigrationError::Backup("No backup was created for this run".to_string())
            })?,
        };
        let store = self
            .backup_store
            .as_ref()
            .ok_or_else(|| MigrationError::Backup("Database has no backup capability".to_string()))?;

        self.hooks.on_before_restore(path).await?;
        store
            .restore(path)
            .await
            .map_err(|e| MigrationError::Backup(format!("Failed to restore backup: {}", e)))?;
        info!("Database restored from {}", path.display());
        self.hooks.on_after_restore(path).await?;

        if *self.backup.get_mode() != BackupMode::RestoreOnly {
            if let Err(e) = self.delete_backup(path).await {
                warn!("Restored backup could not be deleted: {}", e);
            }
        }
        Ok(())
    }

    async fn run_down(&self, attempted: &[MigrationScript], units: &UnitMap<D>) -> MigrationResult<()> {
        let history = self.db.schema_history();

        for script in attempted.iter().rev() {
            let unit = match units.get(&script.version) {
                Some(unit) if unit.has_down() => unit,
                _ => {
                    warn!("Migration {} has no down operation, skipping", script.name);
                    continue;
                }
            };

            debug!("Running down migration {}", script.name);
            if let Err(e) = unit.down(self.db.as_ref(), script).await {
                error!("Down migration {} failed: {}", script.name, e);
                return Err(MigrationError::Rollback(format!(
                    "down migration {} failed: {}",
                    script.name, e
                )));
            }
            history.remove(script.version).await.map_err(|e| {
                MigrationError::Rollback(format!(
                    "failed to remove history of {}: {}",
                    script.name, e
                ))
            })?;
            info!("Reverted migration {}", script.name);
        }

        Ok(())
    }
}
