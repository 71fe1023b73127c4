//! Cross-process migration lock
//!
//! `LockingOrchestrator` adds retry-on-contention and two-phase ownership
//! verification on top of a pluggable `LockStore`. Contention is an expected
//! outcome and reported as `Ok(false)`; storage failures and failed ownership
//! verification are errors, since a lock problem must block execution.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::LockingConfig;
use crate::database::{LockStatus, LockStore};
use crate::error::{DatabaseError, MigrationError, MigrationResult};
use crate::hooks::{HookChain, MigrationHooks};

pub struct LockingOrchestrator {
    store: Arc<dyn LockStore>,
    config: LockingConfig,
    hooks: Arc<HookChain>,
}

impl LockingOrchestrator {
    pub fn new(store: Arc<dyn LockStore>, config: LockingConfig, hooks: Arc<HookChain>) -> Self {
        Self {
            store,
            config,
            hooks,
        }
    }

    pub fn config(&self) -> &LockingConfig {
        &self.config
    }

    async fn storage_error(&self, executor_id: &str, error: DatabaseError) -> MigrationError {
        let error = MigrationError::LockAcquisition(error.to_string());
        if let Err(hook_error) = self.hooks.on_lock_error(executor_id, &error).await {
            warn!("Lock error hook failed: {}", hook_error);
        }
        error
    }

    /// Create the lock storage and make sure it is usable
    pub async fn init_lock_storage(&self) -> MigrationResult<()> {
        self.store
            .init_lock_storage()
            .await
            .map_err(|e| MigrationError::LockAcquisition(format!("Failed to initialize lock storage: {}", e)))?;

        let accessible = self
            .store
            .ensure_lock_storage_accessible()
            .await
            .map_err(|e| MigrationError::LockAcquisition(format!("Lock storage check failed: {}", e)))?;
        if !accessible {
            return Err(MigrationError::LockAcquisition(
                "Lock storage is not accessible".to_string(),
            ));
        }

        debug!("Lock storage ready");
        Ok(())
    }

    /// Acquire the lock for `executor_id`.
    ///
    /// Returns `Ok(true)` only once the store confirmed ownership, and
    /// `Ok(false)` when the lock is still held by someone else after every
    /// attempt. Any failure after the store granted the lock releases it
    /// again before the error is returned.
    pub async fn acquire_lock(&self, executor_id: &str) -> MigrationResult<bool> {
        self.hooks.on_before_acquire_lock(executor_id).await?;

        let retry_attempts = *self.config.get_retry_attempts();
        let total_attempts = retry_attempts + 1;
        for attempt in 0..=retry_attempts {
            match self.store.check_and_release_expired_lock().await {
                Ok(true) => warn!("Reclaimed expired migration lock"),
                Ok(false) => {}
                Err(e) => return Err(self.storage_error(executor_id, e).await),
            }

            let acquired = match self.store.acquire_lock(executor_id, *self.config.get_timeout()).await {
                Ok(acquired) => acquired,
                Err(e) => return Err(self.storage_error(executor_id, e).await),
            };

            if acquired {
                if let Err(e) = self.confirm(executor_id).await {
                    self.release_after_failure(executor_id).await;
                    return Err(e);
                }
                info!(
                    "Migration lock acquired by {} (attempt {}/{})",
                    executor_id,
                    attempt + 1,
                    total_attempts
                );
                return Ok(true);
            }

            if attempt < retry_attempts {
                let delay = *self.config.get_retry_delay();
                debug!(
                    "Migration lock busy, retrying in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    total_attempts
                );
                self.hooks.on_acquire_retry(executor_id, attempt + 1).await?;
                tokio::time::sleep(delay).await;
            }
        }

        warn!(
            "Failed to acquire migration lock for {} after {} attempt(s)",
            executor_id, total_attempts
        );
        self.hooks.on_lock_acquisition_failed(executor_id).await?;
        Ok(false)
    }

    /// Verify a freshly granted lock and announce it
    async fn confirm(&self, executor_id: &str) -> MigrationResult<()> {
        let verified = match self.store.verify_lock_ownership(executor_id).await {
            Ok(verified) => verified,
            Err(e) => return Err(self.storage_error(executor_id, e).await),
        };

        if !verified {
            warn!(
                "Lock reported acquired by {} but ownership could not be verified",
                executor_id
            );
            if let Err(hook_error) = self.hooks.on_ownership_verification_failed(executor_id).await {
                warn!("Ownership verification hook failed: {}", hook_error);
            }
            return Err(MigrationError::OwnershipVerification(executor_id.to_string()));
        }

        self.hooks.on_lock_acquired(executor_id).await
    }

    async fn release_after_failure(&self, executor_id: &str) {
        match self.store.release_lock(executor_id).await {
            Ok(()) => debug!("Released migration lock for {} after a failed acquisition", executor_id),
            Err(e) => warn!("Failed to release migration lock for {}: {}", executor_id, e),
        }
    }

    /// Release the lock held by `executor_id`.
    ///
    /// Ownership is not re-verified here; the store only releases a lock
    /// recorded for this executor.
    pub async fn release_lock(&self, executor_id: &str) -> MigrationResult<()> {
        if let Err(e) = self.store.release_lock(executor_id).await {
            return Err(self.storage_error(executor_id, e).await);
        }
        debug!("Migration lock released by {}", executor_id);
        self.hooks.on_lock_released(executor_id).await
    }

    /// Clear the lock regardless of its holder.
    ///
    /// Dangerous: only meant for recovering from a crashed executor.
    pub async fn force_release_lock(&self) -> MigrationResult<()> {
        warn!("Force releasing migration lock");
        self.store
            .force_release_lock()
            .await
            .map_err(|e| MigrationError::LockAcquisition(format!("Failed to force release lock: {}", e)))?;
        self.hooks.on_force_release_lock().await
    }

    /// Current lock record, read straight from the store
    pub async fn get_lock_status(&self) -> MigrationResult<Option<LockStatus>> {
        self.store
            .get_lock_status()
            .await
            .map_err(|e| MigrationError::LockAcquisition(format!("Failed to read lock status: {}", e)))
    }

    pub async fn check_and_release_expired_lock(&self) -> MigrationResult<bool> {
        self.store
            .check_and_release_expired_lock()
            .await
            .map_err(|e| MigrationError::LockAcquisition(format!("Failed to release expired lock: {}", e)))
    }
}
