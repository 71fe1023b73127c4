//! Migration scripts, executable units and the per-scan script set

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::database::{Database, MigrationRecord};
use crate::error::ScriptResult;

/// One versioned change unit, discovered by a scan or read back from history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationScript {
    /// Unique display id
    pub name: String,
    /// Monotonic version, usually a timestamp encoding
    pub version: i64,
    /// Where the executable body lives, resolved by a loader
    pub source_location: PathBuf,
    pub checksum: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Executed inside a transaction that was deliberately never committed
    pub dry_run: bool,
    /// Message returned by the forward operation
    pub result: Option<String>,
}

impl MigrationScript {
    pub fn new(name: impl Into<String>, version: i64, source_location: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version,
            source_location: source_location.into(),
            checksum: None,
            started_at: None,
            finished_at: None,
            dry_run: false,
            result: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// File extension of the source location, lowercased
    pub fn extension(&self) -> Option<String> {
        let file_name = self.source_location.file_name()?.to_str()?;
        // `V1_init.up.sql` is an `up.sql` script
        let (_, ext) = file_name.split_once('.')?;
        Some(ext.to_lowercase())
    }

    /// Execution time in milliseconds, once both timestamps are set
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// History row persisted after a successful forward operation
    pub fn to_record(&self) -> MigrationRecord {
        MigrationRecord {
            name: self.name.clone(),
            version: self.version,
            checksum: self.checksum.clone(),
            executed_at: self.finished_at.unwrap_or_else(Utc::now),
            duration_ms: self.duration_ms(),
            result: self.result.clone(),
        }
    }
}

impl From<MigrationRecord> for MigrationScript {
    fn from(record: MigrationRecord) -> Self {
        Self {
            name: record.name,
            version: record.version,
            source_location: PathBuf::new(),
            checksum: record.checksum,
            started_at: None,
            finished_at: Some(record.executed_at),
            dry_run: false,
            result: record.result,
        }
    }
}

/// Executable unit resolved from a script by a loader
#[async_trait]
pub trait Runnable<D: Database>: Send + Sync {
    /// Forward operation; the returned text is kept as the script's result
    async fn up(&self, db: &D, script: &MigrationScript) -> ScriptResult<String>;

    /// Whether `down` is implemented
    fn has_down(&self) -> bool {
        false
    }

    /// Inverse operation
    async fn down(&self, _db: &D, script: &MigrationScript) -> ScriptResult<String> {
        Err(format!("migration {} has no down operation", script.name).into())
    }

    /// Scripts issuing their own BEGIN/COMMIT cannot share a managed transaction
    fn manages_own_transaction(&self) -> bool {
        false
    }
}

/// Executable units resolved for a run, keyed by script version
pub type UnitMap<D> = HashMap<i64, Arc<dyn Runnable<D>>>;

/// Result of one scan against the schema history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSet {
    /// Every discovered script, ascending version
    pub all: Vec<MigrationScript>,
    /// Scripts recorded as executed, ascending version
    pub migrated: Vec<MigrationScript>,
    /// Scripts selected for execution
    pub pending: Vec<MigrationScript>,
    /// Out-of-order scripts that will never run
    pub ignored: Vec<MigrationScript>,
    /// Scripts attempted during the current run, appended before each attempt
    pub executed: Vec<MigrationScript>,
}

impl ScriptSet {
    pub fn latest_migrated_version(&self) -> Option<i64> {
        self.migrated.iter().map(|s| s.version).max()
    }

    /// Pending scripts the history does not know about yet
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
