//! Engine configuration types, builders and the staged loader
//!
//! A run is driven by one immutable `MigrationConfig`. It is assembled by
//! `ConfigLoader` in explicit stages: defaults, an optional YAML/JSON file,
//! `MIGRATE_*` environment variables and finally programmatic overrides.

use serde::{Deserialize, Serialize};
use service_builder::builder;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default prefix for environment variables read by `ConfigLoader`
pub const ENV_PREFIX: &str = "MIGRATE_";

/// Configuration loading and validation errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Missing required configuration: {field} ({hint})")]
    MissingRequired { field: String, hint: String },

    #[error("Failed to read configuration file {path}: {message}")]
    File { path: String, message: String },
}

fn normalize_variant(value: &str) -> String {
    value.trim().to_uppercase().replace(['-', ' '], "_")
}

macro_rules! string_enum {
    ($name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match normalize_variant(s).as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ConfigError::InvalidValue {
                        field: $field.to_string(),
                        value: s.to_string(),
                        expected: [$($text),+].join(", "),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = match self {
                    $($name::$variant => $text,)+
                };
                write!(f, "{}", text)
            }
        }
    };
}

/// Recovery policy applied when a run fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStrategy {
    /// Restore the database from the backup taken before execution
    #[default]
    Backup,
    /// Run the inverse operation of every attempted script
    Down,
    /// Inverse operations first, backup restore if they fail
    Both,
    /// Leave the database as it is
    None,
}

string_enum!(RollbackStrategy, "rollback_strategy", {
    Backup => "BACKUP",
    Down => "DOWN",
    Both => "BOTH",
    None => "NONE",
});

/// Governs when backups are created and restored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupMode {
    /// Create before the run and restore on failure
    #[default]
    Full,
    /// Create before the run, never restore automatically
    CreateOnly,
    /// Never create, restore from an operator supplied backup on failure
    RestoreOnly,
    /// Backups are entirely the operator's business
    Manual,
}

string_enum!(BackupMode, "backup_mode", {
    Full => "FULL",
    CreateOnly => "CREATE_ONLY",
    RestoreOnly => "RESTORE_ONLY",
    Manual => "MANUAL",
});

impl BackupMode {
    pub fn creates_backup(&self) -> bool {
        matches!(self, BackupMode::Full | BackupMode::CreateOnly)
    }

    pub fn restores_on_failure(&self) -> bool {
        matches!(self, BackupMode::Full | BackupMode::RestoreOnly)
    }
}

/// Granularity of transactional wrapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionMode {
    /// One transaction per script
    #[default]
    PerMigration,
    /// One transaction spanning every pending script
    PerBatch,
    /// No wrapping, scripts manage their own transactions
    None,
}

string_enum!(TransactionMode, "transaction_mode", {
    PerMigration => "PER_MIGRATION",
    PerBatch => "PER_BATCH",
    None => "NONE",
});

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

string_enum!(IsolationLevel, "isolation", {
    ReadUncommitted => "READ_UNCOMMITTED",
    ReadCommitted => "READ_COMMITTED",
    RepeatableRead => "REPEATABLE_READ",
    Serializable => "SERIALIZABLE",
});

impl IsolationLevel {
    /// Convert to SQL string for SET TRANSACTION ISOLATION LEVEL command
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Transaction management options
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionConfig {
    pub mode: TransactionMode,
    /// Isolation level requested at begin; `None` keeps the backend default
    pub isolation: Option<IsolationLevel>,
    /// Upper bound for one unit of work inside a transaction
    pub timeout: Option<Duration>,
    /// Commit retries after the first attempt
    pub retries: u32,
    pub retry_delay: Duration,
    /// Double the delay on every retry instead of keeping it constant
    pub retry_backoff: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            mode: TransactionMode::PerMigration,
            isolation: None,
            timeout: None,
            retries: 3,
            retry_delay: Duration::from_millis(100),
            retry_backoff: true,
        }
    }
}

impl TransactionConfig {
    /// Delay to wait before the retry that follows `attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.retry_backoff {
            return self.retry_delay;
        }

        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX)
    }
}

/// Advisory lock options
#[derive(Debug, Clone, PartialEq)]
#[builder]
pub struct LockingConfig {
    /// Serialize runs across processes
    #[builder(default = "true", getter, setter)]
    pub enabled: bool,

    /// How long an acquired lock stays valid before it may be reclaimed
    #[builder(default = "Duration::from_secs(600)", getter, setter)]
    pub timeout: Duration,

    /// Acquisition retries after the first attempt
    #[builder(default = "0", getter, setter)]
    pub retry_attempts: u32,

    #[builder(default = "Duration::from_secs(1)", getter, setter)]
    pub retry_delay: Duration,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(600),
            retry_attempts: 0,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl LockingConfigBuilder {
    /// Locking tuned for parallel deploys where contention is expected
    pub fn production() -> Self {
        LockingConfigBuilder::new()
            .enabled(true)
            .timeout(Duration::from_secs(900))
            .retry_attempts(10)
            .retry_delay(Duration::from_secs(3))
    }

    /// Fast locking for test suites
    pub fn testing() -> Self {
        LockingConfigBuilder::new()
            .enabled(true)
            .timeout(Duration::from_secs(5))
            .retry_attempts(0)
            .retry_delay(Duration::from_millis(1))
    }
}

/// Backup options
#[derive(Debug, Clone, PartialEq)]
#[builder]
pub struct BackupConfig {
    #[builder(default = "BackupMode::Full", getter, setter)]
    pub mode: BackupMode,

    /// Fixed backup used by `BackupMode::RestoreOnly`
    #[builder(default = "None", getter, setter)]
    pub existing_backup_path: Option<PathBuf>,

    /// Remove the working backup once the run is over
    #[builder(default = "true", getter, setter)]
    pub delete_backup: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            mode: BackupMode::Full,
            existing_backup_path: None,
            delete_backup: true,
        }
    }
}

/// Complete configuration for one engine
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationConfig {
    /// Directory scanned by `DirectorySource`
    pub folder: PathBuf,
    /// File name pattern with `version` and `name` capture groups
    pub file_pattern: String,
    pub recursive: bool,
    /// Name of the schema history table or collection
    pub table_name: String,
    /// Identity presented for the advisory lock; generated when absent
    pub executor_id: Option<String>,
    /// Execute everything, persist nothing
    pub dry_run: bool,
    /// Treat validation warnings as fatal
    pub strict_validation: bool,
    pub validate_before_run: bool,
    pub rollback_strategy: RollbackStrategy,
    pub backup: BackupConfig,
    pub transaction: TransactionConfig,
    pub locking: LockingConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::from("migrations"),
            file_pattern: r"^V(?P<version>\d+)_(?P<name>[^.]+)\.(?P<ext>.+)$".to_string(),
            recursive: true,
            table_name: "schema_version".to_string(),
            executor_id: None,
            dry_run: false,
            strict_validation: false,
            validate_before_run: true,
            rollback_strategy: RollbackStrategy::Backup,
            backup: BackupConfig::default(),
            transaction: TransactionConfig::default(),
            locking: LockingConfig::default(),
        }
    }
}

impl MigrationConfig {
    /// Reject combinations the engine cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "table_name".to_string(),
                value: self.table_name.clone(),
                expected: "a non-empty table name".to_string(),
            });
        }

        if let Err(e) = regex::Regex::new(&self.file_pattern) {
            return Err(ConfigError::InvalidValue {
                field: "file_pattern".to_string(),
                value: self.file_pattern.clone(),
                expected: format!("a valid regular expression ({})", e),
            });
        }

        if self.locking.enabled && self.locking.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "locking.timeout".to_string(),
                value: "0".to_string(),
                expected: "a positive lock timeout when locking is enabled".to_string(),
            });
        }

        if let Some(executor_id) = &self.executor_id {
            if executor_id.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "executor_id".to_string(),
                    value: executor_id.clone(),
                    expected: "a non-empty executor id".to_string(),
                });
            }
        }

        let restores_fixed_backup = self.backup.mode == BackupMode::RestoreOnly
            && matches!(
                self.rollback_strategy,
                RollbackStrategy::Backup | RollbackStrategy::Both
            );
        if restores_fixed_backup && self.backup.existing_backup_path.is_none() {
            return Err(ConfigError::MissingRequired {
                field: "backup.existing_backup_path".to_string(),
                hint: "RESTORE_ONLY backups need an operator supplied backup path".to_string(),
            });
        }

        Ok(())
    }
}

/// On-disk representation; every key is optional and only present keys override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub folder: Option<PathBuf>,
    pub file_pattern: Option<String>,
    pub recursive: Option<bool>,
    pub table_name: Option<String>,
    pub executor_id: Option<String>,
    pub dry_run: Option<bool>,
    pub strict_validation: Option<bool>,
    pub validate_before_run: Option<bool>,
    pub rollback_strategy: Option<RollbackStrategy>,
    pub backup: Option<BackupFile>,
    pub transaction: Option<TransactionFile>,
    pub locking: Option<LockingFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupFile {
    pub mode: Option<BackupMode>,
    pub existing_backup_path: Option<PathBuf>,
    pub delete_backup: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionFile {
    pub mode: Option<TransactionMode>,
    pub isolation: Option<IsolationLevel>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub retry_backoff: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingFile {
    pub enabled: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

impl ConfigFile {
    /// Parse a YAML or JSON file, chosen by extension (YAML otherwise)
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let file_error = |message: String| ConfigError::File {
            path: path.display().to_string(),
            message,
        };

        let content = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            serde_json::from_str(&content).map_err(|e| file_error(e.to_string()))
        } else {
            serde_yaml::from_str(&content).map_err(|e| file_error(e.to_string()))
        }
    }

    fn apply(self, config: &mut MigrationConfig) {
        if let Some(folder) = self.folder {
            config.folder = folder;
        }
        if let Some(pattern) = self.file_pattern {
            config.file_pattern = pattern;
        }
        if let Some(recursive) = self.recursive {
            config.recursive = recursive;
        }
        if let Some(table_name) = self.table_name {
            config.table_name = table_name;
        }
        if self.executor_id.is_some() {
            config.executor_id = self.executor_id;
        }
        if let Some(dry_run) = self.dry_run {
            config.dry_run = dry_run;
        }
        if let Some(strict) = self.strict_validation {
            config.strict_validation = strict;
        }
        if let Some(validate) = self.validate_before_run {
            config.validate_before_run = validate;
        }
        if let Some(strategy) = self.rollback_strategy {
            config.rollback_strategy = strategy;
        }

        if let Some(backup) = self.backup {
            if let Some(mode) = backup.mode {
                config.backup.mode = mode;
            }
            if backup.existing_backup_path.is_some() {
                config.backup.existing_backup_path = backup.existing_backup_path;
            }
            if let Some(delete) = backup.delete_backup {
                config.backup.delete_backup = delete;
            }
        }

        if let Some(tx) = self.transaction {
            if let Some(mode) = tx.mode {
                config.transaction.mode = mode;
            }
            if tx.isolation.is_some() {
                config.transaction.isolation = tx.isolation;
            }
            if let Some(timeout) = tx.timeout_ms {
                config.transaction.timeout = Some(Duration::from_millis(timeout));
            }
            if let Some(retries) = tx.retries {
                config.transaction.retries = retries;
            }
            if let Some(delay) = tx.retry_delay_ms {
                config.transaction.retry_delay = Duration::from_millis(delay);
            }
            if let Some(backoff) = tx.retry_backoff {
                config.transaction.retry_backoff = backoff;
            }
        }

        if let Some(locking) = self.locking {
            if let Some(enabled) = locking.enabled {
                config.locking.enabled = enabled;
            }
            if let Some(timeout) = locking.timeout_ms {
                config.locking.timeout = Duration::from_millis(timeout);
            }
            if let Some(attempts) = locking.retry_attempts {
                config.locking.retry_attempts = attempts;
            }
            if let Some(delay) = locking.retry_delay_ms {
                config.locking.retry_delay = Duration::from_millis(delay);
            }
        }
    }
}

type Override = Box<dyn FnOnce(&mut MigrationConfig) + Send>;

/// Staged configuration loader: defaults, file, environment, overrides
pub struct ConfigLoader {
    base: MigrationConfig,
    file: Option<PathBuf>,
    env_prefix: Option<String>,
    overrides: Vec<Override>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            base: MigrationConfig::default(),
            file: None,
            env_prefix: None,
            overrides: Vec::new(),
        }
    }

    /// Start from something other than the built-in defaults
    pub fn with_defaults(mut self, base: MigrationConfig) -> Self {
        self.base = base;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Read `MIGRATE_*` environment variables
    pub fn with_env(self) -> Self {
        self.with_env_prefix(ENV_PREFIX)
    }

    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self
    }

    /// Programmatic override applied after every other stage
    pub fn with_overrides<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut MigrationConfig) + Send + 'static,
    {
        self.overrides.push(Box::new(f));
        self
    }

    /// Merge every stage and validate the result
    pub fn load(self) -> Result<MigrationConfig, ConfigError> {
        let mut config = self.base;

        if let Some(path) = &self.file {
            ConfigFile::from_path(path)?.apply(&mut config);
            tracing::debug!("Applied configuration file {}", path.display());
        }

        if let Some(prefix) = &self.env_prefix {
            apply_env(&mut config, prefix)?;
        }

        for apply in self.overrides {
            apply(&mut config);
        }

        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_value<T>(prefix: &str, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
{
    let name = format!("{}{}", prefix, key);
    match env::var(&name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name,
                value: raw,
                expected: std::any::type_name::<T>().to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_enum<T>(prefix: &str, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr<Err = ConfigError>,
{
    match env::var(format!("{}{}", prefix, key)) {
        Ok(raw) => raw.parse::<T>().map(Some),
        Err(_) => Ok(None),
    }
}

fn apply_env(config: &mut MigrationConfig, prefix: &str) -> Result<(), ConfigError> {
    if let Some(folder) = env_value::<PathBuf>(prefix, "FOLDER")? {
        config.folder = folder;
    }
    if let Some(pattern) = env_value::<String>(prefix, "FILE_PATTERN")? {
        config.file_pattern = pattern;
    }
    if let Some(recursive) = env_value(prefix, "RECURSIVE")? {
        config.recursive = recursive;
    }
    if let Some(table_name) = env_value::<String>(prefix, "TABLE_NAME")? {
        config.table_name = table_name;
    }
    if let Some(executor_id) = env_value::<String>(prefix, "EXECUTOR_ID")? {
        config.executor_id = Some(executor_id);
    }
    if let Some(dry_run) = env_value(prefix, "DRY_RUN")? {
        config.dry_run = dry_run;
    }
    if let Some(strict) = env_value(prefix, "STRICT_VALIDATION")? {
        config.strict_validation = strict;
    }
    if let Some(validate) = env_value(prefix, "VALIDATE_BEFORE_RUN")? {
        config.validate_before_run = validate;
    }
    if let Some(strategy) = env_enum(prefix, "ROLLBACK_STRATEGY")? {
        config.rollback_strategy = strategy;
    }

    if let Some(mode) = env_enum(prefix, "BACKUP_MODE")? {
        config.backup.mode = mode;
    }
    if let Some(path) = env_value::<PathBuf>(prefix, "BACKUP_PATH")? {
        config.backup.existing_backup_path = Some(path);
    }
    if let Some(delete) = env_value(prefix, "BACKUP_DELETE")? {
        config.backup.delete_backup = delete;
    }

    if let Some(mode) = env_enum(prefix, "TRANSACTION_MODE")? {
        config.transaction.mode = mode;
    }
    if let Some(isolation) = env_enum(prefix, "TRANSACTION_ISOLATION")? {
        config.transaction.isolation = Some(isolation);
    }
    if let Some(timeout) = env_value(prefix, "TRANSACTION_TIMEOUT_MS")? {
        config.transaction.timeout = Some(Duration::from_millis(timeout));
    }
    if let Some(retries) = env_value(prefix, "TRANSACTION_RETRIES")? {
        config.transaction.retries = retries;
    }
    if let Some(delay) = env_value(prefix, "TRANSACTION_RETRY_DELAY_MS")? {
        config.transaction.retry_delay = Duration::from_millis(delay);
    }
    if let Some(backoff) = env_value(prefix, "TRANSACTION_RETRY_BACKOFF")? {
        config.transaction.retry_backoff = backoff;
    }

    if let Some(enabled) = env_value(prefix, "LOCKING_ENABLED")? {
        config.locking.enabled = enabled;
    }
    if let Some(timeout) = env_value(prefix, "LOCKING_TIMEOUT_MS")? {
        config.locking.timeout = Duration::from_millis(timeout);
    }
    if let Some(attempts) = env_value(prefix, "LOCKING_RETRY_ATTEMPTS")? {
        config.locking.retry_attempts = attempts;
    }
    if let Some(delay) = env_value(prefix, "LOCKING_RETRY_DELAY_MS")? {
        config.locking.retry_delay = Duration::from_millis(delay);
    }

    Ok(())
}
