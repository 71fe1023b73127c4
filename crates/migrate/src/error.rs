//! Error types for the migration engine
//!
//! `MigrationError` is what every engine operation returns. Backends report
//! failures through `DatabaseError`, which also carries the retry
//! classification the transaction managers rely on.

use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for engine operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Result type alias for backend operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Result type for script bodies (forward and inverse operations)
pub type ScriptResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Failure reported by a database backend
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct DatabaseError {
    message: String,
    code: Option<String>,
    retryable: bool,
}

impl DatabaseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Error carrying a backend specific code (SQLSTATE for SQL databases)
    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
            retryable: false,
        }
    }

    /// Error the backend already knows to be transient
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Whether a commit failing with this error may be attempted again
    pub fn is_retryable(&self) -> bool {
        self.retryable || is_serialization_failure(&self.message, self.code.as_deref())
    }
}

/// Check if an error represents a serialization failure or deadlock
pub fn is_serialization_failure(message: &str, code: Option<&str>) -> bool {
    if let Some(code) = code {
        // serialization_failure, deadlock_detected
        if code == "40001" || code == "40P01" {
            return true;
        }
    }

    let message = message.to_lowercase();
    message.contains("40001")
        || message.contains("40p01")
        || message.contains("could not serialize access")
        || message.contains("deadlock")
}

/// Severity of a pre-execution validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Warning => write!(f, "WARNING"),
        }
    }
}

/// One finding produced while validating scripts before execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Name of the offending script, when the issue is tied to one
    pub script: Option<String>,
    pub severity: Severity,
    pub message: String,
}

impl ValidationIssue {
    pub fn error(script: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            script: script.map(str::to_string),
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn warning(script: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            script: script.map(str::to_string),
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.script {
            Some(script) => write!(f, "[{}] {}: {}", self.severity, script, self.message),
            None => write!(f, "[{}] {}", self.severity, self.message),
        }
    }
}

/// Error types for migration engine operations
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Validation failed: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("Hybrid batch rejected: {0}")]
    HybridBatch(String),

    #[error("Lock acquisition failed: {0}")]
    LockAcquisition(String),

    #[error("Lock ownership verification failed for executor '{0}'")]
    OwnershipVerification(String),

    #[error("Migration {script} failed: {source}")]
    Execution {
        script: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Transaction error: {0}")]
    Transaction(#[source] DatabaseError),

    #[error("Commit failed after {attempts} attempt(s): {source}")]
    CommitFailed {
        attempts: u32,
        #[source]
        source: DatabaseError,
    },

    #[error("Backup error: {0}")]
    Backup(String),

    #[error("Rollback error: {0}")]
    Rollback(String),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("Loader error: {0}")]
    Loader(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrationError {
    pub fn hook(message: impl Into<String>) -> Self {
        MigrationError::Hook(message.into())
    }

    /// Whether the error came out of a script body rather than the engine
    pub fn is_execution(&self) -> bool {
        matches!(self, MigrationError::Execution { .. })
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
