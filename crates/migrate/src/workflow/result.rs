//! Run result record

use crate::error::{MigrationError, ValidationIssue};
use crate::script::MigrationScript;

/// Outcome of one engine operation
#[derive(Debug, Default)]
pub struct MigrationRunResult {
    pub success: bool,
    /// Scripts attempted during the run, in attempt order
    pub executed: Vec<MigrationScript>,
    /// History as read by the scan that planned the run
    pub migrated: Vec<MigrationScript>,
    /// Out-of-order scripts skipped by the run
    pub ignored: Vec<MigrationScript>,
    /// The failure first, then any recovery failures
    pub errors: Vec<MigrationError>,
    /// Non-fatal validation findings
    pub warnings: Vec<ValidationIssue>,
    pub dry_run: bool,
    pub elapsed_ms: u64,
}

impl MigrationRunResult {
    /// Error that made the run fail
    pub fn first_error(&self) -> Option<&MigrationError> {
        self.errors.first()
    }

    pub fn executed_versions(&self) -> Vec<i64> {
        self.executed.iter().map(|script| script.version).collect()
    }

    /// One line summary for logs
    pub fn summary(&self) -> String {
        let outcome = if self.success { "succeeded" } else { "failed" };
        let mode = if self.dry_run { " (dry run)" } else { "" };
        format!(
            "Migration run {}{}: {} executed, {} ignored, {} error(s) in {} ms",
            outcome,
            mode,
            self.executed.len(),
            self.ignored.len(),
            self.errors.len(),
            self.elapsed_ms
        )
    }
}
