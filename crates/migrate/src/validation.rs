//! Pre-execution validation
//!
//! Runs after scripts were resolved to executable units and before any
//! backup is taken. Built-in rules cover resolution, duplicate versions,
//! missing inverse operations and checksum drift; extra `ScriptValidator`s
//! can be registered on the engine.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{MigrationConfig, RollbackStrategy, TransactionMode};
use crate::database::Database;
use crate::error::{MigrationError, MigrationResult, ValidationIssue};
use crate::script::{MigrationScript, ScriptSet, UnitMap};

/// Everything a validator may inspect
pub struct ValidationContext<'a, D: Database> {
    pub scripts: &'a ScriptSet,
    pub units: &'a UnitMap<D>,
    pub config: &'a MigrationConfig,
}

/// Pluggable validation rule
#[async_trait]
pub trait ScriptValidator<D: Database>: Send + Sync {
    /// Inspect the scan and report findings; an empty list means valid
    async fn validate(&self, ctx: &ValidationContext<'_, D>) -> Vec<ValidationIssue>;

    /// Get the validation rule name
    fn rule_name(&self) -> &'static str;
}

/// Built-in rules plus registered validators
pub struct PreExecutionValidator<D: Database> {
    validators: Vec<Arc<dyn ScriptValidator<D>>>,
    strict: bool,
}

impl<D: Database> PreExecutionValidator<D> {
    pub fn new(validators: Vec<Arc<dyn ScriptValidator<D>>>, strict: bool) -> Self {
        Self { validators, strict }
    }

    /// Collect every finding, including `resolution` issues from loading.
    ///
    /// Errors are always fatal, warnings only in strict mode. Non-fatal
    /// warnings are returned to the caller.
    pub async fn validate(
        &self,
        ctx: &ValidationContext<'_, D>,
        resolution: Vec<ValidationIssue>,
    ) -> MigrationResult<Vec<ValidationIssue>> {
        let mut issues = resolution;
        issues.extend(check_duplicate_versions(&ctx.scripts.all));
        issues.extend(check_down_available(
            &ctx.scripts.pending,
            ctx.units,
            ctx.config.rollback_strategy,
        ));
        issues.extend(check_checksums(&ctx.scripts.all, &ctx.scripts.migrated));

        for validator in &self.validators {
            let found = validator.validate(ctx).await;
            debug!(
                "Validator {} reported {} issue(s)",
                validator.rule_name(),
                found.len()
            );
            issues.extend(found);
        }

        let fatal = issues
            .iter()
            .any(|issue| issue.is_error() || self.strict);
        if fatal {
            return Err(MigrationError::Validation(issues));
        }

        for issue in &issues {
            warn!("{}", issue);
        }
        Ok(issues)
    }
}

/// Two scripts sharing a version cannot be ordered
pub fn check_duplicate_versions(all: &[MigrationScript]) -> Vec<ValidationIssue> {
    let mut seen: HashMap<i64, &str> = HashMap::new();
    let mut issues = Vec::new();

    for script in all {
        if let Some(first) = seen.insert(script.version, &script.name) {
            issues.push(ValidationIssue::error(
                Some(script.name.as_str()),
                format!("version {} is also used by {}", script.version, first),
            ));
        }
    }
    issues
}

/// Scripts without an inverse cannot be undone by a DOWN rollback
pub fn check_down_available<D: Database>(
    pending: &[MigrationScript],
    units: &UnitMap<D>,
    strategy: RollbackStrategy,
) -> Vec<ValidationIssue> {
    if !matches!(strategy, RollbackStrategy::Down | RollbackStrategy::Both) {
        return Vec::new();
    }

    pending
        .iter()
        .filter(|script| {
            units
                .get(&script.version)
                .map(|unit| !unit.has_down())
                .unwrap_or(false)
        })
        .map(|script| {
            ValidationIssue::warning(
                Some(script.name.as_str()),
                format!("no down operation, a {} rollback will skip it", strategy),
            )
        })
        .collect()
}

/// Already applied scripts whose content changed since
pub fn check_checksums(all: &[MigrationScript], migrated: &[MigrationScript]) -> Vec<ValidationIssue> {
    let applied: HashMap<i64, &MigrationScript> =
        migrated.iter().map(|script| (script.version, script)).collect();

    all.iter()
        .filter_map(|script| {
            let record = applied.get(&script.version)?;
            match (&script.checksum, &record.checksum) {
                (Some(current), Some(recorded)) if current != recorded => {
                    Some(ValidationIssue::warning(
                        Some(script.name.as_str()),
                        format!(
                            "checksum changed since it was applied ({} != {})",
                            current, recorded
                        ),
                    ))
                }
                _ => None,
            }
        })
        .collect()
}

/// Reject batches mixing scripts that manage their own transaction with
/// scripts that expect the engine to wrap them
pub fn check_hybrid_batch<D: Database>(
    pending: &[MigrationScript],
    units: &UnitMap<D>,
    mode: TransactionMode,
) -> MigrationResult<()> {
    if mode == TransactionMode::None {
        return Ok(());
    }

    let (own, managed): (Vec<&MigrationScript>, Vec<&MigrationScript>) = pending
        .iter()
        .filter(|script| units.contains_key(&script.version))
        .partition(|script| {
            units
                .get(&script.version)
                .map(|unit| unit.manages_own_transaction())
                .unwrap_or(false)
        });

    if own.is_empty() || managed.is_empty() {
        return Ok(());
    }

    let names: HashSet<&str> = own.iter().map(|script| script.name.as_str()).collect();
    let mut names: Vec<&str> = names.into_iter().collect();
    names.sort_unstable();
    Err(MigrationError::HybridBatch(format!(
        "{} manage their own transaction but transaction mode is {}; run them separately or use NONE",
        names.join(", "),
        mode
    )))
}
