//! Migration selection
//!
//! Pure functions partitioning discovered scripts against the executed
//! history. Inputs are expected in ascending version order; outputs keep
//! ascending order for forward work and descending order for reverse work.
//! Scripts are matched by version, never by identity.

use std::collections::HashSet;

use crate::script::MigrationScript;

fn last_version(migrated: &[MigrationScript]) -> Option<i64> {
    migrated.iter().map(|s| s.version).max()
}

fn ascending(mut scripts: Vec<MigrationScript>) -> Vec<MigrationScript> {
    scripts.sort_by_key(|s| s.version);
    scripts
}

fn descending(mut scripts: Vec<MigrationScript>) -> Vec<MigrationScript> {
    scripts.sort_by(|a, b| b.version.cmp(&a.version));
    scripts
}

/// Scripts newer than the latest executed version
pub fn get_pending(migrated: &[MigrationScript], all: &[MigrationScript]) -> Vec<MigrationScript> {
    let pending = match last_version(migrated) {
        Some(last) => all.iter().filter(|s| s.version > last).cloned().collect(),
        None => all.to_vec(),
    };
    ascending(pending)
}

/// Scripts at or below the latest executed version that never ran
pub fn get_ignored(migrated: &[MigrationScript], all: &[MigrationScript]) -> Vec<MigrationScript> {
    let Some(last) = last_version(migrated) else {
        return Vec::new();
    };

    let executed: HashSet<i64> = migrated.iter().map(|s| s.version).collect();
    let ignored = all
        .iter()
        .filter(|s| s.version <= last && !executed.contains(&s.version))
        .cloned()
        .collect();
    ascending(ignored)
}

/// Pending scripts up to and including `target`
pub fn get_pending_up_to(
    migrated: &[MigrationScript],
    all: &[MigrationScript],
    target: i64,
) -> Vec<MigrationScript> {
    get_pending(migrated, all)
        .into_iter()
        .filter(|s| s.version <= target)
        .collect()
}

/// Executed scripts newer than `target`, latest first
pub fn get_migrated_down_to(migrated: &[MigrationScript], target: i64) -> Vec<MigrationScript> {
    descending(
        migrated
            .iter()
            .filter(|s| s.version > target)
            .cloned()
            .collect(),
    )
}

/// Executed scripts in `(from, to]`, latest first
pub fn get_migrated_in_range(
    migrated: &[MigrationScript],
    from: i64,
    to: i64,
) -> Vec<MigrationScript> {
    if from >= to {
        return Vec::new();
    }

    descending(
        migrated
            .iter()
            .filter(|s| s.version > from && s.version <= to)
            .cloned()
            .collect(),
    )
}
