//! Script discovery
//!
//! Sources produce the `MigrationScript`s an engine considers. A
//! `DirectorySource` scans a folder for versioned files; an `EmbeddedSource`
//! carries scripts compiled into the binary and doubles as their loader.

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::MigrationConfig;
use crate::database::Database;
use crate::error::{MigrationError, MigrationResult};
use crate::loader::ScriptLoader;
use crate::script::{MigrationScript, Runnable};

#[async_trait]
pub trait ScriptSource: Send + Sync {
    fn name(&self) -> &str;

    /// Discover scripts; order does not matter, the engine sorts by version
    async fn scan(&self) -> MigrationResult<Vec<MigrationScript>>;
}

/// SHA-256 of a script body, hex encoded
pub fn checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Scans a folder for files named like `V<version>_<name>.<ext>`
pub struct DirectorySource {
    folder: PathBuf,
    pattern: Regex,
    recursive: bool,
}

impl DirectorySource {
    /// `pattern` must capture `version` and `name`
    pub fn new(folder: impl Into<PathBuf>, pattern: &str, recursive: bool) -> MigrationResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| MigrationError::Loader(format!("invalid file pattern: {}", e)))?;

        let groups: Vec<&str> = pattern.capture_names().flatten().collect();
        if !groups.contains(&"version") || !groups.contains(&"name") {
            return Err(MigrationError::Loader(
                "file pattern must capture `version` and `name`".to_string(),
            ));
        }

        Ok(Self {
            folder: folder.into(),
            pattern,
            recursive,
        })
    }

    pub fn from_config(config: &MigrationConfig) -> MigrationResult<Self> {
        Self::new(&config.folder, &config.file_pattern, config.recursive)
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn parse(&self, path: &Path) -> Option<(i64, String)> {
        let file_name = path.file_name()?.to_str()?;
        let captures = self.pattern.captures(file_name)?;

        let version = captures.name("version")?.as_str();
        let name = captures.name("name")?.as_str();
        match version.parse::<i64>() {
            Ok(version) => Some((version, name.to_string())),
            Err(_) => {
                warn!("Ignoring {}: version {} is not a number", path.display(), version);
                None
            }
        }
    }
}

#[async_trait]
impl ScriptSource for DirectorySource {
    fn name(&self) -> &str {
        "directory"
    }

    async fn scan(&self) -> MigrationResult<Vec<MigrationScript>> {
        if !tokio::fs::try_exists(&self.folder).await.unwrap_or(false) {
            return Err(MigrationError::Loader(format!(
                "migration folder {} does not exist",
                self.folder.display()
            )));
        }

        let mut scripts = Vec::new();
        let mut pending_dirs = vec![self.folder.clone()];

        while let Some(dir) = pending_dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    if self.recursive {
                        pending_dirs.push(path);
                    }
                    continue;
                }

                let Some((version, name)) = self.parse(&path) else {
                    continue;
                };
                let content = tokio::fs::read(&path).await?;
                scripts.push(MigrationScript::new(name, version, &path).with_checksum(checksum(&content)));
            }
        }

        scripts.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.name.cmp(&b.name)));
        debug!(
            "Found {} script(s) in {}",
            scripts.len(),
            self.folder.display()
        );
        Ok(scripts)
    }
}

/// Scripts compiled into the binary, together with their units
pub struct EmbeddedSource<D: Database> {
    name: String,
    scripts: Vec<(MigrationScript, Arc<dyn Runnable<D>>)>,
}

impl<D: Database> EmbeddedSource<D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Vec::new(),
        }
    }

    pub fn with_script<R>(mut self, name: &str, version: i64, unit: R) -> Self
    where
        R: Runnable<D> + 'static,
    {
        let location = format!("embedded://{}/V{}_{}", self.name, version, name);
        let script = MigrationScript::new(name, version, location);
        let unit: Arc<dyn Runnable<D>> = Arc::new(unit);
        self.scripts.push((script, unit));
        self
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

#[async_trait]
impl<D: Database> ScriptSource for EmbeddedSource<D> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self) -> MigrationResult<Vec<MigrationScript>> {
        Ok(self.scripts.iter().map(|(script, _)| script.clone()).collect())
    }
}

#[async_trait]
impl<D: Database> ScriptLoader<D> for EmbeddedSource<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, script: &MigrationScript) -> bool {
        self.scripts
            .iter()
            .any(|(embedded, _)| embedded.source_location == script.source_location)
    }

    async fn load(&self, script: &MigrationScript) -> MigrationResult<Arc<dyn Runnable<D>>> {
        self.scripts
            .iter()
            .find(|(embedded, _)| embedded.source_location == script.source_location)
            .map(|(_, unit)| unit.clone())
            .ok_or_else(|| MigrationError::Loader(format!("{} is not embedded in {}", script.name, self.name)))
    }
}
