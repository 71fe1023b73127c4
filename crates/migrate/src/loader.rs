//! Script loaders
//!
//! A loader turns a discovered `MigrationScript` into an executable unit.
//! Loaders are consulted in registration order and the first one whose
//! `can_handle` accepts the script wins.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::database::Database;
use crate::error::{MigrationError, MigrationResult, ScriptResult, ValidationIssue};
use crate::script::{MigrationScript, Runnable, UnitMap};

#[async_trait]
pub trait ScriptLoader<D: Database>: Send + Sync {
    /// Name used in logs and validation messages
    fn name(&self) -> &str;

    fn can_handle(&self, script: &MigrationScript) -> bool;

    async fn load(&self, script: &MigrationScript) -> MigrationResult<Arc<dyn Runnable<D>>>;
}

/// Ordered loader collection
pub struct LoaderRegistry<D: Database> {
    loaders: Vec<Arc<dyn ScriptLoader<D>>>,
}

impl<D: Database> LoaderRegistry<D> {
    pub fn new() -> Self {
        Self {
            loaders: Vec::new(),
        }
    }

    pub fn register(&mut self, loader: Arc<dyn ScriptLoader<D>>) {
        self.loaders.push(loader);
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// First registered loader accepting `script`
    pub fn find(&self, script: &MigrationScript) -> Option<&Arc<dyn ScriptLoader<D>>> {
        self.loaders.iter().find(|loader| loader.can_handle(script))
    }

    /// Load a single script
    pub async fn load(&self, script: &MigrationScript) -> MigrationResult<Arc<dyn Runnable<D>>> {
        let loader = self.find(script).ok_or_else(|| {
            MigrationError::Loader(format!(
                "no loader can handle {} ({})",
                script.name,
                script.source_location.display()
            ))
        })?;
        debug!("Loading {} with {}", script.name, loader.name());
        loader.load(script).await
    }

    /// Resolve every script, turning failures into validation errors
    pub async fn resolve(&self, scripts: &[MigrationScript]) -> (UnitMap<D>, Vec<ValidationIssue>) {
        let mut units = HashMap::new();
        let mut issues = Vec::new();

        for script in scripts {
            match self.load(script).await {
                Ok(unit) => {
                    units.insert(script.version, unit);
                }
                Err(e) => issues.push(ValidationIssue::error(Some(script.name.as_str()), e.to_string())),
            }
        }

        (units, issues)
    }
}

impl<D: Database> Default for LoaderRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

type UnitFactory<D> =
    dyn Fn(&MigrationScript, String) -> ScriptResult<Arc<dyn Runnable<D>>> + Send + Sync;

/// Loads files with a given extension and builds units from their content
pub struct FileLoader<D: Database> {
    name: String,
    extension: String,
    factory: Box<UnitFactory<D>>,
}

impl<D: Database> FileLoader<D> {
    /// `extension` is matched case-insensitively against everything after
    /// the first dot of the file name, e.g. `sql` or `up.sql`
    pub fn new<F>(extension: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&MigrationScript, String) -> ScriptResult<Arc<dyn Runnable<D>>> + Send + Sync + 'static,
    {
        let extension = extension.into().trim_start_matches('.').to_lowercase();
        Self {
            name: format!("{}-file", extension),
            extension,
            factory: Box::new(factory),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<D: Database> ScriptLoader<D> for FileLoader<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, script: &MigrationScript) -> bool {
        script.extension().as_deref() == Some(self.extension.as_str())
    }

    async fn load(&self, script: &MigrationScript) -> MigrationResult<Arc<dyn Runnable<D>>> {
        let content = tokio::fs::read_to_string(&script.source_location)
            .await
            .map_err(|e| {
                MigrationError::Loader(format!(
                    "failed to read {}: {}",
                    script.source_location.display(),
                    e
                ))
            })?;

        (self.factory)(script, content).map_err(|e| {
            MigrationError::Loader(format!("failed to load {}: {}", script.name, e))
        })
    }
}
