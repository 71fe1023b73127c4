//! # elif-migrate
//!
//! Database-agnostic migration execution engine for the elif.rs framework.
//!
//! ## Features
//!
//! - **Versioned scripts**: Directory and embedded sources, pluggable loaders
//! - **Managed transactions**: Per-migration or per-batch, with commit retry
//! - **Advisory locking**: Cross-process run serialization with expiry and ownership checks
//! - **Failure recovery**: Backup restore, inverse operations or both
//! - **Dry runs**: Execute everything inside transactions that are never committed
//! - **Lifecycle hooks**: Observe every stage of a run
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use elif_migrate::{
//!     EmbeddedSource, MemoryDatabase, MigrationConfig, MigrationEngine, MigrationScript,
//!     Runnable, ScriptResult,
//! };
//!
//! struct CreateUsers;
//!
//! #[async_trait]
//! impl Runnable<MemoryDatabase> for CreateUsers {
//!     async fn up(&self, db: &MemoryDatabase, _script: &MigrationScript) -> ScriptResult<String> {
//!         db.put("users", "created");
//!         Ok("users created".to_string())
//!     }
//! }
//!
//! # async fn run() -> elif_migrate::MigrationResult<()> {
//! let engine = MigrationEngine::builder(MemoryDatabase::new())
//!     .config(MigrationConfig::default())
//!     .embedded(EmbeddedSource::new("app").with_script("create_users", 1, CreateUsers))
//!     .build()?;
//!
//! let result = engine.migrate().await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod database;
pub mod error;
pub mod hooks;
pub mod loader;
pub mod locking;
pub mod rollback;
pub mod script;
pub mod selector;
pub mod source;
pub mod transaction;
pub mod validation;
pub mod workflow;

pub use backends::{MemoryDatabase, TransactionStyle};
pub use config::{
    BackupConfig, BackupConfigBuilder, BackupMode, ConfigError, ConfigLoader, IsolationLevel,
    LockingConfig, LockingConfigBuilder, MigrationConfig, RollbackStrategy, TransactionConfig,
    TransactionMode,
};
pub use database::{
    BackupStore, CallbackTransactions, Database, ImperativeTransactions, LockStatus, LockStore,
    MigrationRecord, SchemaHistory, TransactionSupport, TransactionWork,
};
pub use error::{
    DatabaseError, DatabaseResult, MigrationError, MigrationResult, ScriptResult, Severity,
    ValidationIssue,
};
pub use hooks::{HookChain, MigrationHooks, TracingHooks};
pub use loader::{FileLoader, LoaderRegistry, ScriptLoader};
pub use locking::LockingOrchestrator;
pub use rollback::RollbackCoordinator;
pub use script::{MigrationScript, Runnable, ScriptSet, UnitMap};
pub use source::{DirectorySource, EmbeddedSource, ScriptSource};
pub use transaction::{
    CallbackTransactionManager, ImperativeTransactionManager, TransactionContext,
    TransactionManager, UnitOfWork,
};
pub use validation::{PreExecutionValidator, ScriptValidator, ValidationContext};
pub use workflow::{
    MigrationEngine, MigrationEngineBuilder, MigrationRunResult, StateMachine, WorkflowState,
};
