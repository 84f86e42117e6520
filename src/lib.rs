//! # db-migrator: async database migration manager
//!
//! Tracks, applies, and reverts ordered schema-change scripts against
//! PostgreSQL, MySQL, or SQLite, recording applied state in a history
//! table so repeated runs are idempotent and partial progress is
//! recoverable. Checksums over migration content detect drift between the
//! source and what was actually applied.
//!
//! ```no_run
//! use std::sync::Arc;
//! use db_migrator::{adapters, FileSource, MigrationManager};
//!
//! # async fn run() -> db_migrator::MigrationResult<()> {
//! let adapter = adapters::connect("sqlite://app.db").await?;
//! let source = Arc::new(FileSource::new("migrations"));
//! let manager = MigrationManager::new(adapter, source);
//!
//! manager.initialize().await?;
//! let outcomes = manager.migrate(None).await?;
//! for outcome in &outcomes {
//!     println!("{} {}: {}", outcome.version, outcome.name, outcome.status);
//! }
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod migration;
pub mod records;
pub mod source;

// Re-export the core surface
pub use adapters::{
    connect, detect_dialect, split_sql_statements, AdapterTransaction, DatabaseAdapter, MySqlAdapter,
    PostgresAdapter, SqlDialect, SqlRow, SqlValue, SqliteAdapter,
};
pub use error::{MigrationError, MigrationResult};
pub use ledger::{HistoryLedger, DEFAULT_HISTORY_TABLE};
pub use manager::MigrationManager;
pub use migration::{parse_version, version_stamp, Migration, VERSION_FORMAT};
pub use records::{
    MigrationOutcome, MigrationRecord, MigrationStatus, MigrationStatusSummary, PendingMigration,
};
pub use source::{FileSource, MemorySource, MigrationSource};
