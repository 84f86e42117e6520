//! Migration manager
//!
//! Orchestrates discovery, ordering, ledger diffing, and transactional
//! apply/rollback. Migrations always run sequentially in version order,
//! one transaction per migration: the schema change and its ledger record
//! commit together on engines with transactional DDL. Batch operations are
//! fail-fast; later migrations may depend on earlier ones, so nothing runs
//! past the first failure.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::adapters::{split_sql_statements, AdapterTransaction, DatabaseAdapter};
use crate::error::{MigrationError, MigrationResult};
use crate::ledger::{HistoryLedger, DEFAULT_HISTORY_TABLE};
use crate::migration::{parse_version, version_stamp, Migration};
use crate::records::{MigrationOutcome, MigrationRecord, MigrationStatus, MigrationStatusSummary, PendingMigration};
use crate::source::MigrationSource;

/// Orchestrates migration runs against one database.
///
/// Constructed explicitly and passed by handle; there is no global
/// instance. `initialize` must be called before any other operation.
pub struct MigrationManager {
    adapter: Arc<dyn DatabaseAdapter>,
    source: Arc<dyn MigrationSource>,
    ledger: HistoryLedger,
    initialized: AtomicBool,
    // Process-local high-water mark for issued version stamps.
    last_version: Mutex<Option<String>>,
}

impl MigrationManager {
    /// Create a manager with the default history table name
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, source: Arc<dyn MigrationSource>) -> Self {
        Self::with_history_table(adapter, source, DEFAULT_HISTORY_TABLE)
    }

    /// Create a manager with a custom history table name
    pub fn with_history_table(
        adapter: Arc<dyn DatabaseAdapter>,
        source: Arc<dyn MigrationSource>,
        history_table: impl Into<String>,
    ) -> Self {
        let ledger = HistoryLedger::new(adapter.clone(), history_table);
        Self {
            adapter,
            source,
            ledger,
            initialized: AtomicBool::new(false),
            last_version: Mutex::new(None),
        }
    }

    /// The history ledger (for drift checks and direct reads)
    pub fn ledger(&self) -> &HistoryLedger {
        &self.ledger
    }

    /// Ensure the history table exists. Idempotent; must be called before
    /// any other operation.
    pub async fn initialize(&self) -> MigrationResult<()> {
        self.ledger.ensure_table_exists().await?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Release the underlying database connection
    pub async fn close(&self) -> MigrationResult<()> {
        self.adapter.close().await
    }

    fn ensure_initialized(&self) -> MigrationResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MigrationError::NotInitialized)
        }
    }

    /// Apply all pending migrations in ascending version order, up to and
    /// including `target_version` when given.
    ///
    /// Returns one outcome per processed migration. On failure the run
    /// stops, the failing migration is recorded in the ledger with status
    /// `failed`, and the terminating outcome carries the wrapped error;
    /// earlier successes in the same run stay committed.
    pub async fn migrate(&self, target_version: Option<&str>) -> MigrationResult<Vec<MigrationOutcome>> {
        self.ensure_initialized()?;

        let migrations = self.source.load_migrations().await?;
        let applied: HashSet<String> = self.ledger.get_applied_versions().await?.into_iter().collect();

        let pending: Vec<&Migration> = migrations
            .iter()
            .filter(|m| !applied.contains(&m.version))
            .filter(|m| target_version.map_or(true, |target| m.version.as_str() <= target))
            .collect();

        if pending.is_empty() {
            tracing::debug!("no pending migrations");
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for migration in pending {
            tracing::info!(
                version = %migration.version,
                name = %migration.name,
                "applying migration"
            );

            match self.apply_migration(migration).await {
                Ok(execution_time) => {
                    outcomes.push(MigrationOutcome {
                        version: migration.version.clone(),
                        name: migration.name.clone(),
                        status: MigrationStatus::Applied,
                        execution_time: Some(execution_time),
                        error_message: None,
                    });
                }
                Err(err) => {
                    let native = err.to_string();
                    tracing::warn!(
                        version = %migration.version,
                        name = %migration.name,
                        "migration failed: {}",
                        native
                    );
                    self.ledger.record_failure(migration, &native).await?;
                    outcomes.push(MigrationOutcome {
                        version: migration.version.clone(),
                        name: migration.name.clone(),
                        status: MigrationStatus::Failed,
                        execution_time: None,
                        error_message: Some(format!(
                            "migration {} ({}) failed: {}",
                            migration.version, migration.name, native
                        )),
                    });
                    break;
                }
            }
        }

        Ok(outcomes)
    }

    /// Revert applied migrations with version strictly greater than
    /// `target_version`, in descending version order.
    ///
    /// Each migration's stored `rollback_sql` snapshot is executed, not the
    /// current source's down SQL, so rollback stays correct when the source
    /// has changed since apply time. Fail-fast like `migrate`; a failed
    /// revert leaves its record (and all earlier ones) applied.
    pub async fn rollback(&self, target_version: &str) -> MigrationResult<Vec<MigrationOutcome>> {
        self.ensure_initialized()?;

        let records = self.ledger.get_applied_records().await?;
        let to_revert: Vec<MigrationRecord> = records
            .into_iter()
            .filter(|r| r.version.as_str() > target_version)
            .rev()
            .collect();

        if to_revert.is_empty() {
            tracing::debug!(target = target_version, "nothing to roll back");
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(to_revert.len());
        for record in &to_revert {
            tracing::info!(version = %record.version, name = %record.name, "rolling back migration");

            match self.revert_migration(record).await {
                Ok(execution_time) => {
                    outcomes.push(MigrationOutcome {
                        version: record.version.clone(),
                        name: record.name.clone(),
                        status: MigrationStatus::RolledBack,
                        execution_time: Some(execution_time),
                        error_message: None,
                    });
                }
                Err(err) => {
                    let native = err.to_string();
                    tracing::warn!(
                        version = %record.version,
                        name = %record.name,
                        "rollback failed: {}",
                        native
                    );
                    outcomes.push(MigrationOutcome {
                        version: record.version.clone(),
                        name: record.name.clone(),
                        status: MigrationStatus::Failed,
                        execution_time: None,
                        error_message: Some(format!(
                            "rollback of {} ({}) failed: {}",
                            record.version, record.name, native
                        )),
                    });
                    break;
                }
            }
        }

        Ok(outcomes)
    }

    /// Freshly read summary of ledger state: counts, the pending list, and
    /// any applied versions whose source has drifted.
    pub async fn get_migration_status(&self) -> MigrationResult<MigrationStatusSummary> {
        self.ensure_initialized()?;

        let migrations = self.source.load_migrations().await?;
        let records = self.ledger.get_applied_records().await?;
        let applied: HashMap<&str, &MigrationRecord> =
            records.iter().map(|r| (r.version.as_str(), r)).collect();

        let mut pending = Vec::new();
        let mut drifted = Vec::new();
        for migration in &migrations {
            match applied.get(migration.version.as_str()) {
                Some(record) => {
                    if let Some(recorded) = &record.checksum {
                        if *recorded != migration.checksum() {
                            drifted.push(migration.version.clone());
                        }
                    }
                }
                None => pending.push(PendingMigration {
                    version: migration.version.clone(),
                    name: migration.name.clone(),
                }),
            }
        }

        Ok(MigrationStatusSummary {
            applied_count: records.len(),
            pending_count: pending.len(),
            failed_count: self.ledger.failed_count().await?,
            pending,
            drifted,
        })
    }

    /// Migrations known to the source but absent from the ledger
    pub async fn pending_migrations(&self) -> MigrationResult<Vec<Migration>> {
        self.ensure_initialized()?;

        let migrations = self.source.load_migrations().await?;
        let applied: HashSet<String> = self.ledger.get_applied_versions().await?.into_iter().collect();

        Ok(migrations
            .into_iter()
            .filter(|m| !applied.contains(&m.version))
            .collect())
    }

    /// Create a migration with a freshly generated version stamp and
    /// persist it through the source.
    ///
    /// Stamps are strictly monotonic within the process: when the clock
    /// has not advanced since the last issued stamp, the new one is bumped
    /// forward by one second.
    pub async fn create_migration(
        &self,
        name: &str,
        up_sql: &str,
        down_sql: &str,
    ) -> MigrationResult<Migration> {
        self.ensure_initialized()?;

        let name = name.trim().replace(' ', "_").to_lowercase();
        if name.is_empty() {
            return Err(MigrationError::SourceRead("migration name must not be empty".to_string()));
        }

        let version = self.next_version()?;
        let migration = Migration::with_sql(version, name, up_sql, down_sql);
        self.source.save_migration(&migration).await?;

        tracing::info!(version = %migration.version, name = %migration.name, "created migration");
        Ok(migration)
    }

    fn next_version(&self) -> MigrationResult<String> {
        let mut last = self.last_version.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut candidate = version_stamp(Utc::now());
        if let Some(prev) = last.as_ref() {
            if candidate.as_str() <= prev.as_str() {
                candidate = bump_version(prev)
                    .ok_or_else(|| MigrationError::DuplicateVersion(prev.clone()))?;
            }
        }

        *last = Some(candidate.clone());
        Ok(candidate)
    }

    /// Run one migration's up SQL and its ledger insert in a single
    /// transaction (or sequentially on engines without transactional DDL).
    /// Returns the up SQL execution time in seconds.
    async fn apply_migration(&self, migration: &Migration) -> MigrationResult<f64> {
        let statements = split_sql_statements(migration.up());
        let started = Instant::now();

        if self.adapter.supports_transactional_ddl() {
            let mut tx = self.adapter.begin_transaction().await?;
            if let Err(err) = run_statements(tx.as_mut(), &statements).await {
                rollback_quietly(tx).await;
                return Err(err);
            }

            let execution_time = started.elapsed().as_secs_f64();
            // Replace any leftover failed row for this version.
            let (delete, delete_params) = self.ledger.delete_sql(&migration.version);
            if let Err(err) = tx.execute(&delete, &delete_params).await {
                rollback_quietly(tx).await;
                return Err(err);
            }
            let (sql, params) = self.ledger.success_insert_sql(migration, execution_time);
            if let Err(err) = tx.execute(&sql, &params).await {
                rollback_quietly(tx).await;
                return Err(err);
            }

            tx.commit().await?;
            Ok(execution_time)
        } else {
            // Best-effort on engines that auto-commit DDL: the ledger row
            // lands right after the schema change, outside any transaction.
            for statement in &statements {
                self.adapter.execute_sql(statement, &[]).await?;
            }
            let execution_time = started.elapsed().as_secs_f64();
            self.ledger.record_success(migration, execution_time).await?;
            Ok(execution_time)
        }
    }

    /// Execute a record's stored rollback SQL and delete its ledger row,
    /// atomically where the engine allows it.
    async fn revert_migration(&self, record: &MigrationRecord) -> MigrationResult<f64> {
        let down_sql = record.rollback_sql.clone().unwrap_or_default();
        let statements = split_sql_statements(&down_sql);
        let started = Instant::now();

        if self.adapter.supports_transactional_ddl() {
            let mut tx = self.adapter.begin_transaction().await?;
            if let Err(err) = run_statements(tx.as_mut(), &statements).await {
                rollback_quietly(tx).await;
                return Err(err);
            }

            let (sql, params) = self.ledger.delete_sql(&record.version);
            if let Err(err) = tx.execute(&sql, &params).await {
                rollback_quietly(tx).await;
                return Err(err);
            }

            tx.commit().await?;
            Ok(started.elapsed().as_secs_f64())
        } else {
            for statement in &statements {
                self.adapter.execute_sql(statement, &[]).await?;
            }
            self.ledger.remove_on_rollback(&record.version).await?;
            Ok(started.elapsed().as_secs_f64())
        }
    }
}

async fn run_statements(tx: &mut dyn AdapterTransaction, statements: &[String]) -> MigrationResult<()> {
    for statement in statements {
        tx.execute(statement, &[]).await?;
    }
    Ok(())
}

async fn rollback_quietly(tx: Box<dyn AdapterTransaction>) {
    if let Err(err) = tx.rollback().await {
        tracing::warn!("transaction rollback failed: {}", err);
    }
}

/// Advance a version stamp by one second; `None` when the stamp is
/// unparsable.
fn bump_version(version: &str) -> Option<String> {
    let parsed = parse_version(version)?;
    let bumped = DateTime::<Utc>::from_naive_utc_and_offset(parsed + Duration::seconds(1), Utc);
    Some(version_stamp(bumped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_advances_one_second() {
        assert_eq!(bump_version("20240101_120000").as_deref(), Some("20240101_120001"));
        // Carries across minute, day, and year boundaries.
        assert_eq!(bump_version("20240101_125959").as_deref(), Some("20240101_130000"));
        assert_eq!(bump_version("20231231_235959").as_deref(), Some("20240101_000000"));
        assert_eq!(bump_version("garbage"), None);
    }
}
