//! Migration history ledger
//!
//! Single source of truth for which versions have been applied. The ledger
//! owns the history table's lifecycle; nothing else writes to it. DML is
//! rendered as `(sql, params)` pairs so the manager can execute ledger
//! writes on the same transaction as the schema change itself.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;

use crate::adapters::{DatabaseAdapter, SqlDialect, SqlRow, SqlValue};
use crate::error::{MigrationError, MigrationResult};
use crate::migration::Migration;
use crate::records::{MigrationRecord, MigrationStatus};

/// Default name of the history table
pub const DEFAULT_HISTORY_TABLE: &str = "_migration_history";

const RECORD_COLUMNS: &str =
    "version, name, applied_at, status, checksum, execution_time, error_message, rollback_sql";

/// Owns the migration history table
pub struct HistoryLedger {
    adapter: Arc<dyn DatabaseAdapter>,
    table: String,
}

impl HistoryLedger {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, table: impl Into<String>) -> Self {
        Self {
            adapter,
            table: table.into(),
        }
    }

    /// History table name
    pub fn table(&self) -> &str {
        &self.table
    }

    fn dialect(&self) -> SqlDialect {
        self.adapter.dialect()
    }

    /// Idempotent creation of the history table; safe to call on every
    /// `initialize`.
    pub async fn ensure_table_exists(&self) -> MigrationResult<()> {
        let ddl = history_table_ddl(self.dialect(), &self.table);
        self.adapter.execute_sql(&ddl, &[]).await?;
        Ok(())
    }

    /// Versions with status `applied`, ascending
    pub async fn get_applied_versions(&self) -> MigrationResult<Vec<String>> {
        let sql = format!(
            "SELECT version FROM {} WHERE status = {} ORDER BY version ASC",
            self.table,
            self.dialect().placeholder(0)
        );
        let rows = self
            .adapter
            .fetch_all(&sql, &[SqlValue::from(MigrationStatus::Applied.as_str())])
            .await?;

        let mut versions = Vec::with_capacity(rows.len());
        for row in rows {
            versions.push(required_string(row.as_ref(), "version")?);
        }
        Ok(versions)
    }

    /// Full records with status `applied`, ascending by version
    pub async fn get_applied_records(&self) -> MigrationResult<Vec<MigrationRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE status = {} ORDER BY version ASC",
            RECORD_COLUMNS,
            self.table,
            self.dialect().placeholder(0)
        );
        let rows = self
            .adapter
            .fetch_all(&sql, &[SqlValue::from(MigrationStatus::Applied.as_str())])
            .await?;

        rows.iter().map(|row| record_from_row(row.as_ref())).collect()
    }

    /// Rendered insert for a successful apply, executed by the manager on
    /// the migration's own transaction where the engine allows it.
    pub fn success_insert_sql(&self, migration: &Migration, execution_time: f64) -> (String, Vec<SqlValue>) {
        let sql = insert_record_sql(self.dialect(), &self.table);
        let params = vec![
            SqlValue::from(migration.version.as_str()),
            SqlValue::from(migration.name.as_str()),
            SqlValue::DateTime(Utc::now()),
            SqlValue::from(MigrationStatus::Applied.as_str()),
            SqlValue::from(migration.checksum()),
            SqlValue::Float64(execution_time),
            SqlValue::Null,
            SqlValue::from(migration.down()),
        ];
        (sql, params)
    }

    /// Insert an applied record directly (non-transactional DDL engines).
    /// A leftover `failed` row for the same version is replaced.
    pub async fn record_success(&self, migration: &Migration, execution_time: f64) -> MigrationResult<()> {
        let (delete, delete_params) = self.delete_sql(&migration.version);
        self.adapter.execute_sql(&delete, &delete_params).await?;

        let (sql, params) = self.success_insert_sql(migration, execution_time);
        self.adapter.execute_sql(&sql, &params).await?;
        Ok(())
    }

    /// Record a failed apply attempt. Re-recording the same version
    /// replaces the previous row, so a fixed migration can be re-run.
    pub async fn record_failure(&self, migration: &Migration, error: &str) -> MigrationResult<()> {
        let (delete, delete_params) = self.delete_sql(&migration.version);
        self.adapter.execute_sql(&delete, &delete_params).await?;

        let sql = insert_record_sql(self.dialect(), &self.table);
        let params = vec![
            SqlValue::from(migration.version.as_str()),
            SqlValue::from(migration.name.as_str()),
            SqlValue::DateTime(Utc::now()),
            SqlValue::from(MigrationStatus::Failed.as_str()),
            SqlValue::Null,
            SqlValue::Null,
            SqlValue::from(error),
            SqlValue::Null,
        ];
        self.adapter.execute_sql(&sql, &params).await?;
        Ok(())
    }

    /// Rendered delete for a version's record
    pub fn delete_sql(&self, version: &str) -> (String, Vec<SqlValue>) {
        (
            format!(
                "DELETE FROM {} WHERE version = {}",
                self.table,
                self.dialect().placeholder(0)
            ),
            vec![SqlValue::from(version)],
        )
    }

    /// Delete the record for a version after its rollback SQL ran, so
    /// `applied_count` reflects current database state.
    pub async fn remove_on_rollback(&self, version: &str) -> MigrationResult<()> {
        let (sql, params) = self.delete_sql(version);
        self.adapter.execute_sql(&sql, &params).await?;
        Ok(())
    }

    /// True when the stored checksum for an applied version differs from
    /// the migration's current checksum. Not applied means no drift.
    pub async fn detect_drift(&self, migration: &Migration) -> MigrationResult<bool> {
        match self.stored_checksum(&migration.version).await? {
            Some(recorded) => Ok(recorded != migration.checksum()),
            None => Ok(false),
        }
    }

    /// Fail with `ChecksumMismatch` when an applied version's source has
    /// drifted, for callers that want drift to block instead of merely
    /// showing up in the status summary.
    pub async fn verify_checksum(&self, migration: &Migration) -> MigrationResult<()> {
        match self.stored_checksum(&migration.version).await? {
            Some(recorded) if recorded != migration.checksum() => {
                Err(MigrationError::ChecksumMismatch {
                    version: migration.version.clone(),
                    recorded,
                    current: migration.checksum(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn stored_checksum(&self, version: &str) -> MigrationResult<Option<String>> {
        let sql = format!(
            "SELECT checksum FROM {} WHERE version = {} AND status = {}",
            self.table,
            self.dialect().placeholder(0),
            self.dialect().placeholder(1)
        );
        let rows = self
            .adapter
            .fetch_all(
                &sql,
                &[
                    SqlValue::from(version),
                    SqlValue::from(MigrationStatus::Applied.as_str()),
                ],
            )
            .await?;

        match rows.first() {
            Some(row) => optional_string(row.as_ref(), "checksum"),
            None => Ok(None),
        }
    }

    /// Number of versions whose latest attempt failed
    pub async fn failed_count(&self) -> MigrationResult<usize> {
        let sql = format!(
            "SELECT version FROM {} WHERE status = {}",
            self.table,
            self.dialect().placeholder(0)
        );
        let rows = self
            .adapter
            .fetch_all(&sql, &[SqlValue::from(MigrationStatus::Failed.as_str())])
            .await?;
        Ok(rows.len())
    }
}

fn history_table_ddl(dialect: SqlDialect, table: &str) -> String {
    match dialect {
        SqlDialect::PostgreSQL => format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                version VARCHAR(32) PRIMARY KEY,\n    \
                name TEXT NOT NULL,\n    \
                applied_at TIMESTAMPTZ NOT NULL,\n    \
                status VARCHAR(16) NOT NULL,\n    \
                checksum TEXT,\n    \
                execution_time DOUBLE PRECISION,\n    \
                error_message TEXT,\n    \
                rollback_sql TEXT\n\
            );",
            table
        ),
        SqlDialect::MySQL => format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                version VARCHAR(32) PRIMARY KEY,\n    \
                name TEXT NOT NULL,\n    \
                applied_at DATETIME NOT NULL,\n    \
                status VARCHAR(16) NOT NULL,\n    \
                checksum TEXT,\n    \
                execution_time DOUBLE,\n    \
                error_message TEXT,\n    \
                rollback_sql TEXT\n\
            );",
            table
        ),
        SqlDialect::SQLite => format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                version TEXT PRIMARY KEY,\n    \
                name TEXT NOT NULL,\n    \
                applied_at TIMESTAMP NOT NULL,\n    \
                status TEXT NOT NULL,\n    \
                checksum TEXT,\n    \
                execution_time REAL,\n    \
                error_message TEXT,\n    \
                rollback_sql TEXT\n\
            );",
            table
        ),
    }
}

fn insert_record_sql(dialect: SqlDialect, table: &str) -> String {
    let placeholders: Vec<String> = (0..8).map(|i| dialect.placeholder(i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        RECORD_COLUMNS,
        placeholders.join(", ")
    )
}

fn record_from_row(row: &dyn SqlRow) -> MigrationResult<MigrationRecord> {
    let status_text = required_string(row, "status")?;
    let status = MigrationStatus::from_str(&status_text).map_err(MigrationError::Execution)?;

    Ok(MigrationRecord {
        version: required_string(row, "version")?,
        name: required_string(row, "name")?,
        applied_at: datetime_value(row, "applied_at")?,
        status,
        checksum: optional_string(row, "checksum")?,
        execution_time: optional_float(row, "execution_time")?,
        error_message: optional_string(row, "error_message")?,
        rollback_sql: optional_string(row, "rollback_sql")?,
    })
}

fn required_string(row: &dyn SqlRow, column: &str) -> MigrationResult<String> {
    match row.get_by_name(column)? {
        SqlValue::String(s) => Ok(s),
        other => Err(MigrationError::Execution(format!(
            "expected text in ledger column '{}', got {:?}",
            column, other
        ))),
    }
}

fn optional_string(row: &dyn SqlRow, column: &str) -> MigrationResult<Option<String>> {
    match row.get_by_name(column)? {
        SqlValue::Null => Ok(None),
        SqlValue::String(s) => Ok(Some(s)),
        other => Err(MigrationError::Execution(format!(
            "expected text in ledger column '{}', got {:?}",
            column, other
        ))),
    }
}

fn optional_float(row: &dyn SqlRow, column: &str) -> MigrationResult<Option<f64>> {
    match row.get_by_name(column)? {
        SqlValue::Null => Ok(None),
        SqlValue::Float64(f) => Ok(Some(f)),
        SqlValue::Int64(i) => Ok(Some(i as f64)),
        SqlValue::Int32(i) => Ok(Some(i as f64)),
        other => Err(MigrationError::Execution(format!(
            "expected number in ledger column '{}', got {:?}",
            column, other
        ))),
    }
}

fn datetime_value(row: &dyn SqlRow, column: &str) -> MigrationResult<DateTime<Utc>> {
    match row.get_by_name(column)? {
        SqlValue::DateTime(dt) => Ok(dt),
        SqlValue::String(s) => parse_datetime(&s).ok_or_else(|| {
            MigrationError::Execution(format!("unparsable timestamp in ledger column '{}': {}", column, s))
        }),
        other => Err(MigrationError::Execution(format!(
            "expected timestamp in ledger column '{}', got {:?}",
            column, other
        ))),
    }
}

// SQLite hands timestamps back as text in whichever format they were
// written; accept RFC 3339 and the space-separated chrono encodings.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ddl_renders_per_dialect() {
        let pg = history_table_ddl(SqlDialect::PostgreSQL, "_migration_history");
        assert!(pg.contains("TIMESTAMPTZ"));
        assert!(pg.contains("DOUBLE PRECISION"));
        assert!(pg.contains("VARCHAR(32) PRIMARY KEY"));

        let mysql = history_table_ddl(SqlDialect::MySQL, "_migration_history");
        assert!(mysql.contains("DATETIME"));
        assert!(mysql.contains("VARCHAR(32) PRIMARY KEY"));

        let sqlite = history_table_ddl(SqlDialect::SQLite, "_migration_history");
        assert!(sqlite.contains("TEXT PRIMARY KEY"));
        assert!(sqlite.contains("REAL"));

        for ddl in [&pg, &mysql, &sqlite] {
            assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS _migration_history"));
            assert!(ddl.contains("rollback_sql TEXT"));
        }
    }

    #[test]
    fn insert_sql_uses_dialect_placeholders() {
        let pg = insert_record_sql(SqlDialect::PostgreSQL, "h");
        assert!(pg.ends_with("($1, $2, $3, $4, $5, $6, $7, $8)"));

        let mysql = insert_record_sql(SqlDialect::MySQL, "h");
        assert!(mysql.ends_with("(?, ?, ?, ?, ?, ?, ?, ?)"));
    }

    #[test]
    fn parses_timestamp_encodings() {
        assert!(parse_datetime("2024-01-01T12:00:00+00:00").is_some());
        assert!(parse_datetime("2024-01-01 12:00:00.123+00:00").is_some());
        assert!(parse_datetime("2024-01-01 12:00:00").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }
}
