//! Database adapter abstraction
//!
//! One capability interface, three independent implementations sharing no
//! inheritance (PostgreSQL, MySQL, SQLite). The manager never embeds
//! dialect-specific SQL beyond what `SqlDialect` renders; everything else
//! goes through these traits.

pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;

use crate::error::{MigrationError, MigrationResult};

/// SQL dialect enumeration for rendering database-specific SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    PostgreSQL,
    MySQL,
    SQLite,
}

impl SqlDialect {
    /// Parameter placeholder for the given zero-based index
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index + 1),
            SqlDialect::MySQL | SqlDialect::SQLite => "?".to_string(),
        }
    }

    /// Quote character for identifiers
    pub fn identifier_quote(&self) -> char {
        match self {
            SqlDialect::PostgreSQL | SqlDialect::SQLite => '"',
            SqlDialect::MySQL => '`',
        }
    }

    /// Auto-increment column syntax
    pub fn auto_increment(&self) -> &'static str {
        match self {
            SqlDialect::PostgreSQL => "SERIAL",
            SqlDialect::MySQL => "AUTO_INCREMENT",
            SqlDialect::SQLite => "AUTOINCREMENT",
        }
    }

    /// Whether the dialect has a native boolean type
    pub fn supports_boolean(&self) -> bool {
        match self {
            SqlDialect::PostgreSQL | SqlDialect::SQLite => true,
            SqlDialect::MySQL => false,
        }
    }

    /// Current-timestamp function
    pub fn current_timestamp(&self) -> &'static str {
        match self {
            SqlDialect::PostgreSQL => "NOW()",
            SqlDialect::MySQL => "CURRENT_TIMESTAMP",
            SqlDialect::SQLite => "datetime('now')",
        }
    }
}

impl std::fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlDialect::PostgreSQL => write!(f, "postgresql"),
            SqlDialect::MySQL => write!(f, "mysql"),
            SqlDialect::SQLite => write!(f, "sqlite"),
        }
    }
}

/// Value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Json(JsonValue),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int32(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int64(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Float64(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::String(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::String(value.to_string())
    }
}

impl From<uuid::Uuid> for SqlValue {
    fn from(value: uuid::Uuid) -> Self {
        SqlValue::Uuid(value)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for SqlValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        SqlValue::DateTime(value)
    }
}

impl From<JsonValue> for SqlValue {
    fn from(value: JsonValue) -> Self {
        SqlValue::Json(value)
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

/// Abstract result row
pub trait SqlRow: Send + Sync {
    /// Get a column value by index
    fn get_by_index(&self, index: usize) -> MigrationResult<SqlValue>;

    /// Get a column value by name
    fn get_by_name(&self, name: &str) -> MigrationResult<SqlValue>;

    /// Number of columns
    fn column_count(&self) -> usize;

    /// Column names in result order
    fn column_names(&self) -> Vec<String>;
}

/// Scoped transaction handle.
///
/// Commit and rollback consume the handle, so a completed transaction
/// cannot be reused and nested begins are unrepresentable.
#[async_trait]
pub trait AdapterTransaction: Send {
    /// Execute a single statement within the transaction
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> MigrationResult<u64>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> MigrationResult<()>;

    /// Roll back the transaction
    async fn rollback(self: Box<Self>) -> MigrationResult<()>;
}

/// Capability interface over one database engine.
///
/// All three implementations provide identical semantics; they differ only
/// in identifier quoting, placeholder style, autoincrement syntax, boolean
/// representation, and the catalog query behind `get_all_tables`.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Execute SQL and return the affected row count.
    ///
    /// Without parameters the input may contain multiple statements, which
    /// are split and executed in order. With parameters it must be a single
    /// statement.
    async fn execute_sql(&self, sql: &str, params: &[SqlValue]) -> MigrationResult<u64>;

    /// Run a read-only query and return the result rows in order
    async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> MigrationResult<Vec<Box<dyn SqlRow>>>;

    /// List the user tables currently present in the database
    async fn get_all_tables(&self) -> MigrationResult<Vec<String>>;

    /// Begin a transaction scoped to one connection
    async fn begin_transaction(&self) -> MigrationResult<Box<dyn AdapterTransaction>>;

    /// Release the underlying pool; idempotent
    async fn close(&self) -> MigrationResult<()>;

    /// The SQL dialect this adapter speaks
    fn dialect(&self) -> SqlDialect;

    /// Whether DDL statements participate in transactions on this engine.
    /// When false, the manager writes ledger records immediately after the
    /// schema change instead of in the same transaction (best effort).
    fn supports_transactional_ddl(&self) -> bool;
}

/// Detect the dialect from a connection URL scheme
pub fn detect_dialect(url: &str) -> MigrationResult<SqlDialect> {
    if url.starts_with("postgresql://") || url.starts_with("postgres://") {
        Ok(SqlDialect::PostgreSQL)
    } else if url.starts_with("mysql://") {
        Ok(SqlDialect::MySQL)
    } else if url.starts_with("sqlite://") || url.starts_with("sqlite:") {
        Ok(SqlDialect::SQLite)
    } else {
        Err(MigrationError::Connection(format!(
            "unable to detect database dialect from URL: {}",
            url
        )))
    }
}

/// Connect to a database, dispatching on the URL scheme
pub async fn connect(url: &str) -> MigrationResult<Arc<dyn DatabaseAdapter>> {
    match detect_dialect(url)? {
        SqlDialect::PostgreSQL => Ok(Arc::new(PostgresAdapter::connect(url).await?)),
        SqlDialect::MySQL => Ok(Arc::new(MySqlAdapter::connect(url).await?)),
        SqlDialect::SQLite => Ok(Arc::new(SqliteAdapter::connect(url).await?)),
    }
}

/// Split SQL into individual statements using proper SQL parsing, falling
/// back to naive semicolon splitting when the parser rejects the input
/// (so engine-specific syntax still reaches the driver and fails there
/// with its native error).
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let dialect = GenericDialect {};
    match Parser::parse_sql(&dialect, sql) {
        Ok(parsed) => parsed.into_iter().map(|stmt| format!("{};", stmt)).collect(),
        Err(e) => {
            tracing::warn!("SQL parsing failed, using naive semicolon splitting: {}", e);
            sql.split(';')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| format!("{};", s))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_styles_per_dialect() {
        assert_eq!(SqlDialect::PostgreSQL.placeholder(0), "$1");
        assert_eq!(SqlDialect::PostgreSQL.placeholder(2), "$3");
        assert_eq!(SqlDialect::MySQL.placeholder(0), "?");
        assert_eq!(SqlDialect::SQLite.placeholder(5), "?");
    }

    #[test]
    fn dialect_detection_from_url() {
        assert_eq!(detect_dialect("postgres://u@localhost/db").unwrap(), SqlDialect::PostgreSQL);
        assert_eq!(detect_dialect("postgresql://u@localhost/db").unwrap(), SqlDialect::PostgreSQL);
        assert_eq!(detect_dialect("mysql://u@localhost/db").unwrap(), SqlDialect::MySQL);
        assert_eq!(detect_dialect("sqlite://app.db").unwrap(), SqlDialect::SQLite);
        assert_eq!(detect_dialect("sqlite::memory:").unwrap(), SqlDialect::SQLite);
        assert!(detect_dialect("oracle://nope").is_err());
    }

    #[test]
    fn splits_multiple_statements() {
        let statements = split_sql_statements(
            "CREATE TABLE a (id INTEGER); CREATE TABLE b (id INTEGER);",
        );
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("a"));
        assert!(statements[1].contains("b"));
    }

    #[test]
    fn falls_back_to_semicolon_splitting() {
        // PRAGMA is SQLite-specific and rejected by the generic parser.
        let statements = split_sql_statements("PRAGMA foreign_keys = ON; DROP TABLE t");
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1], "DROP TABLE t;");
    }

    #[test]
    fn null_option_converts_to_null_value() {
        let value: SqlValue = Option::<String>::None.into();
        assert!(value.is_null());
        let value: SqlValue = Some(1.5f64).into();
        assert_eq!(value, SqlValue::Float64(1.5));
    }
}
