//! SQLite adapter
//!
//! The pool is capped at a single connection: SQLite serializes writers
//! anyway, and in-memory databases exist per connection.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, Sqlite, SqlitePool, Transaction, TypeInfo};
use std::str::FromStr;
use std::time::Duration;

use super::{split_sql_statements, AdapterTransaction, DatabaseAdapter, SqlDialect, SqlRow, SqlValue};
use crate::error::{MigrationError, MigrationResult};

/// SQLite implementation of [`DatabaseAdapter`]
pub struct SqliteAdapter {
    pool: SqlitePool,
}

impl SqliteAdapter {
    /// Connect to a SQLite database from a `sqlite://` URL or
    /// `sqlite::memory:`. The database file is created when missing.
    pub async fn connect(database_url: &str) -> MigrationResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| MigrationError::Connection(format!("invalid SQLite URL: {}", e)))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| MigrationError::Connection(format!("failed to open SQLite database: {}", e)))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    async fn execute_sql(&self, sql: &str, params: &[SqlValue]) -> MigrationResult<u64> {
        if params.is_empty() {
            let mut affected = 0u64;
            for statement in split_sql_statements(sql) {
                let result = sqlx::query(&statement)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| MigrationError::Execution(e.to_string()))?;
                affected += result.rows_affected();
            }
            return Ok(affected);
        }

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| MigrationError::Execution(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> MigrationResult<Vec<Box<dyn SqlRow>>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrationError::Execution(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| Box::new(SqliteRowWrapper { row }) as Box<dyn SqlRow>)
            .collect())
    }

    async fn get_all_tables(&self) -> MigrationResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MigrationError::Execution(e.to_string()))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .try_get(0)
                .map_err(|e| MigrationError::Execution(e.to_string()))?;
            tables.push(name);
        }
        Ok(tables)
    }

    async fn begin_transaction(&self) -> MigrationResult<Box<dyn AdapterTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MigrationError::Transaction(format!("failed to begin transaction: {}", e)))?;
        Ok(Box::new(SqliteTransaction { tx: Some(tx) }))
    }

    async fn close(&self) -> MigrationResult<()> {
        self.pool.close().await;
        Ok(())
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::SQLite
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }
}

struct SqliteTransaction {
    tx: Option<Transaction<'static, Sqlite>>,
}

#[async_trait]
impl AdapterTransaction for SqliteTransaction {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> MigrationResult<u64> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| MigrationError::Transaction("transaction already completed".to_string()))?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let result = query
            .execute(&mut **tx)
            .await
            .map_err(|e| MigrationError::Execution(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn commit(mut self: Box<Self>) -> MigrationResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| MigrationError::Transaction("transaction already completed".to_string()))?;
        tx.commit()
            .await
            .map_err(|e| MigrationError::Transaction(format!("commit failed: {}", e)))
    }

    async fn rollback(mut self: Box<Self>) -> MigrationResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| MigrationError::Transaction("transaction already completed".to_string()))?;
        tx.rollback()
            .await
            .map_err(|e| MigrationError::Transaction(format!("rollback failed: {}", e)))
    }
}

struct SqliteRowWrapper {
    row: SqliteRow,
}

impl SqlRow for SqliteRowWrapper {
    fn get_by_index(&self, index: usize) -> MigrationResult<SqlValue> {
        decode_column(&self.row, index)
    }

    fn get_by_name(&self, name: &str) -> MigrationResult<SqlValue> {
        let index = self
            .row
            .columns()
            .iter()
            .position(|col| col.name() == name)
            .ok_or_else(|| MigrationError::Execution(format!("column '{}' not found", name)))?;
        decode_column(&self.row, index)
    }

    fn column_count(&self) -> usize {
        self.row.len()
    }

    fn column_names(&self) -> Vec<String> {
        self.row.columns().iter().map(|col| col.name().to_string()).collect()
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &SqlValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int32(i) => query.bind(*i),
        SqlValue::Int64(i) => query.bind(*i),
        SqlValue::Float64(f) => query.bind(*f),
        SqlValue::String(s) => query.bind(s.clone()),
        SqlValue::Bytes(b) => query.bind(b.clone()),
        SqlValue::Uuid(u) => query.bind(*u),
        SqlValue::DateTime(dt) => query.bind(*dt),
        SqlValue::Json(j) => query.bind(j.clone()),
    }
}

fn decode_column(row: &SqliteRow, index: usize) -> MigrationResult<SqlValue> {
    let column = row.columns().get(index).ok_or_else(|| {
        MigrationError::Execution(format!(
            "column index {} out of range ({} columns)",
            index,
            row.len()
        ))
    })?;
    let type_name = column.type_info().name();

    let decode_err =
        |e: sqlx::Error| MigrationError::Execution(format!("failed to decode column '{}': {}", column.name(), e));

    match type_name {
        "NULL" => Ok(SqlValue::Null),
        "BOOLEAN" => {
            let value: Option<bool> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::Bool).unwrap_or(SqlValue::Null))
        }
        "INTEGER" => {
            let value: Option<i64> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::Int64).unwrap_or(SqlValue::Null))
        }
        "REAL" => {
            let value: Option<f64> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::Float64).unwrap_or(SqlValue::Null))
        }
        "BLOB" => {
            let value: Option<Vec<u8>> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::Bytes).unwrap_or(SqlValue::Null))
        }
        // TEXT and declared types with text affinity (TIMESTAMP, DATETIME,
        // VARCHAR). Timestamps come back as strings; the ledger parses them.
        _ => {
            let value: Option<String> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::String).unwrap_or(SqlValue::Null))
        }
    }
}
