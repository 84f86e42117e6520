//! PostgreSQL adapter
//!
//! Implements the adapter capability interface over a sqlx PostgreSQL
//! pool. PostgreSQL has transactional DDL, so migrations and their ledger
//! writes commit atomically.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Postgres, Row, Transaction, TypeInfo};
use std::time::Duration;

use super::{split_sql_statements, AdapterTransaction, DatabaseAdapter, SqlDialect, SqlRow, SqlValue};
use crate::error::{MigrationError, MigrationResult};

/// PostgreSQL implementation of [`DatabaseAdapter`]
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    /// Connect to a PostgreSQL database from a `postgres://` URL
    pub async fn connect(database_url: &str) -> MigrationResult<Self> {
        if !database_url.starts_with("postgresql://") && !database_url.starts_with("postgres://") {
            return Err(MigrationError::Connection(
                "invalid PostgreSQL URL scheme".to_string(),
            ));
        }
        url::Url::parse(database_url)
            .map_err(|e| MigrationError::Connection(format!("invalid database URL: {}", e)))?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| MigrationError::Connection(format!("failed to connect to PostgreSQL: {}", e)))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
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
            .map(|row| Box::new(PostgresRow { row }) as Box<dyn SqlRow>)
            .collect())
    }

    async fn get_all_tables(&self) -> MigrationResult<Vec<String>> {
        let rows = sqlx::query("SELECT tablename FROM pg_tables WHERE schemaname = 'public'")
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
        Ok(Box::new(PostgresTransaction { tx: Some(tx) }))
    }

    async fn close(&self) -> MigrationResult<()> {
        self.pool.close().await;
        Ok(())
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }
}

struct PostgresTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

#[async_trait]
impl AdapterTransaction for PostgresTransaction {
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

struct PostgresRow {
    row: PgRow,
}

impl SqlRow for PostgresRow {
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
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
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

fn decode_column(row: &PgRow, index: usize) -> MigrationResult<SqlValue> {
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
        "BOOL" => {
            let value: Option<bool> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::Bool).unwrap_or(SqlValue::Null))
        }
        "INT2" => {
            let value: Option<i16> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(|v| SqlValue::Int32(v as i32)).unwrap_or(SqlValue::Null))
        }
        "INT4" => {
            let value: Option<i32> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::Int32).unwrap_or(SqlValue::Null))
        }
        "INT8" => {
            let value: Option<i64> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::Int64).unwrap_or(SqlValue::Null))
        }
        "FLOAT4" => {
            let value: Option<f32> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(|v| SqlValue::Float64(v as f64)).unwrap_or(SqlValue::Null))
        }
        "FLOAT8" | "NUMERIC" => {
            let value: Option<f64> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::Float64).unwrap_or(SqlValue::Null))
        }
        "BYTEA" => {
            let value: Option<Vec<u8>> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::Bytes).unwrap_or(SqlValue::Null))
        }
        "UUID" => {
            let value: Option<uuid::Uuid> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::Uuid).unwrap_or(SqlValue::Null))
        }
        "TIMESTAMPTZ" => {
            let value: Option<chrono::DateTime<chrono::Utc>> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::DateTime).unwrap_or(SqlValue::Null))
        }
        "TIMESTAMP" => {
            let value: Option<chrono::NaiveDateTime> = row.try_get(index).map_err(decode_err)?;
            Ok(value
                .map(|v| SqlValue::DateTime(chrono::DateTime::from_naive_utc_and_offset(v, chrono::Utc)))
                .unwrap_or(SqlValue::Null))
        }
        "JSON" | "JSONB" => {
            let value: Option<JsonValue> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::Json).unwrap_or(SqlValue::Null))
        }
        // TEXT, VARCHAR, NAME, BPCHAR, and anything unrecognized
        _ => {
            let value: Option<String> = row.try_get(index).map_err(decode_err)?;
            Ok(value.map(SqlValue::String).unwrap_or(SqlValue::Null))
        }
    }
}
