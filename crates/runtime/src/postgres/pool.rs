// Connection pool over the embedded postgres.
//
// The wrapped sqlx pool is recreated (not reconnected) whenever the postgres
// process restarts, since the process identity changed.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::RuntimeError;

const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let min_connections = std::env::var("FOLIO_DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MIN_CONNECTIONS);

        let max_connections = std::env::var("FOLIO_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let acquire_timeout_secs = std::env::var("FOLIO_DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS);

        Self {
            min_connections,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
        }
    }
}

/// Result of an ad hoc query: rows as JSON for row-returning statements,
/// affected-row count otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutput {
    pub rows: Value,
    pub row_count: usize,
}

pub struct DbPool {
    config: PoolConfig,
    inner: RwLock<Option<PgPool>>,
}

impl DbPool {
    pub fn new(config: PoolConfig) -> Self {
        Self { config, inner: RwLock::new(None) }
    }

    pub async fn connect(&self, url: &str) -> Result<()> {
        let options: PgConnectOptions =
            url.parse().context("failed to parse postgres connection options")?;

        let pool = PgPoolOptions::new()
            .min_connections(self.config.min_connections)
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.acquire_timeout)
            .connect_with(options)
            .await
            .context("failed to connect to embedded postgres")?;

        *self.inner.write().await = Some(pool);
        Ok(())
    }

    /// Close any existing pool and build a fresh one. Used after a postgres
    /// restart: the old pool's connections reference a dead process.
    pub async fn recreate(&self, url: &str) -> Result<()> {
        self.close().await;
        self.connect(url).await
    }

    pub async fn close(&self) {
        if let Some(pool) = self.inner.write().await.take() {
            pool.close().await;
        }
    }

    /// Clone of the live sqlx pool, or `NotReady` before `connect`.
    pub async fn pool(&self) -> Result<PgPool, RuntimeError> {
        self.inner.read().await.clone().ok_or(RuntimeError::NotReady)
    }

    pub async fn ping(&self) -> Result<(), RuntimeError> {
        let pool = self.pool().await?;
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|error| RuntimeError::Connection(error.to_string()))?;
        Ok(())
    }

    /// Run an ad hoc statement. Row-returning statements come back as a JSON
    /// array of objects; other statements report `rows_affected`.
    pub async fn query_json(&self, sql: &str) -> Result<QueryOutput, RuntimeError> {
        let pool = self.pool().await?;
        let sql = normalize_statement(sql)?;

        if is_row_returning(&sql) {
            let wrapped = format!(
                "SELECT COALESCE(json_agg(row_to_json(q)), '[]'::json) FROM ({sql}) AS q"
            );
            let rows: Value = sqlx::query_scalar(&wrapped)
                .fetch_one(&pool)
                .await
                .map_err(map_query_error)?;
            let row_count = rows.as_array().map(Vec::len).unwrap_or(0);
            Ok(QueryOutput { rows, row_count })
        } else {
            let done = sqlx::query(&sql).execute(&pool).await.map_err(map_query_error)?;
            Ok(QueryOutput { rows: Value::Array(Vec::new()), row_count: done.rows_affected() as usize })
        }
    }

    pub async fn execute(&self, sql: &str) -> Result<u64, RuntimeError> {
        let pool = self.pool().await?;
        let done = sqlx::query(sql).execute(&pool).await.map_err(map_query_error)?;
        Ok(done.rows_affected())
    }
}

fn normalize_statement(sql: &str) -> Result<String, RuntimeError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(RuntimeError::validation("query must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn is_row_returning(sql: &str) -> bool {
    let head = sql.split_whitespace().next().unwrap_or("").to_ascii_lowercase();
    matches!(head.as_str(), "select" | "with" | "table" | "values")
}

fn map_query_error(error: sqlx::Error) -> RuntimeError {
    match &error {
        sqlx::Error::Database(db_error) => RuntimeError::Validation(db_error.message().to_string()),
        sqlx::Error::RowNotFound => RuntimeError::Validation(error.to_string()),
        _ => RuntimeError::Connection(error.to_string()),
    }
}
