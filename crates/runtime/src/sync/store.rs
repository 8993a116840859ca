// Persistence for source definitions and sync history.
//
// Two backends behind one seam: the embedded postgres (production) and an
// in-memory store (tests, and any caller that needs a manager without a
// live database). History rows are append-only; reads truncate by limit,
// never mutate.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use folio_common::types::{DataSource, SyncHistoryEntry, SyncResult};
use serde_json::Value;
use sqlx::Row;
use tokio::sync::RwLock;

use crate::error::RuntimeError;
use crate::postgres::pool::DbPool;

const CREATE_SOURCES_SQL: &str = "\
CREATE TABLE IF NOT EXISTS folio_sources (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    kind         TEXT NOT NULL,
    schedule     TEXT,
    secret_names JSONB NOT NULL DEFAULT '[]'::jsonb,
    config       JSONB NOT NULL DEFAULT 'null'::jsonb,
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL
)";

const CREATE_HISTORY_SQL: &str = "\
CREATE TABLE IF NOT EXISTS folio_sync_history (
    id          BIGSERIAL PRIMARY KEY,
    source_id   TEXT NOT NULL,
    started_at  TIMESTAMPTZ NOT NULL,
    success     BOOLEAN NOT NULL,
    result      JSONB,
    error       TEXT,
    duration_ms BIGINT NOT NULL,
    logs        JSONB NOT NULL DEFAULT '[]'::jsonb
)";

const CREATE_HISTORY_INDEX_SQL: &str = "\
CREATE INDEX IF NOT EXISTS folio_sync_history_source_idx
    ON folio_sync_history (source_id, id DESC)";

#[derive(Clone)]
pub enum SourceStore {
    Postgres(Arc<DbPool>),
    Memory(Arc<RwLock<MemoryStore>>),
}

#[derive(Default)]
pub struct MemoryStore {
    sources: Vec<DataSource>,
    history: Vec<SyncHistoryEntry>,
    next_history_id: i64,
}

impl SourceStore {
    pub fn postgres(db: Arc<DbPool>) -> Self {
        Self::Postgres(db)
    }

    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryStore::default())))
    }

    /// Provision the backing tables. Idempotent.
    pub async fn init(&self) -> Result<(), RuntimeError> {
        match self {
            Self::Postgres(db) => {
                db.execute(CREATE_SOURCES_SQL).await?;
                db.execute(CREATE_HISTORY_SQL).await?;
                db.execute(CREATE_HISTORY_INDEX_SQL).await?;
                Ok(())
            }
            Self::Memory(_) => Ok(()),
        }
    }

    pub async fn list(&self) -> Result<Vec<DataSource>, RuntimeError> {
        match self {
            Self::Postgres(db) => {
                let pool = db.pool().await?;
                let rows = sqlx::query(
                    "SELECT id, name, kind, schedule, secret_names, config, created_at, updated_at \
                     FROM folio_sources ORDER BY created_at, id",
                )
                .fetch_all(&pool)
                .await
                .map_err(db_error)?;
                rows.iter().map(decode_source).collect()
            }
            Self::Memory(store) => Ok(store.read().await.sources.clone()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<DataSource>, RuntimeError> {
        match self {
            Self::Postgres(db) => {
                let pool = db.pool().await?;
                let row = sqlx::query(
                    "SELECT id, name, kind, schedule, secret_names, config, created_at, updated_at \
                     FROM folio_sources WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&pool)
                .await
                .map_err(db_error)?;
                row.as_ref().map(decode_source).transpose()
            }
            Self::Memory(store) => {
                Ok(store.read().await.sources.iter().find(|s| s.id == id).cloned())
            }
        }
    }

    pub async fn insert(&self, source: &DataSource) -> Result<(), RuntimeError> {
        match self {
            Self::Postgres(db) => {
                let pool = db.pool().await?;
                sqlx::query(
                    "INSERT INTO folio_sources \
                     (id, name, kind, schedule, secret_names, config, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(&source.id)
                .bind(&source.name)
                .bind(&source.kind)
                .bind(&source.schedule)
                .bind(Value::from(source.secret_names.clone()))
                .bind(&source.config)
                .bind(source.created_at)
                .bind(source.updated_at)
                .execute(&pool)
                .await
                .map_err(|error| match &error {
                    sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                        RuntimeError::Validation(format!("source `{}` already exists", source.id))
                    }
                    _ => db_error(error),
                })?;
                Ok(())
            }
            Self::Memory(store) => {
                let mut store = store.write().await;
                if store.sources.iter().any(|s| s.id == source.id) {
                    return Err(RuntimeError::Validation(format!(
                        "source `{}` already exists",
                        source.id
                    )));
                }
                store.sources.push(source.clone());
                Ok(())
            }
        }
    }

    pub async fn update(&self, source: &DataSource) -> Result<(), RuntimeError> {
        match self {
            Self::Postgres(db) => {
                let pool = db.pool().await?;
                let done = sqlx::query(
                    "UPDATE folio_sources SET \
                     name = $2, kind = $3, schedule = $4, secret_names = $5, \
                     config = $6, updated_at = $7 \
                     WHERE id = $1",
                )
                .bind(&source.id)
                .bind(&source.name)
                .bind(&source.kind)
                .bind(&source.schedule)
                .bind(Value::from(source.secret_names.clone()))
                .bind(&source.config)
                .bind(source.updated_at)
                .execute(&pool)
                .await
                .map_err(db_error)?;
                if done.rows_affected() == 0 {
                    return Err(RuntimeError::not_found(format!(
                        "unknown source `{}`",
                        source.id
                    )));
                }
                Ok(())
            }
            Self::Memory(store) => {
                let mut store = store.write().await;
                match store.sources.iter_mut().find(|s| s.id == source.id) {
                    Some(existing) => {
                        *existing = source.clone();
                        Ok(())
                    }
                    None => {
                        Err(RuntimeError::not_found(format!("unknown source `{}`", source.id)))
                    }
                }
            }
        }
    }

    pub async fn delete(&self, id: &str) -> Result<bool, RuntimeError> {
        match self {
            Self::Postgres(db) => {
                let pool = db.pool().await?;
                let done = sqlx::query("DELETE FROM folio_sources WHERE id = $1")
                    .bind(id)
                    .execute(&pool)
                    .await
                    .map_err(db_error)?;
                Ok(done.rows_affected() > 0)
            }
            Self::Memory(store) => {
                let mut store = store.write().await;
                let before = store.sources.len();
                store.sources.retain(|s| s.id != id);
                Ok(store.sources.len() < before)
            }
        }
    }

    /// Append one completed execution. History is never rewritten.
    pub async fn append_history(
        &self,
        source_id: &str,
        started_at: DateTime<Utc>,
        result: &SyncResult,
    ) -> Result<(), RuntimeError> {
        match self {
            Self::Postgres(db) => {
                let pool = db.pool().await?;
                let logs = serde_json::to_value(&result.logs)
                    .map_err(|error| RuntimeError::Validation(error.to_string()))?;
                sqlx::query(
                    "INSERT INTO folio_sync_history \
                     (source_id, started_at, success, result, error, duration_ms, logs) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(source_id)
                .bind(started_at)
                .bind(result.success)
                .bind(&result.result)
                .bind(&result.error)
                .bind(result.duration_ms as i64)
                .bind(logs)
                .execute(&pool)
                .await
                .map_err(db_error)?;
                Ok(())
            }
            Self::Memory(store) => {
                let mut store = store.write().await;
                store.next_history_id += 1;
                let entry = SyncHistoryEntry {
                    id: store.next_history_id,
                    source_id: source_id.to_string(),
                    started_at,
                    result: result.clone(),
                };
                store.history.push(entry);
                Ok(())
            }
        }
    }

    /// Most recent executions first, truncated to `limit`.
    pub async fn history(
        &self,
        source_id: &str,
        limit: usize,
    ) -> Result<Vec<SyncHistoryEntry>, RuntimeError> {
        match self {
            Self::Postgres(db) => {
                let pool = db.pool().await?;
                let rows = sqlx::query(
                    "SELECT id, source_id, started_at, success, result, error, duration_ms, logs \
                     FROM folio_sync_history WHERE source_id = $1 \
                     ORDER BY id DESC LIMIT $2",
                )
                .bind(source_id)
                .bind(limit as i64)
                .fetch_all(&pool)
                .await
                .map_err(db_error)?;
                rows.iter().map(decode_history).collect()
            }
            Self::Memory(store) => {
                let store = store.read().await;
                Ok(store
                    .history
                    .iter()
                    .rev()
                    .filter(|entry| entry.source_id == source_id)
                    .take(limit)
                    .cloned()
                    .collect())
            }
        }
    }
}

fn decode_source(row: &sqlx::postgres::PgRow) -> Result<DataSource, RuntimeError> {
    let secret_names: Value = row.try_get("secret_names").map_err(db_error)?;
    let secret_names: Vec<String> =
        serde_json::from_value(secret_names).unwrap_or_default();
    Ok(DataSource {
        id: row.try_get("id").map_err(db_error)?,
        name: row.try_get("name").map_err(db_error)?,
        kind: row.try_get("kind").map_err(db_error)?,
        schedule: row.try_get("schedule").map_err(db_error)?,
        secret_names,
        config: row.try_get("config").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
    })
}

fn decode_history(row: &sqlx::postgres::PgRow) -> Result<SyncHistoryEntry, RuntimeError> {
    let logs: Value = row.try_get("logs").map_err(db_error)?;
    let duration_ms: i64 = row.try_get("duration_ms").map_err(db_error)?;
    Ok(SyncHistoryEntry {
        id: row.try_get("id").map_err(db_error)?,
        source_id: row.try_get("source_id").map_err(db_error)?,
        started_at: row.try_get("started_at").map_err(db_error)?,
        result: SyncResult {
            success: row.try_get("success").map_err(db_error)?,
            result: row.try_get("result").map_err(db_error)?,
            error: row.try_get("error").map_err(db_error)?,
            duration_ms: duration_ms.max(0) as u64,
            logs: serde_json::from_value(logs).unwrap_or_default(),
        },
    })
}

fn db_error(error: sqlx::Error) -> RuntimeError {
    RuntimeError::Connection(error.to_string())
}
