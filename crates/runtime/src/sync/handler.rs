// Sync handler contract and registry.
//
// A handler is the synchronization function behind a `DataSource.kind`. It
// receives an injected context (secrets, database handle, logger,
// cancellation token) and returns a JSON summary. Cancellation is
// cooperative: a handler that never polls the token runs to completion —
// the runtime does not force-terminate it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use folio_common::types::{LogEntry, LogLevel};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::postgres::pool::DbPool;

/// Live log callback: receives each entry as it is emitted, in addition to
/// the entry being accumulated into the final `SyncResult.logs`.
pub type LogSink = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Execution context handed to a sync handler.
pub struct SyncContext {
    pub secrets: HashMap<String, String>,
    pub db: Arc<DbPool>,
    pub config: Value,
    pub workbook_dir: PathBuf,
    cancel: CancellationToken,
    logs: Arc<StdMutex<Vec<LogEntry>>>,
    on_log: Option<LogSink>,
}

impl SyncContext {
    pub(crate) fn new(
        secrets: HashMap<String, String>,
        db: Arc<DbPool>,
        config: Value,
        workbook_dir: PathBuf,
        cancel: CancellationToken,
        logs: Arc<StdMutex<Vec<LogEntry>>>,
        on_log: Option<LogSink>,
    ) -> Self {
        Self { secrets, db, config, workbook_dir, cancel, logs, on_log }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.record(LogLevel::Info, message.into());
    }

    pub fn log_error(&self, message: impl Into<String>) {
        self.record(LogLevel::Error, message.into());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    fn record(&self, level: LogLevel, message: String) {
        let entry = LogEntry { timestamp: Utc::now(), level, message };
        if let Some(sink) = &self.on_log {
            sink(&entry);
        }
        self.logs.lock().expect("sync log lock poisoned").push(entry);
    }
}

#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn sync(&self, ctx: &SyncContext) -> Result<Value>;
}

/// Maps `DataSource.kind` to its handler.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn SyncHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("http_json", Arc::new(HttpJsonHandler));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn SyncHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn SyncHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Built-in handler: fetch a JSON document over HTTP and (optionally) land
/// the records in a table.
///
/// Config: `{ "url": "...", "table": "hackernews_items"? }`.
pub struct HttpJsonHandler;

#[async_trait]
impl SyncHandler for HttpJsonHandler {
    async fn sync(&self, ctx: &SyncContext) -> Result<Value> {
        let url = ctx
            .config
            .get("url")
            .and_then(Value::as_str)
            .context("source config is missing `url`")?;
        let table = ctx.config.get("table").and_then(Value::as_str);

        ctx.log(format!("fetching {url}"));
        let response = reqwest::get(url)
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("request to {url} failed with status {status}");
        }
        let body: Value = response.json().await.context("response body was not valid JSON")?;

        if ctx.is_cancelled() {
            bail!("sync cancelled before loading records");
        }

        let records = match body {
            Value::Array(items) => items,
            other => vec![other],
        };

        if let Some(table) = table {
            ensure_landing_table_name(table)?;
            ctx.db
                .execute(&format!(
                    "CREATE TABLE IF NOT EXISTS \"{table}\" (\
                     id BIGSERIAL PRIMARY KEY, \
                     payload JSONB NOT NULL, \
                     fetched_at TIMESTAMPTZ NOT NULL DEFAULT now())"
                ))
                .await?;

            let pool = ctx.db.pool().await?;
            for record in &records {
                if ctx.is_cancelled() {
                    bail!("sync cancelled while loading records");
                }
                sqlx::query(&format!("INSERT INTO \"{table}\" (payload) VALUES ($1)"))
                    .bind(record)
                    .execute(&pool)
                    .await
                    .with_context(|| format!("failed to insert record into `{table}`"))?;
            }
            ctx.log(format!("loaded {} records into {table}", records.len()));
        } else {
            ctx.log(format!("fetched {} records", records.len()));
        }

        Ok(json!({ "records": records.len() }))
    }
}

/// Landing table names are interpolated into DDL; restrict to plain
/// identifiers.
fn ensure_landing_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        bail!("invalid landing table name `{name}`");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::pool::{DbPool, PoolConfig};

    fn context_with_config(config: Value) -> SyncContext {
        SyncContext::new(
            HashMap::new(),
            Arc::new(DbPool::new(PoolConfig::default())),
            config,
            PathBuf::from("/tmp/wb"),
            CancellationToken::new(),
            Arc::new(StdMutex::new(Vec::new())),
            None,
        )
    }

    #[test]
    fn registry_resolves_builtin_kind() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.contains("http_json"));
        assert!(registry.get("http_json").is_some());
        assert!(registry.get("nope").is_none());
        assert_eq!(registry.kinds(), vec!["http_json".to_string()]);
    }

    #[test]
    fn landing_table_names_are_restricted() {
        assert!(ensure_landing_table_name("hackernews_items").is_ok());
        assert!(ensure_landing_table_name("_staging").is_ok());
        assert!(ensure_landing_table_name("items; DROP TABLE x").is_err());
        assert!(ensure_landing_table_name("1abc").is_err());
        assert!(ensure_landing_table_name("").is_err());
    }

    #[tokio::test]
    async fn http_json_requires_url_in_config() {
        let ctx = context_with_config(json!({}));
        let error = HttpJsonHandler.sync(&ctx).await.unwrap_err();
        assert!(error.to_string().contains("url"));
    }

    #[test]
    fn context_accumulates_logs_and_streams_them() {
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let logs = Arc::new(StdMutex::new(Vec::new()));
        let ctx = SyncContext::new(
            HashMap::new(),
            Arc::new(DbPool::new(PoolConfig::default())),
            Value::Null,
            PathBuf::from("/tmp/wb"),
            CancellationToken::new(),
            Arc::clone(&logs),
            Some(Arc::new(move |entry: &LogEntry| {
                sink_seen.lock().unwrap().push(entry.message.clone());
            })),
        );

        ctx.log("first");
        ctx.log_error("second");

        let captured = logs.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].level, LogLevel::Info);
        assert_eq!(captured[1].level, LogLevel::Error);
        assert_eq!(*seen.lock().unwrap(), vec!["first".to_string(), "second".to_string()]);
    }
}
