// Source sync executor.
//
// `execute_sync` never fails outward: missing secrets, handler errors,
// handler panics, and cancellation are all captured into the returned
// `SyncResult`. Duration is wall-clock from before secret resolution to
// completion.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::Utc;
use folio_common::types::{DataSource, LogEntry, LogLevel, SyncResult};
use tokio_util::sync::CancellationToken;

use crate::postgres::pool::DbPool;
use crate::secrets::SecretStore;
use crate::sync::handler::{LogSink, SyncContext, SyncHandler};

pub async fn execute_sync(
    source: &DataSource,
    handler: Arc<dyn SyncHandler>,
    db: Arc<DbPool>,
    secrets: &SecretStore,
    workbook_dir: PathBuf,
    cancel: CancellationToken,
    on_log: Option<LogSink>,
) -> SyncResult {
    let started = Instant::now();
    let logs: Arc<StdMutex<Vec<LogEntry>>> = Arc::new(StdMutex::new(Vec::new()));

    // Fail fast before any side effect when declared secrets are missing.
    let resolved = match secrets.resolve(&source.secret_names) {
        Ok(resolved) => resolved,
        Err(missing) => {
            let message = format!("Missing secrets: {}", missing.join(", "));
            record(&logs, &on_log, LogLevel::Error, message.clone());
            return SyncResult {
                success: false,
                result: None,
                error: Some(message),
                duration_ms: elapsed_ms(started),
                logs: take_logs(&logs),
            };
        }
    };

    let ctx = SyncContext::new(
        resolved,
        db,
        source.config.clone(),
        workbook_dir,
        cancel,
        Arc::clone(&logs),
        on_log.clone(),
    );

    // Run the handler in its own task so a panic is isolated into the
    // result instead of unwinding the caller.
    let outcome = tokio::spawn(async move { handler.sync(&ctx).await }).await;

    let (success, result, error) = match outcome {
        Ok(Ok(value)) => (true, Some(value), None),
        Ok(Err(error)) => (false, None, Some(format!("{error:#}"))),
        Err(join_error) if join_error.is_panic() => {
            (false, None, Some(format!("sync handler panicked: {join_error}")))
        }
        Err(join_error) => (false, None, Some(format!("sync handler aborted: {join_error}"))),
    };

    if let Some(message) = &error {
        record(&logs, &on_log, LogLevel::Error, message.clone());
    }

    SyncResult {
        success,
        result,
        error,
        duration_ms: elapsed_ms(started),
        logs: take_logs(&logs),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn record(
    logs: &Arc<StdMutex<Vec<LogEntry>>>,
    on_log: &Option<LogSink>,
    level: LogLevel,
    message: String,
) {
    let entry = LogEntry { timestamp: Utc::now(), level, message };
    if let Some(sink) = on_log {
        sink(&entry);
    }
    logs.lock().expect("sync log lock poisoned").push(entry);
}

fn take_logs(logs: &Arc<StdMutex<Vec<LogEntry>>>) -> Vec<LogEntry> {
    std::mem::take(&mut *logs.lock().expect("sync log lock poisoned"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    use super::*;
    use crate::postgres::pool::{DbPool, PoolConfig};
    use crate::sync::handler::HandlerRegistry;

    struct OkHandler;

    #[async_trait]
    impl SyncHandler for OkHandler {
        async fn sync(&self, ctx: &SyncContext) -> Result<Value> {
            ctx.log("synced 3 items");
            Ok(json!({ "records": 3 }))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl SyncHandler for FailingHandler {
        async fn sync(&self, _ctx: &SyncContext) -> Result<Value> {
            Err(anyhow!("upstream returned 500"))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl SyncHandler for PanickingHandler {
        async fn sync(&self, _ctx: &SyncContext) -> Result<Value> {
            panic!("handler bug");
        }
    }

    struct SecretEchoHandler;

    #[async_trait]
    impl SyncHandler for SecretEchoHandler {
        async fn sync(&self, ctx: &SyncContext) -> Result<Value> {
            Ok(json!({ "token": ctx.secrets.get("GITHUB_TOKEN") }))
        }
    }

    struct CancelAwareHandler;

    #[async_trait]
    impl SyncHandler for CancelAwareHandler {
        async fn sync(&self, ctx: &SyncContext) -> Result<Value> {
            ctx.cancelled().await;
            Err(anyhow!("observed cancellation"))
        }
    }

    fn source(name: &str, secret_names: &[&str]) -> DataSource {
        DataSource {
            id: name.into(),
            name: name.into(),
            kind: "test".into(),
            schedule: None,
            secret_names: secret_names.iter().map(|s| s.to_string()).collect(),
            config: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn db() -> Arc<DbPool> {
        Arc::new(DbPool::new(PoolConfig::default()))
    }

    fn workbook_dir(tmp: &TempDir) -> PathBuf {
        tmp.path().to_path_buf()
    }

    #[tokio::test]
    async fn missing_secrets_fail_fast_with_every_name() {
        let tmp = TempDir::new().unwrap();
        let result = execute_sync(
            &source("github", &["GITHUB_TOKEN", "GITHUB_ORG_XYZ"]),
            Arc::new(OkHandler),
            db(),
            &SecretStore::default(),
            workbook_dir(&tmp),
            CancellationToken::new(),
            None,
        )
        .await;

        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Missing secrets: GITHUB_TOKEN, GITHUB_ORG_XYZ")
        );
        assert!(result.result.is_none());
        // Handler never ran: the only log line is the failure itself.
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn successful_sync_captures_result_and_logs() {
        let tmp = TempDir::new().unwrap();
        let result = execute_sync(
            &source("hackernews", &[]),
            Arc::new(OkHandler),
            db(),
            &SecretStore::default(),
            workbook_dir(&tmp),
            CancellationToken::new(),
            None,
        )
        .await;

        assert!(result.success);
        assert_eq!(result.result, Some(json!({ "records": 3 })));
        assert!(result.error.is_none());
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].message, "synced 3 items");
    }

    #[tokio::test]
    async fn handler_error_is_captured_not_raised() {
        let tmp = TempDir::new().unwrap();
        let result = execute_sync(
            &source("s", &[]),
            Arc::new(FailingHandler),
            db(),
            &SecretStore::default(),
            workbook_dir(&tmp),
            CancellationToken::new(),
            None,
        )
        .await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("upstream returned 500"));
    }

    #[tokio::test]
    async fn handler_panic_is_captured_not_raised() {
        let tmp = TempDir::new().unwrap();
        let result = execute_sync(
            &source("s", &[]),
            Arc::new(PanickingHandler),
            db(),
            &SecretStore::default(),
            workbook_dir(&tmp),
            CancellationToken::new(),
            None,
        )
        .await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn resolved_secrets_reach_the_handler() {
        let tmp = TempDir::new().unwrap();
        let secrets = SecretStore::from_values(HashMap::from([(
            "GITHUB_TOKEN".to_string(),
            "ghp_abc".to_string(),
        )]));
        let result = execute_sync(
            &source("github", &["GITHUB_TOKEN"]),
            Arc::new(SecretEchoHandler),
            db(),
            &secrets,
            workbook_dir(&tmp),
            CancellationToken::new(),
            None,
        )
        .await;

        assert!(result.success);
        assert_eq!(result.result, Some(json!({ "token": "ghp_abc" })));
    }

    #[tokio::test]
    async fn cancellation_is_observable_by_the_handler() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = execute_sync(
            &source("s", &[]),
            Arc::new(CancelAwareHandler),
            db(),
            &SecretStore::default(),
            workbook_dir(&tmp),
            cancel,
            None,
        )
        .await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("cancellation"));
    }

    #[tokio::test]
    async fn live_log_sink_sees_lines_as_they_happen() {
        let tmp = TempDir::new().unwrap();
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: LogSink = Arc::new(move |entry: &LogEntry| {
            sink_seen.lock().unwrap().push(entry.message.clone());
        });

        let result = execute_sync(
            &source("hackernews", &[]),
            Arc::new(OkHandler),
            db(),
            &SecretStore::default(),
            workbook_dir(&tmp),
            CancellationToken::new(),
            Some(sink),
        )
        .await;

        assert!(result.success);
        assert_eq!(*seen.lock().unwrap(), vec!["synced 3 items".to_string()]);
    }

    #[test]
    fn registry_default_includes_builtins() {
        assert!(HandlerRegistry::default().contains("http_json"));
    }
}
