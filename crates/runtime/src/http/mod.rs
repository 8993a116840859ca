// HTTP/SSE facade: thin routing over the runtime instance.
//
// Every handler translates a request into calls on the managers and maps
// `RuntimeError` onto a JSON error envelope. Event emitters (progress,
// changes, eval) become `text/event-stream` responses with one broadcast
// receiver per connected client; a disconnect drops the receiver without
// touching the producer.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use folio_common::types::{RuntimeLock, ServiceStatus, SyncResult};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::error::RuntimeError;
use crate::postgres::changes::quote_ident;
use crate::runtime::RuntimeInstance;
use crate::sync::{NewSource, SourceUpdate};

const EVAL_WATCH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_ROW_LIMIT: usize = 100;
const MAX_ROW_LIMIT: usize = 1000;

type AppState = Arc<RuntimeInstance>;

pub fn router(instance: AppState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .route("/lock", get(get_lock))
        .route("/eval", post(post_eval))
        .route("/eval/watch", get(watch_eval))
        .route("/workbook/switch", post(switch_workbook))
        .route("/postgres/query", post(postgres_query))
        .route("/postgres/tables", get(list_tables))
        .route("/postgres/tables/{name}/columns", get(table_columns))
        .route("/postgres/tables/{name}/rows", get(table_rows))
        .route("/postgres/changes", get(watch_changes))
        .route("/postgres/triggers/refresh", post(refresh_triggers))
        .route("/postgres/restart", post(restart_postgres))
        .route("/worker/status", get(worker_status))
        .route("/worker/restart", post(restart_worker))
        .route("/stop", post(stop_runtime))
        .route("/sync/sources", get(list_sources).post(add_source))
        .route(
            "/sync/sources/{id}",
            get(get_source).put(update_source).delete(delete_source),
        )
        .route("/sync/sources/{id}/sync", post(sync_source_now))
        .route("/sync/sources/{id}/cancel", post(cancel_sync))
        .route("/sync/sources/{id}/history", get(sync_history))
        .route("/sync/run", post(run_syncs))
        .route("/sync/progress", get(watch_progress))
        .layer(CorsLayer::permissive())
        .with_state(instance)
}

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn code_and_status(&self) -> (&'static str, StatusCode) {
        match self {
            Self::Validation(_) => ("VALIDATION_ERROR", StatusCode::BAD_REQUEST),
            Self::NotFound(_) => ("NOT_FOUND", StatusCode::NOT_FOUND),
            Self::Conflict(_) => ("LOCK_CONFLICT", StatusCode::CONFLICT),
            Self::Unavailable(_) => ("SERVICE_UNAVAILABLE", StatusCode::SERVICE_UNAVAILABLE),
            Self::Internal(_) => ("INTERNAL_ERROR", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status) = self.code_and_status();
        let message = match &self {
            Self::Validation(m) | Self::NotFound(m) | Self::Conflict(m) | Self::Unavailable(m) => {
                m.clone()
            }
            Self::Internal(error) => {
                tracing::error!(error = ?error, "internal error serving request");
                "internal error".to_string()
            }
        };
        (status, Json(json!({ "error": { "code": code, "message": message } }))).into_response()
    }
}

impl From<RuntimeError> for ApiError {
    fn from(error: RuntimeError) -> Self {
        match error {
            RuntimeError::Validation(message) => Self::Validation(message),
            RuntimeError::MissingSecrets { .. } => Self::Validation(error.to_string()),
            RuntimeError::NotFound(message) => Self::NotFound(message),
            RuntimeError::LockConflict { .. } => Self::Conflict(error.to_string()),
            RuntimeError::NotReady
            | RuntimeError::Connection(_)
            | RuntimeError::ProcessFailure { .. } => Self::Unavailable(error.to_string()),
            RuntimeError::SyncFailure { .. } => Self::Internal(error.into()),
        }
    }
}

/// Map `anyhow` errors, surfacing a wrapped `RuntimeError` when present.
fn map_anyhow(error: anyhow::Error) -> ApiError {
    match error.downcast::<RuntimeError>() {
        Ok(runtime_error) => runtime_error.into(),
        Err(other) => ApiError::Internal(other),
    }
}

fn db_internal(error: sqlx::Error) -> ApiError {
    ApiError::Unavailable(error.to_string())
}

// ── Status / health / lock ──────────────────────────────────────────

#[derive(Serialize)]
struct RuntimeStatusBody {
    workbook_id: String,
    workbook_dir: String,
    started_at: DateTime<Utc>,
    runtime_port: u16,
    postgres: ServiceStatus,
    worker: ServiceStatus,
    scheduler_running: bool,
    change_listener_running: bool,
}

async fn get_status(State(instance): State<AppState>) -> Json<RuntimeStatusBody> {
    let config = instance.config();
    Json(RuntimeStatusBody {
        workbook_id: config.workbook_id,
        workbook_dir: config.workbook_dir.display().to_string(),
        started_at: instance.started_at(),
        runtime_port: config.runtime_port,
        postgres: instance.postgres.status(),
        worker: instance.worker.status(),
        scheduler_running: instance.sync.scheduler_running(),
        change_listener_running: instance.changes.is_running(),
    })
}

async fn get_health(State(instance): State<AppState>) -> Response {
    let eval = instance.health.eval().await;
    let status =
        if eval.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(eval)).into_response()
}

async fn get_lock(State(instance): State<AppState>) -> Result<Json<RuntimeLock>, ApiError> {
    instance
        .lock_descriptor()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no lock is currently held".into()))
}

// ── Eval ────────────────────────────────────────────────────────────

async fn post_eval(State(instance): State<AppState>) -> Response {
    Json(instance.health.eval().await).into_response()
}

async fn watch_eval(
    State(instance): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        loop {
            let eval = instance.health.eval().await;
            let payload = serde_json::to_string(&eval).unwrap_or_else(|_| "{}".into());
            yield Ok(Event::default().data(payload));
            tokio::time::sleep(EVAL_WATCH_INTERVAL).await;
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── Workbook ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SwitchRequest {
    #[serde(alias = "workbookId")]
    workbook_id: String,
    #[serde(alias = "workbookDir")]
    workbook_dir: PathBuf,
}

async fn switch_workbook(
    State(instance): State<AppState>,
    Json(body): Json<SwitchRequest>,
) -> Result<Json<Value>, ApiError> {
    instance
        .switch_workbook(body.workbook_id.clone(), body.workbook_dir)
        .await
        .map_err(map_anyhow)?;
    Ok(Json(json!({ "switched": true, "workbook_id": body.workbook_id })))
}

async fn stop_runtime(State(instance): State<AppState>) -> Json<Value> {
    info!("shutdown requested over http");
    instance.request_shutdown();
    Json(json!({ "stopping": true }))
}

// ── Postgres ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
}

async fn postgres_query(
    State(instance): State<AppState>,
    Json(body): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    let output = instance.pool.query_json(&body.query).await?;
    Ok(Json(output).into_response())
}

async fn list_tables(State(instance): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pool = instance.pool.pool().await?;
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
         ORDER BY table_name",
    )
    .fetch_all(&pool)
    .await
    .map_err(db_internal)?;
    Ok(Json(json!({ "tables": tables })))
}

async fn table_columns(
    State(instance): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let pool = instance.pool.pool().await?;
    ensure_table_exists(&pool, &name).await?;

    let columns: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT column_name, data_type, is_nullable \
         FROM information_schema.columns \
         WHERE table_schema = 'public' AND table_name = $1 \
         ORDER BY ordinal_position",
    )
    .bind(&name)
    .fetch_all(&pool)
    .await
    .map_err(db_internal)?;

    let columns: Vec<Value> = columns
        .into_iter()
        .map(|(column, data_type, is_nullable)| {
            json!({
                "name": column,
                "data_type": data_type,
                "nullable": is_nullable == "YES",
            })
        })
        .collect();
    Ok(Json(json!({ "table": name, "columns": columns })))
}

#[derive(Deserialize)]
struct RowsQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn table_rows(
    State(instance): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RowsQuery>,
) -> Result<Response, ApiError> {
    let pool = instance.pool.pool().await?;
    ensure_table_exists(&pool, &name).await?;

    let limit = query.limit.unwrap_or(DEFAULT_ROW_LIMIT).clamp(1, MAX_ROW_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let output = instance
        .pool
        .query_json(&format!(
            "SELECT * FROM {} LIMIT {limit} OFFSET {offset}",
            quote_ident(&name)
        ))
        .await?;
    Ok(Json(output).into_response())
}

/// Reject table names that do not exist in the live schema before any
/// interpolation into SQL.
async fn ensure_table_exists(pool: &sqlx::PgPool, name: &str) -> Result<(), ApiError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_name = $1)",
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .map_err(db_internal)?;

    if exists {
        Ok(())
    } else {
        Err(ApiError::NotFound(format!("unknown table `{name}`")))
    }
}

async fn watch_changes(
    State(instance): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before snapshotting so nothing falls between history and
    // live; the timestamp guard drops the overlap.
    let rx = instance.changes.subscribe();
    let history = instance.changes.recent();

    let stream = async_stream::stream! {
        let last_ts = history.last().map(|change| change.ts);
        let snapshot = json!({ "type": "history", "changes": history });
        yield Ok(Event::default().data(snapshot.to_string()));

        let mut live = BroadcastStream::new(rx);
        while let Some(item) = live.next().await {
            // A lagged receiver skips missed events but keeps streaming.
            let Ok(change) = item else { continue };
            if last_ts.is_some_and(|ts| change.ts <= ts) {
                continue;
            }
            let payload = json!({ "type": "change", "change": change });
            yield Ok(Event::default().data(payload.to_string()));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn refresh_triggers(State(instance): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pool = instance.pool.pool().await?;
    instance.changes.refresh_triggers(&pool).await.map_err(map_anyhow)?;
    Ok(Json(json!({ "refreshed": true })))
}

async fn restart_postgres(State(instance): State<AppState>) -> Result<Json<Value>, ApiError> {
    instance.restart_postgres().await.map_err(map_anyhow)?;
    Ok(Json(json!({ "restarted": true, "status": instance.postgres.status() })))
}

// ── Worker ──────────────────────────────────────────────────────────

async fn worker_status(State(instance): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": instance.worker.status(),
        "build_errors": instance.worker.build_errors(),
    }))
}

async fn restart_worker(State(instance): State<AppState>) -> Json<Value> {
    // Worker failures are non-fatal by contract; report the status either way.
    if let Err(error) = instance.worker.restart().await {
        tracing::warn!(%error, "worker restart failed");
    }
    Json(json!({
        "status": instance.worker.status(),
        "build_errors": instance.worker.build_errors(),
    }))
}

// ── Sync ────────────────────────────────────────────────────────────

async fn list_sources(State(instance): State<AppState>) -> Result<Json<Value>, ApiError> {
    let sources = instance.sync.get_sources().await?;
    Ok(Json(json!({ "sources": sources })))
}

async fn add_source(
    State(instance): State<AppState>,
    Json(body): Json<NewSource>,
) -> Result<Response, ApiError> {
    let source = instance.sync.add_source(body).await?;
    Ok((StatusCode::CREATED, Json(source)).into_response())
}

async fn get_source(
    State(instance): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let source = instance
        .sync
        .get_source(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown source `{id}`")))?;
    Ok(Json(source).into_response())
}

async fn update_source(
    State(instance): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SourceUpdate>,
) -> Result<Response, ApiError> {
    let source = instance.sync.update_source(&id, body).await?;
    Ok(Json(source).into_response())
}

async fn delete_source(
    State(instance): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if instance.sync.delete_source(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("unknown source `{id}`")))
    }
}

async fn sync_source_now(
    State(instance): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SyncResult>, ApiError> {
    let result = instance.sync.sync_source(&id).await?;
    Ok(Json(result))
}

async fn cancel_sync(
    State(instance): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    let cancelled = instance.sync.cancel_sync(&id);
    Json(json!({ "cancelled": cancelled }))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn sync_history(
    State(instance): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let history = instance.sync.get_sync_history(&id, query.limit).await?;
    Ok(Json(json!({ "source_id": id, "history": history })))
}

#[derive(Deserialize)]
struct RunRequest {
    #[serde(alias = "sourceIds")]
    source_ids: Option<Vec<String>>,
    concurrency: Option<usize>,
}

async fn run_syncs(
    State(instance): State<AppState>,
    Json(body): Json<RunRequest>,
) -> Json<Value> {
    let outcomes = match body.source_ids {
        Some(ids) => instance.sync.sync_sources(ids, body.concurrency).await,
        None => instance.sync.sync_all(body.concurrency).await,
    };
    Json(json!({ "results": outcomes }))
}

async fn watch_progress(
    State(instance): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = instance.sync.subscribe_progress();
    let stream = async_stream::stream! {
        let mut events = BroadcastStream::new(rx);
        while let Some(item) = events.next().await {
            let Ok(progress) = item else { continue };
            let payload = serde_json::to_string(&progress).unwrap_or_else(|_| "{}".into());
            yield Ok(Event::default().data(payload));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::{RuntimeInstance, StoreKind};
    use crate::sync::handler::{HandlerRegistry, SyncContext, SyncHandler};

    struct EchoHandler;

    #[async_trait]
    impl SyncHandler for EchoHandler {
        async fn sync(&self, ctx: &SyncContext) -> AnyResult<Value> {
            ctx.log("echo ran");
            Ok(json!({ "echo": true }))
        }
    }

    fn test_instance(tmp: &TempDir) -> AppState {
        let mut config = RuntimeConfig::resolve("wb-http", tmp.path().join("wb"));
        std::fs::create_dir_all(&config.workbook_dir).unwrap();
        config.state_dir = tmp.path().join("state");

        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(EchoHandler));
        RuntimeInstance::assemble(config, Arc::new(registry), StoreKind::Memory).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn status_reports_workbook_identity() {
        let tmp = TempDir::new().unwrap();
        let app = router(test_instance(&tmp));

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["workbook_id"], "wb-http");
        assert_eq!(body["postgres"]["state"], "stopped");
        assert_eq!(body["scheduler_running"], false);
    }

    #[tokio::test]
    async fn lock_endpoint_returns_descriptor() {
        let tmp = TempDir::new().unwrap();
        let app = router(test_instance(&tmp));

        let response = app
            .oneshot(Request::builder().uri("/lock").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["workbookId"], "wb-http");
        assert_eq!(body["pid"], std::process::id());
    }

    #[tokio::test]
    async fn query_without_database_is_service_unavailable() {
        let tmp = TempDir::new().unwrap();
        let app = router(test_instance(&tmp));

        let response = app
            .oneshot(json_request("POST", "/postgres/query", json!({ "query": "SELECT 1" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn health_is_503_when_database_is_down() {
        let tmp = TempDir::new().unwrap();
        let app = router(test_instance(&tmp));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["healthy"], false);
    }

    #[tokio::test]
    async fn source_crud_and_sync_over_http() {
        let tmp = TempDir::new().unwrap();
        let instance = test_instance(&tmp);

        // Create.
        let response = router(Arc::clone(&instance))
            .oneshot(json_request(
                "POST",
                "/sync/sources",
                json!({ "name": "hackernews", "kind": "echo", "schedule": "0 * * * *" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["id"], "hackernews");

        // List.
        let response = router(Arc::clone(&instance))
            .oneshot(Request::builder().uri("/sync/sources").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed["sources"].as_array().unwrap().len(), 1);

        // Trigger a sync.
        let response = router(Arc::clone(&instance))
            .oneshot(json_request("POST", "/sync/sources/hackernews/sync", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result = body_json(response).await;
        assert_eq!(result["success"], true);
        assert!(result["duration_ms"].as_u64().is_some());

        // History has the run.
        let response = router(Arc::clone(&instance))
            .oneshot(
                Request::builder()
                    .uri("/sync/sources/hackernews/history?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let history = body_json(response).await;
        assert_eq!(history["history"].as_array().unwrap().len(), 1);

        // Delete.
        let response = router(Arc::clone(&instance))
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/sync/sources/hackernews")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn invalid_source_payload_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let app = router(test_instance(&tmp));

        let response = app
            .oneshot(json_request(
                "POST",
                "/sync/sources",
                json!({ "name": "x", "kind": "echo", "schedule": "not cron" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn unknown_source_is_404() {
        let tmp = TempDir::new().unwrap();
        let app = router(test_instance(&tmp));

        let response = app
            .oneshot(Request::builder().uri("/sync/sources/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_on_idle_source_reports_false() {
        let tmp = TempDir::new().unwrap();
        let app = router(test_instance(&tmp));

        let response = app
            .oneshot(json_request("POST", "/sync/sources/anything/cancel", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["cancelled"], false);
    }

    #[tokio::test]
    async fn batch_run_reports_per_source_outcomes() {
        let tmp = TempDir::new().unwrap();
        let instance = test_instance(&tmp);

        let response = router(Arc::clone(&instance))
            .oneshot(json_request(
                "POST",
                "/sync/sources",
                json!({ "name": "a", "kind": "echo" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router(Arc::clone(&instance))
            .oneshot(json_request(
                "POST",
                "/sync/run",
                json!({ "source_ids": ["a", "ghost"], "concurrency": 2 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        let ghost = results.iter().find(|r| r["source_id"] == "ghost").unwrap();
        assert_eq!(ghost["success"], false);
    }
}
