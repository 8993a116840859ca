// foliod: workbook runtime entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use folio_runtime::config::RuntimeConfig;
use folio_runtime::http;
use folio_runtime::runtime::RuntimeInstance;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let workbook_dir = resolve_workbook_dir()?;
    let workbook_id = std::env::var("FOLIO_WORKBOOK_ID")
        .ok()
        .unwrap_or_else(|| default_workbook_id(&workbook_dir));

    let config = RuntimeConfig::resolve(workbook_id, workbook_dir);
    info!(
        workbook_id = %config.workbook_id,
        workbook_dir = %config.workbook_dir.display(),
        "starting folio runtime"
    );

    let instance = RuntimeInstance::start(config.clone())
        .await
        .context("runtime failed to start")?;

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.runtime_port))
        .await
        .with_context(|| format!("failed to bind runtime port {}", config.runtime_port))?;
    info!(port = config.runtime_port, "runtime listening");

    let shutdown = instance.shutdown_signal();
    let serve_result = axum::serve(listener, http::router(Arc::clone(&instance)))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {},
                _ = tokio::signal::ctrl_c() => {},
            }
        })
        .await;

    instance.shutdown().await;
    serve_result.context("runtime http server terminated unexpectedly")
}

fn resolve_workbook_dir() -> anyhow::Result<PathBuf> {
    let dir = match std::env::var_os("FOLIO_WORKBOOK_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir().context("could not determine working directory")?,
    };
    Ok(dir.canonicalize().unwrap_or(dir))
}

fn default_workbook_id(workbook_dir: &std::path::Path) -> String {
    workbook_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workbook".to_string())
}
