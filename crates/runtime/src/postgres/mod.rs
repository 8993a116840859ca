// Embedded postgres process manager.
//
// Owns the `postgres` child process bound to a per-workbook data directory
// and port. Restart cadence is caller-driven (health monitor); this manager
// never retries on its own.

pub mod changes;
pub mod pool;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use folio_common::types::{ServiceState, ServiceStatus};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::process::{wait_for_tcp, ProcessHandle, SpawnSpec};

const READY_RETRIES: usize = 100;
const READY_DELAY: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(10);

pub struct PostgresManager {
    inner: Mutex<PgInner>,
    status: std::sync::RwLock<ServiceStatus>,
}

struct PgInner {
    data_dir: PathBuf,
    database: String,
    superuser: String,
    port: u16,
    bin_dir: Option<PathBuf>,
    process: Option<ProcessHandle>,
}

impl PostgresManager {
    pub fn new(config: &RuntimeConfig) -> Self {
        let status = ServiceStatus::stopped(config.postgres.port);
        Self {
            inner: Mutex::new(PgInner {
                data_dir: config.postgres_data_dir(),
                database: config.postgres.database.clone(),
                superuser: config.postgres.superuser.clone(),
                port: config.postgres.port,
                bin_dir: config.postgres.bin_dir.clone(),
                process: None,
            }),
            status: std::sync::RwLock::new(status),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.read().expect("postgres status lock poisoned").clone()
    }

    /// Connection URL for the currently bound database.
    pub async fn connect_url(&self) -> String {
        let inner = self.inner.lock().await;
        format!(
            "postgres://{}@127.0.0.1:{}/{}",
            inner.superuser, inner.port, inner.database
        )
    }

    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.process.as_mut().is_some_and(ProcessHandle::is_running) {
            return Ok(());
        }

        self.set_status(|status| {
            status.state = ServiceState::Starting;
            status.up = false;
            status.pid = None;
            status.error = None;
        });

        match start_locked(&mut inner).await {
            Ok(pid) => {
                self.set_status(|status| {
                    status.state = ServiceState::Running;
                    status.up = true;
                    status.pid = Some(pid);
                });
                info!(port = inner.port, pid, data_dir = %inner.data_dir.display(), "postgres ready");
                Ok(())
            }
            Err(error) => {
                self.set_status(|status| {
                    status.state = ServiceState::Failed;
                    status.up = false;
                    status.error = Some(format!("{error:#}"));
                });
                Err(error)
            }
        }
    }

    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(process) = inner.process.take() {
            info!(pid = process.pid(), "stopping postgres");
            process.terminate(STOP_GRACE).await;
        }
        self.set_status(|status| {
            status.state = ServiceState::Stopped;
            status.up = false;
            status.pid = None;
        });
    }

    /// Stop then start. Increments `restart_count` by exactly one.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.set_status(|status| status.restart_count += 1);
        self.start().await
    }

    /// The only path allowed to change the bound data directory for a live
    /// manager. Fully stops before rebinding.
    pub async fn switch_workbook(&self, data_dir: PathBuf, database: String) -> Result<()> {
        self.stop().await;
        {
            let mut inner = self.inner.lock().await;
            inner.data_dir = data_dir;
            inner.database = database;
        }
        self.start().await
    }

    /// Whether the child process is still alive (non-blocking probe).
    pub async fn is_process_running(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.process.as_mut().is_some_and(ProcessHandle::is_running)
    }

    /// Record that the process was observed down outside of `stop()`.
    pub fn mark_failed(&self, message: impl Into<String>) {
        self.set_status(|status| {
            status.state = ServiceState::Failed;
            status.up = false;
            status.error = Some(message.into());
        });
    }

    fn set_status(&self, update: impl FnOnce(&mut ServiceStatus)) {
        let mut status = self.status.write().expect("postgres status lock poisoned");
        update(&mut status);
    }
}

async fn start_locked(inner: &mut PgInner) -> Result<u32> {
    if !inner.data_dir.join("PG_VERSION").exists() {
        init_data_dir(inner).await?;
    }

    let data_dir = inner.data_dir.to_string_lossy().into_owned();
    let spec = SpawnSpec::new(bin_path(inner, "postgres"))
        .arg("-D")
        .arg(data_dir.as_str())
        .arg("-p")
        .arg(inner.port.to_string())
        .arg("-c")
        .arg("listen_addresses=127.0.0.1")
        // Keep the unix socket inside the data dir: no /var/run permissions.
        .arg("-k")
        .arg(data_dir.as_str());
    let process = ProcessHandle::spawn(spec).context("failed to spawn postgres")?;
    let pid = process.pid();

    wait_for_tcp(inner.port, READY_RETRIES, READY_DELAY)
        .await
        .with_context(|| format!("postgres did not become ready on port {}", inner.port))?;

    ensure_database(inner).await?;
    inner.process = Some(process);
    Ok(pid)
}

async fn init_data_dir(inner: &PgInner) -> Result<()> {
    std::fs::create_dir_all(&inner.data_dir).with_context(|| {
        format!("failed to create postgres data directory `{}`", inner.data_dir.display())
    })?;

    info!(data_dir = %inner.data_dir.display(), "initializing postgres data directory");
    let output = tokio::process::Command::new(bin_path(inner, "initdb"))
        .arg("-D")
        .arg(&inner.data_dir)
        .arg("-U")
        .arg(&inner.superuser)
        // Loopback-only embedded server; trust keeps the pool passwordless.
        .arg("-A")
        .arg("trust")
        .arg("--no-sync")
        .output()
        .await
        .context("failed to run initdb")?;

    if !output.status.success() {
        bail!("initdb failed: {}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(())
}

async fn ensure_database(inner: &PgInner) -> Result<()> {
    let output = tokio::process::Command::new(bin_path(inner, "createdb"))
        .arg("-h")
        .arg("127.0.0.1")
        .arg("-p")
        .arg(inner.port.to_string())
        .arg("-U")
        .arg(&inner.superuser)
        .arg(&inner.database)
        .output()
        .await
        .context("failed to run createdb")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("already exists") {
            bail!("createdb `{}` failed: {}", inner.database, stderr.trim());
        }
    }
    Ok(())
}

fn bin_path(inner: &PgInner, name: &str) -> String {
    match &inner.bin_dir {
        Some(dir) => dir.join(name).to_string_lossy().into_owned(),
        None => name.to_string(),
    }
}
