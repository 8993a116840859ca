// Worker process manager: the sandboxed dev-server serving the workbook's
// compiled application.
//
// Mirrors the postgres manager's lifecycle but its failures are always
// non-fatal to the rest of the runtime: the database stays authoritative
// and independently usable.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use folio_common::types::{ServiceState, ServiceStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::process::{ProcessHandle, SpawnSpec};

const STOP_GRACE: Duration = Duration::from_secs(5);
const MAX_BUILD_ERRORS: usize = 50;

pub struct WorkerManager {
    inner: Mutex<WorkerInner>,
    status: std::sync::RwLock<ServiceStatus>,
    build_errors: Arc<StdMutex<Vec<String>>>,
}

struct WorkerInner {
    dir: PathBuf,
    port: u16,
    command: String,
    args: Vec<String>,
    process: Option<ProcessHandle>,
    stderr_task: Option<JoinHandle<()>>,
}

impl WorkerManager {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            inner: Mutex::new(WorkerInner {
                dir: config.workbook_dir.clone(),
                port: config.worker.port,
                command: config.worker.command.clone(),
                args: config.worker.args.clone(),
                process: None,
                stderr_task: None,
            }),
            status: std::sync::RwLock::new(ServiceStatus::stopped(config.worker.port)),
            build_errors: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.read().expect("worker status lock poisoned").clone()
    }

    /// Build errors captured from the dev-server's stderr since the last
    /// (re)start, oldest first, bounded.
    pub fn build_errors(&self) -> Vec<String> {
        self.build_errors.lock().expect("build errors lock poisoned").clone()
    }

    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.process.as_mut().is_some_and(ProcessHandle::is_running) {
            return Ok(());
        }

        self.build_errors.lock().expect("build errors lock poisoned").clear();
        self.set_status(|status| {
            status.state = ServiceState::Starting;
            status.up = false;
            status.pid = None;
            status.error = None;
        });

        let spec = SpawnSpec::new(inner.command.as_str())
            .args(inner.args.iter().cloned())
            .cwd(&inner.dir)
            .env("PORT", inner.port.to_string())
            .env("FOLIO_WORKER_PORT", inner.port.to_string())
            .capture_stderr();

        match ProcessHandle::spawn(spec) {
            Ok(mut process) => {
                if let Some(stderr) = process.take_stderr() {
                    let errors = Arc::clone(&self.build_errors);
                    inner.stderr_task = Some(tokio::spawn(async move {
                        let mut lines = BufReader::new(stderr).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            warn!(target: "folio_worker", "{line}");
                            push_build_error(&errors, line);
                        }
                    }));
                }
                let pid = process.pid();
                inner.process = Some(process);
                self.set_status(|status| {
                    status.state = ServiceState::Running;
                    status.up = true;
                    status.pid = Some(pid);
                });
                info!(port = inner.port, pid, dir = %inner.dir.display(), "worker started");
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
            info!(pid = process.pid(), "stopping worker");
            process.terminate(STOP_GRACE).await;
        }
        if let Some(task) = inner.stderr_task.take() {
            task.abort();
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

    pub async fn switch_workbook(&self, dir: PathBuf) -> Result<()> {
        self.stop().await;
        {
            let mut inner = self.inner.lock().await;
            inner.dir = dir;
        }
        self.start().await
    }

    /// Whether the child process is still alive (non-blocking probe).
    pub async fn is_process_running(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.process.as_mut().is_some_and(ProcessHandle::is_running)
    }

    pub fn mark_failed(&self, message: impl Into<String>) {
        self.set_status(|status| {
            status.state = ServiceState::Failed;
            status.up = false;
            status.error = Some(message.into());
        });
    }

    fn set_status(&self, update: impl FnOnce(&mut ServiceStatus)) {
        let mut status = self.status.write().expect("worker status lock poisoned");
        update(&mut status);
    }
}

fn push_build_error(errors: &Arc<StdMutex<Vec<String>>>, line: String) {
    let mut errors = errors.lock().expect("build errors lock poisoned");
    if errors.len() == MAX_BUILD_ERRORS {
        errors.remove(0);
    }
    errors.push(line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use tempfile::TempDir;

    fn config_with_command(dir: &TempDir, command: &str, args: &[&str]) -> RuntimeConfig {
        let mut config = RuntimeConfig::resolve("wb-test", dir.path());
        config.worker.command = command.into();
        config.worker.args = args.iter().map(|s| s.to_string()).collect();
        config
    }

    #[tokio::test]
    async fn failed_start_is_recorded_as_failed() {
        let dir = TempDir::new().unwrap();
        let config = config_with_command(&dir, "definitely-not-a-real-binary-xyz", &[]);
        let manager = WorkerManager::new(&config);

        assert!(manager.start().await.is_err());
        let status = manager.status();
        assert_eq!(status.state, ServiceState::Failed);
        assert!(!status.up);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn stderr_lines_are_captured_as_build_errors() {
        let dir = TempDir::new().unwrap();
        let config =
            config_with_command(&dir, "sh", &["-c", "echo 'TS2304: cannot find name' >&2; sleep 5"]);
        let manager = WorkerManager::new(&config);

        manager.start().await.expect("sh should spawn");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let errors = manager.build_errors();
        assert!(
            errors.iter().any(|line| line.contains("TS2304")),
            "expected captured stderr, got {errors:?}"
        );
        manager.stop().await;
    }

    #[tokio::test]
    async fn restart_increments_restart_count_once() {
        let dir = TempDir::new().unwrap();
        let config = config_with_command(&dir, "sleep", &["5"]);
        let manager = WorkerManager::new(&config);

        manager.start().await.unwrap();
        assert_eq!(manager.status().restart_count, 0);
        manager.restart().await.unwrap();
        assert_eq!(manager.status().restart_count, 1);
        manager.stop().await;
        assert_eq!(manager.status().restart_count, 1);
    }

    #[test]
    fn build_error_list_is_bounded() {
        let errors = Arc::new(StdMutex::new(Vec::new()));
        for n in 0..(MAX_BUILD_ERRORS + 10) {
            push_build_error(&errors, format!("error {n}"));
        }
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), MAX_BUILD_ERRORS);
        assert_eq!(errors.first().map(String::as_str), Some("error 10"));
    }
}
