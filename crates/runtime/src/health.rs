// Health monitor: periodic service checks with bounded auto-recovery.
//
// Recovery policy per check: a down postgres gets `restart_attempts`
// restart+reconnect cycles before the failure is surfaced; a failed ping on
// an otherwise-up postgres triggers a pool reconnect only. Worker recovery
// follows the same shape but never affects database availability.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use folio_common::types::{EvalResult, ServiceEval, ServiceState};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::RuntimeError;
use crate::postgres::pool::DbPool;
use crate::postgres::PostgresManager;
use crate::worker::WorkerManager;

/// Explicit recovery policy (restart attempts per check cycle).
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub restart_attempts: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self { restart_attempts: 1 }
    }
}

pub struct HealthMonitor {
    postgres: Arc<PostgresManager>,
    pool: Arc<DbPool>,
    worker: Arc<WorkerManager>,
    policy: HealthPolicy,
    // Serializes recovery: concurrent callers must not stack restarts.
    recovery: tokio::sync::Mutex<()>,
    task: StdMutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl HealthMonitor {
    pub fn new(
        postgres: Arc<PostgresManager>,
        pool: Arc<DbPool>,
        worker: Arc<WorkerManager>,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            postgres,
            pool,
            worker,
            policy,
            recovery: tokio::sync::Mutex::new(()),
            task: StdMutex::new(None),
        }
    }

    /// Idempotent check-and-recover pass; safe to call before any
    /// privileged operation.
    pub async fn ensure_services_healthy(&self) -> Result<(), RuntimeError> {
        let _guard = self.recovery.lock().await;
        let postgres_result = self.check_postgres().await;
        self.check_worker().await;
        postgres_result
    }

    async fn check_postgres(&self) -> Result<(), RuntimeError> {
        let reported_up = self.postgres.status().up;
        let process_alive = self.postgres.is_process_running().await;

        if reported_up && process_alive {
            if self.pool.ping().await.is_ok() {
                return Ok(());
            }
            // Process is alive but the pool cannot reach it: the pool's
            // connections may predate a restart. Reconnect, don't restart.
            warn!("database ping failed, recreating pool");
            let url = self.postgres.connect_url().await;
            self.pool
                .recreate(&url)
                .await
                .map_err(|error| RuntimeError::Connection(format!("{error:#}")))?;
            return self.pool.ping().await;
        }

        if reported_up {
            self.postgres.mark_failed("postgres process is no longer running");
        }

        let mut last_error = "postgres is down".to_string();
        for attempt in 1..=self.policy.restart_attempts.max(1) {
            info!(attempt, "attempting postgres recovery restart");
            match self.postgres.restart().await {
                Ok(()) => {
                    let url = self.postgres.connect_url().await;
                    match self.pool.recreate(&url).await {
                        Ok(()) => {
                            info!("postgres recovered");
                            return Ok(());
                        }
                        Err(error) => {
                            last_error = format!("pool reconnect failed: {error:#}");
                        }
                    }
                }
                Err(error) => last_error = format!("{error:#}"),
            }
        }

        Err(RuntimeError::ProcessFailure { service: "postgres", message: last_error })
    }

    /// One-shot worker recovery; failure is logged, never surfaced — the
    /// database stays authoritative regardless of the worker.
    async fn check_worker(&self) {
        let status = self.worker.status();
        let crashed = status.up && !self.worker.is_process_running().await;
        let needs_restart = crashed || status.state == ServiceState::Failed;
        if !needs_restart {
            return;
        }

        if crashed {
            self.worker.mark_failed("worker process is no longer running");
        }
        info!("attempting worker recovery restart");
        if let Err(error) = self.worker.restart().await {
            warn!(%error, "worker recovery failed (non-fatal)");
        }
    }

    /// Point-in-time diagnostic snapshot.
    pub async fn eval(&self) -> EvalResult {
        let started = Instant::now();

        let postgres_status = self.postgres.status();
        let ping = self.pool.ping().await;
        let postgres = ServiceEval {
            reachable: ping.is_ok(),
            detail: ping.err().map(|error| error.to_string()),
            status: postgres_status,
        };

        let worker_status = self.worker.status();
        let worker_alive = self.worker.is_process_running().await;
        let build_errors = self.worker.build_errors();
        let worker = ServiceEval {
            reachable: worker_alive,
            detail: (!build_errors.is_empty())
                .then(|| format!("{} build error lines captured", build_errors.len())),
            status: worker_status,
        };

        let healthy = postgres.status.up && postgres.reachable;
        EvalResult {
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            healthy,
            postgres,
            worker,
        }
    }

    /// Start the periodic check loop. Idempotent.
    pub fn start_loop(self: &Arc<Self>, interval: Duration) {
        let mut task = self.task.lock().expect("health task lock poisoned");
        if task.as_ref().is_some_and(|(handle, _)| !handle.is_finished()) {
            return;
        }

        let monitor = Arc::clone(self);
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(error) = monitor.ensure_services_healthy().await {
                    warn!(%error, "health check failed");
                }
            }
        });
        *task = Some((handle, shutdown));
        info!(interval_secs = interval.as_secs(), "health monitor started");
    }

    pub fn stop_loop(&self) {
        if let Some((handle, shutdown)) = self.task.lock().expect("health task lock poisoned").take()
        {
            shutdown.cancel();
            handle.abort();
        }
    }
}
