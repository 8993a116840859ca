// The runtime instance: explicit owner of every manager.
//
// Constructed once at process start and handed to the HTTP facade as shared
// state — never reached through globals, so workbook switches and tests can
// build fresh instances deterministically.
//
// Startup order: lock → postgres → pool → change listener (non-fatal) →
// worker (non-fatal) → sync init + scheduler → health loop. Switching
// workbooks is stop-the-world: every dependent is torn down and rebuilt
// before the switch is complete.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use folio_common::types::RuntimeLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::health::{HealthMonitor, HealthPolicy};
use crate::lock::{LockGuard, LockManager};
use crate::postgres::changes::ChangeListener;
use crate::postgres::pool::{DbPool, PoolConfig};
use crate::postgres::PostgresManager;
use crate::secrets::SecretStore;
use crate::sync::handler::HandlerRegistry;
use crate::sync::store::SourceStore;
use crate::sync::SyncManager;
use crate::worker::WorkerManager;

/// Which backend the sync manager persists into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreKind {
    Postgres,
    Memory,
}

pub struct RuntimeInstance {
    config: StdRwLock<RuntimeConfig>,
    started_at: DateTime<Utc>,
    lock_manager: LockManager,
    lock: StdMutex<Option<LockGuard>>,
    pub postgres: Arc<PostgresManager>,
    pub pool: Arc<DbPool>,
    pub changes: Arc<ChangeListener>,
    pub worker: Arc<WorkerManager>,
    pub sync: Arc<SyncManager>,
    pub health: Arc<HealthMonitor>,
    shutdown: CancellationToken,
}

impl RuntimeInstance {
    /// Acquire the workbook lock and start every subsystem.
    pub async fn start(config: RuntimeConfig) -> Result<Arc<Self>> {
        let instance = Self::assemble(
            config,
            Arc::new(HandlerRegistry::with_builtins()),
            StoreKind::Postgres,
        )?;
        instance.boot().await?;
        Ok(instance)
    }

    /// Build the instance (lock acquired, nothing started). `start` boots
    /// afterwards; tests drive individual subsystems directly.
    pub(crate) fn assemble(
        config: RuntimeConfig,
        registry: Arc<HandlerRegistry>,
        store_kind: StoreKind,
    ) -> Result<Arc<Self>> {
        let lock_manager = LockManager::new(config.locks_dir());
        let guard = lock_manager.acquire(lock_descriptor_for(&config))?;

        let postgres = Arc::new(PostgresManager::new(&config));
        let pool = Arc::new(DbPool::new(PoolConfig::from_env()));
        let changes = Arc::new(ChangeListener::new());
        let worker = Arc::new(WorkerManager::new(&config));

        let store = match store_kind {
            StoreKind::Postgres => SourceStore::postgres(Arc::clone(&pool)),
            StoreKind::Memory => SourceStore::memory(),
        };
        let sync = Arc::new(SyncManager::new(
            store,
            registry,
            Arc::clone(&pool),
            SecretStore::load(&config.workbook_dir),
            config.workbook_dir.clone(),
            config.sync,
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&postgres),
            Arc::clone(&pool),
            Arc::clone(&worker),
            HealthPolicy { restart_attempts: config.health.restart_attempts },
        ));

        Ok(Arc::new(Self {
            started_at: Utc::now(),
            lock_manager,
            lock: StdMutex::new(Some(guard)),
            postgres,
            pool,
            changes,
            worker,
            sync,
            health,
            shutdown: CancellationToken::new(),
            config: StdRwLock::new(config),
        }))
    }

    async fn boot(&self) -> Result<()> {
        let config = self.config();

        self.postgres.start().await.context("failed to start embedded postgres")?;
        self.pool
            .connect(&self.postgres.connect_url().await)
            .await
            .context("failed to connect the database pool")?;

        match self.pool.pool().await {
            Ok(pg) => {
                if let Err(error) = self.changes.start(&pg).await {
                    warn!(%error, "change listener failed to start (live updates disabled)");
                }
            }
            Err(error) => warn!(%error, "pool not ready for change listener"),
        }

        if let Err(error) = self.worker.start().await {
            warn!(%error, "worker failed to start (application preview unavailable)");
        }

        self.sync.init().await.context("failed to provision sync tables")?;
        self.sync.start_scheduler();
        self.health.start_loop(Duration::from_secs(config.health.interval_secs));

        info!(
            workbook_id = %config.workbook_id,
            runtime_port = config.runtime_port,
            postgres_port = config.postgres.port,
            worker_port = config.worker.port,
            "runtime instance started"
        );
        Ok(())
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn lock_descriptor(&self) -> Option<RuntimeLock> {
        self.lock
            .lock()
            .expect("lock guard mutex poisoned")
            .as_ref()
            .map(|guard| guard.descriptor().clone())
    }

    /// Cancellation token that fires when a shutdown has been requested.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Restart the database process and rebuild everything that held its
    /// identity (pool, change listener).
    pub async fn restart_postgres(&self) -> Result<()> {
        self.changes.stop();
        self.postgres.restart().await.context("postgres restart failed")?;
        self.pool
            .recreate(&self.postgres.connect_url().await)
            .await
            .context("pool reconnect after restart failed")?;
        match self.pool.pool().await {
            Ok(pg) => {
                if let Err(error) = self.changes.start(&pg).await {
                    warn!(%error, "change listener did not come back after restart");
                }
            }
            Err(error) => warn!(%error, "pool not ready after restart"),
        }
        Ok(())
    }

    /// Stop-the-world switch to another workbook. The new workbook's lock is
    /// acquired before anything is torn down; on conflict the current
    /// workbook keeps running untouched.
    pub async fn switch_workbook(
        &self,
        workbook_id: String,
        workbook_dir: PathBuf,
    ) -> Result<()> {
        if !workbook_dir.is_dir() {
            return Err(RuntimeError::Validation(format!(
                "workbook directory `{}` does not exist",
                workbook_dir.display()
            ))
            .into());
        }

        let new_config = self.config().for_workbook(&workbook_id, &workbook_dir);
        let new_guard = self.lock_manager.acquire(lock_descriptor_for(&new_config))?;

        info!(workbook_id = %new_config.workbook_id, "switching workbook (stop-the-world)");
        self.sync.stop_scheduler();
        self.changes.stop();
        self.changes.clear();
        self.worker.stop().await;
        self.pool.close().await;

        self.postgres
            .switch_workbook(
                new_config.postgres_data_dir(),
                new_config.postgres.database.clone(),
            )
            .await
            .context("failed to start postgres for the new workbook")?;
        self.pool
            .connect(&self.postgres.connect_url().await)
            .await
            .context("failed to connect the pool for the new workbook")?;

        if let Ok(pg) = self.pool.pool().await {
            if let Err(error) = self.changes.start(&pg).await {
                warn!(%error, "change listener failed to start for the new workbook");
            }
        }
        if let Err(error) = self.worker.switch_workbook(workbook_dir.clone()).await {
            warn!(%error, "worker failed to start for the new workbook");
        }

        self.sync.rebind_workbook(workbook_dir, SecretStore::load(&new_config.workbook_dir));
        self.sync.init().await.context("failed to provision sync tables for the new workbook")?;
        self.sync.start_scheduler();

        // Swap config and lock last; dropping the old guard removes the old
        // workbook's lock file.
        *self.config.write().expect("config lock poisoned") = new_config;
        *self.lock.lock().expect("lock guard mutex poisoned") = Some(new_guard);

        info!("workbook switch complete");
        Ok(())
    }

    /// Graceful teardown in reverse startup order, then lock release.
    pub async fn shutdown(&self) {
        info!("runtime shutting down");
        self.health.stop_loop();
        self.sync.stop_scheduler();
        self.changes.stop();
        self.worker.stop().await;
        self.pool.close().await;
        self.postgres.stop().await;
        if let Some(guard) = self.lock.lock().expect("lock guard mutex poisoned").take() {
            guard.release();
        }
        info!("runtime stopped");
    }
}

fn lock_descriptor_for(config: &RuntimeConfig) -> RuntimeLock {
    RuntimeLock {
        runtime_port: config.runtime_port,
        database_port: config.postgres.port,
        worker_port: config.worker.port,
        workbook_id: config.workbook_id.clone(),
        workbook_dir: config.workbook_dir.display().to_string(),
        pid: std::process::id(),
        acquired_at: Utc::now(),
    }
}
