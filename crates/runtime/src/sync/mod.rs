// Sync manager: source registry CRUD, on-demand and scheduled execution,
// bounded parallelism, progress fan-out, cancellation, history.

pub mod executor;
pub mod handler;
pub mod schedule;
pub mod store;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::Utc;
use folio_common::types::{
    DataSource, LogEntry, SyncHistoryEntry, SyncProgress, SyncResult, SyncStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::error::RuntimeError;
use crate::postgres::pool::DbPool;
use crate::secrets::SecretStore;
use crate::sync::handler::{HandlerRegistry, LogSink};
use crate::sync::store::SourceStore;

const PROGRESS_CAPACITY: usize = 256;
const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Request body for creating a source.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSource {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    pub schedule: Option<String>,
    #[serde(default, alias = "secretNames")]
    pub secret_names: Vec<String>,
    #[serde(default)]
    pub config: Value,
}

/// Partial update for an existing source. `schedule` distinguishes "leave
/// alone" (absent) from "clear" (null).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub kind: Option<String>,
    #[serde(default, with = "double_option")]
    pub schedule: Option<Option<String>>,
    #[serde(alias = "secretNames")]
    pub secret_names: Option<Vec<String>>,
    pub config: Option<Value>,
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer).map(Some)
    }
}

/// Per-source outcome of a batch run. Batches always complete and report
/// every source, even when some fail.
#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    #[serde(flatten)]
    pub result: SyncResult,
}

struct SchedulerHandle {
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

pub struct SyncManager {
    store: SourceStore,
    registry: Arc<HandlerRegistry>,
    db: Arc<DbPool>,
    secrets: StdRwLock<Arc<SecretStore>>,
    workbook_dir: StdRwLock<PathBuf>,
    default_concurrency: usize,
    tick: Duration,
    progress_tx: broadcast::Sender<SyncProgress>,
    running: Arc<StdMutex<HashMap<String, CancellationToken>>>,
    scheduler: StdMutex<Option<SchedulerHandle>>,
}

impl SyncManager {
    pub fn new(
        store: SourceStore,
        registry: Arc<HandlerRegistry>,
        db: Arc<DbPool>,
        secrets: SecretStore,
        workbook_dir: PathBuf,
        settings: SyncSettings,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            store,
            registry,
            db,
            secrets: StdRwLock::new(Arc::new(secrets)),
            workbook_dir: StdRwLock::new(workbook_dir),
            default_concurrency: settings.concurrency.max(1),
            tick: Duration::from_secs(settings.scheduler_tick_secs.max(1)),
            progress_tx,
            running: Arc::new(StdMutex::new(HashMap::new())),
            scheduler: StdMutex::new(None),
        }
    }

    /// Provision the persisted tables backing sources and history.
    pub async fn init(&self) -> Result<(), RuntimeError> {
        self.store.init().await
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress_tx.subscribe()
    }

    /// Swap the workbook binding (stop-the-world switch path).
    pub fn rebind_workbook(&self, workbook_dir: PathBuf, secrets: SecretStore) {
        *self.workbook_dir.write().expect("workbook dir lock poisoned") = workbook_dir;
        *self.secrets.write().expect("secrets lock poisoned") = Arc::new(secrets);
    }

    // ── Source CRUD ─────────────────────────────────────────────────

    pub async fn get_sources(&self) -> Result<Vec<DataSource>, RuntimeError> {
        self.store.list().await
    }

    pub async fn get_source(&self, id: &str) -> Result<Option<DataSource>, RuntimeError> {
        self.store.get(id).await
    }

    pub async fn add_source(&self, new: NewSource) -> Result<DataSource, RuntimeError> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(RuntimeError::validation("source name must not be empty"));
        }
        let kind = new.kind.unwrap_or_else(|| "http_json".to_string());
        if !self.registry.contains(&kind) {
            return Err(RuntimeError::Validation(format!(
                "unknown source kind `{kind}` (available: {})",
                self.registry.kinds().join(", ")
            )));
        }
        if let Some(expr) = new.schedule.as_deref() {
            schedule::validate(expr)?;
        }

        let now = Utc::now();
        let source = DataSource {
            id: new.id.unwrap_or_else(|| name.to_string()),
            name: name.to_string(),
            kind,
            schedule: new.schedule,
            secret_names: new.secret_names,
            config: new.config,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&source).await?;
        info!(source_id = %source.id, kind = %source.kind, "source added");
        Ok(source)
    }

    pub async fn update_source(
        &self,
        id: &str,
        update: SourceUpdate,
    ) -> Result<DataSource, RuntimeError> {
        let mut source = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| RuntimeError::not_found(format!("unknown source `{id}`")))?;

        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(RuntimeError::validation("source name must not be empty"));
            }
            source.name = name;
        }
        if let Some(kind) = update.kind {
            if !self.registry.contains(&kind) {
                return Err(RuntimeError::Validation(format!("unknown source kind `{kind}`")));
            }
            source.kind = kind;
        }
        if let Some(schedule) = update.schedule {
            if let Some(expr) = schedule.as_deref() {
                schedule::validate(expr)?;
            }
            source.schedule = schedule;
        }
        if let Some(secret_names) = update.secret_names {
            source.secret_names = secret_names;
        }
        if let Some(config) = update.config {
            source.config = config;
        }
        source.updated_at = Utc::now();

        self.store.update(&source).await?;
        Ok(source)
    }

    pub async fn delete_source(&self, id: &str) -> Result<bool, RuntimeError> {
        // A deleted source's in-flight sync is signalled, not awaited.
        self.cancel_sync(id);
        let deleted = self.store.delete(id).await?;
        if deleted {
            info!(source_id = %id, "source deleted");
        }
        Ok(deleted)
    }

    pub async fn get_sync_history(
        &self,
        id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SyncHistoryEntry>, RuntimeError> {
        self.store.history(id, limit.unwrap_or(DEFAULT_HISTORY_LIMIT)).await
    }

    // ── Execution ───────────────────────────────────────────────────

    pub async fn sync_source(self: &Arc<Self>, id: &str) -> Result<SyncResult, RuntimeError> {
        let source = self
            .get_source(id)
            .await?
            .ok_or_else(|| RuntimeError::not_found(format!("unknown source `{id}`")))?;
        let semaphore = Arc::new(Semaphore::new(1));
        Ok(Arc::clone(self).run_one(source, semaphore).await)
    }

    /// Run `ids` with at most `concurrency` in flight; excess waits FIFO.
    /// Always completes with one outcome per requested source.
    pub async fn sync_sources(
        self: &Arc<Self>,
        ids: Vec<String>,
        concurrency: Option<usize>,
    ) -> Vec<SourceOutcome> {
        let bound = concurrency.unwrap_or(self.default_concurrency).max(1);
        let semaphore = Arc::new(Semaphore::new(bound));

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            let manager = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                match manager.store.get(&id).await {
                    Ok(Some(source)) => {
                        let result = manager.run_one(source, semaphore).await;
                        SourceOutcome { source_id: id, result }
                    }
                    Ok(None) => SourceOutcome {
                        source_id: id.clone(),
                        result: failed_result(format!("unknown source `{id}`")),
                    },
                    Err(error) => SourceOutcome {
                        source_id: id,
                        result: failed_result(error.to_string()),
                    },
                }
            }));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => warn!(%error, "sync task aborted"),
            }
        }
        outcomes
    }

    pub async fn sync_all(self: &Arc<Self>, concurrency: Option<usize>) -> Vec<SourceOutcome> {
        let ids = match self.store.list().await {
            Ok(sources) => sources.into_iter().map(|s| s.id).collect(),
            Err(error) => {
                warn!(%error, "sync_all could not list sources");
                Vec::new()
            }
        };
        self.sync_sources(ids, concurrency).await
    }

    /// Signal cancellation to an in-flight sync. Returns whether a signal
    /// was actually delivered (cooperative: the handler must observe it).
    pub fn cancel_sync(&self, id: &str) -> bool {
        let running = self.running.lock().expect("running set lock poisoned");
        match running.get(id) {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                info!(source_id = %id, "cancellation signalled");
                true
            }
            _ => false,
        }
    }

    pub fn running_sources(&self) -> Vec<String> {
        let running = self.running.lock().expect("running set lock poisoned");
        running.keys().cloned().collect()
    }

    async fn run_one(self: Arc<Self>, source: DataSource, semaphore: Arc<Semaphore>) -> SyncResult {
        let source_id = source.id.clone();
        let cancel = CancellationToken::new();

        // At most one in-flight execution per source.
        {
            let mut running = self.running.lock().expect("running set lock poisoned");
            if running.contains_key(&source_id) {
                return failed_result(format!("sync already in progress for `{source_id}`"));
            }
            running.insert(source_id.clone(), cancel.clone());
        }

        self.emit(&source_id, SyncStatus::Pending, None);

        let permit = semaphore.acquire_owned().await;
        if permit.is_err() {
            self.running.lock().expect("running set lock poisoned").remove(&source_id);
            return failed_result("sync queue closed".to_string());
        }

        self.emit(&source_id, SyncStatus::Running, None);
        let started_at = Utc::now();

        let result = match self.registry.get(&source.kind) {
            Some(handler) => {
                let secrets =
                    Arc::clone(&self.secrets.read().expect("secrets lock poisoned"));
                let workbook_dir =
                    self.workbook_dir.read().expect("workbook dir lock poisoned").clone();
                let sink = self.log_sink(&source_id);
                executor::execute_sync(
                    &source,
                    handler,
                    Arc::clone(&self.db),
                    &secrets,
                    workbook_dir,
                    cancel.clone(),
                    Some(sink),
                )
                .await
            }
            None => failed_result(format!("no handler registered for kind `{}`", source.kind)),
        };

        if let Err(error) = self.store.append_history(&source_id, started_at, &result).await {
            warn!(%error, source_id = %source_id, "failed to append sync history");
        }

        let status = if result.success {
            SyncStatus::Success
        } else if cancel.is_cancelled() {
            SyncStatus::Cancelled
        } else {
            SyncStatus::Failed
        };
        self.emit(&source_id, status, result.error.clone());

        self.running.lock().expect("running set lock poisoned").remove(&source_id);
        result
    }

    /// Stream live handler log lines to progress subscribers.
    fn log_sink(&self, source_id: &str) -> LogSink {
        let progress_tx = self.progress_tx.clone();
        let source_id = source_id.to_string();
        Arc::new(move |entry: &LogEntry| {
            let _ = progress_tx.send(SyncProgress {
                source_id: source_id.clone(),
                status: SyncStatus::Running,
                message: Some(entry.message.clone()),
                timestamp: entry.timestamp,
            });
        })
    }

    fn emit(&self, source_id: &str, status: SyncStatus, message: Option<String>) {
        let _ = self.progress_tx.send(SyncProgress {
            source_id: source_id.to_string(),
            status,
            message,
            timestamp: Utc::now(),
        });
    }

    // ── Scheduler ───────────────────────────────────────────────────

    /// Start the shared scheduler task (one for all sources). Idempotent.
    pub fn start_scheduler(self: &Arc<Self>) {
        let mut scheduler = self.scheduler.lock().expect("scheduler lock poisoned");
        if scheduler.as_ref().is_some_and(|handle| !handle.task.is_finished()) {
            return;
        }

        let shutdown = CancellationToken::new();
        let manager = Arc::clone(self);
        let tick = self.tick;
        let stop = shutdown.clone();
        let task = tokio::spawn(async move {
            let mut window_start = Utc::now();
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The interval fires immediately; consume that first tick so the
            // first real window spans one full tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let now = Utc::now();
                let due = manager.due_sources(window_start, now).await;
                window_start = now;
                if due.is_empty() {
                    continue;
                }

                debug!(count = due.len(), "enqueueing scheduled syncs");
                let runner = Arc::clone(&manager);
                tokio::spawn(async move {
                    runner.sync_sources(due, None).await;
                });
            }
        });

        *scheduler = Some(SchedulerHandle { task, shutdown });
        info!(tick_secs = self.tick.as_secs(), "sync scheduler started");
    }

    pub fn stop_scheduler(&self) {
        if let Some(handle) = self.scheduler.lock().expect("scheduler lock poisoned").take() {
            handle.shutdown.cancel();
            handle.task.abort();
            info!("sync scheduler stopped");
        }
    }

    pub fn scheduler_running(&self) -> bool {
        self.scheduler
            .lock()
            .expect("scheduler lock poisoned")
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }

    async fn due_sources(
        &self,
        window_start: chrono::DateTime<Utc>,
        now: chrono::DateTime<Utc>,
    ) -> Vec<String> {
        match self.store.list().await {
            Ok(sources) => sources
                .into_iter()
                .filter(|source| {
                    source
                        .schedule
                        .as_deref()
                        .is_some_and(|expr| schedule::is_due(expr, window_start, now))
                })
                .map(|source| source.id)
                .collect(),
            Err(error) => {
                warn!(%error, "scheduler could not list sources");
                Vec::new()
            }
        }
    }
}

fn failed_result(message: String) -> SyncResult {
    SyncResult { success: false, result: None, error: Some(message), duration_ms: 0, logs: Vec::new() }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::postgres::pool::PoolConfig;
    use crate::sync::handler::{SyncContext, SyncHandler};

    struct SleepyHandler {
        delay: Duration,
    }

    #[async_trait]
    impl SyncHandler for SleepyHandler {
        async fn sync(&self, _ctx: &SyncContext) -> Result<Value> {
            tokio::time::sleep(self.delay).await;
            Ok(json!({ "ok": true }))
        }
    }

    struct WaitForCancelHandler;

    #[async_trait]
    impl SyncHandler for WaitForCancelHandler {
        async fn sync(&self, ctx: &SyncContext) -> Result<Value> {
            tokio::select! {
                _ = ctx.cancelled() => anyhow::bail!("cancelled by request"),
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(json!({ "ok": true })),
            }
        }
    }

    fn manager_with(
        tmp: &TempDir,
        kind: &str,
        handler: Arc<dyn SyncHandler>,
        settings: SyncSettings,
    ) -> Arc<SyncManager> {
        let mut registry = HandlerRegistry::new();
        registry.register(kind, handler);
        Arc::new(SyncManager::new(
            SourceStore::memory(),
            Arc::new(registry),
            Arc::new(DbPool::new(PoolConfig::default())),
            SecretStore::default(),
            tmp.path().to_path_buf(),
            settings,
        ))
    }

    fn new_source(name: &str, kind: &str) -> NewSource {
        NewSource {
            id: None,
            name: name.into(),
            kind: Some(kind.into()),
            schedule: None,
            secret_names: vec![],
            config: Value::Null,
        }
    }

    #[tokio::test]
    async fn add_source_validates_kind_and_schedule() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            "test",
            Arc::new(SleepyHandler { delay: Duration::from_millis(1) }),
            SyncSettings::default(),
        );

        let mut bad_kind = new_source("x", "nope");
        bad_kind.kind = Some("nope".into());
        assert!(matches!(
            manager.add_source(bad_kind).await,
            Err(RuntimeError::Validation(_))
        ));

        let mut bad_schedule = new_source("y", "test");
        bad_schedule.schedule = Some("not cron".into());
        assert!(matches!(
            manager.add_source(bad_schedule).await,
            Err(RuntimeError::Validation(_))
        ));

        let mut ok = new_source("hackernews", "test");
        ok.schedule = Some("0 * * * *".into());
        let source = manager.add_source(ok).await.unwrap();
        assert_eq!(source.id, "hackernews");
        assert_eq!(source.schedule.as_deref(), Some("0 * * * *"));
    }

    #[tokio::test]
    async fn sync_source_runs_and_appends_history() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            "test",
            Arc::new(SleepyHandler { delay: Duration::from_millis(5) }),
            SyncSettings::default(),
        );
        manager.add_source(new_source("hackernews", "test")).await.unwrap();

        let result = manager.sync_source("hackernews").await.unwrap();
        assert!(result.success);

        let history = manager.get_sync_history("hackernews", None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].result.success);
    }

    #[tokio::test]
    async fn sync_unknown_source_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            "test",
            Arc::new(SleepyHandler { delay: Duration::from_millis(1) }),
            SyncSettings::default(),
        );
        assert!(matches!(
            manager.sync_source("ghost").await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn progress_transitions_are_ordered_per_source() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            "test",
            Arc::new(SleepyHandler { delay: Duration::from_millis(5) }),
            SyncSettings::default(),
        );
        manager.add_source(new_source("s1", "test")).await.unwrap();

        let mut progress = manager.subscribe_progress();
        manager.sync_source("s1").await.unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = progress.try_recv() {
            if event.message.is_none() || event.status.is_terminal() {
                phases.push(event.status);
            }
        }
        assert_eq!(
            phases,
            vec![SyncStatus::Pending, SyncStatus::Running, SyncStatus::Success]
        );
    }

    #[tokio::test]
    async fn batch_concurrency_never_exceeds_bound() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            "test",
            Arc::new(SleepyHandler { delay: Duration::from_millis(50) }),
            SyncSettings::default(),
        );
        let ids: Vec<String> = (0..6).map(|n| format!("src-{n}")).collect();
        for id in &ids {
            manager.add_source(new_source(id, "test")).await.unwrap();
        }

        let mut progress = manager.subscribe_progress();
        let outcomes = manager.sync_sources(ids.clone(), Some(2)).await;
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.result.success));

        // Replay the progress stream and track the running set.
        let mut running: HashSet<String> = HashSet::new();
        let mut max_running = 0usize;
        while let Ok(event) = progress.try_recv() {
            match event.status {
                SyncStatus::Running if event.message.is_none() => {
                    running.insert(event.source_id);
                    max_running = max_running.max(running.len());
                }
                status if status.is_terminal() => {
                    running.remove(&event.source_id);
                }
                _ => {}
            }
        }
        assert!(running.is_empty());
        assert!(
            max_running <= 2,
            "expected at most 2 concurrent syncs, saw {max_running}"
        );
    }

    #[tokio::test]
    async fn batch_reports_unknown_sources_without_failing_siblings() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            "test",
            Arc::new(SleepyHandler { delay: Duration::from_millis(1) }),
            SyncSettings::default(),
        );
        manager.add_source(new_source("real", "test")).await.unwrap();

        let outcomes = manager
            .sync_sources(vec!["real".into(), "ghost".into()], None)
            .await;
        assert_eq!(outcomes.len(), 2);
        let by_id: HashMap<_, _> =
            outcomes.iter().map(|o| (o.source_id.as_str(), &o.result)).collect();
        assert!(by_id["real"].success);
        assert!(!by_id["ghost"].success);
        assert!(by_id["ghost"].error.as_deref().unwrap().contains("unknown source"));
    }

    #[tokio::test]
    async fn cancel_sync_signals_in_flight_execution() {
        let tmp = TempDir::new().unwrap();
        let manager =
            manager_with(&tmp, "test", Arc::new(WaitForCancelHandler), SyncSettings::default());
        manager.add_source(new_source("slow", "test")).await.unwrap();

        let mut progress = manager.subscribe_progress();
        let runner = Arc::clone(&manager);
        let task = tokio::spawn(async move { runner.sync_source("slow").await });

        // Wait until the source reports running.
        loop {
            let event = progress.recv().await.unwrap();
            if event.status == SyncStatus::Running {
                break;
            }
        }

        assert!(manager.cancel_sync("slow"));
        let result = task.await.unwrap().unwrap();
        assert!(!result.success);

        // Terminal status is cancelled, not failed.
        let mut terminal = None;
        while let Ok(event) = progress.try_recv() {
            if event.status.is_terminal() {
                terminal = Some(event.status);
            }
        }
        assert_eq!(terminal, Some(SyncStatus::Cancelled));
    }

    #[tokio::test]
    async fn cancel_sync_returns_false_when_idle() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            "test",
            Arc::new(SleepyHandler { delay: Duration::from_millis(1) }),
            SyncSettings::default(),
        );
        manager.add_source(new_source("idle", "test")).await.unwrap();
        assert!(!manager.cancel_sync("idle"));
        assert!(!manager.cancel_sync("ghost"));
    }

    #[tokio::test]
    async fn scheduler_start_stop_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            "test",
            Arc::new(SleepyHandler { delay: Duration::from_millis(1) }),
            SyncSettings::default(),
        );

        assert!(!manager.scheduler_running());
        manager.start_scheduler();
        manager.start_scheduler();
        assert!(manager.scheduler_running());
        manager.stop_scheduler();
        assert!(!manager.scheduler_running());
        manager.stop_scheduler();
    }

    #[tokio::test]
    async fn update_source_can_clear_schedule() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            "test",
            Arc::new(SleepyHandler { delay: Duration::from_millis(1) }),
            SyncSettings::default(),
        );
        let mut source = new_source("s", "test");
        source.schedule = Some("0 * * * *".into());
        manager.add_source(source).await.unwrap();

        let update = SourceUpdate { schedule: Some(None), ..SourceUpdate::default() };
        let updated = manager.update_source("s", update).await.unwrap();
        assert_eq!(updated.schedule, None);
    }
}
