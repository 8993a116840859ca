// Core domain types shared between the runtime daemon and UI clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// On-disk descriptor of the single live runtime instance for a workbook.
///
/// Persisted as JSON at `<state_dir>/locks/<workbook_id>.lock.json`. At most
/// one live lock may exist per workbook; liveness is determined by whether
/// `pid` still names a running process. The camelCase keys are the lockfile
/// wire contract consumed by the desktop shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeLock {
    pub runtime_port: u16,
    pub database_port: u16,
    pub worker_port: u16,
    pub workbook_id: String,
    pub workbook_dir: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Lifecycle state of a managed child process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Starting,
    Running,
    Degraded,
    Failed,
    Stopped,
}

/// Point-in-time status of a managed process (postgres or worker).
///
/// Mutated only by the owning manager; read by the health monitor and the
/// HTTP facade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub up: bool,
    pub port: u16,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub error: Option<String>,
}

impl ServiceStatus {
    pub fn stopped(port: u16) -> Self {
        Self {
            state: ServiceState::Stopped,
            up: false,
            port,
            pid: None,
            restart_count: 0,
            error: None,
        }
    }
}

/// A named, schedulable data connector that syncs external data into the
/// embedded database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataSource {
    pub id: String,
    pub name: String,
    /// Handler type key (e.g. `http_json`).
    pub kind: String,
    /// Cron expression; `None` means manual-only.
    pub schedule: Option<String>,
    /// Names of secrets that must be resolvable before a sync may run.
    #[serde(default)]
    pub secret_names: Vec<String>,
    /// Handler-specific configuration.
    #[serde(default)]
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Log severity captured during a sync execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Error,
}

/// One log line emitted during a single sync execution. Never mutated
/// after capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Outcome of one sync execution. Immutable once produced; appended to the
/// per-source sync history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

/// Progress phase of an in-flight or finished sync.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl SyncStatus {
    /// Terminal states end the per-source progress sequence.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

/// Ephemeral progress event broadcast to subscribers. Transitions for a
/// given source are strictly ordered: `pending` precedes `running`, which
/// precedes a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncProgress {
    pub source_id: String,
    pub status: SyncStatus,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A persisted sync-history row: one `SyncResult` keyed by source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncHistoryEntry {
    pub id: i64,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub result: SyncResult,
}

/// Row-level operation reported by the change listener.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeOp {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

/// A normalized database change notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseChange {
    pub table: String,
    pub op: ChangeOp,
    pub row_id: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Diagnostics for one managed service inside an eval snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEval {
    #[serde(flatten)]
    pub status: ServiceStatus,
    /// Whether the service answered a liveness probe during this eval.
    pub reachable: bool,
    pub detail: Option<String>,
}

/// Point-in-time diagnostic snapshot. Recomputed on demand or periodically,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvalResult {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub healthy: bool,
    pub postgres: ServiceEval,
    pub worker: ServiceEval,
}
