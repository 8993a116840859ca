// Runtime configuration.
//
// File config: `<workbook>/.folio/runtime.toml`
// Env overrides: `FOLIO_RUNTIME_PORT`, `FOLIO_POSTGRES_PORT`,
// `FOLIO_WORKER_PORT`, `FOLIO_POSTGRES_BIN_DIR`, `FOLIO_WORKER_COMMAND`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default port bands: runtimes at 55001+, postgres at 55101+, workers at
/// 55201+.
const DEFAULT_RUNTIME_PORT: u16 = 55001;
const DEFAULT_POSTGRES_PORT: u16 = 55101;
const DEFAULT_WORKER_PORT: u16 = 55201;

const DEFAULT_SCHEDULER_TICK_SECS: u64 = 30;
const DEFAULT_SYNC_CONCURRENCY: usize = 3;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 15;

/// Root directory for folio global state: `~/.folio/`.
pub fn state_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".folio"))
}

/// Per-workbook config directory: `<workbook>/.folio/`.
pub fn workbook_config_dir(workbook_dir: &Path) -> PathBuf {
    workbook_dir.join(".folio")
}

/// Path to the workbook runtime config: `<workbook>/.folio/runtime.toml`.
pub fn runtime_config_path(workbook_dir: &Path) -> PathBuf {
    workbook_config_dir(workbook_dir).join("runtime.toml")
}

/// Path to the workbook secrets file: `<workbook>/.folio/secrets.toml`.
pub fn secrets_path(workbook_dir: &Path) -> PathBuf {
    workbook_config_dir(workbook_dir).join("secrets.toml")
}

/// Embedded postgres settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostgresConfig {
    pub port: u16,
    /// Directory holding `initdb`/`postgres`/`createdb`; `None` uses $PATH.
    pub bin_dir: Option<PathBuf>,
    pub database: String,
    pub superuser: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_POSTGRES_PORT,
            bin_dir: None,
            database: "workbook".into(),
            superuser: "postgres".into(),
        }
    }
}

/// Sandboxed dev-server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub port: u16,
    pub command: String,
    pub args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_WORKER_PORT,
            command: "npm".into(),
            args: vec!["run".into(), "dev".into()],
        }
    }
}

/// Sync scheduler settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncSettings {
    pub scheduler_tick_secs: u64,
    pub concurrency: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            scheduler_tick_secs: DEFAULT_SCHEDULER_TICK_SECS,
            concurrency: DEFAULT_SYNC_CONCURRENCY,
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_secs: u64,
    /// Restart attempts per recovery cycle.
    pub restart_attempts: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self { interval_secs: DEFAULT_HEALTH_INTERVAL_SECS, restart_attempts: 1 }
    }
}

/// Full resolved runtime configuration for one workbook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    pub workbook_id: String,
    pub workbook_dir: PathBuf,
    pub runtime_port: u16,
    pub postgres: PostgresConfig,
    pub worker: WorkerConfig,
    pub sync: SyncSettings,
    pub health: HealthSettings,
    /// Global state directory (`~/.folio` unless overridden for tests).
    pub state_dir: PathBuf,
}

/// The file-backed subset of [`RuntimeConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
struct FileConfig {
    runtime_port: Option<u16>,
    postgres: PostgresConfig,
    worker: WorkerConfig,
    sync: SyncSettings,
    health: HealthSettings,
}

impl RuntimeConfig {
    /// Resolve the configuration for a workbook: file config under
    /// `<workbook>/.folio/runtime.toml`, then env overrides, then defaults.
    pub fn resolve(workbook_id: impl Into<String>, workbook_dir: impl Into<PathBuf>) -> Self {
        let workbook_dir = workbook_dir.into();
        let file = load_file_config(&runtime_config_path(&workbook_dir));
        let state_dir = state_dir().unwrap_or_else(|| workbook_dir.join(".folio"));

        let mut config = Self {
            workbook_id: workbook_id.into(),
            workbook_dir,
            runtime_port: file.runtime_port.unwrap_or(DEFAULT_RUNTIME_PORT),
            postgres: file.postgres,
            worker: file.worker,
            sync: file.sync,
            health: file.health,
            state_dir,
        };
        config.apply_env_overrides();
        config
    }

    /// Rebind this configuration to a different workbook, re-reading that
    /// workbook's file config but keeping the allocated ports.
    pub fn for_workbook(&self, workbook_id: impl Into<String>, workbook_dir: impl Into<PathBuf>) -> Self {
        let workbook_dir = workbook_dir.into();
        let file = load_file_config(&runtime_config_path(&workbook_dir));
        Self {
            workbook_id: workbook_id.into(),
            workbook_dir,
            runtime_port: self.runtime_port,
            postgres: PostgresConfig {
                port: self.postgres.port,
                bin_dir: self.postgres.bin_dir.clone(),
                ..file.postgres
            },
            worker: WorkerConfig { port: self.worker.port, ..file.worker },
            sync: file.sync,
            health: file.health,
            state_dir: self.state_dir.clone(),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(port) = env_u16("FOLIO_RUNTIME_PORT") {
            self.runtime_port = port;
        }
        if let Some(port) = env_u16("FOLIO_POSTGRES_PORT") {
            self.postgres.port = port;
        }
        if let Some(port) = env_u16("FOLIO_WORKER_PORT") {
            self.worker.port = port;
        }
        if let Some(dir) = std::env::var_os("FOLIO_POSTGRES_BIN_DIR") {
            self.postgres.bin_dir = Some(PathBuf::from(dir));
        }
        if let Ok(command) = std::env::var("FOLIO_WORKER_COMMAND") {
            if let Some((program, args)) = parse_command_line(&command) {
                self.worker.command = program;
                self.worker.args = args;
            }
        }
    }

    /// Data directory for the embedded postgres of the current workbook.
    pub fn postgres_data_dir(&self) -> PathBuf {
        workbook_config_dir(&self.workbook_dir).join("postgres")
    }

    /// Directory holding lock files for all workbooks.
    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }
}

fn load_file_config(path: &Path) -> FileConfig {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return FileConfig::default(),
    };
    match toml::from_str(&contents) {
        Ok(config) => config,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "ignoring unparsable runtime.toml");
            FileConfig::default()
        }
    }
}

fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|value| value.parse::<u16>().ok())
}

/// Split a whitespace-separated command line into program + args.
fn parse_command_line(raw: &str) -> Option<(String, Vec<String>)> {
    let mut parts = raw.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}
