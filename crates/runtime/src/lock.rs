// Advisory lock manager: one live runtime instance per workbook.
//
// The lock is a JSON descriptor at `<state_dir>/locks/<workbook_id>.lock.json`.
// Liveness is cooperative: a lock whose `pid` no longer names a running
// process is orphaned and may be reclaimed.

use std::fs;
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::process::Command;

use anyhow::{Context, Result};
use chrono::Utc;
use folio_common::types::RuntimeLock;
use tracing::{info, warn};

use crate::error::RuntimeError;

pub struct LockManager {
    locks_dir: PathBuf,
}

impl LockManager {
    pub fn new(locks_dir: impl Into<PathBuf>) -> Self {
        Self { locks_dir: locks_dir.into() }
    }

    pub fn lock_path(&self, workbook_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{workbook_id}.lock.json"))
    }

    /// Acquire the lock for `desc.workbook_id`.
    ///
    /// An existing lock owned by a dead process is treated as orphaned and
    /// overwritten. A lock owned by a live foreign process fails with
    /// [`RuntimeError::LockConflict`].
    pub fn acquire(&self, mut desc: RuntimeLock) -> Result<LockGuard> {
        fs::create_dir_all(&self.locks_dir).with_context(|| {
            format!("failed to create locks directory `{}`", self.locks_dir.display())
        })?;

        let path = self.lock_path(&desc.workbook_id);
        if let Some(existing) = read_lock_file(&path)? {
            if existing.pid != std::process::id() && pid_alive(existing.pid) {
                return Err(RuntimeError::LockConflict {
                    workbook_id: desc.workbook_id,
                    owner_pid: existing.pid,
                }
                .into());
            }
            warn!(
                workbook_id = %desc.workbook_id,
                stale_pid = existing.pid,
                "reclaiming orphaned runtime lock"
            );
        }

        desc.pid = std::process::id();
        desc.acquired_at = Utc::now();
        write_lock_file(&path, &desc)?;
        info!(workbook_id = %desc.workbook_id, path = %path.display(), "acquired runtime lock");

        Ok(LockGuard { path, lock: desc })
    }
}

/// A held runtime lock. Dropping the guard removes the lock file.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    lock: RuntimeLock,
}

impl LockGuard {
    pub fn descriptor(&self) -> &RuntimeLock {
        &self.lock
    }

    /// Rewrite the lock file after a field changed (e.g. a restarted process
    /// came back on a different port).
    pub fn refresh(&mut self, update: impl FnOnce(&mut RuntimeLock)) -> Result<()> {
        update(&mut self.lock);
        write_lock_file(&self.path, &self.lock)
    }

    /// Explicitly release the lock, deleting the file.
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %error, "failed to remove lock file");
            }
        }
    }
}

fn read_lock_file(path: &Path) -> Result<Option<RuntimeLock>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read lock file `{}`", path.display()))
        }
    };

    match serde_json::from_str::<RuntimeLock>(&raw) {
        Ok(lock) => Ok(Some(lock)),
        Err(error) => {
            // A corrupt lock file cannot name a live owner; treat as orphaned.
            warn!(path = %path.display(), %error, "ignoring unparsable lock file");
            Ok(None)
        }
    }
}

/// Write the descriptor atomically: temp file in the same directory, then
/// rename over the target.
fn write_lock_file(path: &Path, lock: &RuntimeLock) -> Result<()> {
    let encoded =
        serde_json::to_vec_pretty(lock).context("failed to serialize lock descriptor")?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, encoded)
        .with_context(|| format!("failed to write lock file `{}`", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to move lock file into place at `{}`", path.display()))?;
    Ok(())
}

/// Check whether `pid` names a running process (`kill -0`).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
