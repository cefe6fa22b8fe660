//! Single-instance lock for the query server.
//!
//! Lock-file scheme standing in for a named OS mutex: an exclusive create of
//! the well-known lock file wins the lock; the body records the holder's pid
//! and a heartbeat timestamp a background task refreshes every second. A lock
//! file whose heartbeat has gone stale belongs to a dead holder and is treated
//! as available, not as a permanent deadlock.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::LOCK_FILE_NAME;

/// Heartbeat refresh cadence for the holder.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// A lock whose heartbeat is older than this is abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
struct LockBody {
    pid: u32,
    heartbeat_unix_ms: i64,
}

impl LockBody {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            heartbeat_unix_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn is_stale(&self) -> bool {
        let age_ms = chrono::Utc::now().timestamp_millis() - self.heartbeat_unix_ms;
        age_ms > STALE_AFTER.as_millis() as i64
    }
}

/// Held instance lock. Released on drop (or process death, via staleness).
pub struct InstanceLock {
    path: PathBuf,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl InstanceLock {
    /// Non-blocking attempt to become the sole query-server instance.
    /// `Ok(None)` means another live instance holds the lock.
    pub fn try_acquire(dir: &Path) -> Result<Option<Self>> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create lock directory {}", dir.display()))?;
        let path = dir.join(LOCK_FILE_NAME);

        match Self::create_exclusive(&path)? {
            true => Ok(Some(Self::held(path))),
            false => {
                // Lock file exists. Abandoned (stale heartbeat or unreadable)
                // means the holder died without releasing; reclaim it.
                let abandoned = match read_lock_body(&path) {
                    Some(body) => body.is_stale(),
                    None => true,
                };
                if !abandoned {
                    return Ok(None);
                }
                warn!(path = %path.display(), "Reclaiming abandoned instance lock");
                let _ = std::fs::remove_file(&path);
                match Self::create_exclusive(&path)? {
                    true => Ok(Some(Self::held(path))),
                    // Lost the race to another reclaimer.
                    false => Ok(None),
                }
            }
        }
    }

    /// Probe without acquiring.
    pub fn is_another_instance_running(dir: &Path) -> bool {
        let path = dir.join(LOCK_FILE_NAME);
        match read_lock_body(&path) {
            Some(body) => !body.is_stale(),
            None => false,
        }
    }

    fn create_exclusive(path: &Path) -> Result<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let body = serde_json::to_string(&LockBody::current())?;
                file.write_all(body.as_bytes())
                    .with_context(|| format!("Failed to write lock file {}", path.display()))?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to create lock file {}", path.display()))
            }
        }
    }

    fn held(path: PathBuf) -> Self {
        let heartbeat_path = path.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let body = match serde_json::to_string(&LockBody::current()) {
                    Ok(b) => b,
                    Err(_) => continue,
                };
                if let Err(e) = std::fs::write(&heartbeat_path, body) {
                    warn!(error = %e, "Failed to refresh instance lock heartbeat");
                }
            }
        });

        debug!(path = %path.display(), "Instance lock acquired");
        Self {
            path,
            heartbeat_task: Some(heartbeat_task),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "Failed to remove instance lock file");
            }
        }
    }
}

fn read_lock_body(path: &Path) -> Option<LockBody> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_acquire_contend_release() {
        let dir = TempDir::new().unwrap();

        // Process A acquires.
        let lock_a = InstanceLock::try_acquire(dir.path()).unwrap();
        assert!(lock_a.is_some());
        assert!(InstanceLock::is_another_instance_running(dir.path()));

        // Process B fails while A holds.
        let lock_b = InstanceLock::try_acquire(dir.path()).unwrap();
        assert!(lock_b.is_none());

        // After A releases, B succeeds.
        drop(lock_a);
        assert!(!InstanceLock::is_another_instance_running(dir.path()));
        let lock_b = InstanceLock::try_acquire(dir.path()).unwrap();
        assert!(lock_b.is_some());
    }

    #[tokio::test]
    async fn test_abandoned_lock_reclaimable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);

        // A holder that died: stale heartbeat, never released.
        let stale = LockBody {
            pid: 999_999,
            heartbeat_unix_ms: chrono::Utc::now().timestamp_millis()
                - 2 * STALE_AFTER.as_millis() as i64,
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        assert!(!InstanceLock::is_another_instance_running(dir.path()));
        let lock = InstanceLock::try_acquire(dir.path()).unwrap();
        assert!(lock.is_some());
    }

    #[tokio::test]
    async fn test_garbage_lock_file_treated_as_abandoned() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(LOCK_FILE_NAME), "not json").unwrap();

        let lock = InstanceLock::try_acquire(dir.path()).unwrap();
        assert!(lock.is_some());
    }

    #[tokio::test]
    async fn test_no_lock_file_means_no_instance() {
        let dir = TempDir::new().unwrap();
        assert!(!InstanceLock::is_another_instance_running(dir.path()));
    }
}
