//! Cross-process shutdown signal.
//!
//! Flag-file scheme standing in for a named OS event: a `--shutdown`
//! invocation drops the well-known flag file, and the server polls for it at
//! 100 ms, so the wake lands well inside the one-second contract. The server's
//! wait races the poll against its own cancellation token, so internal
//! cancellation and an external signal both terminate the host promptly.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{instance_lock::InstanceLock, SHUTDOWN_FLAG_NAME};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why `wait_for_shutdown` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Another process requested shutdown via the flag file.
    Signaled,
    /// The server's own cancellation token fired.
    Cancelled,
}

/// Server-side owner of the shutdown signal.
pub struct ShutdownSignal {
    flag_path: PathBuf,
}

impl ShutdownSignal {
    /// Create and own the signal. Any stale flag left over from a previous
    /// server is cleared so it cannot trigger an immediate shutdown.
    pub fn create_for_server(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create signal directory {}", dir.display()))?;
        let flag_path = dir.join(SHUTDOWN_FLAG_NAME);
        match std::fs::remove_file(&flag_path) {
            Ok(()) => debug!("Cleared stale shutdown flag"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to clear stale shutdown flag {}", flag_path.display())
                })
            }
        }
        Ok(Self { flag_path })
    }

    /// Block until the flag appears or the cancellation token fires.
    /// Unblocks within one poll interval of either.
    pub async fn wait_for_shutdown(&self, cancel: &mut watch::Receiver<bool>) -> ShutdownReason {
        loop {
            if self.flag_path.exists() {
                let _ = std::fs::remove_file(&self.flag_path);
                info!("Shutdown signal received");
                return ShutdownReason::Signaled;
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                changed = cancel.changed() => {
                    // A closed sender counts as cancellation too.
                    if changed.is_err() || *cancel.borrow() {
                        return ShutdownReason::Cancelled;
                    }
                }
            }
        }
    }
}

impl Drop for ShutdownSignal {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.flag_path);
    }
}

/// Client-side handle for requesting shutdown of a running server.
pub struct ShutdownClient {
    flag_path: PathBuf,
}

impl ShutdownClient {
    /// Look up the signal for a live server. `None` when no server instance
    /// is running, mirroring "open existing named event" semantics.
    pub fn open_existing(dir: &Path) -> Option<Self> {
        if !InstanceLock::is_another_instance_running(dir) {
            return None;
        }
        Some(Self {
            flag_path: dir.join(SHUTDOWN_FLAG_NAME),
        })
    }

    /// Request shutdown.
    pub fn signal(&self) -> Result<()> {
        std::fs::write(&self.flag_path, b"shutdown")
            .with_context(|| format!("Failed to write shutdown flag {}", self.flag_path.display()))
    }
}
