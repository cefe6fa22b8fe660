//! Database file cleanup between backtests.
//!
//! Removes the database plus its WAL and shared-memory side files. Busy files
//! get bounded retries with backoff; exhaustion degrades to a structured
//! failure result instead of an error, so a stuck cleanup never aborts the
//! backtest that asked for it.

use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupResult {
    pub success: bool,
    pub files_deleted: u32,
    pub error: Option<String>,
}

/// Delete `{db, db-wal, db-shm}`. Absent files are fine and not counted.
pub async fn cleanup_database(db_path: &Path) -> CleanupResult {
    let db = db_path.to_path_buf();
    let wal = side_file(db_path, "-wal");
    let shm = side_file(db_path, "-shm");

    let mut files_deleted = 0u32;
    let mut errors: Vec<String> = Vec::new();

    for path in [&db, &wal, &shm] {
        match delete_with_retry(path).await {
            Ok(true) => files_deleted += 1,
            Ok(false) => {}
            Err(msg) => errors.push(msg),
        }
    }

    if errors.is_empty() {
        debug!(files_deleted, path = %db_path.display(), "Database cleanup complete");
        CleanupResult {
            success: true,
            files_deleted,
            error: None,
        }
    } else {
        let error = errors.join("; ");
        warn!(files_deleted, error = %error, "Database cleanup incomplete");
        CleanupResult {
            success: false,
            files_deleted,
            error: Some(error),
        }
    }
}

fn side_file(db_path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    std::path::PathBuf::from(name)
}

/// Ok(true) = deleted, Ok(false) = did not exist, Err = still there after
/// retries.
async fn delete_with_retry(path: &Path) -> Result<bool, String> {
    for attempt in 1..=MAX_ATTEMPTS {
        match std::fs::remove_file(path) {
            Ok(()) => return Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) if attempt < MAX_ATTEMPTS => {
                // Locked or busy file: back off and retry.
                debug!(
                    attempt,
                    path = %path.display(),
                    error = %e,
                    "Delete failed, retrying"
                );
                tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
            }
            Err(e) => {
                return Err(format!(
                    "{}: {} after {} attempts",
                    path.display(),
                    e,
                    MAX_ATTEMPTS
                ))
            }
        }
    }
    unreachable!("retry loop always returns")
}
