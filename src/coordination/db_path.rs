//! Database path resolution.
//!
//! Explicit configuration-resolution function instead of ambient global state:
//! explicit override, then the environment variable, then a fixed default
//! under the user's local data directory.

use std::path::{Path, PathBuf};

/// Environment variable consulted when no explicit path is given.
pub const DB_PATH_ENV_VAR: &str = "REPLAYLENS_DB";

const DEFAULT_FILE_NAME: &str = "replaylens.db";

/// Resolve the database path from `(explicit override, environment lookup,
/// home directory)`, in that precedence order. Pure: the environment is
/// injected, so tests never touch process globals.
pub fn resolve_database_path(
    explicit: Option<&Path>,
    env_lookup: impl Fn(&str) -> Option<String>,
    home_dir: Option<&Path>,
) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(from_env) = env_lookup(DB_PATH_ENV_VAR) {
        if !from_env.trim().is_empty() {
            return PathBuf::from(from_env);
        }
    }
    match home_dir {
        Some(home) => home
            .join(".local")
            .join("share")
            .join("replaylens")
            .join(DEFAULT_FILE_NAME),
        None => PathBuf::from(DEFAULT_FILE_NAME),
    }
}

/// Process-level convenience wrapper over the real environment.
pub fn default_database_path(explicit: Option<&Path>) -> PathBuf {
    let home = std::env::var("HOME").ok().map(PathBuf::from);
    resolve_database_path(explicit, |key| std::env::var(key).ok(), home.as_deref())
}
