//! Cross-process coordination between the backtest (producer) process and the
//! query server.
//!
//! The two processes share one database file sequentially, never writing
//! concurrently. Two named primitives coordinate them, both plain files living
//! next to the database so the names are visible to every process that can see
//! the database:
//!
//! - the instance lock (`replaylens-query-server.lock`), a lock file with the
//!   holder's pid and a refreshed heartbeat, so a crashed holder is detected
//!   as abandoned instead of deadlocking the next server;
//! - the shutdown signal (`replaylens-query-server.shutdown`), a flag file the
//!   client drops and the server polls.

pub mod cleanup;
pub mod db_path;
pub mod instance_lock;
pub mod shutdown;

pub use cleanup::{cleanup_database, CleanupResult};
pub use db_path::resolve_database_path;
pub use instance_lock::InstanceLock;
pub use shutdown::{ShutdownClient, ShutdownReason, ShutdownSignal};

/// Well-known file names. Both processes must use these exact strings for
/// cross-process visibility.
pub const LOCK_FILE_NAME: &str = "replaylens-query-server.lock";
pub const SHUTDOWN_FLAG_NAME: &str = "replaylens-query-server.shutdown";
