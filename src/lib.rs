//! replaylens — durable, queryable event log for backtest runs.
//!
//! A backtest process emits structured events through a validating, batched
//! writer into a SQLite file; a separate query-server process opens the same
//! file later and answers retrospective "why did the strategy do X" queries
//! over a stdio tool protocol. The two processes coordinate through an
//! instance lock and a shutdown signal so at most one writer and one server
//! ever touch the file.

pub mod coordination;
pub mod events;
pub mod query;
pub mod server;
pub mod storage;

pub use events::{BacktestEvent, Category, EventLogSession, EventType, Run, Severity};
pub use query::QueryEngine;
pub use storage::EventStore;
