//! Event model, validation, and the producer-side write path.

pub mod model;
pub mod validator;
pub mod writer;

pub use model::{
    BacktestEvent, Category, EventType, Run, RunSummary, Severity, ValidationError,
    ValidationSeverity,
};
pub use writer::{BatchedEventWriter, WriterConfig};

use anyhow::Result;
use std::sync::Arc;

use crate::storage::EventStore;

/// What the backtest engine holds for the duration of a run: the run record
/// plus the buffered writer. The engine only ever calls `emit`; everything
/// else about persistence stays behind this facade.
pub struct EventLogSession {
    run: Run,
    store: Arc<EventStore>,
    writer: BatchedEventWriter,
}

impl EventLogSession {
    /// Create the run record and start the background writer.
    pub fn begin(store: Arc<EventStore>, run: Run, config: WriterConfig) -> Result<Self> {
        store.create_run(&run)?;
        let writer = BatchedEventWriter::spawn(store.clone(), config);
        Ok(Self { run, store, writer })
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Emit one event into the log. Fire-and-forget; errors only on a
    /// self-referential parent link (a caller defect).
    pub fn emit(&self, mut event: BacktestEvent) -> Result<()> {
        event.run_id = self.run.id.clone();
        self.writer.write_event(event)
    }

    /// Flush outstanding events without ending the session.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Flush and release the writer. Must be awaited before process exit or
    /// the final partial batch is lost.
    pub async fn finish(self) {
        self.writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_session_emit_and_finish() {
        let store = Arc::new(EventStore::open_memory().unwrap());
        let run = Run::new(
            "session-run",
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(),
            "hash",
        );
        let session =
            EventLogSession::begin(store.clone(), run, WriterConfig::default()).unwrap();

        for i in 0..3 {
            // run_id on the event is overwritten by the session.
            let event = BacktestEvent::new(
                "wrong-run",
                Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, i).unwrap(),
                EventType::StateChange,
                Severity::Info,
                Category::Analysis,
                json!({"state": i}),
            );
            session.emit(event).unwrap();
        }
        session.finish().await;

        assert_eq!(store.count_run_events("session-run").unwrap(), 3);
        assert_eq!(store.count_run_events("wrong-run").unwrap(), 0);
    }
}
