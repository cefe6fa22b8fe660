//! Buffered background writer for the event log.
//!
//! The simulation loop calls `write_event` synchronously and must never block
//! on I/O: the event goes into an mpsc channel and a single background task
//! owns all storage writes. Batches are flushed when the buffer reaches
//! `batch_size` or the flush interval elapses, whichever comes first.
//!
//! Event logging is best-effort relative to the backtest itself: a batch that
//! still fails after retries is dropped and logged, never propagated back into
//! the simulation.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::model::BacktestEvent;
use super::validator;
use crate::storage::EventStore;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush when the buffer reaches this size.
    pub batch_size: usize,
    /// Flush when this much time has passed since the last flush.
    pub flush_interval: Duration,
    /// Channel capacity between producer and the writer task.
    pub channel_capacity: usize,
    /// Attempts per batch before dropping it.
    pub max_write_attempts: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_millis(500),
            channel_capacity: 16_384,
            max_write_attempts: 3,
        }
    }
}

enum WriterMessage {
    Event(Box<BacktestEvent>),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Handle to the background writer task.
pub struct BatchedEventWriter {
    tx: mpsc::Sender<WriterMessage>,
    task: Option<JoinHandle<()>>,
}

impl BatchedEventWriter {
    pub fn spawn(store: Arc<EventStore>, config: WriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let task = tokio::spawn(run_writer(store, rx, config));
        Self {
            tx,
            task: Some(task),
        }
    }

    /// Enqueue an event. Non-blocking; completes eventually once the
    /// background task drains the batch.
    ///
    /// Soft validation findings are attached to the event before it is
    /// enqueued. A self-referential parent link is a hard failure: it means
    /// the emitting code is broken, and the event is refused outright.
    pub fn write_event(&self, mut event: BacktestEvent) -> Result<()> {
        validator::ensure_not_self_referential(&event)?;

        let errors = validator::validate(&event);
        if !errors.is_empty() {
            debug!(
                event_id = %event.event_id,
                findings = errors.len(),
                "Event failed soft validation, persisting with findings"
            );
            event.validation_errors = Some(errors);
        }

        // Fire-and-forget: a full channel drops the event rather than stalling
        // the simulation loop.
        if let Err(e) = self.tx.try_send(WriterMessage::Event(Box::new(event))) {
            warn!(error = %e, "Event channel full or closed, dropping event");
        }
        Ok(())
    }

    /// Wait until everything buffered so far is durably persisted.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterMessage::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Final flush, then stop the background task.
    pub async fn close(mut self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterMessage::Close(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn run_writer(
    store: Arc<EventStore>,
    mut rx: mpsc::Receiver<WriterMessage>,
    config: WriterConfig,
) {
    let batch_size = config.batch_size.max(1);
    let mut buffer: Vec<BacktestEvent> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(WriterMessage::Event(event)) => {
                        buffer.push(*event);
                        if buffer.len() >= batch_size {
                            write_batch(&store, &mut buffer, &config).await;
                            ticker.reset();
                        }
                    }
                    Some(WriterMessage::Flush(ack)) => {
                        write_batch(&store, &mut buffer, &config).await;
                        ticker.reset();
                        let _ = ack.send(());
                    }
                    Some(WriterMessage::Close(ack)) => {
                        write_batch(&store, &mut buffer, &config).await;
                        debug!("Event writer shutting down");
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        // Producer handle dropped without close; final flush.
                        write_batch(&store, &mut buffer, &config).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    write_batch(&store, &mut buffer, &config).await;
                }
            }
        }
    }
}

/// Persist and clear the buffer, retrying transient failures with backoff.
/// On exhaustion the batch is dropped: best-effort logging must not wedge the
/// producer.
async fn write_batch(store: &EventStore, buffer: &mut Vec<BacktestEvent>, config: &WriterConfig) {
    if buffer.is_empty() {
        return;
    }

    let attempts = config.max_write_attempts.max(1);
    for attempt in 1..=attempts {
        match store.insert_events(buffer) {
            Ok(_) => {
                buffer.clear();
                return;
            }
            Err(e) if attempt < attempts => {
                warn!(
                    attempt,
                    error = %e,
                    "Event batch write failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
            }
            Err(e) => {
                error!(
                    dropped = buffer.len(),
                    error = %e,
                    "Event batch write failed after retries, dropping batch"
                );
                buffer.clear();
                return;
            }
        }
    }
}
