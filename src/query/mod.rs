//! Read-only query tools over the event log.
//!
//! Five operations: type/entity lookups, point-in-time state reconstruction,
//! metric aggregation, and causal sequence traversal. Every tool reports its
//! own `query_time_ms` so the observability layer is itself observable.

pub mod aggregate;
pub mod sequence;
pub mod snapshot;

pub use aggregate::MetricAggregate;
pub use sequence::{EventSequence, SequenceNode};
pub use snapshot::StateSnapshot;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::events::model::{BacktestEvent, EventType, Severity};
use crate::storage::{EventPage, EventQuery, EventStore};

/// Per-call observability metadata attached to every tool response.
#[derive(Debug, Clone, Serialize)]
pub struct ToolMeta {
    pub query_time_ms: u64,
    pub total_events: u64,
}

impl ToolMeta {
    fn new(started: Instant, total_events: u64) -> Self {
        Self {
            query_time_ms: started.elapsed().as_millis() as u64,
            total_events,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventPagePayload {
    pub events: Vec<BacktestEvent>,
    pub total_count: u64,
    pub page_index: u32,
    pub page_size: u32,
    pub meta: ToolMeta,
}

/// The query engine. Holds the store; every operation is read-only.
pub struct QueryEngine {
    store: Arc<EventStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    fn require_run(&self, run_id: &str) -> Result<()> {
        self.store
            .get_run(run_id)?
            .with_context(|| format!("Unknown run: {}", run_id))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // EventsByType
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn events_by_type(
        &self,
        run_id: &str,
        event_type: EventType,
        severity: Option<Severity>,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        page_index: u32,
        page_size: u32,
    ) -> Result<EventPagePayload> {
        let started = Instant::now();
        self.require_run(run_id)?;

        let mut query = EventQuery::for_run(run_id)
            .with_type(event_type)
            .with_page(page_index, page_size);
        query.severity = severity;
        query.start_time = start_time;
        query.end_time = end_time;

        let page = self.store.query_events(&query)?;
        Ok(page_payload(page, started))
    }

    // -------------------------------------------------------------------------
    // EventsByEntity
    // -------------------------------------------------------------------------

    /// Events whose properties reference `{entity_type, entity_id}`.
    ///
    /// Entity references are event-type-specific, so there is no dedicated
    /// index: the run's events are scanned and matched structurally (a field
    /// named like the entity type whose value equals the id), with a raw
    /// substring fallback for payloads that embed the id in nested documents.
    pub fn events_by_entity(
        &self,
        run_id: &str,
        entity_type: &str,
        entity_id: &str,
        page_index: u32,
        page_size: u32,
    ) -> Result<EventPagePayload> {
        let started = Instant::now();
        self.require_run(run_id)?;

        let all = self.store.load_run_events(run_id)?;
        let matched: Vec<BacktestEvent> = all
            .into_iter()
            .filter(|e| references_entity(e, entity_type, entity_id))
            .collect();

        let total_count = matched.len() as u64;
        let page_size = page_size.max(1);
        let offset = page_index as usize * page_size as usize;
        let events: Vec<BacktestEvent> = matched
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .collect();

        Ok(EventPagePayload {
            events,
            total_count,
            page_index,
            page_size,
            meta: ToolMeta::new(started, total_count),
        })
    }

    // -------------------------------------------------------------------------
    // StateSnapshot
    // -------------------------------------------------------------------------

    pub fn state_snapshot(
        &self,
        run_id: &str,
        as_of: DateTime<Utc>,
        include_indicators: bool,
        include_orders: bool,
        security_filter: Option<&str>,
    ) -> Result<(StateSnapshot, ToolMeta)> {
        let started = Instant::now();
        self.require_run(run_id)?;

        let events = self.store.load_run_events(run_id)?;
        let replayed = events.iter().filter(|e| e.timestamp <= as_of).count() as u64;
        let snapshot = snapshot::reconstruct(
            &events,
            as_of,
            include_indicators,
            include_orders,
            security_filter,
        );
        Ok((snapshot, ToolMeta::new(started, replayed)))
    }

    // -------------------------------------------------------------------------
    // AggregateMetrics
    // -------------------------------------------------------------------------

    pub fn aggregate_metrics(
        &self,
        run_id: &str,
        event_type: EventType,
        metric_property: &str,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<(MetricAggregate, ToolMeta)> {
        let started = Instant::now();
        self.require_run(run_id)?;

        let mut acc = aggregate::StreamingStats::new();
        let mut scanned = 0u64;
        let mut page_index = 0u32;
        // Streaming pass in storage-sized pages; nothing is materialized
        // beyond the current page.
        loop {
            let mut query = EventQuery::for_run(run_id)
                .with_type(event_type)
                .with_page(page_index, 1000);
            query.start_time = start_time;
            query.end_time = end_time;

            let page = self.store.query_events(&query)?;
            if page.events.is_empty() {
                break;
            }
            for event in &page.events {
                scanned += 1;
                match extract_metric(&event.properties, metric_property) {
                    Some(v) => acc.push(v),
                    None => acc.skip(),
                }
            }
            page_index += 1;
        }

        Ok((acc.finish(), ToolMeta::new(started, scanned)))
    }

    // -------------------------------------------------------------------------
    // EventSequence
    // -------------------------------------------------------------------------

    /// Causal subtree below a root event, breadth-first over parent links.
    /// The root is the first event of `root_event_type` at/after `start_time`
    /// (or the run's first such event when no start is given).
    pub fn event_sequence(
        &self,
        run_id: &str,
        root_event_type: EventType,
        max_depth: u32,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<(EventSequence, ToolMeta)> {
        let started = Instant::now();
        self.require_run(run_id)?;

        let events = self.store.load_run_events(run_id)?;
        let root = events
            .iter()
            .find(|e| {
                e.event_type == root_event_type
                    && start_time.map(|s| e.timestamp >= s).unwrap_or(true)
            })
            .with_context(|| {
                format!(
                    "No {} event found in run {} to root the sequence",
                    root_event_type.as_str(),
                    run_id
                )
            })?
            .event_id
            .clone();

        let seq = sequence::traverse(&events, &root, max_depth);
        let total = seq.nodes.len() as u64;
        Ok((seq, ToolMeta::new(started, total)))
    }
}

fn page_payload(page: EventPage, started: Instant) -> EventPagePayload {
    EventPagePayload {
        total_count: page.total_count,
        page_index: page.page_index,
        page_size: page.page_size,
        meta: ToolMeta::new(started, page.total_count),
        events: page.events,
    }
}

/// Structural entity match with substring fallback.
fn references_entity(event: &BacktestEvent, entity_type: &str, entity_id: &str) -> bool {
    if let Some(obj) = event.properties.as_object() {
        let type_lower = entity_type.to_ascii_lowercase();
        let candidates = [
            type_lower.clone(),
            format!("{}id", type_lower),
            format!("{}_id", type_lower),
        ];
        for (key, value) in obj {
            let key_lower = key.to_ascii_lowercase();
            if candidates.iter().any(|c| c == &key_lower) {
                let matches = match value {
                    Value::String(s) => s == entity_id,
                    Value::Number(n) => n.to_string() == entity_id,
                    _ => false,
                };
                if matches {
                    return true;
                }
            }
        }
    }
    // Fallback for ids buried in nested payloads.
    serde_json::to_string(&event.properties)
        .map(|s| s.contains(entity_id))
        .unwrap_or(false)
}

/// Dotted-path numeric extraction from the properties document, each segment
/// matched case-insensitively.
fn extract_metric(properties: &Value, path: &str) -> Option<f64> {
    let mut current = properties;
    for segment in path.split('.') {
        let obj = current.as_object()?;
        current = obj
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(segment))
            .map(|(_, v)| v)?;
    }
    crate::events::model::value_as_f64(current)
}
