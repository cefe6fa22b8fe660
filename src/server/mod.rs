//! Stdio tool-call host for the query engine.
//!
//! One JSON request per stdin line, one JSON response per stdout line. All
//! diagnostics go to stderr via tracing so stdout carries nothing but
//! protocol. A malformed request, unknown tool, or unknown run id produces an
//! `ok: false` response on the normal channel; the server keeps serving.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::coordination::{ShutdownReason, ShutdownSignal};
use crate::events::model::{EventType, Severity};
use crate::query::QueryEngine;

// =============================================================================
// Protocol shapes
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub tool: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct ToolResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<Value>, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

// =============================================================================
// Tool parameter shapes (camelCase on the wire)
// =============================================================================

fn default_page_size() -> u32 {
    crate::storage::DEFAULT_PAGE_SIZE
}

fn default_max_depth() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsByTypeParams {
    run_id: String,
    event_type: String,
    severity: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    page_index: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsByEntityParams {
    run_id: String,
    entity_type: String,
    entity_id: String,
    #[serde(default)]
    page_index: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateSnapshotParams {
    run_id: String,
    timestamp: DateTime<Utc>,
    #[serde(default = "default_true")]
    include_indicators: bool,
    #[serde(default = "default_true")]
    include_orders: bool,
    security_filter: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregateMetricsParams {
    run_id: String,
    event_type: String,
    metric_property: String,
    aggregation: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventSequenceParams {
    run_id: String,
    root_event_type: String,
    #[serde(default = "default_max_depth")]
    max_depth: u32,
    start_time: Option<DateTime<Utc>>,
}

// =============================================================================
// Dispatch
// =============================================================================

/// Route one request to the query engine. Every failure mode maps to an
/// in-band error response.
pub fn dispatch(engine: &QueryEngine, request: ToolRequest) -> ToolResponse {
    let id = request.id.clone();
    match dispatch_inner(engine, &request) {
        Ok(result) => ToolResponse::success(id, result),
        Err(e) => ToolResponse::failure(id, format!("{:#}", e)),
    }
}

fn dispatch_inner(engine: &QueryEngine, request: &ToolRequest) -> Result<Value> {
    match request.tool.as_str() {
        "ListBacktestRuns" => {
            let runs = engine.store().list_runs()?;
            Ok(json!({ "runs": runs }))
        }
        "GetEventsByType" => {
            let p: EventsByTypeParams = parse_params(&request.params)?;
            let event_type = parse_event_type(&p.event_type)?;
            let severity = p.severity.as_deref().map(parse_severity).transpose()?;
            let page = engine.events_by_type(
                &p.run_id,
                event_type,
                severity,
                p.start_time,
                p.end_time,
                p.page_index,
                p.page_size,
            )?;
            Ok(serde_json::to_value(page)?)
        }
        "GetEventsByEntity" => {
            let p: EventsByEntityParams = parse_params(&request.params)?;
            let page = engine.events_by_entity(
                &p.run_id,
                &p.entity_type,
                &p.entity_id,
                p.page_index,
                p.page_size,
            )?;
            Ok(serde_json::to_value(page)?)
        }
        "GetStateSnapshot" => {
            let p: StateSnapshotParams = parse_params(&request.params)?;
            let (snapshot, meta) = engine.state_snapshot(
                &p.run_id,
                p.timestamp,
                p.include_indicators,
                p.include_orders,
                p.security_filter.as_deref(),
            )?;
            Ok(json!({ "snapshot": snapshot, "meta": meta }))
        }
        "AggregateMetrics" => {
            let p: AggregateMetricsParams = parse_params(&request.params)?;
            let event_type = parse_event_type(&p.event_type)?;
            let (aggregate, meta) = engine.aggregate_metrics(
                &p.run_id,
                event_type,
                &p.metric_property,
                p.start_time,
                p.end_time,
            )?;
            let value = match p.aggregation.as_deref() {
                None => None,
                Some(name) => Some(select_aggregation(&aggregate, name)?),
            };
            Ok(json!({ "aggregate": aggregate, "value": value, "meta": meta }))
        }
        "QueryEventSequence" => {
            let p: EventSequenceParams = parse_params(&request.params)?;
            let event_type = parse_event_type(&p.root_event_type)?;
            let (sequence, meta) =
                engine.event_sequence(&p.run_id, event_type, p.max_depth, p.start_time)?;
            Ok(json!({ "sequence": sequence, "meta": meta }))
        }
        other => anyhow::bail!("Unknown tool: {}", other),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T> {
    serde_json::from_value(params.clone()).map_err(|e| anyhow::anyhow!("Invalid params: {}", e))
}

fn parse_event_type(s: &str) -> Result<EventType> {
    EventType::parse(s).ok_or_else(|| anyhow::anyhow!("Unknown event type: {}", s))
}

fn parse_severity(s: &str) -> Result<Severity> {
    Severity::parse(s).ok_or_else(|| anyhow::anyhow!("Unknown severity: {}", s))
}

fn select_aggregation(agg: &crate::query::MetricAggregate, name: &str) -> Result<Value> {
    let value = match name.to_ascii_lowercase().as_str() {
        "count" => Some(agg.count as f64),
        "sum" => agg.sum,
        "avg" | "average" | "mean" => agg.avg,
        "min" => agg.min,
        "max" => agg.max,
        "stddev" | "std_dev" => agg.std_dev,
        other => anyhow::bail!("Unknown aggregation: {}", other),
    };
    Ok(value.map(|v| json!(v)).unwrap_or(Value::Null))
}

// =============================================================================
// Stdio host
// =============================================================================

/// Serve requests from stdin until the shutdown signal fires, the cancel
/// token flips, or stdin closes.
pub async fn run_server(
    engine: Arc<QueryEngine>,
    signal: ShutdownSignal,
    mut cancel: watch::Receiver<bool>,
) -> Result<()> {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);

    // Stdin is blocking; bridge it through a channel from a blocking task.
    // The task ends when stdin closes or the receiver is dropped.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    info!("Query server ready");
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                match line {
                    Some(line) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let response = handle_line(&engine, trimmed);
                        let serialized = serde_json::to_string(&response)?;
                        writeln!(stdout, "{}", serialized)?;
                        stdout.flush()?;
                    }
                    None => {
                        debug!("Stdin closed, stopping server");
                        return Ok(());
                    }
                }
            }
            reason = signal.wait_for_shutdown(&mut cancel) => {
                match reason {
                    ShutdownReason::Signaled => info!("Stopping on shutdown signal"),
                    ShutdownReason::Cancelled => info!("Stopping on cancellation"),
                }
                return Ok(());
            }
        }
    }
}

fn handle_line(engine: &QueryEngine, line: &str) -> ToolResponse {
    match serde_json::from_str::<ToolRequest>(line) {
        Ok(request) => {
            debug!(tool = %request.tool, "Handling tool call");
            dispatch(engine, request)
        }
        Err(e) => {
            warn!(error = %e, "Malformed tool request");
            ToolResponse::failure(None, format!("Malformed request: {}", e))
        }
    }
}
