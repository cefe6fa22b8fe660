//! End-to-end tests for the event log lifecycle.
//!
//! Each test models the real process sequence: a producer session writes and
//! flushes against a database file, the producer goes away, then a query
//! engine opens the same file and answers questions about it. Coordination
//! tests drive both sides of the lock and shutdown primitives against a
//! shared temp directory, standing in for the two processes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::watch;

use replaylens::coordination::{InstanceLock, ShutdownClient, ShutdownSignal};
use replaylens::events::{EventLogSession, WriterConfig};
use replaylens::query::QueryEngine;
use replaylens::server::{dispatch, ToolRequest};
use replaylens::storage::EventQuery;
use replaylens::{BacktestEvent, Category, EventStore, EventType, Run, Severity};

fn test_run(id: &str) -> Run {
    Run::new(
        id,
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 1, 1, 6, 0, 0).unwrap(),
        "sha256:deadbeef",
    )
}

fn trade_event(run_id: &str, secs: u32, pnl: f64) -> BacktestEvent {
    BacktestEvent::new(
        run_id,
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs % 60).unwrap(),
        EventType::TradeExecution,
        Severity::Info,
        Category::Execution,
        json!({"OrderId": format!("o-{}", secs), "Price": 100.0 + secs as f64, "Pnl": pnl}),
    )
}

#[tokio::test]
async fn producer_writes_then_server_reads_same_file() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("events.db");

    // Producer process: write 400 events, flush, exit.
    {
        let store = Arc::new(EventStore::open(&db_path).unwrap());
        let session =
            EventLogSession::begin(store, test_run("r1"), WriterConfig::default()).unwrap();
        for i in 0..400 {
            session.emit(trade_event("r1", i, 1.0)).unwrap();
        }
        session.finish().await;
    }

    // Server process: reopen the file and query.
    let store = Arc::new(EventStore::open(&db_path).unwrap());
    let engine = QueryEngine::new(store.clone());

    assert_eq!(store.count_run_events("r1").unwrap(), 400);

    let page = engine
        .events_by_type("r1", EventType::TradeExecution, None, None, None, 0, 50)
        .unwrap();
    assert_eq!(page.total_count, 400);
    assert_eq!(page.events.len(), 50);
}

#[tokio::test]
async fn event_ids_distinct_across_session() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("events.db");

    let store = Arc::new(EventStore::open(&db_path).unwrap());
    let session =
        EventLogSession::begin(store.clone(), test_run("r1"), WriterConfig::default()).unwrap();
    for i in 0..200 {
        session.emit(trade_event("r1", i, 0.5)).unwrap();
    }
    session.finish().await;

    let events = store.load_run_events("r1").unwrap();
    let ids: HashSet<_> = events.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids.len(), 200);
}

#[tokio::test]
async fn pagination_concatenation_matches_unpaged() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(EventStore::open(dir.path().join("events.db")).unwrap());
    store.create_run(&test_run("r1")).unwrap();
    let events: Vec<_> = (0..53).map(|i| trade_event("r1", i, 1.0)).collect();
    store.insert_events(&events).unwrap();

    // 7 does not divide 53.
    let mut concatenated = Vec::new();
    for page_index in 0.. {
        let page = store
            .query_events(&EventQuery::for_run("r1").with_page(page_index, 7))
            .unwrap();
        if page.events.is_empty() {
            break;
        }
        concatenated.extend(page.events.into_iter().map(|e| e.event_id));
    }

    let unpaged = store
        .query_events(&EventQuery::for_run("r1").with_page(0, 10_000))
        .unwrap();
    let unpaged_ids: Vec<_> = unpaged.events.into_iter().map(|e| e.event_id).collect();

    assert_eq!(concatenated, unpaged_ids);
    let unique: HashSet<_> = concatenated.iter().collect();
    assert_eq!(unique.len(), 53);
}

#[tokio::test]
async fn full_tool_surface_against_recorded_run() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("events.db");

    {
        let store = Arc::new(EventStore::open(&db_path).unwrap());
        let session =
            EventLogSession::begin(store, test_run("r1"), WriterConfig::default()).unwrap();

        let market = BacktestEvent::new(
            "r1",
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 1).unwrap(),
            EventType::MarketDataEvent,
            Severity::Info,
            Category::MarketData,
            json!({"Symbol": "BTC", "Price": 50_000.0}),
        );
        let market_id = market.event_id.clone();
        session.emit(market).unwrap();

        for (i, pnl) in [10.0, -5.0, 20.0].iter().enumerate() {
            let trade = trade_event("r1", i as u32 + 2, *pnl).with_parent(market_id.clone());
            session.emit(trade).unwrap();
        }
        session
            .emit(BacktestEvent::new(
                "r1",
                Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 5).unwrap(),
                EventType::PositionUpdate,
                Severity::Info,
                Category::Portfolio,
                json!({"Symbol": "BTC", "Quantity": 2.0, "UnrealizedPnl": 3.0}),
            ))
            .unwrap();
        session.finish().await;
    }

    let engine = QueryEngine::new(Arc::new(EventStore::open(&db_path).unwrap()));

    // AggregateMetrics over realized pnl.
    let (agg, _) = engine
        .aggregate_metrics("r1", EventType::TradeExecution, "Pnl", None, None)
        .unwrap();
    assert_eq!(agg.sum, Some(25.0));
    assert!((agg.avg.unwrap() - 8.333333333333334).abs() < 1e-9);

    // StateSnapshot at the end of the run.
    let (snapshot, _) = engine
        .state_snapshot(
            "r1",
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap(),
            true,
            true,
            None,
        )
        .unwrap();
    assert_eq!(snapshot.positions.len(), 1);
    assert_eq!(snapshot.pnl.realized, 25.0);
    assert_eq!(snapshot.pnl.unrealized, 3.0);

    // EventSequence rooted at the market data event.
    let (sequence, _) = engine
        .event_sequence("r1", EventType::MarketDataEvent, 3, None)
        .unwrap();
    assert_eq!(sequence.nodes.len(), 4); // root + 3 trades
    assert!(sequence.nodes[1..].iter().all(|n| n.depth == 1));

    // EventsByEntity for one of the orders.
    let page = engine.events_by_entity("r1", "Order", "o-2", 0, 10).unwrap();
    assert_eq!(page.total_count, 1);
}

#[tokio::test]
async fn dispatch_round_trip_and_error_recovery() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(EventStore::open(dir.path().join("events.db")).unwrap());
    store.create_run(&test_run("r1")).unwrap();
    store
        .insert_events(&[trade_event("r1", 1, 12.0)])
        .unwrap();
    let engine = QueryEngine::new(store);

    // One bad request must not poison the next good one.
    let bad: ToolRequest = serde_json::from_str(
        r#"{"tool": "GetEventsByType", "params": {"runId": "ghost", "eventType": "TradeExecution"}}"#,
    )
    .unwrap();
    let response = dispatch(&engine, bad);
    assert!(!response.ok);

    let good: ToolRequest = serde_json::from_str(
        r#"{"tool": "GetEventsByType", "params": {"runId": "r1", "eventType": "TradeExecution"}}"#,
    )
    .unwrap();
    let response = dispatch(&engine, good);
    assert!(response.ok);
    assert_eq!(response.result.unwrap()["total_count"], 1);
}

#[tokio::test]
async fn lock_contention_between_two_holders() {
    let dir = TempDir::new().unwrap();

    let holder_a = InstanceLock::try_acquire(dir.path()).unwrap();
    assert!(holder_a.is_some());

    // "Process B" in the same test: acquisition fails, probe sees A.
    assert!(InstanceLock::try_acquire(dir.path()).unwrap().is_none());
    assert!(InstanceLock::is_another_instance_running(dir.path()));

    drop(holder_a);
    assert!(InstanceLock::try_acquire(dir.path()).unwrap().is_some());
}

#[tokio::test]
async fn shutdown_signal_wakes_waiting_server() {
    let dir = TempDir::new().unwrap();

    // Server side: hold the lock, own the signal, wait.
    let _lock = InstanceLock::try_acquire(dir.path()).unwrap().unwrap();
    let signal = ShutdownSignal::create_for_server(dir.path()).unwrap();
    let (_cancel_tx, mut cancel_rx) = watch::channel(false);

    // Client side: open the existing signal and trigger it shortly after.
    let client = ShutdownClient::open_existing(dir.path()).expect("server should be visible");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        client.signal().unwrap();
    });

    let started = Instant::now();
    signal.wait_for_shutdown(&mut cancel_rx).await;
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn shutdown_client_absent_without_server() {
    let dir = TempDir::new().unwrap();
    assert!(ShutdownClient::open_existing(dir.path()).is_none());
}
