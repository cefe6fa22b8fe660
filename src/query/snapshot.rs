//! Point-in-time state reconstruction.
//!
//! Replays the run's events up to and including `as_of` and folds them into
//! the strategy state that was live at that instant. The fold is pure: the
//! same event prefix always produces the same snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::events::model::{
    is_terminal_order_status, BacktestEvent, EventType, IndicatorView, OrderRejectionView,
    PositionUpdateView, TradeExecutionView,
};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PositionState {
    pub symbol: String,
    pub quantity: f64,
    pub average_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndicatorState {
    pub name: String,
    pub symbol: Option<String>,
    pub value: f64,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActiveOrder {
    pub order_id: String,
    pub symbol: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
    pub status: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Default)]
pub struct PnlSummary {
    pub total: f64,
    pub realized: f64,
    pub unrealized: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StateSnapshot {
    pub as_of: DateTime<Utc>,
    pub positions: Vec<PositionState>,
    pub indicators: Vec<IndicatorState>,
    pub active_orders: Vec<ActiveOrder>,
    pub pnl: PnlSummary,
    /// Events folded into this snapshot.
    pub events_replayed: u64,
}

/// Left-fold the time-ordered event prefix into a snapshot.
///
/// Reducers per event type:
/// - IndicatorCalculation overwrites the latest value for (name, symbol).
/// - PositionUpdate overwrites the position for its symbol.
/// - TradeExecution with a non-terminal status adds to the active-order set;
///   a terminal status (or no status, meaning the trade simply executed)
///   removes it. Realized pnl accumulates from the execution's pnl field.
/// - OrderRejection is always terminal for its order.
///
/// `events` must already be sorted by (timestamp, event_id), which is the
/// storage load order; determinism depends on it.
pub fn reconstruct(
    events: &[BacktestEvent],
    as_of: DateTime<Utc>,
    include_indicators: bool,
    include_orders: bool,
    security_filter: Option<&str>,
) -> StateSnapshot {
    // BTreeMaps keep output ordering stable across replays.
    let mut positions: BTreeMap<String, PositionState> = BTreeMap::new();
    let mut indicators: BTreeMap<(String, String), IndicatorState> = BTreeMap::new();
    let mut orders: BTreeMap<String, ActiveOrder> = BTreeMap::new();
    let mut realized = 0.0f64;
    let mut replayed = 0u64;

    let symbol_passes = |symbol: Option<&str>| match (security_filter, symbol) {
        (None, _) => true,
        (Some(filter), Some(sym)) => filter.eq_ignore_ascii_case(sym),
        // Filtered snapshots drop entries with no symbol at all.
        (Some(_), None) => false,
    };

    for event in events.iter().filter(|e| e.timestamp <= as_of) {
        replayed += 1;
        match event.event_type {
            EventType::IndicatorCalculation => {
                let view = IndicatorView::from_event(event);
                let (Some(name), Some(value)) = (view.name, view.value) else {
                    continue;
                };
                if !symbol_passes(view.symbol.as_deref()) {
                    continue;
                }
                let key = (name.clone(), view.symbol.clone().unwrap_or_default());
                indicators.insert(
                    key,
                    IndicatorState {
                        name,
                        symbol: view.symbol,
                        value,
                        as_of: event.timestamp,
                    },
                );
            }
            EventType::PositionUpdate => {
                let view = PositionUpdateView::from_event(event);
                let (Some(symbol), Some(quantity)) = (view.symbol, view.quantity) else {
                    continue;
                };
                if !symbol_passes(Some(&symbol)) {
                    continue;
                }
                positions.insert(
                    symbol.clone(),
                    PositionState {
                        symbol,
                        quantity,
                        average_price: view.average_price,
                        unrealized_pnl: view.unrealized_pnl,
                        as_of: event.timestamp,
                    },
                );
            }
            EventType::TradeExecution => {
                let view = TradeExecutionView::from_event(event);
                if let Some(pnl) = view.realized_pnl {
                    if symbol_passes(view.symbol.as_deref()) {
                        realized += pnl;
                    }
                }
                let Some(order_id) = view.order_id else {
                    continue;
                };
                if !symbol_passes(view.symbol.as_deref()) && view.symbol.is_some() {
                    continue;
                }
                let terminal = view
                    .status
                    .as_deref()
                    .map(is_terminal_order_status)
                    // No status at all means the trade executed outright.
                    .unwrap_or(true);
                if terminal {
                    orders.remove(&order_id);
                } else {
                    orders.insert(
                        order_id.clone(),
                        ActiveOrder {
                            order_id,
                            symbol: view.symbol,
                            price: view.price,
                            quantity: view.quantity,
                            status: view.status,
                            submitted_at: event.timestamp,
                        },
                    );
                }
            }
            EventType::OrderRejection => {
                let view = OrderRejectionView::from_event(event);
                if let Some(order_id) = view.order_id {
                    orders.remove(&order_id);
                }
            }
            EventType::StateChange | EventType::MarketDataEvent | EventType::RiskEvent => {}
        }
    }

    let unrealized: f64 = positions
        .values()
        .filter_map(|p| p.unrealized_pnl)
        .sum();

    StateSnapshot {
        as_of,
        positions: positions.into_values().collect(),
        indicators: if include_indicators {
            indicators.into_values().collect()
        } else {
            Vec::new()
        },
        active_orders: if include_orders {
            orders.into_values().collect()
        } else {
            Vec::new()
        },
        pnl: PnlSummary {
            total: realized + unrealized,
            realized,
            unrealized,
        },
        events_replayed: replayed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::{Category, Severity};
    use chrono::TimeZone;
    use serde_json::{json, Value};

    fn event(secs: u32, event_type: EventType, properties: Value) -> BacktestEvent {
        BacktestEvent::new(
            "r1",
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs).unwrap(),
            event_type,
            Severity::Info,
            Category::Portfolio,
            properties,
        )
    }

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs).unwrap()
    }

    fn fixture() -> Vec<BacktestEvent> {
        vec![
            event(
                1,
                EventType::IndicatorCalculation,
                json!({"IndicatorName": "sma_20", "Symbol": "BTC", "Value": 100.0}),
            ),
            event(
                2,
                EventType::TradeExecution,
                json!({"OrderId": "o-1", "Symbol": "BTC", "Price": 101.0, "Quantity": 1.0, "Status": "Submitted"}),
            ),
            event(
                3,
                EventType::PositionUpdate,
                json!({"Symbol": "BTC", "Quantity": 1.0, "AveragePrice": 101.0, "UnrealizedPnl": 2.0}),
            ),
            event(
                4,
                EventType::IndicatorCalculation,
                json!({"IndicatorName": "sma_20", "Symbol": "BTC", "Value": 102.5}),
            ),
            event(
                5,
                EventType::TradeExecution,
                json!({"OrderId": "o-1", "Symbol": "BTC", "Price": 101.0, "Status": "Filled", "Pnl": 7.5}),
            ),
            event(
                6,
                EventType::TradeExecution,
                json!({"OrderId": "o-2", "Symbol": "ETH", "Price": 55.0, "Quantity": 3.0, "Status": "New"}),
            ),
            event(
                7,
                EventType::OrderRejection,
                json!({"OrderId": "o-2", "Reason": "insufficient margin"}),
            ),
        ]
    }

    #[test]
    fn test_indicator_latest_value_wins() {
        let snap = reconstruct(&fixture(), ts(10), true, true, None);
        assert_eq!(snap.indicators.len(), 1);
        assert_eq!(snap.indicators[0].value, 102.5);
        assert_eq!(snap.indicators[0].as_of, ts(4));
    }

    #[test]
    fn test_as_of_cuts_the_prefix() {
        let snap = reconstruct(&fixture(), ts(3), true, true, None);
        // Only the first indicator value is in the prefix.
        assert_eq!(snap.indicators[0].value, 100.0);
        // o-1 was submitted at t=2 and not yet filled.
        assert_eq!(snap.active_orders.len(), 1);
        assert_eq!(snap.active_orders[0].order_id, "o-1");
        assert_eq!(snap.events_replayed, 3);
    }

    #[test]
    fn test_terminal_states_clear_orders() {
        let snap = reconstruct(&fixture(), ts(10), true, true, None);
        // o-1 filled at t=5, o-2 rejected at t=7.
        assert!(snap.active_orders.is_empty());
    }

    #[test]
    fn test_pnl_fold() {
        let snap = reconstruct(&fixture(), ts(10), true, true, None);
        assert_eq!(snap.pnl.realized, 7.5);
        assert_eq!(snap.pnl.unrealized, 2.0);
        assert_eq!(snap.pnl.total, 9.5);
    }

    #[test]
    fn test_security_filter() {
        let snap = reconstruct(&fixture(), ts(6), true, true, Some("ETH"));
        assert!(snap.positions.is_empty());
        assert!(snap.indicators.is_empty());
        assert_eq!(snap.active_orders.len(), 1);
        assert_eq!(snap.active_orders[0].order_id, "o-2");
    }

    #[test]
    fn test_include_flags() {
        let snap = reconstruct(&fixture(), ts(10), false, false, None);
        assert!(snap.indicators.is_empty());
        assert!(snap.active_orders.is_empty());
        // Positions are always included.
        assert_eq!(snap.positions.len(), 1);
    }

    #[test]
    fn test_snapshot_deterministic() {
        let events = fixture();
        let a = reconstruct(&events, ts(10), true, true, None);
        let b = reconstruct(&events, ts(10), true, true, None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_position_overwrite_semantics() {
        let mut events = fixture();
        events.push(event(
            8,
            EventType::PositionUpdate,
            json!({"Symbol": "BTC", "Quantity": 0.0, "UnrealizedPnl": 0.0}),
        ));
        let snap = reconstruct(&events, ts(10), false, false, None);
        assert_eq!(snap.positions.len(), 1);
        assert_eq!(snap.positions[0].quantity, 0.0);
        assert_eq!(snap.pnl.unrealized, 0.0);
    }
}
