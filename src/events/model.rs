//! Event and run records for the backtest event log.
//!
//! A `Run` is one backtest execution; every `BacktestEvent` belongs to exactly
//! one run. Events are append-only: once persisted they are never mutated or
//! deleted except by whole-run deletion. `properties` stays an opaque JSON
//! document on the wire and in storage; typed views decode the per-event-type
//! fields the validator and snapshot replay care about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// =============================================================================
// Run
// =============================================================================

/// One backtest execution. Immutable after creation; `end_time` is fixed at
/// creation time and never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub strategy_config_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        id: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        strategy_config_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            start_time,
            end_time,
            strategy_config_hash: strategy_config_hash.into(),
            created_at: Utc::now(),
        }
    }

    /// Run with a generated id, for callers that don't supply their own.
    pub fn with_generated_id(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        strategy_config_hash: impl Into<String>,
    ) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            start_time,
            end_time,
            strategy_config_hash,
        )
    }
}

/// Run listing entry with its event count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub strategy_config_hash: String,
    pub created_at: DateTime<Utc>,
    pub event_count: u64,
}

// =============================================================================
// Event taxonomy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    TradeExecution,
    OrderRejection,
    IndicatorCalculation,
    PositionUpdate,
    StateChange,
    MarketDataEvent,
    RiskEvent,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TradeExecution => "TradeExecution",
            EventType::OrderRejection => "OrderRejection",
            EventType::IndicatorCalculation => "IndicatorCalculation",
            EventType::PositionUpdate => "PositionUpdate",
            EventType::StateChange => "StateChange",
            EventType::MarketDataEvent => "MarketDataEvent",
            EventType::RiskEvent => "RiskEvent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TradeExecution" => Some(EventType::TradeExecution),
            "OrderRejection" => Some(EventType::OrderRejection),
            "IndicatorCalculation" => Some(EventType::IndicatorCalculation),
            "PositionUpdate" => Some(EventType::PositionUpdate),
            "StateChange" => Some(EventType::StateChange),
            "MarketDataEvent" => Some(EventType::MarketDataEvent),
            "RiskEvent" => Some(EventType::RiskEvent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "Debug",
            Severity::Info => "Info",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
            Severity::Critical => "Critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Debug" => Some(Severity::Debug),
            "Info" => Some(Severity::Info),
            "Warning" => Some(Severity::Warning),
            "Error" => Some(Severity::Error),
            "Critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Execution,
    MarketData,
    Data,
    Indicators,
    Analysis,
    Risk,
    Performance,
    Portfolio,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Execution => "Execution",
            Category::MarketData => "MarketData",
            Category::Data => "Data",
            Category::Indicators => "Indicators",
            Category::Analysis => "Analysis",
            Category::Risk => "Risk",
            Category::Performance => "Performance",
            Category::Portfolio => "Portfolio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Execution" => Some(Category::Execution),
            "MarketData" => Some(Category::MarketData),
            "Data" => Some(Category::Data),
            "Indicators" => Some(Category::Indicators),
            "Analysis" => Some(Category::Analysis),
            "Risk" => Some(Category::Risk),
            "Performance" => Some(Category::Performance),
            "Portfolio" => Some(Category::Portfolio),
            _ => None,
        }
    }
}

// =============================================================================
// Validation errors (soft)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationSeverity {
    Error,
    Warning,
}

/// One structural finding on an event payload. Soft: the event is still
/// persisted, with `validation_errors` populated, so a flawed event remains
/// available for forensics but is marked unreliable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub severity: ValidationSeverity,
}

impl ValidationError {
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Error,
        }
    }

    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: ValidationSeverity::Warning,
        }
    }
}

// =============================================================================
// Event
// =============================================================================

/// One timestamped, typed fact emitted during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestEvent {
    /// Globally unique, across all runs.
    pub event_id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub severity: Severity,
    pub category: Category,
    /// Opaque event-type-specific payload. Always a JSON object for well-formed
    /// events; anything else is flagged by the validator.
    pub properties: Value,
    /// Causal link to the event that triggered this one.
    pub parent_event_id: Option<String>,
    pub validation_errors: Option<Vec<ValidationError>>,
}

impl BacktestEvent {
    pub fn new(
        run_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        event_type: EventType,
        severity: Severity,
        category: Category,
        properties: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            timestamp,
            event_type,
            severity,
            category,
            properties,
            parent_event_id: None,
            validation_errors: None,
        }
    }

    pub fn with_parent(mut self, parent_event_id: impl Into<String>) -> Self {
        self.parent_event_id = Some(parent_event_id.into());
        self
    }

    /// Case-insensitive property lookup on the payload object.
    pub fn property(&self, key: &str) -> Option<&Value> {
        let obj = self.properties.as_object()?;
        obj.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// Property coerced to f64 (accepts numbers and numeric strings).
    pub fn property_f64(&self, key: &str) -> Option<f64> {
        value_as_f64(self.property(key)?)
    }

    /// Property coerced to an owned string (strings pass through, scalars are
    /// formatted).
    pub fn property_string(&self, key: &str) -> Option<String> {
        match self.property(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Numeric coercion shared by the snapshot fold and metric aggregation.
pub fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// =============================================================================
// Typed property views
// =============================================================================
//
// The payload stays opaque JSON end-to-end; these views decode only the fields
// replay and validation need. Unknown keys survive untouched in the raw Value.

/// Order lifecycle states carried in `Status`. Anything not recognized is
/// treated as non-terminal (order stays active).
pub fn is_terminal_order_status(status: &str) -> bool {
    matches!(
        status.to_ascii_lowercase().as_str(),
        "filled" | "cancelled" | "canceled" | "rejected" | "expired"
    )
}

#[derive(Debug, Clone, Default)]
pub struct TradeExecutionView {
    pub order_id: Option<String>,
    pub symbol: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
    pub status: Option<String>,
    pub realized_pnl: Option<f64>,
}

impl TradeExecutionView {
    pub fn from_event(event: &BacktestEvent) -> Self {
        Self {
            order_id: event.property_string("OrderId"),
            symbol: event.property_string("Symbol"),
            price: event.property_f64("Price"),
            quantity: event.property_f64("Quantity"),
            status: event.property_string("Status"),
            realized_pnl: event
                .property_f64("RealizedPnl")
                .or_else(|| event.property_f64("Pnl")),
        }
    }
}

/// A rejection only terminates its order during replay, so the view decodes
/// nothing beyond the order id; the reason stays queryable in the raw payload.
#[derive(Debug, Clone, Default)]
pub struct OrderRejectionView {
    pub order_id: Option<String>,
}

impl OrderRejectionView {
    pub fn from_event(event: &BacktestEvent) -> Self {
        Self {
            order_id: event.property_string("OrderId"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndicatorView {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub value: Option<f64>,
}

impl IndicatorView {
    pub fn from_event(event: &BacktestEvent) -> Self {
        Self {
            name: event.property_string("IndicatorName"),
            symbol: event.property_string("Symbol"),
            value: event.property_f64("Value"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PositionUpdateView {
    pub symbol: Option<String>,
    pub quantity: Option<f64>,
    pub average_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

impl PositionUpdateView {
    pub fn from_event(event: &BacktestEvent) -> Self {
        Self {
            symbol: event.property_string("Symbol"),
            quantity: event.property_f64("Quantity"),
            average_price: event
                .property_f64("AveragePrice")
                .or_else(|| event.property_f64("AvgPrice")),
            unrealized_pnl: event.property_f64("UnrealizedPnl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_ids_unique() {
        let mk = || {
            BacktestEvent::new(
                "r1",
                Utc::now(),
                EventType::StateChange,
                Severity::Info,
                Category::Analysis,
                json!({}),
            )
        };
        let a = mk();
        let b = mk();
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_property_lookup_case_insensitive() {
        let event = BacktestEvent::new(
            "r1",
            Utc::now(),
            EventType::TradeExecution,
            Severity::Info,
            Category::Execution,
            json!({"OrderId": "o-1", "price": 101.5, "Quantity": "3"}),
        );
        assert_eq!(event.property_string("orderid").as_deref(), Some("o-1"));
        assert_eq!(event.property_f64("Price"), Some(101.5));
        assert_eq!(event.property_f64("quantity"), Some(3.0));
        assert!(event.property("missing").is_none());
    }

    #[test]
    fn test_trade_view_pnl_fallback() {
        let event = BacktestEvent::new(
            "r1",
            Utc::now(),
            EventType::TradeExecution,
            Severity::Info,
            Category::Execution,
            json!({"OrderId": "o-1", "Price": 10.0, "Pnl": -5.0}),
        );
        let view = TradeExecutionView::from_event(&event);
        assert_eq!(view.realized_pnl, Some(-5.0));
    }

    #[test]
    fn test_terminal_order_status() {
        assert!(is_terminal_order_status("Filled"));
        assert!(is_terminal_order_status("CANCELLED"));
        assert!(!is_terminal_order_status("PartiallyFilled"));
        assert!(!is_terminal_order_status("New"));
    }

    #[test]
    fn test_enum_string_round_trip() {
        for et in [
            EventType::TradeExecution,
            EventType::OrderRejection,
            EventType::IndicatorCalculation,
            EventType::PositionUpdate,
            EventType::StateChange,
            EventType::MarketDataEvent,
            EventType::RiskEvent,
        ] {
            assert_eq!(EventType::parse(et.as_str()), Some(et));
        }
        assert_eq!(EventType::parse("Bogus"), None);
        assert_eq!(Severity::parse(Severity::Critical.as_str()), Some(Severity::Critical));
        assert_eq!(Category::parse(Category::Portfolio.as_str()), Some(Category::Portfolio));
    }
}
