//! Structural validation for events entering the log.
//!
//! Validation is soft by design: a malformed or incomplete payload populates
//! `validation_errors` on the stored event instead of blocking the write, so
//! the forensic record survives. The one hard failure is a self-referential
//! parent link, which is a defect in the emitting code rather than bad input.

use anyhow::{bail, Result};
use serde_json::Value;

use super::model::{BacktestEvent, EventType, ValidationError};

/// Serialized payload ceiling. Oversized payloads are flagged, not rejected.
pub const MAX_PROPERTIES_BYTES: usize = 1024 * 1024;

/// Required property fields per event type. StateChange has no contract.
fn required_fields(event_type: EventType) -> &'static [&'static str] {
    match event_type {
        EventType::TradeExecution => &["OrderId", "Price"],
        EventType::OrderRejection => &["OrderId", "Reason"],
        EventType::IndicatorCalculation => &["IndicatorName", "Value"],
        EventType::PositionUpdate => &["Symbol", "Quantity"],
        EventType::MarketDataEvent => &["Symbol"],
        EventType::RiskEvent => &["RiskType"],
        EventType::StateChange => &[],
    }
}

/// Pure structural check. No I/O.
///
/// A non-object payload yields a single fatal finding and skips the
/// type-specific checks, since field lookups are meaningless on it.
pub fn validate(event: &BacktestEvent) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let obj = match &event.properties {
        Value::Object(map) => map,
        other => {
            errors.push(ValidationError::error(
                "properties",
                format!(
                    "properties must be a JSON object, got {}",
                    json_type_name(other)
                ),
            ));
            return errors;
        }
    };

    // Size ceiling on the serialized form.
    let serialized_len = serde_json::to_string(&event.properties)
        .map(|s| s.len())
        .unwrap_or(0);
    if serialized_len > MAX_PROPERTIES_BYTES {
        errors.push(ValidationError::error(
            "properties",
            format!(
                "properties payload is {} bytes, exceeds {} byte ceiling",
                serialized_len, MAX_PROPERTIES_BYTES
            ),
        ));
    }

    for field in required_fields(event.event_type) {
        let present = obj.keys().any(|k| k.eq_ignore_ascii_case(field));
        if !present {
            errors.push(ValidationError::error(
                *field,
                format!("required property missing for {}", event.event_type.as_str()),
            ));
        } else if obj
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(field))
            .map(|(_, v)| v.is_null())
            .unwrap_or(false)
        {
            errors.push(ValidationError::warning(
                *field,
                "required property is null".to_string(),
            ));
        }
    }

    errors
}

/// True when the event's parent link points at itself.
pub fn is_self_reference(event: &BacktestEvent) -> bool {
    event
        .parent_event_id
        .as_deref()
        .is_some_and(|parent| parent == event.event_id)
}

/// Hard guard, checked before persistence. A self-referential parent is a
/// programming error in the caller, so this fails loudly instead of producing
/// a soft validation finding. Longer cycles (A -> B -> A) are not checked at
/// write time; sequence traversal bounds them at read time.
pub fn ensure_not_self_referential(event: &BacktestEvent) -> Result<()> {
    if is_self_reference(event) {
        bail!(
            "event {} references itself as parent; refusing to persist",
            event.event_id
        );
    }
    Ok(())
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
