//! Payload field access shared by the handlers.

use common::Payload;
use dispatcher::HandlerError;
use serde_json::Value;

/// Returns a required non-empty string field.
pub(crate) fn require_str<'a>(payload: &'a Payload, field: &str) -> Result<&'a str, HandlerError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| HandlerError::missing(field))
}

/// Returns an amount in cents from a decimal field such as `total_amount`.
pub(crate) fn require_cents(payload: &Payload, field: &str) -> Result<u64, HandlerError> {
    let amount = payload
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| HandlerError::missing(field))?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(HandlerError::InvalidPayload(format!(
            "'{field}' must be a positive amount"
        )));
    }
    Ok((amount * 100.0).round() as u64)
}

/// Reads `field` from the compensated step's `original_response`, falling
/// back to the payload itself.
pub(crate) fn from_original(payload: &Payload, field: &str) -> Option<String> {
    payload
        .get("original_response")
        .and_then(|original| original.get(field))
        .or_else(|| payload.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Builds a payload from `(key, value)` pairs.
pub(crate) fn payload<const N: usize>(entries: [(&str, Value); N]) -> Payload {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
