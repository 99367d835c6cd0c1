//! JSON object payloads exchanged between the orchestrator and participants.

use chrono::Utc;
use serde_json::{Map, Value};

/// A JSON object: request templates, saga context, handler input and output.
pub type Payload = Map<String, Value>;

/// Shallow-merges `source` into `target`. Keys in `source` win.
pub fn merge(target: &mut Payload, source: &Payload) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}

/// Returns `base` shallow-merged with `overlay` without touching either input.
pub fn merged(base: &Payload, overlay: &Payload) -> Payload {
    let mut out = base.clone();
    merge(&mut out, overlay);
    out
}

/// Current wall-clock time as fractional epoch seconds, the wire `timestamp` format.
pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
