//! Structured event hook.
//!
//! Phase transitions are emitted as trace events under an `mrp` span; the
//! binary decides where they go by installing a subscriber.

pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::trace_span!("mrp", event = %event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::trace!(event = %event, key = %k, value = %v, "metric");
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
