//! Prometheus metrics for trip settlement
//!
//! # Metrics
//!
//! - `settlement_events_total` - Events handled, by outcome
//! - `settlement_event_duration_seconds` - Time to settle one event
//! - `settlement_balance_conflicts_total` - Optimistic transactions aborted by a concurrent write
//! - `settlement_balance_exhausted_total` - Operations that ran out of retries
//! - `settlement_ledger_marks_total` - Trip ledger updates, by result
//! - `settlement_reconciliation_groups_total` - Duplicate key groups, by result

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, Encoder, Histogram, IntCounterVec, TextEncoder,
};

lazy_static! {
    pub static ref SETTLEMENT_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "settlement_events_total",
        "Completed-trip events handled",
        &["outcome"]
    )
    .unwrap();

    pub static ref SETTLEMENT_EVENT_DURATION: Histogram = register_histogram!(
        "settlement_event_duration_seconds",
        "Time to settle one completed-trip event",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .unwrap();

    pub static ref BALANCE_CONFLICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "settlement_balance_conflicts_total",
        "Balance transactions aborted by a concurrent write",
        &["operation"]
    )
    .unwrap();

    pub static ref BALANCE_EXHAUSTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "settlement_balance_exhausted_total",
        "Balance operations that gave up after the retry cap",
        &["operation"]
    )
    .unwrap();

    pub static ref LEDGER_MARKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "settlement_ledger_marks_total",
        "Trip ledger processed-flag updates",
        &["result"]
    )
    .unwrap();

    pub static ref RECONCILIATION_GROUPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "settlement_reconciliation_groups_total",
        "Case-variant balance key groups seen by the reconciler",
        &["result"]
    )
    .unwrap();
}

/// Export the default registry in Prometheus text format
pub fn export() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
