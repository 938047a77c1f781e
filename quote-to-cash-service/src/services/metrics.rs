//! Prometheus metrics for quote-to-cash-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Signatures captured by document kind and signer role.
pub static SIGNATURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "quote_to_cash_signatures_total",
        "Total number of signatures captured",
        &["document_kind", "role"]
    )
    .expect("Failed to register signatures_total")
});

/// Contract writes by kind.
pub static CONTRACTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "quote_to_cash_contracts_total",
        "Total number of contract writes by kind",
        &["kind"] // initial, revision, void, duplicate
    )
    .expect("Failed to register contracts_total")
});

/// Change order status transitions.
pub static CHANGE_ORDER_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "quote_to_cash_change_order_transitions_total",
        "Total number of change order status transitions",
        &["status"]
    )
    .expect("Failed to register change_order_transitions_total")
});

/// Invoice lifecycle events.
pub static INVOICES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "quote_to_cash_invoices_total",
        "Total number of invoice events",
        &["event"] // created, compensated, cancelled, sent
    )
    .expect("Failed to register invoices_total")
});

/// Payment ledger events by payment method.
pub static PAYMENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "quote_to_cash_payments_total",
        "Total number of payment events",
        &["event", "method"]
    )
    .expect("Failed to register payments_total")
});

/// Commission status transitions by role.
pub static COMMISSION_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "quote_to_cash_commission_transitions_total",
        "Total number of commission status transitions",
        &["role", "status"]
    )
    .expect("Failed to register commission_transitions_total")
});

/// Swallowed failures of external collaborators and hooks.
pub static DOWNSTREAM_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "quote_to_cash_downstream_failures_total",
        "Total number of downstream failures by collaborator",
        &["collaborator"]
    )
    .expect("Failed to register downstream_failures_total")
});

/// Ledger store query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "quote_to_cash_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&SIGNATURES_TOTAL);
    Lazy::force(&CONTRACTS_TOTAL);
    Lazy::force(&CHANGE_ORDER_TRANSITIONS_TOTAL);
    Lazy::force(&INVOICES_TOTAL);
    Lazy::force(&PAYMENTS_TOTAL);
    Lazy::force(&COMMISSION_TRANSITIONS_TOTAL);
    Lazy::force(&DOWNSTREAM_FAILURES_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
