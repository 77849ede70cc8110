//! Prometheus metrics endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{Unit, describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// GET /metrics: returns Prometheus-formatted metrics.
pub async fn get(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}

/// Registers help text for the placement and store metrics.
pub fn describe() {
    describe_counter!("order_placements_total", "Order placement requests received");
    describe_counter!("order_placements_succeeded", "Orders committed");
    describe_counter!(
        "order_placements_failed",
        "Order placements that failed, by error kind"
    );
    describe_counter!(
        "order_placement_retries_total",
        "Placement attempts retried after a transient or unapplied failure"
    );
    describe_histogram!(
        "order_placement_duration_seconds",
        Unit::Seconds,
        "Time to place an order, including retries"
    );
    describe_counter!("doc_store_commits_total", "Transactions committed");
    describe_counter!("doc_store_aborts_total", "Transactions aborted");
    describe_counter!(
        "doc_store_write_conflicts_total",
        "Writes rejected because another transaction owns the document"
    );
    describe_counter!("api_errors_total", "Error responses, by HTTP status");
}
