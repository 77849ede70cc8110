//! HTTP API server with observability for transactional order placement.
//!
//! Provides REST endpoints to place orders and inspect the store, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use doc_store::TransactionalStore;
use metrics_exporter_prometheus::PrometheusHandle;
use orders::OrderPlacementWorkflow;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: TransactionalStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/orders", post(routes::orders::place::<S>))
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .route("/customers/{id}", get(routes::customers::get::<S>))
        .route("/inventory/{sku}", get(routes::inventory::get::<S>))
        .route("/collections/{name}", get(routes::collections::dump::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state: a placement workflow configured from `config`.
pub fn create_default_state<S: TransactionalStore>(store: S, config: &Config) -> Arc<AppState<S>> {
    let workflow = OrderPlacementWorkflow::new(store, config.retry)
        .with_transaction_options(config.transaction_options());
    AppState::new(workflow)
}
