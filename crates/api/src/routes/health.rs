//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use doc_store::{Filter, TransactionalStore};
use orders::collections;
use serde::Serialize;

use super::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
}

/// GET /health: reports whether the document store answers reads.
pub async fn check<S: TransactionalStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> (StatusCode, Json<HealthResponse>) {
    let probe = state
        .store()
        .find_one(&collections::CUSTOMERS.into(), &Filter::new())
        .await;

    match probe {
        Ok(_) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                store: "ok",
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "health probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    store: "unavailable",
                }),
            )
        }
    }
}
