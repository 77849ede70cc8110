//! Customer lookup endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use doc_store::{TransactionalStore, TransactionalStoreExt};
use orders::collections;
use serde_json::Value;

use super::{AppState, parse_document_id};
use crate::error::ApiError;

/// GET /customers/{id}: fetch a customer and the IDs of their orders.
#[tracing::instrument(skip(state))]
pub async fn get<S: TransactionalStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let customer_id = parse_document_id(&id)?;
    let doc = state
        .store()
        .find_by_id(&collections::CUSTOMERS.into(), customer_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Customer {id} not found")))?;
    Ok(Json(doc.into_value()))
}
