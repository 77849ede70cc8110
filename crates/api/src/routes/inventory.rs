//! Inventory lookup endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use doc_store::{Filter, TransactionalStore};
use orders::{InventoryRecord, Sku, collections};
use serde_json::Value;

use super::AppState;
use crate::error::ApiError;

/// GET /inventory/{sku}: fetch the stock record for a SKU.
#[tracing::instrument(skip(state))]
pub async fn get<S: TransactionalStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(sku): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let filter = Filter::new().eq(InventoryRecord::SKU_FIELD, Sku::new(sku.as_str()));
    let doc = state
        .store()
        .find_one(&collections::INVENTORY.into(), &filter)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("SKU {sku} not found")))?;
    Ok(Json(doc.into_value()))
}
