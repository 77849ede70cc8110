//! Collection dump endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use doc_store::{Collection, Document, TransactionalStore, TransactionalStoreExt};
use orders::collections;
use serde_json::Value;

use super::AppState;
use crate::error::ApiError;

/// GET /collections/{name}: every document of one of the workflow's collections.
#[tracing::instrument(skip(state))]
pub async fn dump<S: TransactionalStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Value>>, ApiError> {
    if !collections::ALL.contains(&name.as_str()) {
        return Err(ApiError::NotFound(format!("Unknown collection '{name}'")));
    }

    let documents = state.store().find_all(&Collection::new(name)).await?;
    Ok(Json(
        documents.into_iter().map(Document::into_value).collect(),
    ))
}
