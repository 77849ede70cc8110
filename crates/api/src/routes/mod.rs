//! HTTP route handlers.

pub mod collections;
pub mod customers;
pub mod health;
pub mod inventory;
pub mod metrics;
pub mod orders;

use std::sync::Arc;

use common::DocumentId;
use doc_store::TransactionalStore;
use ::orders::OrderPlacementWorkflow;

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S: TransactionalStore> {
    pub workflow: OrderPlacementWorkflow<S>,
}

impl<S: TransactionalStore> AppState<S> {
    pub fn new(workflow: OrderPlacementWorkflow<S>) -> Arc<Self> {
        Arc::new(Self { workflow })
    }

    /// Returns the store the workflow writes to.
    pub fn store(&self) -> &S {
        self.workflow.store()
    }
}

pub(crate) fn parse_document_id(id: &str) -> Result<DocumentId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID '{id}': {e}")))
}
