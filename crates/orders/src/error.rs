//! Order placement error types.

use common::DocumentId;
use doc_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

use crate::model::Sku;

/// How a caller should treat a failed placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself cannot succeed as given. Never retried.
    BusinessRule,
    /// The store reported contention; retrying the whole transaction may succeed.
    Transient,
    /// The commit may or may not have been applied.
    Ambiguous,
    /// Any other store failure.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BusinessRule => "business_rule",
            ErrorKind::Transient => "transient",
            ErrorKind::Ambiguous => "ambiguous",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while placing an order.
///
/// Every variant is returned only after the transaction was aborted and the
/// session ended.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// The cart or payment violates a precondition.
    #[error("Invalid cart: {0}")]
    InvalidCart(String),

    /// The SKU is unknown or has fewer units on hand than requested.
    #[error("Insufficient quantity or SKU not found: {sku}")]
    InsufficientInventory { sku: Sku },

    /// The paying customer does not exist.
    #[error("Customer not found: {0}")]
    CustomerNotFound(DocumentId),

    /// A conflict or expiry the store expects to clear on retry.
    #[error("Transient store error: {0}")]
    TransientStore(#[source] StoreError),

    /// Another attempt already committed an order for this request.
    ///
    /// Resolved by looking the order up; retried if it cannot be found.
    #[error("Order already placed for request {request_id}: {source}")]
    DuplicateRequest {
        request_id: Uuid,
        source: StoreError,
    },

    /// The store could not confirm whether the commit was applied.
    #[error("Commit outcome unknown for order {order_id}: {source}")]
    AmbiguousCommit {
        order_id: DocumentId,
        source: StoreError,
    },

    /// Any other store failure.
    #[error("Store error: {0}")]
    FatalStore(#[source] StoreError),
}

impl PlacementError {
    /// Classifies the error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlacementError::InvalidCart(_)
            | PlacementError::InsufficientInventory { .. }
            | PlacementError::CustomerNotFound(_) => ErrorKind::BusinessRule,
            PlacementError::TransientStore(_) | PlacementError::DuplicateRequest { .. } => {
                ErrorKind::Transient
            }
            PlacementError::AmbiguousCommit { .. } => ErrorKind::Ambiguous,
            PlacementError::FatalStore(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true for errors a retry of the whole request may resolve.
    ///
    /// An ambiguous commit is not retryable as such. Once a lookup shows the
    /// order was not created it is reported as a transient error instead.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<StoreError> for PlacementError {
    fn from(e: StoreError) -> Self {
        if e.is_transient() {
            PlacementError::TransientStore(e)
        } else {
            PlacementError::FatalStore(e)
        }
    }
}
