use thiserror::Error;

use crate::{Collection, DocumentId};

/// SQLSTATE codes PostgreSQL uses for conflicts that succeed on retry.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
/// Raised when `statement_timeout`, which bounds a transaction's lifetime, fires.
pub(crate) const QUERY_CANCELED: &str = "57014";

/// Errors that can occur when interacting with a document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another transaction wrote the document after this transaction's
    /// snapshot was taken, or holds an uncommitted write on it.
    #[error("Write conflict on {collection}/{id}")]
    WriteConflict {
        collection: Collection,
        id: DocumentId,
    },

    /// The transaction outlived its configured lifetime and was aborted.
    #[error("Transaction exceeded its lifetime of {max_lifetime_ms}ms and was aborted")]
    TransactionExpired { max_lifetime_ms: u128 },

    /// A transactional operation was issued with no transaction in progress.
    #[error("No transaction in progress")]
    NoTransaction,

    /// A transaction was started while another one is still open on the session.
    #[error("Transaction already in progress")]
    TransactionInProgress,

    /// A document with the same ID already exists in the collection.
    #[error("Duplicate key {id} in {collection}")]
    DuplicateKey {
        collection: Collection,
        id: DocumentId,
    },

    /// Another committed document already holds the value of a unique field.
    #[error("Unique index {index} violated in {collection}")]
    UniqueViolation {
        collection: Collection,
        index: String,
    },

    /// A unique index cannot be created with the given names.
    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    /// A document body is not a JSON object.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// An update cannot be applied to the matched document.
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true if retrying the whole transaction from the start may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::WriteConflict { .. } | StoreError::TransactionExpired { .. } => true,
            StoreError::Database(sqlx::Error::Database(db_err)) => matches!(
                db_err.code().as_deref(),
                Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) | Some(QUERY_CANCELED)
            ),
            _ => false,
        }
    }

    /// Returns true if the error means the connection to the store was lost,
    /// so a commit in flight may or may not have been applied.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
