use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::TryStreamExt;

use crate::{Collection, Document, DocumentId, Filter, Result, StoreError, Update};

/// Default bound on how long a transaction may stay open.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(60);

/// Which committed data reads inside a transaction observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadConcern {
    /// Reads see the latest committed data at the time of each read.
    Local,
    /// Reads see a consistent point-in-time view taken when the transaction starts.
    #[default]
    Snapshot,
}

/// How durable a commit must be before it is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteConcern {
    /// Acknowledged by the node that applied the write.
    Acknowledged,
    /// Acknowledged only once replicated to a majority of replicas.
    #[default]
    Majority,
}

/// Which replica serves reads inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    /// Transactions always read from the primary.
    #[default]
    Primary,
}

/// Options for starting a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    pub read_concern: ReadConcern,
    pub write_concern: WriteConcern,
    pub read_preference: ReadPreference,
    /// Operations issued after this much time fail and abort the transaction.
    pub max_lifetime: Duration,
}

impl TransactionOptions {
    /// Snapshot reads, majority writes, primary reads.
    pub fn snapshot_majority() -> Self {
        Self {
            read_concern: ReadConcern::Snapshot,
            write_concern: WriteConcern::Majority,
            read_preference: ReadPreference::Primary,
            max_lifetime: DEFAULT_MAX_LIFETIME,
        }
    }

    /// Overrides the transaction lifetime bound.
    pub fn max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self::snapshot_majority()
    }
}

/// Result of an `update_one` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOutcome {
    /// Number of documents matching the filter (0 or 1).
    pub matched: u64,
    /// Number of documents actually changed (0 or 1).
    pub modified: u64,
}

/// Result of committing a transaction.
#[derive(Debug)]
pub enum CommitOutcome {
    /// All writes are durably applied.
    Committed,
    /// The store could not confirm whether the commit was applied.
    Ambiguous(StoreError),
    /// The commit was not applied.
    Failed(StoreError),
}

/// A stream of documents.
pub type DocumentStream = Pin<Box<dyn Stream<Item = Result<Document>> + Send>>;

/// A logical session against the store.
///
/// A session carries at most one transaction at a time. All reads and writes
/// go through the open transaction; issuing them without one fails with
/// [`StoreError::NoTransaction`]. Dropping a session with an open transaction
/// aborts it.
#[async_trait]
pub trait StoreSession: Send {
    /// Starts a transaction on this session.
    async fn start_transaction(&mut self, options: TransactionOptions) -> Result<()>;

    /// Inserts a document and returns its ID.
    async fn insert_one(&mut self, collection: &Collection, document: Document)
    -> Result<DocumentId>;

    /// Returns the first document matching the filter, in ID order.
    async fn find_one(&mut self, collection: &Collection, filter: &Filter)
    -> Result<Option<Document>>;

    /// Applies an update to the first document matching the filter.
    async fn update_one(
        &mut self,
        collection: &Collection,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateOutcome>;

    /// Commits the open transaction.
    async fn commit_transaction(&mut self) -> CommitOutcome;

    /// Aborts the open transaction. Aborting with none open is a no-op.
    async fn abort_transaction(&mut self) -> Result<()>;

    /// Ends the session, aborting any open transaction.
    async fn end_session(self) -> Result<()>;
}

/// Core trait for transactional document stores.
///
/// Implementations must be thread-safe; each concurrent unit of work takes
/// its own session.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    type Session: StoreSession;

    /// Starts a new session.
    async fn start_session(&self) -> Result<Self::Session>;

    /// Inserts a document outside any transaction.
    async fn insert_one(&self, collection: &Collection, document: Document) -> Result<DocumentId>;

    /// Returns the first committed document matching the filter.
    async fn find_one(&self, collection: &Collection, filter: &Filter) -> Result<Option<Document>>;

    /// Streams every committed document of a collection in ID order.
    async fn scan(&self, collection: &Collection) -> Result<DocumentStream>;

    /// Removes a collection and all its documents.
    async fn drop_collection(&self, collection: &Collection) -> Result<()>;

    /// Makes `field` unique across the documents of a collection.
    ///
    /// Idempotent. Enforced when documents are inserted: an insert whose
    /// value for the field is already committed fails with
    /// [`StoreError::UniqueViolation`]. Documents without the field, or with
    /// a null value, are not indexed.
    async fn create_unique_index(&self, collection: &Collection, field: &str) -> Result<()>;
}

/// Name of the unique index on `field` of a collection.
pub fn unique_index_name(collection: &Collection, field: &str) -> String {
    format!("documents_{collection}_{field}_key")
}

/// Extension trait providing convenience methods for stores.
#[async_trait]
pub trait TransactionalStoreExt: TransactionalStore {
    /// Collects every document of a collection.
    async fn find_all(&self, collection: &Collection) -> Result<Vec<Document>> {
        self.scan(collection).await?.try_collect().await
    }

    /// Loads a document by ID.
    async fn find_by_id(&self, collection: &Collection, id: DocumentId) -> Result<Option<Document>> {
        self.find_one(collection, &Filter::by_id(id)).await
    }
}

// Blanket implementation for all TransactionalStore implementations
impl<T: TransactionalStore + ?Sized> TransactionalStoreExt for T {}
