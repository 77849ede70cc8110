use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;

use crate::store::{
    CommitOutcome, DocumentStream, ReadConcern, StoreSession, TransactionOptions,
    TransactionalStore, UpdateOutcome, unique_index_name,
};
use crate::{Collection, Document, DocumentId, Filter, Result, StoreError, Update};

type TxnId = u64;

#[derive(Debug, Clone)]
struct StoredDocument {
    document: Document,
    /// Commit sequence number of the last write to this document.
    committed_at: u64,
}

type Collections = HashMap<Collection, BTreeMap<DocumentId, StoredDocument>>;

/// A unique field and one of its values, rendered as compact JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UniqueKey {
    collection: Collection,
    field: String,
    value: String,
}

impl UniqueKey {
    fn held_by(&self, document: &Document) -> bool {
        document
            .get(&self.field)
            .is_some_and(|value| value.to_string() == self.value)
    }

    fn violation(&self) -> StoreError {
        StoreError::UniqueViolation {
            collection: self.collection.clone(),
            index: unique_index_name(&self.collection, &self.field),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    collections: Collections,
    commit_seq: u64,
    next_txn_id: TxnId,
    /// Uncommitted writes, keyed by document, owned by one transaction each.
    write_intents: HashMap<(Collection, DocumentId), TxnId>,
    unique_fields: HashMap<Collection, BTreeSet<String>>,
    /// Unique values inserted by open transactions.
    unique_claims: HashMap<UniqueKey, TxnId>,
}

impl StoreState {
    fn release(&mut self, txn_id: TxnId) {
        self.write_intents.retain(|_, owner| *owner != txn_id);
        self.unique_claims.retain(|_, owner| *owner != txn_id);
    }

    fn unique_keys(&self, collection: &Collection, document: &Document) -> Vec<UniqueKey> {
        self.unique_fields
            .get(collection)
            .into_iter()
            .flatten()
            .filter_map(|field| match document.get(field) {
                None | Some(serde_json::Value::Null) => None,
                Some(value) => Some(UniqueKey {
                    collection: collection.clone(),
                    field: field.clone(),
                    value: value.to_string(),
                }),
            })
            .collect()
    }

    fn committed_holder(&self, key: &UniqueKey) -> bool {
        self.collections
            .get(&key.collection)
            .is_some_and(|docs| docs.values().any(|stored| key.held_by(&stored.document)))
    }

    fn committed(&self, collection: &Collection, id: DocumentId) -> Option<&StoredDocument> {
        self.collections.get(collection).and_then(|docs| docs.get(&id))
    }
}

/// A failure to inject into the next commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitFault {
    /// The commit is rejected and nothing is applied.
    Fail,
    /// The commit is applied but its acknowledgement is lost.
    AmbiguousApplied,
    /// The connection drops before the commit reaches the store.
    AmbiguousNotApplied,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    write_conflicts: u32,
    commit: Option<CommitFault>,
}

/// In-memory transactional document store.
///
/// Transactions read from a snapshot taken when they start and detect
/// write-write conflicts eagerly: the first transaction to write a document
/// owns it until it commits or aborts, and a transaction may not write a
/// document committed after its snapshot. Both cases fail with
/// [`StoreError::WriteConflict`] and abort the losing transaction.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    faults: Arc<Mutex<Faults>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults().unavailable = unavailable;
    }

    /// Makes the next `count` transactional writes fail with a write conflict.
    pub fn inject_write_conflicts(&self, count: u32) {
        self.faults().write_conflicts = count;
    }

    /// Makes the next commit fail in the given way.
    pub fn fail_next_commit(&self, fault: CommitFault) {
        self.faults().commit = Some(fault);
    }

    /// Returns the number of committed documents in a collection.
    pub fn document_count(&self, collection: &Collection) -> usize {
        self.state()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Returns the number of documents currently locked by open transactions.
    pub fn pending_write_count(&self) -> usize {
        self.state().write_intents.len()
    }

    /// Removes all collections and pending writes.
    pub fn clear(&self) {
        *self.state() = StoreState::default();
    }

    // A panic while holding the lock never leaves the state half-written:
    // every mutation is a single insert or retain.
    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.faults().unavailable {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn take_injected_conflict(&self) -> bool {
        let mut faults = self.faults();
        if faults.write_conflicts > 0 {
            faults.write_conflicts -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    type Session = InMemorySession;

    async fn start_session(&self) -> Result<InMemorySession> {
        self.check_available()?;
        Ok(InMemorySession {
            store: self.clone(),
            txn: None,
        })
    }

    async fn insert_one(&self, collection: &Collection, document: Document) -> Result<DocumentId> {
        self.check_available()?;
        let id = document.id();
        let key = (collection.clone(), id);

        let mut state = self.state();
        if state.committed(collection, id).is_some() {
            return Err(StoreError::DuplicateKey {
                collection: collection.clone(),
                id,
            });
        }
        if state.write_intents.contains_key(&key) {
            return Err(StoreError::WriteConflict {
                collection: collection.clone(),
                id,
            });
        }
        for unique in state.unique_keys(collection, &document) {
            if state.committed_holder(&unique) {
                return Err(unique.violation());
            }
            if state.unique_claims.contains_key(&unique) {
                return Err(StoreError::WriteConflict {
                    collection: collection.clone(),
                    id,
                });
            }
        }

        state.commit_seq += 1;
        let committed_at = state.commit_seq;
        state
            .collections
            .entry(collection.clone())
            .or_default()
            .insert(
                id,
                StoredDocument {
                    document,
                    committed_at,
                },
            );
        Ok(id)
    }

    async fn find_one(&self, collection: &Collection, filter: &Filter) -> Result<Option<Document>> {
        self.check_available()?;
        let state = self.state();
        Ok(state.collections.get(collection).and_then(|docs| {
            docs.values()
                .map(|stored| &stored.document)
                .find(|doc| filter.matches(doc))
                .cloned()
        }))
    }

    async fn scan(&self, collection: &Collection) -> Result<DocumentStream> {
        use futures_util::stream;

        self.check_available()?;
        let documents: Vec<Document> = self
            .state()
            .collections
            .get(collection)
            .map(|docs| docs.values().map(|s| s.document.clone()).collect())
            .unwrap_or_default();

        Ok(Box::pin(stream::iter(documents.into_iter().map(Ok))))
    }

    async fn drop_collection(&self, collection: &Collection) -> Result<()> {
        self.check_available()?;
        let mut state = self.state();
        state.collections.remove(collection);
        state.commit_seq += 1;
        Ok(())
    }

    async fn create_unique_index(&self, collection: &Collection, field: &str) -> Result<()> {
        self.check_available()?;
        self.state()
            .unique_fields
            .entry(collection.clone())
            .or_default()
            .insert(field.to_string());
        Ok(())
    }
}

#[derive(Debug)]
struct InMemoryTransaction {
    id: TxnId,
    options: TransactionOptions,
    started: Instant,
    snapshot_seq: u64,
    /// Committed state as of the start, only kept for snapshot reads.
    snapshot: Collections,
    /// Documents written by this transaction, not yet visible to others.
    writes: HashMap<Collection, BTreeMap<DocumentId, Document>>,
}

impl InMemoryTransaction {
    fn own_write(&self, collection: &Collection, id: DocumentId) -> Option<&Document> {
        self.writes.get(collection).and_then(|docs| docs.get(&id))
    }
}

/// A session on an [`InMemoryStore`].
#[derive(Debug)]
pub struct InMemorySession {
    store: InMemoryStore,
    txn: Option<InMemoryTransaction>,
}

impl InMemorySession {
    /// Returns the open transaction, aborting it first if it outlived its bound.
    fn active(&mut self) -> Result<&mut InMemoryTransaction> {
        let expired = match &self.txn {
            None => return Err(StoreError::NoTransaction),
            Some(txn) => txn.started.elapsed() > txn.options.max_lifetime,
        };

        if expired && let Some(txn) = self.txn.take() {
            self.store.state().release(txn.id);
            tracing::debug!(txn_id = txn.id, "transaction expired");
            return Err(StoreError::TransactionExpired {
                max_lifetime_ms: txn.options.max_lifetime.as_millis(),
            });
        }

        self.txn.as_mut().ok_or(StoreError::NoTransaction)
    }

    /// Aborts the open transaction and returns the given conflict error.
    fn conflict(&mut self, collection: &Collection, id: DocumentId) -> StoreError {
        if let Some(txn) = self.txn.take() {
            self.store.state().release(txn.id);
        }
        metrics::counter!("doc_store_write_conflicts_total").increment(1);
        tracing::debug!(%collection, %id, "write conflict");
        StoreError::WriteConflict {
            collection: collection.clone(),
            id,
        }
    }

    /// Returns the first matching document visible to the transaction.
    fn visible_match(
        &self,
        txn: &InMemoryTransaction,
        collection: &Collection,
        filter: &Filter,
    ) -> Option<Document> {
        let state;
        let base = match txn.options.read_concern {
            ReadConcern::Snapshot => txn.snapshot.get(collection),
            ReadConcern::Local => {
                state = self.store.state();
                state.collections.get(collection)
            }
        };

        let mut visible: BTreeMap<DocumentId, &Document> = base
            .into_iter()
            .flatten()
            .map(|(id, stored)| (*id, &stored.document))
            .collect();
        if let Some(own) = txn.writes.get(collection) {
            visible.extend(own.iter().map(|(id, doc)| (*id, doc)));
        }

        visible.into_values().find(|doc| filter.matches(doc)).cloned()
    }

    /// Claims the write intent on a document for the open transaction.
    ///
    /// Inserts skip the staleness check: the caller already verified the ID is free.
    fn claim(&mut self, collection: &Collection, id: DocumentId, inserting: bool) -> Result<()> {
        let txn = self.active()?;
        let (txn_id, snapshot_seq, read_concern) =
            (txn.id, txn.snapshot_seq, txn.options.read_concern);
        let own_insert = inserting
            || txn.own_write(collection, id).is_some()
            && txn
                .snapshot
                .get(collection)
                .is_none_or(|docs| !docs.contains_key(&id));

        let conflicted = {
            let mut state = self.store.state();
            let key = (collection.clone(), id);
            let held_by_other = state
                .write_intents
                .get(&key)
                .is_some_and(|owner| *owner != txn_id);
            let stale = !own_insert
                && match state.committed(collection, id) {
                    None => true,
                    Some(stored) => {
                        read_concern == ReadConcern::Snapshot && stored.committed_at > snapshot_seq
                    }
                };

            if held_by_other || stale {
                true
            } else {
                state.write_intents.insert(key, txn_id);
                false
            }
        };

        if conflicted || self.store.take_injected_conflict() {
            return Err(self.conflict(collection, id));
        }
        Ok(())
    }

    /// Claims every unique value of a document being inserted.
    ///
    /// A value already committed is a [`StoreError::UniqueViolation`]; a
    /// value inserted by another open transaction is a write conflict.
    fn claim_unique(&mut self, collection: &Collection, document: &Document) -> Result<()> {
        let keys = self.store.state().unique_keys(collection, document);
        if keys.is_empty() {
            return Ok(());
        }

        let txn = self.active()?;
        let txn_id = txn.id;
        if let Some(key) = keys.iter().find(|key| {
            txn.writes
                .get(collection)
                .is_some_and(|docs| docs.values().any(|doc| key.held_by(doc)))
        }) {
            return Err(key.violation());
        }

        let held_by_other = {
            let mut state = self.store.state();
            if let Some(key) = keys.iter().find(|key| state.committed_holder(key)) {
                return Err(key.violation());
            }
            let held = keys.iter().any(|key| {
                state
                    .unique_claims
                    .get(key)
                    .is_some_and(|owner| *owner != txn_id)
            });
            if !held {
                for key in keys {
                    state.unique_claims.insert(key, txn_id);
                }
            }
            held
        };

        if held_by_other {
            return Err(self.conflict(collection, document.id()));
        }
        Ok(())
    }

    fn abort_now(&mut self) -> bool {
        match self.txn.take() {
            Some(txn) => {
                self.store.state().release(txn.id);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl StoreSession for InMemorySession {
    async fn start_transaction(&mut self, options: TransactionOptions) -> Result<()> {
        if self.txn.is_some() {
            return Err(StoreError::TransactionInProgress);
        }
        self.store.check_available()?;

        let mut state = self.store.state();
        state.next_txn_id += 1;
        let snapshot = match options.read_concern {
            ReadConcern::Snapshot => state.collections.clone(),
            ReadConcern::Local => Collections::new(),
        };
        self.txn = Some(InMemoryTransaction {
            id: state.next_txn_id,
            options,
            started: Instant::now(),
            snapshot_seq: state.commit_seq,
            snapshot,
            writes: HashMap::new(),
        });
        Ok(())
    }

    async fn insert_one(
        &mut self,
        collection: &Collection,
        document: Document,
    ) -> Result<DocumentId> {
        tokio::task::yield_now().await;
        self.store.check_available()?;
        let id = document.id();

        let txn = self.active()?;
        let exists_in_view = txn.own_write(collection, id).is_some()
            || txn
                .snapshot
                .get(collection)
                .is_some_and(|docs| docs.contains_key(&id));
        if exists_in_view || self.store.state().committed(collection, id).is_some() {
            return Err(StoreError::DuplicateKey {
                collection: collection.clone(),
                id,
            });
        }

        self.claim(collection, id, true)?;
        self.claim_unique(collection, &document)?;
        let txn = self.active()?;
        txn.writes
            .entry(collection.clone())
            .or_default()
            .insert(id, document);
        Ok(id)
    }

    async fn find_one(
        &mut self,
        collection: &Collection,
        filter: &Filter,
    ) -> Result<Option<Document>> {
        tokio::task::yield_now().await;
        self.store.check_available()?;
        self.active()?;

        let txn = self.txn.as_ref().ok_or(StoreError::NoTransaction)?;
        Ok(self.visible_match(txn, collection, filter))
    }

    async fn update_one(
        &mut self,
        collection: &Collection,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateOutcome> {
        tokio::task::yield_now().await;
        self.store.check_available()?;
        self.active()?;

        let txn = self.txn.as_ref().ok_or(StoreError::NoTransaction)?;
        let Some(mut document) = self.visible_match(txn, collection, filter) else {
            return Ok(UpdateOutcome::default());
        };

        let id = document.id();
        self.claim(collection, id, false)?;

        let modified = update.apply(document.body_mut())?;
        if modified {
            let txn = self.active()?;
            txn.writes
                .entry(collection.clone())
                .or_default()
                .insert(id, document);
        }

        Ok(UpdateOutcome {
            matched: 1,
            modified: u64::from(modified),
        })
    }

    async fn commit_transaction(&mut self) -> CommitOutcome {
        tokio::task::yield_now().await;
        if let Err(e) = self.active() {
            return CommitOutcome::Failed(e);
        }
        let Some(txn) = self.txn.take() else {
            return CommitOutcome::Failed(StoreError::NoTransaction);
        };

        let (unavailable, fault) = {
            let mut faults = self.store.faults();
            (faults.unavailable, faults.commit.take())
        };

        if unavailable {
            self.store.state().release(txn.id);
            return CommitOutcome::Ambiguous(StoreError::Unavailable(
                "connection lost during commit".to_string(),
            ));
        }

        match fault {
            Some(CommitFault::Fail) => {
                self.store.state().release(txn.id);
                return CommitOutcome::Failed(StoreError::Unavailable(
                    "commit rejected by store".to_string(),
                ));
            }
            Some(CommitFault::AmbiguousNotApplied) => {
                self.store.state().release(txn.id);
                return CommitOutcome::Ambiguous(StoreError::Unavailable(
                    "connection reset before commit reached the store".to_string(),
                ));
            }
            Some(CommitFault::AmbiguousApplied) | None => {}
        }

        {
            let mut state = self.store.state();
            state.commit_seq += 1;
            let committed_at = state.commit_seq;
            for (collection, documents) in txn.writes {
                let target = state.collections.entry(collection).or_default();
                for (id, document) in documents {
                    target.insert(
                        id,
                        StoredDocument {
                            document,
                            committed_at,
                        },
                    );
                }
            }
            state.release(txn.id);
        }
        metrics::counter!("doc_store_commits_total").increment(1);

        if fault == Some(CommitFault::AmbiguousApplied) {
            return CommitOutcome::Ambiguous(StoreError::Unavailable(
                "commit acknowledgement lost".to_string(),
            ));
        }
        CommitOutcome::Committed
    }

    async fn abort_transaction(&mut self) -> Result<()> {
        if self.abort_now() {
            metrics::counter!("doc_store_aborts_total").increment(1);
        }
        Ok(())
    }

    async fn end_session(mut self) -> Result<()> {
        self.abort_transaction().await
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if self.abort_now() {
            tracing::debug!("session dropped with an open transaction, aborted");
        }
    }
}
