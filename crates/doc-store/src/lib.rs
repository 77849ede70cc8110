//! Transactional document store.
//!
//! A store holds JSON documents grouped into collections. Multi-document
//! writes go through a [`StoreSession`] transaction that commits or aborts
//! as one unit. Two backends are provided: [`InMemoryStore`] and
//! [`PostgresStore`].

pub mod document;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use common::DocumentId;
pub use document::{Collection, Document};
pub use error::{Result, StoreError};
pub use memory::{CommitFault, InMemorySession, InMemoryStore};
pub use postgres::{PostgresSession, PostgresStore};
pub use query::{Filter, Update};
pub use store::{
    CommitOutcome, DocumentStream, ReadConcern, ReadPreference, StoreSession, TransactionOptions,
    TransactionalStore, TransactionalStoreExt, UpdateOutcome, WriteConcern, unique_index_name,
};
