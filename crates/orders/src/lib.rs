//! Order placement over a transactional document store.
//!
//! [`OrderPlacementWorkflow`] inserts an order, decrements inventory for
//! every cart item, and links the order to its customer in one
//! transaction. Transient failures are retried under a [`RetryPolicy`];
//! ambiguous commits are resolved by looking the order up by request ID.

pub mod error;
pub mod fixtures;
pub mod model;
pub mod retry;
pub mod workflow;

pub use error::{ErrorKind, PlacementError};
pub use model::{
    CartItem, CustomerRecord, InventoryRecord, Order, Payment, PlacementRequest, Sku, collections,
};
pub use retry::RetryPolicy;
pub use workflow::{OrderPlacementWorkflow, PlacementStage};
