//! Shared identifiers and value types.

mod money;
mod types;

pub use money::Money;
pub use types::DocumentId;
