//! Sample data for demos, tests, and the `SEED_SAMPLE_DATA` switch of the API.

use std::collections::BTreeMap;

use common::{DocumentId, Money};
use doc_store::{Collection, Document, TransactionalStore, TransactionalStoreExt};
use serde_json::Value;

use crate::model::{CartItem, CustomerRecord, InventoryRecord, Payment, collections};

/// Fixed ID of the sample customer.
pub fn sample_customer_id() -> DocumentId {
    DocumentId::from_u128(98765)
}

/// Inventory seeded by [`seed_sample_data`].
pub fn sample_inventory() -> Vec<InventoryRecord> {
    vec![
        InventoryRecord::new(5432, "sunblock", 85),
        InventoryRecord::new(7865, "beach towel", 41),
    ]
}

/// Inserts the sample customer and inventory. Returns the customer ID.
#[tracing::instrument(skip(store))]
pub async fn seed_sample_data<S: TransactionalStore>(store: &S) -> doc_store::Result<DocumentId> {
    let customer = CustomerRecord::new(sample_customer_id());
    store
        .insert_one(
            &Collection::new(collections::CUSTOMERS),
            Document::encode(&customer)?,
        )
        .await?;

    let inventory = Collection::new(collections::INVENTORY);
    for record in sample_inventory() {
        store
            .insert_one(&inventory, Document::encode(&record)?)
            .await?;
    }

    tracing::info!(customer_id = %customer.id, "sample data seeded");
    Ok(customer.id)
}

/// One sunblock at 5.19 and two beach towels at 15.99.
pub fn sample_cart() -> Vec<CartItem> {
    vec![
        CartItem::new(5432, "sunblock", 1, Money::from_cents(519)),
        CartItem::new(7865, "beach towel", 2, Money::from_cents(1599)),
    ]
}

/// Payment for [`sample_cart`] by the sample customer.
pub fn sample_payment() -> Payment {
    let total = sample_cart().iter().map(CartItem::line_total).sum();
    Payment::new(sample_customer_id(), total)
}

/// Drops every collection the workflow uses.
///
/// A failure on one collection is logged and does not stop the others.
pub async fn clean_up<S: TransactionalStore>(store: &S) {
    for name in collections::ALL {
        if let Err(e) = store.drop_collection(&Collection::new(name)).await {
            tracing::warn!(collection = name, error = %e, "failed to drop collection");
        }
    }
}

/// Returns every document of every workflow collection, keyed by collection name.
pub async fn dump<S: TransactionalStore>(
    store: &S,
) -> doc_store::Result<BTreeMap<String, Vec<Value>>> {
    let mut out = BTreeMap::new();
    for name in collections::ALL {
        let documents = store.find_all(&Collection::new(name)).await?;
        out.insert(
            name.to_string(),
            documents.into_iter().map(Document::into_value).collect(),
        );
    }
    Ok(out)
}
