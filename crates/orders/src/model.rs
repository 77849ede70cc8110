//! Records read and written by the order placement workflow.

use chrono::{DateTime, Utc};
use common::{DocumentId, Money};
use doc_store::Collection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Collection names used by the workflow.
pub mod collections {
    pub const ORDERS: &str = "orders";
    pub const INVENTORY: &str = "inventory";
    pub const CUSTOMERS: &str = "customers";

    /// Every collection the workflow touches.
    pub const ALL: [&str; 3] = [CUSTOMERS, INVENTORY, ORDERS];
}

pub(crate) fn orders() -> Collection {
    Collection::new(collections::ORDERS)
}

pub(crate) fn inventory() -> Collection {
    Collection::new(collections::INVENTORY)
}

pub(crate) fn customers() -> Collection {
    Collection::new(collections::CUSTOMERS)
}

/// Stock keeping unit identifying an inventory item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sku(String);

impl Sku {
    /// Creates a SKU from a string.
    pub fn new(sku: impl Into<String>) -> Self {
        Self(sku.into())
    }

    /// Returns the SKU as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A SKU is well-formed when it is non-empty and has no surrounding whitespace.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty() && self.0.trim() == self.0
    }
}

impl std::fmt::Display for Sku {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Sku {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u32> for Sku {
    fn from(n: u32) -> Self {
        Self(n.to_string())
    }
}

/// A line of a shopping cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub sku: Sku,
    /// Human-readable product name.
    #[serde(default)]
    pub name: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl CartItem {
    /// Creates a new cart item.
    pub fn new(
        sku: impl Into<Sku>,
        name: impl Into<String>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        Self {
            sku: sku.into(),
            name: name.into(),
            quantity,
            unit_price,
        }
    }

    /// Returns quantity * unit_price.
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}

/// Payment details for a cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub customer_id: DocumentId,
    pub total: Money,
}

impl Payment {
    pub fn new(customer_id: DocumentId, total: Money) -> Self {
        Self { customer_id, total }
    }
}

/// A placed order. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub customer_id: DocumentId,
    pub items: Vec<CartItem>,
    pub total: Money,
    /// Idempotency key of the request that placed this order.
    pub request_id: Uuid,
    pub placed_at: DateTime<Utc>,
}

impl Order {
    pub const REQUEST_ID_FIELD: &'static str = "request_id";

    /// Creates an order for a request with a freshly generated ID.
    pub fn new(request: &PlacementRequest) -> Self {
        Self {
            id: DocumentId::new(),
            customer_id: request.payment.customer_id,
            items: request.cart.clone(),
            total: request.payment.total,
            request_id: request.request_id,
            placed_at: Utc::now(),
        }
    }
}

/// Stock on hand for one SKU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub sku: Sku,
    #[serde(default)]
    pub name: String,
    pub quantity_on_hand: u32,
}

impl InventoryRecord {
    pub const SKU_FIELD: &'static str = "sku";
    pub const QUANTITY_FIELD: &'static str = "quantity_on_hand";

    pub fn new(sku: impl Into<Sku>, name: impl Into<String>, quantity_on_hand: u32) -> Self {
        Self {
            id: DocumentId::new(),
            sku: sku.into(),
            name: name.into(),
            quantity_on_hand,
        }
    }
}

/// A customer and the orders they placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRecord {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    #[serde(default)]
    pub order_ids: Vec<DocumentId>,
}

impl CustomerRecord {
    pub const ORDER_IDS_FIELD: &'static str = "order_ids";

    /// Creates a customer with no orders.
    pub fn new(id: DocumentId) -> Self {
        Self {
            id,
            order_ids: Vec::new(),
        }
    }
}

/// One logical order placement request.
///
/// The request ID stays the same across retries, so an order committed by an
/// attempt whose outcome was lost can be found again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRequest {
    pub request_id: Uuid,
    pub cart: Vec<CartItem>,
    pub payment: Payment,
}

impl PlacementRequest {
    /// Creates a request with a new random request ID.
    pub fn new(cart: Vec<CartItem>, payment: Payment) -> Self {
        Self::with_request_id(Uuid::new_v4(), cart, payment)
    }

    /// Creates a request with a caller-supplied idempotency key.
    pub fn with_request_id(request_id: Uuid, cart: Vec<CartItem>, payment: Payment) -> Self {
        Self {
            request_id,
            cart,
            payment,
        }
    }
}
