//! Order placement and lookup endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::Money;
use doc_store::{TransactionalStore, TransactionalStoreExt};
use orders::{CartItem, Payment, PlacementRequest, collections};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AppState, parse_document_id};
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct PlaceOrderRequest {
    pub customer_id: String,
    pub items: Vec<CartItemRequest>,
    pub total_cents: i64,
    /// Idempotency key; a fresh one is generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Deserialize)]
pub struct CartItemRequest {
    pub sku: String,
    #[serde(default)]
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

// -- Response types --

#[derive(Serialize)]
pub struct OrderPlacedResponse {
    pub order_id: String,
}

// -- Handlers --

/// POST /orders: place an order atomically.
#[tracing::instrument(skip(state, req))]
pub async fn place<S: TransactionalStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<OrderPlacedResponse>), ApiError> {
    let customer_id = parse_document_id(&req.customer_id)?;
    let cart: Vec<CartItem> = req
        .items
        .into_iter()
        .map(|item| {
            CartItem::new(
                item.sku.as_str(),
                item.name,
                item.quantity,
                Money::from_cents(item.unit_price_cents),
            )
        })
        .collect();
    let payment = Payment::new(customer_id, Money::from_cents(req.total_cents));

    let request = match req.request_id {
        Some(key) => {
            let request_id = uuid::Uuid::parse_str(&key)
                .map_err(|e| ApiError::BadRequest(format!("Invalid request_id: {e}")))?;
            PlacementRequest::with_request_id(request_id, cart, payment)
        }
        None => PlacementRequest::new(cart, payment),
    };

    let order_id = state.workflow.place_request(&request).await?;

    Ok((
        StatusCode::CREATED,
        Json(OrderPlacedResponse {
            order_id: order_id.to_string(),
        }),
    ))
}

/// GET /orders/{id}: fetch an order document.
#[tracing::instrument(skip(state))]
pub async fn get<S: TransactionalStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let order_id = parse_document_id(&id)?;
    let doc = state
        .store()
        .find_by_id(&collections::ORDERS.into(), order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))?;
    Ok(Json(doc.into_value()))
}
