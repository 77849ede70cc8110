//! Transactional order placement.

use std::time::Instant;

use common::DocumentId;
use doc_store::{
    CommitOutcome, Document, Filter, StoreError, StoreSession, TransactionOptions,
    TransactionalStore, Update,
};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::error::PlacementError;
use crate::model::{
    self, CartItem, CustomerRecord, InventoryRecord, Order, Payment, PlacementRequest,
};
use crate::retry::RetryPolicy;

/// Progress of a single placement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStage {
    Idle,
    TransactionStarted,
    OrderInserted,
    /// Stock for the cart item at this index was checked and decremented.
    InventoryChecked(usize),
    CustomerLinked,
    Committed,
    Aborted,
}

impl std::fmt::Display for PlacementStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementStage::Idle => write!(f, "Idle"),
            PlacementStage::TransactionStarted => write!(f, "TransactionStarted"),
            PlacementStage::OrderInserted => write!(f, "OrderInserted"),
            PlacementStage::InventoryChecked(i) => write!(f, "InventoryChecked({i})"),
            PlacementStage::CustomerLinked => write!(f, "CustomerLinked"),
            PlacementStage::Committed => write!(f, "Committed"),
            PlacementStage::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Places orders as one atomic transaction each.
///
/// An order insert, the stock decrement of every cart item, and the link
/// from the customer to the order commit together or not at all. Each
/// attempt runs on its own session, so concurrent placements never share
/// transaction state; conflicts between them are detected by the store.
///
/// Orders carry the ID of the request that placed them, and the store keeps
/// that ID unique, so a request repeated by the caller or by a retry
/// resolves to the order already placed.
pub struct OrderPlacementWorkflow<S: TransactionalStore> {
    store: S,
    retry: RetryPolicy,
    options: TransactionOptions,
    request_index: OnceCell<()>,
}

impl<S: TransactionalStore> OrderPlacementWorkflow<S> {
    /// Creates a workflow with snapshot reads and majority writes.
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            options: TransactionOptions::snapshot_majority(),
            request_index: OnceCell::new(),
        }
    }

    /// Overrides the transaction options used for every attempt.
    pub fn with_transaction_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Places an order for the cart, charged to the payment's customer.
    ///
    /// Returns the ID of the new order.
    pub async fn place_order(
        &self,
        cart: &[CartItem],
        payment: &Payment,
    ) -> Result<DocumentId, PlacementError> {
        let request = PlacementRequest::new(cart.to_vec(), *payment);
        self.place_request(&request).await
    }

    /// Places an order, retrying transient failures under the retry policy.
    ///
    /// A request that already has an order returns that order's ID without
    /// placing another. After an ambiguous commit the order is looked up by
    /// request ID before anything is retried.
    #[tracing::instrument(
        skip(self, request),
        fields(
            request_id = %request.request_id,
            customer_id = %request.payment.customer_id,
            items = request.cart.len()
        )
    )]
    pub async fn place_request(
        &self,
        request: &PlacementRequest,
    ) -> Result<DocumentId, PlacementError> {
        metrics::counter!("order_placements_total").increment(1);
        let started = Instant::now();

        let result = self.retry_placement(request).await;

        metrics::histogram!("order_placement_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        match &result {
            Ok(order_id) => {
                metrics::counter!("order_placements_succeeded").increment(1);
                tracing::info!(%order_id, "order placed");
            }
            Err(e) => {
                metrics::counter!("order_placements_failed", "kind" => e.kind().as_str())
                    .increment(1);
                tracing::warn!(error = %e, kind = %e.kind(), "order placement failed");
            }
        }
        result
    }

    async fn retry_placement(
        &self,
        request: &PlacementRequest,
    ) -> Result<DocumentId, PlacementError> {
        validate(request)?;
        self.ensure_request_index().await?;

        if let Some(placed) = self.find_placed(request.request_id).await? {
            tracing::info!(order_id = %placed, "request already placed");
            return Ok(placed);
        }

        let mut attempt = 1;
        loop {
            let mut error = match self.place_order_once(request).await {
                Ok(order_id) => return Ok(order_id),
                Err(e) => e,
            };

            if matches!(
                error,
                PlacementError::AmbiguousCommit { .. } | PlacementError::DuplicateRequest { .. }
            ) {
                error = match self.reconcile(request.request_id, error).await {
                    Ok(placed) => return Ok(placed),
                    Err(e) => e,
                };
            }

            if !error.is_retryable() || !self.retry.allows_retry_after(attempt) {
                return Err(error);
            }

            let delay = self.retry.backoff(attempt);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying order placement"
            );
            metrics::counter!("order_placement_retries_total").increment(1);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Resolves an ambiguous commit or a duplicate request by looking the
    /// order up.
    ///
    /// An ambiguous commit whose order is not found was not applied and
    /// becomes a transient error. If the lookup itself fails the original
    /// error is returned unchanged.
    async fn reconcile(
        &self,
        request_id: Uuid,
        error: PlacementError,
    ) -> Result<DocumentId, PlacementError> {
        match self.find_placed(request_id).await {
            Ok(Some(placed)) => {
                tracing::info!(order_id = %placed, error = %error, "order already exists");
                Ok(placed)
            }
            Ok(None) => match error {
                PlacementError::AmbiguousCommit { order_id, source } => {
                    tracing::debug!(%order_id, "ambiguous commit was not applied");
                    Err(PlacementError::TransientStore(source))
                }
                other => Err(other),
            },
            Err(lookup) => {
                tracing::error!(
                    error = %error,
                    lookup_error = %lookup,
                    "cannot verify placement, manual reconciliation required"
                );
                Err(error)
            }
        }
    }

    /// Makes sure the store rejects a second order for one request ID.
    async fn ensure_request_index(&self) -> Result<(), PlacementError> {
        self.request_index
            .get_or_try_init(|| async {
                self.store
                    .create_unique_index(&model::orders(), Order::REQUEST_ID_FIELD)
                    .await
            })
            .await?;
        Ok(())
    }

    /// Looks up an order committed for the request, outside any transaction.
    pub async fn find_placed(
        &self,
        request_id: Uuid,
    ) -> Result<Option<DocumentId>, PlacementError> {
        let filter = Filter::new().eq(Order::REQUEST_ID_FIELD, request_id);
        let found = self
            .store
            .find_one(&model::orders(), &filter)
            .await
            .map_err(PlacementError::FatalStore)?;
        Ok(found.map(|doc| doc.id()))
    }

    /// Makes a single attempt at placing the order, without retries.
    ///
    /// On any failure the transaction is aborted; the session is ended on
    /// every path.
    #[tracing::instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn place_order_once(
        &self,
        request: &PlacementRequest,
    ) -> Result<DocumentId, PlacementError> {
        validate(request)?;

        let mut session = self.store.start_session().await?;
        let mut stage = PlacementStage::Idle;

        let result = self.run_transaction(&mut session, request, &mut stage).await;

        if let Err(e) = &result {
            tracing::debug!(%stage, error = %e, "aborting transaction");
            if let Err(abort_err) = session.abort_transaction().await {
                tracing::warn!(error = %abort_err, "abort failed");
            }
            stage = PlacementStage::Aborted;
        }
        if let Err(end_err) = session.end_session().await {
            tracing::warn!(error = %end_err, "ending session failed");
        }

        tracing::debug!(%stage, "placement attempt finished");
        result
    }

    async fn run_transaction(
        &self,
        session: &mut S::Session,
        request: &PlacementRequest,
        stage: &mut PlacementStage,
    ) -> Result<DocumentId, PlacementError> {
        let orders = model::orders();
        let inventory = model::inventory();
        let customers = model::customers();

        session.start_transaction(self.options).await?;
        *stage = PlacementStage::TransactionStarted;

        let order = Order::new(request);
        let order_id = session
            .insert_one(&orders, Document::encode(&order)?)
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation { .. } => PlacementError::DuplicateRequest {
                    request_id: request.request_id,
                    source: e,
                },
                other => other.into(),
            })?;
        *stage = PlacementStage::OrderInserted;

        // Each check must observe the decrements made for earlier items.
        for (index, item) in request.cart.iter().enumerate() {
            let in_stock = Filter::new()
                .eq(InventoryRecord::SKU_FIELD, &item.sku)
                .gte(InventoryRecord::QUANTITY_FIELD, item.quantity);

            let Some(record) = session.find_one(&inventory, &in_stock).await? else {
                return Err(PlacementError::InsufficientInventory {
                    sku: item.sku.clone(),
                });
            };

            let guarded = Filter::by_id(record.id())
                .gte(InventoryRecord::QUANTITY_FIELD, item.quantity);
            let decrement =
                Update::new().inc(InventoryRecord::QUANTITY_FIELD, -i64::from(item.quantity));
            let outcome = session.update_one(&inventory, &guarded, &decrement).await?;
            if outcome.matched == 0 {
                return Err(PlacementError::InsufficientInventory {
                    sku: item.sku.clone(),
                });
            }

            tracing::debug!(sku = %item.sku, quantity = item.quantity, "inventory decremented");
            *stage = PlacementStage::InventoryChecked(index);
        }

        let customer_id = request.payment.customer_id;
        let link = Update::new().push(CustomerRecord::ORDER_IDS_FIELD, order_id);
        let outcome = session
            .update_one(&customers, &Filter::by_id(customer_id), &link)
            .await?;
        if outcome.matched == 0 {
            return Err(PlacementError::CustomerNotFound(customer_id));
        }
        *stage = PlacementStage::CustomerLinked;

        match session.commit_transaction().await {
            CommitOutcome::Committed => {
                *stage = PlacementStage::Committed;
                Ok(order_id)
            }
            CommitOutcome::Ambiguous(source) => {
                Err(PlacementError::AmbiguousCommit { order_id, source })
            }
            CommitOutcome::Failed(e) => Err(e.into()),
        }
    }
}

/// Checks the preconditions that need no store access.
fn validate(request: &PlacementRequest) -> Result<(), PlacementError> {
    if request.cart.is_empty() {
        return Err(PlacementError::InvalidCart("cart is empty".to_string()));
    }
    for item in &request.cart {
        if !item.sku.is_well_formed() {
            return Err(PlacementError::InvalidCart(format!(
                "malformed sku '{}'",
                item.sku
            )));
        }
        if item.quantity == 0 {
            return Err(PlacementError::InvalidCart(format!(
                "quantity for sku {} must be positive",
                item.sku
            )));
        }
    }
    if request.payment.total.is_negative() {
        return Err(PlacementError::InvalidCart(
            "payment total is negative".to_string(),
        ));
    }
    Ok(())
}
