//! Integration tests for order placement against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use common::{DocumentId, Money};
use doc_store::{
    CommitFault, InMemoryStore, StoreError, TransactionOptions, TransactionalStoreExt,
};
use orders::{
    CartItem, CustomerRecord, ErrorKind, InventoryRecord, Order, OrderPlacementWorkflow, Payment,
    PlacementError, PlacementRequest, RetryPolicy, Sku, collections, fixtures,
};

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(5))
}

struct TestHarness {
    workflow: OrderPlacementWorkflow<InMemoryStore>,
    store: InMemoryStore,
    customer_id: DocumentId,
}

impl TestHarness {
    async fn new(retry: RetryPolicy) -> Self {
        let store = InMemoryStore::new();
        let customer_id = fixtures::seed_sample_data(&store).await.unwrap();
        Self {
            workflow: OrderPlacementWorkflow::new(store.clone(), retry),
            store,
            customer_id,
        }
    }

    async fn inventory(&self, sku: u32) -> Option<InventoryRecord> {
        let all = self
            .store
            .find_all(&collections::INVENTORY.into())
            .await
            .unwrap();
        all.iter()
            .map(|doc| doc.decode::<InventoryRecord>().unwrap())
            .find(|record| record.sku == Sku::from(sku))
    }

    async fn quantity(&self, sku: u32) -> u32 {
        self.inventory(sku).await.unwrap().quantity_on_hand
    }

    async fn customer(&self) -> CustomerRecord {
        self.store
            .find_by_id(&collections::CUSTOMERS.into(), self.customer_id)
            .await
            .unwrap()
            .unwrap()
            .decode()
            .unwrap()
    }

    async fn orders(&self) -> Vec<Order> {
        self.store
            .find_all(&collections::ORDERS.into())
            .await
            .unwrap()
            .iter()
            .map(|doc| doc.decode().unwrap())
            .collect()
    }

    fn one_sunblock(&self) -> (Vec<CartItem>, Payment) {
        (
            vec![CartItem::new(5432, "sunblock", 1, Money::from_cents(519))],
            Payment::new(self.customer_id, Money::from_cents(519)),
        )
    }
}

#[tokio::test]
async fn test_single_item_order_decrements_inventory() {
    let h = TestHarness::new(RetryPolicy::default()).await;
    let (cart, payment) = h.one_sunblock();

    let order_id = h.workflow.place_order(&cart, &payment).await.unwrap();

    assert_eq!(h.quantity(5432).await, 84);
    assert_eq!(h.quantity(7865).await, 41);

    let orders = h.orders().await;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, order_id);
    assert_eq!(orders[0].items, cart);
    assert_eq!(orders[0].total, Money::from_cents(519));
    assert_eq!(orders[0].customer_id, h.customer_id);

    assert_eq!(h.customer().await.order_ids, vec![order_id]);
}

#[tokio::test]
async fn test_sample_cart_decrements_every_item() {
    let h = TestHarness::new(RetryPolicy::default()).await;

    let order_id = h
        .workflow
        .place_order(&fixtures::sample_cart(), &fixtures::sample_payment())
        .await
        .unwrap();

    assert_eq!(h.quantity(5432).await, 84);
    assert_eq!(h.quantity(7865).await, 39);
    assert_eq!(h.orders().await[0].total, Money::from_cents(3717));
    assert_eq!(h.customer().await.order_ids, vec![order_id]);
}

#[tokio::test]
async fn test_consecutive_orders_accumulate_on_customer() {
    let h = TestHarness::new(RetryPolicy::default()).await;
    let (cart, payment) = h.one_sunblock();

    let first = h.workflow.place_order(&cart, &payment).await.unwrap();
    let second = h.workflow.place_order(&cart, &payment).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(h.quantity(5432).await, 83);
    assert_eq!(h.customer().await.order_ids, vec![first, second]);
}

#[tokio::test]
async fn test_unknown_sku_leaves_store_untouched() {
    let h = TestHarness::new(RetryPolicy::default()).await;
    let before = fixtures::dump(&h.store).await.unwrap();

    let cart = vec![CartItem::new(9999, "mystery", 1, Money::from_cents(100))];
    let payment = Payment::new(h.customer_id, Money::from_cents(100));
    let result = h.workflow.place_order(&cart, &payment).await;

    assert!(matches!(
        result,
        Err(PlacementError::InsufficientInventory { ref sku }) if *sku == Sku::from(9999)
    ));
    let after = fixtures::dump(&h.store).await.unwrap();
    assert_eq!(
        serde_json::to_string(&before).unwrap(),
        serde_json::to_string(&after).unwrap()
    );
    assert_eq!(h.store.pending_write_count(), 0);
}

#[tokio::test]
async fn test_insufficient_second_item_rolls_back_first() {
    let h = TestHarness::new(RetryPolicy::default()).await;
    let before = fixtures::dump(&h.store).await.unwrap();

    let cart = vec![
        CartItem::new(5432, "sunblock", 3, Money::from_cents(519)),
        CartItem::new(7865, "beach towel", 42, Money::from_cents(1599)),
    ];
    let payment = Payment::new(h.customer_id, Money::from_cents(3 * 519 + 42 * 1599));
    let result = h.workflow.place_order(&cart, &payment).await;

    assert!(matches!(
        result,
        Err(PlacementError::InsufficientInventory { ref sku }) if *sku == Sku::from(7865)
    ));
    assert_eq!(fixtures::dump(&h.store).await.unwrap(), before);
    assert_eq!(h.quantity(5432).await, 85);
}

#[tokio::test]
async fn test_exact_stock_can_be_bought() {
    let h = TestHarness::new(RetryPolicy::default()).await;
    let cart = vec![CartItem::new(7865, "beach towel", 41, Money::from_cents(1599))];
    let payment = Payment::new(h.customer_id, Money::from_cents(41 * 1599));

    h.workflow.place_order(&cart, &payment).await.unwrap();
    assert_eq!(h.quantity(7865).await, 0);

    let again = vec![CartItem::new(7865, "beach towel", 1, Money::from_cents(1599))];
    let result = h.workflow.place_order(&again, &payment).await;
    assert!(matches!(
        result,
        Err(PlacementError::InsufficientInventory { .. })
    ));
}

#[tokio::test]
async fn test_unknown_customer_rolls_back() {
    let h = TestHarness::new(RetryPolicy::default()).await;
    let before = fixtures::dump(&h.store).await.unwrap();
    let stranger = DocumentId::new();
    let cart = vec![CartItem::new(5432, "sunblock", 1, Money::from_cents(519))];

    let result = h
        .workflow
        .place_order(&cart, &Payment::new(stranger, Money::from_cents(519)))
        .await;

    assert!(matches!(result, Err(PlacementError::CustomerNotFound(id)) if id == stranger));
    assert_eq!(fixtures::dump(&h.store).await.unwrap(), before);
}

#[tokio::test]
async fn test_acknowledged_ambiguous_commit_is_not_duplicated() {
    let h = TestHarness::new(RetryPolicy::no_retry()).await;
    let (cart, payment) = h.one_sunblock();
    h.store.fail_next_commit(CommitFault::AmbiguousApplied);

    let order_id = h.workflow.place_order(&cart, &payment).await.unwrap();

    let orders = h.orders().await;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, order_id);
    assert_eq!(h.quantity(5432).await, 84);
    assert_eq!(h.customer().await.order_ids, vec![order_id]);
}

#[tokio::test]
async fn test_acknowledged_ambiguous_commit_with_retries_places_once() {
    let h = TestHarness::new(fast_retry()).await;
    let (cart, payment) = h.one_sunblock();
    h.store.fail_next_commit(CommitFault::AmbiguousApplied);

    h.workflow.place_order(&cart, &payment).await.unwrap();

    assert_eq!(h.orders().await.len(), 1);
    assert_eq!(h.quantity(5432).await, 84);
}

#[tokio::test]
async fn test_lost_commit_is_retried() {
    let h = TestHarness::new(fast_retry()).await;
    let (cart, payment) = h.one_sunblock();
    h.store.fail_next_commit(CommitFault::AmbiguousNotApplied);

    let order_id = h.workflow.place_order(&cart, &payment).await.unwrap();

    let orders = h.orders().await;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, order_id);
    assert_eq!(h.quantity(5432).await, 84);
}

#[tokio::test]
async fn test_lost_commit_without_retries_is_transient() {
    let h = TestHarness::new(RetryPolicy::no_retry()).await;
    let (cart, payment) = h.one_sunblock();
    h.store.fail_next_commit(CommitFault::AmbiguousNotApplied);

    let err = h.workflow.place_order(&cart, &payment).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(matches!(
        err,
        PlacementError::TransientStore(StoreError::Unavailable(_))
    ));
    assert!(h.orders().await.is_empty());
}

#[tokio::test]
async fn test_repeated_request_places_one_order() {
    let h = TestHarness::new(RetryPolicy::default()).await;
    let (cart, payment) = h.one_sunblock();
    let request = PlacementRequest::new(cart, payment);

    let first = h.workflow.place_request(&request).await.unwrap();
    let second = h.workflow.place_request(&request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.orders().await.len(), 1);
    assert_eq!(h.quantity(5432).await, 84);
    assert_eq!(h.customer().await.order_ids, vec![first]);
}

#[tokio::test]
async fn test_request_repeated_after_ambiguous_commit_places_one_order() {
    let h = TestHarness::new(RetryPolicy::no_retry()).await;
    let (cart, payment) = h.one_sunblock();
    let request = PlacementRequest::new(cart, payment);
    h.store.fail_next_commit(CommitFault::AmbiguousApplied);

    let first = h.workflow.place_request(&request).await.unwrap();
    let second = h.workflow.place_request(&request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.orders().await.len(), 1);
    assert_eq!(h.quantity(5432).await, 84);
}

#[tokio::test]
async fn test_request_repeated_after_lost_commit_places_one_order() {
    let h = TestHarness::new(RetryPolicy::no_retry()).await;
    let (cart, payment) = h.one_sunblock();
    let request = PlacementRequest::new(cart, payment);
    h.store.fail_next_commit(CommitFault::AmbiguousNotApplied);

    let err = h.workflow.place_request(&request).await.unwrap_err();
    assert!(err.is_retryable());

    let order_id = h.workflow.place_request(&request).await.unwrap();
    assert_eq!(h.workflow.place_request(&request).await.unwrap(), order_id);
    assert_eq!(h.orders().await.len(), 1);
    assert_eq!(h.quantity(5432).await, 84);
}

#[tokio::test]
async fn test_order_stored_for_request_id_blocks_second_insert() {
    let h = TestHarness::new(RetryPolicy::no_retry()).await;
    let (cart, payment) = h.one_sunblock();
    let request = PlacementRequest::new(cart, payment);

    let order_id = h.workflow.place_request(&request).await.unwrap();

    // Bypassing the lookup, a second attempt is stopped by the store
    let err = h.workflow.place_order_once(&request).await.unwrap_err();
    assert!(matches!(
        err,
        PlacementError::DuplicateRequest { request_id, source: StoreError::UniqueViolation { .. } }
            if request_id == request.request_id
    ));
    assert_eq!(h.orders().await.len(), 1);
    assert_eq!(h.orders().await[0].id, order_id);
    assert_eq!(h.quantity(5432).await, 84);
    assert_eq!(h.store.pending_write_count(), 0);
}

#[tokio::test]
async fn test_retry_uses_same_request_id() {
    let h = TestHarness::new(fast_retry()).await;
    let (cart, payment) = h.one_sunblock();
    let request = PlacementRequest::new(cart, payment);
    h.store.inject_write_conflicts(1);

    let order_id = h.workflow.place_request(&request).await.unwrap();

    assert_eq!(
        h.workflow.find_placed(request.request_id).await.unwrap(),
        Some(order_id)
    );
}

#[tokio::test]
async fn test_transient_conflicts_are_retried() {
    let h = TestHarness::new(fast_retry()).await;
    let (cart, payment) = h.one_sunblock();
    h.store.inject_write_conflicts(3);

    h.workflow.place_order(&cart, &payment).await.unwrap();

    assert_eq!(h.orders().await.len(), 1);
    assert_eq!(h.quantity(5432).await, 84);
}

#[tokio::test]
async fn test_persistent_conflicts_exhaust_retries() {
    let h = TestHarness::new(RetryPolicy::new(
        3,
        Duration::from_millis(1),
        Duration::from_millis(2),
    ))
    .await;
    let (cart, payment) = h.one_sunblock();
    h.store.inject_write_conflicts(100);

    let err = h.workflow.place_order(&cart, &payment).await.unwrap_err();

    assert!(matches!(
        err,
        PlacementError::TransientStore(StoreError::WriteConflict { .. })
    ));
    assert!(h.orders().await.is_empty());
    assert_eq!(h.quantity(5432).await, 85);
}

#[tokio::test]
async fn test_rejected_commit_is_fatal_and_not_retried() {
    let h = TestHarness::new(fast_retry()).await;
    let (cart, payment) = h.one_sunblock();
    h.store.fail_next_commit(CommitFault::Fail);

    let err = h.workflow.place_order(&cart, &payment).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(h.orders().await.is_empty());
    assert_eq!(h.quantity(5432).await, 85);
}

#[tokio::test]
async fn test_unavailable_store_is_fatal() {
    let h = TestHarness::new(fast_retry()).await;
    let (cart, payment) = h.one_sunblock();
    h.store.set_unavailable(true);

    let err = h.workflow.place_order(&cart, &payment).await.unwrap_err();
    assert!(matches!(
        err,
        PlacementError::FatalStore(StoreError::Unavailable(_))
    ));

    h.store.set_unavailable(false);
    assert!(h.orders().await.is_empty());
}

#[tokio::test]
async fn test_expired_transaction_is_transient() {
    let store = InMemoryStore::new();
    let customer_id = fixtures::seed_sample_data(&store).await.unwrap();
    let workflow = OrderPlacementWorkflow::new(store.clone(), RetryPolicy::no_retry())
        .with_transaction_options(TransactionOptions::snapshot_majority().max_lifetime(Duration::ZERO));
    let cart = vec![CartItem::new(5432, "sunblock", 1, Money::from_cents(519))];

    let err = workflow
        .place_order(&cart, &Payment::new(customer_id, Money::from_cents(519)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PlacementError::TransientStore(StoreError::TransactionExpired { .. })
    ));
    assert_eq!(store.pending_write_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_orders_for_last_unit() {
    let store = InMemoryStore::new();
    let customer_id = fixtures::seed_sample_data(&store).await.unwrap();
    let workflow = Arc::new(OrderPlacementWorkflow::new(
        store.clone(),
        RetryPolicy::default(),
    ));

    // Leave exactly one beach towel on hand
    let drain = vec![CartItem::new(7865, "beach towel", 40, Money::from_cents(1599))];
    workflow
        .place_order(&drain, &Payment::new(customer_id, Money::from_cents(40 * 1599)))
        .await
        .unwrap();

    let cart = vec![CartItem::new(7865, "beach towel", 1, Money::from_cents(1599))];
    let payment = Payment::new(customer_id, Money::from_cents(1599));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let workflow = Arc::clone(&workflow);
            let cart = cart.clone();
            tokio::spawn(async move { workflow.place_order(&cart, &payment).await })
        })
        .collect();

    let mut successes = 0;
    let mut out_of_stock = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(PlacementError::InsufficientInventory { .. }) => out_of_stock += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(out_of_stock, 1);
    assert_eq!(store.pending_write_count(), 0);

    let towels: Vec<InventoryRecord> = store
        .find_all(&collections::INVENTORY.into())
        .await
        .unwrap()
        .iter()
        .map(|doc| doc.decode().unwrap())
        .filter(|record: &InventoryRecord| record.sku == Sku::from(7865))
        .collect();
    assert_eq!(towels[0].quantity_on_hand, 0);
    assert_eq!(store.document_count(&collections::ORDERS.into()), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_requests_place_one_order() {
    let store = InMemoryStore::new();
    let customer_id = fixtures::seed_sample_data(&store).await.unwrap();
    let workflow = Arc::new(OrderPlacementWorkflow::new(
        store.clone(),
        RetryPolicy::new(20, Duration::from_millis(1), Duration::from_millis(20)),
    ));
    let request = PlacementRequest::new(
        vec![CartItem::new(5432, "sunblock", 1, Money::from_cents(519))],
        Payment::new(customer_id, Money::from_cents(519)),
    );

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let workflow = Arc::clone(&workflow);
            let request = request.clone();
            tokio::spawn(async move { workflow.place_request(&request).await })
        })
        .collect();

    let mut order_ids = Vec::new();
    for handle in handles {
        order_ids.push(handle.await.unwrap().unwrap());
    }

    order_ids.dedup();
    assert_eq!(order_ids.len(), 1);
    assert_eq!(store.document_count(&collections::ORDERS.into()), 1);
    assert_eq!(store.pending_write_count(), 0);

    let sunblock: InventoryRecord = store
        .find_all(&collections::INVENTORY.into())
        .await
        .unwrap()
        .iter()
        .map(|doc| doc.decode::<InventoryRecord>().unwrap())
        .find(|record| record.sku == Sku::from(5432))
        .unwrap();
    assert_eq!(sunblock.quantity_on_hand, 84);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_orders_never_oversell() {
    let store = InMemoryStore::new();
    let customer_id = fixtures::seed_sample_data(&store).await.unwrap();
    let workflow = Arc::new(OrderPlacementWorkflow::new(
        store.clone(),
        RetryPolicy::new(20, Duration::from_millis(1), Duration::from_millis(20)),
    ));
    let cart = vec![CartItem::new(7865, "beach towel", 10, Money::from_cents(1599))];
    let payment = Payment::new(customer_id, Money::from_cents(10 * 1599));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let workflow = Arc::clone(&workflow);
            let cart = cart.clone();
            tokio::spawn(async move { workflow.place_order(&cart, &payment).await })
        })
        .collect();

    let mut placed = 0u32;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => placed += 1,
            Err(PlacementError::InsufficientInventory { .. })
            | Err(PlacementError::TransientStore(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let remaining: InventoryRecord = store
        .find_all(&collections::INVENTORY.into())
        .await
        .unwrap()
        .iter()
        .map(|doc| doc.decode::<InventoryRecord>().unwrap())
        .find(|record| record.sku == Sku::from(7865))
        .unwrap();

    assert!(placed <= 4);
    assert_eq!(remaining.quantity_on_hand, 41 - placed * 10);
    assert_eq!(
        store.document_count(&collections::ORDERS.into()),
        placed as usize
    );
    assert_eq!(store.pending_write_count(), 0);
}
