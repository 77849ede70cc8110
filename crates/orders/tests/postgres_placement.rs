//! Order placement against PostgreSQL
//!
//! These tests share one PostgreSQL container. Run with:
//!
//! ```bash
//! cargo test -p orders --test postgres_placement -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use common::Money;
use doc_store::{PostgresStore, TransactionalStoreExt};
use orders::{
    CartItem, CustomerRecord, InventoryRecord, Order, OrderPlacementWorkflow, Payment,
    PlacementError, PlacementRequest, RetryPolicy, Sku, collections, fixtures,
};
use serial_test::serial;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            Arc::new(ContainerInfo {
                container,
                connection_string: format!(
                    "postgres://postgres:postgres@{}:{}/postgres",
                    host, port
                ),
            })
        })
        .await
        .clone()
}

/// A migrated store holding only the sample data, and the sample customer's ID
async fn seeded_store() -> (PostgresStore, common::DocumentId) {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(&info.connection_string)
        .await
        .unwrap();
    let store = PostgresStore::new(pool);
    store.run_migrations().await.unwrap();

    sqlx::query("TRUNCATE TABLE documents")
        .execute(store.pool())
        .await
        .unwrap();
    let customer_id = fixtures::seed_sample_data(&store).await.unwrap();
    (store, customer_id)
}

fn retry() -> RetryPolicy {
    RetryPolicy::new(10, Duration::from_millis(5), Duration::from_millis(50))
}

async fn quantity(store: &PostgresStore, sku: u32) -> u32 {
    store
        .find_all(&collections::INVENTORY.into())
        .await
        .unwrap()
        .iter()
        .map(|doc| doc.decode::<InventoryRecord>().unwrap())
        .find(|record| record.sku == Sku::from(sku))
        .unwrap()
        .quantity_on_hand
}

#[tokio::test]
#[serial]
async fn sample_order_commits_all_writes() {
    let (store, customer_id) = seeded_store().await;
    let workflow = OrderPlacementWorkflow::new(store.clone(), retry());

    let order_id = workflow
        .place_order(&fixtures::sample_cart(), &fixtures::sample_payment())
        .await
        .unwrap();

    assert_eq!(quantity(&store, 5432).await, 84);
    assert_eq!(quantity(&store, 7865).await, 39);

    let order: Order = store
        .find_by_id(&collections::ORDERS.into(), order_id)
        .await
        .unwrap()
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(order.total, Money::from_cents(3717));
    assert_eq!(order.customer_id, customer_id);

    let customer: CustomerRecord = store
        .find_by_id(&collections::CUSTOMERS.into(), customer_id)
        .await
        .unwrap()
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(customer.order_ids, vec![order_id]);
}

#[tokio::test]
#[serial]
async fn failed_item_rolls_back_every_write() {
    let (store, customer_id) = seeded_store().await;
    let workflow = OrderPlacementWorkflow::new(store.clone(), retry());
    let before = fixtures::dump(&store).await.unwrap();

    let cart = vec![
        CartItem::new(5432, "sunblock", 3, Money::from_cents(519)),
        CartItem::new(7865, "beach towel", 42, Money::from_cents(1599)),
    ];
    let payment = Payment::new(customer_id, Money::from_cents(3 * 519 + 42 * 1599));
    let result = workflow.place_order(&cart, &payment).await;

    assert!(matches!(
        result,
        Err(PlacementError::InsufficientInventory { ref sku }) if *sku == Sku::from(7865)
    ));
    assert_eq!(fixtures::dump(&store).await.unwrap(), before);
}

#[tokio::test]
#[serial]
async fn repeated_request_places_one_order() {
    let (store, customer_id) = seeded_store().await;
    let workflow = OrderPlacementWorkflow::new(store.clone(), retry());
    let request = PlacementRequest::new(
        vec![CartItem::new(5432, "sunblock", 1, Money::from_cents(519))],
        Payment::new(customer_id, Money::from_cents(519)),
    );

    let first = workflow.place_request(&request).await.unwrap();
    let second = workflow.place_request(&request).await.unwrap();
    assert_eq!(first, second);

    // Skipping the lookup, the unique index still refuses a second order
    let err = workflow.place_order_once(&request).await.unwrap_err();
    assert!(matches!(err, PlacementError::DuplicateRequest { .. }));

    assert_eq!(
        store.find_all(&collections::ORDERS.into()).await.unwrap().len(),
        1
    );
    assert_eq!(quantity(&store, 5432).await, 84);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn concurrent_orders_for_last_unit() {
    let (store, customer_id) = seeded_store().await;
    let workflow = Arc::new(OrderPlacementWorkflow::new(store.clone(), retry()));

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
    assert_eq!(quantity(&store, 7865).await, 0);
    assert_eq!(
        store.find_all(&collections::ORDERS.into()).await.unwrap().len(),
        2
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn concurrent_duplicate_requests_place_one_order() {
    let (store, customer_id) = seeded_store().await;
    let workflow = Arc::new(OrderPlacementWorkflow::new(store.clone(), retry()));
    let request = PlacementRequest::new(
        vec![CartItem::new(5432, "sunblock", 1, Money::from_cents(519))],
        Payment::new(customer_id, Money::from_cents(519)),
    );

    let handles: Vec<_> = (0..2)
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

    assert_eq!(order_ids[0], order_ids[1]);
    assert_eq!(
        store.find_all(&collections::ORDERS.into()).await.unwrap().len(),
        1
    );
    assert_eq!(quantity(&store, 5432).await, 84);
}
