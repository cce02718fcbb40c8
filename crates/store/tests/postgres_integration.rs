//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container and are ignored by
//! default because they need a local Docker daemon. Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use common::{Money, OrderId, ProductId, SessionId, UserId, VariantId};
use domain::{Coupon, CouponUsage, DraftLine, OrderDraft, OrderStatus, Product, Variant};
use sqlx::PgPool;
use store::{
    CatalogStore, CouponStore, InventoryStore, OrderStore, PostgresStore, StoreError,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            // Create a temporary pool just for migrations
            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_storefront_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::raw_sql(
        "TRUNCATE TABLE order_items, orders, reservations, coupon_usages, coupon_assignments, \
         coupons, notifications, customers, variants, products CASCADE; \
         ALTER SEQUENCE order_ticket_seq RESTART WITH 1;",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresStore::new(pool)
}

async fn seed_variant(store: &PostgresStore, stock: i64) -> VariantId {
    let product = Product {
        id: ProductId::new(),
        name: "Linen shirt".to_string(),
        unit_price: Money::from_cents(1000),
        active: true,
    };
    let variant = Variant::new(product.id, "M", stock);
    let id = variant.id;
    store.upsert_product(product).await.unwrap();
    store.upsert_variant(variant).await.unwrap();
    id
}

fn draft(session: &str, variant_id: VariantId, quantity: u32, price: i64) -> OrderDraft {
    let subtotal = Money::from_cents(price).multiply(quantity);
    OrderDraft {
        order_id: OrderId::new(),
        session_id: session.into(),
        user_id: None,
        email: Some("buyer@example.com".to_string()),
        lines: vec![DraftLine {
            product_id: ProductId::new(),
            variant_id,
            product_name: "Linen shirt (M)".to_string(),
            quantity,
            price_at_time: Money::from_cents(price),
        }],
        subtotal,
        discount: Money::zero(),
        shipping_cost: Money::from_cents(500),
        total_amount: subtotal + Money::from_cents(500),
        coupon_id: None,
        amount_saved: Money::zero(),
    }
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn reserve_upserts_and_enforces_availability() {
    let store = get_test_store().await;
    let variant_id = seed_variant(&store, 3).await;
    let now = Utc::now();

    let session: SessionId = "sess-a".into();
    let hold = store.reserve(&session, variant_id, 2, now).await.unwrap();
    assert_eq!(hold.quantity, 2);

    // Same session can adjust its own hold up to the full stock.
    let hold = store.reserve(&session, variant_id, 3, now).await.unwrap();
    assert_eq!(hold.quantity, 3);

    let err = store
        .reserve(&"sess-b".into(), variant_id, 1, now)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::InsufficientStock { available: 0, .. }
    ));

    // Expiry frees availability; the sweep then removes the row.
    let later = now + TimeDelta::minutes(21);
    let hold = store.reserve(&"sess-b".into(), variant_id, 1, later).await.unwrap();
    assert_eq!(hold.quantity, 1);
    assert_eq!(store.sweep_expired(later).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn concurrent_reservations_get_one_winner() {
    let store = get_test_store().await;
    let variant_id = seed_variant(&store, 3).await;
    let now = Utc::now();

    let spawn_reserve = |store: PostgresStore, session: &str| {
        let session: SessionId = session.into();
        tokio::spawn(async move { store.reserve(&session, variant_id, 2, now).await })
    };
    let a = spawn_reserve(store.clone(), "sess-a");
    let b = spawn_reserve(store.clone(), "sess-b");

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn finalize_is_idempotent_and_debits_once() {
    let store = get_test_store().await;
    let variant_id = seed_variant(&store, 5).await;
    let now = Utc::now();

    store
        .reserve(&"sess-a".into(), variant_id, 2, now)
        .await
        .unwrap();
    store
        .insert_pending(draft("sess-a", variant_id, 2, 1000), "cs_1", now)
        .await
        .unwrap();

    let first = store.finalize("cs_1", None, now).await.unwrap();
    assert!(first.newly_finalized);
    assert_eq!(first.order.status, OrderStatus::Paid);
    assert_eq!(first.order.ticket_number, Some(1));
    assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 3);

    let second = store.finalize("cs_1", None, now).await.unwrap();
    assert!(!second.newly_finalized);
    assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 3);

    // The session's holds were consumed.
    assert!(store
        .session_reservations(&"sess-a".into(), now)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn finalize_shortfall_rolls_back() {
    let store = get_test_store().await;
    let variant_id = seed_variant(&store, 1).await;
    let now = Utc::now();

    store
        .insert_pending(draft("sess-a", variant_id, 2, 1000), "cs_2", now)
        .await
        .unwrap();

    let err = store.finalize("cs_2", None, now).await.unwrap_err();
    assert!(matches!(err, StoreError::InsufficientStock { .. }));
    assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 1);

    let order = store.find_by_charge_ref("cs_2").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(order.ticket_number.is_none());
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn cancel_credits_stock_exactly_once() {
    let store = get_test_store().await;
    let variant_id = seed_variant(&store, 5).await;
    let now = Utc::now();

    let order = store
        .insert_pending(draft("sess-a", variant_id, 2, 1000), "cs_3", now)
        .await
        .unwrap();
    store.finalize("cs_3", None, now).await.unwrap();
    assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 3);

    let first = store
        .cancel(order.id, Some("re_1".to_string()), now)
        .await
        .unwrap();
    assert!(first.newly_cancelled);
    assert!(first.stock_credited);
    assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 5);

    let second = store.cancel(order.id, None, now).await.unwrap();
    assert!(!second.newly_cancelled);
    assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 5);
}

#[tokio::test]
#[ignore = "requires a local Docker daemon"]
async fn record_usage_unique_constraint() {
    let store = get_test_store().await;
    let coupon = Coupon {
        id: common::CouponId::new(),
        code: "SAVE10".to_string(),
        discount_percent: 10,
        expires_at: None,
        is_public: true,
        active: true,
    };
    store.insert_coupon(coupon.clone()).await.unwrap();
    let user_id = UserId::new();

    let usage = CouponUsage {
        coupon_id: coupon.id,
        user_id,
        order_id: OrderId::new(),
        amount_saved: Money::from_cents(500),
        used_at: Utc::now(),
    };
    assert!(store.record_usage(usage.clone()).await.unwrap());
    assert!(!store.record_usage(usage).await.unwrap());
    assert!(store.usage_exists(coupon.id, user_id).await.unwrap());
}
