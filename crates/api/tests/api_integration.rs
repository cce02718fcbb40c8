//! Integration tests for the API server against the in-memory store.

use std::sync::OnceLock;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{Money, ProductId};
use domain::{Coupon, Product, Variant};
use engine::{InMemoryGateway, InMemoryMailer};
use metrics_exporter_prometheus::PrometheusHandle;
use store::{CatalogStore, CouponStore, MemoryStore};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup() -> (Router, MemoryStore, InMemoryGateway) {
    let store = MemoryStore::new();
    let gateway = InMemoryGateway::new("whsec_test");
    let state = api::create_state(
        store.clone(),
        gateway.clone(),
        InMemoryMailer::new(),
        api::Config::default(),
    );
    let app = api::create_app(state, get_metrics_handle());
    (app, store, gateway)
}

async fn seed_variant(store: &MemoryStore, price_cents: i64, stock: i64) -> Variant {
    let product = Product {
        id: ProductId::new(),
        name: "Linen shirt".to_string(),
        unit_price: Money::from_cents(price_cents),
        active: true,
    };
    let variant = Variant::new(product.id, "M", stock);
    store.upsert_product(product).await.unwrap();
    store.upsert_variant(variant.clone()).await.unwrap();
    variant
}

async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_health_check() {
    let (app, _, _) = setup();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_reserve_and_oversell_conflict() {
    let (app, store, _) = setup();
    let variant = seed_variant(&store, 1000, 3).await;

    let (status, json) = send_json(
        &app,
        "PUT",
        "/cart/sess-a/items",
        serde_json::json!({ "variant_id": variant.id.as_uuid(), "quantity": 3 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["quantity"], 3);

    // Another session asking for one more unit sees the true count.
    let (status, json) = send_json(
        &app,
        "PUT",
        "/cart/sess-b/items",
        serde_json::json!({ "variant_id": variant.id.as_uuid(), "quantity": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["available"], 0);
}

#[tokio::test]
async fn test_release_is_idempotent_over_http() {
    let (app, store, _) = setup();
    let variant = seed_variant(&store, 1000, 3).await;

    send_json(
        &app,
        "PUT",
        "/cart/sess-a/items",
        serde_json::json!({ "variant_id": variant.id.as_uuid(), "quantity": 1 }),
    )
    .await;

    let uri = format!("/cart/sess-a/items/{}", variant.id);
    for _ in 0..2 {
        let (status, _) = send_json(&app, "DELETE", &uri, serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}

#[tokio::test]
async fn test_checkout_webhook_flow() {
    let (app, store, gateway) = setup();
    let variant = seed_variant(&store, 1000, 5).await;

    send_json(
        &app,
        "PUT",
        "/cart/sess-a/items",
        serde_json::json!({ "variant_id": variant.id.as_uuid(), "quantity": 2 }),
    )
    .await;

    let (status, checkout) = send_json(
        &app,
        "POST",
        "/checkout",
        serde_json::json!({ "session_id": "sess-a", "email": "buyer@example.com" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    // 2 × 10.00 plus the default 5.00 shipping.
    assert_eq!(checkout["total_cents"], 2500);
    let charge_ref = checkout["charge_ref"].as_str().unwrap().to_string();
    let order_id = checkout["order_id"].as_str().unwrap().to_string();

    // Deliver the signed completion webhook.
    let body = gateway.completed_webhook_body(&charge_ref);
    let signature = gateway.sign(&body);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/payment")
                .header("Gateway-Signature", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["newly_finalized"], true);

    let (status, order) = send_json(
        &app,
        "GET",
        &format!("/orders/{order_id}"),
        serde_json::Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["status"], "paid");
    assert_eq!(order["ticket_number"], 1);
    assert_eq!(order["items"][0]["remaining_returnable"], 2);
    assert_eq!(store.stock_on_hand(variant.id).await.unwrap(), 3);
}

#[tokio::test]
async fn test_webhook_bad_signature_rejected() {
    let (app, _, _) = setup();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/payment")
                .header("Gateway-Signature", "deadbeef")
                .body(Body::from(r#"{"type":"checkout.completed","reference":"cs_1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_coupon_validate_endpoint() {
    let (app, store, _) = setup();
    store
        .insert_coupon(Coupon {
            id: common::CouponId::new(),
            code: "SAVE10".to_string(),
            discount_percent: 10,
            expires_at: None,
            is_public: true,
            active: true,
        })
        .await
        .unwrap();

    let (status, json) = send_json(
        &app,
        "POST",
        "/coupons/validate",
        serde_json::json!({ "code": "SAVE10", "subtotal_cents": 5000 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["valid"], true);
    assert_eq!(json["amount_saved_cents"], 500);

    // Unknown codes come back as a normal invalid answer, not an
    // error status.
    let (status, json) = send_json(
        &app,
        "POST",
        "/coupons/validate",
        serde_json::json!({ "code": "NOPE", "subtotal_cents": 5000 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["valid"], false);
    assert_eq!(json["reason"], "unknown_code");
}

#[tokio::test]
async fn test_checkout_empty_cart_rejected() {
    let (app, _, _) = setup();
    let (status, _) = send_json(
        &app,
        "POST",
        "/checkout",
        serde_json::json!({ "session_id": "sess-empty" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
