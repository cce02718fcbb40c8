//! HTTP API for the storefront core.
//!
//! Cart holds, checkout, the payment webhook, and the admin order
//! lifecycle endpoints, with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post, put};
use common::Money;
use engine::{Mailer, OrderLifecycle, PaymentGateway, ReservationManager};
use metrics_exporter_prometheus::PrometheusHandle;
use store::Store;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::Config;
use routes::AppState;

/// Creates the application state around one store value.
pub fn create_state<S, G, M>(store: S, gateway: G, mailer: M, config: Config) -> Arc<AppState<S, G, M>>
where
    S: Store + Clone,
    G: PaymentGateway,
    M: Mailer + Clone,
{
    let shipping_cost = Money::from_cents(config.shipping_cost_cents);
    Arc::new(AppState {
        reservations: ReservationManager::new(store.clone()),
        lifecycle: OrderLifecycle::new(store, gateway, mailer, shipping_cost),
        config,
    })
}

/// Creates the Axum application router with all routes and shared
/// state.
pub fn create_app<S, G, M>(
    state: Arc<AppState<S, G, M>>,
    metrics_handle: PrometheusHandle,
) -> Router
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/cart/{session}", get(routes::cart::get::<S, G, M>))
        .route("/cart/{session}", delete(routes::cart::clear::<S, G, M>))
        .route("/cart/{session}/items", put(routes::cart::reserve::<S, G, M>))
        .route(
            "/cart/{session}/items/{variant_id}",
            delete(routes::cart::release::<S, G, M>),
        )
        .route("/checkout", post(routes::checkout::submit::<S, G, M>))
        .route("/webhooks/payment", post(routes::webhooks::payment::<S, G, M>))
        .route("/orders/{id}", get(routes::orders::get::<S, G, M>))
        .route("/orders/{id}/cancel", post(routes::orders::cancel::<S, G, M>))
        .route(
            "/orders/{id}/shipping",
            post(routes::orders::set_shipping::<S, G, M>),
        )
        .route(
            "/orders/shipping/bulk",
            post(routes::orders::bulk_shipping::<S, G, M>),
        )
        .route(
            "/orders/{id}/return",
            post(routes::orders::request_return::<S, G, M>),
        )
        .route(
            "/orders/{id}/return/handed",
            post(routes::orders::return_handed::<S, G, M>),
        )
        .route(
            "/orders/{id}/return/received",
            post(routes::orders::return_received::<S, G, M>),
        )
        .route(
            "/orders/{id}/return/cancel",
            post(routes::orders::return_cancel::<S, G, M>),
        )
        .route(
            "/orders/{id}/return/refund",
            post(routes::orders::return_refund::<S, G, M>),
        )
        .route("/coupons/validate", post(routes::coupons::validate::<S, G, M>))
        .route(
            "/coupons/{id}/distribute",
            post(routes::coupons::distribute::<S, G, M>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
