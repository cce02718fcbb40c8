//! Checkout submission.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use common::UserId;
use engine::{CheckoutRequest, Mailer, PaymentGateway};
use serde::{Deserialize, Serialize};
use store::Store;
use uuid::Uuid;

use super::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct CheckoutApiRequest {
    pub session_id: String,
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub coupon_code: Option<String>,
}

#[derive(Serialize)]
pub struct CheckoutResponse {
    pub order_id: String,
    pub charge_ref: String,
    pub redirect_url: String,
    pub total_cents: i64,
}

/// POST /checkout — price the cart and create the gateway charge
/// session. The buyer is redirected to the returned URL; the order
/// stays pending until the payment webhook arrives.
#[tracing::instrument(skip(state, req))]
pub async fn submit<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Json(req): Json<CheckoutApiRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let base = &state.config.public_base_url;
    let session = state
        .lifecycle
        .checkout(CheckoutRequest {
            session_id: req.session_id.into(),
            user_id: req.user_id.map(UserId::from_uuid),
            email: req.email,
            coupon_code: req.coupon_code,
            success_url: format!("{base}/checkout/success"),
            cancel_url: format!("{base}/cart"),
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CheckoutResponse {
            order_id: session.order.id.to_string(),
            charge_ref: session.order.charge_ref.clone(),
            redirect_url: session.redirect_url,
            total_cents: session.order.total_amount.cents(),
        }),
    ))
}
