//! Payment gateway webhook intake.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use engine::{Mailer, PaymentGateway};
use serde::Serialize;
use store::Store;

use super::AppState;
use crate::error::ApiError;

/// Signature header set by the gateway: hex HMAC-SHA256 of the raw
/// body under the shared secret.
pub const SIGNATURE_HEADER: &str = "gateway-signature";

#[derive(Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    /// None when the event type is not one the engine consumes.
    pub newly_finalized: Option<bool>,
}

/// POST /webhooks/payment — verify and dispatch a gateway event.
/// Delivery is at-least-once; replays are acknowledged without effect.
#[tracing::instrument(skip_all)]
pub async fn payment<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing Gateway-Signature header".to_string()))?;

    let outcome = state.lifecycle.handle_webhook(&body, signature).await?;
    Ok(Json(WebhookResponse {
        received: true,
        newly_finalized: outcome.map(|o| o.newly_finalized),
    }))
}
