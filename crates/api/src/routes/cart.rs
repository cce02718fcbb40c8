//! Cart endpoints: every mutation goes through the reservation
//! manager, so the hold TTL refreshes on each touch.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{SessionId, VariantId};
use engine::{Mailer, PaymentGateway};
use serde::{Deserialize, Serialize};
use store::Store;
use uuid::Uuid;

use super::{AppState, parse_uuid};
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct ReserveRequest {
    pub variant_id: Uuid,
    pub quantity: u32,
}

#[derive(Serialize)]
pub struct HoldResponse {
    pub variant_id: String,
    pub quantity: u32,
    pub expires_at: String,
}

#[derive(Serialize)]
pub struct CartResponse {
    pub session_id: String,
    pub items: Vec<HoldResponse>,
}

/// PUT /cart/{session}/items — create or update a hold on a variant.
#[tracing::instrument(skip(state, req))]
pub async fn reserve<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path(session): Path<String>,
    Json(req): Json<ReserveRequest>,
) -> Result<Json<HoldResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    if req.quantity == 0 {
        return Err(ApiError::BadRequest(
            "quantity must be at least 1; remove the item instead".to_string(),
        ));
    }

    let session = SessionId::new(session);
    let hold = state
        .reservations
        .reserve(&session, VariantId::from_uuid(req.variant_id), req.quantity)
        .await?;

    Ok(Json(HoldResponse {
        variant_id: hold.variant_id.to_string(),
        quantity: hold.quantity,
        expires_at: hold.expires_at.to_rfc3339(),
    }))
}

/// DELETE /cart/{session}/items/{variant_id} — release one hold.
#[tracing::instrument(skip(state))]
pub async fn release<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path((session, variant_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let variant_id = VariantId::from_uuid(parse_uuid(&variant_id)?);
    state
        .reservations
        .release(&SessionId::new(session), variant_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /cart/{session} — release every hold for the session.
#[tracing::instrument(skip(state))]
pub async fn clear<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path(session): Path<String>,
) -> Result<StatusCode, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    state.reservations.clear(&SessionId::new(session)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /cart/{session} — the session's active holds.
#[tracing::instrument(skip(state))]
pub async fn get<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path(session): Path<String>,
) -> Result<Json<CartResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let session = SessionId::new(session);
    let holds = state.reservations.holds(&session).await?;
    Ok(Json(CartResponse {
        session_id: session.to_string(),
        items: holds
            .into_iter()
            .map(|h| HoldResponse {
                variant_id: h.variant_id.to_string(),
                quantity: h.quantity,
                expires_at: h.expires_at.to_rfc3339(),
            })
            .collect(),
    }))
}
