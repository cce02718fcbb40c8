//! Coupon validation and distribution endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::{CouponId, Money, UserId};
use domain::SegmentRule;
use engine::{EngineError, Mailer, PaymentGateway};
use serde::{Deserialize, Serialize};
use store::Store;
use uuid::Uuid;

use super::{AppState, parse_uuid};
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct ValidateRequest {
    pub code: String,
    pub user_id: Option<Uuid>,
    pub subtotal_cents: i64,
}

/// Validation is advisory pricing; a rejected code is a normal answer
/// shown inline at checkout, not an error response.
#[derive(Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_percent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_saved_cents: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct DistributeRequest {
    #[serde(flatten)]
    pub rule: SegmentRule,
}

#[derive(Serialize)]
pub struct DistributeResponse {
    pub notified: usize,
    pub skipped: usize,
}

/// POST /coupons/validate — price a code against a subtotal.
#[tracing::instrument(skip(state, req))]
pub async fn validate<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<ValidateResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let result = state
        .lifecycle
        .coupons()
        .validate(
            &req.code,
            req.user_id.map(UserId::from_uuid),
            Money::from_cents(req.subtotal_cents),
        )
        .await;

    match result {
        Ok(quote) => Ok(Json(ValidateResponse {
            valid: true,
            coupon_id: Some(quote.coupon_id.to_string()),
            discount_percent: Some(quote.discount_percent),
            amount_saved_cents: Some(quote.amount_saved.cents()),
            reason: None,
        })),
        Err(EngineError::InvalidCoupon(reason)) => Ok(Json(ValidateResponse {
            valid: false,
            coupon_id: None,
            discount_percent: None,
            amount_saved_cents: None,
            reason: Some(reason.to_string()),
        })),
        Err(err) => Err(err.into()),
    }
}

/// POST /coupons/{id}/distribute — notify a customer segment.
/// Idempotent: re-running skips everyone already notified.
#[tracing::instrument(skip(state, req))]
pub async fn distribute<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path(id): Path<String>,
    Json(req): Json<DistributeRequest>,
) -> Result<Json<DistributeResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let coupon_id = CouponId::from_uuid(parse_uuid(&id)?);
    let report = state
        .lifecycle
        .coupons()
        .distribute_to_segment(coupon_id, req.rule)
        .await?;
    Ok(Json(DistributeResponse {
        notified: report.notified,
        skipped: report.skipped,
    }))
}
