//! Order read and admin lifecycle endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::{OrderId, VariantId};
use domain::{Order, ShippingStatus};
use engine::{Mailer, PaymentGateway};
use serde::{Deserialize, Serialize};
use store::Store;
use uuid::Uuid;

use super::{AppState, parse_uuid};
use crate::error::ApiError;

/// Fixed display VAT rate; prices are stored VAT-inclusive.
const VAT_PERCENT: i64 = 19;

#[derive(Serialize)]
pub struct OrderItemResponse {
    pub product_id: String,
    pub variant_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub price_at_time_cents: i64,
    pub return_requested_qty: u32,
    pub return_refunded_qty: u32,
    pub remaining_returnable: u32,
}

#[derive(Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub status: String,
    pub payment_status: String,
    pub shipping_status: String,
    pub return_status: String,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub shipping_cost_cents: i64,
    pub total_cents: i64,
    /// VAT portion of the total at the fixed display rate.
    pub vat_included_cents: i64,
    pub coupon_id: Option<String>,
    pub charge_ref: String,
    pub ticket_number: Option<i64>,
    pub return_tracking_id: Option<String>,
    pub refund_doc_id: Option<String>,
    pub remaining_returnable: u32,
    pub created_at: String,
    pub paid_at: Option<String>,
    pub shipped_at: Option<String>,
    pub delivered_at: Option<String>,
    pub cancelled_at: Option<String>,
    pub items: Vec<OrderItemResponse>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        let total = order.total_amount.cents();
        Self {
            id: order.id.to_string(),
            user_id: order.user_id.map(|u| u.to_string()),
            email: order.email.clone(),
            status: order.status.as_str().to_string(),
            payment_status: order.payment_status.as_str().to_string(),
            shipping_status: order.shipping_status.as_str().to_string(),
            return_status: order.return_status.as_str().to_string(),
            subtotal_cents: order.subtotal.cents(),
            discount_cents: order.discount.cents(),
            shipping_cost_cents: order.shipping_cost.cents(),
            total_cents: total,
            vat_included_cents: total * VAT_PERCENT / (100 + VAT_PERCENT),
            coupon_id: order.coupon_id.map(|c| c.to_string()),
            charge_ref: order.charge_ref.clone(),
            ticket_number: order.ticket_number,
            return_tracking_id: order.return_tracking_id.clone(),
            refund_doc_id: order.refund_doc_id.clone(),
            remaining_returnable: order.remaining_returnable(),
            created_at: order.created_at.to_rfc3339(),
            paid_at: order.paid_at.map(|t| t.to_rfc3339()),
            shipped_at: order.shipped_at.map(|t| t.to_rfc3339()),
            delivered_at: order.delivered_at.map(|t| t.to_rfc3339()),
            cancelled_at: order.cancelled_at.map(|t| t.to_rfc3339()),
            items: order
                .items
                .iter()
                .map(|item| OrderItemResponse {
                    product_id: item.product_id.to_string(),
                    variant_id: item.variant_id.to_string(),
                    product_name: item.product_name.clone(),
                    quantity: item.quantity,
                    price_at_time_cents: item.price_at_time.cents(),
                    return_requested_qty: item.return_requested_qty,
                    return_refunded_qty: item.return_refunded_qty,
                    remaining_returnable: item.remaining_returnable(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    pub refunded: bool,
}

#[derive(Deserialize)]
pub struct ShippingRequest {
    pub status: ShippingStatus,
}

#[derive(Deserialize)]
pub struct BulkShippingRequest {
    pub order_ids: Vec<Uuid>,
    pub status: ShippingStatus,
}

#[derive(Serialize)]
pub struct BulkShippingResponse {
    pub updated: Vec<String>,
    pub failed: Vec<BulkShippingFailure>,
}

#[derive(Serialize)]
pub struct BulkShippingFailure {
    pub order_id: String,
    pub error: String,
}

#[derive(Deserialize)]
pub struct ReturnRequestBody {
    pub reason: String,
    /// Defaults to every line's remaining returnable quantity.
    pub items: Option<Vec<ReturnLineBody>>,
}

#[derive(Deserialize)]
pub struct ReturnLineBody {
    pub variant_id: Uuid,
    pub quantity: u32,
}

#[derive(Serialize)]
pub struct ReturnTicketResponse {
    pub tracking_id: String,
    pub return_status: String,
}

#[derive(Serialize)]
pub struct ReturnRefundResponse {
    pub refunded: bool,
    pub amount_cents: i64,
}

fn order_id(id: &str) -> Result<OrderId, ApiError> {
    Ok(OrderId::from_uuid(parse_uuid(id)?))
}

/// GET /orders/{id} — read-only order view with computed fields.
#[tracing::instrument(skip(state))]
pub async fn get<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let order = state.lifecycle.order(order_id(&id)?).await?;
    Ok(Json(order.into()))
}

/// POST /orders/{id}/cancel — idempotent cancellation with refund.
#[tracing::instrument(skip(state))]
pub async fn cancel<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let receipt = state.lifecycle.cancel(order_id(&id)?).await?;
    Ok(Json(CancelResponse {
        cancelled: true,
        refunded: receipt.refunded,
    }))
}

/// POST /orders/{id}/shipping — advance the shipping axis.
#[tracing::instrument(skip(state, req))]
pub async fn set_shipping<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path(id): Path<String>,
    Json(req): Json<ShippingRequest>,
) -> Result<Json<OrderResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let order = state
        .lifecycle
        .update_shipping(order_id(&id)?, req.status)
        .await?;
    Ok(Json(order.into()))
}

/// POST /orders/shipping/bulk — one transition across many orders.
#[tracing::instrument(skip(state, req))]
pub async fn bulk_shipping<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Json(req): Json<BulkShippingRequest>,
) -> Result<Json<BulkShippingResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let ids: Vec<OrderId> = req.order_ids.into_iter().map(OrderId::from_uuid).collect();
    let report = state.lifecycle.bulk_update_shipping(&ids, req.status).await;
    Ok(Json(BulkShippingResponse {
        updated: report.updated.iter().map(|id| id.to_string()).collect(),
        failed: report
            .failed
            .iter()
            .map(|(id, error)| BulkShippingFailure {
                order_id: id.to_string(),
                error: error.to_string(),
            })
            .collect(),
    }))
}

/// POST /orders/{id}/return — open a return cycle.
#[tracing::instrument(skip(state, req))]
pub async fn request_return<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path(id): Path<String>,
    Json(req): Json<ReturnRequestBody>,
) -> Result<Json<ReturnTicketResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let lines = req.items.map(|items| {
        items
            .into_iter()
            .map(|l| (VariantId::from_uuid(l.variant_id), l.quantity))
            .collect()
    });
    let ticket = state
        .lifecycle
        .request_return(order_id(&id)?, &req.reason, lines)
        .await?;
    Ok(Json(ReturnTicketResponse {
        tracking_id: ticket.tracking_id,
        return_status: ticket.order.return_status.as_str().to_string(),
    }))
}

/// POST /orders/{id}/return/handed — parcel handed to the carrier.
#[tracing::instrument(skip(state))]
pub async fn return_handed<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let order = state.lifecycle.mark_return_handed(order_id(&id)?).await?;
    Ok(Json(order.into()))
}

/// POST /orders/{id}/return/received — parcel physically received.
#[tracing::instrument(skip(state))]
pub async fn return_received<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let order = state.lifecycle.mark_return_received(order_id(&id)?).await?;
    Ok(Json(order.into()))
}

/// POST /orders/{id}/return/cancel — abort the open return cycle.
#[tracing::instrument(skip(state))]
pub async fn return_cancel<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let order = state.lifecycle.cancel_return(order_id(&id)?).await?;
    Ok(Json(order.into()))
}

/// POST /orders/{id}/return/refund — settle the received return.
#[tracing::instrument(skip(state))]
pub async fn return_refund<S, G, M>(
    State(state): State<Arc<AppState<S, G, M>>>,
    Path(id): Path<String>,
) -> Result<Json<ReturnRefundResponse>, ApiError>
where
    S: Store + Clone + 'static,
    G: PaymentGateway + 'static,
    M: Mailer + Clone + 'static,
{
    let outcome = state
        .lifecycle
        .confirm_return_refund(order_id(&id)?)
        .await?;
    Ok(Json(ReturnRefundResponse {
        refunded: outcome.refunded,
        amount_cents: outcome.amount.cents(),
    }))
}
