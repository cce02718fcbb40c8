//! The order lifecycle controller.
//!
//! Owns every commercial/shipping/return transition. All status
//! derivation lives here; the store only persists what this module
//! decided, and re-checks the few things a concurrent writer could
//! have invalidated.

use chrono::Utc;
use common::{Money, OrderId, SessionId, UserId};
use domain::{
    DomainError, DraftLine, Order, OrderDraft, OrderStatus, ReturnStatus, ShippingStatus,
};
use serde::Deserialize;
use store::{FinalizeOutcome, Store};
use uuid::Uuid;

use crate::coupons::CouponEngine;
use crate::error::{EngineError, Result};
use crate::services::gateway::{ChargeLineItem, PaymentGateway, EVENT_CHECKOUT_COMPLETED};
use crate::services::mailer::{Mailer, templates};

/// A checkout submission from the cart page.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub session_id: SessionId,
    pub user_id: Option<UserId>,
    pub email: Option<String>,
    pub coupon_code: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

/// A priced checkout waiting for the buyer at the gateway.
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub order: Order,
    pub redirect_url: String,
}

/// Result of a cancellation.
#[derive(Debug, Clone)]
pub struct CancelReceipt {
    pub order: Order,
    pub refunded: bool,
}

/// An opened return cycle.
#[derive(Debug, Clone)]
pub struct ReturnTicket {
    pub order: Order,
    pub tracking_id: String,
}

/// Result of a settled return refund.
#[derive(Debug, Clone)]
pub struct ReturnRefundOutcome {
    pub order: Order,
    pub refunded: bool,
    pub amount: Money,
}

/// Per-order results of a bulk shipping update.
#[derive(Debug, Default)]
pub struct BulkShippingReport {
    pub updated: Vec<OrderId>,
    pub failed: Vec<(OrderId, EngineError)>,
}

/// Drives the order aggregate through payment, fulfilment, and return
/// events.
pub struct OrderLifecycle<S, G, M> {
    store: S,
    gateway: G,
    mailer: M,
    coupons: CouponEngine<S, M>,
    shipping_cost: Money,
}

impl<S, G, M> OrderLifecycle<S, G, M>
where
    S: Store + Clone,
    G: PaymentGateway,
    M: Mailer + Clone,
{
    /// Creates a new lifecycle controller. `shipping_cost` is the flat
    /// rate added to every checkout.
    pub fn new(store: S, gateway: G, mailer: M, shipping_cost: Money) -> Self {
        let coupons = CouponEngine::new(store.clone(), mailer.clone());
        Self {
            store,
            gateway,
            mailer,
            coupons,
            shipping_cost,
        }
    }

    /// The coupon engine sharing this controller's store.
    pub fn coupons(&self) -> &CouponEngine<S, M> {
        &self.coupons
    }

    /// Loads an order.
    pub async fn order(&self, id: OrderId) -> Result<Order> {
        self.store
            .order(id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "order",
                id: id.to_string(),
            })
    }

    /// Prices the session's cart, creates the gateway charge session,
    /// and records the pending order under the charge reference.
    ///
    /// Gateway failure here is fatal: without a charge session the
    /// buyer cannot pay.
    #[tracing::instrument(skip(self, request), fields(session = %request.session_id))]
    pub async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        let now = Utc::now();
        let holds = self
            .store
            .session_reservations(&request.session_id, now)
            .await?;
        if holds.is_empty() {
            return Err(EngineError::EmptyCart(request.session_id));
        }

        let mut lines = Vec::with_capacity(holds.len());
        for hold in &holds {
            let variant = self
                .store
                .variant(hold.variant_id)
                .await?
                .ok_or_else(|| EngineError::NotFound {
                    entity: "variant",
                    id: hold.variant_id.to_string(),
                })?;
            let product = self
                .store
                .product(variant.product_id)
                .await?
                .ok_or_else(|| EngineError::NotFound {
                    entity: "product",
                    id: variant.product_id.to_string(),
                })?;
            lines.push(DraftLine {
                product_id: product.id,
                variant_id: variant.id,
                product_name: format!("{} ({})", product.name, variant.size),
                quantity: hold.quantity,
                price_at_time: product.unit_price,
            });
        }
        let subtotal: Money = lines
            .iter()
            .map(|l| l.price_at_time.multiply(l.quantity))
            .sum();

        // Advisory only; the hard single-use guard runs at finalize.
        let quote = match &request.coupon_code {
            Some(code) => {
                let Some(user_id) = request.user_id else {
                    return Err(EngineError::InvalidCoupon(
                        domain::CouponRejection::NotAssigned,
                    ));
                };
                Some(self.coupons.validate(code, Some(user_id), subtotal).await?)
            }
            None => None,
        };
        let discount = quote
            .as_ref()
            .map(|q| q.amount_saved)
            .unwrap_or(Money::zero());

        let draft = OrderDraft {
            order_id: OrderId::new(),
            session_id: request.session_id.clone(),
            user_id: request.user_id,
            email: request.email.clone(),
            subtotal,
            discount,
            shipping_cost: self.shipping_cost,
            total_amount: subtotal - discount + self.shipping_cost,
            coupon_id: quote.as_ref().map(|q| q.coupon_id),
            amount_saved: discount,
            lines,
        };

        let mut charge_lines: Vec<ChargeLineItem> = draft
            .lines
            .iter()
            .map(|l| ChargeLineItem {
                name: l.product_name.clone(),
                quantity: l.quantity,
                unit_amount: l.price_at_time,
            })
            .collect();
        if self.shipping_cost.is_positive() {
            charge_lines.push(ChargeLineItem {
                name: "Shipping".to_string(),
                quantity: 1,
                unit_amount: self.shipping_cost,
            });
        }

        // The draft rides along in the metadata so a webhook can
        // rebuild the order even if the pending row is lost.
        let metadata = serde_json::to_value(&draft)?;
        let session = self
            .gateway
            .create_charge_session(
                charge_lines,
                &request.success_url,
                &request.cancel_url,
                metadata,
            )
            .await?;

        let order = self
            .store
            .insert_pending(draft, &session.reference, now)
            .await?;

        metrics::counter!("checkout_sessions_total").increment(1);
        tracing::info!(order_id = %order.id, charge_ref = %session.reference, "checkout session created");

        Ok(CheckoutSession {
            order,
            redirect_url: session.url,
        })
    }

    /// Verifies and dispatches a gateway webhook delivery.
    ///
    /// Returns None for event types the engine does not consume.
    /// Deliveries are at-least-once; finalize tolerates replays.
    #[tracing::instrument(skip_all)]
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature: &str,
    ) -> Result<Option<FinalizeOutcome>> {
        let event = self
            .gateway
            .verify_webhook(raw_body, signature)
            .map_err(|e| EngineError::InvalidWebhook(e.reason))?;

        if event.event_type != EVENT_CHECKOUT_COMPLETED {
            tracing::debug!(event_type = %event.event_type, "ignoring webhook event");
            return Ok(None);
        }

        let draft = serde_json::from_value::<OrderDraft>(event.metadata).ok();
        let outcome = self.finalize(&event.reference, draft).await?;
        Ok(Some(outcome))
    }

    /// Converts a paid checkout into a permanent order: stock debit,
    /// ticket number, coupon redemption, receipt. Idempotent on the
    /// charge reference.
    #[tracing::instrument(skip(self, draft))]
    pub async fn finalize(
        &self,
        charge_ref: &str,
        draft: Option<OrderDraft>,
    ) -> Result<FinalizeOutcome> {
        let outcome = self.store.finalize(charge_ref, draft, Utc::now()).await?;
        if !outcome.newly_finalized {
            tracing::info!(charge_ref, "charge reference already finalized, replay ignored");
            return Ok(outcome);
        }

        metrics::counter!("orders_finalized_total").increment(1);
        let order = &outcome.order;
        tracing::info!(
            order_id = %order.id,
            ticket = order.ticket_number,
            total_cents = order.total_amount.cents(),
            "order finalized"
        );

        // The soft single-use guard: a conflict means another order
        // got there first, and the order still proceeds.
        if let (Some(user_id), Some(coupon_id)) = (order.user_id, order.coupon_id) {
            self.coupons
                .redeem(order.id, user_id, coupon_id, order.discount)
                .await?;
        }

        self.notify(
            order,
            templates::ORDER_RECEIPT,
            serde_json::json!({
                "ticket_number": order.ticket_number,
                "total_cents": order.total_amount.cents(),
            }),
        )
        .await;

        Ok(outcome)
    }

    /// Cancels an order, refunding the full charge when one was
    /// captured. Idempotent: cancelling a cancelled order is a no-op
    /// success.
    ///
    /// The refund is issued before the local transaction and never
    /// blocks it; a failed refund is an operator follow-up, not an
    /// error.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: OrderId) -> Result<CancelReceipt> {
        let order = self.order(id).await?;

        if order.status == OrderStatus::Cancelled {
            return Ok(CancelReceipt {
                order,
                refunded: false,
            });
        }
        if !order.status.can_cancel() || order.shipping_status.has_shipped() {
            return Err(DomainError::illegal_transition(
                "commercial",
                order.status,
                OrderStatus::Cancelled,
            )
            .into());
        }

        let refund_doc_id = if order.payment_status == domain::PaymentStatus::Paid {
            match self.gateway.refund(&order.charge_ref, None).await {
                Ok(receipt) => Some(receipt.doc_id),
                Err(error) => {
                    metrics::counter!("refund_failures_total").increment(1);
                    tracing::error!(
                        order_id = %id,
                        %error,
                        "refund failed during cancellation; cancelling anyway for operator follow-up"
                    );
                    None
                }
            }
        } else {
            None
        };
        let refunded = refund_doc_id.is_some();

        let outcome = self.store.cancel(id, refund_doc_id, Utc::now()).await?;
        if outcome.newly_cancelled {
            metrics::counter!("orders_cancelled_total").increment(1);
            self.notify(
                &outcome.order,
                templates::ORDER_CANCELLED,
                serde_json::json!({ "refunded": refunded }),
            )
            .await;
        }

        Ok(CancelReceipt {
            order: outcome.order,
            refunded,
        })
    }

    /// Moves the shipping axis forward and derives the commercial
    /// status from it: shipped or in delivery implies processing,
    /// delivered forces completed.
    #[tracing::instrument(skip(self))]
    pub async fn update_shipping(&self, id: OrderId, next: ShippingStatus) -> Result<Order> {
        let order = self.order(id).await?;

        if order.status == OrderStatus::Cancelled {
            return Err(DomainError::illegal_transition("shipping", order.shipping_status, next).into());
        }
        if !order.shipping_status.can_transition_to(next) {
            return Err(DomainError::illegal_transition("shipping", order.shipping_status, next).into());
        }

        let commercial = match OrderStatus::implied_by_shipping(next) {
            Some(OrderStatus::Processing) if order.status == OrderStatus::Paid => {
                Some(OrderStatus::Processing)
            }
            Some(OrderStatus::Completed)
                if matches!(order.status, OrderStatus::Paid | OrderStatus::Processing) =>
            {
                Some(OrderStatus::Completed)
            }
            _ => None,
        };

        let updated = self
            .store
            .set_shipping(id, next, commercial, Utc::now())
            .await?;

        match next {
            ShippingStatus::Shipped => {
                self.notify(&updated, templates::ORDER_SHIPPED, serde_json::json!({}))
                    .await;
            }
            ShippingStatus::Delivered => {
                self.notify(&updated, templates::ORDER_DELIVERED, serde_json::json!({}))
                    .await;
            }
            _ => {}
        }

        Ok(updated)
    }

    /// Applies one shipping transition across many orders, collecting
    /// per-order failures instead of aborting the batch.
    pub async fn bulk_update_shipping(
        &self,
        ids: &[OrderId],
        next: ShippingStatus,
    ) -> BulkShippingReport {
        let mut report = BulkShippingReport::default();
        for id in ids {
            match self.update_shipping(*id, next).await {
                Ok(_) => report.updated.push(*id),
                Err(error) => report.failed.push((*id, error)),
            }
        }
        report
    }

    /// Opens a return cycle on a delivered order.
    ///
    /// With no explicit line list, every line's remaining returnable
    /// quantity is requested.
    #[tracing::instrument(skip(self, lines))]
    pub async fn request_return(
        &self,
        id: OrderId,
        reason: &str,
        lines: Option<Vec<(common::VariantId, u32)>>,
    ) -> Result<ReturnTicket> {
        let order = self.order(id).await?;

        if !order.is_delivered() {
            return Err(DomainError::illegal_transition(
                "return",
                order.return_status,
                ReturnStatus::Requested,
            )
            .into());
        }
        if !order.return_status.can_transition_to(ReturnStatus::Requested) {
            return Err(DomainError::illegal_transition(
                "return",
                order.return_status,
                ReturnStatus::Requested,
            )
            .into());
        }

        let lines: Vec<(common::VariantId, u32)> = match lines {
            Some(lines) => lines.into_iter().filter(|(_, qty)| *qty > 0).collect(),
            None => order
                .items
                .iter()
                .filter(|i| i.remaining_returnable() > 0)
                .map(|i| (i.variant_id, i.remaining_returnable()))
                .collect(),
        };
        if lines.is_empty() {
            return Err(EngineError::NothingReturnable(id));
        }

        let tracking_id = format!(
            "RET-{}",
            Uuid::new_v4().simple().to_string()[..12].to_uppercase()
        );
        let updated = self
            .store
            .mark_return_requested(id, &tracking_id, &lines, Utc::now())
            .await?;

        metrics::counter!("returns_requested_total").increment(1);
        tracing::info!(order_id = %id, tracking_id = %tracking_id, reason, "return requested");
        self.notify(
            &updated,
            templates::RETURN_INSTRUCTIONS,
            serde_json::json!({ "tracking_id": tracking_id, "reason": reason }),
        )
        .await;

        Ok(ReturnTicket {
            order: updated,
            tracking_id,
        })
    }

    /// Records that the customer handed the parcel to the carrier.
    pub async fn mark_return_handed(&self, id: OrderId) -> Result<Order> {
        self.advance_return(id, ReturnStatus::HandedToCarrier).await
    }

    /// Records physical receipt of the returned parcel.
    pub async fn mark_return_received(&self, id: OrderId) -> Result<Order> {
        self.advance_return(id, ReturnStatus::Received).await
    }

    /// Aborts the open return cycle.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_return(&self, id: OrderId) -> Result<Order> {
        let order = self.order(id).await?;
        if !order
            .return_status
            .can_transition_to(ReturnStatus::CancelledDuringReturn)
        {
            return Err(DomainError::illegal_transition(
                "return",
                order.return_status,
                ReturnStatus::CancelledDuringReturn,
            )
            .into());
        }
        Ok(self.store.cancel_return(id, Utc::now()).await?)
    }

    /// Settles a received return: partial gateway refund for exactly
    /// the requested lines (shipping cost never included), stock
    /// credit, and quantity accounting. A fully-returned order is
    /// promoted to cancelled.
    #[tracing::instrument(skip(self))]
    pub async fn confirm_return_refund(&self, id: OrderId) -> Result<ReturnRefundOutcome> {
        let order = self.order(id).await?;

        if order.return_status != ReturnStatus::Received {
            return Err(DomainError::illegal_transition(
                "return",
                order.return_status,
                ReturnStatus::Refunded,
            )
            .into());
        }
        let amount = order.requested_refund_total();
        if amount.is_zero() {
            return Err(EngineError::NothingReturnable(id));
        }

        let refund_doc_id = match self.gateway.refund(&order.charge_ref, Some(amount)).await {
            Ok(receipt) => Some(receipt.doc_id),
            Err(error) => {
                metrics::counter!("refund_failures_total").increment(1);
                tracing::error!(
                    order_id = %id,
                    %error,
                    "return refund failed; settling locally for operator follow-up"
                );
                None
            }
        };
        let refunded = refund_doc_id.is_some();

        let settlement = self.store.settle_return(id, refund_doc_id, Utc::now()).await?;
        metrics::counter!("returns_refunded_total").increment(1);
        self.notify(
            &settlement.order,
            templates::RETURN_REFUNDED,
            serde_json::json!({
                "amount_cents": settlement.amount.cents(),
                "refunded": refunded,
            }),
        )
        .await;

        Ok(ReturnRefundOutcome {
            order: settlement.order,
            refunded,
            amount: settlement.amount,
        })
    }

    async fn advance_return(&self, id: OrderId, next: ReturnStatus) -> Result<Order> {
        let order = self.order(id).await?;
        if !order.return_status.can_transition_to(next) {
            return Err(
                DomainError::illegal_transition("return", order.return_status, next).into(),
            );
        }
        Ok(self.store.set_return_status(id, next, Utc::now()).await?)
    }

    /// Best-effort notification, fired after the triggering write has
    /// committed. Failure never propagates.
    async fn notify(&self, order: &Order, template_id: &str, payload: serde_json::Value) {
        let recipient = match &order.email {
            Some(email) => Some(email.clone()),
            None => match order.user_id {
                Some(user_id) => match self.store.customer(user_id).await {
                    Ok(customer) => customer.map(|c| c.email),
                    Err(error) => {
                        tracing::warn!(order_id = %order.id, %error, "recipient lookup failed");
                        None
                    }
                },
                None => None,
            },
        };

        match recipient {
            Some(recipient) => self.mailer.send(template_id, &recipient, payload).await,
            None => {
                tracing::debug!(order_id = %order.id, template_id, "no recipient for notification");
            }
        }
    }
}
