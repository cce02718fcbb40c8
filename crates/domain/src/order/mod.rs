//! The order aggregate: header, lines, and checkout drafts.

pub mod status;

use chrono::{DateTime, Utc};
use common::{CouponId, Money, OrderId, ProductId, SessionId, UserId, VariantId};
use serde::{Deserialize, Serialize};

use status::{OrderStatus, PaymentStatus, ReturnStatus, ShippingStatus};

/// An order line, snapshotting the price at purchase time and carrying
/// the return-cycle quantity accounting.
///
/// Invariants, kept by the store transactions:
/// `return_refunded_qty <= quantity` and
/// `return_requested_qty + return_refunded_qty <= quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub product_name: String,
    pub quantity: u32,
    pub price_at_time: Money,
    pub return_requested_qty: u32,
    pub return_received_qty: u32,
    pub return_refunded_qty: u32,
}

impl OrderItem {
    /// Total charged for this line.
    pub fn line_total(&self) -> Money {
        self.price_at_time.multiply(self.quantity)
    }

    /// Units not yet refunded and not part of an open return request.
    pub fn remaining_returnable(&self) -> u32 {
        self.quantity - self.return_refunded_qty - self.return_requested_qty
    }

    /// Refund owed for the currently requested units.
    pub fn requested_refund_amount(&self) -> Money {
        self.price_at_time.multiply(self.return_requested_qty)
    }

    /// True once every unit of this line has been refunded.
    pub fn is_fully_refunded(&self) -> bool {
        self.return_refunded_qty == self.quantity
    }
}

/// The order aggregate root.
///
/// Mutated only by the lifecycle controller through store transactions;
/// never physically deleted (cancellation is a terminal status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// None for guest orders.
    pub user_id: Option<UserId>,
    /// The cart session this order was checked out from.
    pub session_id: SessionId,
    /// Receipt recipient; required for guest orders.
    pub email: Option<String>,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub shipping_status: ShippingStatus,
    pub return_status: ReturnStatus,
    pub subtotal: Money,
    pub discount: Money,
    pub shipping_cost: Money,
    pub total_amount: Money,
    pub coupon_id: Option<CouponId>,
    /// Gateway charge-session reference, the finalize idempotency key.
    pub charge_ref: String,
    /// Sequential ticket number, assigned exactly once at first finalize.
    pub ticket_number: Option<i64>,
    pub return_tracking_id: Option<String>,
    /// Gateway refund document reference, stamped when a refund was issued.
    pub refund_doc_id: Option<String>,
    pub items: Vec<OrderItem>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub processing_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Sum owed for all currently requested return units. Shipping cost
    /// is never part of a return refund.
    pub fn requested_refund_total(&self) -> Money {
        self.items.iter().map(OrderItem::requested_refund_amount).sum()
    }

    /// True once every line has been fully refunded through returns.
    pub fn is_fully_returned(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(OrderItem::is_fully_refunded)
    }

    /// True if delivery has occurred, on either axis.
    pub fn is_delivered(&self) -> bool {
        self.shipping_status.is_delivered() || self.status == OrderStatus::Completed
    }

    /// Units still eligible for a new return request, summed over lines.
    pub fn remaining_returnable(&self) -> u32 {
        self.items.iter().map(OrderItem::remaining_returnable).sum()
    }
}

/// One line of a checkout draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftLine {
    pub product_id: ProductId,
    pub variant_id: VariantId,
    pub product_name: String,
    pub quantity: u32,
    pub price_at_time: Money,
}

/// A priced checkout, ready to become a pending order.
///
/// Serialized into the gateway charge-session metadata so a webhook can
/// reconstruct the order if the pending row never made it to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub order_id: OrderId,
    pub session_id: SessionId,
    pub user_id: Option<UserId>,
    pub email: Option<String>,
    pub lines: Vec<DraftLine>,
    pub subtotal: Money,
    pub discount: Money,
    pub shipping_cost: Money,
    pub total_amount: Money,
    pub coupon_id: Option<CouponId>,
    pub amount_saved: Money,
}

impl OrderDraft {
    /// Materializes the draft into a pending order with the given
    /// charge reference.
    pub fn into_order(self, charge_ref: String, now: DateTime<Utc>) -> Order {
        let items = self
            .lines
            .into_iter()
            .map(|line| OrderItem {
                order_id: self.order_id,
                product_id: line.product_id,
                variant_id: line.variant_id,
                product_name: line.product_name,
                quantity: line.quantity,
                price_at_time: line.price_at_time,
                return_requested_qty: 0,
                return_received_qty: 0,
                return_refunded_qty: 0,
            })
            .collect();

        Order {
            id: self.order_id,
            user_id: self.user_id,
            session_id: self.session_id,
            email: self.email,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            shipping_status: ShippingStatus::Pending,
            return_status: ReturnStatus::None,
            subtotal: self.subtotal,
            discount: self.discount,
            shipping_cost: self.shipping_cost,
            total_amount: self.total_amount,
            coupon_id: self.coupon_id,
            charge_ref,
            ticket_number: None,
            return_tracking_id: None,
            refund_doc_id: None,
            items,
            created_at: now,
            paid_at: None,
            processing_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(quantity: u32, price: i64) -> OrderItem {
        OrderItem {
            order_id: OrderId::new(),
            product_id: ProductId::new(),
            variant_id: VariantId::new(),
            product_name: "Linen shirt".to_string(),
            quantity,
            price_at_time: Money::from_cents(price),
            return_requested_qty: 0,
            return_received_qty: 0,
            return_refunded_qty: 0,
        }
    }

    #[test]
    fn test_line_total() {
        assert_eq!(item(3, 1000).line_total().cents(), 3000);
    }

    #[test]
    fn test_remaining_returnable_accounts_for_both_buckets() {
        let mut line = item(5, 1000);
        assert_eq!(line.remaining_returnable(), 5);

        line.return_requested_qty = 2;
        assert_eq!(line.remaining_returnable(), 3);

        line.return_requested_qty = 0;
        line.return_refunded_qty = 2;
        assert_eq!(line.remaining_returnable(), 3);

        line.return_requested_qty = 3;
        assert_eq!(line.remaining_returnable(), 0);
    }

    #[test]
    fn test_requested_refund_amount_excludes_unrequested_units() {
        let mut line = item(4, 2500);
        line.return_requested_qty = 1;
        assert_eq!(line.requested_refund_amount().cents(), 2500);
    }

    #[test]
    fn test_draft_into_order() {
        let draft = OrderDraft {
            order_id: OrderId::new(),
            session_id: "sess-1".into(),
            user_id: None,
            email: Some("buyer@example.com".to_string()),
            lines: vec![DraftLine {
                product_id: ProductId::new(),
                variant_id: VariantId::new(),
                product_name: "Linen shirt".to_string(),
                quantity: 2,
                price_at_time: Money::from_cents(1000),
            }],
            subtotal: Money::from_cents(2000),
            discount: Money::zero(),
            shipping_cost: Money::from_cents(500),
            total_amount: Money::from_cents(2500),
            coupon_id: None,
            amount_saved: Money::zero(),
        };

        let order = draft.clone().into_order("cs_123".to_string(), Utc::now());
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.charge_ref, "cs_123");
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].quantity, 2);
        assert_eq!(order.total_amount.cents(), 2500);
        assert!(order.ticket_number.is_none());
    }

    #[test]
    fn test_fully_returned_needs_every_line_refunded() {
        let order_id = OrderId::new();
        let mut a = item(2, 1000);
        let mut b = item(1, 500);
        a.order_id = order_id;
        b.order_id = order_id;
        a.return_refunded_qty = 2;

        let draft_order = |items: Vec<OrderItem>| Order {
            id: order_id,
            user_id: None,
            session_id: "sess-1".into(),
            email: None,
            status: OrderStatus::Completed,
            payment_status: PaymentStatus::Paid,
            shipping_status: ShippingStatus::Delivered,
            return_status: ReturnStatus::None,
            subtotal: Money::from_cents(2500),
            discount: Money::zero(),
            shipping_cost: Money::from_cents(500),
            total_amount: Money::from_cents(3000),
            coupon_id: None,
            charge_ref: "cs_x".to_string(),
            ticket_number: Some(1),
            return_tracking_id: None,
            refund_doc_id: None,
            items,
            created_at: Utc::now(),
            paid_at: None,
            processing_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
            updated_at: Utc::now(),
        };

        let partial = draft_order(vec![a.clone(), b.clone()]);
        assert!(!partial.is_fully_returned());

        b.return_refunded_qty = 1;
        let full = draft_order(vec![a, b]);
        assert!(full.is_fully_returned());
    }

    #[test]
    fn test_requested_refund_total() {
        let mut a = item(2, 1000);
        let mut b = item(1, 500);
        a.return_requested_qty = 1;
        b.return_requested_qty = 1;

        let order = Order {
            id: OrderId::new(),
            user_id: None,
            session_id: "sess-1".into(),
            email: None,
            status: OrderStatus::Completed,
            payment_status: PaymentStatus::Paid,
            shipping_status: ShippingStatus::Delivered,
            return_status: ReturnStatus::Received,
            subtotal: Money::from_cents(2500),
            discount: Money::zero(),
            shipping_cost: Money::from_cents(500),
            total_amount: Money::from_cents(3000),
            coupon_id: None,
            charge_ref: "cs_x".to_string(),
            ticket_number: Some(1),
            return_tracking_id: None,
            refund_doc_id: None,
            items: vec![a, b],
            created_at: Utc::now(),
            paid_at: None,
            processing_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
            updated_at: Utc::now(),
        };

        // 1 × 10.00 + 1 × 5.00, shipping cost excluded.
        assert_eq!(order.requested_refund_total().cents(), 1500);
    }
}
