use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Money, OrderId, UserId, VariantId};
use domain::{Order, OrderDraft, OrderStatus, ReturnStatus, ShippingStatus};

use crate::Result;

/// Outcome of a finalize call.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub order: Order,
    /// False when the charge reference had already been finalized
    /// (duplicate webhook delivery).
    pub newly_finalized: bool,
}

/// Outcome of a cancel call.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub order: Order,
    /// False when the order was already cancelled (idempotent no-op).
    pub newly_cancelled: bool,
    /// True when on-hand stock was credited back; false for orders
    /// whose stock was never debited (still pending at cancel time).
    pub stock_credited: bool,
}

/// Outcome of a return settlement.
#[derive(Debug, Clone)]
pub struct ReturnSettlement {
    pub order: Order,
    /// `Σ(price_at_time × return_requested_qty)`, shipping excluded.
    pub amount: Money,
    /// True when, after this settlement, every line is fully refunded.
    pub fully_returned: bool,
}

/// Persistence for the order aggregate.
///
/// The lifecycle controller validates transitions; the mutating
/// methods here each run as one transaction and re-check only what a
/// concurrent writer could have invalidated (already finalized,
/// already cancelled, stock shortfall).
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts the checkout draft as a pending order.
    async fn insert_pending(
        &self,
        draft: OrderDraft,
        charge_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Order>;

    /// Loads an order with its items.
    async fn order(&self, id: OrderId) -> Result<Option<Order>>;

    /// Loads an order by its gateway charge reference.
    async fn find_by_charge_ref(&self, charge_ref: &str) -> Result<Option<Order>>;

    /// All orders for a customer, newest first.
    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>>;

    /// Converts a paid checkout into a permanent order, idempotently.
    ///
    /// One transaction keyed on `charge_ref`: when the order is still
    /// pending it debits `stock_on_hand` per line (any shortfall
    /// aborts the whole transaction), drops the session's holds,
    /// assigns the next ticket number, and stamps the order paid.
    /// When the reference was already finalized nothing changes and
    /// `newly_finalized` is false. When no order exists for the
    /// reference, `draft` (recovered from the charge-session
    /// metadata) is inserted and finalized in the same transaction;
    /// without a draft the call fails with `NotFound`.
    async fn finalize(
        &self,
        charge_ref: &str,
        draft: Option<OrderDraft>,
        now: DateTime<Utc>,
    ) -> Result<FinalizeOutcome>;

    /// Cancels an order.
    ///
    /// No-op success when already cancelled. Credits stock for every
    /// line when the order had been finalized (stock was debited);
    /// releases the session's holds instead when it was still
    /// pending. `refund_doc_id` being present means a gateway refund
    /// was issued: payment status becomes refunded and the document
    /// reference is stamped.
    async fn cancel(
        &self,
        id: OrderId,
        refund_doc_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome>;

    /// Persists a shipping-axis move plus the commercial status the
    /// controller derived from it, stamping the matching timestamps.
    async fn set_shipping(
        &self,
        id: OrderId,
        shipping: ShippingStatus,
        commercial: Option<OrderStatus>,
        now: DateTime<Utc>,
    ) -> Result<Order>;

    /// Opens a return cycle: stamps the tracking id, sets the
    /// return status to requested, and records the requested quantity
    /// per line. Quantities beyond a line's remaining returnable
    /// amount fail the whole transaction.
    async fn mark_return_requested(
        &self,
        id: OrderId,
        tracking_id: &str,
        lines: &[(VariantId, u32)],
        now: DateTime<Utc>,
    ) -> Result<Order>;

    /// Persists an intermediate return-axis move (handed to carrier,
    /// received).
    async fn set_return_status(
        &self,
        id: OrderId,
        status: ReturnStatus,
        now: DateTime<Utc>,
    ) -> Result<Order>;

    /// Aborts the open return cycle: zeroes requested quantities and
    /// sets `cancelled_during_return`.
    async fn cancel_return(&self, id: OrderId, now: DateTime<Utc>) -> Result<Order>;

    /// Settles a received return in one transaction: credits stock
    /// per requested unit, folds requested into refunded quantities,
    /// sets the return status to refunded, and promotes the order to
    /// cancelled when every line is now fully refunded. A present
    /// `refund_doc_id` additionally marks the payment refunded or
    /// partially refunded.
    async fn settle_return(
        &self,
        id: OrderId,
        refund_doc_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ReturnSettlement>;
}
