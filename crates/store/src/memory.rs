use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use common::{CouponId, Money, OrderId, ProductId, SessionId, UserId, VariantId};
use domain::{
    Coupon, CouponUsage, Customer, Notification, Order, OrderDraft, OrderStatus, PaymentStatus,
    Product, Reservation, ReturnStatus, SegmentRule, ShippingStatus, Variant,
};

use crate::catalog::CatalogStore;
use crate::coupons::CouponStore;
use crate::customers::CustomerStore;
use crate::inventory::InventoryStore;
use crate::notifications::NotificationStore;
use crate::orders::{CancelOutcome, FinalizeOutcome, OrderStore, ReturnSettlement};
use crate::{Result, StoreError};

#[derive(Default)]
struct MemoryState {
    products: HashMap<ProductId, Product>,
    variants: HashMap<VariantId, Variant>,
    reservations: HashMap<(SessionId, VariantId), Reservation>,
    orders: HashMap<OrderId, Order>,
    charge_index: HashMap<String, OrderId>,
    next_ticket: i64,
    coupons: HashMap<CouponId, Coupon>,
    assignments: HashMap<(CouponId, UserId), ()>,
    usages: HashMap<(CouponId, UserId), CouponUsage>,
    customers: HashMap<UserId, Customer>,
    notifications: Vec<Notification>,
}

impl MemoryState {
    fn reserved_by_others(
        &self,
        variant_id: VariantId,
        excluding: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> i64 {
        self.reservations
            .values()
            .filter(|r| {
                r.variant_id == variant_id
                    && excluding != Some(&r.session_id)
                    && !r.is_expired(now)
            })
            .map(|r| r.quantity as i64)
            .sum()
    }

    fn lifetime_spend(&self, user_id: UserId, since: Option<DateTime<Utc>>) -> Money {
        self.orders
            .values()
            .filter(|o| {
                o.user_id == Some(user_id)
                    && o.paid_at.is_some()
                    && o.status != OrderStatus::Cancelled
                    && since.is_none_or(|s| o.created_at >= s)
            })
            .map(|o| o.total_amount)
            .sum()
    }
}

/// In-memory store implementation.
///
/// All state lives behind one async mutex, so every operation is
/// serialized and gets the same all-or-nothing behavior the Postgres
/// implementation gets from transactions. Used in tests and for local
/// development without a database.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of reservation rows currently held.
    pub async fn reservation_count(&self) -> usize {
        self.state.lock().await.reservations.len()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn upsert_product(&self, product: Product) -> Result<()> {
        self.state.lock().await.products.insert(product.id, product);
        Ok(())
    }

    async fn product(&self, id: ProductId) -> Result<Option<Product>> {
        Ok(self.state.lock().await.products.get(&id).cloned())
    }

    async fn upsert_variant(&self, variant: Variant) -> Result<()> {
        self.state.lock().await.variants.insert(variant.id, variant);
        Ok(())
    }

    async fn variant(&self, id: VariantId) -> Result<Option<Variant>> {
        Ok(self.state.lock().await.variants.get(&id).cloned())
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn reserve(
        &self,
        session: &SessionId,
        variant_id: VariantId,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let mut state = self.state.lock().await;

        let stock_on_hand = state
            .variants
            .get(&variant_id)
            .ok_or_else(|| StoreError::not_found("variant", variant_id))?
            .stock_on_hand;

        let others = state.reserved_by_others(variant_id, Some(session), now);
        let available = stock_on_hand - others;
        if (quantity as i64) > available {
            return Err(StoreError::InsufficientStock {
                variant_id,
                requested: quantity,
                available: available.max(0) as u32,
            });
        }

        let reservation = Reservation {
            session_id: session.clone(),
            variant_id,
            quantity,
            expires_at: Reservation::expiry_from(now),
        };
        state
            .reservations
            .insert((session.clone(), variant_id), reservation.clone());
        Ok(reservation)
    }

    async fn release(&self, session: &SessionId, variant_id: VariantId) -> Result<()> {
        self.state
            .lock()
            .await
            .reservations
            .remove(&(session.clone(), variant_id));
        Ok(())
    }

    async fn release_session(&self, session: &SessionId) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.reservations.len();
        state.reservations.retain(|(s, _), _| s != session);
        Ok((before - state.reservations.len()) as u64)
    }

    async fn session_reservations(
        &self,
        session: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>> {
        let state = self.state.lock().await;
        let mut holds: Vec<_> = state
            .reservations
            .values()
            .filter(|r| &r.session_id == session && !r.is_expired(now))
            .cloned()
            .collect();
        holds.sort_by(|a, b| a.variant_id.as_uuid().cmp(&b.variant_id.as_uuid()));
        Ok(holds)
    }

    async fn available(
        &self,
        variant_id: VariantId,
        excluding: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let state = self.state.lock().await;
        let stock_on_hand = state
            .variants
            .get(&variant_id)
            .ok_or_else(|| StoreError::not_found("variant", variant_id))?
            .stock_on_hand;
        Ok(stock_on_hand - state.reserved_by_others(variant_id, excluding, now))
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.reservations.len();
        state.reservations.retain(|_, r| !r.is_expired(now));
        Ok((before - state.reservations.len()) as u64)
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_pending(
        &self,
        draft: OrderDraft,
        charge_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let mut state = self.state.lock().await;
        let order = draft.into_order(charge_ref.to_string(), now);
        state.charge_index.insert(charge_ref.to_string(), order.id);
        state.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn find_by_charge_ref(&self, charge_ref: &str) -> Result<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .charge_index
            .get(charge_ref)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        let state = self.state.lock().await;
        let mut orders: Vec<_> = state
            .orders
            .values()
            .filter(|o| o.user_id == Some(user_id))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn finalize(
        &self,
        charge_ref: &str,
        draft: Option<OrderDraft>,
        now: DateTime<Utc>,
    ) -> Result<FinalizeOutcome> {
        let mut state = self.state.lock().await;

        let mut order = match state
            .charge_index
            .get(charge_ref)
            .and_then(|id| state.orders.get(id))
            .cloned()
        {
            Some(order) => order,
            None => match draft {
                Some(draft) => {
                    let order = draft.into_order(charge_ref.to_string(), now);
                    state.charge_index.insert(charge_ref.to_string(), order.id);
                    state.orders.insert(order.id, order.clone());
                    order
                }
                None => return Err(StoreError::not_found("order", charge_ref)),
            },
        };

        // Duplicate webhook, or a pending order that got cancelled
        // before payment confirmation arrived: change nothing.
        if !order.status.can_mark_paid() {
            return Ok(FinalizeOutcome {
                order,
                newly_finalized: false,
            });
        }

        // Check every line before debiting any, so a shortfall leaves
        // no partial ledger change.
        for item in &order.items {
            let variant = state
                .variants
                .get(&item.variant_id)
                .ok_or_else(|| StoreError::not_found("variant", item.variant_id))?;
            if variant.stock_on_hand < item.quantity as i64 {
                return Err(StoreError::InsufficientStock {
                    variant_id: item.variant_id,
                    requested: item.quantity,
                    available: variant.stock_on_hand.max(0) as u32,
                });
            }
        }
        for item in &order.items {
            if let Some(variant) = state.variants.get_mut(&item.variant_id) {
                variant.stock_on_hand -= item.quantity as i64;
                variant.updated_at = now;
            }
        }

        // The holds protected stock that is now permanently committed.
        let session = order.session_id.clone();
        state.reservations.retain(|(s, _), _| s != &session);

        state.next_ticket += 1;
        order.ticket_number = Some(state.next_ticket);
        order.status = OrderStatus::Paid;
        order.payment_status = PaymentStatus::Paid;
        order.paid_at = Some(now);
        order.updated_at = now;
        state.orders.insert(order.id, order.clone());

        Ok(FinalizeOutcome {
            order,
            newly_finalized: true,
        })
    }

    async fn cancel(
        &self,
        id: OrderId,
        refund_doc_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome> {
        let mut state = self.state.lock().await;
        let mut order = state
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("order", id))?;

        if order.status == OrderStatus::Cancelled {
            return Ok(CancelOutcome {
                order,
                newly_cancelled: false,
                stock_credited: false,
            });
        }
        if !order.status.can_cancel() {
            return Err(StoreError::illegal_state(
                "order",
                id,
                format!("cannot cancel in status {}", order.status),
            ));
        }

        let stock_credited = if order.payment_status == PaymentStatus::Paid {
            for item in &order.items {
                if let Some(variant) = state.variants.get_mut(&item.variant_id) {
                    variant.stock_on_hand += item.quantity as i64;
                    variant.updated_at = now;
                }
            }
            true
        } else {
            // Pending order: stock was never debited, the holds just
            // stop mattering.
            let session = order.session_id.clone();
            state.reservations.retain(|(s, _), _| s != &session);
            false
        };

        order.status = OrderStatus::Cancelled;
        order.cancelled_at = Some(now);
        order.updated_at = now;
        if let Some(doc) = refund_doc_id {
            order.payment_status = PaymentStatus::Refunded;
            order.refund_doc_id = Some(doc);
        }
        state.orders.insert(order.id, order.clone());

        Ok(CancelOutcome {
            order,
            newly_cancelled: true,
            stock_credited,
        })
    }

    async fn set_shipping(
        &self,
        id: OrderId,
        shipping: ShippingStatus,
        commercial: Option<OrderStatus>,
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("order", id))?;

        order.shipping_status = shipping;
        match shipping {
            ShippingStatus::Shipped => order.shipped_at = order.shipped_at.or(Some(now)),
            ShippingStatus::Delivered => order.delivered_at = order.delivered_at.or(Some(now)),
            _ => {}
        }
        if let Some(status) = commercial {
            order.status = status;
            if status == OrderStatus::Processing {
                order.processing_at = order.processing_at.or(Some(now));
            }
        }
        order.updated_at = now;
        Ok(order.clone())
    }

    async fn mark_return_requested(
        &self,
        id: OrderId,
        tracking_id: &str,
        lines: &[(VariantId, u32)],
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("order", id))?;

        for (variant_id, qty) in lines {
            let item = order
                .items
                .iter_mut()
                .find(|i| i.variant_id == *variant_id)
                .ok_or_else(|| StoreError::not_found("order line", variant_id))?;
            if qty + item.return_refunded_qty > item.quantity {
                return Err(StoreError::illegal_state(
                    "order line",
                    variant_id,
                    format!(
                        "requested return of {qty} exceeds returnable {}",
                        item.quantity - item.return_refunded_qty
                    ),
                ));
            }
            item.return_requested_qty = *qty;
        }

        order.return_status = ReturnStatus::Requested;
        order.return_tracking_id = Some(tracking_id.to_string());
        order.updated_at = now;
        Ok(order.clone())
    }

    async fn set_return_status(
        &self,
        id: OrderId,
        status: ReturnStatus,
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("order", id))?;
        order.return_status = status;
        order.updated_at = now;
        Ok(order.clone())
    }

    async fn cancel_return(&self, id: OrderId, now: DateTime<Utc>) -> Result<Order> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("order", id))?;
        for item in &mut order.items {
            item.return_requested_qty = 0;
        }
        order.return_status = ReturnStatus::CancelledDuringReturn;
        order.updated_at = now;
        Ok(order.clone())
    }

    async fn settle_return(
        &self,
        id: OrderId,
        refund_doc_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ReturnSettlement> {
        let mut state = self.state.lock().await;
        let mut order = state
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("order", id))?;

        if order.return_status != ReturnStatus::Received {
            return Err(StoreError::illegal_state(
                "order",
                id,
                format!("cannot settle return in status {}", order.return_status),
            ));
        }

        let amount = order.requested_refund_total();

        let credits: Vec<(VariantId, u32)> = order
            .items
            .iter()
            .filter(|i| i.return_requested_qty > 0)
            .map(|i| (i.variant_id, i.return_requested_qty))
            .collect();
        for (variant_id, qty) in &credits {
            if let Some(variant) = state.variants.get_mut(variant_id) {
                variant.stock_on_hand += *qty as i64;
                variant.updated_at = now;
            }
        }
        for item in &mut order.items {
            item.return_received_qty += item.return_requested_qty;
            item.return_refunded_qty += item.return_requested_qty;
            item.return_requested_qty = 0;
        }

        let fully_returned = order.is_fully_returned();
        order.return_status = ReturnStatus::Refunded;
        if let Some(doc) = refund_doc_id {
            order.payment_status = if fully_returned {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::PartiallyRefunded
            };
            order.refund_doc_id = Some(doc);
        }
        if fully_returned {
            // A fully-returned order is logically a cancelled sale.
            order.status = OrderStatus::Cancelled;
            order.cancelled_at = order.cancelled_at.or(Some(now));
        }
        order.updated_at = now;
        state.orders.insert(order.id, order.clone());

        Ok(ReturnSettlement {
            order,
            amount,
            fully_returned,
        })
    }
}

#[async_trait]
impl CouponStore for MemoryStore {
    async fn insert_coupon(&self, coupon: Coupon) -> Result<()> {
        self.state.lock().await.coupons.insert(coupon.id, coupon);
        Ok(())
    }

    async fn coupon_by_code(&self, code: &str) -> Result<Option<Coupon>> {
        let state = self.state.lock().await;
        Ok(state.coupons.values().find(|c| c.code == code).cloned())
    }

    async fn coupon(&self, id: CouponId) -> Result<Option<Coupon>> {
        Ok(self.state.lock().await.coupons.get(&id).cloned())
    }

    async fn assign(&self, coupon_id: CouponId, user_id: UserId) -> Result<()> {
        self.state
            .lock()
            .await
            .assignments
            .insert((coupon_id, user_id), ());
        Ok(())
    }

    async fn is_assigned(&self, coupon_id: CouponId, user_id: UserId) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .await
            .assignments
            .contains_key(&(coupon_id, user_id)))
    }

    async fn usage_exists(&self, coupon_id: CouponId, user_id: UserId) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .await
            .usages
            .contains_key(&(coupon_id, user_id)))
    }

    async fn record_usage(&self, usage: CouponUsage) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = (usage.coupon_id, usage.user_id);
        if state.usages.contains_key(&key) {
            return Ok(false);
        }
        state.usages.insert(key, usage);
        Ok(true)
    }

    async fn eligible_customers(
        &self,
        rule: &SegmentRule,
        now: DateTime<Utc>,
    ) -> Result<Vec<Customer>> {
        let state = self.state.lock().await;
        let mut matched: Vec<Customer> = state
            .customers
            .values()
            .filter(|c| match rule {
                SegmentRule::MinimumSpend { min } => state.lifetime_spend(c.id, None) >= *min,
                SegmentRule::SpendInPeriod { min, since } => {
                    state.lifetime_spend(c.id, Some(*since)) >= *min
                }
                SegmentRule::FirstPurchase => {
                    !state
                        .orders
                        .values()
                        .any(|o| o.user_id == Some(c.id) && o.paid_at.is_some())
                }
                SegmentRule::AccountAge { min_days } => {
                    c.created_at <= now - TimeDelta::days(*min_days)
                }
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(matched)
    }
}

#[async_trait]
impl CustomerStore for MemoryStore {
    async fn upsert_customer(&self, customer: Customer) -> Result<()> {
        self.state
            .lock()
            .await
            .customers
            .insert(customer.id, customer);
        Ok(())
    }

    async fn customer(&self, id: UserId) -> Result<Option<Customer>> {
        Ok(self.state.lock().await.customers.get(&id).cloned())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn push(&self, notification: Notification) -> Result<()> {
        self.state.lock().await.notifications.push(notification);
        Ok(())
    }

    async fn has_unread_tagged(&self, user_id: UserId, tag: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .await
            .notifications
            .iter()
            .any(|n| n.user_id == user_id && !n.read && n.tag.as_deref() == Some(tag)))
    }

    async fn notifications_for(&self, user_id: UserId) -> Result<Vec<Notification>> {
        let state = self.state.lock().await;
        let mut list: Vec<_> = state
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Money;
    use domain::DraftLine;

    async fn seed_variant(store: &MemoryStore, stock: i64) -> VariantId {
        let product = Product {
            id: ProductId::new(),
            name: "Linen shirt".to_string(),
            unit_price: Money::from_cents(1000),
            active: true,
        };
        let variant = Variant::new(product.id, "M", stock);
        let variant_id = variant.id;
        store.upsert_product(product).await.unwrap();
        store.upsert_variant(variant).await.unwrap();
        variant_id
    }

    fn draft(session: &str, lines: Vec<DraftLine>) -> OrderDraft {
        let subtotal: Money = lines
            .iter()
            .map(|l| l.price_at_time.multiply(l.quantity))
            .sum();
        OrderDraft {
            order_id: OrderId::new(),
            session_id: session.into(),
            user_id: None,
            email: Some("buyer@example.com".to_string()),
            lines,
            subtotal,
            discount: Money::zero(),
            shipping_cost: Money::from_cents(500),
            total_amount: subtotal + Money::from_cents(500),
            coupon_id: None,
            amount_saved: Money::zero(),
        }
    }

    fn line(variant_id: VariantId, quantity: u32, price: i64) -> DraftLine {
        DraftLine {
            product_id: ProductId::new(),
            variant_id,
            product_name: "Linen shirt".to_string(),
            quantity,
            price_at_time: Money::from_cents(price),
        }
    }

    #[tokio::test]
    async fn reserve_within_availability() {
        let store = MemoryStore::new();
        let variant_id = seed_variant(&store, 5).await;
        let now = Utc::now();

        let hold = store.reserve(&"s1".into(), variant_id, 3, now).await.unwrap();
        assert_eq!(hold.quantity, 3);
        assert_eq!(hold.expires_at, now + TimeDelta::minutes(20));

        // Other sessions see 2 left; the holder could go up to 5.
        assert_eq!(
            store.available(variant_id, Some(&"s2".into()), now).await.unwrap(),
            2
        );
        assert_eq!(
            store.available(variant_id, Some(&"s1".into()), now).await.unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn oversell_fails_and_mutates_nothing() {
        let store = MemoryStore::new();
        let variant_id = seed_variant(&store, 3).await;
        let now = Utc::now();

        store.reserve(&"s1".into(), variant_id, 3, now).await.unwrap();

        let err = store.reserve(&"s2".into(), variant_id, 1, now).await.unwrap_err();
        match err {
            StoreError::InsufficientStock {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 1);
                assert_eq!(available, 0);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 3);
        assert_eq!(store.reservation_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_reservations_get_one_winner() {
        let store = MemoryStore::new();
        let variant_id = seed_variant(&store, 3).await;
        let now = Utc::now();

        let a = {
            let store = store.clone();
            let session: SessionId = "s1".into();
            tokio::spawn(async move { store.reserve(&session, variant_id, 2, now).await })
        };
        let b = {
            let store = store.clone();
            let session: SessionId = "s2".into();
            tokio::spawn(async move { store.reserve(&session, variant_id, 2, now).await })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1, "exactly one of the two racing holds wins");
        let failure = if a.is_err() { a } else { b };
        assert!(matches!(
            failure.unwrap_err(),
            StoreError::InsufficientStock { available: 1, .. }
        ));
    }

    #[tokio::test]
    async fn re_reserve_refreshes_ttl_without_stacking() {
        let store = MemoryStore::new();
        let variant_id = seed_variant(&store, 5).await;
        let now = Utc::now();

        store.reserve(&"s1".into(), variant_id, 2, now).await.unwrap();
        let later = now + TimeDelta::minutes(5);
        let hold = store.reserve(&"s1".into(), variant_id, 2, later).await.unwrap();

        assert_eq!(hold.expires_at, later + TimeDelta::minutes(20));
        assert_eq!(store.reservation_count().await, 1);
        assert_eq!(
            store.available(variant_id, Some(&"s2".into()), later).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = MemoryStore::new();
        let variant_id = seed_variant(&store, 5).await;
        let now = Utc::now();

        store.reserve(&"s1".into(), variant_id, 2, now).await.unwrap();
        store.release(&"s1".into(), variant_id).await.unwrap();
        store.release(&"s1".into(), variant_id).await.unwrap();
        assert_eq!(store.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_reclaims_only_expired_holds() {
        let store = MemoryStore::new();
        let variant_id = seed_variant(&store, 5).await;
        let now = Utc::now();

        store.reserve(&"s1".into(), variant_id, 2, now).await.unwrap();
        store
            .reserve(&"s2".into(), variant_id, 1, now + TimeDelta::minutes(15))
            .await
            .unwrap();

        // 21 minutes on: s1's hold is past its TTL, s2's is not.
        let sweep_at = now + TimeDelta::minutes(21);
        let removed = store.sweep_expired(sweep_at).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.reservation_count().await, 1);
        assert_eq!(
            store.available(variant_id, None, sweep_at).await.unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn expired_hold_frees_availability_before_sweep() {
        let store = MemoryStore::new();
        let variant_id = seed_variant(&store, 3).await;
        let now = Utc::now();

        store.reserve(&"s1".into(), variant_id, 3, now).await.unwrap();
        let err = store.reserve(&"s2".into(), variant_id, 1, now).await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientStock { .. }));

        // Availability computations ignore expired holds even before
        // the sweep physically removes the row.
        let after_expiry = now + TimeDelta::minutes(21);
        let hold = store
            .reserve(&"s2".into(), variant_id, 1, after_expiry)
            .await
            .unwrap();
        assert_eq!(hold.quantity, 1);
    }

    #[tokio::test]
    async fn finalize_debits_stock_and_is_idempotent() {
        let store = MemoryStore::new();
        let variant_id = seed_variant(&store, 5).await;
        let now = Utc::now();

        store.reserve(&"s1".into(), variant_id, 2, now).await.unwrap();
        let draft = draft("s1", vec![line(variant_id, 2, 1000)]);
        store.insert_pending(draft, "cs_1", now).await.unwrap();

        let first = store.finalize("cs_1", None, now).await.unwrap();
        assert!(first.newly_finalized);
        assert_eq!(first.order.status, OrderStatus::Paid);
        assert_eq!(first.order.ticket_number, Some(1));
        assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 3);
        assert_eq!(store.reservation_count().await, 0);

        // Duplicate webhook: nothing changes.
        let second = store.finalize("cs_1", None, now).await.unwrap();
        assert!(!second.newly_finalized);
        assert_eq!(second.order.ticket_number, Some(1));
        assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn finalize_creates_from_draft_when_order_missing() {
        let store = MemoryStore::new();
        let variant_id = seed_variant(&store, 5).await;
        let now = Utc::now();

        let err = store.finalize("cs_lost", None, now).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        let draft = draft("s1", vec![line(variant_id, 1, 1000)]);
        let outcome = store.finalize("cs_lost", Some(draft), now).await.unwrap();
        assert!(outcome.newly_finalized);
        assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn finalize_shortfall_leaves_no_partial_state() {
        let store = MemoryStore::new();
        let well_stocked = seed_variant(&store, 10).await;
        let scarce = seed_variant(&store, 1).await;
        let now = Utc::now();

        let draft = draft(
            "s1",
            vec![line(well_stocked, 2, 1000), line(scarce, 2, 500)],
        );
        store.insert_pending(draft, "cs_2", now).await.unwrap();

        let err = store.finalize("cs_2", None, now).await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientStock { .. }));

        // Neither line was debited and the order is still pending.
        assert_eq!(store.stock_on_hand(well_stocked).await.unwrap(), 10);
        assert_eq!(store.stock_on_hand(scarce).await.unwrap(), 1);
        let order = store.find_by_charge_ref("cs_2").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_paid_credits_stock_exactly_once() {
        let store = MemoryStore::new();
        let variant_id = seed_variant(&store, 5).await;
        let now = Utc::now();

        let draft = draft("s1", vec![line(variant_id, 2, 1000)]);
        let order = store.insert_pending(draft, "cs_3", now).await.unwrap();
        store.finalize("cs_3", None, now).await.unwrap();
        assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 3);

        let first = store
            .cancel(order.id, Some("re_1".to_string()), now)
            .await
            .unwrap();
        assert!(first.newly_cancelled);
        assert!(first.stock_credited);
        assert_eq!(first.order.payment_status, PaymentStatus::Refunded);
        assert_eq!(first.order.refund_doc_id.as_deref(), Some("re_1"));
        assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 5);

        let second = store.cancel(order.id, None, now).await.unwrap();
        assert!(!second.newly_cancelled);
        assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn cancel_pending_releases_holds_without_credit() {
        let store = MemoryStore::new();
        let variant_id = seed_variant(&store, 5).await;
        let now = Utc::now();

        store.reserve(&"s1".into(), variant_id, 2, now).await.unwrap();
        let draft = draft("s1", vec![line(variant_id, 2, 1000)]);
        let order = store.insert_pending(draft, "cs_4", now).await.unwrap();

        let outcome = store.cancel(order.id, None, now).await.unwrap();
        assert!(outcome.newly_cancelled);
        assert!(!outcome.stock_credited);
        assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 5);
        assert_eq!(store.reservation_count().await, 0);

        // A late webhook must not resurrect the cancelled order.
        let late = store.finalize("cs_4", None, now).await.unwrap();
        assert!(!late.newly_finalized);
        assert_eq!(late.order.status, OrderStatus::Cancelled);
        assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn settle_return_credits_and_promotes_when_fully_returned() {
        let store = MemoryStore::new();
        let variant_id = seed_variant(&store, 5).await;
        let now = Utc::now();

        let draft = draft("s1", vec![line(variant_id, 2, 1000)]);
        let order = store.insert_pending(draft, "cs_5", now).await.unwrap();
        store.finalize("cs_5", None, now).await.unwrap();
        store
            .set_shipping(
                order.id,
                ShippingStatus::Delivered,
                Some(OrderStatus::Completed),
                now,
            )
            .await
            .unwrap();

        store
            .mark_return_requested(order.id, "RET-1", &[(variant_id, 2)], now)
            .await
            .unwrap();
        store
            .set_return_status(order.id, ReturnStatus::Received, now)
            .await
            .unwrap();

        let settlement = store
            .settle_return(order.id, Some("re_9".to_string()), now)
            .await
            .unwrap();
        assert_eq!(settlement.amount.cents(), 2000);
        assert!(settlement.fully_returned);
        assert_eq!(settlement.order.status, OrderStatus::Cancelled);
        assert_eq!(settlement.order.return_status, ReturnStatus::Refunded);
        assert_eq!(settlement.order.payment_status, PaymentStatus::Refunded);
        assert_eq!(store.stock_on_hand(variant_id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn record_usage_enforces_single_use() {
        let store = MemoryStore::new();
        let coupon_id = CouponId::new();
        let user_id = UserId::new();

        let usage = CouponUsage {
            coupon_id,
            user_id,
            order_id: OrderId::new(),
            amount_saved: Money::from_cents(500),
            used_at: Utc::now(),
        };
        assert!(store.record_usage(usage.clone()).await.unwrap());
        assert!(!store.record_usage(usage).await.unwrap());
        assert!(store.usage_exists(coupon_id, user_id).await.unwrap());
    }

    #[tokio::test]
    async fn eligible_customers_by_rule() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let variant_id = seed_variant(&store, 50).await;

        let big_spender = Customer {
            id: UserId::new(),
            email: "a@example.com".to_string(),
            created_at: now - TimeDelta::days(400),
        };
        let newcomer = Customer {
            id: UserId::new(),
            email: "b@example.com".to_string(),
            created_at: now - TimeDelta::days(3),
        };
        store.upsert_customer(big_spender.clone()).await.unwrap();
        store.upsert_customer(newcomer.clone()).await.unwrap();

        let mut d = draft("s1", vec![line(variant_id, 2, 10_000)]);
        d.user_id = Some(big_spender.id);
        store.insert_pending(d, "cs_6", now).await.unwrap();
        store.finalize("cs_6", None, now).await.unwrap();

        let spenders = store
            .eligible_customers(
                &SegmentRule::MinimumSpend {
                    min: Money::from_cents(20_000),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(spenders.len(), 1);
        assert_eq!(spenders[0].id, big_spender.id);

        let first_timers = store
            .eligible_customers(&SegmentRule::FirstPurchase, now)
            .await
            .unwrap();
        assert_eq!(first_timers.len(), 1);
        assert_eq!(first_timers[0].id, newcomer.id);

        let seasoned = store
            .eligible_customers(&SegmentRule::AccountAge { min_days: 30 }, now)
            .await
            .unwrap();
        assert_eq!(seasoned.len(), 1);
        assert_eq!(seasoned[0].id, big_spender.id);
    }
}
