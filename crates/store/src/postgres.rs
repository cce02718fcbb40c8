use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use common::{CouponId, Money, OrderId, ProductId, SessionId, UserId, VariantId};
use domain::{
    Coupon, CouponUsage, Customer, Notification, Order, OrderDraft, OrderItem, OrderStatus,
    PaymentStatus, Product, Reservation, ReturnStatus, SegmentRule, ShippingStatus, Variant,
};

use crate::catalog::CatalogStore;
use crate::coupons::CouponStore;
use crate::customers::CustomerStore;
use crate::inventory::InventoryStore;
use crate::notifications::NotificationStore;
use crate::orders::{CancelOutcome, FinalizeOutcome, OrderStore, ReturnSettlement};
use crate::{Result, StoreError};

const ORDER_COLUMNS: &str = "id, user_id, session_id, email, status, payment_status, \
     shipping_status, return_status, subtotal_cents, discount_cents, shipping_cost_cents, \
     total_cents, coupon_id, charge_ref, ticket_number, return_tracking_id, refund_doc_id, \
     created_at, paid_at, processing_at, shipped_at, delivered_at, cancelled_at, updated_at";

/// PostgreSQL-backed store implementation.
///
/// Every mutating method runs inside one transaction. Mutations that
/// check-then-write an order take `FOR UPDATE` on the order row first;
/// stock debits are conditional updates so a shortfall can never go
/// negative under concurrency.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

fn parse_enum<T: DeserializeOwned>(value: String) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(value))?)
}

fn row_to_variant(row: PgRow) -> Result<Variant> {
    Ok(Variant {
        id: VariantId::from_uuid(row.try_get::<Uuid, _>("id")?),
        product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
        size: row.try_get("size")?,
        stock_on_hand: row.try_get("stock_on_hand")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_product(row: PgRow) -> Result<Product> {
    Ok(Product {
        id: ProductId::from_uuid(row.try_get::<Uuid, _>("id")?),
        name: row.try_get("name")?,
        unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
        active: row.try_get("active")?,
    })
}

fn row_to_reservation(row: PgRow) -> Result<Reservation> {
    Ok(Reservation {
        session_id: SessionId::new(row.try_get::<String, _>("session_id")?),
        variant_id: VariantId::from_uuid(row.try_get::<Uuid, _>("variant_id")?),
        quantity: row.try_get::<i32, _>("quantity")? as u32,
        expires_at: row.try_get("expires_at")?,
    })
}

fn row_to_order_header(row: PgRow) -> Result<Order> {
    Ok(Order {
        id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
        user_id: row.try_get::<Option<Uuid>, _>("user_id")?.map(UserId::from_uuid),
        session_id: SessionId::new(row.try_get::<String, _>("session_id")?),
        email: row.try_get("email")?,
        status: parse_enum::<OrderStatus>(row.try_get("status")?)?,
        payment_status: parse_enum::<PaymentStatus>(row.try_get("payment_status")?)?,
        shipping_status: parse_enum::<ShippingStatus>(row.try_get("shipping_status")?)?,
        return_status: parse_enum::<ReturnStatus>(row.try_get("return_status")?)?,
        subtotal: Money::from_cents(row.try_get("subtotal_cents")?),
        discount: Money::from_cents(row.try_get("discount_cents")?),
        shipping_cost: Money::from_cents(row.try_get("shipping_cost_cents")?),
        total_amount: Money::from_cents(row.try_get("total_cents")?),
        coupon_id: row.try_get::<Option<Uuid>, _>("coupon_id")?.map(CouponId::from_uuid),
        charge_ref: row.try_get("charge_ref")?,
        ticket_number: row.try_get("ticket_number")?,
        return_tracking_id: row.try_get("return_tracking_id")?,
        refund_doc_id: row.try_get("refund_doc_id")?,
        items: Vec::new(),
        created_at: row.try_get("created_at")?,
        paid_at: row.try_get("paid_at")?,
        processing_at: row.try_get("processing_at")?,
        shipped_at: row.try_get("shipped_at")?,
        delivered_at: row.try_get("delivered_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_item(row: PgRow) -> Result<OrderItem> {
    Ok(OrderItem {
        order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
        product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
        variant_id: VariantId::from_uuid(row.try_get::<Uuid, _>("variant_id")?),
        product_name: row.try_get("product_name")?,
        quantity: row.try_get::<i32, _>("quantity")? as u32,
        price_at_time: Money::from_cents(row.try_get("price_at_time_cents")?),
        return_requested_qty: row.try_get::<i32, _>("return_requested_qty")? as u32,
        return_received_qty: row.try_get::<i32, _>("return_received_qty")? as u32,
        return_refunded_qty: row.try_get::<i32, _>("return_refunded_qty")? as u32,
    })
}

fn row_to_coupon(row: PgRow) -> Result<Coupon> {
    Ok(Coupon {
        id: CouponId::from_uuid(row.try_get::<Uuid, _>("id")?),
        code: row.try_get("code")?,
        discount_percent: row.try_get::<i32, _>("discount_percent")? as u32,
        expires_at: row.try_get("expires_at")?,
        is_public: row.try_get("is_public")?,
        active: row.try_get("active")?,
    })
}

fn row_to_customer(row: PgRow) -> Result<Customer> {
    Ok(Customer {
        id: UserId::from_uuid(row.try_get::<Uuid, _>("id")?),
        email: row.try_get("email")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_notification(row: PgRow) -> Result<Notification> {
    Ok(Notification {
        id: row.try_get("id")?,
        user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        tag: row.try_get("tag")?,
        read: row.try_get("read")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn fetch_items_tx(
    tx: &mut Transaction<'_, Postgres>,
    order_id: OrderId,
) -> Result<Vec<OrderItem>> {
    let rows = sqlx::query(
        "SELECT order_id, product_id, variant_id, product_name, quantity, price_at_time_cents, \
         return_requested_qty, return_received_qty, return_refunded_qty \
         FROM order_items WHERE order_id = $1 ORDER BY variant_id",
    )
    .bind(order_id.as_uuid())
    .fetch_all(&mut **tx)
    .await?;
    rows.into_iter().map(row_to_item).collect()
}

/// Locks the order row for the charge reference and loads it with its
/// items.
async fn fetch_order_for_update_by_ref(
    tx: &mut Transaction<'_, Postgres>,
    charge_ref: &str,
) -> Result<Option<Order>> {
    let row = sqlx::query(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE charge_ref = $1 FOR UPDATE"
    ))
    .bind(charge_ref)
    .fetch_optional(&mut **tx)
    .await?;

    match row {
        Some(row) => {
            let mut order = row_to_order_header(row)?;
            order.items = fetch_items_tx(tx, order.id).await?;
            Ok(Some(order))
        }
        None => Ok(None),
    }
}

async fn fetch_order_for_update(
    tx: &mut Transaction<'_, Postgres>,
    id: OrderId,
) -> Result<Order> {
    let row = sqlx::query(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut **tx)
    .await?;

    let mut order = match row {
        Some(row) => row_to_order_header(row)?,
        None => return Err(StoreError::not_found("order", id)),
    };
    order.items = fetch_items_tx(tx, order.id).await?;
    Ok(order)
}

/// Inserts the order header and its lines inside the transaction.
async fn insert_order_tx(tx: &mut Transaction<'_, Postgres>, order: &Order) -> Result<()> {
    sqlx::query(
        "INSERT INTO orders (id, user_id, session_id, email, status, payment_status, \
         shipping_status, return_status, subtotal_cents, discount_cents, shipping_cost_cents, \
         total_cents, coupon_id, charge_ref, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
         ON CONFLICT (charge_ref) DO NOTHING",
    )
    .bind(order.id.as_uuid())
    .bind(order.user_id.map(|u| u.as_uuid()))
    .bind(order.session_id.as_str())
    .bind(&order.email)
    .bind(order.status.as_str())
    .bind(order.payment_status.as_str())
    .bind(order.shipping_status.as_str())
    .bind(order.return_status.as_str())
    .bind(order.subtotal.cents())
    .bind(order.discount.cents())
    .bind(order.shipping_cost.cents())
    .bind(order.total_amount.cents())
    .bind(order.coupon_id.map(|c| c.as_uuid()))
    .bind(&order.charge_ref)
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(&mut **tx)
    .await?;

    for item in &order.items {
        sqlx::query(
            "INSERT INTO order_items (order_id, product_id, variant_id, product_name, quantity, \
             price_at_time_cents) VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (order_id, variant_id) DO NOTHING",
        )
        .bind(item.order_id.as_uuid())
        .bind(item.product_id.as_uuid())
        .bind(item.variant_id.as_uuid())
        .bind(&item.product_name)
        .bind(item.quantity as i32)
        .bind(item.price_at_time.cents())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Debits one line's stock, failing with the observed availability
/// when the conditional update matches no row.
async fn debit_stock_tx(
    tx: &mut Transaction<'_, Postgres>,
    variant_id: VariantId,
    quantity: u32,
    now: DateTime<Utc>,
) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE variants SET stock_on_hand = stock_on_hand - $1, updated_at = $2 \
         WHERE id = $3 AND stock_on_hand >= $1",
    )
    .bind(quantity as i64)
    .bind(now)
    .bind(variant_id.as_uuid())
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if updated == 0 {
        let available: Option<i64> =
            sqlx::query_scalar("SELECT stock_on_hand FROM variants WHERE id = $1 FOR UPDATE")
                .bind(variant_id.as_uuid())
                .fetch_optional(&mut **tx)
                .await?;
        return match available {
            Some(available) => Err(StoreError::InsufficientStock {
                variant_id,
                requested: quantity,
                available: available.max(0) as u32,
            }),
            None => Err(StoreError::not_found("variant", variant_id)),
        };
    }
    Ok(())
}

async fn credit_stock_tx(
    tx: &mut Transaction<'_, Postgres>,
    variant_id: VariantId,
    quantity: u32,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE variants SET stock_on_hand = stock_on_hand + $1, updated_at = $2 WHERE id = $3")
        .bind(quantity as i64)
        .bind(now)
        .bind(variant_id.as_uuid())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl CatalogStore for PostgresStore {
    async fn upsert_product(&self, product: Product) -> Result<()> {
        sqlx::query(
            "INSERT INTO products (id, name, unit_price_cents, active) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, \
             unit_price_cents = EXCLUDED.unit_price_cents, active = EXCLUDED.active",
        )
        .bind(product.id.as_uuid())
        .bind(&product.name)
        .bind(product.unit_price.cents())
        .bind(product.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn product(&self, id: ProductId) -> Result<Option<Product>> {
        let row = sqlx::query("SELECT id, name, unit_price_cents, active FROM products WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_product).transpose()
    }

    async fn upsert_variant(&self, variant: Variant) -> Result<()> {
        sqlx::query(
            "INSERT INTO variants (id, product_id, size, stock_on_hand, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET size = EXCLUDED.size, \
             stock_on_hand = EXCLUDED.stock_on_hand, updated_at = EXCLUDED.updated_at",
        )
        .bind(variant.id.as_uuid())
        .bind(variant.product_id.as_uuid())
        .bind(&variant.size)
        .bind(variant.stock_on_hand)
        .bind(variant.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn variant(&self, id: VariantId) -> Result<Option<Variant>> {
        let row = sqlx::query(
            "SELECT id, product_id, size, stock_on_hand, updated_at FROM variants WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_variant).transpose()
    }
}

#[async_trait]
impl InventoryStore for PostgresStore {
    async fn reserve(
        &self,
        session: &SessionId,
        variant_id: VariantId,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let mut tx = self.pool.begin().await?;

        // Lock the variant row so concurrent reservations serialize
        // on the availability computation.
        let stock_on_hand: Option<i64> =
            sqlx::query_scalar("SELECT stock_on_hand FROM variants WHERE id = $1 FOR UPDATE")
                .bind(variant_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        let stock_on_hand =
            stock_on_hand.ok_or_else(|| StoreError::not_found("variant", variant_id))?;

        let reserved_by_others: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(quantity), 0) FROM reservations \
             WHERE variant_id = $1 AND session_id <> $2 AND expires_at >= $3",
        )
        .bind(variant_id.as_uuid())
        .bind(session.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let available = stock_on_hand - reserved_by_others;
        if (quantity as i64) > available {
            return Err(StoreError::InsufficientStock {
                variant_id,
                requested: quantity,
                available: available.max(0) as u32,
            });
        }

        let expires_at = Reservation::expiry_from(now);
        sqlx::query(
            "INSERT INTO reservations (session_id, variant_id, quantity, expires_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (session_id, variant_id) DO UPDATE \
             SET quantity = EXCLUDED.quantity, expires_at = EXCLUDED.expires_at",
        )
        .bind(session.as_str())
        .bind(variant_id.as_uuid())
        .bind(quantity as i32)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Reservation {
            session_id: session.clone(),
            variant_id,
            quantity,
            expires_at,
        })
    }

    async fn release(&self, session: &SessionId, variant_id: VariantId) -> Result<()> {
        sqlx::query("DELETE FROM reservations WHERE session_id = $1 AND variant_id = $2")
            .bind(session.as_str())
            .bind(variant_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_session(&self, session: &SessionId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM reservations WHERE session_id = $1")
            .bind(session.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn session_reservations(
        &self,
        session: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(
            "SELECT session_id, variant_id, quantity, expires_at FROM reservations \
             WHERE session_id = $1 AND expires_at >= $2 ORDER BY variant_id",
        )
        .bind(session.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_reservation).collect()
    }

    async fn available(
        &self,
        variant_id: VariantId,
        excluding: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let stock_on_hand: Option<i64> =
            sqlx::query_scalar("SELECT stock_on_hand FROM variants WHERE id = $1")
                .bind(variant_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        let stock_on_hand =
            stock_on_hand.ok_or_else(|| StoreError::not_found("variant", variant_id))?;

        let reserved: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(quantity), 0) FROM reservations \
             WHERE variant_id = $1 AND session_id <> $2 AND expires_at >= $3",
        )
        .bind(variant_id.as_uuid())
        .bind(excluding.map(|s| s.as_str()).unwrap_or(""))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(stock_on_hand - reserved)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM reservations WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        tracing::debug!(reclaimed = result.rows_affected(), "swept expired reservations");
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn insert_pending(
        &self,
        draft: OrderDraft,
        charge_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let order = draft.into_order(charge_ref.to_string(), now);
        let mut tx = self.pool.begin().await?;
        insert_order_tx(&mut tx, &order).await?;
        tx.commit().await?;
        Ok(order)
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let mut order = row_to_order_header(row)?;
                order.items = self.items_for(order.id).await?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    async fn find_by_charge_ref(&self, charge_ref: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE charge_ref = $1"
        ))
        .bind(charge_ref)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut order = row_to_order_header(row)?;
                order.items = self.items_for(order.id).await?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            let mut order = row_to_order_header(row)?;
            order.items = self.items_for(order.id).await?;
            orders.push(order);
        }
        Ok(orders)
    }

    async fn finalize(
        &self,
        charge_ref: &str,
        draft: Option<OrderDraft>,
        now: DateTime<Utc>,
    ) -> Result<FinalizeOutcome> {
        let mut tx = self.pool.begin().await?;

        let mut order = match fetch_order_for_update_by_ref(&mut tx, charge_ref).await? {
            Some(order) => order,
            None => {
                let Some(draft) = draft else {
                    return Err(StoreError::not_found("order", charge_ref));
                };
                // Two racing webhooks can both reach this insert; the
                // conflict clause lets the loser re-read the winner's
                // row under the lock.
                let order = draft.into_order(charge_ref.to_string(), now);
                insert_order_tx(&mut tx, &order).await?;
                fetch_order_for_update_by_ref(&mut tx, charge_ref)
                    .await?
                    .ok_or_else(|| StoreError::not_found("order", charge_ref))?
            }
        };

        if !order.status.can_mark_paid() {
            return Ok(FinalizeOutcome {
                order,
                newly_finalized: false,
            });
        }

        for item in &order.items {
            debit_stock_tx(&mut tx, item.variant_id, item.quantity, now).await?;
        }

        sqlx::query("DELETE FROM reservations WHERE session_id = $1")
            .bind(order.session_id.as_str())
            .execute(&mut *tx)
            .await?;

        let ticket: i64 = sqlx::query_scalar("SELECT nextval('order_ticket_seq')")
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE orders SET status = $2, payment_status = $3, ticket_number = $4, \
             paid_at = $5, updated_at = $5 WHERE id = $1",
        )
        .bind(order.id.as_uuid())
        .bind(OrderStatus::Paid.as_str())
        .bind(PaymentStatus::Paid.as_str())
        .bind(ticket)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(order_id = %order.id, ticket, "order finalized");

        order.status = OrderStatus::Paid;
        order.payment_status = PaymentStatus::Paid;
        order.ticket_number = Some(ticket);
        order.paid_at = Some(now);
        order.updated_at = now;

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
        let mut tx = self.pool.begin().await?;
        let mut order = fetch_order_for_update(&mut tx, id).await?;

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
                credit_stock_tx(&mut tx, item.variant_id, item.quantity, now).await?;
            }
            true
        } else {
            sqlx::query("DELETE FROM reservations WHERE session_id = $1")
                .bind(order.session_id.as_str())
                .execute(&mut *tx)
                .await?;
            false
        };

        let payment_status = if refund_doc_id.is_some() {
            PaymentStatus::Refunded
        } else {
            order.payment_status
        };
        sqlx::query(
            "UPDATE orders SET status = $2, payment_status = $3, refund_doc_id = COALESCE($4, refund_doc_id), \
             cancelled_at = $5, updated_at = $5 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(OrderStatus::Cancelled.as_str())
        .bind(payment_status.as_str())
        .bind(&refund_doc_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        order.status = OrderStatus::Cancelled;
        order.payment_status = payment_status;
        order.refund_doc_id = refund_doc_id.or(order.refund_doc_id);
        order.cancelled_at = Some(now);
        order.updated_at = now;

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
        let updated = sqlx::query(
            "UPDATE orders SET shipping_status = $2, status = COALESCE($3, status), \
             shipped_at = CASE WHEN $2 = 'shipped' THEN COALESCE(shipped_at, $4) ELSE shipped_at END, \
             delivered_at = CASE WHEN $2 = 'delivered' THEN COALESCE(delivered_at, $4) ELSE delivered_at END, \
             processing_at = CASE WHEN $3 = 'processing' THEN COALESCE(processing_at, $4) ELSE processing_at END, \
             updated_at = $4 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(shipping.as_str())
        .bind(commercial.map(|c| c.as_str()))
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::not_found("order", id));
        }
        self.order(id)
            .await?
            .ok_or_else(|| StoreError::not_found("order", id))
    }

    async fn mark_return_requested(
        &self,
        id: OrderId,
        tracking_id: &str,
        lines: &[(VariantId, u32)],
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let mut tx = self.pool.begin().await?;
        let order = fetch_order_for_update(&mut tx, id).await?;

        for (variant_id, qty) in lines {
            let item = order
                .items
                .iter()
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
            sqlx::query(
                "UPDATE order_items SET return_requested_qty = $3 \
                 WHERE order_id = $1 AND variant_id = $2",
            )
            .bind(id.as_uuid())
            .bind(variant_id.as_uuid())
            .bind(*qty as i32)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE orders SET return_status = $2, return_tracking_id = $3, updated_at = $4 \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(ReturnStatus::Requested.as_str())
        .bind(tracking_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.order(id)
            .await?
            .ok_or_else(|| StoreError::not_found("order", id))
    }

    async fn set_return_status(
        &self,
        id: OrderId,
        status: ReturnStatus,
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let updated = sqlx::query("UPDATE orders SET return_status = $2, updated_at = $3 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(StoreError::not_found("order", id));
        }
        self.order(id)
            .await?
            .ok_or_else(|| StoreError::not_found("order", id))
    }

    async fn cancel_return(&self, id: OrderId, now: DateTime<Utc>) -> Result<Order> {
        let mut tx = self.pool.begin().await?;
        fetch_order_for_update(&mut tx, id).await?;

        sqlx::query("UPDATE order_items SET return_requested_qty = 0 WHERE order_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE orders SET return_status = $2, updated_at = $3 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(ReturnStatus::CancelledDuringReturn.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.order(id)
            .await?
            .ok_or_else(|| StoreError::not_found("order", id))
    }

    async fn settle_return(
        &self,
        id: OrderId,
        refund_doc_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ReturnSettlement> {
        let mut tx = self.pool.begin().await?;
        let order = fetch_order_for_update(&mut tx, id).await?;

        if order.return_status != ReturnStatus::Received {
            return Err(StoreError::illegal_state(
                "order",
                id,
                format!("cannot settle return in status {}", order.return_status),
            ));
        }

        let amount = order.requested_refund_total();
        let fully_returned = order
            .items
            .iter()
            .all(|i| i.return_refunded_qty + i.return_requested_qty == i.quantity)
            && !order.items.is_empty();

        for item in &order.items {
            if item.return_requested_qty == 0 {
                continue;
            }
            credit_stock_tx(&mut tx, item.variant_id, item.return_requested_qty, now).await?;
            sqlx::query(
                "UPDATE order_items SET \
                 return_received_qty = return_received_qty + return_requested_qty, \
                 return_refunded_qty = return_refunded_qty + return_requested_qty, \
                 return_requested_qty = 0 \
                 WHERE order_id = $1 AND variant_id = $2",
            )
            .bind(id.as_uuid())
            .bind(item.variant_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        }

        let payment_status = match (&refund_doc_id, fully_returned) {
            (Some(_), true) => PaymentStatus::Refunded,
            (Some(_), false) => PaymentStatus::PartiallyRefunded,
            (None, _) => order.payment_status,
        };
        let status = if fully_returned {
            OrderStatus::Cancelled
        } else {
            order.status
        };
        sqlx::query(
            "UPDATE orders SET return_status = $2, status = $3, payment_status = $4, \
             refund_doc_id = COALESCE($5, refund_doc_id), \
             cancelled_at = CASE WHEN $6 THEN COALESCE(cancelled_at, $7) ELSE cancelled_at END, \
             updated_at = $7 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(ReturnStatus::Refunded.as_str())
        .bind(status.as_str())
        .bind(payment_status.as_str())
        .bind(&refund_doc_id)
        .bind(fully_returned)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let order = self
            .order(id)
            .await?
            .ok_or_else(|| StoreError::not_found("order", id))?;
        Ok(ReturnSettlement {
            order,
            amount,
            fully_returned,
        })
    }
}

impl PostgresStore {
    async fn items_for(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        let rows = sqlx::query(
            "SELECT order_id, product_id, variant_id, product_name, quantity, price_at_time_cents, \
             return_requested_qty, return_received_qty, return_refunded_qty \
             FROM order_items WHERE order_id = $1 ORDER BY variant_id",
        )
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_item).collect()
    }
}

#[async_trait]
impl CouponStore for PostgresStore {
    async fn insert_coupon(&self, coupon: Coupon) -> Result<()> {
        sqlx::query(
            "INSERT INTO coupons (id, code, discount_percent, expires_at, is_public, active) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(coupon.id.as_uuid())
        .bind(&coupon.code)
        .bind(coupon.discount_percent as i32)
        .bind(coupon.expires_at)
        .bind(coupon.is_public)
        .bind(coupon.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn coupon_by_code(&self, code: &str) -> Result<Option<Coupon>> {
        let row = sqlx::query(
            "SELECT id, code, discount_percent, expires_at, is_public, active \
             FROM coupons WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_coupon).transpose()
    }

    async fn coupon(&self, id: CouponId) -> Result<Option<Coupon>> {
        let row = sqlx::query(
            "SELECT id, code, discount_percent, expires_at, is_public, active \
             FROM coupons WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_coupon).transpose()
    }

    async fn assign(&self, coupon_id: CouponId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO coupon_assignments (coupon_id, user_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(coupon_id.as_uuid())
        .bind(user_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_assigned(&self, coupon_id: CouponId, user_id: UserId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM coupon_assignments WHERE coupon_id = $1 AND user_id = $2)",
        )
        .bind(coupon_id.as_uuid())
        .bind(user_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn usage_exists(&self, coupon_id: CouponId, user_id: UserId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM coupon_usages WHERE coupon_id = $1 AND user_id = $2)",
        )
        .bind(coupon_id.as_uuid())
        .bind(user_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn record_usage(&self, usage: CouponUsage) -> Result<bool> {
        // The unique constraint is the real single-use guard; a
        // conflict means another checkout already redeemed the pair.
        let inserted = sqlx::query(
            "INSERT INTO coupon_usages (coupon_id, user_id, order_id, amount_saved_cents, used_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT ON CONSTRAINT coupon_usages_once_per_user DO NOTHING",
        )
        .bind(usage.coupon_id.as_uuid())
        .bind(usage.user_id.as_uuid())
        .bind(usage.order_id.as_uuid())
        .bind(usage.amount_saved.cents())
        .bind(usage.used_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn eligible_customers(
        &self,
        rule: &SegmentRule,
        now: DateTime<Utc>,
    ) -> Result<Vec<Customer>> {
        let rows = match rule {
            SegmentRule::MinimumSpend { min } => {
                sqlx::query(
                    "SELECT c.id, c.email, c.created_at FROM customers c \
                     JOIN orders o ON o.user_id = c.id \
                     WHERE o.paid_at IS NOT NULL AND o.status <> 'cancelled' \
                     GROUP BY c.id, c.email, c.created_at \
                     HAVING SUM(o.total_cents) >= $1 ORDER BY c.email",
                )
                .bind(min.cents())
                .fetch_all(&self.pool)
                .await?
            }
            SegmentRule::SpendInPeriod { min, since } => {
                sqlx::query(
                    "SELECT c.id, c.email, c.created_at FROM customers c \
                     JOIN orders o ON o.user_id = c.id \
                     WHERE o.paid_at IS NOT NULL AND o.status <> 'cancelled' \
                     AND o.created_at >= $2 \
                     GROUP BY c.id, c.email, c.created_at \
                     HAVING SUM(o.total_cents) >= $1 ORDER BY c.email",
                )
                .bind(min.cents())
                .bind(since)
                .fetch_all(&self.pool)
                .await?
            }
            SegmentRule::FirstPurchase => {
                sqlx::query(
                    "SELECT c.id, c.email, c.created_at FROM customers c \
                     WHERE NOT EXISTS (SELECT 1 FROM orders o \
                     WHERE o.user_id = c.id AND o.paid_at IS NOT NULL) ORDER BY c.email",
                )
                .fetch_all(&self.pool)
                .await?
            }
            SegmentRule::AccountAge { min_days } => {
                sqlx::query(
                    "SELECT id, email, created_at FROM customers WHERE created_at <= $1 \
                     ORDER BY email",
                )
                .bind(now - TimeDelta::days(*min_days))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(row_to_customer).collect()
    }
}

#[async_trait]
impl CustomerStore for PostgresStore {
    async fn upsert_customer(&self, customer: Customer) -> Result<()> {
        sqlx::query(
            "INSERT INTO customers (id, email, created_at) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET email = EXCLUDED.email",
        )
        .bind(customer.id.as_uuid())
        .bind(&customer.email)
        .bind(customer.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn customer(&self, id: UserId) -> Result<Option<Customer>> {
        let row = sqlx::query("SELECT id, email, created_at FROM customers WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_customer).transpose()
    }
}

#[async_trait]
impl NotificationStore for PostgresStore {
    async fn push(&self, notification: Notification) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications (id, user_id, subject, body, tag, read, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(notification.id)
        .bind(notification.user_id.as_uuid())
        .bind(&notification.subject)
        .bind(&notification.body)
        .bind(&notification.tag)
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_unread_tagged(&self, user_id: UserId, tag: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM notifications \
             WHERE user_id = $1 AND tag = $2 AND NOT read)",
        )
        .bind(user_id.as_uuid())
        .bind(tag)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn notifications_for(&self, user_id: UserId) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT id, user_id, subject, body, tag, read, created_at FROM notifications \
             WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_notification).collect()
    }
}
