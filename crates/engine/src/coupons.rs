//! Coupon validation, atomic redemption, and segment distribution.

use chrono::Utc;
use common::{CouponId, Money, OrderId, UserId};
use domain::{CouponRejection, CouponUsage, Notification, SegmentRule};
use store::{CouponStore, NotificationStore};

use crate::error::{EngineError, Result};
use crate::services::mailer::{Mailer, templates};

/// An advisory pricing quote for a coupon.
///
/// Validation alone cannot guard single use under concurrency; the
/// hard enforcement happens in [`CouponEngine::redeem`].
#[derive(Debug, Clone)]
pub struct CouponQuote {
    pub coupon_id: CouponId,
    pub code: String,
    pub discount_percent: u32,
    pub amount_saved: Money,
}

/// Result of a distribution run.
#[derive(Debug, Clone, Default)]
pub struct DistributionReport {
    pub notified: usize,
    pub skipped: usize,
}

/// Validates, redeems, and distributes discount coupons.
pub struct CouponEngine<S, M> {
    store: S,
    mailer: M,
}

impl<S, M> CouponEngine<S, M>
where
    S: CouponStore + NotificationStore,
    M: Mailer,
{
    /// Creates a new coupon engine.
    pub fn new(store: S, mailer: M) -> Self {
        Self { store, mailer }
    }

    /// Validates a code for a user and subtotal, returning the priced
    /// quote or the first failing check in order: unknown, inactive,
    /// expired, not assigned, already used.
    #[tracing::instrument(skip(self))]
    pub async fn validate(
        &self,
        code: &str,
        user_id: Option<UserId>,
        subtotal: Money,
    ) -> Result<CouponQuote> {
        let coupon = self
            .store
            .coupon_by_code(code)
            .await?
            .ok_or(EngineError::InvalidCoupon(CouponRejection::UnknownCode))?;

        if !coupon.active {
            return Err(EngineError::InvalidCoupon(CouponRejection::Inactive));
        }
        if coupon.is_expired(Utc::now()) {
            return Err(EngineError::InvalidCoupon(CouponRejection::Expired));
        }
        if !coupon.is_public {
            let Some(user_id) = user_id else {
                return Err(EngineError::InvalidCoupon(CouponRejection::NotAssigned));
            };
            if !self.store.is_assigned(coupon.id, user_id).await? {
                return Err(EngineError::InvalidCoupon(CouponRejection::NotAssigned));
            }
        }
        if let Some(user_id) = user_id {
            if self.store.usage_exists(coupon.id, user_id).await? {
                return Err(EngineError::InvalidCoupon(CouponRejection::AlreadyUsed));
            }
        }

        Ok(CouponQuote {
            coupon_id: coupon.id,
            code: coupon.code,
            discount_percent: coupon.discount_percent,
            amount_saved: subtotal.percent_of(coupon.discount_percent),
        })
    }

    /// Records the redemption, exactly once per (coupon, user).
    ///
    /// Invoked after payment confirmation. Returns false when another
    /// order already redeemed the pair — a soft failure: the order
    /// proceeds, the discount is just not honored twice.
    #[tracing::instrument(skip(self))]
    pub async fn redeem(
        &self,
        order_id: OrderId,
        user_id: UserId,
        coupon_id: CouponId,
        amount_saved: Money,
    ) -> Result<bool> {
        let recorded = self
            .store
            .record_usage(CouponUsage {
                coupon_id,
                user_id,
                order_id,
                amount_saved,
                used_at: Utc::now(),
            })
            .await?;

        if recorded {
            metrics::counter!("coupons_redeemed_total").increment(1);
        } else {
            metrics::counter!("coupons_redeem_conflicts_total").increment(1);
            tracing::warn!(
                %coupon_id,
                %user_id,
                %order_id,
                "coupon already redeemed by this user; discount not honored twice"
            );
        }
        Ok(recorded)
    }

    /// Notifies every customer a segment rule selects, skipping prior
    /// redeemers and anyone already holding an unread notification
    /// tagged with the coupon code. Safe to re-run.
    #[tracing::instrument(skip(self))]
    pub async fn distribute_to_segment(
        &self,
        coupon_id: CouponId,
        rule: SegmentRule,
    ) -> Result<DistributionReport> {
        let coupon = self
            .store
            .coupon(coupon_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "coupon",
                id: coupon_id.to_string(),
            })?;

        let mut report = DistributionReport::default();
        for customer in self.store.eligible_customers(&rule, Utc::now()).await? {
            if self.store.usage_exists(coupon.id, customer.id).await?
                || self.store.has_unread_tagged(customer.id, &coupon.code).await?
            {
                report.skipped += 1;
                continue;
            }

            self.store
                .push(Notification::tagged(
                    customer.id,
                    format!("{}% off your next order", coupon.discount_percent),
                    format!("Use code {} at checkout.", coupon.code),
                    &coupon.code,
                ))
                .await?;
            self.mailer
                .send(
                    templates::COUPON_OFFER,
                    &customer.email,
                    serde_json::json!({
                        "code": coupon.code,
                        "discount_percent": coupon.discount_percent,
                        "expires_at": coupon.expires_at,
                    }),
                )
                .await;
            report.notified += 1;
        }

        tracing::info!(
            %coupon_id,
            notified = report.notified,
            skipped = report.skipped,
            "coupon distribution run finished"
        );
        Ok(report)
    }
}
