use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CouponId, UserId};
use domain::{Coupon, CouponUsage, Customer, SegmentRule};

use crate::Result;

/// Coupon persistence and the redemption uniqueness guard.
#[async_trait]
pub trait CouponStore: Send + Sync {
    /// Inserts a coupon (admin / test seeding).
    async fn insert_coupon(&self, coupon: Coupon) -> Result<()>;

    /// Looks a coupon up by code.
    async fn coupon_by_code(&self, code: &str) -> Result<Option<Coupon>>;

    /// Looks a coupon up by id.
    async fn coupon(&self, id: CouponId) -> Result<Option<Coupon>>;

    /// Restricts a private coupon to a user.
    async fn assign(&self, coupon_id: CouponId, user_id: UserId) -> Result<()>;

    /// True if the user is assigned to the coupon.
    async fn is_assigned(&self, coupon_id: CouponId, user_id: UserId) -> Result<bool>;

    /// True if the user has already redeemed the coupon.
    async fn usage_exists(&self, coupon_id: CouponId, user_id: UserId) -> Result<bool>;

    /// Records a redemption under the `(coupon, user)` uniqueness
    /// constraint. Returns false when the pair already exists — the
    /// coupon was redeemed concurrently and the caller must not honor
    /// the discount twice.
    async fn record_usage(&self, usage: CouponUsage) -> Result<bool>;

    /// Customers matching a distribution segment rule.
    async fn eligible_customers(
        &self,
        rule: &SegmentRule,
        now: DateTime<Utc>,
    ) -> Result<Vec<Customer>>;
}
