//! Coupon records, rejection reasons, and distribution segment rules.

use chrono::{DateTime, Utc};
use common::{CouponId, Money, OrderId, UserId};
use serde::{Deserialize, Serialize};

/// A percentage discount code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: CouponId,
    pub code: String,
    /// Whole-number percentage, 0..=100.
    pub discount_percent: u32,
    /// None means the coupon never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Public coupons apply to everyone; private ones require an
    /// assignment row.
    pub is_public: bool,
    pub active: bool,
}

impl Coupon {
    /// Returns true if the coupon has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// Restricts a private coupon to one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponAssignment {
    pub coupon_id: CouponId,
    pub user_id: UserId,
}

/// The single-use-per-user enforcement record. One row per
/// `(coupon, user)`, inserted under a uniqueness constraint at redeem
/// time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponUsage {
    pub coupon_id: CouponId,
    pub user_id: UserId,
    pub order_id: OrderId,
    pub amount_saved: Money,
    pub used_at: DateTime<Utc>,
}

/// Why a coupon failed validation, in check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponRejection {
    UnknownCode,
    Inactive,
    Expired,
    NotAssigned,
    AlreadyUsed,
}

impl CouponRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouponRejection::UnknownCode => "unknown_code",
            CouponRejection::Inactive => "inactive",
            CouponRejection::Expired => "expired",
            CouponRejection::NotAssigned => "not_assigned",
            CouponRejection::AlreadyUsed => "already_used",
        }
    }
}

impl std::fmt::Display for CouponRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Eligibility rule for distributing a coupon to a customer segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum SegmentRule {
    /// Lifetime spend across completed orders of at least `min`.
    MinimumSpend { min: Money },
    /// Spend of at least `min` since the given instant.
    SpendInPeriod { min: Money, since: DateTime<Utc> },
    /// Customers with no finalized order yet.
    FirstPurchase,
    /// Accounts created at least `min_days` ago.
    AccountAge { min_days: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut coupon = Coupon {
            id: CouponId::new(),
            code: "SAVE10".to_string(),
            discount_percent: 10,
            expires_at: Some(now + TimeDelta::days(1)),
            is_public: true,
            active: true,
        };
        assert!(!coupon.is_expired(now));

        coupon.expires_at = Some(now - TimeDelta::seconds(1));
        assert!(coupon.is_expired(now));

        coupon.expires_at = None;
        assert!(!coupon.is_expired(now));
    }

    #[test]
    fn test_segment_rule_serde_tag() {
        let rule = SegmentRule::SpendInPeriod {
            min: Money::from_cents(10_000),
            since: Utc::now(),
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["rule"], "spend_in_period");

        let parsed: SegmentRule = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, rule);
    }

    #[test]
    fn test_rejection_display() {
        assert_eq!(CouponRejection::AlreadyUsed.to_string(), "already_used");
        assert_eq!(CouponRejection::NotAssigned.to_string(), "not_assigned");
    }
}
