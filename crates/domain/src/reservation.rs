//! Session-scoped stock holds.

use chrono::{DateTime, TimeDelta, Utc};
use common::{SessionId, VariantId};
use serde::{Deserialize, Serialize};

/// How long a hold protects stock after its last touch.
pub const RESERVATION_TTL_MINUTES: i64 = 20;

/// A time-limited claim on a variant's available quantity.
///
/// One row per `(session, variant)`. A reservation never moves
/// `stock_on_hand`; it only reduces what other sessions may reserve.
/// Holds are consumed (deleted) at order finalize, released on cart
/// removal, or reclaimed by the expiry sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub session_id: SessionId,
    pub variant_id: VariantId,
    pub quantity: u32,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// Returns the expiry for a hold touched at `now`.
    pub fn expiry_from(now: DateTime<Utc>) -> DateTime<Utc> {
        now + TimeDelta::minutes(RESERVATION_TTL_MINUTES)
    }

    /// Returns true if the hold no longer protects stock at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}
