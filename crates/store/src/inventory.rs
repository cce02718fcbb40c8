use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SessionId, VariantId};
use domain::Reservation;

use crate::Result;

/// Session-scoped stock holds against the variant ledger.
///
/// Every method is one atomic unit of work. `reserve` is the
/// check-then-mutate path and must lock the variant row for the length
/// of the availability computation; two concurrent reservations whose
/// quantities together exceed availability must resolve to exactly one
/// success.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Sets this session's hold on a variant to `quantity` and
    /// refreshes its TTL.
    ///
    /// Availability is `stock_on_hand` minus the sum of other
    /// sessions' unexpired holds; asking for more fails with
    /// `InsufficientStock` carrying the observed availability, and
    /// leaves no partial state. Re-issuing the same quantity is a
    /// state no-op that still refreshes `expires_at`.
    async fn reserve(
        &self,
        session: &SessionId,
        variant_id: VariantId,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> Result<Reservation>;

    /// Deletes this session's hold on a variant. Succeeds whether or
    /// not the row exists.
    async fn release(&self, session: &SessionId, variant_id: VariantId) -> Result<()>;

    /// Deletes every hold for a session (cart clear). Returns the
    /// number of rows removed.
    async fn release_session(&self, session: &SessionId) -> Result<u64>;

    /// This session's unexpired holds.
    async fn session_reservations(
        &self,
        session: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>>;

    /// Units of a variant a session could still reserve: on-hand stock
    /// minus other sessions' unexpired holds.
    async fn available(
        &self,
        variant_id: VariantId,
        excluding: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> Result<i64>;

    /// Deletes holds whose `expires_at` has already passed. Returns
    /// the number of rows reclaimed. Never touches a still-valid hold.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}
