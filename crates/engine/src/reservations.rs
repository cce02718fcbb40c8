//! Reservation manager and the background expiry sweeper.

use std::time::Duration;

use chrono::Utc;
use common::{SessionId, VariantId};
use domain::Reservation;
use store::InventoryStore;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Default sweep cadence. Holds live for twenty minutes; reclaiming a
/// few minutes late keeps abandoned stock unavailable for only a small
/// multiple of the TTL.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// Session-scoped holds against the variant ledger.
///
/// Consulted on every cart mutation; holds stock without ever moving
/// `stock_on_hand`.
pub struct ReservationManager<S> {
    store: S,
}

impl<S: InventoryStore> ReservationManager<S> {
    /// Creates a new reservation manager.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Sets the session's hold on a variant to `quantity`, refreshing
    /// the 20-minute TTL. The UI touches the hold on every cart view,
    /// so a re-issue of the current quantity is routine.
    #[tracing::instrument(skip(self))]
    pub async fn reserve(
        &self,
        session: &SessionId,
        variant_id: VariantId,
        quantity: u32,
    ) -> Result<Reservation> {
        let result = self
            .store
            .reserve(session, variant_id, quantity, Utc::now())
            .await;
        match &result {
            Ok(_) => metrics::counter!("reservations_total").increment(1),
            Err(_) => metrics::counter!("reservations_rejected_total").increment(1),
        }
        Ok(result?)
    }

    /// Releases the session's hold on a variant. At-most-once
    /// semantics: releasing an absent hold is a successful no-op.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, session: &SessionId, variant_id: VariantId) -> Result<()> {
        self.store.release(session, variant_id).await?;
        Ok(())
    }

    /// Releases every hold for a session (cart clear).
    #[tracing::instrument(skip(self))]
    pub async fn clear(&self, session: &SessionId) -> Result<u64> {
        Ok(self.store.release_session(session).await?)
    }

    /// The session's active holds (the cart contents).
    pub async fn holds(&self, session: &SessionId) -> Result<Vec<Reservation>> {
        Ok(self.store.session_reservations(session, Utc::now()).await?)
    }

    /// Units of a variant this session could still take.
    pub async fn available_for(&self, session: &SessionId, variant_id: VariantId) -> Result<i64> {
        Ok(self
            .store
            .available(variant_id, Some(session), Utc::now())
            .await?)
    }
}

/// Periodic reclaim of expired holds.
///
/// Clients cannot be trusted to release abandoned carts; this task is
/// the sole mechanism that frees that stock. It only ever deletes rows
/// whose expiry has already passed, so it cannot race a valid hold
/// into deletion.
pub struct Sweeper;

impl Sweeper {
    /// Spawns the sweep loop. The handle aborts the task when dropped
    /// by the caller's runtime shutting down.
    pub fn spawn<S>(store: S, every: Duration) -> JoinHandle<()>
    where
        S: InventoryStore + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match store.sweep_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(reclaimed) => {
                        metrics::counter!("reservations_swept_total").increment(reclaimed);
                        tracing::info!(reclaimed, "reclaimed expired reservation holds");
                    }
                    Err(error) => {
                        tracing::warn!(%error, "reservation sweep failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::MemoryStore;

    use common::ProductId;
    use domain::{Product, Variant};
    use store::CatalogStore;

    async fn seed(store: &MemoryStore, stock: i64) -> VariantId {
        let product = Product {
            id: ProductId::new(),
            name: "Wool sweater".to_string(),
            unit_price: common::Money::from_cents(4500),
            active: true,
        };
        let variant = Variant::new(product.id, "L", stock);
        let id = variant.id;
        store.upsert_product(product).await.unwrap();
        store.upsert_variant(variant).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_reserve_and_release_through_manager() {
        let store = MemoryStore::new();
        let variant_id = seed(&store, 4).await;
        let manager = ReservationManager::new(store.clone());
        let session: SessionId = "sess-a".into();

        let hold = manager.reserve(&session, variant_id, 2).await.unwrap();
        assert_eq!(hold.quantity, 2);
        assert_eq!(manager.holds(&session).await.unwrap().len(), 1);

        manager.release(&session, variant_id).await.unwrap();
        manager.release(&session, variant_id).await.unwrap();
        assert!(manager.holds(&session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversell_surfaces_available_count() {
        let store = MemoryStore::new();
        let variant_id = seed(&store, 3).await;
        let manager = ReservationManager::new(store.clone());

        manager.reserve(&"sess-a".into(), variant_id, 2).await.unwrap();
        let err = manager
            .reserve(&"sess-b".into(), variant_id, 2)
            .await
            .unwrap_err();
        match err {
            crate::EngineError::InsufficientStock { available, .. } => assert_eq!(available, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_clear_releases_all_session_holds() {
        let store = MemoryStore::new();
        let a = seed(&store, 3).await;
        let b = seed(&store, 3).await;
        let manager = ReservationManager::new(store.clone());
        let session: SessionId = "sess-a".into();

        manager.reserve(&session, a, 1).await.unwrap();
        manager.reserve(&session, b, 2).await.unwrap();
        assert_eq!(manager.clear(&session).await.unwrap(), 2);
        assert!(manager.holds(&session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_variant_is_not_found() {
        let store = MemoryStore::new();
        let manager = ReservationManager::new(store);
        let err = manager
            .reserve(&"sess-a".into(), VariantId::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_sweeper_keeps_running() {
        let store = MemoryStore::new();
        let handle = Sweeper::spawn(store.clone(), Duration::from_millis(10));

        // A few ticks over an empty table must not kill the loop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
