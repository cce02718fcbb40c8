//! Transactional persistence for the storefront core.
//!
//! One trait per component, with operation-shaped methods so every
//! mutating call is exactly one transaction. `PostgresStore` is the
//! production implementation; `MemoryStore` provides the same
//! all-or-nothing contract behind a single async mutex for tests and
//! local development.

pub mod catalog;
pub mod coupons;
pub mod customers;
pub mod error;
pub mod inventory;
pub mod memory;
pub mod notifications;
pub mod orders;
pub mod postgres;

pub use catalog::CatalogStore;
pub use coupons::CouponStore;
pub use customers::CustomerStore;
pub use error::{Result, StoreError};
pub use inventory::InventoryStore;
pub use memory::MemoryStore;
pub use notifications::NotificationStore;
pub use orders::{CancelOutcome, FinalizeOutcome, OrderStore, ReturnSettlement};
pub use postgres::PostgresStore;

/// Everything the engine and API need from one store value.
pub trait Store:
    CatalogStore + InventoryStore + OrderStore + CouponStore + CustomerStore + NotificationStore
{
}

impl<T> Store for T where
    T: CatalogStore + InventoryStore + OrderStore + CouponStore + CustomerStore + NotificationStore
{
}
