use common::VariantId;
use thiserror::Error;

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A reservation or stock debit asked for more units than are
    /// available. Carries the availability observed inside the
    /// transaction, so callers can surface the true count.
    #[error("insufficient stock for variant {variant_id}: requested {requested}, available {available}")]
    InsufficientStock {
        variant_id: VariantId,
        requested: u32,
        available: u32,
    },

    /// The entity was not found in the store.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The row is in a state the operation does not apply to. Raised
    /// when a concurrent writer got there first; callers treat it like
    /// an illegal transition.
    #[error("illegal state for {entity} {id}: {reason}")]
    IllegalState {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn illegal_state(
        entity: &'static str,
        id: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        StoreError::IllegalState {
            entity,
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
