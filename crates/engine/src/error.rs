//! Engine error types.

use common::{OrderId, SessionId, VariantId};
use domain::{CouponRejection, DomainError};
use store::StoreError;
use thiserror::Error;

use crate::services::gateway::GatewayError;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A reservation or stock debit asked for more units than exist.
    /// Surfaced to the buyer with the true available count.
    #[error(
        "insufficient stock for variant {variant_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        variant_id: VariantId,
        requested: u32,
        available: u32,
    },

    /// A coupon failed validation.
    #[error("invalid coupon: {0}")]
    InvalidCoupon(CouponRejection),

    /// A status-axis transition the table does not allow.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A return was requested but no line has returnable units left.
    #[error("nothing returnable on order {0}")]
    NothingReturnable(OrderId),

    /// Checkout was submitted for a session with no active holds.
    #[error("cart is empty for session {0}")]
    EmptyCart(SessionId),

    /// The payment gateway rejected or failed an operation. Only
    /// fatal where noted; refunds are best-effort.
    #[error("payment gateway {operation} failed: {reason}")]
    Gateway {
        operation: &'static str,
        reason: String,
    },

    /// A webhook delivery failed signature verification or parsing.
    #[error("webhook rejected: {0}")]
    InvalidWebhook(String),

    /// Entity lookup failed.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A store error not covered by the variants above.
    #[error("store error: {0}")]
    Store(StoreError),

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientStock {
                variant_id,
                requested,
                available,
            } => EngineError::InsufficientStock {
                variant_id,
                requested,
                available,
            },
            StoreError::NotFound { entity, id } => EngineError::NotFound { entity, id },
            other => EngineError::Store(other),
        }
    }
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        EngineError::Gateway {
            operation: err.operation,
            reason: err.reason,
        }
    }
}

/// Convenience type alias for engine results.
pub type Result<T> = std::result::Result<T, EngineError>;
