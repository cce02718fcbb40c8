//! Domain error types.

use thiserror::Error;

/// Errors raised by the data model itself.
#[derive(Debug, Clone, Error)]
pub enum DomainError {
    /// A status-axis transition the table does not allow.
    #[error("illegal {axis} transition: {from} -> {to}")]
    IllegalTransition {
        axis: &'static str,
        from: String,
        to: String,
    },
}

impl DomainError {
    /// Builds an illegal-transition error from any two status values.
    pub fn illegal_transition(
        axis: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        DomainError::IllegalTransition {
            axis,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
