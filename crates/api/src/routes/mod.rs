//! Route handlers, one module per surface area.

pub mod cart;
pub mod checkout;
pub mod coupons;
pub mod health;
pub mod metrics;
pub mod orders;
pub mod webhooks;

use engine::{Mailer, OrderLifecycle, PaymentGateway, ReservationManager};
use store::Store;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S, G, M>
where
    S: Store + Clone,
    G: PaymentGateway,
    M: Mailer + Clone,
{
    pub reservations: ReservationManager<S>,
    pub lifecycle: OrderLifecycle<S, G, M>,
    pub config: Config,
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(value).map_err(|e| ApiError::BadRequest(format!("invalid id format: {e}")))
}
