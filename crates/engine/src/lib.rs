//! Controllers for the inventory reservation and order lifecycle
//! engine.
//!
//! Three components drive the core:
//! 1. [`ReservationManager`] — session-scoped stock holds with a
//!    20-minute TTL, reclaimed by the background [`Sweeper`]
//! 2. [`CouponEngine`] — advisory validation plus the atomic
//!    single-use redemption guard
//! 3. [`OrderLifecycle`] — the commercial/shipping/return state
//!    machine, stock debits and credits, refunds, notifications
//!
//! Controllers hold no mutable state; correctness under concurrent
//! requests comes entirely from the store's transactions.

pub mod coupons;
pub mod error;
pub mod orders;
pub mod reservations;
pub mod services;

pub use coupons::{CouponEngine, CouponQuote, DistributionReport};
pub use error::{EngineError, Result};
pub use orders::{
    BulkShippingReport, CancelReceipt, CheckoutRequest, CheckoutSession, OrderLifecycle,
    ReturnRefundOutcome, ReturnTicket,
};
pub use reservations::{DEFAULT_SWEEP_INTERVAL, ReservationManager, Sweeper};
pub use services::{
    ChargeLineItem, ChargeSession, GatewayError, InMemoryGateway, InMemoryMailer, Mailer,
    OutboundMail, PaymentGateway, RefundReceipt, WebhookEvent, EVENT_CHECKOUT_COMPLETED,
};
