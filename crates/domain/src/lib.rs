//! Data model for the inventory reservation and order lifecycle engine.
//!
//! This crate provides the plain record types and the status state
//! machines; all persistence lives in the `store` crate and all
//! orchestration in the `engine` crate.

pub mod catalog;
pub mod coupon;
pub mod customer;
pub mod error;
pub mod notification;
pub mod order;
pub mod reservation;

pub use catalog::{Product, Variant};
pub use coupon::{
    Coupon, CouponAssignment, CouponRejection, CouponUsage, SegmentRule,
};
pub use customer::Customer;
pub use error::DomainError;
pub use notification::Notification;
pub use order::status::{OrderStatus, PaymentStatus, ReturnStatus, ShippingStatus};
pub use order::{DraftLine, Order, OrderDraft, OrderItem};
pub use reservation::{RESERVATION_TTL_MINUTES, Reservation};
