//! The three status axes of an order.
//!
//! Every transition rule lives here; the lifecycle controller is the
//! only caller, so "shipping delivered forces commercial completed"
//! and friends are enforced in exactly one place.

use serde::{Deserialize, Serialize};

/// Commercial status of an order.
///
/// State transitions:
/// ```text
/// Pending ──► Paid ──► Processing ──► Completed
///    │          │
///    └──────────┴──► Cancelled
/// ```
///
/// A fully-returned order is additionally promoted from Completed to
/// Cancelled by the return settlement — the sale was logically undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Checkout submitted, payment not yet confirmed.
    #[default]
    Pending,

    /// Payment confirmed, stock permanently debited.
    Paid,

    /// Being picked and packed.
    Processing,

    /// Delivered (terminal on the happy path).
    Completed,

    /// Sale undone (terminal).
    Cancelled,
}

impl OrderStatus {
    /// Returns true if the order may be cancelled by the cancel flow.
    ///
    /// Once fulfilment starts the cancel flow is closed; later undo
    /// goes through the return flow instead.
    pub fn can_cancel(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Paid)
    }

    /// Returns true if payment confirmation may finalize the order.
    pub fn can_mark_paid(&self) -> bool {
        matches!(self, OrderStatus::Pending)
    }

    /// Returns true if no further commercial transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled)
    }

    /// Commercial status implied by a shipping-axis state.
    ///
    /// Returns None when shipping implies nothing beyond the current
    /// status.
    pub fn implied_by_shipping(shipping: ShippingStatus) -> Option<OrderStatus> {
        match shipping {
            ShippingStatus::Pending => None,
            ShippingStatus::Shipped | ShippingStatus::InDelivery => Some(OrderStatus::Processing),
            ShippingStatus::Delivered => Some(OrderStatus::Completed),
        }
    }

    /// Returns the status name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Processing => "processing",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

/// Payment status, tracked separately from the commercial axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    /// Fully refunded (cancellation or full return).
    Refunded,
    /// Some lines refunded through the return flow.
    PartiallyRefunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
        }
    }
}

/// Shipping status, independent of the commercial axis.
///
/// ```text
/// Pending ──► Shipped ──► InDelivery ──► Delivered
/// ```
///
/// Transitions are forward-only; an admin may skip intermediate steps
/// but never move backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShippingStatus {
    #[default]
    Pending,
    Shipped,
    InDelivery,
    Delivered,
}

impl ShippingStatus {
    fn rank(&self) -> u8 {
        match self {
            ShippingStatus::Pending => 0,
            ShippingStatus::Shipped => 1,
            ShippingStatus::InDelivery => 2,
            ShippingStatus::Delivered => 3,
        }
    }

    /// Returns true if the axis may move from `self` to `next`.
    pub fn can_transition_to(&self, next: ShippingStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Returns true if the parcel has reached the buyer.
    pub fn is_delivered(&self) -> bool {
        matches!(self, ShippingStatus::Delivered)
    }

    /// Returns true once fulfilment has physically started.
    pub fn has_shipped(&self) -> bool {
        self.rank() > 0
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShippingStatus::Pending => "pending",
            ShippingStatus::Shipped => "shipped",
            ShippingStatus::InDelivery => "in_delivery",
            ShippingStatus::Delivered => "delivered",
        }
    }
}

/// Return-flow status. Starts at None and only begins once the order
/// has been delivered.
///
/// ```text
/// None ──► Requested ──► HandedToCarrier ──► Received ──► Refunded
///              │                │
///              └────────────────┴──► CancelledDuringReturn
/// ```
///
/// Refunded and CancelledDuringReturn both allow a fresh Requested
/// cycle while any line still has returnable quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReturnStatus {
    #[default]
    None,
    Requested,
    HandedToCarrier,
    Received,
    Refunded,
    CancelledDuringReturn,
}

impl ReturnStatus {
    /// Returns true if the axis may move from `self` to `next`.
    pub fn can_transition_to(&self, next: ReturnStatus) -> bool {
        use ReturnStatus::*;
        matches!(
            (self, next),
            (None, Requested)
                | (Requested, HandedToCarrier)
                | (Requested, Received)
                | (Requested, CancelledDuringReturn)
                | (HandedToCarrier, Received)
                | (HandedToCarrier, CancelledDuringReturn)
                | (Received, Refunded)
                | (Refunded, Requested)
                | (CancelledDuringReturn, Requested)
        )
    }

    /// Returns true while a return cycle is open.
    pub fn in_progress(&self) -> bool {
        matches!(
            self,
            ReturnStatus::Requested | ReturnStatus::HandedToCarrier | ReturnStatus::Received
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnStatus::None => "none",
            ReturnStatus::Requested => "requested",
            ReturnStatus::HandedToCarrier => "handed_to_carrier",
            ReturnStatus::Received => "received",
            ReturnStatus::Refunded => "refunded",
            ReturnStatus::CancelledDuringReturn => "cancelled_during_return",
        }
    }
}

macro_rules! status_from_str {
    ($ty:ident, [$($variant:ident),+ $(,)?]) => {
        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == $ty::$variant.as_str() {
                        return Ok($ty::$variant);
                    }
                )+
                Err(format!("unknown {} value: {s}", stringify!($ty)))
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

status_from_str!(OrderStatus, [Pending, Paid, Processing, Completed, Cancelled]);
status_from_str!(PaymentStatus, [Pending, Paid, Refunded, PartiallyRefunded]);
status_from_str!(ShippingStatus, [Pending, Shipped, InDelivery, Delivered]);
status_from_str!(
    ReturnStatus,
    [None, Requested, HandedToCarrier, Received, Refunded, CancelledDuringReturn]
);
