//! External collaborator seams: the payment gateway and outbound mail.

pub mod gateway;
pub mod mailer;

pub use gateway::{
    ChargeLineItem, ChargeSession, GatewayError, InMemoryGateway, PaymentGateway, RefundReceipt,
    WebhookEvent, EVENT_CHECKOUT_COMPLETED,
};
pub use mailer::{InMemoryMailer, Mailer, OutboundMail};
