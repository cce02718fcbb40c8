//! Outbound mail trait and in-memory implementation.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

/// Template identifiers the engine sends with.
pub mod templates {
    pub const ORDER_RECEIPT: &str = "order-receipt";
    pub const ORDER_CANCELLED: &str = "order-cancelled";
    pub const ORDER_SHIPPED: &str = "order-shipped";
    pub const ORDER_DELIVERED: &str = "order-delivered";
    pub const RETURN_INSTRUCTIONS: &str = "return-instructions";
    pub const RETURN_REFUNDED: &str = "return-refunded";
    pub const COUPON_OFFER: &str = "coupon-offer";
}

/// A recorded outbound message.
#[derive(Debug, Clone)]
pub struct OutboundMail {
    pub template_id: String,
    pub recipient: String,
    pub payload: serde_json::Value,
}

/// Best-effort outbound mail. Implementations log failures and never
/// raise to the caller; delivery is queued after the transaction that
/// triggered it has committed.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, template_id: &str, recipient: &str, payload: serde_json::Value);
}

/// In-memory mailer for tests: records every send.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMailer {
    sent: Arc<RwLock<Vec<OutboundMail>>>,
}

impl InMemoryMailer {
    /// Creates a new in-memory mailer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of messages sent.
    pub fn sent_count(&self) -> usize {
        self.sent.read().unwrap().len()
    }

    /// Returns all messages sent so far.
    pub fn sent(&self) -> Vec<OutboundMail> {
        self.sent.read().unwrap().clone()
    }

    /// Returns how many messages used the given template.
    pub fn sent_with_template(&self, template_id: &str) -> usize {
        self.sent
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.template_id == template_id)
            .count()
    }
}

#[async_trait]
impl Mailer for InMemoryMailer {
    async fn send(&self, template_id: &str, recipient: &str, payload: serde_json::Value) {
        self.sent.write().unwrap().push(OutboundMail {
            template_id: template_id.to_string(),
            recipient: recipient.to_string(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_sends() {
        let mailer = InMemoryMailer::new();
        mailer
            .send(
                templates::ORDER_RECEIPT,
                "buyer@example.com",
                serde_json::json!({"ticket": 17}),
            )
            .await;

        assert_eq!(mailer.sent_count(), 1);
        assert_eq!(mailer.sent_with_template(templates::ORDER_RECEIPT), 1);
        let mail = &mailer.sent()[0];
        assert_eq!(mail.recipient, "buyer@example.com");
        assert_eq!(mail.payload["ticket"], 17);
    }
}
