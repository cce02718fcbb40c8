//! Payment gateway trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::Money;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Webhook event type for a completed checkout.
pub const EVENT_CHECKOUT_COMPLETED: &str = "checkout.completed";

/// A gateway operation failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("gateway {operation} failed: {reason}")]
pub struct GatewayError {
    pub operation: &'static str,
    pub reason: String,
}

impl GatewayError {
    fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }
}

/// One line of a charge session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeLineItem {
    pub name: String,
    pub quantity: u32,
    pub unit_amount: Money,
}

/// A created charge session: where to send the buyer, and the
/// reference the webhook will carry back.
#[derive(Debug, Clone)]
pub struct ChargeSession {
    pub reference: String,
    pub url: String,
}

/// Receipt for an issued refund.
#[derive(Debug, Clone)]
pub struct RefundReceipt {
    pub doc_id: String,
}

/// A verified webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub reference: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// The narrow surface the core needs from the payment provider.
///
/// Webhook delivery is at-least-once; callers must treat the charge
/// reference as an idempotency key.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a hosted charge session for the given line items.
    /// `metadata` is echoed back verbatim in the completion webhook.
    async fn create_charge_session(
        &self,
        line_items: Vec<ChargeLineItem>,
        success_url: &str,
        cancel_url: &str,
        metadata: serde_json::Value,
    ) -> Result<ChargeSession, GatewayError>;

    /// Refunds against a completed charge. `amount` of None means the
    /// full charged amount.
    async fn refund(
        &self,
        charge_ref: &str,
        amount: Option<Money>,
    ) -> Result<RefundReceipt, GatewayError>;

    /// Verifies a webhook delivery: the signature header must be the
    /// hex HMAC-SHA256 of the raw body under the shared secret.
    fn verify_webhook(&self, raw_body: &[u8], signature: &str)
    -> Result<WebhookEvent, GatewayError>;
}

#[derive(Debug, Default)]
struct InMemoryGatewayState {
    sessions: HashMap<String, (Vec<ChargeLineItem>, serde_json::Value)>,
    refunds: Vec<(String, Option<Money>)>,
    next_id: u32,
    fail_on_charge: bool,
    fail_on_refund: bool,
}

/// In-memory gateway for tests and local development.
#[derive(Debug, Clone)]
pub struct InMemoryGateway {
    secret: String,
    state: Arc<RwLock<InMemoryGatewayState>>,
}

impl InMemoryGateway {
    /// Creates a gateway verifying webhooks against the given secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            state: Arc::new(RwLock::new(InMemoryGatewayState::default())),
        }
    }

    /// Configures the gateway to fail charge-session creation.
    pub fn set_fail_on_charge(&self, fail: bool) {
        self.state.write().unwrap().fail_on_charge = fail;
    }

    /// Configures the gateway to fail refunds.
    pub fn set_fail_on_refund(&self, fail: bool) {
        self.state.write().unwrap().fail_on_refund = fail;
    }

    /// Returns the number of charge sessions created.
    pub fn session_count(&self) -> usize {
        self.state.read().unwrap().sessions.len()
    }

    /// Returns the refunds issued so far.
    pub fn refunds(&self) -> Vec<(String, Option<Money>)> {
        self.state.read().unwrap().refunds.clone()
    }

    /// Returns the metadata recorded for a charge session.
    pub fn session_metadata(&self, reference: &str) -> Option<serde_json::Value> {
        self.state
            .read()
            .unwrap()
            .sessions
            .get(reference)
            .map(|(_, m)| m.clone())
    }

    /// Signs a raw body the way the hosted gateway would.
    pub fn sign(&self, raw_body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(raw_body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Builds the completion webhook body the hosted gateway would
    /// deliver for a charge session, echoing its metadata.
    pub fn completed_webhook_body(&self, reference: &str) -> Vec<u8> {
        let metadata = self
            .session_metadata(reference)
            .unwrap_or(serde_json::Value::Null);
        let event = WebhookEvent {
            event_type: EVENT_CHECKOUT_COMPLETED.to_string(),
            reference: reference.to_string(),
            metadata,
        };
        serde_json::to_vec(&event).expect("webhook event serializes")
    }
}

#[async_trait]
impl PaymentGateway for InMemoryGateway {
    async fn create_charge_session(
        &self,
        line_items: Vec<ChargeLineItem>,
        _success_url: &str,
        _cancel_url: &str,
        metadata: serde_json::Value,
    ) -> Result<ChargeSession, GatewayError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_charge {
            return Err(GatewayError::new("create_charge_session", "provider unavailable"));
        }

        state.next_id += 1;
        let reference = format!("cs_{:04}", state.next_id);
        state
            .sessions
            .insert(reference.clone(), (line_items, metadata));

        Ok(ChargeSession {
            url: format!("https://pay.example.test/session/{reference}"),
            reference,
        })
    }

    async fn refund(
        &self,
        charge_ref: &str,
        amount: Option<Money>,
    ) -> Result<RefundReceipt, GatewayError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_refund {
            return Err(GatewayError::new("refund", "provider unavailable"));
        }

        state.refunds.push((charge_ref.to_string(), amount));
        Ok(RefundReceipt {
            doc_id: format!("re_{:04}", state.refunds.len()),
        })
    }

    fn verify_webhook(
        &self,
        raw_body: &[u8],
        signature: &str,
    ) -> Result<WebhookEvent, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| GatewayError::new("verify_webhook", e.to_string()))?;
        mac.update(raw_body);

        let claimed = hex::decode(signature)
            .map_err(|_| GatewayError::new("verify_webhook", "malformed signature header"))?;
        mac.verify_slice(&claimed)
            .map_err(|_| GatewayError::new("verify_webhook", "signature mismatch"))?;

        serde_json::from_slice(raw_body)
            .map_err(|e| GatewayError::new("verify_webhook", format!("unparseable event: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_charge_session_and_refund() {
        let gateway = InMemoryGateway::new("whsec_test");

        let session = gateway
            .create_charge_session(
                vec![ChargeLineItem {
                    name: "Linen shirt (M)".to_string(),
                    quantity: 2,
                    unit_amount: Money::from_cents(1000),
                }],
                "https://shop.example/success",
                "https://shop.example/cancel",
                serde_json::json!({"session_id": "s1"}),
            )
            .await
            .unwrap();
        assert!(session.reference.starts_with("cs_"));
        assert!(session.url.contains(&session.reference));
        assert_eq!(gateway.session_count(), 1);

        let receipt = gateway
            .refund(&session.reference, Some(Money::from_cents(500)))
            .await
            .unwrap();
        assert!(receipt.doc_id.starts_with("re_"));
        assert_eq!(gateway.refunds().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_toggles() {
        let gateway = InMemoryGateway::new("whsec_test");
        gateway.set_fail_on_charge(true);
        let err = gateway
            .create_charge_session(vec![], "s", "c", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.operation, "create_charge_session");

        gateway.set_fail_on_refund(true);
        assert!(gateway.refund("cs_0001", None).await.is_err());
    }

    #[test]
    fn test_webhook_roundtrip_and_tamper_rejection() {
        let gateway = InMemoryGateway::new("whsec_test");
        let body = serde_json::to_vec(&WebhookEvent {
            event_type: EVENT_CHECKOUT_COMPLETED.to_string(),
            reference: "cs_0001".to_string(),
            metadata: serde_json::Value::Null,
        })
        .unwrap();

        let signature = gateway.sign(&body);
        let event = gateway.verify_webhook(&body, &signature).unwrap();
        assert_eq!(event.event_type, EVENT_CHECKOUT_COMPLETED);
        assert_eq!(event.reference, "cs_0001");

        // Tampered body fails verification.
        let mut tampered = body.clone();
        tampered[0] ^= 1;
        assert!(gateway.verify_webhook(&tampered, &signature).is_err());

        // Wrong secret fails verification.
        let other = InMemoryGateway::new("whsec_other");
        assert!(other.verify_webhook(&body, &signature).is_err());

        // Garbage header fails without panicking.
        assert!(gateway.verify_webhook(&body, "not-hex").is_err());
    }
}
