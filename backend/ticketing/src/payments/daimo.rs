//! Daimo Pay (USDC on Base): payment creation, status lookup and webhook
//! event decoding.

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::{AppError, Result};

const DAIMO_API_BASE: &str = "https://pay.daimo.com";
const BASE_CHAIN_ID: u64 = 8453;
const BASE_USDC: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

/// Status Daimo reports once funds have arrived.
pub const PAYMENT_COMPLETE: &str = "payment_complete";

#[derive(Clone)]
pub struct DaimoClient {
    client: Client,
    api_key: String,
    destination_address: String,
    base_url: String,
}

impl DaimoClient {
    pub fn new(client: Client, api_key: String, destination_address: String) -> Self {
        Self {
            client,
            api_key,
            destination_address,
            base_url: DAIMO_API_BASE.to_string(),
        }
    }

    /// Point the client at another host, e.g. a local mock.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create a checkout for `amount_usdc`; returns the Daimo payment id.
    pub async fn create_payment(&self, amount_usdc: f64) -> Result<String> {
        let payload = json!({
            "display": { "intent": "Checkout" },
            "destination": {
                "destinationAddress": self.destination_address,
                "chainId": BASE_CHAIN_ID,
                "tokenAddress": BASE_USDC,
                "amountUnits": format_usdc(amount_usdc),
            },
        });

        let resp = self
            .client
            .post(format!("{}/api/payment", self.base_url))
            .header("Api-Key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Payment(format!(
                "Daimo payment creation failed ({status}): {text}"
            )));
        }

        let body: Value = resp.json().await?;
        let id = payment_field(&body, "id")
            .ok_or_else(|| AppError::Payment("Daimo response has no payment id".to_string()))?;
        debug!("Daimo payment {id} created");
        Ok(id)
    }

    /// Current status string of a payment, e.g. `payment_complete`.
    pub async fn payment_status(&self, payment_id: &str) -> Result<String> {
        if !is_payment_id(payment_id) {
            return Err(AppError::BadRequest(format!(
                "invalid payment id: '{payment_id}'"
            )));
        }
        let resp = self
            .client
            .get(format!("{}/api/payment/{payment_id}", self.base_url))
            .header("Api-Key", &self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::Payment(format!(
                "Daimo payment lookup failed ({status})"
            )));
        }

        let body: Value = resp.json().await?;
        payment_field(&body, "status")
            .ok_or_else(|| AppError::Payment("Daimo response has no status".to_string()))
    }
}

/// Payment ids go into a URL path, so only `[A-Za-z0-9_-]` is accepted.
fn is_payment_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Daimo wraps payments as `{"payment": {...}}` on some endpoints and
/// returns them bare on others.
fn payment_field(body: &Value, key: &str) -> Option<String> {
    body.get("payment")
        .and_then(|p| p.get(key))
        .or_else(|| body.get(key))
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// USDC has 6 decimals on Base; two are plenty for ticket prices.
pub fn format_usdc(amount: f64) -> String {
    format!("{amount:.2}")
}

/// Webhook event kinds we react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaimoEventKind {
    PaymentStarted,
    PaymentCompleted,
    PaymentBounced,
    PaymentRefunded,
    Unknown,
}

impl DaimoEventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "payment_started" => Self::PaymentStarted,
            "payment_completed" => Self::PaymentCompleted,
            "payment_bounced" => Self::PaymentBounced,
            "payment_refunded" => Self::PaymentRefunded,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaimoWebhook {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "paymentId")]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub payment: Value,
}

impl DaimoWebhook {
    pub fn kind(&self) -> DaimoEventKind {
        DaimoEventKind::from_type(&self.event_type)
    }

    /// `paymentId` at the top level, falling back to `payment.id`.
    pub fn payment_id(&self) -> Option<String> {
        self.payment_id
            .clone()
            .or_else(|| self.payment.get("id").and_then(|v| v.as_str()).map(String::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn event_kind_from_type() {
        assert_eq!(
            DaimoEventKind::from_type("payment_completed"),
            DaimoEventKind::PaymentCompleted
        );
        assert_eq!(
            DaimoEventKind::from_type("payment_bounced"),
            DaimoEventKind::PaymentBounced
        );
        assert_eq!(
            DaimoEventKind::from_type("payment_refunded"),
            DaimoEventKind::PaymentRefunded
        );
        assert_eq!(
            DaimoEventKind::from_type("payment_started"),
            DaimoEventKind::PaymentStarted
        );
        assert_eq!(DaimoEventKind::from_type("whatever"), DaimoEventKind::Unknown);
    }

    #[test]
    fn webhook_payment_id_falls_back_to_nested_payment() {
        let top: DaimoWebhook = serde_json::from_value(json!({
            "type": "payment_completed",
            "paymentId": "pay_1",
        }))
        .unwrap();
        assert_eq!(top.payment_id().as_deref(), Some("pay_1"));

        let nested: DaimoWebhook = serde_json::from_value(json!({
            "type": "payment_completed",
            "payment": { "id": "pay_2", "status": "payment_complete" },
        }))
        .unwrap();
        assert_eq!(nested.kind(), DaimoEventKind::PaymentCompleted);
        assert_eq!(nested.payment_id().as_deref(), Some("pay_2"));
    }

    #[test]
    fn payment_field_reads_wrapped_and_bare_shapes() {
        let wrapped = json!({ "payment": { "id": "p1", "status": "payment_complete" } });
        let bare = json!({ "id": "p2", "status": "payment_unpaid" });
        assert_eq!(payment_field(&wrapped, "status").as_deref(), Some(PAYMENT_COMPLETE));
        assert_eq!(payment_field(&bare, "id").as_deref(), Some("p2"));
        assert_eq!(payment_field(&json!({}), "id"), None);
    }

    #[test]
    fn usdc_amounts_use_two_decimals() {
        assert_eq!(format_usdc(15.0), "15.00");
        assert_eq!(format_usdc(0.1), "0.10");
    }

    fn client_for(server: &MockServer) -> DaimoClient {
        DaimoClient::new(Client::new(), "daimo-key".into(), "0xdest".into())
            .with_base_url(server.uri())
    }

    #[tokio::test]
    async fn create_payment_returns_the_wrapped_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/payment"))
            .and(header("Api-Key", "daimo-key"))
            .and(body_partial_json(json!({
                "destination": {
                    "destinationAddress": "0xdest",
                    "chainId": 8453,
                    "amountUnits": "15.00",
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payment": { "id": "pay_abc", "status": "payment_unpaid" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let id = client_for(&server).create_payment(15.0).await.unwrap();
        assert_eq!(id, "pay_abc");
    }

    #[tokio::test]
    async fn payment_status_reads_wrapped_and_bare_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/payment/pay_wrapped"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payment": { "id": "pay_wrapped", "status": "payment_complete" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/payment/pay_bare"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pay_bare",
                "status": "payment_unpaid"
            })))
            .mount(&server)
            .await;

        let daimo = client_for(&server);
        assert_eq!(daimo.payment_status("pay_wrapped").await.unwrap(), PAYMENT_COMPLETE);
        assert_eq!(daimo.payment_status("pay_bare").await.unwrap(), "payment_unpaid");
    }

    #[tokio::test]
    async fn provider_failures_are_payment_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/payment"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/payment/pay_1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let daimo = client_for(&server);
        assert!(matches!(daimo.create_payment(15.0).await, Err(AppError::Payment(_))));
        assert!(matches!(daimo.payment_status("pay_1").await, Err(AppError::Payment(_))));
    }

    #[tokio::test]
    async fn malformed_payment_ids_never_reach_the_provider() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "payment_complete" })))
            .expect(0)
            .mount(&server)
            .await;

        let daimo = client_for(&server);
        for id in ["../admin", "pay_1?x=1", "pay 1", "pay%2F1", ""] {
            assert!(
                matches!(daimo.payment_status(id).await, Err(AppError::BadRequest(_))),
                "{id:?} should be rejected"
            );
        }
        assert!(is_payment_id("pay_AbC-123"));
    }
}
