//! Razorpay (INR): order creation and checkout signature verification.

use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::debug;

use crate::errors::{AppError, Result};

const RAZORPAY_API_BASE: &str = "https://api.razorpay.com";

type HmacSha256 = Hmac<Sha256>;

/// The parts of Razorpay's order response we keep.
#[derive(Debug, Clone, Deserialize)]
pub struct RazorpayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Clone)]
pub struct RazorpayClient {
    client: Client,
    key_id: String,
    key_secret: String,
    base_url: String,
}

impl RazorpayClient {
    pub fn new(client: Client, key_id: String, key_secret: String) -> Self {
        Self {
            client,
            key_id,
            key_secret,
            base_url: RAZORPAY_API_BASE.to_string(),
        }
    }

    /// Point the client at another host, e.g. a local mock.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create an INR order for `amount_rupees`.
    pub async fn create_order(&self, amount_rupees: f64) -> Result<RazorpayOrder> {
        let body = json!({
            "amount": to_paise(amount_rupees),
            "currency": "INR",
            "receipt": format!("rcpt_{}", chrono::Utc::now().timestamp_millis()),
            "notes": {},
        });

        let resp = self
            .client
            .post(format!("{}/v1/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Payment(format!(
                "Razorpay order creation failed ({status}): {text}"
            )));
        }

        let order: RazorpayOrder = resp.json().await?;
        debug!("Razorpay order {} created for {} paise", order.id, order.amount);
        Ok(order)
    }

    pub fn verify_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        verify_signature(&self.key_secret, order_id, payment_id, signature)
    }
}

/// Razorpay amounts are integers in paise.
pub fn to_paise(amount_rupees: f64) -> i64 {
    (amount_rupees * 100.0).round() as i64
}

/// Checkout signature: hex HMAC-SHA256 of `"<order_id>|<payment_id>"` keyed
/// with the API secret. Compared in constant time.
pub fn verify_signature(secret: &str, order_id: &str, payment_id: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("{order_id}|{payment_id}").as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, order_id: &str, payment_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{order_id}|{payment_id}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
