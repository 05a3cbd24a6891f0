//! Row types for the ticketing schema.
//!
//! Enum-like columns (`payment_type`, `status`) are stored as text; the
//! enums below own the canonical spelling.

use serde::{Deserialize, Serialize};

/// How an order is paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentType {
    /// INR through Razorpay.
    Razorpay,
    /// USDC through Daimo Pay.
    Daimo,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Razorpay => "RAZORPAY",
            Self::Daimo => "DAIMO",
        }
    }

    pub fn currency(&self) -> &'static str {
        match self {
            Self::Razorpay => "INR",
            Self::Daimo => "USDC",
        }
    }
}

/// Lifecycle of an order as seen by the payment providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Refunded => "refunded",
        }
    }
}

/// A sellable class of ticket with its own price and inventory counter.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TicketTier {
    pub id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub tier_type: String,
    pub title: String,
    /// Price in whole rupees.
    pub fiat_price: i64,
    /// Price in USDC.
    pub crypto_price: f64,
    pub quantity: i64,
    pub remaining_quantity: i64,
    pub is_active: bool,
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Buyer {
    pub id: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: String,
    pub buyer_id: String,
    pub tier_id: i64,
    pub amount: f64,
    pub currency: String,
    pub payment_type: String,
    pub status: String,
    pub payment_verified: bool,
    pub razorpay_order_id: Option<String>,
    pub razorpay_payment_id: Option<String>,
    pub daimo_payment_id: Option<String>,
    pub buyer_email_sent: bool,
    pub created_at: i64,
}

impl Order {
    /// Provider-side payment reference shown to the buyer.
    pub fn payment_reference(&self) -> &str {
        self.razorpay_payment_id
            .as_deref()
            .or(self.daimo_payment_id.as_deref())
            .unwrap_or("N/A")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Participant {
    pub id: String,
    pub order_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub is_buyer: bool,
    pub email_sent: bool,
}

impl Participant {
    pub fn display_name(&self) -> &str {
        non_empty(self.first_name.as_deref()).unwrap_or("Participant")
    }
}

/// A ticket issued to one participant.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IssuedTicket {
    pub id: i64,
    pub ticket_code: String,
    pub qr_hash: String,
    pub qr_url: String,
    pub participant_id: String,
    pub order_id: String,
    pub tier_id: i64,
    pub checked_in: bool,
    pub checked_in_at: Option<i64>,
    pub created_at: i64,
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
