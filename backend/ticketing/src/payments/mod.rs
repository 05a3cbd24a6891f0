//! Order intake and payment settlement.
//!
//! An order is recorded as `pending` together with its buyer and
//! participants once the provider has accepted the checkout. Settlement
//! (signature verification, status lookup or a provider webhook) marks it
//! paid and hands it to issuance. Settling an already issued order is a
//! no-op, so duplicate webhooks and client retries are harmless.

pub mod daimo;
pub mod razorpay;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::ApiState;
use crate::db::{self, NewBuyer, NewOrder, NewParticipant, PaymentRefs};
use crate::errors::{AppError, Result};
use crate::issuance::{issue_for_order, IssuanceResult};
use crate::models::{Order, OrderStatus, PaymentType, TicketTier};

use daimo::{DaimoEventKind, DaimoWebhook, PAYMENT_COMPLETE};

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressInput {
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    pub state: String,
    pub country: String,
    pub postal_code: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyerInput {
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    pub email: String,
    pub address: AddressInput,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInput {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub ticket_type: String,
    pub buyer: BuyerInput,
    pub participants: Vec<ParticipantInput>,
}

#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub order_id: String,
    /// Rupees for Razorpay, USDC for Daimo.
    pub amount: f64,
    pub currency: &'static str,
    /// Razorpay order id or Daimo payment id, whichever the client needs
    /// to open the checkout.
    pub payment_reference: String,
}

/// Body of `POST /payments/verify`. The Razorpay fields keep the names the
/// Razorpay checkout callback uses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyPaymentRequest {
    #[serde(rename = "paymentType", default)]
    pub payment_type: Option<PaymentType>,
    #[serde(rename = "paymentId", default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub razorpay_order_id: Option<String>,
    #[serde(default)]
    pub razorpay_payment_id: Option<String>,
    #[serde(default)]
    pub razorpay_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuance: Option<IssuanceResult>,
}

// ─────────────────────────────────────────────────────────
// Order intake
// ─────────────────────────────────────────────────────────

/// Open a checkout with the provider and record the pending order.
pub async fn create_order(
    state: &ApiState,
    payment_type: PaymentType,
    req: &CreateOrderRequest,
) -> Result<CreatedOrder> {
    validate(req)?;

    let tier = db::get_tier_by_type(&state.pool, req.ticket_type.trim())
        .await?
        .ok_or(AppError::TierNotFound)?;
    if !tier.is_active {
        return Err(AppError::BadRequest(format!(
            "ticket type '{}' is not on sale",
            tier.tier_type
        )));
    }

    let amount = order_amount(&tier, payment_type, req.participants.len());
    let payment_reference = match payment_type {
        PaymentType::Razorpay => state.razorpay.create_order(amount).await?.id,
        PaymentType::Daimo => state.daimo.create_payment(amount).await?,
    };

    let order_id = record_order(&state.pool, req, &tier, payment_type, amount, &payment_reference).await?;
    info!(
        "Order {order_id} created: {} x {} via {} ({amount} {})",
        req.participants.len(),
        tier.tier_type,
        payment_type.as_str(),
        payment_type.currency()
    );

    Ok(CreatedOrder {
        order_id,
        amount,
        currency: payment_type.currency(),
        payment_reference,
    })
}

fn validate(req: &CreateOrderRequest) -> Result<()> {
    if req.participants.is_empty() {
        return Err(AppError::BadRequest("at least one participant is required".to_string()));
    }
    if req.buyer.first_name.trim().is_empty() {
        return Err(AppError::BadRequest("buyer first name is required".to_string()));
    }
    let emails = std::iter::once(&req.buyer.email).chain(req.participants.iter().map(|p| &p.email));
    for email in emails {
        if !looks_like_email(email) {
            return Err(AppError::BadRequest(format!("invalid email address: '{email}'")));
        }
    }
    Ok(())
}

fn looks_like_email(email: &str) -> bool {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !email.contains(' '),
        None => false,
    }
}

/// Total for `count` tickets: rupees for Razorpay, USDC for Daimo.
pub fn order_amount(tier: &TicketTier, payment_type: PaymentType, count: usize) -> f64 {
    let unit = match payment_type {
        PaymentType::Razorpay => tier.fiat_price as f64,
        PaymentType::Daimo => tier.crypto_price,
    };
    unit * count as f64
}

/// Buyer, order and participants go in together or not at all.
async fn record_order(
    pool: &SqlitePool,
    req: &CreateOrderRequest,
    tier: &TicketTier,
    payment_type: PaymentType,
    amount: f64,
    payment_reference: &str,
) -> Result<String> {
    let buyer_id = Uuid::new_v4().to_string();
    let order_id = Uuid::new_v4().to_string();
    let buyer = &req.buyer;
    let buyer_email = buyer.email.trim();

    let mut tx = pool.begin().await?;

    db::insert_buyer(
        &mut *tx,
        &NewBuyer {
            id: &buyer_id,
            first_name: buyer.first_name.trim(),
            last_name: buyer.last_name.as_deref(),
            email: buyer_email,
            address_line1: &buyer.address.line1,
            address_line2: buyer.address.line2.as_deref(),
            city: &buyer.address.city,
            state: &buyer.address.state,
            country: &buyer.address.country,
            postal_code: &buyer.address.postal_code,
        },
    )
    .await?;

    let (razorpay_order_id, daimo_payment_id) = match payment_type {
        PaymentType::Razorpay => (Some(payment_reference), None),
        PaymentType::Daimo => (None, Some(payment_reference)),
    };
    db::insert_order(
        &mut *tx,
        &NewOrder {
            id: &order_id,
            buyer_id: &buyer_id,
            tier_id: tier.id,
            amount,
            currency: payment_type.currency(),
            payment_type: payment_type.as_str(),
            razorpay_order_id,
            daimo_payment_id,
        },
    )
    .await?;

    for participant in &req.participants {
        let participant_id = Uuid::new_v4().to_string();
        let email = participant.email.trim();
        db::insert_participant(
            &mut *tx,
            &NewParticipant {
                id: &participant_id,
                order_id: &order_id,
                first_name: participant.first_name.as_deref().map(str::trim),
                last_name: participant.last_name.as_deref().map(str::trim),
                email,
                is_buyer: email.eq_ignore_ascii_case(buyer_email),
            },
        )
        .await?;
    }

    tx.commit().await?;
    Ok(order_id)
}

// ─────────────────────────────────────────────────────────
// Settlement
// ─────────────────────────────────────────────────────────

/// Mark `order` paid and issue its tickets. Returns `None` when every
/// participant already holds a ticket.
pub async fn settle_order(
    state: &ApiState,
    order: &Order,
    refs: &PaymentRefs<'_>,
) -> Result<Option<IssuanceResult>> {
    db::mark_order_paid(&state.pool, &order.id, refs).await?;

    match issue_for_order(&state.pool, &state.config.app_base_url, &state.queue, &order.id).await {
        Ok(result) => Ok(Some(result)),
        Err(AppError::AlreadyIssued) => {
            info!("Order {} already settled, nothing to issue", order.id);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Client-side confirmation after checkout. A bad signature or an
/// incomplete Daimo payment is reported with `success: false`.
pub async fn verify_payment(state: &ApiState, req: &VerifyPaymentRequest) -> Result<VerifyOutcome> {
    match req.payment_type.unwrap_or(PaymentType::Razorpay) {
        PaymentType::Razorpay => verify_razorpay(state, req).await,
        PaymentType::Daimo => verify_daimo(state, req).await,
    }
}

async fn verify_razorpay(state: &ApiState, req: &VerifyPaymentRequest) -> Result<VerifyOutcome> {
    let (Some(order_ref), Some(payment_id), Some(signature)) = (
        req.razorpay_order_id.as_deref(),
        req.razorpay_payment_id.as_deref(),
        req.razorpay_signature.as_deref(),
    ) else {
        return Err(AppError::BadRequest(
            "razorpay_order_id, razorpay_payment_id and razorpay_signature are required".to_string(),
        ));
    };

    if !state.razorpay.verify_signature(order_ref, payment_id, signature) {
        warn!("Rejected Razorpay signature for {order_ref}");
        return Ok(VerifyOutcome {
            success: false,
            message: "Invalid signature".to_string(),
            issuance: None,
        });
    }

    let order = db::get_order_by_razorpay_id(&state.pool, order_ref)
        .await?
        .ok_or(AppError::OrderNotFound)?;

    let refs = PaymentRefs {
        razorpay_payment_id: Some(payment_id),
        razorpay_signature: Some(signature),
    };
    let issuance = settle_order(state, &order, &refs).await?;
    Ok(VerifyOutcome {
        success: true,
        message: "Payment verified".to_string(),
        issuance,
    })
}

async fn verify_daimo(state: &ApiState, req: &VerifyPaymentRequest) -> Result<VerifyOutcome> {
    let payment_id = req
        .payment_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("paymentId is required".to_string()))?;

    let status = state.daimo.payment_status(payment_id).await?;
    if status != PAYMENT_COMPLETE {
        return Ok(VerifyOutcome {
            success: false,
            message: format!("Payment not completed. Current status: {status}"),
            issuance: None,
        });
    }

    let order = db::get_order_by_daimo_id(&state.pool, payment_id)
        .await?
        .ok_or(AppError::OrderNotFound)?;
    let issuance = settle_order(state, &order, &PaymentRefs::default()).await?;
    Ok(VerifyOutcome {
        success: true,
        message: "Payment verified".to_string(),
        issuance,
    })
}

/// React to a Daimo webhook. Unknown payments and uninteresting event types
/// are acknowledged and ignored so Daimo stops redelivering them.
pub async fn handle_daimo_webhook(state: &ApiState, event: &DaimoWebhook) -> Result<()> {
    let kind = event.kind();
    let Some(payment_id) = event.payment_id() else {
        warn!("Daimo webhook '{}' without a payment id", event.event_type);
        return Ok(());
    };

    let status = match kind {
        DaimoEventKind::PaymentCompleted => None,
        DaimoEventKind::PaymentBounced => Some(OrderStatus::Pending),
        DaimoEventKind::PaymentRefunded => Some(OrderStatus::Refunded),
        DaimoEventKind::PaymentStarted | DaimoEventKind::Unknown => {
            info!("Ignoring Daimo '{}' for {payment_id}", event.event_type);
            return Ok(());
        }
    };

    let Some(order) = db::get_order_by_daimo_id(&state.pool, &payment_id).await? else {
        warn!("Daimo webhook for unknown payment {payment_id}");
        return Ok(());
    };

    if let Some(status) = status {
        db::set_order_status(&state.pool, &order.id, status).await?;
        info!("Order {} set to {} by Daimo webhook", order.id, status.as_str());
        return Ok(());
    }

    match settle_order(state, &order, &PaymentRefs::default()).await {
        Ok(_) => Ok(()),
        // Paid but unfulfillable; an operator retries issuance once stock is back.
        Err(AppError::TicketsSoldOut) => {
            error!("Order {} paid via Daimo but tickets are sold out", order.id);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
