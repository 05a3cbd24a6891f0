//! Axum REST API: routes, shared state and handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth;
use crate::checkin::{self, CheckInOutcome};
use crate::config::Config;
use crate::db;
use crate::errors::{AppError, Result};
use crate::inventory;
use crate::issuance::{self, IssuanceResult};
use crate::models::PaymentType;
use crate::notify::{NotificationJob, NotificationQueue};
use crate::payments::{
    self,
    daimo::{DaimoClient, DaimoWebhook},
    razorpay::RazorpayClient,
    CreateOrderRequest, VerifyPaymentRequest,
};

pub struct ApiState {
    pub pool: SqlitePool,
    pub config: Config,
    pub queue: NotificationQueue,
    pub razorpay: RazorpayClient,
    pub daimo: DaimoClient,
}

impl ApiState {
    pub fn new(pool: SqlitePool, config: Config, client: Client, queue: NotificationQueue) -> Self {
        let razorpay = RazorpayClient::new(
            client.clone(),
            config.razorpay_key_id.clone(),
            config.razorpay_key_secret.clone(),
        );
        let daimo = DaimoClient::new(
            client,
            config.daimo_api_key.clone(),
            config.daimo_destination_address.clone(),
        );
        Self {
            pool,
            config,
            queue,
            razorpay,
            daimo,
        }
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    let scanner = Router::new()
        .route("/t/:token", get(scan_ticket))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_scanner_key,
        ));

    let admin = Router::new()
        .route("/internal/tickets/:code/verify", post(admin_check_in))
        .route("/internal/tickets/:code/unverify", post(admin_unverify))
        .route("/internal/orders/:id/issue", post(admin_issue))
        .route("/internal/orders/:id/notify", post(admin_notify))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin_key,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/tiers/current", get(current_tier))
        .route("/payments/order", post(create_razorpay_order))
        .route("/payments/create-order", post(create_daimo_order))
        .route("/payments/verify", post(verify_payment))
        .route("/payments/daimo/webhook", post(daimo_webhook))
        .merge(scanner)
        .merge(admin)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /tiers/current`
pub async fn current_tier(State(state): State<Arc<ApiState>>) -> Result<Response> {
    Ok(match inventory::current_tier(&state.pool).await? {
        Some(tier) => Json(tier).into_response(),
        None => Json(json!({ "message": "No active tickets available." })).into_response(),
    })
}

/// `GET /t/:token`
///
/// Hit by the scanner app with the code embedded in the QR image.
pub async fn scan_ticket(
    State(state): State<Arc<ApiState>>,
    Path(token): Path<String>,
) -> Result<Response> {
    let event = &state.config.event_name;
    Ok(match checkin::check_in(&state.pool, &token).await? {
        CheckInOutcome::CheckedIn(attendee) => format!(
            "Hi {}, Welcome to {event}! You have received the {} {event} Conference ticket with ticket code : {} paid for by {}",
            attendee.participant_name,
            attendee.ticket_type_title,
            token.trim(),
            attendee.buyer_name
        )
        .into_response(),
        CheckInOutcome::AlreadyCheckedIn { reason } => {
            (StatusCode::CONFLICT, format!("Check-in failed: {reason}")).into_response()
        }
    })
}

/// `POST /internal/tickets/:code/verify`
pub async fn admin_check_in(
    State(state): State<Arc<ApiState>>,
    Path(code): Path<String>,
) -> Result<Json<serde_json::Value>> {
    match checkin::check_in(&state.pool, &code).await? {
        CheckInOutcome::CheckedIn(attendee) => Ok(Json(json!({
            "success": true,
            "message": "Ticket checked in",
            "attendee": attendee,
        }))),
        CheckInOutcome::AlreadyCheckedIn { reason } => Err(AppError::BadRequest(reason)),
    }
}

/// `POST /internal/tickets/:code/unverify`
pub async fn admin_unverify(
    State(state): State<Arc<ApiState>>,
    Path(code): Path<String>,
) -> Result<Json<MessageResponse>> {
    checkin::unverify(&state.pool, &code).await?;
    Ok(Json(MessageResponse {
        success: true,
        message: "Ticket unverified".to_string(),
    }))
}

/// `POST /internal/orders/:id/issue`
///
/// Re-runs issuance for a paid order, e.g. after it sold out.
pub async fn admin_issue(
    State(state): State<Arc<ApiState>>,
    Path(order_id): Path<String>,
) -> Result<Json<IssuanceResult>> {
    let order = db::get_order(&state.pool, &order_id)
        .await?
        .ok_or(AppError::OrderNotFound)?;
    if !order.payment_verified {
        return Err(AppError::BadRequest(format!("order {order_id} is not paid")));
    }
    let result =
        issuance::issue_for_order(&state.pool, &state.config.app_base_url, &state.queue, &order.id)
            .await?;
    Ok(Json(result))
}

/// `POST /internal/orders/:id/notify`
///
/// Re-queues delivery for an order that already holds tickets.
pub async fn admin_notify(
    State(state): State<Arc<ApiState>>,
    Path(order_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let order = db::get_order(&state.pool, &order_id)
        .await?
        .ok_or(AppError::OrderNotFound)?;
    if db::tickets_for_order(&state.pool, &order.id).await?.is_empty() {
        return Err(AppError::BadRequest(format!(
            "order {order_id} has no issued tickets"
        )));
    }
    let queued = state.queue.enqueue(NotificationJob::OrderIssued { order_id: order.id });
    Ok(Json(json!({ "queued": queued })))
}

/// `POST /payments/order`
///
/// `amount` is the rupee total; the Razorpay order itself carries paise.
pub async fn create_razorpay_order(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<Json<serde_json::Value>> {
    let created = payments::create_order(&state, PaymentType::Razorpay, &req).await?;
    Ok(Json(json!({
        "success": true,
        "razorpayOrderId": created.payment_reference,
        "amount": created.amount,
        "currency": created.currency,
        "orderId": created.order_id,
    })))
}

/// `POST /payments/create-order`
pub async fn create_daimo_order(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<Json<serde_json::Value>> {
    let created = payments::create_order(&state, PaymentType::Daimo, &req).await?;
    Ok(Json(json!({
        "success": true,
        "paymentId": created.payment_reference,
        "orderId": created.order_id,
    })))
}

/// `POST /payments/verify`
pub async fn verify_payment(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<VerifyPaymentRequest>,
) -> Result<Response> {
    let outcome = payments::verify_payment(&state, &req).await?;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok((status, Json(outcome)).into_response())
}

/// `POST /payments/daimo/webhook`
pub async fn daimo_webhook(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(event): Json<DaimoWebhook>,
) -> Result<Json<serde_json::Value>> {
    if !auth::webhook_token_matches(&headers, &state.config.daimo_webhook_token) {
        warn!("Daimo webhook with a bad token");
        return Err(AppError::Unauthorized);
    }
    payments::handle_daimo_webhook(&state, &event).await?;
    Ok(Json(json!({ "received": true })))
}

#[cfg(test)]
pub(crate) fn test_state(
    pool: SqlitePool,
) -> (ApiState, tokio::sync::mpsc::Receiver<NotificationJob>) {
    let (queue, rx) = NotificationQueue::new(16);
    (ApiState::new(pool, Config::for_tests(), Client::new(), queue), rx)
}
