//! Background notification worker.
//!
//! Issuance hands finished orders to a bounded queue and returns at once.
//! The worker renders QR images and sends participant tickets and the buyer
//! confirmation through a [`Mailer`]. A periodic sweep picks up anything a
//! failed or dropped job left unsent. Nothing here touches inventory or
//! ticket state; a failure only leaves the `*_email_sent` flags unset.
//!
//! ## Resilience
//!
//! Each email is retried with exponential back-off, starting at
//! [`INITIAL_BACKOFF_SECS`] and capped at [`MAX_BACKOFF_SECS`], for up to
//! `max_attempts` tries. What still fails waits for the next sweep. A
//! back-off in progress is abandoned as soon as shutdown is requested.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{self, ParticipantTicket};
use crate::errors::{AppError, Result};
use crate::mailer::{Attachment, Mailer, TransactionalEmail};
use crate::models::non_empty;
use crate::qr;

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationJob {
    /// Tickets for this order were committed; deliver whatever is unsent.
    OrderIssued { order_id: String },
}

/// Sending half of the notification channel.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<NotificationJob>,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NotificationJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Non-blocking handoff. Returns `false` when the queue is full or the
    /// worker is gone; the sweep delivers those orders later.
    pub fn enqueue(&self, job: NotificationJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                warn!("Notification job not queued, left for the sweep: {e}");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECS),
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Templates {
    pub participant: String,
    pub buyer: String,
}

pub struct NotifierState {
    pub pool: SqlitePool,
    pub mailer: Arc<dyn Mailer>,
    pub templates: Templates,
    pub retry: RetryPolicy,
    pub sweep_interval: Duration,
    pub shutdown: CancellationToken,
}

/// Outcome of one delivery pass over an order.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub participants_sent: usize,
    pub participants_failed: usize,
    pub buyer_sent: bool,
}

/// Worker loop; runs until `state.shutdown` is cancelled or every queue
/// sender is dropped. The first sweep runs immediately so a restart picks
/// up work left over from the previous process.
pub async fn run(state: Arc<NotifierState>, mut jobs: mpsc::Receiver<NotificationJob>) {
    info!("Notifier starting — sweep every {:?}", state.sweep_interval);
    let mut sweep = tokio::time::interval(state.sweep_interval);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("Notifier stopping");
                break;
            }
            job = jobs.recv() => match job {
                Some(NotificationJob::OrderIssued { order_id }) => {
                    if let Err(e) = deliver_order(&state, &order_id).await {
                        error!("Notification for order {order_id} failed: {e}");
                    }
                }
                None => {
                    info!("Notification queue closed");
                    break;
                }
            },
            _ = sweep.tick() => {
                if let Err(e) = sweep_pending(&state).await {
                    error!("Notification sweep error: {e}");
                }
            }
        }
    }
}

/// Deliver every order that still has unsent emails.
pub async fn sweep_pending(state: &NotifierState) -> Result<usize> {
    let orders = db::orders_with_unsent_emails(&state.pool).await?;
    for order_id in &orders {
        if let Err(e) = deliver_order(state, order_id).await {
            error!("Sweep delivery for order {order_id} failed: {e}");
        }
    }
    if !orders.is_empty() {
        info!("Sweep visited {} order(s) with unsent emails", orders.len());
    }
    Ok(orders.len())
}

/// Send unsent participant tickets and the buyer confirmation for one order.
///
/// The buyer confirmation waits until every participant holds a ticket, so
/// an order that is not yet issued (or only partly) sends nothing to the
/// buyer and keeps its flag unset.
pub async fn deliver_order(state: &NotifierState, order_id: &str) -> Result<DeliveryReport> {
    let order = db::get_order(&state.pool, order_id)
        .await?
        .ok_or(AppError::OrderNotFound)?;
    let participants = db::participants_with_tickets(&state.pool, order_id).await?;
    let mut report = DeliveryReport::default();

    for p in participants.iter().filter(|p| !p.email_sent) {
        let (Some(code), Some(qr_url)) = (p.ticket_code.as_deref(), p.qr_url.as_deref()) else {
            continue;
        };

        let sent = match participant_email(state, p, order_id, code, qr_url) {
            Ok(email) => send_with_retry(state, &email).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                db::mark_participant_email_sent(&state.pool, &p.id).await?;
                report.participants_sent += 1;
                info!("Ticket sent → participant {}", p.id);
            }
            Err(e) => {
                report.participants_failed += 1;
                error!("Failed sending ticket → participant {}: {e}", p.id);
            }
        }
    }

    let all_issued =
        !participants.is_empty() && participants.iter().all(|p| p.ticket_code.is_some());
    if !order.buyer_email_sent && !all_issued {
        debug!("Order {} not fully issued, buyer confirmation deferred", order.id);
    }
    if !order.buyer_email_sent && all_issued {
        let buyer = db::get_buyer(&state.pool, &order.buyer_id).await?;
        match buyer {
            Some(buyer) => {
                let email = TransactionalEmail {
                    transactional_id: state.templates.buyer.clone(),
                    email: buyer.email.clone(),
                    data_variables: json!({
                        "buyerName": buyer.first_name,
                        "orderId": order.id,
                        "paymentId": order.payment_reference(),
                        "amount": order.amount.to_string(),
                        "currency": order.currency,
                        "status": order.status,
                        "participantsList": participants_list(&participants),
                    }),
                    attachments: vec![],
                };
                match send_with_retry(state, &email).await {
                    Ok(()) => {
                        db::mark_buyer_email_sent(&state.pool, &order.id).await?;
                        report.buyer_sent = true;
                        info!("Buyer confirmation sent for order {}", order.id);
                    }
                    Err(e) => error!("Failed sending buyer confirmation for order {}: {e}", order.id),
                }
            }
            None => warn!("Order {} has no buyer row", order.id),
        }
    }

    Ok(report)
}

fn participant_email(
    state: &NotifierState,
    p: &ParticipantTicket,
    order_id: &str,
    code: &str,
    qr_url: &str,
) -> Result<TransactionalEmail> {
    let png = qr::render_png(qr_url)?;
    Ok(TransactionalEmail {
        transactional_id: state.templates.participant.clone(),
        email: p.email.clone(),
        data_variables: json!({
            "name": non_empty(p.first_name.as_deref()).unwrap_or("Participant"),
            "orderId": order_id,
            "ticketCode": code,
        }),
        attachments: vec![Attachment::png(format!("Ticket-{code}.png"), &png)],
    })
}

/// One line per participant: `First (email) - Ticket: CODE`.
fn participants_list(participants: &[ParticipantTicket]) -> String {
    participants
        .iter()
        .map(|p| {
            format!(
                "{} ({}) - Ticket: {}",
                p.first_name.as_deref().unwrap_or(""),
                p.email,
                p.ticket_code.as_deref().unwrap_or("Pending")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn send_with_retry(state: &NotifierState, email: &TransactionalEmail) -> Result<()> {
    let retry = &state.retry;
    let mut backoff = retry.initial_backoff;
    let mut attempt = 1;

    loop {
        match state.mailer.send(email).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retry.max_attempts => {
                warn!(
                    "Email attempt {attempt}/{} failed (will retry in {backoff:?}): {e}",
                    retry.max_attempts
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = state.shutdown.cancelled() => {
                        info!("Shutdown requested, abandoning retries for {}", email.email);
                        return Err(e);
                    }
                }
                backoff = (backoff * 2).min(retry.max_backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
