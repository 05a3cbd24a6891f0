//! Check-in gate.
//!
//! Each ticket moves `NotCheckedIn -> CheckedIn` exactly once. The flip is a
//! conditional update keyed on the QR hash that only matches while the flag
//! is unset, so when several scanners read the same ticket at once exactly
//! one of them wins and the rest see `AlreadyCheckedIn`.
//!
//! `unverify` is the separate admin reset and is not reachable from the
//! scanning path.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::codes::hash_of;
use crate::db;
use crate::errors::{AppError, Result};
use crate::models::non_empty;

pub const ALREADY_CHECKED_IN: &str = "Participant is already checked in";

/// Who just walked in, for the greeting shown to event staff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendee {
    pub participant_name: String,
    pub ticket_type_title: String,
    pub buyer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CheckInOutcome {
    CheckedIn(Attendee),
    /// Duplicate scan. Expected and frequent, so not an error.
    AlreadyCheckedIn { reason: String },
}

/// Check in the ticket whose code was scanned or typed in.
pub async fn check_in(pool: &SqlitePool, presented_code: &str) -> Result<CheckInOutcome> {
    let code = presented_code.trim();
    if code.is_empty() {
        return Err(AppError::BadRequest("token required".to_string()));
    }

    let qr_hash = hash_of(code);
    let ticket = db::find_ticket_by_hash(pool, &qr_hash)
        .await?
        .ok_or(AppError::TicketNotFound)?;

    if ticket.checked_in {
        return Ok(already_checked_in(&qr_hash));
    }

    let affected = db::check_in_if_unset(pool, &qr_hash, db::now()).await?;
    if affected == 0 {
        // Another scanner flipped it between our read and our write.
        return Ok(already_checked_in(&qr_hash));
    }

    let attendee = db::attendee_for_ticket(pool, &qr_hash)
        .await?
        .ok_or(AppError::TicketNotFound)?;

    info!(
        "Checked in ticket {} for order {}",
        short(&qr_hash),
        ticket.order_id
    );

    Ok(CheckInOutcome::CheckedIn(Attendee {
        participant_name: non_empty(attendee.participant_first_name.as_deref())
            .unwrap_or("Participant")
            .to_string(),
        ticket_type_title: non_empty(attendee.tier_title.as_deref())
            .unwrap_or("Ticket")
            .to_string(),
        buyer_name: non_empty(attendee.buyer_first_name.as_deref())
            .unwrap_or("Buyer")
            .to_string(),
    }))
}

/// Admin override: put a ticket back to `NotCheckedIn`, e.g. after a
/// mistaken scan.
pub async fn unverify(pool: &SqlitePool, ticket_code: &str) -> Result<()> {
    let affected = db::reset_check_in(pool, ticket_code.trim()).await?;
    if affected == 0 {
        return Err(AppError::TicketNotFound);
    }
    warn!("Check-in reset for ticket {}", short(&hash_of(ticket_code.trim())));
    Ok(())
}

fn already_checked_in(qr_hash: &str) -> CheckInOutcome {
    info!("Duplicate scan of ticket {}", short(qr_hash));
    CheckInOutcome::AlreadyCheckedIn {
        reason: ALREADY_CHECKED_IN.to_string(),
    }
}

fn short(qr_hash: &str) -> &str {
    &qr_hash[..qr_hash.len().min(12)]
}
