//! Ticket codes and the values derived from them.
//!
//! A code is 6 uppercase hex characters drawn from 4 random bytes. Its
//! SHA-256 hex digest (`qr_hash`) is the check-in lookup key, and the QR
//! image encodes `<base-url>/t/<code>`.

use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;

use crate::db::{self, NewTicket};
use crate::errors::{AppError, Result};

/// Upper bound on draws per ticket before giving up with
/// [`AppError::CodeSpaceExhausted`].
pub const MAX_CODE_ATTEMPTS: usize = 16;

const CODE_LEN: usize = 6;

/// Draw a fresh random code. Uniqueness is not checked here.
pub fn random_code() -> String {
    let bytes: [u8; 4] = rand::random();
    let mut code = hex::encode(bytes);
    code.truncate(CODE_LEN);
    code.to_ascii_uppercase()
}

pub fn hash_of(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

pub fn qr_payload_url(base_url: &str, code: &str) -> String {
    format!("{}/t/{code}", base_url.trim_end_matches('/'))
}

/// A code that was successfully persisted, with its derived values.
#[derive(Debug, Clone)]
pub struct PersistedCode {
    pub ticket_code: String,
    pub qr_hash: String,
    pub qr_url: String,
}

/// Where a new ticket row belongs.
#[derive(Debug, Clone, Copy)]
pub struct TicketOwner<'a> {
    pub participant_id: &'a str,
    pub order_id: &'a str,
    pub tier_id: i64,
}

/// Draw codes until one is stored for `owner`.
///
/// The existence check only avoids a wasted insert; the unique index on
/// `ticket_code` decides, and a conflicting insert simply counts as another
/// attempt.
pub async fn persist_new_code(
    conn: &mut SqliteConnection,
    base_url: &str,
    owner: TicketOwner<'_>,
) -> Result<PersistedCode> {
    persist_with(conn, base_url, owner, random_code).await
}

async fn persist_with(
    conn: &mut SqliteConnection,
    base_url: &str,
    owner: TicketOwner<'_>,
    mut draw: impl FnMut() -> String,
) -> Result<PersistedCode> {
    for _ in 0..MAX_CODE_ATTEMPTS {
        let ticket_code = draw();
        if db::ticket_code_exists(&mut *conn, &ticket_code).await? {
            continue;
        }

        let qr_hash = hash_of(&ticket_code);
        let qr_url = qr_payload_url(base_url, &ticket_code);
        let inserted = db::insert_ticket_if_absent(
            &mut *conn,
            &NewTicket {
                ticket_code: &ticket_code,
                qr_hash: &qr_hash,
                qr_url: &qr_url,
                participant_id: owner.participant_id,
                order_id: owner.order_id,
                tier_id: owner.tier_id,
            },
        )
        .await?;

        if inserted == 1 {
            return Ok(PersistedCode {
                ticket_code,
                qr_hash,
                qr_url,
            });
        }
    }

    Err(AppError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
}
