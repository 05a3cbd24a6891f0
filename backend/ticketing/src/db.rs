//! Database layer — pool setup, migrations and every query the service runs.
//!
//! Helpers that take a `SqliteExecutor` work both on the pool and inside a
//! transaction (`&mut *tx`). Conditional writes return `rows_affected` so the
//! caller can tell a lost race from a success.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteExecutor, SqlitePool};
use tracing::info;

use crate::errors::Result;
use crate::models::{Buyer, IssuedTicket, Order, OrderStatus, Participant, TicketTier};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // WAL + busy timeout: concurrent writers queue on the database lock
    // instead of failing immediately with SQLITE_BUSY.
    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ─────────────────────────────────────────────────────────
// Tiers
// ─────────────────────────────────────────────────────────

const TIER_COLUMNS: &str = "id, type, title, fiat_price, crypto_price, quantity, \
                            remaining_quantity, is_active, priority";

/// All tiers in insertion order.
pub async fn list_tiers(db: impl SqliteExecutor<'_>) -> Result<Vec<TicketTier>> {
    let rows = sqlx::query_as::<_, TicketTier>(&format!(
        "SELECT {TIER_COLUMNS} FROM ticket_tiers ORDER BY id ASC"
    ))
    .fetch_all(db)
    .await?;
    Ok(rows)
}

pub async fn get_tier_by_type(db: impl SqliteExecutor<'_>, tier_type: &str) -> Result<Option<TicketTier>> {
    let row = sqlx::query_as::<_, TicketTier>(&format!(
        "SELECT {TIER_COLUMNS} FROM ticket_tiers WHERE type = ?1"
    ))
    .bind(tier_type)
    .fetch_optional(db)
    .await?;
    Ok(row)
}

/// Compare-and-swap decrement: succeeds only while the tier is active and
/// still holds at least `quantity` units. Returns the affected-row count.
pub async fn decrement_remaining(
    db: impl SqliteExecutor<'_>,
    tier_id: i64,
    quantity: i64,
) -> Result<u64> {
    let affected = sqlx::query(
        r#"
        UPDATE ticket_tiers
        SET    remaining_quantity = remaining_quantity - ?2
        WHERE  id = ?1
          AND  is_active = 1
          AND  remaining_quantity >= ?2
        "#,
    )
    .bind(tier_id)
    .bind(quantity)
    .execute(db)
    .await?
    .rows_affected();
    Ok(affected)
}

// ─────────────────────────────────────────────────────────
// Buyers, orders, participants
// ─────────────────────────────────────────────────────────

const ORDER_COLUMNS: &str = "id, buyer_id, tier_id, amount, currency, payment_type, status, \
                             payment_verified, razorpay_order_id, razorpay_payment_id, \
                             daimo_payment_id, buyer_email_sent, created_at";

const PARTICIPANT_COLUMNS: &str = "p.id, p.order_id, p.first_name, p.last_name, p.email, \
                                   p.is_buyer, p.email_sent";

/// Input for a new buyer row; the address is flattened onto the buyer.
#[derive(Debug, Clone)]
pub struct NewBuyer<'a> {
    pub id: &'a str,
    pub first_name: &'a str,
    pub last_name: Option<&'a str>,
    pub email: &'a str,
    pub address_line1: &'a str,
    pub address_line2: Option<&'a str>,
    pub city: &'a str,
    pub state: &'a str,
    pub country: &'a str,
    pub postal_code: &'a str,
}

pub async fn insert_buyer(db: impl SqliteExecutor<'_>, buyer: &NewBuyer<'_>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO buyers
            (id, first_name, last_name, email, address_line1, address_line2,
             city, state, country, postal_code)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(buyer.id)
    .bind(buyer.first_name)
    .bind(buyer.last_name)
    .bind(buyer.email)
    .bind(buyer.address_line1)
    .bind(buyer.address_line2)
    .bind(buyer.city)
    .bind(buyer.state)
    .bind(buyer.country)
    .bind(buyer.postal_code)
    .execute(db)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NewOrder<'a> {
    pub id: &'a str,
    pub buyer_id: &'a str,
    pub tier_id: i64,
    pub amount: f64,
    pub currency: &'a str,
    pub payment_type: &'a str,
    pub razorpay_order_id: Option<&'a str>,
    pub daimo_payment_id: Option<&'a str>,
}

pub async fn insert_order(db: impl SqliteExecutor<'_>, order: &NewOrder<'_>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO orders
            (id, buyer_id, tier_id, amount, currency, payment_type,
             razorpay_order_id, daimo_payment_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(order.id)
    .bind(order.buyer_id)
    .bind(order.tier_id)
    .bind(order.amount)
    .bind(order.currency)
    .bind(order.payment_type)
    .bind(order.razorpay_order_id)
    .bind(order.daimo_payment_id)
    .execute(db)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NewParticipant<'a> {
    pub id: &'a str,
    pub order_id: &'a str,
    pub first_name: Option<&'a str>,
    pub last_name: Option<&'a str>,
    pub email: &'a str,
    pub is_buyer: bool,
}

pub async fn insert_participant(
    db: impl SqliteExecutor<'_>,
    participant: &NewParticipant<'_>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO participants (id, order_id, first_name, last_name, email, is_buyer)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(participant.id)
    .bind(participant.order_id)
    .bind(participant.first_name)
    .bind(participant.last_name)
    .bind(participant.email)
    .bind(participant.is_buyer)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn get_order(db: impl SqliteExecutor<'_>, order_id: &str) -> Result<Option<Order>> {
    let row = sqlx::query_as::<_, Order>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"
    ))
    .bind(order_id)
    .fetch_optional(db)
    .await?;
    Ok(row)
}

pub async fn get_order_by_razorpay_id(
    db: impl SqliteExecutor<'_>,
    razorpay_order_id: &str,
) -> Result<Option<Order>> {
    let row = sqlx::query_as::<_, Order>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE razorpay_order_id = ?1"
    ))
    .bind(razorpay_order_id)
    .fetch_optional(db)
    .await?;
    Ok(row)
}

pub async fn get_order_by_daimo_id(
    db: impl SqliteExecutor<'_>,
    daimo_payment_id: &str,
) -> Result<Option<Order>> {
    let row = sqlx::query_as::<_, Order>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE daimo_payment_id = ?1"
    ))
    .bind(daimo_payment_id)
    .fetch_optional(db)
    .await?;
    Ok(row)
}

pub async fn get_buyer(db: impl SqliteExecutor<'_>, buyer_id: &str) -> Result<Option<Buyer>> {
    let row = sqlx::query_as::<_, Buyer>(
        "SELECT id, first_name, last_name, email FROM buyers WHERE id = ?1",
    )
    .bind(buyer_id)
    .fetch_optional(db)
    .await?;
    Ok(row)
}

/// Provider references recorded when an order is confirmed paid.
#[derive(Debug, Clone, Default)]
pub struct PaymentRefs<'a> {
    pub razorpay_payment_id: Option<&'a str>,
    pub razorpay_signature: Option<&'a str>,
}

/// Flag an order as paid. Existing provider references are kept when the
/// new ones are absent.
pub async fn mark_order_paid(
    db: impl SqliteExecutor<'_>,
    order_id: &str,
    refs: &PaymentRefs<'_>,
) -> Result<u64> {
    let affected = sqlx::query(
        r#"
        UPDATE orders
        SET    payment_verified    = 1,
               status              = ?2,
               razorpay_payment_id = COALESCE(?3, razorpay_payment_id),
               razorpay_signature  = COALESCE(?4, razorpay_signature)
        WHERE  id = ?1
        "#,
    )
    .bind(order_id)
    .bind(OrderStatus::Paid.as_str())
    .bind(refs.razorpay_payment_id)
    .bind(refs.razorpay_signature)
    .execute(db)
    .await?
    .rows_affected();
    Ok(affected)
}

pub async fn set_order_status(
    db: impl SqliteExecutor<'_>,
    order_id: &str,
    status: OrderStatus,
) -> Result<u64> {
    let affected = sqlx::query("UPDATE orders SET status = ?2 WHERE id = ?1")
        .bind(order_id)
        .bind(status.as_str())
        .execute(db)
        .await?
        .rows_affected();
    Ok(affected)
}

/// Participants of `order_id` that do not hold a ticket yet, oldest first.
pub async fn pending_participants(
    db: impl SqliteExecutor<'_>,
    order_id: &str,
) -> Result<Vec<Participant>> {
    let rows = sqlx::query_as::<_, Participant>(&format!(
        r#"
        SELECT {PARTICIPANT_COLUMNS}
        FROM   participants p
        LEFT   JOIN issued_tickets t ON t.participant_id = p.id
        WHERE  p.order_id = ?1
          AND  t.id IS NULL
        ORDER  BY p.created_at ASC, p.id ASC
        "#
    ))
    .bind(order_id)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// A participant joined with the ticket they hold, if any.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ParticipantTicket {
    pub id: String,
    pub order_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub is_buyer: bool,
    pub email_sent: bool,
    pub ticket_code: Option<String>,
    pub qr_url: Option<String>,
}

pub async fn participants_with_tickets(
    db: impl SqliteExecutor<'_>,
    order_id: &str,
) -> Result<Vec<ParticipantTicket>> {
    let rows = sqlx::query_as::<_, ParticipantTicket>(&format!(
        r#"
        SELECT {PARTICIPANT_COLUMNS}, t.ticket_code, t.qr_url
        FROM   participants p
        LEFT   JOIN issued_tickets t ON t.participant_id = p.id
        WHERE  p.order_id = ?1
        ORDER  BY p.created_at ASC, p.id ASC
        "#
    ))
    .bind(order_id)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

pub async fn mark_participant_email_sent(db: impl SqliteExecutor<'_>, participant_id: &str) -> Result<()> {
    sqlx::query("UPDATE participants SET email_sent = 1, email_sent_at = ?2 WHERE id = ?1")
        .bind(participant_id)
        .bind(now())
        .execute(db)
        .await?;
    Ok(())
}

pub async fn mark_buyer_email_sent(db: impl SqliteExecutor<'_>, order_id: &str) -> Result<()> {
    sqlx::query("UPDATE orders SET buyer_email_sent = 1, buyer_email_sent_at = ?2 WHERE id = ?1")
        .bind(order_id)
        .bind(now())
        .execute(db)
        .await?;
    Ok(())
}

/// Orders holding issued tickets whose participant or buyer emails are
/// still outstanding.
pub async fn orders_with_unsent_emails(db: impl SqliteExecutor<'_>) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT o.id
        FROM   orders o
        JOIN   issued_tickets t ON t.order_id = o.id
        JOIN   participants p   ON p.id = t.participant_id
        WHERE  p.email_sent = 0 OR o.buyer_email_sent = 0
        ORDER  BY o.created_at ASC
        "#,
    )
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// ─────────────────────────────────────────────────────────
// Issued tickets
// ─────────────────────────────────────────────────────────

const TICKET_COLUMNS: &str = "id, ticket_code, qr_hash, qr_url, participant_id, order_id, \
                              tier_id, checked_in, checked_in_at, created_at";

#[derive(Debug, Clone)]
pub struct NewTicket<'a> {
    pub ticket_code: &'a str,
    pub qr_hash: &'a str,
    pub qr_url: &'a str,
    pub participant_id: &'a str,
    pub order_id: &'a str,
    pub tier_id: i64,
}

pub async fn ticket_code_exists(db: impl SqliteExecutor<'_>, ticket_code: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM issued_tickets WHERE ticket_code = ?1")
        .bind(ticket_code)
        .fetch_optional(db)
        .await?;
    Ok(row.is_some())
}

/// Insert-if-absent keyed on `ticket_code`. Returns 0 when the code is
/// already taken; any other constraint violation is an error.
pub async fn insert_ticket_if_absent(db: impl SqliteExecutor<'_>, ticket: &NewTicket<'_>) -> Result<u64> {
    let affected = sqlx::query(
        r#"
        INSERT INTO issued_tickets
            (ticket_code, qr_hash, qr_url, participant_id, order_id, tier_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(ticket_code) DO NOTHING
        "#,
    )
    .bind(ticket.ticket_code)
    .bind(ticket.qr_hash)
    .bind(ticket.qr_url)
    .bind(ticket.participant_id)
    .bind(ticket.order_id)
    .bind(ticket.tier_id)
    .execute(db)
    .await?
    .rows_affected();
    Ok(affected)
}

pub async fn find_ticket_by_hash(db: impl SqliteExecutor<'_>, qr_hash: &str) -> Result<Option<IssuedTicket>> {
    let row = sqlx::query_as::<_, IssuedTicket>(&format!(
        "SELECT {TICKET_COLUMNS} FROM issued_tickets WHERE qr_hash = ?1"
    ))
    .bind(qr_hash)
    .fetch_optional(db)
    .await?;
    Ok(row)
}

pub async fn tickets_for_order(db: impl SqliteExecutor<'_>, order_id: &str) -> Result<Vec<IssuedTicket>> {
    let rows = sqlx::query_as::<_, IssuedTicket>(&format!(
        "SELECT {TICKET_COLUMNS} FROM issued_tickets WHERE order_id = ?1 ORDER BY id ASC"
    ))
    .bind(order_id)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// Flip `checked_in` only while it is still unset. Returns the
/// affected-row count: 1 for the winning scan, 0 for everyone else.
pub async fn check_in_if_unset(db: impl SqliteExecutor<'_>, qr_hash: &str, at: i64) -> Result<u64> {
    let affected = sqlx::query(
        r#"
        UPDATE issued_tickets
        SET    checked_in = 1, checked_in_at = ?2
        WHERE  qr_hash = ?1
          AND  checked_in = 0
        "#,
    )
    .bind(qr_hash)
    .bind(at)
    .execute(db)
    .await?
    .rows_affected();
    Ok(affected)
}

/// Unconditional reset used by the admin override.
pub async fn reset_check_in(db: impl SqliteExecutor<'_>, ticket_code: &str) -> Result<u64> {
    let affected = sqlx::query(
        "UPDATE issued_tickets SET checked_in = 0, checked_in_at = NULL WHERE ticket_code = ?1",
    )
    .bind(ticket_code)
    .execute(db)
    .await?
    .rows_affected();
    Ok(affected)
}

/// Names needed for the check-in greeting.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AttendeeRow {
    pub participant_first_name: Option<String>,
    pub tier_title: Option<String>,
    pub buyer_first_name: Option<String>,
}

pub async fn attendee_for_ticket(db: impl SqliteExecutor<'_>, qr_hash: &str) -> Result<Option<AttendeeRow>> {
    let row = sqlx::query_as::<_, AttendeeRow>(
        r#"
        SELECT p.first_name AS participant_first_name,
               tt.title     AS tier_title,
               b.first_name AS buyer_first_name
        FROM   issued_tickets t
        JOIN   participants p       ON p.id = t.participant_id
        JOIN   orders o             ON o.id = t.order_id
        LEFT   JOIN ticket_tiers tt ON tt.id = t.tier_id
        LEFT   JOIN buyers b        ON b.id = o.buyer_id
        WHERE  t.qr_hash = ?1
        "#,
    )
    .bind(qr_hash)
    .fetch_optional(db)
    .await?;
    Ok(row)
}
