//! Fixtures shared by the unit tests: a throwaway database per test plus
//! seeding helpers for tiers and orders.

use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use crate::db::{self, NewBuyer, NewOrder, NewParticipant};

/// Fresh file-backed database with migrations applied. A file (not
/// `:memory:`) so every pooled connection sees the same data. The database
/// lives inside the returned directory, which is deleted when dropped; keep
/// it alive as long as the pool.
pub async fn test_pool() -> (SqlitePool, TempDir) {
    let dir = tempfile::Builder::new()
        .prefix("ticketing-test-")
        .tempdir()
        .expect("temp dir");
    let path = dir.path().join("ticketing.db");
    let pool = db::init_pool(&format!("sqlite:{}", path.display()))
        .await
        .expect("test database");
    (pool, dir)
}

pub async fn seed_tier(
    pool: &SqlitePool,
    tier_type: &str,
    priority: i64,
    remaining: i64,
    is_active: bool,
) -> i64 {
    sqlx::query(
        r#"
        INSERT INTO ticket_tiers
            (type, title, fiat_price, crypto_price, quantity, remaining_quantity, is_active, priority)
        VALUES (?1, ?2, 1249, 15.0, ?3, ?3, ?4, ?5)
        "#,
    )
    .bind(tier_type)
    .bind(format!("{tier_type} title"))
    .bind(remaining)
    .bind(is_active)
    .bind(priority)
    .execute(pool)
    .await
    .expect("seed tier")
    .last_insert_rowid()
}

pub async fn remaining(pool: &SqlitePool, tier_id: i64) -> i64 {
    let (n,): (i64,) = sqlx::query_as("SELECT remaining_quantity FROM ticket_tiers WHERE id = ?1")
        .bind(tier_id)
        .fetch_one(pool)
        .await
        .expect("tier exists");
    n
}

/// Creates a Razorpay order bought by "Ravi" with one participant per name.
pub async fn seed_order(pool: &SqlitePool, tier_id: i64, names: &[&str]) -> String {
    let buyer_id = Uuid::new_v4().to_string();
    let order_id = Uuid::new_v4().to_string();
    let razorpay_order_id = format!("order_{}", Uuid::new_v4().simple());

    db::insert_buyer(
        pool,
        &NewBuyer {
            id: &buyer_id,
            first_name: "Ravi",
            last_name: None,
            email: "ravi@example.com",
            address_line1: "1 Marine Drive",
            address_line2: None,
            city: "Mumbai",
            state: "MH",
            country: "IN",
            postal_code: "400001",
        },
    )
    .await
    .expect("seed buyer");

    db::insert_order(
        pool,
        &NewOrder {
            id: &order_id,
            buyer_id: &buyer_id,
            tier_id,
            amount: 1249.0 * names.len() as f64,
            currency: "INR",
            payment_type: "RAZORPAY",
            razorpay_order_id: Some(&razorpay_order_id),
            daimo_payment_id: None,
        },
    )
    .await
    .expect("seed order");

    for name in names {
        let participant_id = Uuid::new_v4().to_string();
        let email = format!("{}@example.com", name.to_lowercase());
        db::insert_participant(
            pool,
            &NewParticipant {
                id: &participant_id,
                order_id: &order_id,
                first_name: Some(name),
                last_name: None,
                email: &email,
                is_buyer: false,
            },
        )
        .await
        .expect("seed participant");
    }

    order_id
}

pub async fn ticket_count(pool: &SqlitePool, order_id: &str) -> i64 {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM issued_tickets WHERE order_id = ?1")
        .bind(order_id)
        .fetch_one(pool)
        .await
        .expect("count tickets");
    n
}

mod tests {
    use super::*;

    #[tokio::test]
    async fn database_is_removed_with_its_directory() {
        let (pool, dir) = test_pool().await;
        let path = dir.path().to_path_buf();
        assert!(path.join("ticketing.db").exists());

        pool.close().await;
        drop(dir);
        assert!(!path.exists());
    }
}
