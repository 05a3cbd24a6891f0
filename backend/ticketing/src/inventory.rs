//! Inventory ledger — tier selection and the atomic reservation of units.
//!
//! `remaining_quantity` is the single authoritative counter. A reservation
//! is a compare-and-swap decrement executed as the first statement of a
//! transaction; the caller keeps that transaction open while it issues
//! tickets, so rolling it back (or dropping it) releases the units.

use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::db;
use crate::errors::{AppError, Result};
use crate::models::TicketTier;

/// The tier a reservation was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub tier_id: i64,
    pub tier_title: String,
    pub quantity: i64,
}

/// Pick the tier currently on sale: among active tiers with stock left,
/// the lowest `priority` wins, and equal priorities go to the lowest id.
pub fn select_tier(tiers: &[TicketTier]) -> Option<&TicketTier> {
    tiers
        .iter()
        .filter(|t| t.is_active && t.remaining_quantity > 0)
        .min_by_key(|t| (t.priority, t.id))
}

/// The tier a buyer would get right now, if any.
pub async fn current_tier(pool: &SqlitePool) -> Result<Option<TicketTier>> {
    let tiers = db::list_tiers(pool).await?;
    Ok(select_tier(&tiers).cloned())
}

/// Reserve `quantity` units from the selected tier.
///
/// Fails with [`AppError::TicketsSoldOut`] when no tier qualifies, when the
/// selected tier holds fewer than `quantity` units, or when a concurrent
/// reservation drained it first. On success the returned transaction holds
/// the decrement; commit it together with whatever the units were for.
pub async fn reserve(
    pool: &SqlitePool,
    quantity: i64,
) -> Result<(Transaction<'static, Sqlite>, Reservation)> {
    if quantity <= 0 {
        return Err(AppError::BadRequest(format!(
            "reservation quantity must be positive, got {quantity}"
        )));
    }

    // Read outside the transaction so its first statement is the write.
    let tiers = db::list_tiers(pool).await?;
    let tier = select_tier(&tiers).ok_or(AppError::TicketsSoldOut)?;

    if tier.remaining_quantity < quantity {
        debug!(
            "Tier {} has {} left, {quantity} requested",
            tier.id, tier.remaining_quantity
        );
        return Err(AppError::TicketsSoldOut);
    }

    let mut tx = pool.begin().await?;
    let affected = db::decrement_remaining(&mut *tx, tier.id, quantity).await?;
    if affected == 0 {
        debug!("Lost reservation race on tier {}", tier.id);
        return Err(AppError::TicketsSoldOut);
    }

    info!("Reserved {quantity} unit(s) of tier {} ({})", tier.id, tier.title);
    Ok((
        tx,
        Reservation {
            tier_id: tier.id,
            tier_title: tier.title.clone(),
            quantity,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{remaining, seed_tier, test_pool};

    fn tier(id: i64, priority: i64, remaining_quantity: i64, is_active: bool) -> TicketTier {
        TicketTier {
            id,
            tier_type: format!("tier-{id}"),
            title: format!("Tier {id}"),
            fiat_price: 1000,
            crypto_price: 12.0,
            quantity: 100,
            remaining_quantity,
            is_active,
            priority,
        }
    }

    #[test]
    fn select_prefers_lowest_priority() {
        let tiers = vec![tier(1, 2, 10, true), tier(2, 1, 10, true), tier(3, 3, 10, true)];
        assert_eq!(select_tier(&tiers).map(|t| t.id), Some(2));
    }

    #[test]
    fn select_skips_inactive_and_sold_out_tiers() {
        let tiers = vec![tier(1, 0, 10, false), tier(2, 1, 0, true), tier(3, 5, 1, true)];
        assert_eq!(select_tier(&tiers).map(|t| t.id), Some(3));
    }

    #[test]
    fn select_breaks_priority_ties_by_lowest_id() {
        let tiers = vec![tier(7, 1, 10, true), tier(4, 1, 10, true)];
        assert_eq!(select_tier(&tiers).map(|t| t.id), Some(4));
    }

    #[test]
    fn select_returns_none_when_nothing_on_sale() {
        let tiers = vec![tier(1, 0, 0, true), tier(2, 0, 5, false)];
        assert!(select_tier(&tiers).is_none());
        assert!(select_tier(&[]).is_none());
    }

    #[tokio::test]
    async fn reserve_decrements_on_commit() {
        let (pool, _db) = test_pool().await;
        let early = seed_tier(&pool, "early-bird", 1, 5, true).await;
        seed_tier(&pool, "regular", 2, 50, true).await;

        let (tx, reservation) = reserve(&pool, 2).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(reservation.tier_id, early);
        assert_eq!(reservation.tier_title, "early-bird title");
        assert_eq!(remaining(&pool, early).await, 3);
    }

    #[tokio::test]
    async fn dropped_reservation_releases_units() {
        let (pool, _db) = test_pool().await;
        let early = seed_tier(&pool, "early-bird", 1, 5, true).await;

        let (tx, _) = reserve(&pool, 5).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(remaining(&pool, early).await, 5);
    }

    #[tokio::test]
    async fn insufficient_stock_does_not_fall_through_to_next_tier() {
        let (pool, _db) = test_pool().await;
        let early = seed_tier(&pool, "early-bird", 1, 2, true).await;
        let regular = seed_tier(&pool, "regular", 2, 50, true).await;

        let err = reserve(&pool, 3).await.unwrap_err();

        assert!(matches!(err, AppError::TicketsSoldOut));
        assert_eq!(remaining(&pool, early).await, 2);
        assert_eq!(remaining(&pool, regular).await, 50);
    }

    #[tokio::test]
    async fn no_active_tier_is_sold_out() {
        let (pool, _db) = test_pool().await;
        seed_tier(&pool, "early-bird", 1, 0, true).await;
        seed_tier(&pool, "regular", 2, 50, false).await;

        assert!(matches!(
            reserve(&pool, 1).await.unwrap_err(),
            AppError::TicketsSoldOut
        ));
        assert!(current_tier(&pool).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_oversell() {
        let (pool, _db) = test_pool().await;
        let tier_id = seed_tier(&pool, "early-bird", 1, 3, true).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                match reserve(&pool, 1).await {
                    Ok((tx, _)) => {
                        tx.commit().await.unwrap();
                        true
                    }
                    Err(AppError::TicketsSoldOut) => false,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }));
        }

        let mut won = 0;
        for h in handles {
            if h.await.unwrap() {
                won += 1;
            }
        }

        assert_eq!(won, 3);
        assert_eq!(remaining(&pool, tier_id).await, 0);
    }
}
