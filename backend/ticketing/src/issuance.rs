//! Turns a paid order into one ticket per participant.
//!
//! The whole batch is all-or-nothing: the inventory reservation and every
//! ticket insert share one transaction, so a sell-out or a failed insert
//! leaves neither a decrement nor a partial set of tickets behind.
//! Notification is handed off after commit and never affects the outcome.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::codes::{self, TicketOwner};
use crate::db;
use crate::errors::{AppError, Result};
use crate::inventory;
use crate::notify::{NotificationJob, NotificationQueue};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedSummary {
    pub participant_id: String,
    pub ticket_code: String,
    pub qr_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceResult {
    pub order_id: String,
    pub tier_id: i64,
    pub tier_title: String,
    pub tickets: Vec<IssuedSummary>,
    /// Whether the post-issuance email job reached the notification queue.
    pub notification_queued: bool,
}

/// Issue tickets for every participant of `order_id` that does not hold one.
///
/// The caller guarantees the order is paid; payment status is not checked.
pub async fn issue_for_order(
    pool: &SqlitePool,
    base_url: &str,
    queue: &NotificationQueue,
    order_id: &str,
) -> Result<IssuanceResult> {
    let order = db::get_order(pool, order_id)
        .await?
        .ok_or(AppError::OrderNotFound)?;

    let pending = db::pending_participants(pool, &order.id).await?;
    if pending.is_empty() {
        return Err(AppError::AlreadyIssued);
    }
    let quantity = pending.len() as i64;

    let (mut tx, reservation) = inventory::reserve(pool, quantity).await.map_err(|e| {
        if matches!(e, AppError::TicketsSoldOut) {
            warn!("Tickets sold out for order {} ({quantity} requested)", order.id);
        }
        e
    })?;

    // Re-read under the write lock: a concurrent issuance for the same
    // order may have committed between the first read and the reservation.
    let pending = db::pending_participants(&mut *tx, &order.id).await?;
    if pending.len() as i64 != quantity {
        tx.rollback().await?;
        return Err(if pending.is_empty() {
            AppError::AlreadyIssued
        } else {
            AppError::IssuanceConflict
        });
    }

    let mut tickets = Vec::with_capacity(pending.len());
    for participant in &pending {
        let persisted = codes::persist_new_code(
            &mut tx,
            base_url,
            TicketOwner {
                participant_id: &participant.id,
                order_id: &order.id,
                tier_id: reservation.tier_id,
            },
        )
        .await?;

        debug!(
            "Ticket for {} ({}) stored (hash {})",
            participant.display_name(),
            participant.id,
            &persisted.qr_hash[..12]
        );
        tickets.push(IssuedSummary {
            participant_id: participant.id.clone(),
            ticket_code: persisted.ticket_code,
            qr_url: persisted.qr_url,
        });
    }

    tx.commit().await?;
    info!(
        "Issued {} ticket(s) for order {} from tier {}",
        reservation.quantity,
        order.id,
        reservation.tier_title
    );

    let notification_queued = queue.enqueue(NotificationJob::OrderIssued {
        order_id: order.id.clone(),
    });

    Ok(IssuanceResult {
        order_id: order.id,
        tier_id: reservation.tier_id,
        tier_title: reservation.tier_title,
        tickets,
        notification_queued,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::codes::hash_of;
    use crate::test_support::{remaining, seed_order, seed_tier, test_pool, ticket_count};

    const BASE: &str = "https://tickets.test";

    #[tokio::test]
    async fn issues_one_ticket_per_participant() {
        let (pool, _db) = test_pool().await;
        let tier = seed_tier(&pool, "early-bird", 1, 10, true).await;
        let order = seed_order(&pool, tier, &["Asha", "Kiran", "Meera"]).await;
        let (queue, mut rx) = NotificationQueue::new(8);

        let result = issue_for_order(&pool, BASE, &queue, &order).await.unwrap();

        assert_eq!(result.tickets.len(), 3);
        assert_eq!(result.tier_id, tier);
        assert!(result.notification_queued);
        assert_eq!(ticket_count(&pool, &order).await, 3);
        assert_eq!(remaining(&pool, tier).await, 7);

        let codes: HashSet<_> = result.tickets.iter().map(|t| t.ticket_code.clone()).collect();
        assert_eq!(codes.len(), 3);

        let stored = db::tickets_for_order(&pool, &order).await.unwrap();
        for ticket in &stored {
            assert_eq!(ticket.qr_hash, hash_of(&ticket.ticket_code));
            assert_eq!(ticket.qr_url, format!("{BASE}/t/{}", ticket.ticket_code));
            assert!(!ticket.checked_in);
        }

        assert_eq!(
            rx.recv().await,
            Some(NotificationJob::OrderIssued { order_id: order })
        );
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let (pool, _db) = test_pool().await;
        seed_tier(&pool, "early-bird", 1, 10, true).await;
        let (queue, _rx) = NotificationQueue::new(8);

        let err = issue_for_order(&pool, BASE, &queue, "missing").await.unwrap_err();
        assert!(matches!(err, AppError::OrderNotFound));
    }

    #[tokio::test]
    async fn short_inventory_issues_nothing() {
        let (pool, _db) = test_pool().await;
        let tier = seed_tier(&pool, "early-bird", 1, 2, true).await;
        let order = seed_order(&pool, tier, &["Asha", "Kiran", "Meera"]).await;
        let (queue, mut rx) = NotificationQueue::new(8);

        let err = issue_for_order(&pool, BASE, &queue, &order).await.unwrap_err();

        assert!(matches!(err, AppError::TicketsSoldOut));
        assert_eq!(ticket_count(&pool, &order).await, 0);
        assert_eq!(remaining(&pool, tier).await, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sold_out_order_can_be_retried_once_stock_returns() {
        let (pool, _db) = test_pool().await;
        let tier = seed_tier(&pool, "early-bird", 1, 1, true).await;
        let order = seed_order(&pool, tier, &["Asha", "Kiran"]).await;
        let (queue, _rx) = NotificationQueue::new(8);

        assert!(matches!(
            issue_for_order(&pool, BASE, &queue, &order).await.unwrap_err(),
            AppError::TicketsSoldOut
        ));

        seed_tier(&pool, "regular", 2, 10, true).await;
        sqlx::query("UPDATE ticket_tiers SET is_active = 0 WHERE id = ?1")
            .bind(tier)
            .execute(&pool)
            .await
            .unwrap();

        let result = issue_for_order(&pool, BASE, &queue, &order).await.unwrap();
        assert_eq!(result.tickets.len(), 2);
        assert_eq!(result.tier_title, "regular title");
    }

    #[tokio::test]
    async fn second_issuance_for_same_order_is_rejected() {
        let (pool, _db) = test_pool().await;
        let tier = seed_tier(&pool, "early-bird", 1, 10, true).await;
        let order = seed_order(&pool, tier, &["Asha"]).await;
        let (queue, _rx) = NotificationQueue::new(8);

        issue_for_order(&pool, BASE, &queue, &order).await.unwrap();
        let err = issue_for_order(&pool, BASE, &queue, &order).await.unwrap_err();

        assert!(matches!(err, AppError::AlreadyIssued));
        assert_eq!(ticket_count(&pool, &order).await, 1);
        assert_eq!(remaining(&pool, tier).await, 9);
    }

    #[tokio::test]
    async fn full_queue_does_not_fail_issuance() {
        let (pool, _db) = test_pool().await;
        let tier = seed_tier(&pool, "early-bird", 1, 10, true).await;
        let first = seed_order(&pool, tier, &["Asha"]).await;
        let second = seed_order(&pool, tier, &["Kiran"]).await;
        let (queue, _rx) = NotificationQueue::new(1);

        assert!(issue_for_order(&pool, BASE, &queue, &first).await.unwrap().notification_queued);
        let result = issue_for_order(&pool, BASE, &queue, &second).await.unwrap();

        assert!(!result.notification_queued);
        assert_eq!(ticket_count(&pool, &second).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn last_unit_goes_to_exactly_one_order() {
        let (pool, _db) = test_pool().await;
        let tier = seed_tier(&pool, "early-bird", 1, 1, true).await;
        let a = seed_order(&pool, tier, &["Asha"]).await;
        let b = seed_order(&pool, tier, &["Kiran"]).await;
        let (queue, _rx) = NotificationQueue::new(8);

        let (ra, rb) = tokio::join!(
            {
                let (pool, queue) = (pool.clone(), queue.clone());
                tokio::spawn(async move { issue_for_order(&pool, BASE, &queue, &a).await })
            },
            {
                let (pool, queue) = (pool.clone(), queue.clone());
                tokio::spawn(async move { issue_for_order(&pool, BASE, &queue, &b).await })
            }
        );
        let outcomes = [ra.unwrap(), rb.unwrap()];

        let won = outcomes.iter().filter(|r| r.is_ok()).count();
        let sold_out = outcomes
            .iter()
            .filter(|r| matches!(r, Err(AppError::TicketsSoldOut)))
            .count();
        assert_eq!((won, sold_out), (1, 1));
        assert_eq!(remaining(&pool, tier).await, 0);
    }
}
