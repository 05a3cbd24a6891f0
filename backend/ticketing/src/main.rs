//! Conference ticketing backend — entry point.
//!
//! Serves the payment, scanning and admin API over SQLite and runs a
//! background worker that emails tickets once an order is issued.

mod api;
mod auth;
mod checkin;
mod codes;
mod config;
mod db;
mod errors;
mod inventory;
mod issuance;
mod mailer;
mod models;
mod notify;
mod payments;
mod qr;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use mailer::LoopsMailer;
use notify::{NotificationQueue, NotifierState, RetryPolicy, Templates};

const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let pool = db::init_pool(&config.database_url).await?;

    // Shared by the payment providers and the mailer.
    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let shutdown = CancellationToken::new();

    // ─── Notification worker ──────────────────────────────
    let (queue, jobs) = NotificationQueue::new(NOTIFICATION_QUEUE_CAPACITY);
    let notifier = Arc::new(NotifierState {
        pool: pool.clone(),
        mailer: Arc::new(LoopsMailer::new(client.clone(), config.loops_api_key.clone())),
        templates: Templates {
            participant: config.loops_participant_template.clone(),
            buyer: config.loops_buyer_template.clone(),
        },
        retry: RetryPolicy::new(config.notify_max_attempts),
        sweep_interval: Duration::from_secs(config.notify_sweep_secs),
        shutdown: shutdown.clone(),
    });
    let worker = tokio::spawn(notify::run(notifier, jobs));

    // ─── REST API ─────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", config.api_port);
    let state = Arc::new(api::ApiState::new(pool, config, client, queue));
    let app = api::router(state);

    info!("API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    worker.await?;
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        shutdown.cancelled().await;
        return;
    }
    info!("Ctrl-C received, shutting down");
    shutdown.cancel();
}
