//! Application configuration loaded from environment variables.

use std::str::FromStr;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database location (e.g. `sqlite:./ticketing.db`)
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Prefix of the URL embedded in every ticket QR code
    pub app_base_url: String,
    /// Event name used in the check-in greeting
    pub event_name: String,
    /// Keys accepted from scanning clients in `x-api-key`
    pub scanner_api_keys: Vec<String>,
    /// Key accepted on admin routes in `x-admin-key`
    pub admin_api_key: String,
    pub razorpay_key_id: String,
    pub razorpay_key_secret: String,
    pub daimo_api_key: String,
    /// Wallet that receives Daimo (USDC on Base) payments
    pub daimo_destination_address: String,
    /// Shared secret Daimo sends in the `Authorization` header of webhooks
    pub daimo_webhook_token: String,
    pub loops_api_key: String,
    /// Loops transactional template for participant ticket emails
    pub loops_participant_template: String,
    /// Loops transactional template for buyer confirmations
    pub loops_buyer_template: String,
    /// Attempts per email before giving up until the next sweep
    pub notify_max_attempts: u32,
    /// How often (in seconds) to re-queue orders with unsent emails
    pub notify_sweep_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./ticketing.db".to_string()),
            api_port: parsed("API_PORT", "3000")?,
            app_base_url: env_var("APP_BASE_URL")
                .unwrap_or_else(|_| "https://www.ethmumbai.in".to_string()),
            event_name: env_var("EVENT_NAME").unwrap_or_else(|_| "ETHMumbai".to_string()),
            scanner_api_keys: split_keys(&required("AUTH_API_KEY")?),
            admin_api_key: required("ADMIN_API_KEY")?,
            razorpay_key_id: required("RAZORPAY_KEY_ID")?,
            razorpay_key_secret: required("RAZORPAY_KEY_SECRET")?,
            daimo_api_key: required("DAIMO_API_KEY")?,
            daimo_destination_address: required("DAIMO_DESTINATION_ADDRESS")?,
            daimo_webhook_token: required("DAIMO_WEBHOOK_TOKEN")?,
            loops_api_key: required("LOOPS_API_KEY")?,
            loops_participant_template: required("LOOPS_PARTICIPANT_EMAIL_ID")?,
            loops_buyer_template: required("LOOPS_BUYER_EMAIL_ID")?,
            notify_max_attempts: parsed("NOTIFY_MAX_ATTEMPTS", "5")?,
            notify_sweep_secs: parsed("NOTIFY_SWEEP_SECS", "300")?,
        })
    }

    /// Fully populated configuration for unit tests; never touches the environment.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            app_base_url: "https://tickets.test".to_string(),
            event_name: "TestConf".to_string(),
            scanner_api_keys: vec!["scanner-key".to_string()],
            admin_api_key: "admin-key".to_string(),
            razorpay_key_id: "rzp_test_key".to_string(),
            razorpay_key_secret: "rzp_test_secret".to_string(),
            daimo_api_key: "daimo-key".to_string(),
            daimo_destination_address: "0x0000000000000000000000000000000000000001".to_string(),
            daimo_webhook_token: "webhook-token".to_string(),
            loops_api_key: "loops-key".to_string(),
            loops_participant_template: "tpl-participant".to_string(),
            loops_buyer_template: "tpl-buyer".to_string(),
            notify_max_attempts: 2,
            notify_sweep_secs: 300,
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| AppError::Config(format!("Missing env var: {key}")))
}

fn required(key: &str) -> Result<String> {
    env_var(key).map_err(|_| AppError::Config(format!("{key} environment variable is required")))
}

fn parsed<T: FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| AppError::Config(format!("Invalid {key}")))
}

/// `AUTH_API_KEY` may hold several comma-separated scanner keys.
fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keys_trims_and_drops_empty_entries() {
        assert_eq!(
            split_keys(" gate-a, gate-b ,,"),
            vec!["gate-a".to_string(), "gate-b".to_string()]
        );
        assert!(split_keys("").is_empty());
    }
}
