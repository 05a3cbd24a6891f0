//! Header-key guards for the scanner and admin routes.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::api::ApiState;
use crate::errors::AppError;

pub const SCANNER_KEY_HEADER: &str = "x-api-key";
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Scanner devices send one of the configured keys. Attendees who scan
/// their own QR code with a phone land here without one and get a friendly
/// note instead of their ticket details.
pub async fn require_scanner_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Response {
    let allowed = header(req.headers(), SCANNER_KEY_HEADER)
        .is_some_and(|key| state.config.scanner_api_keys.iter().any(|k| k == key));

    if !allowed {
        return (
            StatusCode::UNAUTHORIZED,
            format!(
                "The {} Conference is waiting for you! Use this ticket at the check-in. See you there!",
                state.config.event_name
            ),
        )
            .into_response();
    }
    next.run(req).await
}

pub async fn require_admin_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Response {
    match header(req.headers(), ADMIN_KEY_HEADER) {
        Some(key) if !state.config.admin_api_key.is_empty() && key == state.config.admin_api_key => {
            next.run(req).await
        }
        _ => {
            warn!("Rejected {} admin request without a valid {ADMIN_KEY_HEADER}", req.method());
            AppError::Unauthorized.into_response()
        }
    }
}

/// Daimo authenticates webhooks with a shared token in `Authorization`,
/// with or without a `Basic ` prefix.
pub fn webhook_token_matches(headers: &HeaderMap, expected: &str) -> bool {
    let Some(value) = header(headers, "authorization") else {
        return false;
    };
    let token = value.strip_prefix("Basic ").unwrap_or(value).trim();
    !expected.is_empty() && token == expected
}
