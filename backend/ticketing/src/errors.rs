//! Application-wide error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Order not found")]
    OrderNotFound,

    #[error("Ticket tier not found")]
    TierNotFound,

    #[error("Tickets sold out")]
    TicketsSoldOut,

    #[error("Ticket not found")]
    TicketNotFound,

    /// Every attempt to draw a free ticket code collided. Needs an operator.
    #[error("Ticket code space exhausted after {0} attempts")]
    CodeSpaceExhausted(usize),

    #[error("All participants of this order already hold tickets")]
    AlreadyIssued,

    #[error("Order participants changed while issuing, retry")]
    IssuanceConflict,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Payment provider error: {0}")]
    Payment(String),

    #[error("Email provider error: {0}")]
    Email(String),

    #[error("QR render error: {0}")]
    Qr(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::OrderNotFound | AppError::TicketNotFound | AppError::TierNotFound => {
                StatusCode::NOT_FOUND
            }
            AppError::TicketsSoldOut | AppError::AlreadyIssued | AppError::IssuanceConflict => {
                StatusCode::CONFLICT
            }
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Payment(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {self}");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_client_statuses() {
        assert_eq!(AppError::OrderNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::TicketNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::TicketsSoldOut.status(), StatusCode::CONFLICT);
        assert_eq!(AppError::AlreadyIssued.status(), StatusCode::CONFLICT);
        assert_eq!(AppError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::CodeSpaceExhausted(16).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
