//! Outbound transactional email through Loops.
//!
//! The [`Mailer`] trait is the seam the notification worker depends on;
//! [`LoopsMailer`] is the production implementation.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::{AppError, Result};

const LOOPS_API_BASE: &str = "https://app.loops.so";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Base64 encoded file contents.
    pub data: String,
}

impl Attachment {
    pub fn png(filename: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            filename: filename.into(),
            content_type: "image/png".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionalEmail {
    pub transactional_id: String,
    pub email: String,
    pub data_variables: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &TransactionalEmail) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct LoopsResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

pub struct LoopsMailer {
    client: Client,
    api_key: String,
    base_url: String,
}

impl LoopsMailer {
    pub fn new(client: Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            base_url: LOOPS_API_BASE.to_string(),
        }
    }

    /// Point the mailer at another host, e.g. a local mock.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Mailer for LoopsMailer {
    async fn send(&self, email: &TransactionalEmail) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/api/v1/transactional", self.base_url))
            .bearer_auth(&self.api_key)
            .json(email)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let body = serde_json::from_str::<LoopsResponse>(&text).ok();
        let message = || {
            body.as_ref()
                .and_then(|b| b.message.clone())
                .unwrap_or_else(|| "no message".to_string())
        };

        if !status.is_success() {
            return Err(AppError::Email(format!(
                "Loops rejected email to {} ({status}): {}",
                email.email,
                message()
            )));
        }
        // A 2xx is delivery unless the body explicitly says otherwise.
        match body.as_ref().and_then(|b| b.success) {
            Some(false) => Err(AppError::Email(format!(
                "Loops rejected email to {}: {}",
                email.email,
                message()
            ))),
            Some(true) => Ok(()),
            None => {
                debug!("Loops accepted email to {} without a success flag", email.email);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn email_serializes_in_loops_shape() {
        let email = TransactionalEmail {
            transactional_id: "tpl".into(),
            email: "asha@example.com".into(),
            data_variables: serde_json::json!({ "name": "Asha" }),
            attachments: vec![Attachment::png("Ticket-ABC123.png", b"png")],
        };

        let json = serde_json::to_value(&email).unwrap();
        assert_eq!(json["transactionalId"], "tpl");
        assert_eq!(json["dataVariables"]["name"], "Asha");
        assert_eq!(json["attachments"][0]["contentType"], "image/png");
        assert_eq!(json["attachments"][0]["data"], "cG5n");
    }

    #[test]
    fn empty_attachments_are_omitted() {
        let email = TransactionalEmail {
            transactional_id: "tpl".into(),
            email: "ravi@example.com".into(),
            data_variables: Value::Null,
            attachments: vec![],
        };
        let json = serde_json::to_value(&email).unwrap();
        assert!(json.get("attachments").is_none());
    }

    fn ticket_email() -> TransactionalEmail {
        TransactionalEmail {
            transactional_id: "tpl-participant".into(),
            email: "asha@example.com".into(),
            data_variables: json!({ "name": "Asha" }),
            attachments: vec![],
        }
    }

    async fn mailer_answering(response: ResponseTemplate) -> (LoopsMailer, MockServer) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/transactional"))
            .respond_with(response)
            .expect(1)
            .mount(&server)
            .await;
        let mailer = LoopsMailer::new(Client::new(), "loops-key".into()).with_base_url(server.uri());
        (mailer, server)
    }

    #[tokio::test]
    async fn posts_the_email_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/transactional"))
            .and(header("authorization", "Bearer loops-key"))
            .and(body_partial_json(json!({
                "transactionalId": "tpl-participant",
                "email": "asha@example.com",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&server)
            .await;

        let mailer = LoopsMailer::new(Client::new(), "loops-key".into()).with_base_url(server.uri());
        mailer.send(&ticket_email()).await.unwrap();
    }

    #[tokio::test]
    async fn explicit_failure_in_a_200_is_an_error() {
        let (mailer, _server) = mailer_answering(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "success": false, "message": "template not found" })),
        )
        .await;

        let err = mailer.send(&ticket_email()).await.unwrap_err();
        assert!(matches!(err, AppError::Email(ref msg) if msg.contains("template not found")));
    }

    #[tokio::test]
    async fn server_error_is_an_error() {
        let (mailer, _server) = mailer_answering(
            ResponseTemplate::new(500).set_body_json(json!({ "message": "boom" })),
        )
        .await;

        let err = mailer.send(&ticket_email()).await.unwrap_err();
        assert!(matches!(err, AppError::Email(ref msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn success_without_a_json_body_counts_as_sent() {
        let (mailer, _server) =
            mailer_answering(ResponseTemplate::new(200).set_body_string("OK")).await;
        mailer.send(&ticket_email()).await.unwrap();

        let (mailer, _server) = mailer_answering(ResponseTemplate::new(202)).await;
        mailer.send(&ticket_email()).await.unwrap();
    }
}
