//! Outbound email delivery.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl EmailMessage {
    /// Minimal shape check; the model composes these fields.
    pub fn validate(&self) -> Result<(), DeliveryError> {
        let to = self.to.trim();
        let at = to.find('@');
        if to.is_empty() || to.contains(char::is_whitespace) || at.map_or(true, |i| i == 0 || i + 1 == to.len()) {
            return Err(DeliveryError::InvalidMessage(format!("bad recipient `{}`", self.to)));
        }
        if self.subject.trim().is_empty() {
            return Err(DeliveryError::InvalidMessage("empty subject".into()));
        }
        if self.body.trim().is_empty() {
            return Err(DeliveryError::InvalidMessage("empty body".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("email delivery is not configured")]
    NotConfigured,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("delivery endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("delivery request failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError>;
}

/// Posts `{to, subject, body, sender}` JSON to a delivery webhook.
pub struct WebhookEmailSender {
    client: reqwest::Client,
    url: String,
    sender: String,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    to: &'a str,
    subject: &'a str,
    body: &'a str,
    sender: &'a str,
}

impl WebhookEmailSender {
    pub fn new(
        url: impl Into<String>,
        sender: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            sender: sender.into(),
        })
    }
}

#[async_trait]
impl EmailSender for WebhookEmailSender {
    #[instrument(skip(self, message), fields(to = %message.to))]
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        message.validate()?;
        let payload = WebhookPayload {
            to: &message.to,
            subject: &message.subject,
            body: &message.body,
            sender: &self.sender,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "email webhook rejected message");
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        info!("email handed to delivery webhook");
        Ok(())
    }
}

/// Used when no webhook is configured; every send fails.
pub struct DisabledEmailSender;

#[async_trait]
impl EmailSender for DisabledEmailSender {
    async fn send(&self, _message: &EmailMessage) -> Result<(), DeliveryError> {
        Err(DeliveryError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message() -> EmailMessage {
        EmailMessage {
            to: "ana@example.com".into(),
            subject: "20% off this weekend".into(),
            body: "Hi Ana, come back for a treat.".into(),
        }
    }

    #[tokio::test]
    async fn posts_payload_with_sender() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(body_json(serde_json::json!({
                "to": "ana@example.com",
                "subject": "20% off this weekend",
                "body": "Hi Ana, come back for a treat.",
                "sender": "serena@stylehub.example"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = WebhookEmailSender::new(
            format!("{}/send", server.uri()),
            "serena@stylehub.example",
            Duration::from_secs(5),
        )
        .unwrap();
        sender.send(&message()).await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;
        let sender = WebhookEmailSender::new(server.uri(), "s@x.io", Duration::from_secs(5)).unwrap();
        let err = sender.send(&message()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 502, ref body } if body == "upstream down"));
    }

    #[test]
    fn validation() {
        assert!(message().validate().is_ok());
        let mut m = message();
        m.to = "not an address".into();
        assert!(m.validate().is_err());
        let mut m = message();
        m.to = "@example.com".into();
        assert!(m.validate().is_err());
        let mut m = message();
        m.body = " ".into();
        assert!(m.validate().is_err());
    }

    #[tokio::test]
    async fn disabled_sender_fails() {
        let err = DisabledEmailSender.send(&message()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotConfigured));
    }
}
