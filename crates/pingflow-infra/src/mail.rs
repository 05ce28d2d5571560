//! Mailer implementations.
//!
//! `HttpMailer` posts rendered messages as JSON to a mail relay;
//! `LogMailer` only logs them and is used when no relay is configured.
//! `ConfiguredMailer` picks one of the two from `MailConfig`.

use std::time::Duration;

use pingflow_core::mail::{EmailMessage, MailError, Mailer};
use pingflow_types::config::MailConfig;
use reqwest::StatusCode;
use serde::Serialize;

// ---------------------------------------------------------------------------
// LogMailer
// ---------------------------------------------------------------------------

/// Accepts every message and logs it at info level.
#[derive(Debug, Clone)]
pub struct LogMailer {
    from: String,
}

impl LogMailer {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

impl Mailer for LogMailer {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), MailError> {
        tracing::info!(
            from = self.from.as_str(),
            to = message.to.as_str(),
            subject = message.subject.as_str(),
            bytes = message.html.len(),
            "email not delivered (no relay configured)"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HttpMailer
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RelayPayload<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

/// Delivers mail through an HTTP relay that accepts
/// `{"from", "to", "subject", "html"}` JSON bodies.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    relay_url: reqwest::Url,
    from: String,
}

impl HttpMailer {
    pub fn new(relay_url: &str, from: impl Into<String>, timeout: Duration) -> Result<Self, MailError> {
        let relay_url = reqwest::Url::parse(relay_url)
            .map_err(|e| MailError::Config(format!("invalid relay URL '{relay_url}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            relay_url,
            from: from.into(),
        })
    }

    pub fn from_config(config: &MailConfig, relay_url: &str) -> Result<Self, MailError> {
        Self::new(relay_url, config.from.clone(), Duration::from_secs(config.timeout_secs))
    }
}

/// Map a non-success relay status to an error. Throttling and server
/// errors are transport problems; other client errors are rejections.
fn status_error(status: StatusCode, body: &str) -> MailError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.chars().take(200).collect::<String>())
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        MailError::Transport(detail)
    } else {
        MailError::Rejected(detail)
    }
}

impl Mailer for HttpMailer {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), MailError> {
        let payload = RelayPayload {
            from: &self.from,
            to: &message.to,
            subject: &message.subject,
            html: &message.html,
        };

        let response = self
            .client
            .post(self.relay_url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(to = message.to.as_str(), subject = message.subject.as_str(), "email sent");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        tracing::warn!(to = message.to.as_str(), %status, "mail relay refused message");
        Err(status_error(status, &body))
    }
}

// ---------------------------------------------------------------------------
// ConfiguredMailer
// ---------------------------------------------------------------------------

/// The transport selected by `[mail]` in `config.toml`.
#[derive(Debug, Clone)]
pub enum ConfiguredMailer {
    Http(HttpMailer),
    Log(LogMailer),
}

impl ConfiguredMailer {
    /// `HttpMailer` when `relay_url` is set, otherwise `LogMailer`.
    pub fn from_config(config: &MailConfig) -> Result<Self, MailError> {
        match config.relay_url.as_deref() {
            Some(url) => Ok(Self::Http(HttpMailer::from_config(config, url)?)),
            None => {
                tracing::warn!("no mail relay configured; emails will only be logged");
                Ok(Self::Log(LogMailer::new(config.from.clone())))
            }
        }
    }
}

impl Mailer for ConfiguredMailer {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), MailError> {
        match self {
            Self::Http(m) => m.send_email(message).await,
            Self::Log(m) => m.send_email(message).await,
        }
    }
}
