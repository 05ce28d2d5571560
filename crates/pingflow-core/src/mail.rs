//! Outbound email port.
//!
//! Workflows only ever send fully rendered HTML emails; delivery details
//! (relay, retries at the transport level, from-address) belong to the
//! implementation in pingflow-infra.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// A rendered email ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Errors from sending email.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// The relay could not be reached or timed out.
    #[error("mail transport error: {0}")]
    Transport(String),

    /// The relay answered but refused the message.
    #[error("mail rejected: {0}")]
    Rejected(String),

    #[error("mail configuration error: {0}")]
    Config(String),
}

/// Sends email on behalf of workflow steps.
pub trait Mailer: Send + Sync {
    fn send_email(
        &self,
        message: &EmailMessage,
    ) -> impl std::future::Future<Output = Result<(), MailError>> + Send;
}

// ---------------------------------------------------------------------------
// RecordingMailer
// ---------------------------------------------------------------------------

/// In-process mailer that keeps every message it accepts.
///
/// `fail_next(n)` makes the next `n` sends fail with a transport error,
/// which is how tests exercise step retries.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
    failures_left: AtomicU32,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Snapshot of accepted messages in send order.
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Accepted messages addressed to `to`.
    pub fn sent_to(&self, to: &str) -> Vec<EmailMessage> {
        self.sent().into_iter().filter(|m| m.to == to).collect()
    }
}

impl Mailer for RecordingMailer {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), MailError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MailError::Transport("injected failure".to_string()));
        }

        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(to: &str) -> EmailMessage {
        EmailMessage {
            to: to.to_string(),
            subject: "hello".to_string(),
            html: "<p>hi</p>".to_string(),
        }
    }

    #[tokio::test]
    async fn recording_mailer_keeps_messages() {
        let mailer = RecordingMailer::new();
        mailer.send_email(&message("a@example.com")).await.unwrap();
        mailer.send_email(&message("b@example.com")).await.unwrap();

        assert_eq!(mailer.sent().len(), 2);
        assert_eq!(mailer.sent_to("b@example.com").len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let mailer = RecordingMailer::new();
        mailer.fail_next(2);

        assert!(mailer.send_email(&message("a@example.com")).await.is_err());
        assert!(mailer.send_email(&message("a@example.com")).await.is_err());
        assert!(mailer.send_email(&message("a@example.com")).await.is_ok());
        assert_eq!(mailer.sent().len(), 1);
    }
}
