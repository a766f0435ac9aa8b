//! Outbound mail: the [`Mailer`] capability, its SMTP and no-op
//! implementations, and the templates used for verification and invite
//! messages.

mod compose;
mod smtp;
mod templates;

use async_trait::async_trait;
use thiserror::Error;

pub use compose::{compose, validation_link, with_variants};
pub use smtp::SmtpMailer;
pub use templates::{render, TemplateKind, Templates};

#[derive(Debug, Error)]
pub enum MailError {
    #[error("failed to send mail: {0}")]
    SendFailed(String),
    #[error("invalid mail configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("reading template {path}: {source}")]
    Template {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Sends an already rendered RFC 5322 message.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, from: &str, to: &[String], message: &[u8]) -> Result<(), MailError>;

    /// Domain used in generated `Message-ID` headers.
    fn hostname(&self) -> &str;
}

/// A [`Mailer`] that drops every message.
#[derive(Debug, Clone)]
pub struct NoopMailer {
    hostname: String,
}

impl NoopMailer {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }
}

#[async_trait]
impl Mailer for NoopMailer {
    async fn send(&self, from: &str, to: &[String], message: &[u8]) -> Result<(), MailError> {
        tracing::debug!(from, to = ?to, bytes = message.len(), "mail delivery disabled; dropping message");
        Ok(())
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }
}
