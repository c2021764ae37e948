//! Outbound email delivery.
//!
//! The engine builds an [`EmailMessage`] for verification links, password
//! reset links, and one-time codes, then hands it to an [`EmailSender`].
//! Delivery failures are logged by the caller and never change the response
//! of an endpoint, so a failing mailer cannot be used to enumerate accounts.
//!
//! - [`LogEmailSender`] records that a message would have been sent. It does
//!   not log the payload, which carries live secrets.
//! - [`WebhookEmailSender`] posts the message as JSON to an HTTP endpoint that
//!   owns templating and delivery.

use crate::APP_USER_AGENT;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::info;
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTemplate {
    VerifyEmail,
    PasswordReset,
    PasswordChanged,
    OneTimeCode,
}

impl EmailTemplate {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VerifyEmail => "verify_email",
            Self::PasswordReset => "password_reset",
            Self::PasswordChanged => "password_changed",
            Self::OneTimeCode => "one_time_code",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: EmailTemplate,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error describing why it was not sent.
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender.
#[derive(Clone, Debug, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = message.template.as_str(),
            "email send stub"
        );
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct WebhookEmailSender {
    client: reqwest::Client,
    url: Url,
}

impl WebhookEmailSender {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build mail webhook client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl EmailSender for WebhookEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        self.client
            .post(self.url.clone())
            .json(message)
            .send()
            .await
            .context("mail webhook request failed")?
            .error_for_status()
            .context("mail webhook rejected message")?;
        Ok(())
    }
}
