//! Ports to the external services job handlers call.
//!
//! Only the interfaces live here; real clients (email provider, Discord,
//! payment webhooks) are wired in by the host application.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    /// Transient: network, rate limit, provider outage.
    #[error("{0}")]
    Unavailable(String),
    /// The request itself was refused and will be refused again.
    #[error("{0}")]
    Rejected(String),
}

impl PortError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}

/// A transactional email, as stored in `email.send` job data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
    /// Provider tag used for analytics, e.g. `password-reset`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl EmailMessage {
    pub fn new(
        to: impl Into<String>,
        subject: impl Into<String>,
        text_body: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            text_body: text_body.into(),
            html_body: None,
            tag: None,
            reply_to: None,
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html_body = Some(html.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSendResult {
    pub ok: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl EmailSendResult {
    pub fn sent(message_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

/// Transactional email provider.
#[async_trait]
pub trait EmailPort: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> EmailSendResult;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsletterDispatch {
    pub dispatched: u64,
}

/// Sends the pending newsletter issue to its subscribers.
#[async_trait]
pub trait NewsletterDispatcher: Send + Sync {
    async fn dispatch(&self) -> Result<NewsletterDispatch, PortError>;
}

/// Reconciles a user's Discord roles with their entitlements.
#[async_trait]
pub trait DiscordRoleSync: Send + Sync {
    async fn sync_roles(&self, user_id: &str, entitlement_ids: &[String]) -> Result<(), PortError>;
}

/// Re-runs payment webhook processing outside the request cycle.
#[async_trait]
pub trait StripeWebhookProcessor: Send + Sync {
    async fn process(
        &self,
        payload: &str,
        signature: &str,
        request_id: &str,
    ) -> Result<serde_json::Value, PortError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepResult {
    pub swept: u64,
    pub contacts_created: u64,
}

/// Closes conversations idle past the abandonment threshold.
///
/// Synchronous: implementations talk to the local database directly.
pub trait ConversationSweeper: Send + Sync {
    fn sweep(&self, request_id: Option<&str>) -> Result<SweepResult, PortError>;
}
