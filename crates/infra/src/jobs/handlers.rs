//! Handlers for the built-in job types.
//!
//! Each handler unpacks `data`, calls one port and turns a failed call into a
//! `HandlerError` so the queue's retry path engages. Handlers are not
//! idempotent by themselves; redelivery safety belongs to the port.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::ports::{
    ConversationSweeper, DiscordRoleSync, EmailMessage, EmailPort, NewsletterDispatcher, PortError,
    StripeWebhookProcessor,
};

use super::registry::{HandlerError, HandlerRegistry, JobHandler};
use super::types::{JobPayload, JobType};

impl From<PortError> for HandlerError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Unavailable(msg) => HandlerError::Retryable(msg),
            PortError::Rejected(msg) => HandlerError::Permanent(msg),
        }
    }
}

/// `discord.sync` job data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordSyncJob {
    pub user_id: String,
    #[serde(default)]
    pub entitlement_ids: Vec<String>,
}

/// `stripe.webhook.process` job data: the raw event as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StripeWebhookJob {
    pub payload: String,
    pub signature: String,
    pub request_id: String,
}

/// `conversation.sweep` job data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSweepJob {
    #[serde(default)]
    pub request_id: Option<String>,
}

pub struct EmailSendHandler {
    port: Arc<dyn EmailPort>,
}

impl EmailSendHandler {
    pub fn new(port: Arc<dyn EmailPort>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl JobHandler for EmailSendHandler {
    async fn handle(&self, job: JobPayload) -> Result<(), HandlerError> {
        let message: EmailMessage = job.decode()?;
        let result = self.port.send(&message).await;

        if !result.ok {
            let reason = result.error.as_deref().unwrap_or("unknown error");
            error!(job_type = %JobType::EmailSend, to = %message.to, error = %reason, "email send failed");
            return Err(HandlerError::retryable(format!("Email send failed: {reason}")));
        }

        info!(
            job_type = %JobType::EmailSend,
            to = %message.to,
            message_id = result.message_id.as_deref().unwrap_or_default(),
            "email sent via job queue"
        );
        Ok(())
    }
}

pub struct NewsletterSendHandler {
    dispatcher: Arc<dyn NewsletterDispatcher>,
}

impl NewsletterSendHandler {
    pub fn new(dispatcher: Arc<dyn NewsletterDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl JobHandler for NewsletterSendHandler {
    async fn handle(&self, _job: JobPayload) -> Result<(), HandlerError> {
        let result = self.dispatcher.dispatch().await?;
        info!(job_type = %JobType::NewsletterSend, dispatched = result.dispatched, "newsletter dispatch complete");
        Ok(())
    }
}

pub struct DiscordSyncHandler {
    sync: Arc<dyn DiscordRoleSync>,
}

impl DiscordSyncHandler {
    pub fn new(sync: Arc<dyn DiscordRoleSync>) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl JobHandler for DiscordSyncHandler {
    async fn handle(&self, job: JobPayload) -> Result<(), HandlerError> {
        let data: DiscordSyncJob = job.decode()?;
        self.sync
            .sync_roles(&data.user_id, &data.entitlement_ids)
            .await?;
        info!(job_type = %JobType::DiscordSync, user_id = %data.user_id, "discord sync complete");
        Ok(())
    }
}

pub struct StripeWebhookHandler {
    processor: Arc<dyn StripeWebhookProcessor>,
}

impl StripeWebhookHandler {
    pub fn new(processor: Arc<dyn StripeWebhookProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for StripeWebhookHandler {
    async fn handle(&self, job: JobPayload) -> Result<(), HandlerError> {
        let data: StripeWebhookJob = job.decode()?;
        self.processor
            .process(&data.payload, &data.signature, &data.request_id)
            .await?;
        info!(job_type = %JobType::StripeWebhookProcess, request_id = %data.request_id, "stripe webhook processed async");
        Ok(())
    }
}

pub struct ConversationSweepHandler {
    sweeper: Arc<dyn ConversationSweeper>,
}

impl ConversationSweepHandler {
    pub fn new(sweeper: Arc<dyn ConversationSweeper>) -> Self {
        Self { sweeper }
    }
}

#[async_trait]
impl JobHandler for ConversationSweepHandler {
    async fn handle(&self, job: JobPayload) -> Result<(), HandlerError> {
        // Anything but a string request id is ignored.
        let request_id = job
            .data
            .get("requestId")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let sweeper = self.sweeper.clone();
        let result = tokio::task::spawn_blocking(move || sweeper.sweep(request_id.as_deref()))
            .await
            .map_err(|e| HandlerError::retryable(format!("conversation sweep aborted: {e}")))??;

        info!(
            job_type = %JobType::ConversationSweep,
            swept = result.swept,
            contacts_created = result.contacts_created,
            "conversation sweep complete"
        );
        Ok(())
    }
}

/// Services the built-in handlers depend on.
#[derive(Clone)]
pub struct HandlerDependencies {
    pub email: Arc<dyn EmailPort>,
    pub newsletter: Arc<dyn NewsletterDispatcher>,
    pub discord: Arc<dyn DiscordRoleSync>,
    pub stripe: Arc<dyn StripeWebhookProcessor>,
    pub conversations: Arc<dyn ConversationSweeper>,
}

/// Registry with a handler for every built-in job type.
pub fn build_handler_registry(deps: HandlerDependencies) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(JobType::EmailSend.as_str(), EmailSendHandler::new(deps.email))
        .with(
            JobType::NewsletterSend.as_str(),
            NewsletterSendHandler::new(deps.newsletter),
        )
        .with(JobType::DiscordSync.as_str(), DiscordSyncHandler::new(deps.discord))
        .with(
            JobType::StripeWebhookProcess.as_str(),
            StripeWebhookHandler::new(deps.stripe),
        )
        .with(
            JobType::ConversationSweep.as_str(),
            ConversationSweepHandler::new(deps.conversations),
        )
}
