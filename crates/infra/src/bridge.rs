//! Routing seams between request handlers and the job queue.
//!
//! With a queue injected, work is enqueued and the caller returns at once.
//! Without one, the port is called inline, which keeps tests queue-free.

use std::sync::Arc;

use tracing::{info, warn};

use courier_core::JobId;

use crate::jobs::handlers::StripeWebhookJob;
use crate::jobs::queue::{JobEnqueuer, QueueError};
use crate::jobs::types::{EnqueueOptions, JobPayload, JobType};
use crate::ports::{EmailMessage, EmailPort, EmailSendResult, PortError, StripeWebhookProcessor};

/// How an email left the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailDelivery {
    /// Durable: an `email.send` job was enqueued.
    Queued(JobId),
    /// No queue configured; the port was called inline.
    Direct(EmailSendResult),
    /// Enqueue failed; a best-effort direct send was attempted and its result discarded.
    Fallback,
}

pub struct EmailBridge {
    port: Arc<dyn EmailPort>,
    queue: Option<Arc<dyn JobEnqueuer>>,
}

impl EmailBridge {
    pub fn new(port: Arc<dyn EmailPort>, queue: Option<Arc<dyn JobEnqueuer>>) -> Self {
        Self { port, queue }
    }

    /// Bridge that always sends inline.
    pub fn direct(port: Arc<dyn EmailPort>) -> Self {
        Self::new(port, None)
    }

    pub fn is_queued(&self) -> bool {
        self.queue.is_some()
    }

    pub async fn send_email_async(&self, message: EmailMessage) -> EmailDelivery {
        let Some(queue) = &self.queue else {
            return EmailDelivery::Direct(self.port.send(&message).await);
        };

        match enqueue(queue.as_ref(), JobType::EmailSend, &message).await {
            Ok(id) => EmailDelivery::Queued(id),
            Err(e) => {
                warn!(to = %message.to, error = %e, "email enqueue failed, sending directly");
                // Best effort: the caller has nothing useful to do with a failure here.
                let result = self.port.send(&message).await;
                if result.ok {
                    info!(to = %message.to, message_id = result.message_id.as_deref().unwrap_or_default(), "fallback email sent");
                } else {
                    warn!(
                        to = %message.to,
                        error = result.error.as_deref().unwrap_or("unknown error"),
                        "fallback email send failed, dropping"
                    );
                }
                EmailDelivery::Fallback
            }
        }
    }
}

/// How a payment webhook left the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookDelivery {
    Queued(JobId),
    /// Processed inline; carries the processor's response.
    Processed(serde_json::Value),
}

pub struct WebhookBridge {
    processor: Arc<dyn StripeWebhookProcessor>,
    queue: Option<Arc<dyn JobEnqueuer>>,
}

impl WebhookBridge {
    pub fn new(
        processor: Arc<dyn StripeWebhookProcessor>,
        queue: Option<Arc<dyn JobEnqueuer>>,
    ) -> Self {
        Self { processor, queue }
    }

    /// Defer webhook post-processing to the queue, or process inline.
    ///
    /// Unlike email there is no silent fallback: an inline failure is returned
    /// so the caller can ask the sender to redeliver.
    pub async fn process_webhook_async(
        &self,
        event: StripeWebhookJob,
    ) -> Result<WebhookDelivery, PortError> {
        if let Some(queue) = &self.queue {
            match enqueue(queue.as_ref(), JobType::StripeWebhookProcess, &event).await {
                Ok(id) => return Ok(WebhookDelivery::Queued(id)),
                Err(e) => {
                    warn!(request_id = %event.request_id, error = %e, "webhook enqueue failed, processing inline");
                }
            }
        }

        let response = self
            .processor
            .process(&event.payload, &event.signature, &event.request_id)
            .await?;
        Ok(WebhookDelivery::Processed(response))
    }
}

async fn enqueue<T: serde::Serialize>(
    queue: &dyn JobEnqueuer,
    job_type: JobType,
    data: &T,
) -> Result<JobId, QueueError> {
    let payload = JobPayload::typed(job_type, data)?;
    queue.enqueue_job(payload, EnqueueOptions::default()).await
}
