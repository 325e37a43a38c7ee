//! Handler trait and the type → handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::types::JobPayload;

/// Failure reported by a job handler.
///
/// `Display` is the bare message; it becomes the job's `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Try again later with backoff.
    #[error("{0}")]
    Retryable(String),
    /// Will never succeed; the job goes straight to `dead`.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(format!("{err:#}"))
    }
}

/// An asynchronous unit of work for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: JobPayload) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, job: JobPayload) -> Result<(), HandlerError> {
        (self)(job).await
    }
}

/// Maps job type strings to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register<H>(&mut self, job_type: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(job_type.into(), Arc::new(handler));
    }

    pub fn register_arc(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    pub fn with<H>(mut self, job_type: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(job_type, handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn closures_are_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = HandlerRegistry::new().with("noop", move |_job: JobPayload| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        });

        let handler = registry.get("noop").unwrap();
        handler
            .handle(JobPayload::new("noop", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lookup_is_by_exact_type() {
        let registry = HandlerRegistry::new()
            .with("email.send", |_job: JobPayload| async { Ok::<(), HandlerError>(()) })
            .with("discord.sync", |_job: JobPayload| async { Ok::<(), HandlerError>(()) });

        assert!(registry.contains("email.send"));
        assert!(!registry.contains("email.*"));
        assert!(registry.get("mystery.job").is_none());
        assert_eq!(registry.job_types(), vec!["discord.sync", "email.send"]);
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let mut registry = HandlerRegistry::new();
        registry.register("t", |_job: JobPayload| async { Ok::<(), HandlerError>(()) });
        registry.register("t", |_job: JobPayload| async {
            Err::<(), HandlerError>(HandlerError::permanent("x"))
        });
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn error_display_is_the_bare_message() {
        assert_eq!(HandlerError::retryable("boom").to_string(), "boom");
        assert_eq!(HandlerError::permanent("nope").message(), "nope");
        let from_anyhow: HandlerError = anyhow::anyhow!("smtp down").into();
        assert!(!from_anyhow.is_permanent());
    }
}
