//! The job queue: enqueue, claim-and-run, and maintenance operations.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use courier_core::JobId;

use crate::config::JobsConfig;

use super::registry::{HandlerError, JobHandler};
use super::store::{JobStore, JobStoreError};
use super::types::{
    BackoffPolicy, EnqueueOptions, JobPayload, JobRecord, JobStats, JobType, DEFAULT_MAX_RETRIES,
};

/// Queue error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Rejected at enqueue time by the known-type guard.
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// What happened to a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Back to `pending`, claimable again at `run_at`.
    Retrying { run_at: DateTime<Utc> },
    Dead,
}

/// Anything that can accept new jobs.
///
/// Object-safe so collaborators can hold an `Arc<dyn JobEnqueuer>` without
/// knowing the store type.
#[async_trait]
pub trait JobEnqueuer: Send + Sync {
    async fn enqueue_job(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError>;
}

/// Persisted work queue with bounded retries.
#[derive(Debug)]
pub struct JobQueue<S> {
    store: S,
    backoff: BackoffPolicy,
    default_max_retries: u32,
    known_types: Option<HashSet<String>>,
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            backoff: BackoffPolicy::default(),
            default_max_retries: DEFAULT_MAX_RETRIES,
            known_types: None,
        }
    }

    /// Queue tuned from configuration (backoff and default retry budget).
    pub fn from_config(store: S, config: &JobsConfig) -> Self {
        Self::new(store)
            .with_backoff(config.backoff_policy())
            .with_default_max_retries(config.default_max_retries)
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Reject enqueues of any type outside `types`.
    pub fn with_known_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.known_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Enqueue with default options: run now, default retry budget.
    pub async fn enqueue(&self, payload: JobPayload) -> Result<JobId, QueueError> {
        self.enqueue_with(payload, EnqueueOptions::default()).await
    }

    pub async fn enqueue_with(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        if let Some(known) = &self.known_types {
            if !known.contains(&payload.job_type) {
                return Err(QueueError::UnknownJobType(payload.job_type));
            }
        }

        let run_at = options.run_at.unwrap_or_else(Utc::now);
        let max_retries = options.max_retries.unwrap_or(self.default_max_retries);
        let record = JobRecord::new(payload, run_at, max_retries);
        let id = record.id;

        debug!(job_id = %id, job_type = %record.job_type, run_at = %run_at, "enqueue job");
        self.store.insert(record).await?;
        Ok(id)
    }

    /// Enqueue a built-in job type from typed data.
    pub async fn enqueue_typed<T: Serialize>(
        &self,
        job_type: JobType,
        data: &T,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        self.enqueue_with(JobPayload::typed(job_type, data)?, options)
            .await
    }

    /// Claim the next eligible job and run `handler` on it.
    ///
    /// Returns `true` whenever a row was claimed, whatever the handler did.
    pub async fn process_next<H>(&self, handler: &H) -> Result<bool, QueueError>
    where
        H: JobHandler + ?Sized,
    {
        Ok(self.run_next(handler).await?.is_some())
    }

    /// Like [`process_next`](Self::process_next) but reports the outcome.
    pub async fn run_next<H>(&self, handler: &H) -> Result<Option<JobOutcome>, QueueError>
    where
        H: JobHandler + ?Sized,
    {
        let Some(job) = self.store.claim_next(Utc::now()).await? else {
            return Ok(None);
        };

        let result = handler.handle(job.payload()).await;
        self.settle(&job, result).await.map(Some)
    }

    async fn settle(
        &self,
        job: &JobRecord,
        result: Result<(), HandlerError>,
    ) -> Result<JobOutcome, QueueError> {
        let now = Utc::now();

        let (outcome, written) = match result {
            Ok(()) => {
                debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, "job completed");
                (
                    JobOutcome::Completed,
                    self.store.mark_completed(job.id, now).await,
                )
            }
            Err(err) if !err.is_permanent() && job.has_attempts_left() => {
                let run_at = self.backoff.next_run_at(job.attempts, now);
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    max_retries = job.max_retries,
                    retry_at = %run_at,
                    error = %err,
                    "job failed, will retry"
                );
                (
                    JobOutcome::Retrying { run_at },
                    self.store
                        .mark_retry(job.id, err.message(), now, run_at)
                        .await,
                )
            }
            Err(err) => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    permanent = err.is_permanent(),
                    error = %err,
                    "job dead"
                );
                (
                    JobOutcome::Dead,
                    self.store.mark_dead(job.id, err.message(), now).await,
                )
            }
        };

        match written {
            Ok(()) => Ok(outcome),
            // Stale recovery reclaimed the row while the handler ran; its state wins.
            Err(JobStoreError::NotRunning { id, status }) => {
                warn!(job_id = %id, status = %status, "job was settled elsewhere, dropping result");
                Ok(outcome)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        Ok(self.store.stats().await?)
    }

    /// `dead` and `failed` rows, newest failure first.
    pub async fn recent_failed(&self, limit: usize) -> Result<Vec<JobRecord>, QueueError> {
        Ok(self.store.recent_failed(limit).await?)
    }

    /// Move every `dead` job back to `pending` with a fresh attempt budget.
    pub async fn retry_dead(&self) -> Result<u64, QueueError> {
        let count = self.store.retry_dead(Utc::now()).await?;
        if count > 0 {
            warn!(count, "requeued dead jobs");
        }
        Ok(count)
    }

    /// Delete `completed` jobs finished before `before`.
    pub async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        Ok(self.store.purge_completed(before).await?)
    }

    /// Recover `running` jobs whose worker went quiet for longer than `timeout`.
    pub async fn recover_stale(&self, timeout: Duration) -> Result<u64, QueueError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(self.store.recover_stale(cutoff, now).await?)
    }
}

#[async_trait]
impl<S: JobStore> JobEnqueuer for JobQueue<S> {
    async fn enqueue_job(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        self.enqueue_with(payload, options).await
    }
}
