//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use courier_core::{DomainError, JobId};

use super::registry::HandlerError;

/// Default retry budget applied when the caller does not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for `run_at`
    Pending,
    /// Claimed by a worker
    Running,
    /// Handler succeeded
    Completed,
    /// Retryable failure recorded by an older writer; never claimed
    Failed,
    /// Retry budget exhausted, needs an operator
    Dead,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Built-in job types routed by the handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    EmailSend,
    NewsletterSend,
    DiscordSync,
    StripeWebhookProcess,
    ConversationSweep,
}

/// Wire names of every built-in job type.
pub const KNOWN_JOB_TYPES: [&str; 5] = [
    "email.send",
    "newsletter.send",
    "discord.sync",
    "stripe.webhook.process",
    "conversation.sweep",
];

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::EmailSend,
        JobType::NewsletterSend,
        JobType::DiscordSync,
        JobType::StripeWebhookProcess,
        JobType::ConversationSweep,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::EmailSend => KNOWN_JOB_TYPES[0],
            JobType::NewsletterSend => KNOWN_JOB_TYPES[1],
            JobType::DiscordSync => KNOWN_JOB_TYPES[2],
            JobType::StripeWebhookProcess => KNOWN_JOB_TYPES[3],
            JobType::ConversationSweep => KNOWN_JOB_TYPES[4],
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// What a handler receives: the type discriminator and the raw data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: serde_json::Value,
}

impl JobPayload {
    pub fn new(job_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            data,
        }
    }

    /// Build a payload for a built-in job type from typed data.
    pub fn typed<T: Serialize>(job_type: JobType, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(job_type.as_str(), serde_json::to_value(data)?))
    }

    /// Deserialize `data` into the handler's expected shape.
    ///
    /// A payload that does not decode will never decode, so the error is permanent.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            HandlerError::permanent(format!("invalid payload for {}: {}", self.job_type, e))
        })
    }
}

/// Scheduling options for `enqueue`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Earliest claim time (defaults to now).
    pub run_at: Option<DateTime<Utc>>,
    /// Retry budget (defaults to the queue's default, normally 3).
    pub max_retries: Option<u32>,
}

impl EnqueueOptions {
    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        let now = Utc::now();
        self.run_at = Some(
            chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// One persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: serde_json::Value,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    /// Dispatch attempts so far; incremented on every claim.
    pub attempts: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A fresh `pending` row.
    pub fn new(payload: JobPayload, run_at: DateTime<Utc>, max_retries: u32) -> Self {
        Self {
            id: JobId::new(),
            job_type: payload.job_type,
            data: payload.data,
            status: JobStatus::Pending,
            run_at,
            attempts: 0,
            max_retries,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
        }
    }

    pub fn payload(&self) -> JobPayload {
        JobPayload::new(self.job_type.clone(), self.data.clone())
    }

    /// Total dispatches allowed: the first run plus `max_retries` retries.
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another dispatch fits in the budget.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.attempt_budget()
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }
}

/// Aggregate row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Dead => self.dead += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed + self.dead
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Delay schedule applied to `run_at` when a job goes back to `pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Retry immediately. Mostly useful in tests.
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// `run_at` for the retry that follows a failed attempt.
    pub fn next_run_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
