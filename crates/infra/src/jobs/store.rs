//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::JobId;

use super::types::{JobRecord, JobStats, JobStatus};

/// `last_error` written when recovery finds a stale row with no attempts left.
pub const STALE_FINAL_ATTEMPT_ERROR: &str = "stale: worker lost during final attempt";

/// Persistence for job records.
///
/// Every mutation takes explicit timestamps so callers (and tests) own the clock.
/// `claim_next` must be atomic: two concurrent callers never receive the same row.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `pending` record.
    async fn insert(&self, record: JobRecord) -> Result<(), JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Claim the oldest claimable row (by `run_at`, `created_at`, insertion order),
    /// flipping it to `running`, setting `started_at` and incrementing `attempts`.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>, JobStoreError>;

    /// `running` → `completed`.
    async fn mark_completed(&self, id: JobId, at: DateTime<Utc>) -> Result<(), JobStoreError>;

    /// `running` → `pending` with a new `run_at`, recording the failure.
    async fn mark_retry(
        &self,
        id: JobId,
        error: &str,
        failed_at: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// `running` → `dead`.
    async fn mark_dead(&self, id: JobId, error: &str, at: DateTime<Utc>)
    -> Result<(), JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// `dead` and `failed` rows, newest `failed_at` first.
    async fn recent_failed(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Every `dead` row back to `pending` with a fresh attempt budget.
    async fn retry_dead(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Delete `completed` rows with `completed_at < before`.
    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Recover `running` rows whose `started_at < cutoff`.
    ///
    /// Rows with attempts left go back to `pending` (attempts unchanged); rows that
    /// already spent their budget go to `dead`.
    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn insert(&self, record: JobRecord) -> Result<(), JobStoreError> {
        (**self).insert(record).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(id).await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).claim_next(now).await
    }

    async fn mark_completed(&self, id: JobId, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        (**self).mark_completed(id, at).await
    }

    async fn mark_retry(
        &self,
        id: JobId,
        error: &str,
        failed_at: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        (**self).mark_retry(id, error, failed_at, run_at).await
    }

    async fn mark_dead(
        &self,
        id: JobId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        (**self).mark_dead(id, error, at).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }

    async fn recent_failed(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).recent_failed(limit).await
    }

    async fn retry_dead(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).retry_dead(now).await
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).purge_completed(before).await
    }

    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        (**self).recover_stale(cutoff, now).await
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// The row exists but is not `running`; someone else already settled it.
    #[error("job {id} is {status}, expected running")]
    NotRunning { id: JobId, status: JobStatus },
    #[error("storage error: {0}")]
    Storage(String),
    /// A persisted row could not be decoded.
    #[error("corrupt job row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Default)]
struct Rows {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    record: JobRecord,
}

impl Rows {
    fn running_mut(&mut self, id: JobId) -> Result<&mut JobRecord, JobStoreError> {
        let entry = self.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if entry.record.status != JobStatus::Running {
            return Err(JobStoreError::NotRunning {
                id,
                status: entry.record.status,
            });
        }
        Ok(&mut entry.record)
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    rows: RwLock<Rows>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> Result<usize, JobStoreError> {
        Ok(self.read()?.jobs.len())
    }

    pub fn is_empty(&self) -> Result<bool, JobStoreError> {
        Ok(self.len()? == 0)
    }

    /// Overwrite a stored record. Test hook for setting up odd states.
    pub fn replace(&self, record: JobRecord) -> Result<(), JobStoreError> {
        let mut rows = self.write()?;
        let entry = rows
            .jobs
            .get_mut(&record.id)
            .ok_or(JobStoreError::NotFound(record.id))?;
        entry.record = record;
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Rows>, JobStoreError> {
        self.rows
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Rows>, JobStoreError> {
        self.rows
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), JobStoreError> {
        let mut rows = self.write()?;
        if rows.jobs.contains_key(&record.id) {
            return Err(JobStoreError::AlreadyExists(record.id));
        }
        let seq = rows.next_seq;
        rows.next_seq += 1;
        rows.jobs.insert(record.id, Entry { seq, record });
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.read()?.jobs.get(&id).map(|e| e.record.clone()))
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>, JobStoreError> {
        let mut rows = self.write()?;

        let next = rows
            .jobs
            .values_mut()
            .filter(|e| e.record.is_claimable(now))
            .min_by_key(|e| (e.record.run_at, e.record.created_at, e.seq));

        Ok(next.map(|entry| {
            let job = &mut entry.record;
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.attempts += 1;
            job.clone()
        }))
    }

    async fn mark_completed(&self, id: JobId, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut rows = self.write()?;
        let job = rows.running_mut(id)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(at);
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: JobId,
        error: &str,
        failed_at: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut rows = self.write()?;
        let job = rows.running_mut(id)?;
        job.status = JobStatus::Pending;
        job.last_error = Some(error.to_string());
        job.failed_at = Some(failed_at);
        job.run_at = run_at;
        job.started_at = None;
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: JobId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut rows = self.write()?;
        let job = rows.running_mut(id)?;
        job.status = JobStatus::Dead;
        job.last_error = Some(error.to_string());
        job.failed_at = Some(at);
        Ok(())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = self.read()?;
        let mut stats = JobStats::default();
        for entry in rows.jobs.values() {
            stats.record(entry.record.status, 1);
        }
        Ok(stats)
    }

    async fn recent_failed(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = self.read()?;
        let mut failed: Vec<&Entry> = rows
            .jobs
            .values()
            .filter(|e| matches!(e.record.status, JobStatus::Dead | JobStatus::Failed))
            .collect();
        // Newest first; rows without failed_at sort last.
        failed.sort_by(|a, b| {
            b.record
                .failed_at
                .cmp(&a.record.failed_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(failed
            .into_iter()
            .take(limit)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn retry_dead(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut rows = self.write()?;
        let mut count = 0;
        for entry in rows.jobs.values_mut() {
            let job = &mut entry.record;
            if job.status == JobStatus::Dead {
                job.status = JobStatus::Pending;
                job.attempts = 0;
                job.last_error = None;
                job.failed_at = None;
                job.started_at = None;
                job.run_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut rows = self.write()?;
        let len_before = rows.jobs.len();
        rows.jobs.retain(|_, e| {
            !(e.record.status == JobStatus::Completed
                && e.record.completed_at.is_some_and(|at| at < before))
        });
        Ok((len_before - rows.jobs.len()) as u64)
    }

    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut rows = self.write()?;
        let mut count = 0;
        for entry in rows.jobs.values_mut() {
            let job = &mut entry.record;
            let stale = job.status == JobStatus::Running
                && job.started_at.is_some_and(|started| started < cutoff);
            if !stale {
                continue;
            }
            job.started_at = None;
            if job.has_attempts_left() {
                job.status = JobStatus::Pending;
            } else {
                job.status = JobStatus::Dead;
                job.last_error = Some(STALE_FINAL_ATTEMPT_ERROR.to_string());
                job.failed_at = Some(now);
            }
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::jobs::types::JobPayload;
    use chrono::Duration;
    use serde_json::json;

    pub(crate) async fn memory_store() -> InMemoryJobStore {
        InMemoryJobStore::new()
    }

    job_queue_contract!(memory_store);

    fn record(job_type: &str, run_at: DateTime<Utc>) -> JobRecord {
        JobRecord::new(JobPayload::new(job_type, json!({})), run_at, 3)
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = record("t", Utc::now());
        store.insert(job.clone()).await.unwrap();
        assert_eq!(
            store.insert(job.clone()).await,
            Err(JobStoreError::AlreadyExists(job.id))
        );
    }

    #[tokio::test]
    async fn ties_on_run_at_and_created_at_fall_back_to_insertion_order() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let mut first = record("first", now);
        let mut second = record("second", now);
        first.created_at = now;
        second.created_at = now;
        store.insert(first.clone()).await.unwrap();
        store.insert(second).await.unwrap();

        let claimed = store.claim_next(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
    }

    #[tokio::test]
    async fn settling_a_row_that_is_not_running_fails() {
        let store = InMemoryJobStore::new();
        let job = record("t", Utc::now());
        store.insert(job.clone()).await.unwrap();

        let err = store.mark_completed(job.id, Utc::now()).await.unwrap_err();
        assert_eq!(
            err,
            JobStoreError::NotRunning {
                id: job.id,
                status: JobStatus::Pending
            }
        );

        let missing = JobId::new();
        assert_eq!(
            store.mark_dead(missing, "x", Utc::now()).await,
            Err(JobStoreError::NotFound(missing))
        );
    }

    #[tokio::test]
    async fn stale_rows_without_budget_go_dead() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let mut job = record("t", now);
        job.max_retries = 0;
        store.insert(job.clone()).await.unwrap();
        store.claim_next(now).await.unwrap().unwrap();

        let later = now + Duration::minutes(10);
        let recovered = store
            .recover_stale(later - Duration::minutes(5), later)
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let dead = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(dead.status, JobStatus::Dead);
        assert_eq!(dead.attempts, 1);
        assert_eq!(dead.last_error.as_deref(), Some(STALE_FINAL_ATTEMPT_ERROR));
        assert_eq!(dead.started_at, None);
    }
}
