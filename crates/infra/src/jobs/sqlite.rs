//! SQLite-backed job store.
//!
//! Timestamps are stored as fixed-width RFC3339 strings (microseconds, `Z`
//! suffix) so that string comparison in SQL matches chronological order.
//!
//! Claiming uses a single `UPDATE … WHERE id = (SELECT … LIMIT 1) RETURNING`
//! statement; SQLite serialises writers, so two workers never get the same row.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use courier_core::JobId;

use super::store::{JobStore, JobStoreError, STALE_FINAL_ATTEMPT_ERROR};
use super::types::{JobRecord, JobStats, JobStatus};

/// Migration that creates the job table and its indexes.
pub const MIGRATION_NAME: &str = "024_job_queue";

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS job_queue (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        data TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'pending',
        run_at TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        last_error TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        failed_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_job_queue_status_run_at ON job_queue(status, run_at)",
    "CREATE INDEX IF NOT EXISTS idx_job_queue_type ON job_queue(type)",
];

const COLUMNS: &str = "id, type, data, status, run_at, attempts, max_retries, last_error, \
                       created_at, started_at, completed_at, failed_at";

/// Job store persisted in a SQLite `job_queue` table.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Wrap an existing pool and make sure the schema exists.
    pub async fn new(pool: SqlitePool) -> Result<Self, JobStoreError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open (creating if needed) the database at `url`.
    pub async fn connect(url: &str, busy_timeout: Duration) -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("connect", e))?
            .create_if_missing(true)
            .busy_timeout(busy_timeout);

        if let Some(parent) = options.get_filename().parent() {
            ensure_dir(parent).await?;
        }

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Self::new(pool).await
    }

    /// A private in-memory database.
    ///
    /// Pinned to one connection that never expires; every new connection to
    /// `sqlite::memory:` would otherwise see an empty database.
    pub async fn in_memory() -> Result<Self, JobStoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Self::new(pool).await
    }

    /// Direct pool access for tests and admin tooling.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip(self), fields(migration = MIGRATION_NAME), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    /// Explain why a guarded `running` update touched nothing.
    async fn not_running(&self, id: JobId) -> JobStoreError {
        match self.get(id).await {
            Ok(Some(record)) => JobStoreError::NotRunning {
                id,
                status: record.status,
            },
            Ok(None) => JobStoreError::NotFound(id),
            Err(e) => e,
        }
    }
}

async fn ensure_dir(dir: &Path) -> Result<(), JobStoreError> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| JobStoreError::Storage(format!("failed to create {}: {e}", dir.display())))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, record), fields(job_id = %record.id, job_type = %record.job_type), err)]
    async fn insert(&self, record: JobRecord) -> Result<(), JobStoreError> {
        let data = serde_json::to_string(&record.data)
            .map_err(|e| JobStoreError::Corrupt(format!("unserializable job data: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO job_queue
                (id, type, data, status, run_at, attempts, max_retries, last_error,
                 created_at, started_at, completed_at, failed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.job_type)
        .bind(data)
        .bind(record.status.as_str())
        .bind(fmt_ts(record.run_at))
        .bind(i64::from(record.attempts))
        .bind(i64::from(record.max_retries))
        .bind(&record.last_error)
        .bind(fmt_ts(record.created_at))
        .bind(record.started_at.map(fmt_ts))
        .bind(record.completed_at.map(fmt_ts))
        .bind(record.failed_at.map(fmt_ts))
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                JobStoreError::AlreadyExists(record.id)
            }
            other => map_sqlx_error("insert", other),
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM job_queue WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(row_to_record).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE job_queue
            SET status = 'running', started_at = ?1, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM job_queue
                WHERE status = 'pending' AND run_at <= ?1
                ORDER BY run_at ASC, created_at ASC, rowid ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(fmt_ts(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let claimed = row.map(row_to_record).transpose()?;
        if let Some(job) = &claimed {
            debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, "claimed job");
        }
        Ok(claimed)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_completed(&self, id: JobId, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE job_queue SET status = 'completed', completed_at = ?2 \
             WHERE id = ?1 AND status = 'running'",
        )
        .bind(id.to_string())
        .bind(fmt_ts(at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?;

        if result.rows_affected() == 0 {
            return Err(self.not_running(id).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn mark_retry(
        &self,
        id: JobId,
        error: &str,
        failed_at: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE job_queue \
             SET status = 'pending', last_error = ?2, failed_at = ?3, run_at = ?4, started_at = NULL \
             WHERE id = ?1 AND status = 'running'",
        )
        .bind(id.to_string())
        .bind(error)
        .bind(fmt_ts(failed_at))
        .bind(fmt_ts(run_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_retry", e))?;

        if result.rows_affected() == 0 {
            return Err(self.not_running(id).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn mark_dead(
        &self,
        id: JobId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE job_queue SET status = 'dead', last_error = ?2, failed_at = ?3 \
             WHERE id = ?1 AND status = 'running'",
        )
        .bind(id.to_string())
        .bind(error)
        .bind(fmt_ts(at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_dead", e))?;

        if result.rows_affected() == 0 {
            return Err(self.not_running(id).await);
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            let status = JobStatus::from_str(&status)
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            stats.record(status, u64::try_from(count).unwrap_or_default());
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn recent_failed(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_queue WHERE status IN ('dead', 'failed') \
             ORDER BY failed_at DESC, rowid DESC LIMIT ?1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_failed", e))?;

        rows.into_iter().map(row_to_record).collect()
    }

    #[instrument(skip(self), err)]
    async fn retry_dead(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            "UPDATE job_queue \
             SET status = 'pending', attempts = 0, last_error = NULL, failed_at = NULL, \
                 started_at = NULL, run_at = ?1 \
             WHERE status = 'dead'",
        )
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("retry_dead", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM job_queue WHERE status = 'completed' AND completed_at < ?1",
        )
        .bind(fmt_ts(before))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_completed", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("recover_stale", e))?;

        // Budget already spent: re-claiming would push attempts past max_retries + 1.
        let dead = sqlx::query(
            "UPDATE job_queue \
             SET status = 'dead', last_error = ?2, failed_at = ?3, started_at = NULL \
             WHERE status = 'running' AND started_at < ?1 AND attempts >= max_retries + 1",
        )
        .bind(fmt_ts(cutoff))
        .bind(STALE_FINAL_ATTEMPT_ERROR)
        .bind(fmt_ts(now))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("recover_stale", e))?;

        let pending = sqlx::query(
            "UPDATE job_queue SET status = 'pending', started_at = NULL \
             WHERE status = 'running' AND started_at < ?1",
        )
        .bind(fmt_ts(cutoff))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("recover_stale", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("recover_stale", e))?;

        Ok(dead.rows_affected() + pending.rows_affected())
    }
}

fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &str, raw: &str) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| JobStoreError::Corrupt(format!("invalid {column} '{raw}': {e}")))
}

fn parse_opt_ts(column: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, JobStoreError> {
    raw.map(|s| parse_ts(column, &s)).transpose()
}

fn to_u32(column: &str, value: i64) -> Result<u32, JobStoreError> {
    u32::try_from(value).map_err(|_| JobStoreError::Corrupt(format!("{column} out of range: {value}")))
}

/// Map a `job_queue` row into a `JobRecord`.
fn row_to_record(row: SqliteRow) -> Result<JobRecord, JobStoreError> {
    let get = |e: sqlx::Error| JobStoreError::Corrupt(e.to_string());

    let id_str: String = row.try_get("id").map_err(get)?;
    let id = JobId::from_str(&id_str).map_err(|e| JobStoreError::Corrupt(e.to_string()))?;

    let data_str: String = row.try_get("data").map_err(get)?;
    let data = serde_json::from_str(&data_str)
        .map_err(|e| JobStoreError::Corrupt(format!("invalid JSON data for job {id}: {e}")))?;

    let status_str: String = row.try_get("status").map_err(get)?;
    let status =
        JobStatus::from_str(&status_str).map_err(|e| JobStoreError::Corrupt(e.to_string()))?;

    let run_at: String = row.try_get("run_at").map_err(get)?;
    let created_at: String = row.try_get("created_at").map_err(get)?;

    Ok(JobRecord {
        id,
        job_type: row.try_get("type").map_err(get)?,
        data,
        status,
        run_at: parse_ts("run_at", &run_at)?,
        attempts: to_u32("attempts", row.try_get("attempts").map_err(get)?)?,
        max_retries: to_u32("max_retries", row.try_get("max_retries").map_err(get)?)?,
        last_error: row.try_get("last_error").map_err(get)?,
        created_at: parse_ts("created_at", &created_at)?,
        started_at: parse_opt_ts("started_at", row.try_get("started_at").map_err(get)?)?,
        completed_at: parse_opt_ts("completed_at", row.try_get("completed_at").map_err(get)?)?,
        failed_at: parse_opt_ts("failed_at", row.try_get("failed_at").map_err(get)?)?,
    })
}

/// Map sqlx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
