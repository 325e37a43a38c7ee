//! `courierctl`: operator commands for the background job queue.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use courier_core::JobId;
use courier_infra::JobsConfig;
use courier_infra::jobs::{JobQueue, JobRecord, JobStats, SqliteJobStore};
use courier_observability::tracing::{LogConfig, init};

#[derive(Debug, Parser)]
#[command(name = "courierctl", about = "Inspect and repair the background job queue")]
struct Cli {
    /// SQLite database URL (overrides COURIER_DATABASE_URL).
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Print JSON instead of text.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbosity: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Job counts per status.
    Stats,
    /// Most recent dead and failed jobs.
    Failed {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Requeue every dead job with a fresh retry budget.
    RetryDead,
    /// Delete completed jobs older than the given age.
    Purge {
        #[arg(long, value_name = "DAYS")]
        older_than_days: u32,
    },
    /// Recover running jobs whose worker stopped reporting.
    RecoverStale {
        /// Defaults to COURIER_JOBS_STALE_TIMEOUT_MS.
        #[arg(long, value_name = "SECS")]
        timeout_secs: Option<u64>,
    },
    /// Print one job.
    Show {
        #[arg(value_name = "JOB_ID")]
        id: JobId,
    },
}

#[derive(Debug, Serialize)]
struct Affected {
    action: &'static str,
    count: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    init(&LogConfig::cli(filter));

    let mut config = JobsConfig::from_env();
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }

    let store = SqliteJobStore::connect(&config.database_url, config.busy_timeout)
        .await
        .with_context(|| format!("failed to open job database {}", config.database_url))?;
    tracing::debug!(database_url = %config.database_url, "opened job database");
    let queue = JobQueue::from_config(store, &config);

    let mut out = std::io::stdout().lock();
    run(&cli, &config, &queue, &mut out).await
}

async fn run(
    cli: &Cli,
    config: &JobsConfig,
    queue: &JobQueue<SqliteJobStore>,
    out: &mut impl Write,
) -> Result<()> {
    match &cli.command {
        Command::Stats => {
            let stats = queue.stats().await?;
            if cli.json {
                write_json(out, &stats)?;
            } else {
                write_stats(out, &stats)?;
            }
        }
        Command::Failed { limit } => {
            let jobs = queue.recent_failed(*limit).await?;
            if cli.json {
                write_json(out, &jobs)?;
            } else {
                write_failed(out, &jobs)?;
            }
        }
        Command::RetryDead => {
            let count = queue.retry_dead().await?;
            write_affected(out, cli.json, "requeued", count)?;
        }
        Command::Purge { older_than_days } => {
            let before = Utc::now()
                .checked_sub_signed(chrono::Duration::days(i64::from(*older_than_days)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let count = queue.purge_completed(before).await?;
            write_affected(out, cli.json, "purged", count)?;
        }
        Command::RecoverStale { timeout_secs } => {
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(config.stale_timeout);
            let count = queue.recover_stale(timeout).await?;
            write_affected(out, cli.json, "recovered", count)?;
        }
        Command::Show { id } => {
            let Some(job) = queue.get(*id).await? else {
                bail!("job {id} not found");
            };
            if cli.json {
                write_json(out, &job)?;
            } else {
                write_job(out, &job)?;
            }
        }
    }
    Ok(())
}

fn write_json<T: Serialize>(out: &mut impl Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn write_affected(out: &mut impl Write, json: bool, action: &'static str, count: u64) -> Result<()> {
    if json {
        write_json(out, &Affected { action, count })
    } else {
        writeln!(out, "{action} {count} job(s)")?;
        Ok(())
    }
}

fn write_stats(out: &mut impl Write, stats: &JobStats) -> Result<()> {
    for (label, count) in [
        ("pending", stats.pending),
        ("running", stats.running),
        ("completed", stats.completed),
        ("failed", stats.failed),
        ("dead", stats.dead),
    ] {
        writeln!(out, "{label:<10} {count}")?;
    }
    Ok(())
}

fn write_failed(out: &mut impl Write, jobs: &[JobRecord]) -> Result<()> {
    if jobs.is_empty() {
        writeln!(out, "no failed jobs")?;
        return Ok(());
    }
    for job in jobs {
        writeln!(
            out,
            "{}  {:<24} {:<6} {}/{}  {}  {}",
            job.id,
            job.job_type,
            job.status.as_str(),
            job.attempts,
            job.attempt_budget(),
            fmt_time(job.failed_at),
            job.last_error.as_deref().unwrap_or("-"),
        )?;
    }
    Ok(())
}

fn write_job(out: &mut impl Write, job: &JobRecord) -> Result<()> {
    writeln!(out, "id:           {}", job.id)?;
    writeln!(out, "type:         {}", job.job_type)?;
    writeln!(out, "status:       {}", job.status)?;
    writeln!(out, "attempts:     {}/{}", job.attempts, job.attempt_budget())?;
    writeln!(out, "run_at:       {}", fmt_time(Some(job.run_at)))?;
    writeln!(out, "created_at:   {}", fmt_time(Some(job.created_at)))?;
    writeln!(out, "started_at:   {}", fmt_time(job.started_at))?;
    writeln!(out, "completed_at: {}", fmt_time(job.completed_at))?;
    writeln!(out, "failed_at:    {}", fmt_time(job.failed_at))?;
    writeln!(out, "last_error:   {}", job.last_error.as_deref().unwrap_or("-"))?;
    writeln!(out, "data:         {}", job.data)?;
    Ok(())
}

fn fmt_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_infra::jobs::{EnqueueOptions, HandlerError, JobPayload};
    use serde_json::json;

    async fn queue() -> JobQueue<SqliteJobStore> {
        JobQueue::new(SqliteJobStore::in_memory().await.unwrap())
    }

    async fn exec(queue: &JobQueue<SqliteJobStore>, args: &[&str]) -> Result<String> {
        let mut argv = vec!["courierctl"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv)?;
        let mut out = Vec::new();
        run(&cli, &JobsConfig::default(), queue, &mut out).await?;
        Ok(String::from_utf8(out)?)
    }

    async fn kill_one(queue: &JobQueue<SqliteJobStore>, job_type: &str) -> JobId {
        let id = queue
            .enqueue_with(
                JobPayload::new(job_type, json!({})),
                EnqueueOptions::default().max_retries(0),
            )
            .await
            .unwrap();
        queue
            .process_next(&|_job: JobPayload| async {
                Err::<(), HandlerError>(HandlerError::retryable("smtp timeout"))
            })
            .await
            .unwrap();
        id
    }

    #[test]
    fn parses_subcommands_and_global_flags() {
        let cli = Cli::try_parse_from(["courierctl", "failed", "--limit", "5", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Failed { limit: 5 }));

        let cli = Cli::try_parse_from(["courierctl", "purge", "--older-than-days", "30"]).unwrap();
        assert!(matches!(cli.command, Command::Purge { older_than_days: 30 }));

        assert!(Cli::try_parse_from(["courierctl", "show", "not-a-uuid"]).is_err());
        assert!(Cli::try_parse_from(["courierctl", "purge"]).is_err());
    }

    #[tokio::test]
    async fn stats_prints_every_status() {
        let queue = queue().await;
        queue
            .enqueue(JobPayload::new("email.send", json!({})))
            .await
            .unwrap();

        let text = exec(&queue, &["stats"]).await.unwrap();
        assert!(text.contains("pending    1"));
        assert!(text.contains("dead       0"));

        let json: JobStats = serde_json::from_str(&exec(&queue, &["stats", "--json"]).await.unwrap())
            .unwrap();
        assert_eq!(json.pending, 1);
    }

    #[tokio::test]
    async fn failed_then_retry_dead() {
        let queue = queue().await;
        let id = kill_one(&queue, "email.send").await;

        let text = exec(&queue, &["failed"]).await.unwrap();
        assert!(text.contains(&id.to_string()));
        assert!(text.contains("smtp timeout"));

        let text = exec(&queue, &["retry-dead", "--json"]).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"action": "requeued", "count": 1}));

        assert_eq!(exec(&queue, &["failed"]).await.unwrap(), "no failed jobs\n");
    }

    #[tokio::test]
    async fn show_prints_one_job_or_fails() {
        let queue = queue().await;
        let id = kill_one(&queue, "discord.sync").await;

        let text = exec(&queue, &["show", &id.to_string()]).await.unwrap();
        assert!(text.contains("type:         discord.sync"));
        assert!(text.contains("status:       dead"));
        assert!(text.contains("attempts:     1/1"));

        let missing = JobId::new().to_string();
        let err = exec(&queue, &["show", &missing]).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn purge_and_recover_report_counts() {
        let queue = queue().await;
        assert_eq!(
            exec(&queue, &["purge", "--older-than-days", "7"]).await.unwrap(),
            "purged 0 job(s)\n"
        );
        assert_eq!(
            exec(&queue, &["recover-stale", "--timeout-secs", "60"]).await.unwrap(),
            "recovered 0 job(s)\n"
        );
    }
}
