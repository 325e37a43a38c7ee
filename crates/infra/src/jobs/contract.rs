//! Queue behaviour every `JobStore` must satisfy.
//!
//! `job_queue_contract!(make_store)` expands to a `queue_contract` test module
//! where `make_store` is an `async fn() -> impl JobStore` in the calling module.

macro_rules! job_queue_contract {
    ($make:ident) => {
        mod queue_contract {
            use std::sync::atomic::{AtomicU32, Ordering};
            use std::sync::Arc;
            use std::time::Duration;

            use chrono::Utc;
            use serde_json::json;

            use $crate::jobs::queue::{JobOutcome, JobQueue};
            use $crate::jobs::registry::HandlerError;
            use $crate::jobs::store::JobStore;
            use $crate::jobs::types::{
                BackoffPolicy, EnqueueOptions, JobPayload, JobRecord, JobStatus,
            };

            async fn queue() -> JobQueue<impl JobStore> {
                JobQueue::new(super::$make().await).with_backoff(BackoffPolicy::none())
            }

            fn payload(job_type: &str) -> JobPayload {
                JobPayload::new(job_type, json!({"k": job_type}))
            }

            async fn ok(_job: JobPayload) -> Result<(), HandlerError> {
                Ok(())
            }

            async fn fail(_job: JobPayload) -> Result<(), HandlerError> {
                Err(HandlerError::retryable("boom"))
            }

            #[tokio::test]
            async fn enqueue_applies_defaults() {
                let q = queue().await;
                let before = Utc::now();
                let id = q.enqueue(payload("a")).await.unwrap();

                let job = q.get(id).await.unwrap().unwrap();
                assert_eq!(job.status, JobStatus::Pending);
                assert_eq!(job.attempts, 0);
                assert_eq!(job.max_retries, 3);
                assert_eq!(job.job_type, "a");
                assert_eq!(job.data, json!({"k": "a"}));
                assert!(job.run_at >= before - chrono::Duration::seconds(1));
                assert!(job.run_at <= Utc::now());
                assert!(job.started_at.is_none());
                assert!(job.last_error.is_none());
            }

            #[tokio::test]
            async fn unknown_id_is_none() {
                let q = queue().await;
                assert!(q.get(courier_core::JobId::new()).await.unwrap().is_none());
            }

            #[tokio::test]
            async fn empty_queue_processes_nothing() {
                let q = queue().await;
                assert!(!q.process_next(&ok).await.unwrap());
            }

            #[tokio::test]
            async fn future_run_at_is_not_claimed() {
                let q = queue().await;
                let later = Utc::now() + chrono::Duration::hours(1);
                let id = q
                    .enqueue_with(payload("later"), EnqueueOptions::default().run_at(later))
                    .await
                    .unwrap();

                assert!(!q.process_next(&ok).await.unwrap());
                assert_eq!(q.get(id).await.unwrap().unwrap().status, JobStatus::Pending);
            }

            #[tokio::test]
            async fn delayed_job_waits_for_its_delay() {
                let q = queue().await;
                let before = Utc::now();
                let id = q
                    .enqueue_with(
                        payload("delayed"),
                        EnqueueOptions::default().delayed(Duration::from_secs(600)),
                    )
                    .await
                    .unwrap();

                let job = q.get(id).await.unwrap().unwrap();
                assert!(job.run_at >= before + chrono::Duration::seconds(600));
                assert!(!q.process_next(&ok).await.unwrap());
                assert_eq!(q.get(id).await.unwrap().unwrap().attempts, 0);
            }

            #[tokio::test]
            async fn claims_earliest_run_at_first() {
                let q = queue().await;
                let now = Utc::now();
                q.enqueue_with(
                    payload("second"),
                    EnqueueOptions::default().run_at(now - chrono::Duration::seconds(10)),
                )
                .await
                .unwrap();
                q.enqueue_with(
                    payload("first"),
                    EnqueueOptions::default().run_at(now - chrono::Duration::seconds(20)),
                )
                .await
                .unwrap();

                let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
                let sink = seen.clone();
                let record = move |job: JobPayload| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(job.job_type);
                        Ok::<(), HandlerError>(())
                    }
                };

                assert!(q.process_next(&record).await.unwrap());
                assert!(q.process_next(&record).await.unwrap());
                assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
            }

            #[tokio::test]
            async fn success_marks_completed() {
                let q = queue().await;
                let id = q.enqueue(payload("a")).await.unwrap();

                assert_eq!(q.run_next(&ok).await.unwrap(), Some(JobOutcome::Completed));

                let job = q.get(id).await.unwrap().unwrap();
                assert_eq!(job.status, JobStatus::Completed);
                assert_eq!(job.attempts, 1);
                assert!(job.started_at.is_some());
                assert!(job.completed_at.is_some());
                assert_eq!(q.stats().await.unwrap().completed, 1);
            }

            #[tokio::test]
            async fn attempts_reach_max_retries_plus_one_at_death() {
                let q = queue().await;
                let id = q
                    .enqueue_with(payload("flaky"), EnqueueOptions::default().max_retries(2))
                    .await
                    .unwrap();

                let calls = Arc::new(AtomicU32::new(0));
                let counter = calls.clone();
                let failing = move |_job: JobPayload| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), HandlerError>(HandlerError::retryable("still down"))
                    }
                };

                let mut pending_cycles = 0;
                loop {
                    match q.run_next(&failing).await.unwrap() {
                        Some(JobOutcome::Retrying { .. }) => pending_cycles += 1,
                        Some(JobOutcome::Dead) => break,
                        other => panic!("unexpected outcome {other:?}"),
                    }
                    let job = q.get(id).await.unwrap().unwrap();
                    assert_eq!(job.status, JobStatus::Pending);
                    assert!(job.attempts <= job.max_retries + 1);
                }

                let job = q.get(id).await.unwrap().unwrap();
                assert_eq!(pending_cycles, 2);
                assert_eq!(job.status, JobStatus::Dead);
                assert_eq!(job.attempts, 3);
                assert_eq!(calls.load(Ordering::SeqCst), 3);
                assert_eq!(job.last_error.as_deref(), Some("still down"));
                assert!(job.failed_at.is_some());

                // Dead rows are never claimed again.
                assert!(!q.process_next(&failing).await.unwrap());
            }

            #[tokio::test]
            async fn zero_retries_dies_on_first_failure() {
                let q = queue().await;
                q.enqueue_with(payload("once"), EnqueueOptions::default().max_retries(0))
                    .await
                    .unwrap();
                assert_eq!(q.run_next(&fail).await.unwrap(), Some(JobOutcome::Dead));
            }

            #[tokio::test]
            async fn stale_recovery_keeps_attempts() {
                let q = queue().await;
                let now = Utc::now();
                let id = q
                    .enqueue_with(
                        payload("stuck"),
                        EnqueueOptions::default().run_at(now - chrono::Duration::hours(1)),
                    )
                    .await
                    .unwrap();

                // Claimed 30 minutes ago by a worker that never came back.
                let claimed = q
                    .store()
                    .claim_next(now - chrono::Duration::minutes(30))
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(claimed.id, id);
                assert_eq!(claimed.attempts, 1);

                assert_eq!(q.recover_stale(Duration::from_secs(300)).await.unwrap(), 1);

                let job = q.get(id).await.unwrap().unwrap();
                assert_eq!(job.status, JobStatus::Pending);
                assert_eq!(job.attempts, 1);
                assert!(job.started_at.is_none());

                assert_eq!(q.recover_stale(Duration::from_secs(300)).await.unwrap(), 0);
                assert_eq!(q.run_next(&ok).await.unwrap(), Some(JobOutcome::Completed));
                assert_eq!(q.get(id).await.unwrap().unwrap().attempts, 2);
            }

            #[tokio::test]
            async fn fresh_running_rows_are_left_alone() {
                let q = queue().await;
                let id = q.enqueue(payload("busy")).await.unwrap();
                q.store().claim_next(Utc::now()).await.unwrap().unwrap();

                assert_eq!(q.recover_stale(Duration::from_secs(300)).await.unwrap(), 0);
                assert_eq!(q.get(id).await.unwrap().unwrap().status, JobStatus::Running);
                assert_eq!(q.stats().await.unwrap().running, 1);
            }

            #[tokio::test]
            async fn purge_removes_only_old_completed_rows() {
                let q = queue().await;
                let past = Utc::now() - chrono::Duration::hours(2);

                let busy = q
                    .enqueue_with(payload("busy"), EnqueueOptions::default().run_at(past))
                    .await
                    .unwrap();
                let claimed = q.store().claim_next(past).await.unwrap().unwrap();
                assert_eq!(claimed.id, busy);

                for name in ["done-1", "done-2"] {
                    q.enqueue(payload(name)).await.unwrap();
                    q.process_next(&ok).await.unwrap();
                }
                let doomed = q
                    .enqueue_with(payload("doomed"), EnqueueOptions::default().max_retries(0))
                    .await
                    .unwrap();
                q.process_next(&fail).await.unwrap();

                let mut legacy = JobRecord::new(payload("legacy"), past, 3);
                legacy.status = JobStatus::Failed;
                legacy.attempts = 1;
                legacy.failed_at = Some(past);
                legacy.last_error = Some("boom".to_string());
                let legacy_id = legacy.id;
                q.store().insert(legacy).await.unwrap();

                let waiting = q
                    .enqueue_with(
                        payload("waiting"),
                        EnqueueOptions::default().run_at(Utc::now() + chrono::Duration::hours(1)),
                    )
                    .await
                    .unwrap();

                let long_ago = Utc::now() - chrono::Duration::days(7);
                assert_eq!(q.purge_completed(long_ago).await.unwrap(), 0);

                let purged = q
                    .purge_completed(Utc::now() + chrono::Duration::days(365))
                    .await
                    .unwrap();
                assert_eq!(purged, 2);

                let stats = q.stats().await.unwrap();
                assert_eq!(stats.completed, 0);
                assert_eq!(stats.pending, 1);
                assert_eq!(stats.running, 1);
                assert_eq!(stats.failed, 1);
                assert_eq!(stats.dead, 1);
                assert_eq!(q.get(busy).await.unwrap().unwrap().status, JobStatus::Running);
                assert_eq!(q.get(doomed).await.unwrap().unwrap().status, JobStatus::Dead);
                assert_eq!(q.get(legacy_id).await.unwrap().unwrap().status, JobStatus::Failed);
                assert_eq!(q.get(waiting).await.unwrap().unwrap().status, JobStatus::Pending);
            }

            #[tokio::test]
            async fn retry_dead_requeues_with_fresh_budget() {
                let q = queue().await;
                let id = q
                    .enqueue_with(payload("doomed"), EnqueueOptions::default().max_retries(0))
                    .await
                    .unwrap();
                q.process_next(&fail).await.unwrap();
                assert_eq!(q.recent_failed(10).await.unwrap().len(), 1);

                assert_eq!(q.retry_dead().await.unwrap(), 1);

                let job = q.get(id).await.unwrap().unwrap();
                assert_eq!(job.status, JobStatus::Pending);
                assert_eq!(job.attempts, 0);
                assert!(job.last_error.is_none());
                assert!(job.failed_at.is_none());
                assert!(q.recent_failed(10).await.unwrap().is_empty());

                assert_eq!(q.run_next(&ok).await.unwrap(), Some(JobOutcome::Completed));
                assert_eq!(q.retry_dead().await.unwrap(), 0);
            }

            #[tokio::test]
            async fn recent_failed_lists_newest_first() {
                let q = queue().await;
                let mut ids = Vec::new();
                for name in ["a", "b", "c"] {
                    let id = q
                        .enqueue_with(payload(name), EnqueueOptions::default().max_retries(0))
                        .await
                        .unwrap();
                    q.process_next(&fail).await.unwrap();
                    ids.push(id);
                }
                q.enqueue(payload("ok")).await.unwrap();
                q.process_next(&ok).await.unwrap();

                let failed = q.recent_failed(2).await.unwrap();
                let got: Vec<_> = failed.iter().map(|j| j.id).collect();
                assert_eq!(got, vec![ids[2], ids[1]]);
                assert!(failed.iter().all(|j| j.status == JobStatus::Dead));
            }

            #[tokio::test]
            async fn stats_count_every_status() {
                let q = queue().await;
                q.enqueue(payload("done")).await.unwrap();
                q.process_next(&ok).await.unwrap();
                q.enqueue_with(payload("dead"), EnqueueOptions::default().max_retries(0))
                    .await
                    .unwrap();
                q.process_next(&fail).await.unwrap();
                q.enqueue(payload("pending")).await.unwrap();

                let stats = q.stats().await.unwrap();
                assert_eq!(stats.pending, 1);
                assert_eq!(stats.running, 0);
                assert_eq!(stats.completed, 1);
                assert_eq!(stats.failed, 0);
                assert_eq!(stats.dead, 1);
                assert_eq!(stats.total(), 3);
            }
        }
    };
}
