//! Polling job processor.
//!
//! One tokio task per processor. Each tick recovers stale rows, then claims and
//! dispatches at most one job through the handler registry.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::JobsConfig;

use super::queue::{JobOutcome, JobQueue, QueueError};
use super::registry::{HandlerError, HandlerRegistry, JobHandler};
use super::store::JobStore;
use super::types::JobPayload;

/// How long a `running` job may go without finishing before it is recovered.
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Processor runtime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessorStats {
    pub ticks: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead: u64,
    pub recovered: u64,
    pub tick_errors: u64,
    /// Ticks skipped because another tick was still running.
    pub overlapping: u64,
}

struct Inner<S> {
    queue: Arc<JobQueue<S>>,
    dispatcher: Dispatcher,
    stale_timeout: Duration,
    in_flight: AtomicBool,
    stats: Mutex<ProcessorStats>,
}

struct LoopControl {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

/// Drives a [`JobQueue`] with handlers from a [`HandlerRegistry`].
pub struct JobProcessor<S> {
    inner: Arc<Inner<S>>,
    control: Mutex<Option<LoopControl>>,
}

impl<S: JobStore + 'static> JobProcessor<S> {
    pub fn new(queue: Arc<JobQueue<S>>, registry: HandlerRegistry) -> Self {
        Self::with_stale_timeout(queue, registry, DEFAULT_STALE_TIMEOUT)
    }

    pub fn with_stale_timeout(
        queue: Arc<JobQueue<S>>,
        registry: HandlerRegistry,
        stale_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                dispatcher: Dispatcher {
                    registry: Arc::new(registry),
                },
                stale_timeout,
                in_flight: AtomicBool::new(false),
                stats: Mutex::new(ProcessorStats::default()),
            }),
            control: Mutex::new(None),
        }
    }

    pub fn from_config(
        queue: Arc<JobQueue<S>>,
        registry: HandlerRegistry,
        config: &JobsConfig,
    ) -> Self {
        Self::with_stale_timeout(queue, registry, config.stale_timeout)
    }

    pub fn queue(&self) -> &Arc<JobQueue<S>> {
        &self.inner.queue
    }

    /// Recover stale jobs, then process at most one job.
    ///
    /// Returns `false` without doing anything if another tick is in flight.
    pub async fn tick(&self) -> Result<bool, QueueError> {
        self.inner.tick().await
    }

    /// Start the polling loop: one tick now, then one every `interval`.
    ///
    /// Calling `start` on a running processor does nothing. Must be called
    /// from within a tokio runtime.
    pub fn start(&self, interval: Duration) {
        let mut control = self.control();
        if control.is_some() {
            debug!("job processor already running");
            return;
        }

        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let inner = self.inner.clone();
        let period = interval.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            info!(interval_ms = period.as_millis() as u64, "job processor started");

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.tick().await {
                            error!(error = %e, "job processor tick failed");
                            inner.stats().tick_errors += 1;
                        }
                    }
                }
            }

            info!("job processor stopped");
        });

        *control = Some(LoopControl { shutdown, join });
    }

    /// Stop scheduling ticks. A tick already running finishes normally.
    pub fn stop(&self) {
        if let Some(control) = self.control().take() {
            control.shutdown.notify_one();
        }
    }

    /// Stop and wait for the loop task to exit.
    pub async fn shutdown(&self) {
        let control = self.control().take();
        if let Some(control) = control {
            control.shutdown.notify_one();
            if let Err(e) = control.join.await {
                error!(error = %e, "job processor task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.control().is_some()
    }

    pub fn stats(&self) -> ProcessorStats {
        *self.inner.stats()
    }

    fn control(&self) -> MutexGuard<'_, Option<LoopControl>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> Drop for JobProcessor<S> {
    fn drop(&mut self) {
        let control = self
            .control
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(control) = control {
            control.shutdown.notify_one();
        }
    }
}

impl<S: JobStore> Inner<S> {
    async fn tick(&self) -> Result<bool, QueueError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("job processor tick already in flight, skipping");
            self.stats().overlapping += 1;
            return Ok(false);
        }
        let _guard = InFlight(&self.in_flight);
        self.stats().ticks += 1;

        let recovered = self.queue.recover_stale(self.stale_timeout).await?;
        if recovered > 0 {
            warn!(recovered, "recovered stale jobs");
            self.stats().recovered += recovered;
        }

        let outcome = self.queue.run_next(&self.dispatcher).await?;
        if let Some(outcome) = outcome {
            let mut stats = self.stats();
            stats.processed += 1;
            match outcome {
                JobOutcome::Completed => stats.succeeded += 1,
                JobOutcome::Retrying { .. } => stats.retried += 1,
                JobOutcome::Dead => stats.dead += 1,
            }
        }
        Ok(outcome.is_some())
    }

    fn stats(&self) -> MutexGuard<'_, ProcessorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the in-flight flag when the tick ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Routes a claimed job to its registered handler.
struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

#[async_trait]
impl JobHandler for Dispatcher {
    async fn handle(&self, job: JobPayload) -> Result<(), HandlerError> {
        let Some(handler) = self.registry.get(&job.job_type) else {
            warn!(job_type = %job.job_type, "no handler registered for job type");
            return Err(HandlerError::permanent(format!(
                "Unknown job type: {}",
                job.job_type
            )));
        };

        // A panicking handler must not take the processor down with it.
        let job_type = job.job_type.clone();
        match tokio::spawn(async move { handler.handle(job).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let reason = panic_message(e.into_panic());
                error!(job_type = %job_type, panic = %reason, "job handler panicked");
                Err(HandlerError::retryable(format!("handler panicked: {reason}")))
            }
            Err(e) => Err(HandlerError::retryable(format!("handler task failed: {e}"))),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}
