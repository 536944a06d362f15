//! Durable "run this later unless undone" jobs.
//!
//! Jobs are keyed by `(kind, entity)` with at most one waiting job per key,
//! so scheduling is idempotent and an undo cancels exactly what is waiting.
//! The [`JobRunner`] polls for due jobs and hands them to the executor
//! registered for their kind. A failed execution is rescheduled with a
//! linear backoff until `max_attempts` executions have started. A job left
//! `running` past its lease, because the runner crashed or lost the store
//! before recording the outcome, is treated as a failed execution.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookguard_core::{Clock, CoreError, NewScheduledJob, RelatedEntity, ScheduledJob};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    notifier::{Notification, Notifier},
    storage::JobStorage,
};

/// Job kind for the delayed purchase follow-up.
pub const PURCHASE_FOLLOW_UP: &str = "purchase_follow_up";

/// Schedules and cancels delayed jobs.
#[derive(Clone)]
pub struct DelayedJobScheduler {
    storage: Arc<dyn JobStorage>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DelayedJobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedJobScheduler").finish_non_exhaustive()
    }
}

impl DelayedJobScheduler {
    /// Creates a scheduler over the given job store.
    pub fn new(storage: Arc<dyn JobStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Schedules `kind` for `entity` after `delay`.
    ///
    /// A job already waiting for the same key is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `CoreError` if the store fails.
    pub async fn schedule(
        &self,
        kind: &str,
        entity: RelatedEntity,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<ScheduledJob, CoreError> {
        let now = self.clock.now_utc();
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| CoreError::InvalidInput(format!("delay out of range: {e}")))?;
        let job = NewScheduledJob { kind: kind.to_string(), entity, payload, run_at: now + delay };

        let job = self.storage.schedule(job, now).await?;
        debug!(job_id = %job.id, kind = %job.kind, entity = %job.entity, run_at = %job.run_at, "job scheduled");
        Ok(job)
    }

    /// Undoes the waiting job for a key.
    ///
    /// Returns `false` when nothing was waiting.
    ///
    /// # Errors
    ///
    /// Returns `CoreError` if the store fails.
    pub async fn cancel(&self, kind: &str, entity: RelatedEntity) -> Result<bool, CoreError> {
        let cancelled =
            self.storage.cancel(kind.to_string(), entity.clone(), self.clock.now_utc()).await?;
        info!(kind = %kind, entity = %entity, cancelled, "job undo requested");
        Ok(cancelled)
    }

    /// Every job recorded for an entity, newest first.
    ///
    /// # Errors
    ///
    /// Returns `CoreError` if the store fails.
    pub async fn jobs_for(&self, entity: RelatedEntity) -> Result<Vec<ScheduledJob>, CoreError> {
        self.storage.find_for_entity(entity).await
    }
}

/// Executes due jobs of one kind.
#[async_trait]
pub trait JobExecutor: Send + Sync + std::fmt::Debug {
    /// Runs the job. An `Err` marks it failed with the message.
    async fn execute(&self, job: &ScheduledJob) -> Result<(), String>;
}

/// Sends the delayed purchase follow-up notification.
#[derive(Debug, Clone)]
pub struct FollowUpExecutor {
    notifier: Arc<dyn Notifier>,
}

impl FollowUpExecutor {
    /// Creates the executor.
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl JobExecutor for FollowUpExecutor {
    async fn execute(&self, job: &ScheduledJob) -> Result<(), String> {
        let notification = Notification {
            kind: job.kind.clone(),
            entity: Some(job.entity.clone()),
            message: format!("Follow up on accepted purchase {}", job.entity.id()),
            payload: job.payload.clone(),
        };
        self.notifier.notify(&notification).await.map_err(|e| e.to_string())
    }
}

/// Polling settings for the job runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Idle wait between polls.
    pub poll_interval: Duration,
    /// Maximum jobs claimed per poll.
    pub batch_size: usize,
    /// Executions started before a failing job is given up.
    pub max_attempts: u32,
    /// Backoff unit; the retry after attempt `n` waits `n * retry_delay`.
    pub retry_delay: Duration,
    /// How long a job may stay `running` before it is considered abandoned.
    pub lease: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            max_attempts: 3,
            retry_delay: Duration::from_secs(60),
            lease: Duration::from_secs(300),
        }
    }
}

/// Background worker executing due jobs.
pub struct JobRunner {
    storage: Arc<dyn JobStorage>,
    executors: HashMap<String, Arc<dyn JobExecutor>>,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
    cancellation_token: CancellationToken,
}

impl JobRunner {
    /// Creates a runner with no executors.
    pub fn new(
        storage: Arc<dyn JobStorage>,
        clock: Arc<dyn Clock>,
        config: RunnerConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { storage, executors: HashMap::new(), clock, config, cancellation_token }
    }

    /// Registers the executor for a job kind.
    #[must_use]
    pub fn with_executor(mut self, kind: impl Into<String>, executor: Arc<dyn JobExecutor>) -> Self {
        self.executors.insert(kind.into(), executor);
        self
    }

    /// Polls until cancelled.
    pub async fn run(&self) {
        info!(poll_interval_ms = self.config.poll_interval.as_millis(), "job runner starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let wait = match self.run_due().await {
                Ok(0) => self.config.poll_interval,
                Ok(_) => continue,
                Err(error) => {
                    error!(error = %error, "job runner poll failed");
                    self.config.poll_interval.saturating_mul(5)
                },
            };

            tokio::select! {
                () = self.clock.sleep(wait) => {},
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!("job runner stopped");
    }

    /// Claims and executes one batch of due jobs.
    ///
    /// Jobs whose lease expired are settled first, so they can be claimed
    /// again in the same poll when their retry is already due.
    ///
    /// # Errors
    ///
    /// Returns `CoreError` if claiming fails. Executor failures are recorded
    /// on the job.
    pub async fn run_due(&self) -> Result<usize, CoreError> {
        self.reclaim_abandoned().await?;

        let jobs = self.storage.claim_due(self.clock.now_utc(), self.config.batch_size).await?;
        let count = jobs.len();

        for job in jobs {
            let result = match self.executors.get(&job.kind) {
                Some(executor) => executor.execute(&job).await.map_err(|message| (message, true)),
                None => Err((format!("no executor registered for job kind {}", job.kind), false)),
            };

            match result {
                Ok(()) => {
                    if self.storage.complete(job.id, self.clock.now_utc()).await? {
                        info!(job_id = %job.id, kind = %job.kind, entity = %job.entity, "job completed");
                    } else {
                        warn!(job_id = %job.id, kind = %job.kind, "job lease expired before completion was recorded");
                    }
                },
                Err((message, retryable)) => {
                    let retry_at = if retryable { self.retry_at(&job) } else { None };
                    let now = self.clock.now_utc();
                    let status = self.storage.fail(job.id, message.clone(), retry_at, now).await?;
                    warn!(
                        job_id = %job.id,
                        kind = %job.kind,
                        attempts = job.attempts,
                        error = %message,
                        next_status = ?status,
                        "job failed"
                    );
                },
            }
        }

        Ok(count)
    }

    /// Settles `running` jobs whose lease expired as failed executions.
    async fn reclaim_abandoned(&self) -> Result<usize, CoreError> {
        let lease = chrono::Duration::from_std(self.config.lease)
            .map_err(|e| CoreError::InvalidInput(format!("lease out of range: {e}")))?;
        let now = self.clock.now_utc();

        let abandoned = self.storage.find_stale_running(now - lease, self.config.batch_size).await?;
        for job in &abandoned {
            let message = "lease expired before the job finished".to_string();
            let status = self.storage.fail(job.id, message, self.retry_at(job), now).await?;
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempts = job.attempts,
                next_status = ?status,
                "abandoned job reclaimed"
            );
        }

        Ok(abandoned.len())
    }

    /// Next run for a failed job, or `None` once its attempts are used up.
    fn retry_at(&self, job: &ScheduledJob) -> Option<DateTime<Utc>> {
        let attempts = u32::try_from(job.attempts).unwrap_or(0);
        if attempts >= self.config.max_attempts {
            return None;
        }
        let backoff = self.config.retry_delay.saturating_mul(attempts.max(1));
        chrono::Duration::from_std(backoff).ok().map(|backoff| self.clock.now_utc() + backoff)
    }
}
