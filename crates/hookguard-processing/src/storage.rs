//! Storage abstraction layer for the processing pipeline.
//!
//! Dispatch, replay, ignore and the background workers only see these traits.
//! Production wires the PostgreSQL repositories from `hookguard_core::storage`;
//! tests use the in-memory [`mock`] stores, which honor the same conditional
//! transitions so concurrency properties can be checked without a database.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use hookguard_core::{
    error::Result,
    models::{
        EventId, FailureCode, InsertOutcome, JobId, JobStatus, NewScheduledJob, NewWebhookEvent,
        RelatedEntity, ScheduledJob, WebhookEvent,
    },
    query::{EventFilter, EventPage, EventSummary},
    storage::Storage,
};

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Event log operations required by the pipeline.
///
/// Every transition out of `pending` or into `processing` is conditional:
/// the `Option`/`bool` results report whether this caller won.
pub trait EventStorage: Send + Sync + 'static {
    /// Inserts the event or bumps the duplicate counter of the stored one.
    fn insert_if_absent(&self, event: NewWebhookEvent) -> StorageFuture<'_, InsertOutcome>;

    /// Loads an event by id.
    fn find(&self, event_id: EventId) -> StorageFuture<'_, Option<WebhookEvent>>;

    /// Claims a `pending` event for its first attempt and starts its lease.
    fn claim_pending(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<WebhookEvent>>;

    /// Claims a settled, non-ignored event for replay and counts the retry.
    ///
    /// Only succeeds while the stored `retry_count` equals `expected_retries`.
    fn claim_for_replay(
        &self,
        event_id: EventId,
        expected_retries: i32,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<WebhookEvent>>;

    /// Moves a `processing` event to `processed`.
    fn mark_processed(
        &self,
        event_id: EventId,
        related: Option<RelatedEntity>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Moves a `processing` event to `failed`.
    fn mark_failed(
        &self,
        event_id: EventId,
        code: FailureCode,
        message: String,
    ) -> StorageFuture<'_, bool>;

    /// Stamps `reviewed_at` after a no-op safe replay.
    fn mark_reviewed(
        &self,
        event_id: EventId,
        related: Option<RelatedEntity>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<WebhookEvent>>;

    /// Ignores an event that is neither ignored nor in flight.
    fn ignore(
        &self,
        event_id: EventId,
        user_id: String,
        note: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<WebhookEvent>>;

    /// Lists events for a normalized filter.
    fn list(&self, filter: EventFilter) -> StorageFuture<'_, EventPage>;

    /// Aggregates counts.
    fn summary(&self) -> StorageFuture<'_, EventSummary>;

    /// Finds `pending` events received before `cutoff`.
    fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<EventId>>;

    /// Returns `processing` events claimed before `cutoff` to `pending`.
    fn release_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<EventId>>;

    /// Verifies the store answers.
    fn health_check(&self) -> StorageFuture<'_, ()>;
}

/// Delayed job operations required by the scheduler.
pub trait JobStorage: Send + Sync + 'static {
    /// Schedules a job, or returns the one already waiting for its key.
    fn schedule(&self, job: NewScheduledJob, now: DateTime<Utc>) -> StorageFuture<'_, ScheduledJob>;

    /// Cancels the waiting job for a key.
    fn cancel(
        &self,
        kind: String,
        entity: RelatedEntity,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Claims due jobs and marks them running.
    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> StorageFuture<'_, Vec<ScheduledJob>>;

    /// Marks a running job completed; `false` if it was no longer running.
    fn complete(&self, id: JobId, now: DateTime<Utc>) -> StorageFuture<'_, bool>;

    /// Records a failed execution, rescheduling it for `retry_at` when given.
    fn fail(
        &self,
        id: JobId,
        error: String,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<JobStatus>>;

    /// Finds `running` jobs last touched before `cutoff`.
    fn find_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<ScheduledJob>>;

    /// Lists jobs recorded for an entity.
    fn find_for_entity(&self, entity: RelatedEntity) -> StorageFuture<'_, Vec<ScheduledJob>>;
}

fn limit_to_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Production event storage backed by PostgreSQL.
pub struct PostgresEventStorage {
    storage: Arc<Storage>,
}

impl PostgresEventStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl EventStorage for PostgresEventStorage {
    fn insert_if_absent(&self, event: NewWebhookEvent) -> StorageFuture<'_, InsertOutcome> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.insert_if_absent(&event).await })
    }

    fn find(&self, event_id: EventId) -> StorageFuture<'_, Option<WebhookEvent>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.find(&event_id).await })
    }

    fn claim_pending(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<WebhookEvent>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.claim_pending(&event_id, now).await })
    }

    fn claim_for_replay(
        &self,
        event_id: EventId,
        expected_retries: i32,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<WebhookEvent>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.webhook_events.claim_for_replay(&event_id, expected_retries, now).await
        })
    }

    fn mark_processed(
        &self,
        event_id: EventId,
        related: Option<RelatedEntity>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.webhook_events.mark_processed(&event_id, related.as_ref(), now).await
        })
    }

    fn mark_failed(
        &self,
        event_id: EventId,
        code: FailureCode,
        message: String,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.mark_failed(&event_id, code, &message).await })
    }

    fn mark_reviewed(
        &self,
        event_id: EventId,
        related: Option<RelatedEntity>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<WebhookEvent>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.webhook_events.mark_reviewed(&event_id, related.as_ref(), now).await
        })
    }

    fn ignore(
        &self,
        event_id: EventId,
        user_id: String,
        note: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<WebhookEvent>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.ignore(&event_id, &user_id, &note, now).await })
    }

    fn list(&self, filter: EventFilter) -> StorageFuture<'_, EventPage> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.list(&filter).await })
    }

    fn summary(&self) -> StorageFuture<'_, EventSummary> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_events.summary().await })
    }

    fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<EventId>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.webhook_events.find_stale_pending(cutoff, limit_to_i64(limit)).await
        })
    }

    fn release_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<EventId>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.webhook_events.release_stale_processing(cutoff, limit_to_i64(limit)).await
        })
    }

    fn health_check(&self) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.health_check().await })
    }
}

/// Production job storage backed by PostgreSQL.
pub struct PostgresJobStorage {
    storage: Arc<Storage>,
}

impl PostgresJobStorage {
    /// Creates a new PostgreSQL job storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl JobStorage for PostgresJobStorage {
    fn schedule(&self, job: NewScheduledJob, now: DateTime<Utc>) -> StorageFuture<'_, ScheduledJob> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduled_jobs.schedule(&job, now).await })
    }

    fn cancel(
        &self,
        kind: String,
        entity: RelatedEntity,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduled_jobs.cancel(&kind, &entity, now).await })
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> StorageFuture<'_, Vec<ScheduledJob>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduled_jobs.claim_due(now, limit_to_i64(limit)).await })
    }

    fn complete(&self, id: JobId, now: DateTime<Utc>) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduled_jobs.complete(id, now).await })
    }

    fn fail(
        &self,
        id: JobId,
        error: String,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<JobStatus>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduled_jobs.fail(id, &error, retry_at, now).await })
    }

    fn find_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<ScheduledJob>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.scheduled_jobs.find_stale_running(cutoff, limit_to_i64(limit)).await
        })
    }

    fn find_for_entity(&self, entity: RelatedEntity) -> StorageFuture<'_, Vec<ScheduledJob>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduled_jobs.find_for_entity(&entity).await })
    }
}

pub mod mock {
    //! In-memory storage for tests.
    //!
    //! Each conditional transition runs under a single write lock, which gives
    //! the same winner-takes-all behavior as the PostgreSQL `UPDATE ... WHERE`.
    //! Transient failures can be injected into inserts and into the
    //! completion writes that end an attempt.

    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use hookguard_core::{
        error::CoreError,
        models::{EventStatus, JobStatus},
        query::Pagination,
    };
    use tokio::sync::RwLock;

    use super::{
        EventFilter, EventId, EventPage, EventStorage, EventSummary, FailureCode, InsertOutcome,
        JobId, JobStorage, NewScheduledJob, NewWebhookEvent, RelatedEntity, ScheduledJob,
        StorageFuture, WebhookEvent,
    };

    /// In-memory event log.
    #[derive(Default)]
    pub struct MockEventStorage {
        events: Arc<RwLock<HashMap<EventId, WebhookEvent>>>,
        unavailable_inserts: Arc<AtomicUsize>,
        unavailable_completions: Arc<AtomicUsize>,
        insert_attempts: Arc<AtomicUsize>,
    }

    impl MockEventStorage {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next `count` inserts fail as if the store were down.
        pub fn fail_next_inserts(&self, count: usize) {
            self.unavailable_inserts.store(count, Ordering::SeqCst);
        }

        /// Makes the next `count` `mark_processed`/`mark_failed` calls fail
        /// as if the store went down after the claim.
        pub fn fail_next_completions(&self, count: usize) {
            self.unavailable_completions.store(count, Ordering::SeqCst);
        }

        /// Number of insert attempts seen, including failed ones.
        pub fn insert_attempts(&self) -> usize {
            self.insert_attempts.load(Ordering::SeqCst)
        }

        /// Stores an event as-is, bypassing deduplication.
        pub async fn seed(&self, event: WebhookEvent) {
            self.events.write().await.insert(event.event_id.clone(), event);
        }

        /// Number of stored rows.
        pub async fn len(&self) -> usize {
            self.events.read().await.len()
        }

        /// Whether the store holds no rows.
        pub async fn is_empty(&self) -> bool {
            self.events.read().await.is_empty()
        }

        /// Snapshot of one row.
        pub async fn get(&self, event_id: &EventId) -> Option<WebhookEvent> {
            self.events.read().await.get(event_id).cloned()
        }

        fn take_injected_failure(counter: &AtomicUsize) -> bool {
            counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
        }

        fn completion_outage(&self) -> Result<(), CoreError> {
            if Self::take_injected_failure(&self.unavailable_completions) {
                return Err(CoreError::Unavailable("injected store outage".to_string()));
            }
            Ok(())
        }
    }

    impl EventStorage for MockEventStorage {
        fn insert_if_absent(&self, event: NewWebhookEvent) -> StorageFuture<'_, InsertOutcome> {
            Box::pin(async move {
                self.insert_attempts.fetch_add(1, Ordering::SeqCst);
                if Self::take_injected_failure(&self.unavailable_inserts) {
                    return Err(CoreError::Unavailable("injected store outage".to_string()));
                }

                let mut events = self.events.write().await;
                if let Some(existing) = events.get_mut(&event.event_id) {
                    existing.duplicate_count += 1;
                    existing.last_duplicate_at = Some(event.received_at);
                    return Ok(InsertOutcome::Duplicate(existing.clone()));
                }
                let stored = WebhookEvent::from_new(event);
                events.insert(stored.event_id.clone(), stored.clone());
                Ok(InsertOutcome::Inserted(stored))
            })
        }

        fn find(&self, event_id: EventId) -> StorageFuture<'_, Option<WebhookEvent>> {
            Box::pin(async move { Ok(self.events.read().await.get(&event_id).cloned()) })
        }

        fn claim_pending(
            &self,
            event_id: EventId,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<WebhookEvent>> {
            Box::pin(async move {
                let mut events = self.events.write().await;
                Ok(events
                    .get_mut(&event_id)
                    .filter(|e| e.status == EventStatus::Pending && !e.is_ignored())
                    .map(|e| {
                        e.status = EventStatus::Processing;
                        e.processing_started_at = Some(now);
                        e.clone()
                    }))
            })
        }

        fn claim_for_replay(
            &self,
            event_id: EventId,
            expected_retries: i32,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<WebhookEvent>> {
            Box::pin(async move {
                let mut events = self.events.write().await;
                Ok(events
                    .get_mut(&event_id)
                    .filter(|e| {
                        e.retry_count == expected_retries
                            && e.status.is_replayable()
                            && !e.is_ignored()
                    })
                    .map(|e| {
                        e.status = EventStatus::Processing;
                        e.processing_started_at = Some(now);
                        e.retry_count += 1;
                        e.last_retried_at = Some(now);
                        e.clone()
                    }))
            })
        }

        fn mark_processed(
            &self,
            event_id: EventId,
            related: Option<RelatedEntity>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                self.completion_outage()?;
                let mut events = self.events.write().await;
                match events.get_mut(&event_id) {
                    Some(e) if e.status == EventStatus::Processing => {
                        e.status = EventStatus::Processed;
                        e.processing_started_at = None;
                        e.processed_at = Some(now);
                        e.error_code = None;
                        e.error_message = None;
                        if related.is_some() {
                            e.related_entity = related;
                        }
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn mark_failed(
            &self,
            event_id: EventId,
            code: FailureCode,
            message: String,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                self.completion_outage()?;
                let mut events = self.events.write().await;
                match events.get_mut(&event_id) {
                    Some(e) if e.status == EventStatus::Processing => {
                        e.status = EventStatus::Failed;
                        e.processing_started_at = None;
                        e.error_code = Some(code);
                        e.error_message = Some(message);
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn mark_reviewed(
            &self,
            event_id: EventId,
            related: Option<RelatedEntity>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<WebhookEvent>> {
            Box::pin(async move {
                let mut events = self.events.write().await;
                Ok(events.get_mut(&event_id).map(|e| {
                    e.reviewed_at = Some(now);
                    if e.related_entity.is_none() {
                        e.related_entity = related;
                    }
                    e.clone()
                }))
            })
        }

        fn ignore(
            &self,
            event_id: EventId,
            user_id: String,
            note: String,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<WebhookEvent>> {
            Box::pin(async move {
                let mut events = self.events.write().await;
                Ok(events
                    .get_mut(&event_id)
                    .filter(|e| !e.is_ignored() && e.status != EventStatus::Processing)
                    .map(|e| {
                        e.ignored_at = Some(now);
                        e.ignored_by_user_id = Some(user_id);
                        e.ignore_note = Some(note);
                        e.clone()
                    }))
            })
        }

        fn list(&self, filter: EventFilter) -> StorageFuture<'_, EventPage> {
            Box::pin(async move {
                let events = self.events.read().await;
                let mut matching: Vec<WebhookEvent> =
                    events.values().filter(|e| filter.matches(e)).cloned().collect();
                matching.sort_by(|a, b| {
                    b.received_at.cmp(&a.received_at).then_with(|| a.event_id.cmp(&b.event_id))
                });

                let total = matching.len() as u64;
                let offset = usize::try_from(filter.offset()).unwrap_or(usize::MAX);
                let page = matching
                    .into_iter()
                    .skip(offset)
                    .take(filter.page_size as usize)
                    .collect();
                Ok(EventPage { events: page, pagination: Pagination::new(&filter, total) })
            })
        }

        fn summary(&self) -> StorageFuture<'_, EventSummary> {
            Box::pin(async move { Ok(EventSummary::from_events(self.events.read().await.values())) })
        }

        fn find_stale_pending(
            &self,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<EventId>> {
            Box::pin(async move {
                let events = self.events.read().await;
                let mut stale: Vec<&WebhookEvent> = events
                    .values()
                    .filter(|e| {
                        e.status == EventStatus::Pending && !e.is_ignored() && e.received_at < cutoff
                    })
                    .collect();
                stale.sort_by_key(|e| e.received_at);
                Ok(stale.into_iter().take(limit).map(|e| e.event_id.clone()).collect())
            })
        }

        fn release_stale_processing(
            &self,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<EventId>> {
            Box::pin(async move {
                let mut events = self.events.write().await;
                let lease_start = |e: &WebhookEvent| e.processing_started_at.unwrap_or(e.received_at);
                let mut stale: Vec<&mut WebhookEvent> = events
                    .values_mut()
                    .filter(|e| e.status == EventStatus::Processing && lease_start(e) < cutoff)
                    .collect();
                stale.sort_by_key(|e| lease_start(e));
                Ok(stale
                    .into_iter()
                    .take(limit)
                    .map(|e| {
                        e.status = EventStatus::Pending;
                        e.processing_started_at = None;
                        e.event_id.clone()
                    })
                    .collect())
            })
        }

        fn health_check(&self) -> StorageFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    /// In-memory delayed job table.
    #[derive(Default)]
    pub struct MockJobStorage {
        jobs: Arc<RwLock<Vec<ScheduledJob>>>,
    }

    impl MockJobStorage {
        /// Creates an empty job table.
        pub fn new() -> Self {
            Self::default()
        }

        /// Snapshot of every job.
        pub async fn all(&self) -> Vec<ScheduledJob> {
            self.jobs.read().await.clone()
        }
    }

    fn same_key(job: &ScheduledJob, kind: &str, entity: &RelatedEntity) -> bool {
        job.kind == kind && &job.entity == entity
    }

    impl JobStorage for MockJobStorage {
        fn schedule(
            &self,
            job: NewScheduledJob,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ScheduledJob> {
            Box::pin(async move {
                let mut jobs = self.jobs.write().await;
                if let Some(existing) = jobs
                    .iter()
                    .find(|j| j.status == JobStatus::Scheduled && same_key(j, &job.kind, &job.entity))
                {
                    return Ok(existing.clone());
                }
                let stored = ScheduledJob::from_new(job, now);
                jobs.push(stored.clone());
                Ok(stored)
            })
        }

        fn cancel(
            &self,
            kind: String,
            entity: RelatedEntity,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut cancelled = false;
                for job in self.jobs.write().await.iter_mut() {
                    if job.status == JobStatus::Scheduled && same_key(job, &kind, &entity) {
                        job.status = JobStatus::Cancelled;
                        job.updated_at = now;
                        cancelled = true;
                    }
                }
                Ok(cancelled)
            })
        }

        fn claim_due(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<ScheduledJob>> {
            Box::pin(async move {
                let mut jobs = self.jobs.write().await;
                let mut due: Vec<&mut ScheduledJob> = jobs
                    .iter_mut()
                    .filter(|j| j.status == JobStatus::Scheduled && j.run_at <= now)
                    .collect();
                due.sort_by_key(|j| j.run_at);
                Ok(due
                    .into_iter()
                    .take(limit)
                    .map(|job| {
                        job.status = JobStatus::Running;
                        job.attempts += 1;
                        job.updated_at = now;
                        job.clone()
                    })
                    .collect())
            })
        }

        fn complete(&self, id: JobId, now: DateTime<Utc>) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut jobs = self.jobs.write().await;
                match jobs.iter_mut().find(|j| j.id == id && j.status == JobStatus::Running) {
                    Some(job) => {
                        job.status = JobStatus::Completed;
                        job.updated_at = now;
                        Ok(true)
                    },
                    None => Ok(false),
                }
            })
        }

        fn fail(
            &self,
            id: JobId,
            error: String,
            retry_at: Option<DateTime<Utc>>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<JobStatus>> {
            Box::pin(async move {
                let mut jobs = self.jobs.write().await;
                let Some(index) =
                    jobs.iter().position(|j| j.id == id && j.status == JobStatus::Running)
                else {
                    return Ok(None);
                };
                let (kind, entity) = (jobs[index].kind.clone(), jobs[index].entity.clone());
                let key_taken = jobs
                    .iter()
                    .any(|j| j.status == JobStatus::Scheduled && same_key(j, &kind, &entity));

                let job = &mut jobs[index];
                match retry_at.filter(|_| !key_taken) {
                    Some(retry_at) => {
                        job.status = JobStatus::Scheduled;
                        job.run_at = retry_at;
                    },
                    None => job.status = JobStatus::Failed,
                }
                job.last_error = Some(error);
                job.updated_at = now;
                Ok(Some(job.status))
            })
        }

        fn find_stale_running(
            &self,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<ScheduledJob>> {
            Box::pin(async move {
                let jobs = self.jobs.read().await;
                let mut stale: Vec<ScheduledJob> = jobs
                    .iter()
                    .filter(|j| j.status == JobStatus::Running && j.updated_at < cutoff)
                    .cloned()
                    .collect();
                stale.sort_by_key(|j| j.updated_at);
                stale.truncate(limit);
                Ok(stale)
            })
        }

        fn find_for_entity(&self, entity: RelatedEntity) -> StorageFuture<'_, Vec<ScheduledJob>> {
            Box::pin(async move {
                let mut jobs: Vec<ScheduledJob> =
                    self.jobs.read().await.iter().filter(|j| j.entity == entity).cloned().collect();
                jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(jobs)
            })
        }
    }
}
