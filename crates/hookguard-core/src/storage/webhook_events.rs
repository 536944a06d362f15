//! Repository for the inbound event log.
//!
//! Deduplication rests on the primary key over `event_id`; the processing
//! lifecycle rests on conditional status updates. Neither needs an advisory
//! lock or in-process mutex.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::{
    error::Result,
    models::{EventId, EventStatus, FailureCode, InsertOutcome, NewWebhookEvent, RelatedEntity,
        WebhookEvent},
    query::{EventFilter, EventPage, EventSummary, Pagination},
};

const EVENT_COLUMNS: &str = "event_id, event_type, version, status, processing_started_at, \
     signature_valid, signature_provided, signature_computed, source_ip, raw_payload, \
     received_at, processed_at, error_code, error_message, retry_count, last_retried_at, \
     reviewed_at, duplicate_count, last_duplicate_at, ignored_at, ignored_by_user_id, \
     ignore_note, related_entity_type, related_entity_id";

/// Repository for webhook event database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts the event unless its id is already stored.
    ///
    /// A collision never touches the stored payload or lifecycle; it only
    /// bumps `duplicate_count` so the redelivery stays visible.
    ///
    /// # Errors
    ///
    /// Returns error if either statement fails.
    pub async fn insert_if_absent(&self, event: &NewWebhookEvent) -> Result<InsertOutcome> {
        let inserted = sqlx::query_as::<_, WebhookEvent>(&format!(
            r#"
            INSERT INTO webhook_events (
                event_id, event_type, version, status, signature_valid,
                signature_provided, signature_computed, source_ip, raw_payload, received_at
            ) VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, $9)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.version)
        .bind(event.signature_valid)
        .bind(&event.signature_provided)
        .bind(&event.signature_computed)
        .bind(&event.source_ip)
        .bind(sqlx::types::Json(&event.raw_payload))
        .bind(event.received_at)
        .fetch_optional(&*self.pool)
        .await?;

        if let Some(event) = inserted {
            return Ok(InsertOutcome::Inserted(event));
        }

        let existing = sqlx::query_as::<_, WebhookEvent>(&format!(
            r#"
            UPDATE webhook_events
            SET duplicate_count = duplicate_count + 1, last_duplicate_at = $2
            WHERE event_id = $1
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(&event.event_id)
        .bind(event.received_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(InsertOutcome::Duplicate(existing))
    }

    /// Finds an event by its external id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, event_id: &EventId) -> Result<Option<WebhookEvent>> {
        let event = sqlx::query_as::<_, WebhookEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events WHERE event_id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Moves a `pending` event to `processing` and starts its lease.
    ///
    /// Returns `None` when another dispatcher already claimed it or it was
    /// ignored in the meantime.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn claim_pending(
        &self,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>> {
        let event = sqlx::query_as::<_, WebhookEvent>(&format!(
            r#"
            UPDATE webhook_events
            SET status = 'processing', processing_started_at = $2
            WHERE event_id = $1 AND status = 'pending' AND ignored_at IS NULL
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event_id)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Claims a settled event for replay and counts the retry.
    ///
    /// The claim only succeeds while `retry_count` still equals
    /// `expected_retries`, so two replays prepared against the same row
    /// cannot both run.
    ///
    /// Returns `None` when the event is in flight, ignored, missing, or was
    /// replayed since it was read.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn claim_for_replay(
        &self,
        event_id: &EventId,
        expected_retries: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>> {
        let event = sqlx::query_as::<_, WebhookEvent>(&format!(
            r#"
            UPDATE webhook_events
            SET status = 'processing',
                processing_started_at = $3,
                retry_count = retry_count + 1,
                last_retried_at = $3
            WHERE event_id = $1
              AND retry_count = $2
              AND status IN ('pending', 'failed', 'processed')
              AND ignored_at IS NULL
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event_id)
        .bind(expected_retries)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Completes a `processing` event successfully.
    ///
    /// Keeps a previously known related entity when none is supplied.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_processed(
        &self,
        event_id: &EventId,
        related: Option<&RelatedEntity>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processed',
                processing_started_at = NULL,
                processed_at = $2,
                error_code = NULL,
                error_message = NULL,
                related_entity_type = COALESCE($3, related_entity_type),
                related_entity_id = COALESCE($4, related_entity_id)
            WHERE event_id = $1 AND status = 'processing'
            "#,
        )
        .bind(event_id)
        .bind(now)
        .bind(related.map(RelatedEntity::kind))
        .bind(related.map(RelatedEntity::id))
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Completes a `processing` event with a failure.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_failed(
        &self,
        event_id: &EventId,
        code: FailureCode,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'failed', processing_started_at = NULL,
                error_code = $2, error_message = $3
            WHERE event_id = $1 AND status = 'processing'
            "#,
        )
        .bind(event_id)
        .bind(code.as_str())
        .bind(message)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Records that a safe replay found the effect already applied.
    ///
    /// Fills in the related entity only if none was known.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_reviewed(
        &self,
        event_id: &EventId,
        related: Option<&RelatedEntity>,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>> {
        let event = sqlx::query_as::<_, WebhookEvent>(&format!(
            r#"
            UPDATE webhook_events
            SET reviewed_at = $2,
                related_entity_type = COALESCE(related_entity_type, $3),
                related_entity_id = COALESCE(related_entity_id, $4)
            WHERE event_id = $1
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event_id)
        .bind(now)
        .bind(related.map(RelatedEntity::kind))
        .bind(related.map(RelatedEntity::id))
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Ignores an event that is neither ignored nor in flight.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn ignore(
        &self,
        event_id: &EventId,
        user_id: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>> {
        let event = sqlx::query_as::<_, WebhookEvent>(&format!(
            r#"
            UPDATE webhook_events
            SET ignored_at = $2, ignored_by_user_id = $3, ignore_note = $4
            WHERE event_id = $1 AND ignored_at IS NULL AND status <> 'processing'
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(event_id)
        .bind(now)
        .bind(user_id)
        .bind(note)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Lists events matching the filter, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self, filter: &EventFilter) -> Result<EventPage> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM webhook_events");
        push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&*self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {EVENT_COLUMNS} FROM webhook_events"
        ));
        push_filter(&mut select, filter);
        select
            .push(" ORDER BY received_at DESC, event_id ASC LIMIT ")
            .push_bind(i64::from(filter.page_size))
            .push(" OFFSET ")
            .push_bind(i64::try_from(filter.offset()).unwrap_or(i64::MAX));
        let events = select.build_query_as::<WebhookEvent>().fetch_all(&*self.pool).await?;

        let total = u64::try_from(total).unwrap_or_default();
        Ok(EventPage { events, pagination: Pagination::new(filter, total) })
    }

    /// Aggregates counts by status and type.
    ///
    /// # Errors
    ///
    /// Returns error if any aggregate query fails.
    pub async fn summary(&self) -> Result<EventSummary> {
        let mut summary = EventSummary::empty();

        let by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM webhook_events GROUP BY status")
                .fetch_all(&*self.pool)
                .await?;
        for (status, count) in by_status {
            summary.by_status.insert(status, count);
        }

        let by_type: Vec<(String, i64)> =
            sqlx::query_as("SELECT event_type, COUNT(*) FROM webhook_events GROUP BY event_type")
                .fetch_all(&*self.pool)
                .await?;
        summary.by_event_type.extend(by_type);

        let (duplicates, open_failures, ignored): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(duplicate_count), 0)::BIGINT,
                COUNT(*) FILTER (WHERE status = 'failed' AND ignored_at IS NULL),
                COUNT(*) FILTER (WHERE ignored_at IS NOT NULL)
            FROM webhook_events
            "#,
        )
        .fetch_one(&*self.pool)
        .await?;
        summary.by_status.insert(EventStatus::Duplicate.to_string(), duplicates);
        summary.open_failures = open_failures;
        summary.ignored = ignored;

        Ok(summary)
    }

    /// Finds `pending` events received before `cutoff`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventId>> {
        let ids = sqlx::query_scalar::<_, EventId>(
            r#"
            SELECT event_id FROM webhook_events
            WHERE status = 'pending' AND ignored_at IS NULL AND received_at < $1
            ORDER BY received_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids)
    }

    /// Returns `processing` events whose lease started before `cutoff` to
    /// `pending`.
    ///
    /// A claim this old belongs to a dispatcher that crashed or lost its
    /// store connection before recording the outcome. Rows without a lease
    /// stamp fall back to `received_at`.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn release_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventId>> {
        let ids = sqlx::query_scalar::<_, EventId>(
            r#"
            UPDATE webhook_events
            SET status = 'pending', processing_started_at = NULL
            WHERE event_id IN (
                SELECT event_id FROM webhook_events
                WHERE status = 'processing'
                  AND COALESCE(processing_started_at, received_at) < $1
                ORDER BY COALESCE(processing_started_at, received_at) ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'processing'
            RETURNING event_id
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids)
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &EventFilter) {
    builder.push(" WHERE TRUE");
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(event_type) = &filter.event_type {
        builder.push(" AND event_type = ").push_bind(event_type.clone());
    }
    match filter.effective_ignored() {
        Some(true) => {
            builder.push(" AND ignored_at IS NOT NULL");
        },
        Some(false) => {
            builder.push(" AND ignored_at IS NULL");
        },
        None => {},
    }
    if let Some(q) = &filter.q {
        let pattern = format!("%{}%", escape_like(q));
        builder
            .push(" AND (event_id ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR event_type ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR related_entity_id ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR error_message ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR raw_payload::text ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
