//! Idempotent schema creation run at startup.

use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS webhook_events (
        event_id TEXT PRIMARY KEY CHECK (length(event_id) BETWEEN 1 AND 255),
        event_type TEXT NOT NULL,
        version TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'processed', 'failed')),
        processing_started_at TIMESTAMPTZ,
        signature_valid BOOLEAN NOT NULL,
        signature_provided TEXT NOT NULL,
        signature_computed TEXT NOT NULL,
        source_ip TEXT,
        raw_payload JSONB NOT NULL,
        received_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ,
        error_code TEXT,
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_retried_at TIMESTAMPTZ,
        reviewed_at TIMESTAMPTZ,
        duplicate_count INTEGER NOT NULL DEFAULT 0,
        last_duplicate_at TIMESTAMPTZ,
        ignored_at TIMESTAMPTZ,
        ignored_by_user_id TEXT,
        ignore_note TEXT,
        related_entity_type TEXT,
        related_entity_id TEXT,
        CHECK (ignored_at IS NULL OR length(btrim(ignore_note)) > 0)
    )
    "#,
    r#"
    ALTER TABLE webhook_events ADD COLUMN IF NOT EXISTS processing_started_at TIMESTAMPTZ
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_webhook_events_status
    ON webhook_events (status, received_at DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_webhook_events_type
    ON webhook_events (event_type, received_at DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_webhook_events_open_failures
    ON webhook_events (received_at DESC)
    WHERE status = 'failed' AND ignored_at IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_jobs (
        id UUID PRIMARY KEY,
        kind TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        payload JSONB NOT NULL,
        run_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_scheduled_jobs_one_pending
    ON scheduled_jobs (kind, entity_type, entity_id)
    WHERE status = 'scheduled'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_due
    ON scheduled_jobs (run_at)
    WHERE status = 'scheduled'
    "#,
];

/// Applies every schema statement in order.
///
/// # Errors
///
/// Returns `CoreError` on the first failing statement.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
