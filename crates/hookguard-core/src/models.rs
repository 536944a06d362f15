//! Core domain models and strongly-typed identifiers.
//!
//! Defines the webhook event record, its processing lifecycle, the typed
//! back-reference to the business entity an event mutated, and the delayed
//! job record. Includes the sqlx encoding needed to persist each of them.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Maximum length of an externally supplied event id.
pub const MAX_EVENT_ID_LEN: usize = 255;

/// Maximum stored length of a failure message.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1000;

/// Schema version assumed when a payload does not carry one.
pub const DEFAULT_EVENT_VERSION: &str = "1";

/// Externally supplied event identifier.
///
/// This is the dedup anchor: the sender assigns it and every redelivery of
/// the same notification carries the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Parses an event id, rejecting blank or oversized values.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the trimmed id is empty or longer
    /// than [`MAX_EVENT_ID_LEN`].
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidInput("event_id must not be empty".to_string()));
        }
        if trimmed.len() > MAX_EVENT_ID_LEN {
            return Err(CoreError::InvalidInput(format!(
                "event_id exceeds {MAX_EVENT_ID_LEN} characters"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Borrowed string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(s))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Event processing status.
///
/// ```text
/// Pending -> Processing -> Processed
///                      \-> Failed -> (replay) Processing -> ...
/// ```
///
/// `Duplicate` is never the status of a stored row: it is the outcome
/// reported for a colliding delivery, tallied on the original row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Stored, not yet claimed by a dispatcher.
    Pending,

    /// Claimed by exactly one dispatcher or replay.
    Processing,

    /// Business effect applied.
    Processed,

    /// Last attempt failed; see `error_code`.
    Failed,

    /// A redelivery of an already stored event.
    Duplicate,
}

impl EventStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 5] =
        [Self::Pending, Self::Processing, Self::Processed, Self::Failed, Self::Duplicate];

    /// Database and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Duplicate => "duplicate",
        }
    }

    /// Statuses an operator may replay from.
    pub const fn is_replayable(self) -> bool {
        matches!(self, Self::Pending | Self::Failed | Self::Processed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "duplicate" => Ok(Self::Duplicate),
            other => Err(CoreError::InvalidInput(format!("invalid event status: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for EventStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse::<Self>()?)
    }
}

impl sqlx::Encode<'_, PgDb> for EventStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Why an event ended up in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// Signature did not verify at ingestion.
    SignatureInvalid,
    /// No handler for `(event_type, version)`.
    UnsupportedEventType,
    /// Handler or guard returned an error, or panicked.
    HandlerException,
}

impl FailureCode {
    /// Database and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SignatureInvalid => "signature_invalid",
            Self::UnsupportedEventType => "unsupported_event_type",
            Self::HandlerException => "handler_exception",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureCode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signature_invalid" => Ok(Self::SignatureInvalid),
            "unsupported_event_type" => Ok(Self::UnsupportedEventType),
            "handler_exception" => Ok(Self::HandlerException),
            other => Err(CoreError::InvalidInput(format!("invalid failure code: {other}"))),
        }
    }
}

/// Typed pointer to the business record an event mutated.
///
/// Persisted as a `(type, id)` text pair without a foreign key so the event
/// log never couples to the schemas of the modules it drives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RelatedEntity {
    /// A purchase / quote record.
    Purchase(String),
    /// A repair ticket.
    RepairTicket(String),
}

impl RelatedEntity {
    /// Stored discriminator.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Purchase(_) => "purchase",
            Self::RepairTicket(_) => "repair_ticket",
        }
    }

    /// Identifier within the entity kind.
    pub fn id(&self) -> &str {
        match self {
            Self::Purchase(id) | Self::RepairTicket(id) => id,
        }
    }

    /// Rebuilds the variant from its stored pair.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for an unknown kind or empty id.
    pub fn from_parts(kind: &str, id: &str) -> Result<Self, CoreError> {
        if id.is_empty() {
            return Err(CoreError::InvalidInput("related entity id is empty".to_string()));
        }
        match kind {
            "purchase" => Ok(Self::Purchase(id.to_string())),
            "repair_ticket" => Ok(Self::RepairTicket(id.to_string())),
            other => Err(CoreError::InvalidInput(format!("unknown related entity type: {other}"))),
        }
    }

    fn from_columns(
        kind: Option<String>,
        id: Option<String>,
    ) -> Result<Option<Self>, CoreError> {
        match (kind, id) {
            (Some(kind), Some(id)) => Self::from_parts(&kind, &id).map(Some),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for RelatedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// A stored inbound notification.
///
/// One row per `event_id`, never deleted. Signature fields are written once
/// at ingestion; lifecycle fields are owned by the dispatcher until the first
/// attempt finishes and by operator actions afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// External dedup key.
    pub event_id: EventId,

    /// Event type, e.g. `quote_accepted`.
    pub event_type: String,

    /// Payload schema version.
    pub version: String,

    /// Current processing status.
    pub status: EventStatus,

    /// When the current `processing` claim was taken. A claim older than the
    /// lease may be released by the sweeper.
    pub processing_started_at: Option<DateTime<Utc>>,

    /// Whether the signature verified at ingestion. Never updated.
    pub signature_valid: bool,

    /// Signature exactly as supplied by the sender.
    pub signature_provided: String,

    /// Signature computed with the active secret.
    pub signature_computed: String,

    /// Address the delivery came from, when known.
    pub source_ip: Option<String>,

    /// Payload document exactly as received.
    pub raw_payload: serde_json::Value,

    /// When the first delivery was stored.
    pub received_at: DateTime<Utc>,

    /// When the business effect was last applied.
    pub processed_at: Option<DateTime<Utc>>,

    /// Why the last attempt failed.
    pub error_code: Option<FailureCode>,

    /// Truncated failure description.
    pub error_message: Option<String>,

    /// Number of replays executed.
    pub retry_count: i32,

    /// When the last replay started.
    pub last_retried_at: Option<DateTime<Utc>>,

    /// When an operator's safe replay found the effect already applied.
    pub reviewed_at: Option<DateTime<Utc>>,

    /// Number of redeliveries absorbed by deduplication.
    pub duplicate_count: i32,

    /// When the latest redelivery arrived.
    pub last_duplicate_at: Option<DateTime<Utc>>,

    /// When an operator ignored the event.
    pub ignored_at: Option<DateTime<Utc>>,

    /// Operator who ignored the event.
    pub ignored_by_user_id: Option<String>,

    /// Mandatory explanation recorded with the ignore.
    pub ignore_note: Option<String>,

    /// Business record the event mutated.
    pub related_entity: Option<RelatedEntity>,
}

impl WebhookEvent {
    /// Builds the initial `Pending` record for a freshly accepted delivery.
    pub fn from_new(new: NewWebhookEvent) -> Self {
        Self {
            event_id: new.event_id,
            event_type: new.event_type,
            version: new.version,
            status: EventStatus::Pending,
            processing_started_at: None,
            signature_valid: new.signature_valid,
            signature_provided: new.signature_provided,
            signature_computed: new.signature_computed,
            source_ip: new.source_ip,
            raw_payload: new.raw_payload,
            received_at: new.received_at,
            processed_at: None,
            error_code: None,
            error_message: None,
            retry_count: 0,
            last_retried_at: None,
            reviewed_at: None,
            duplicate_count: 0,
            last_duplicate_at: None,
            ignored_at: None,
            ignored_by_user_id: None,
            ignore_note: None,
            related_entity: None,
        }
    }

    /// Whether an operator has ignored this event.
    pub fn is_ignored(&self) -> bool {
        self.ignored_at.is_some()
    }

    /// Failed and not ignored: the event still needs operator attention.
    pub fn is_open_failure(&self) -> bool {
        self.status == EventStatus::Failed && !self.is_ignored()
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for WebhookEvent {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let payload: sqlx::types::Json<serde_json::Value> = row.try_get("raw_payload")?;
        let error_code: Option<String> = row.try_get("error_code")?;
        let error_code = error_code
            .map(|code| code.parse::<FailureCode>())
            .transpose()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let related_entity = RelatedEntity::from_columns(
            row.try_get("related_entity_type")?,
            row.try_get("related_entity_id")?,
        )
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(Self {
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            version: row.try_get("version")?,
            status: row.try_get("status")?,
            processing_started_at: row.try_get("processing_started_at")?,
            signature_valid: row.try_get("signature_valid")?,
            signature_provided: row.try_get("signature_provided")?,
            signature_computed: row.try_get("signature_computed")?,
            source_ip: row.try_get("source_ip")?,
            raw_payload: payload.0,
            received_at: row.try_get("received_at")?,
            processed_at: row.try_get("processed_at")?,
            error_code,
            error_message: row.try_get("error_message")?,
            retry_count: row.try_get("retry_count")?,
            last_retried_at: row.try_get("last_retried_at")?,
            reviewed_at: row.try_get("reviewed_at")?,
            duplicate_count: row.try_get("duplicate_count")?,
            last_duplicate_at: row.try_get("last_duplicate_at")?,
            ignored_at: row.try_get("ignored_at")?,
            ignored_by_user_id: row.try_get("ignored_by_user_id")?,
            ignore_note: row.try_get("ignore_note")?,
            related_entity,
        })
    }
}

/// Fields captured at ingestion, before the row exists.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWebhookEvent {
    /// External dedup key.
    pub event_id: EventId,
    /// Event type.
    pub event_type: String,
    /// Payload schema version.
    pub version: String,
    /// Verification result.
    pub signature_valid: bool,
    /// Signature as supplied.
    pub signature_provided: String,
    /// Signature computed with the active secret.
    pub signature_computed: String,
    /// Sender address.
    pub source_ip: Option<String>,
    /// Payload document.
    pub raw_payload: serde_json::Value,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
}

/// Result of an insert keyed by `event_id`.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// This delivery created the row and owns its first processing attempt.
    Inserted(WebhookEvent),
    /// A row already existed; its duplicate counter was bumped.
    Duplicate(WebhookEvent),
}

/// Truncates a failure message to [`MAX_ERROR_MESSAGE_LEN`] characters.
pub fn truncate_error_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(MAX_ERROR_MESSAGE_LEN - 3).collect();
    truncated.push_str("...");
    truncated
}

/// Strongly-typed scheduled job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delayed job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at`.
    Scheduled,
    /// Claimed by a runner.
    Running,
    /// Executed successfully.
    Completed,
    /// Undone before it ran.
    Cancelled,
    /// Execution failed.
    Failed,
}

impl JobStatus {
    /// Database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidInput(format!("invalid job status: {other}"))),
        }
    }
}

/// A durable "run this later unless undone" record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Job identifier.
    pub id: JobId,
    /// What to run, e.g. `purchase_follow_up`.
    pub kind: String,
    /// Entity the job is keyed by.
    pub entity: RelatedEntity,
    /// Executor input.
    pub payload: serde_json::Value,
    /// Earliest execution time.
    pub run_at: DateTime<Utc>,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Executions started.
    pub attempts: i32,
    /// Last execution error.
    pub last_error: Option<String>,
    /// When the job was scheduled.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ScheduledJob {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let entity_type: String = row.try_get("entity_type")?;
        let entity_id: String = row.try_get("entity_id")?;
        let entity = RelatedEntity::from_parts(&entity_type, &entity_id)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let status: String = row.try_get("status")?;
        let status = status.parse::<JobStatus>().map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let payload: sqlx::types::Json<serde_json::Value> = row.try_get("payload")?;

        Ok(Self {
            id: JobId(row.try_get("id")?),
            kind: row.try_get("kind")?,
            entity,
            payload: payload.0,
            run_at: row.try_get("run_at")?,
            status,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Request to schedule a delayed job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewScheduledJob {
    /// What to run.
    pub kind: String,
    /// Entity key; at most one scheduled job per `(kind, entity)`.
    pub entity: RelatedEntity,
    /// Executor input.
    pub payload: serde_json::Value,
    /// Earliest execution time.
    pub run_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Builds the initial `Scheduled` record.
    pub fn from_new(new: NewScheduledJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind: new.kind,
            entity: new.entity,
            payload: new.payload,
            run_at: new.run_at,
            status: JobStatus::Scheduled,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
