//! Inbound delivery intake: verify, store once, dispatch.
//!
//! The signature is checked over the raw bytes before anything is parsed,
//! but an invalid signature does not reject the delivery. The event is
//! stored with `signature_valid = false` and dispatch fails it, so the
//! attempt stays visible to operators.

use std::{sync::Arc, time::Duration};

use hookguard_core::{
    models::DEFAULT_EVENT_VERSION, Clock, EventId, EventStatus, HookguardError, InsertOutcome,
    NewWebhookEvent,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::{dispatcher::Dispatcher, signature::SignatureVerifier, storage::EventStorage};

/// One delivery as received.
#[derive(Debug, Clone, Copy)]
pub struct IncomingDelivery<'a> {
    /// Body bytes exactly as received.
    pub body: &'a [u8],
    /// Signature header value.
    pub signature: Option<&'a str>,
    /// Sender address.
    pub source_ip: Option<&'a str>,
}

/// Result reported back to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// Event id from the payload.
    pub event_id: EventId,
    /// `processed`, `failed`, `duplicate`, or `pending`/`processing` when
    /// the attempt did not finish inline.
    pub status: EventStatus,
}

/// Bounded retry for transient store failures during insert.
#[derive(Debug, Clone, Copy)]
pub struct StoreRetry {
    /// Total insert attempts, at least one.
    pub attempts: u32,
    /// Base delay; attempt `n` waits `n * delay`.
    pub delay: Duration,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self { attempts: 3, delay: Duration::from_millis(100) }
    }
}

/// Envelope fields every delivery must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Dedup key.
    pub event_id: EventId,
    /// Handler selector.
    pub event_type: String,
    /// Schema version, `"1"` when absent.
    pub version: String,
}

/// Extracts the envelope from a parsed payload.
///
/// # Errors
///
/// Returns `HookguardError::Validation` naming the missing or malformed field.
pub fn parse_envelope(payload: &Value) -> Result<Envelope, HookguardError> {
    let object = payload
        .as_object()
        .ok_or_else(|| HookguardError::validation("payload must be a JSON object"))?;

    let event_id = object
        .get("event_id")
        .and_then(Value::as_str)
        .ok_or_else(|| HookguardError::validation("event_id is required"))?;
    let event_id =
        EventId::parse(event_id).map_err(|e| HookguardError::validation(e.to_string()))?;

    let event_type = object
        .get("event_type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| HookguardError::validation("event_type is required"))?
        .to_string();

    let version = match object.get("version") {
        None | Some(Value::Null) => DEFAULT_EVENT_VERSION.to_string(),
        Some(Value::String(v)) if !v.trim().is_empty() => v.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => return Err(HookguardError::validation("version must be a string or number")),
    };

    Ok(Envelope { event_id, event_type, version })
}

/// Verifies, stores and dispatches deliveries.
#[derive(Clone)]
pub struct Ingestor {
    storage: Arc<dyn EventStorage>,
    dispatcher: Dispatcher,
    verifier: SignatureVerifier,
    clock: Arc<dyn Clock>,
    retry: StoreRetry,
}

impl Ingestor {
    /// Creates an ingestor.
    pub fn new(
        storage: Arc<dyn EventStorage>,
        dispatcher: Dispatcher,
        verifier: SignatureVerifier,
        clock: Arc<dyn Clock>,
        retry: StoreRetry,
    ) -> Self {
        Self { storage, dispatcher, verifier, clock, retry }
    }

    /// Ingests one delivery.
    ///
    /// # Errors
    ///
    /// - `Validation` if the body is not JSON or lacks `event_id`/`event_type`
    /// - `StoreUnavailable` if the insert kept failing transiently
    /// - `Storage` for any other insert failure
    #[instrument(name = "ingest", skip_all, fields(event_id, event_type))]
    pub async fn ingest(&self, delivery: IncomingDelivery<'_>) -> Result<IngestOutcome, HookguardError> {
        let now = self.clock.now_utc();
        let check = self.verifier.verify(delivery.body, delivery.signature, now);

        let payload: Value = serde_json::from_slice(delivery.body)
            .map_err(|e| HookguardError::validation(format!("malformed JSON payload: {e}")))?;
        let envelope = parse_envelope(&payload)?;

        let span = tracing::Span::current();
        span.record("event_id", tracing::field::display(&envelope.event_id));
        span.record("event_type", envelope.event_type.as_str());

        if !check.valid {
            warn!(provided = %check.provided, "signature verification failed");
        }

        let new_event = NewWebhookEvent {
            event_id: envelope.event_id.clone(),
            event_type: envelope.event_type,
            version: envelope.version,
            signature_valid: check.valid,
            signature_provided: check.provided,
            signature_computed: check.computed,
            source_ip: delivery.source_ip.map(ToString::to_string),
            raw_payload: payload,
            received_at: now,
        };

        match self.insert_with_retry(new_event).await? {
            InsertOutcome::Duplicate(existing) => {
                info!(
                    duplicate_count = existing.duplicate_count,
                    stored_status = %existing.status,
                    "duplicate delivery absorbed"
                );
                Ok(IngestOutcome { event_id: envelope.event_id, status: EventStatus::Duplicate })
            },
            InsertOutcome::Inserted(event) => {
                info!(signature_valid = event.signature_valid, "event stored");
                let status = match self.dispatcher.dispatch(&event.event_id).await {
                    Ok(Some(report)) => report.status,
                    Ok(None) => EventStatus::Processing,
                    Err(error) => {
                        error!(error = %error, "dispatch failed after insert");
                        self.stored_status(&event.event_id).await
                    },
                };
                Ok(IngestOutcome { event_id: envelope.event_id, status })
            },
        }
    }

    /// Status as stored after an interrupted dispatch.
    ///
    /// A row left `processing` is released by the sweeper once its lease
    /// expires; a row still `pending` is picked up on the next sweep.
    async fn stored_status(&self, event_id: &EventId) -> EventStatus {
        match self.storage.find(event_id.clone()).await {
            Ok(Some(stored)) => {
                warn!(stored_status = %stored.status, "event left for the pending sweeper");
                stored.status
            },
            Ok(None) => EventStatus::Pending,
            Err(error) => {
                warn!(error = %error, "could not read back stored status");
                EventStatus::Processing
            },
        }
    }

    async fn insert_with_retry(&self, event: NewWebhookEvent) -> Result<InsertOutcome, HookguardError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.storage.insert_if_absent(event.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) if error.is_transient() && attempt < attempts => {
                    warn!(attempt, max_attempts = attempts, error = %error, "store unavailable, retrying insert");
                    self.clock.sleep(self.retry.delay.saturating_mul(attempt)).await;
                    attempt += 1;
                },
                Err(error) => {
                    error!(attempt, error = %error, "insert failed");
                    return Err(error.into());
                },
            }
        }
    }
}
