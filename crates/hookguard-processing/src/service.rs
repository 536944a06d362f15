//! Operator and sender facing entry points over the event log.

use std::sync::Arc;

use hookguard_core::{
    Clock, EventFilter, EventId, EventPage, EventStatus, EventSummary, HookguardError,
    WebhookEvent,
};
use tracing::{info, instrument};

use crate::{
    confirmation::ConfirmationTokens,
    dispatcher::Dispatcher,
    handler::HandlerRegistry,
    ingest::{IncomingDelivery, IngestOutcome, Ingestor, StoreRetry},
    replay::{ReplayController, ReplayOutcome, ReplayRequest},
    signature::SignatureVerifier,
    storage::EventStorage,
};

/// Longest ignore note kept.
pub const MAX_IGNORE_NOTE_LEN: usize = 2000;

/// Everything needed to assemble an [`EventService`].
pub struct ServiceParts {
    /// Event log.
    pub storage: Arc<dyn EventStorage>,
    /// Handlers and guards.
    pub registry: Arc<HandlerRegistry>,
    /// Delivery signature check.
    pub verifier: SignatureVerifier,
    /// Force replay confirmation.
    pub tokens: ConfirmationTokens,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Insert retry policy.
    pub store_retry: StoreRetry,
}

/// Ingestion, replay, ignore and query over one event log.
#[derive(Clone)]
pub struct EventService {
    storage: Arc<dyn EventStorage>,
    dispatcher: Dispatcher,
    ingestor: Ingestor,
    replays: ReplayController,
    clock: Arc<dyn Clock>,
}

impl EventService {
    /// Wires the service from its parts.
    pub fn new(parts: ServiceParts) -> Self {
        let ServiceParts { storage, registry, verifier, tokens, clock, store_retry } = parts;
        let dispatcher = Dispatcher::new(storage.clone(), registry, clock.clone());
        let ingestor = Ingestor::new(
            storage.clone(),
            dispatcher.clone(),
            verifier,
            clock.clone(),
            store_retry,
        );
        let replays = ReplayController::new(storage.clone(), dispatcher.clone(), tokens, clock.clone());

        Self { storage, dispatcher, ingestor, replays, clock }
    }

    /// Dispatcher shared by ingestion, replay and the sweeper.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Event storage in use.
    pub fn storage(&self) -> Arc<dyn EventStorage> {
        self.storage.clone()
    }

    /// Time source shared with the workers.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// See [`Ingestor::ingest`].
    ///
    /// # Errors
    ///
    /// Propagates ingestion errors.
    pub async fn ingest(&self, delivery: IncomingDelivery<'_>) -> Result<IngestOutcome, HookguardError> {
        self.ingestor.ingest(delivery).await
    }

    /// See [`ReplayController::replay`].
    ///
    /// # Errors
    ///
    /// Propagates replay errors.
    pub async fn replay(
        &self,
        event_id: &EventId,
        request: ReplayRequest,
    ) -> Result<ReplayOutcome, HookguardError> {
        self.replays.replay(event_id, request).await
    }

    /// Permanently excludes an event from the open-failure queue.
    ///
    /// # Errors
    ///
    /// - `Validation` for a blank note
    /// - `NotFound` for an unknown id
    /// - `AlreadyIgnored` if it was ignored before
    /// - `ConcurrencyConflict` while the event is processing
    #[instrument(skip(self, note), fields(event_id = %event_id, user_id = %user_id))]
    pub async fn ignore(
        &self,
        event_id: &EventId,
        user_id: &str,
        note: &str,
    ) -> Result<WebhookEvent, HookguardError> {
        let note = note.trim();
        if note.is_empty() {
            return Err(HookguardError::validation("note is required to ignore an event"));
        }
        if note.chars().count() > MAX_IGNORE_NOTE_LEN {
            return Err(HookguardError::validation(format!(
                "note exceeds {MAX_IGNORE_NOTE_LEN} characters"
            )));
        }

        let current = self.detail(event_id).await?;
        check_ignorable(&current)?;

        let ignored = self
            .storage
            .ignore(event_id.clone(), user_id.to_string(), note.to_string(), self.clock.now_utc())
            .await?;

        match ignored {
            Some(event) => {
                info!(status = %event.status, "event ignored");
                Ok(event)
            },
            None => {
                let current = self.detail(event_id).await?;
                check_ignorable(&current)?;
                Err(HookguardError::ConcurrencyConflict {
                    event_id: event_id.clone(),
                    status: current.status,
                })
            },
        }
    }

    /// Filtered, paginated listing, newest first.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn list(&self, filter: EventFilter) -> Result<EventPage, HookguardError> {
        Ok(self.storage.list(filter.normalized()).await?)
    }

    /// Aggregate counts.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn summary(&self) -> Result<EventSummary, HookguardError> {
        Ok(self.storage.summary().await?)
    }

    /// Full stored record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub async fn detail(&self, event_id: &EventId) -> Result<WebhookEvent, HookguardError> {
        self.storage
            .find(event_id.clone())
            .await?
            .ok_or_else(|| HookguardError::NotFound { event_id: event_id.clone() })
    }

    /// Checks that the event store answers.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn health_check(&self) -> Result<(), HookguardError> {
        Ok(self.storage.health_check().await?)
    }
}

fn check_ignorable(event: &WebhookEvent) -> Result<(), HookguardError> {
    if event.is_ignored() {
        return Err(HookguardError::AlreadyIgnored { event_id: event.event_id.clone() });
    }
    if event.status == EventStatus::Processing {
        return Err(HookguardError::ConcurrencyConflict {
            event_id: event.event_id.clone(),
            status: event.status,
        });
    }
    Ok(())
}
