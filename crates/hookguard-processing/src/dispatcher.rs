//! Drives one stored event through its handler.
//!
//! ```text
//! claim (pending -> processing)
//!   -> signature invalid?      -> failed(signature_invalid)
//!   -> no registration?        -> failed(unsupported_event_type)
//!   -> guard says applied?     -> processed(guard entity)
//!   -> handler Ok              -> processed(handler entity)
//!   -> handler Err or panic    -> failed(handler_exception)
//! ```
//!
//! Guard and handler run on a spawned task so a panic surfaces as a
//! `JoinError` instead of unwinding through the caller. `retry_count` is
//! never touched here; only replay claims count retries.

use std::sync::Arc;

use hookguard_core::{
    models::truncate_error_message, Clock, EventId, EventStatus, FailureCode, HookguardError,
    RelatedEntity, WebhookEvent,
};
use tokio::task::JoinError;
use tracing::{debug, info, instrument, warn};

use crate::{
    handler::{GuardVerdict, HandlerError, HandlerOutcome, HandlerRegistration, HandlerRegistry},
    storage::EventStorage,
};

/// How much of the pipeline an attempt runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptMode {
    /// Signature check, guard, then handler. Used by dispatch and safe replay.
    Guarded,
    /// Handler only. Used by confirmed force replay.
    Forced,
}

/// What one attempt did to a claimed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    /// Event the attempt ran for.
    pub event_id: EventId,
    /// Status after the attempt.
    pub status: EventStatus,
    /// Entity recorded on the event, if any.
    pub related_entity: Option<RelatedEntity>,
    /// The guard found the effect already applied; the handler did not run.
    pub already_applied: bool,
    /// Failure recorded on the event.
    pub failure: Option<(FailureCode, String)>,
    /// Best-effort side effects that failed.
    pub side_effect_failures: Vec<String>,
}

enum Step {
    AlreadyApplied(RelatedEntity),
    Handled(HandlerOutcome),
}

/// Runs stored events through their registered handlers.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Arc<dyn EventStorage>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        storage: Arc<dyn EventStorage>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, registry, clock }
    }

    /// Handler registry in use.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Claims a `pending` event and runs its first attempt.
    ///
    /// Returns `None` when another dispatcher already claimed it.
    ///
    /// # Errors
    ///
    /// Returns `HookguardError` only for storage failures; handler failures
    /// are recorded on the event.
    #[instrument(name = "dispatch", skip(self), fields(event_id = %event_id))]
    pub async fn dispatch(&self, event_id: &EventId) -> Result<Option<AttemptReport>, HookguardError> {
        let claimed = self.storage.claim_pending(event_id.clone(), self.clock.now_utc()).await?;
        let Some(event) = claimed else {
            debug!("claim lost, another dispatcher owns the event");
            return Ok(None);
        };

        self.execute(event, AttemptMode::Guarded).await.map(Some)
    }

    /// Runs one attempt for an event already moved to `processing`.
    ///
    /// # Errors
    ///
    /// Returns `HookguardError` only for storage failures.
    pub async fn execute(
        &self,
        event: WebhookEvent,
        mode: AttemptMode,
    ) -> Result<AttemptReport, HookguardError> {
        if mode == AttemptMode::Guarded && !event.signature_valid {
            return self
                .finish_failed(
                    &event,
                    FailureCode::SignatureInvalid,
                    "signature verification failed; only a confirmed force replay may process this event",
                )
                .await;
        }

        let Some(registration) = self.registry.get(&event.event_type, &event.version).cloned() else {
            let message = format!(
                "no handler registered for {}@{}",
                event.event_type, event.version
            );
            return self.finish_failed(&event, FailureCode::UnsupportedEventType, &message).await;
        };

        match run_isolated(registration, event.clone(), mode).await {
            Ok(Ok(Step::AlreadyApplied(entity))) => {
                info!(
                    event_id = %event.event_id,
                    related_entity = %entity,
                    "effect already applied, skipping handler"
                );
                self.finish_processed(&event, Some(entity), true, Vec::new()).await
            },
            Ok(Ok(Step::Handled(outcome))) => {
                for failure in &outcome.side_effect_failures {
                    warn!(event_id = %event.event_id, failure = %failure, "best-effort side effect failed");
                }
                self.finish_processed(
                    &event,
                    outcome.related_entity,
                    false,
                    outcome.side_effect_failures,
                )
                .await
            },
            Ok(Err(error)) => {
                self.finish_failed(&event, FailureCode::HandlerException, &error.to_string()).await
            },
            Err(join_error) => {
                let message = describe_join_error(join_error);
                self.finish_failed(&event, FailureCode::HandlerException, &message).await
            },
        }
    }

    /// Runs the guard outside of any claim.
    ///
    /// Returns `Ok(None)` when no handler is registered for the event.
    ///
    /// # Errors
    ///
    /// Returns the guard's error message, or a description of its panic.
    pub async fn check_guard(&self, event: &WebhookEvent) -> Result<Option<GuardVerdict>, String> {
        let Some(registration) = self.registry.get(&event.event_type, &event.version).cloned() else {
            return Ok(None);
        };
        let event = event.clone();
        match tokio::spawn(async move { registration.guard.check(&event).await }).await {
            Ok(Ok(verdict)) => Ok(Some(verdict)),
            Ok(Err(error)) => Err(error.to_string()),
            Err(join_error) => Err(describe_join_error(join_error)),
        }
    }

    async fn finish_processed(
        &self,
        event: &WebhookEvent,
        related_entity: Option<RelatedEntity>,
        already_applied: bool,
        side_effect_failures: Vec<String>,
    ) -> Result<AttemptReport, HookguardError> {
        let now = self.clock.now_utc();
        let updated = self
            .storage
            .mark_processed(event.event_id.clone(), related_entity.clone(), now)
            .await?;
        if !updated {
            warn!(event_id = %event.event_id, "event left processing before completion was recorded");
        }

        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            status = %EventStatus::Processed,
            "event processed"
        );

        Ok(AttemptReport {
            event_id: event.event_id.clone(),
            status: EventStatus::Processed,
            related_entity: related_entity.or_else(|| event.related_entity.clone()),
            already_applied,
            failure: None,
            side_effect_failures,
        })
    }

    async fn finish_failed(
        &self,
        event: &WebhookEvent,
        code: FailureCode,
        message: &str,
    ) -> Result<AttemptReport, HookguardError> {
        let message = truncate_error_message(message);
        let updated =
            self.storage.mark_failed(event.event_id.clone(), code, message.clone()).await?;
        if !updated {
            warn!(event_id = %event.event_id, "event left processing before failure was recorded");
        }

        warn!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            error_code = %code,
            error = %message,
            "event failed"
        );

        Ok(AttemptReport {
            event_id: event.event_id.clone(),
            status: EventStatus::Failed,
            related_entity: event.related_entity.clone(),
            already_applied: false,
            failure: Some((code, message)),
            side_effect_failures: Vec::new(),
        })
    }
}

async fn run_isolated(
    registration: HandlerRegistration,
    event: WebhookEvent,
    mode: AttemptMode,
) -> Result<Result<Step, HandlerError>, JoinError> {
    tokio::spawn(async move {
        if mode == AttemptMode::Guarded {
            if let GuardVerdict::Applied(entity) = registration.guard.check(&event).await? {
                return Ok(Step::AlreadyApplied(entity));
            }
        }
        registration.handler.handle(&event).await.map(Step::Handled)
    })
    .await
}

fn describe_join_error(error: JoinError) -> String {
    if !error.is_panic() {
        return "handler task was cancelled".to_string();
    }
    let payload = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("handler panicked: {detail}")
}
