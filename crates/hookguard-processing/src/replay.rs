//! Operator-driven re-processing of stored events.
//!
//! **Safe** consults the idempotency guard first and turns into a no-op when
//! the effect is already present. **Force** skips the guard and may create a
//! second business effect, so it only runs when the request carries a valid
//! confirmation token issued by an earlier, unconfirmed force request.
//!
//! Both modes claim the event with a conditional update on its status and
//! replay count before running. A second replay of the same id while one is
//! in flight is rejected, and a confirmation token is spent by the first
//! replay that runs after it was issued.

use std::sync::Arc;

use hookguard_core::{
    Clock, EventId, EventStatus, HookguardError, RelatedEntity, WebhookEvent,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    confirmation::{ConfirmationToken, ConfirmationTokens},
    dispatcher::{AttemptMode, AttemptReport, Dispatcher},
    handler::GuardVerdict,
    storage::EventStorage,
};

/// Replay flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Guarded; no-op if the effect is present.
    Safe,
    /// Unguarded; requires confirmation.
    Force,
}

/// Operator replay request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplayRequest {
    /// Replay flavor.
    pub mode: ReplayMode,
    /// Token from a previous unconfirmed force request.
    #[serde(default)]
    pub confirmation_token: Option<String>,
}

/// Result of a replay that ran or no-oped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayResult {
    /// Replayed event.
    pub event_id: EventId,
    /// Mode used.
    pub mode: ReplayMode,
    /// True when nothing was mutated.
    pub noop: bool,
    /// Event status afterwards.
    pub status: EventStatus,
    /// Human-readable summary.
    pub message: String,
    /// Entity recorded on the event.
    pub related_entity: Option<RelatedEntity>,
}

/// Replay answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The replay finished.
    Completed(ReplayResult),
    /// A force replay needs to be sent again with this token.
    ConfirmationRequired {
        /// Event awaiting confirmation.
        event_id: EventId,
        /// Token to send back.
        confirmation: ConfirmationToken,
    },
}

/// Executes safe and force replays.
#[derive(Clone)]
pub struct ReplayController {
    storage: Arc<dyn EventStorage>,
    dispatcher: Dispatcher,
    tokens: ConfirmationTokens,
    clock: Arc<dyn Clock>,
}

impl ReplayController {
    /// Creates a controller.
    pub fn new(
        storage: Arc<dyn EventStorage>,
        dispatcher: Dispatcher,
        tokens: ConfirmationTokens,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, dispatcher, tokens, clock }
    }

    /// Replays `event_id`.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown id
    /// - `AlreadyIgnored` for an ignored event
    /// - `ConcurrencyConflict` while the event is processing or the claim is lost
    /// - `SignatureInvalid` for a safe replay of an unverified event
    /// - `ConfirmationRequired` for a force replay with a bad, expired or
    ///   already spent token
    #[instrument(skip(self, request), fields(event_id = %event_id, mode = ?request.mode))]
    pub async fn replay(
        &self,
        event_id: &EventId,
        request: ReplayRequest,
    ) -> Result<ReplayOutcome, HookguardError> {
        let event = self.load_replayable(event_id).await?;

        match request.mode {
            ReplayMode::Safe => self.safe(event).await,
            ReplayMode::Force => self.force(event, request.confirmation_token.as_deref()).await,
        }
    }

    async fn safe(&self, event: WebhookEvent) -> Result<ReplayOutcome, HookguardError> {
        if !event.signature_valid {
            return Err(HookguardError::SignatureInvalid { event_id: event.event_id });
        }

        match self.dispatcher.check_guard(&event).await {
            Ok(Some(GuardVerdict::Applied(entity))) => {
                let reviewed = self
                    .storage
                    .mark_reviewed(event.event_id.clone(), Some(entity), self.clock.now_utc())
                    .await?;
                info!(event_id = %event.event_id, "safe replay found effect applied");
                let related_entity = reviewed.and_then(|e| e.related_entity);
                return Ok(ReplayOutcome::Completed(ReplayResult {
                    event_id: event.event_id,
                    mode: ReplayMode::Safe,
                    noop: true,
                    status: event.status,
                    message: "effect already applied; event marked reviewed".to_string(),
                    related_entity,
                }));
            },
            Ok(_) => {},
            Err(error) => {
                debug!(error = %error, "pre-claim guard check failed, attempt will record it");
            },
        }

        let claimed = self.claim(&event, ReplayMode::Safe).await?;
        let report = self.dispatcher.execute(claimed, AttemptMode::Guarded).await?;
        Ok(ReplayOutcome::Completed(result_from(report, ReplayMode::Safe)))
    }

    async fn force(
        &self,
        event: WebhookEvent,
        token: Option<&str>,
    ) -> Result<ReplayOutcome, HookguardError> {
        let now = self.clock.now_utc();
        let Some(token) = token else {
            let confirmation = self.tokens.issue(&event.event_id, event.retry_count, now);
            info!(event_id = %event.event_id, expires_at = %confirmation.expires_at, "force replay awaiting confirmation");
            return Ok(ReplayOutcome::ConfirmationRequired { event_id: event.event_id, confirmation });
        };

        if !self.tokens.verify(&event.event_id, event.retry_count, token, now) {
            return Err(HookguardError::ConfirmationRequired { event_id: event.event_id });
        }

        let claimed = self.claim(&event, ReplayMode::Force).await?;
        info!(event_id = %event.event_id, retry_count = claimed.retry_count, "confirmed force replay");
        let report = self.dispatcher.execute(claimed, AttemptMode::Forced).await?;
        Ok(ReplayOutcome::Completed(result_from(report, ReplayMode::Force)))
    }

    async fn load_replayable(&self, event_id: &EventId) -> Result<WebhookEvent, HookguardError> {
        let event = self
            .storage
            .find(event_id.clone())
            .await?
            .ok_or_else(|| HookguardError::NotFound { event_id: event_id.clone() })?;

        reject_unreplayable(&event)?;
        Ok(event)
    }

    /// Claims `event` as read, failing if it changed since.
    async fn claim(
        &self,
        event: &WebhookEvent,
        mode: ReplayMode,
    ) -> Result<WebhookEvent, HookguardError> {
        let event_id = &event.event_id;
        if let Some(claimed) = self
            .storage
            .claim_for_replay(event_id.clone(), event.retry_count, self.clock.now_utc())
            .await?
        {
            return Ok(claimed);
        }

        // Lost the race: report why from the current row.
        match self.storage.find(event_id.clone()).await? {
            None => Err(HookguardError::NotFound { event_id: event_id.clone() }),
            Some(current) => {
                reject_unreplayable(&current)?;
                if mode == ReplayMode::Force && current.retry_count != event.retry_count {
                    // Another replay ran after the token was checked.
                    return Err(HookguardError::ConfirmationRequired { event_id: event_id.clone() });
                }
                Err(HookguardError::ConcurrencyConflict {
                    event_id: event_id.clone(),
                    status: current.status,
                })
            },
        }
    }
}

fn reject_unreplayable(event: &WebhookEvent) -> Result<(), HookguardError> {
    if event.is_ignored() {
        return Err(HookguardError::AlreadyIgnored { event_id: event.event_id.clone() });
    }
    if !event.status.is_replayable() {
        return Err(HookguardError::ConcurrencyConflict {
            event_id: event.event_id.clone(),
            status: event.status,
        });
    }
    Ok(())
}

fn result_from(report: AttemptReport, mode: ReplayMode) -> ReplayResult {
    let message = match (&report.failure, report.already_applied) {
        (Some((code, message)), _) => format!("replay failed ({code}): {message}"),
        (None, true) => "effect already applied; event marked processed".to_string(),
        (None, false) if report.side_effect_failures.is_empty() => "event reprocessed".to_string(),
        (None, false) => format!(
            "event reprocessed with {} best-effort side effect failure(s)",
            report.side_effect_failures.len()
        ),
    };

    ReplayResult {
        event_id: report.event_id,
        mode,
        noop: report.already_applied,
        status: report.status,
        message,
        related_entity: report.related_entity,
    }
}
