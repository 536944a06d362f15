//! `quote_accepted@1`: marks the referenced purchase accepted.
//!
//! The acceptance is the critical mutation. The notification and the
//! delayed follow-up are best-effort and only reported on failure.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use hookguard_core::{Clock, RelatedEntity, WebhookEvent};
use serde_json::json;

use super::{books::PurchaseBook, books::PurchaseStatus, payload_str};
use crate::{
    handler::{EventHandler, GuardVerdict, HandlerError, HandlerOutcome, IdempotencyGuard},
    notifier::{Notification, Notifier},
    scheduler::{DelayedJobScheduler, PURCHASE_FOLLOW_UP},
};

/// Applies a quote acceptance.
#[derive(Debug)]
pub struct QuoteAcceptedHandler {
    purchases: Arc<dyn PurchaseBook>,
    notifier: Arc<dyn Notifier>,
    scheduler: Option<DelayedJobScheduler>,
    follow_up_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl QuoteAcceptedHandler {
    /// Creates the handler.
    pub fn new(
        purchases: Arc<dyn PurchaseBook>,
        notifier: Arc<dyn Notifier>,
        scheduler: Option<DelayedJobScheduler>,
        follow_up_delay: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { purchases, notifier, scheduler, follow_up_delay, clock }
    }
}

#[async_trait]
impl EventHandler for QuoteAcceptedHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<HandlerOutcome, HandlerError> {
        let purchase_id = payload_str(event, "purchase_id")
            .ok_or_else(|| HandlerError::missing_field("purchase_id"))?;
        let entity = RelatedEntity::Purchase(purchase_id.clone());

        let purchase =
            self.purchases.mark_accepted(&purchase_id, &event.event_id, self.clock.now_utc()).await?;

        let mut outcome = HandlerOutcome::related(entity.clone());

        let notification = Notification {
            kind: event.event_type.clone(),
            entity: Some(entity.clone()),
            message: format!("Quote for purchase {purchase_id} was accepted"),
            payload: json!({"event_id": event.event_id, "version": purchase.version}),
        };
        if let Err(error) = self.notifier.notify(&notification).await {
            outcome.side_effect_failures.push(format!("notification: {error}"));
        }

        if let Some(scheduler) = &self.scheduler {
            let payload = json!({"event_id": event.event_id, "purchase_id": purchase_id});
            if let Err(error) = scheduler
                .schedule(PURCHASE_FOLLOW_UP, entity, payload, self.follow_up_delay)
                .await
            {
                outcome.side_effect_failures.push(format!("follow-up scheduling: {error}"));
            }
        }

        Ok(outcome)
    }
}

/// Applied when the purchase is accepted with this event recorded on it.
#[derive(Debug)]
pub struct QuoteAcceptedGuard {
    purchases: Arc<dyn PurchaseBook>,
}

impl QuoteAcceptedGuard {
    /// Creates the guard.
    pub fn new(purchases: Arc<dyn PurchaseBook>) -> Self {
        Self { purchases }
    }
}

#[async_trait]
impl IdempotencyGuard for QuoteAcceptedGuard {
    async fn check(&self, event: &WebhookEvent) -> Result<GuardVerdict, HandlerError> {
        let purchase_id = payload_str(event, "purchase_id")
            .ok_or_else(|| HandlerError::missing_field("purchase_id"))?;

        let applied = self.purchases.find(&purchase_id).await?.is_some_and(|purchase| {
            purchase.status == PurchaseStatus::Accepted
                && purchase.accepted_event_id.as_deref() == Some(event.event_id.as_str())
        });

        Ok(if applied {
            GuardVerdict::Applied(RelatedEntity::Purchase(purchase_id))
        } else {
            GuardVerdict::NotApplied
        })
    }
}
