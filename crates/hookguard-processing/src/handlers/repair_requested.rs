//! `repair_requested@1`: opens a repair ticket.
//!
//! Ticket creation is not idempotent on its own; the guard is what keeps
//! dispatch and safe replay from opening a second one. A force replay does.

use std::sync::Arc;

use async_trait::async_trait;
use hookguard_core::{Clock, RelatedEntity, WebhookEvent};

use super::{books::RepairBook, payload_str};
use crate::handler::{EventHandler, GuardVerdict, HandlerError, HandlerOutcome, IdempotencyGuard};

/// Opens a ticket for a repair request.
#[derive(Debug)]
pub struct RepairRequestedHandler {
    repairs: Arc<dyn RepairBook>,
    clock: Arc<dyn Clock>,
}

impl RepairRequestedHandler {
    /// Creates the handler.
    pub fn new(repairs: Arc<dyn RepairBook>, clock: Arc<dyn Clock>) -> Self {
        Self { repairs, clock }
    }
}

#[async_trait]
impl EventHandler for RepairRequestedHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<HandlerOutcome, HandlerError> {
        let description = payload_str(event, "description").unwrap_or_default();
        let ticket =
            self.repairs.create(&event.event_id, &description, self.clock.now_utc()).await?;

        Ok(HandlerOutcome::related(RelatedEntity::RepairTicket(ticket.id)))
    }
}

/// Applied when a ticket sourced from this event exists.
#[derive(Debug)]
pub struct RepairRequestedGuard {
    repairs: Arc<dyn RepairBook>,
}

impl RepairRequestedGuard {
    /// Creates the guard.
    pub fn new(repairs: Arc<dyn RepairBook>) -> Self {
        Self { repairs }
    }
}

#[async_trait]
impl IdempotencyGuard for RepairRequestedGuard {
    async fn check(&self, event: &WebhookEvent) -> Result<GuardVerdict, HandlerError> {
        let tickets = self.repairs.find_by_source_event(&event.event_id).await?;
        Ok(match tickets.into_iter().next() {
            Some(ticket) => GuardVerdict::Applied(RelatedEntity::RepairTicket(ticket.id)),
            None => GuardVerdict::NotApplied,
        })
    }
}
