//! Reference handlers shipped with the service.
//!
//! They exercise the pipeline end to end against narrow collaborator
//! traits; real deployments point those traits at the business modules.

use std::{sync::Arc, time::Duration};

use hookguard_core::{Clock, WebhookEvent};

pub mod books;
pub mod quote_accepted;
pub mod repair_requested;

use crate::{handler::HandlerRegistry, notifier::Notifier, scheduler::DelayedJobScheduler};

/// Event type accepted quotes arrive with.
pub const QUOTE_ACCEPTED: &str = "quote_accepted";

/// Event type repair requests arrive with.
pub const REPAIR_REQUESTED: &str = "repair_requested";

/// Collaborators the reference handlers need.
#[derive(Debug, Clone)]
pub struct ReferenceCollaborators {
    /// Purchase module.
    pub purchases: Arc<dyn books::PurchaseBook>,
    /// Repair module.
    pub repairs: Arc<dyn books::RepairBook>,
    /// Outbound notifications.
    pub notifier: Arc<dyn Notifier>,
    /// Delayed follow-ups; `None` disables them.
    pub scheduler: Option<DelayedJobScheduler>,
    /// Delay before the purchase follow-up fires.
    pub follow_up_delay: Duration,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Registers `quote_accepted@1` and `repair_requested@1`.
pub fn register_reference_handlers(
    registry: &mut HandlerRegistry,
    collaborators: &ReferenceCollaborators,
) {
    registry.register(
        QUOTE_ACCEPTED,
        "1",
        Arc::new(quote_accepted::QuoteAcceptedHandler::new(
            collaborators.purchases.clone(),
            collaborators.notifier.clone(),
            collaborators.scheduler.clone(),
            collaborators.follow_up_delay,
            collaborators.clock.clone(),
        )),
        Arc::new(quote_accepted::QuoteAcceptedGuard::new(collaborators.purchases.clone())),
    );
    registry.register(
        REPAIR_REQUESTED,
        "1",
        Arc::new(repair_requested::RepairRequestedHandler::new(
            collaborators.repairs.clone(),
            collaborators.clock.clone(),
        )),
        Arc::new(repair_requested::RepairRequestedGuard::new(collaborators.repairs.clone())),
    );
}

/// Reads a string field from `data.<field>`, falling back to the top level.
pub(crate) fn payload_str(event: &WebhookEvent, field: &str) -> Option<String> {
    let payload = &event.raw_payload;
    payload
        .get("data")
        .and_then(|data| data.get(field))
        .or_else(|| payload.get(field))
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use hookguard_core::{EventId, NewWebhookEvent};
    use serde_json::json;

    use super::*;

    fn event_with(payload: serde_json::Value) -> WebhookEvent {
        WebhookEvent::from_new(NewWebhookEvent {
            event_id: EventId::from("evt_1"),
            event_type: QUOTE_ACCEPTED.to_string(),
            version: "1".to_string(),
            signature_valid: true,
            signature_provided: String::new(),
            signature_computed: String::new(),
            source_ip: None,
            raw_payload: payload,
            received_at: Utc::now(),
        })
    }

    #[test]
    fn payload_fields_prefer_data_object() {
        let event = event_with(json!({"purchase_id": "TOP", "data": {"purchase_id": "P1"}}));
        assert_eq!(payload_str(&event, "purchase_id").as_deref(), Some("P1"));

        let event = event_with(json!({"purchase_id": "P2"}));
        assert_eq!(payload_str(&event, "purchase_id").as_deref(), Some("P2"));

        let event = event_with(json!({"data": {"purchase_id": 7}}));
        assert_eq!(payload_str(&event, "purchase_id"), None);

        let event = event_with(json!({"data": {"purchase_id": "  "}}));
        assert_eq!(payload_str(&event, "purchase_id"), None);
    }
}
