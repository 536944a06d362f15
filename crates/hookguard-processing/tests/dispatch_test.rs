//! Integration tests for handler dispatch and failure recording.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::Arc;

use hookguard_core::{EventStatus, FailureCode, RelatedEntity};
use hookguard_testing::{
    FailingHandler, NeverApplied, PanickingHandler, PayloadBuilder, TestEnv,
};

#[tokio::test]
async fn unknown_event_type_fails_as_unsupported() {
    let env = TestEnv::new();

    let outcome = env.deliver(&PayloadBuilder::new("evt_inv", "invoice_paid").build()).await.unwrap();

    assert_eq!(outcome.status, EventStatus::Failed);
    let event = env.event("evt_inv").await.unwrap();
    assert_eq!(event.error_code, Some(FailureCode::UnsupportedEventType));
    assert!(event.error_message.unwrap().contains("invoice_paid@1"));
}

#[tokio::test]
async fn unregistered_version_fails_as_unsupported() {
    let env = TestEnv::new();

    let payload = PayloadBuilder::quote_accepted("evt_v2", "P-1").version("2").build();
    let outcome = env.deliver(&payload).await.unwrap();

    assert_eq!(outcome.status, EventStatus::Failed);
    let event = env.event("evt_v2").await.unwrap();
    assert_eq!(event.version, "2");
    assert_eq!(event.error_code, Some(FailureCode::UnsupportedEventType));
}

#[tokio::test]
async fn numeric_version_selects_the_same_handler() {
    let env = TestEnv::new();

    let payload = PayloadBuilder::repair_requested("evt_num", "roof").version(1).build();
    let outcome = env.deliver(&payload).await.unwrap();

    assert_eq!(outcome.status, EventStatus::Processed);
    assert_eq!(env.event("evt_num").await.unwrap().version, "1");
}

#[tokio::test]
async fn missing_payload_field_is_a_handler_exception() {
    let env = TestEnv::new();

    let outcome = env.deliver(&PayloadBuilder::new("evt_nopid", "quote_accepted").build()).await.unwrap();

    assert_eq!(outcome.status, EventStatus::Failed);
    let event = env.event("evt_nopid").await.unwrap();
    assert_eq!(event.error_code, Some(FailureCode::HandlerException));
    assert!(event.error_message.unwrap().contains("purchase_id"));
    assert!(event.related_entity.is_none());
}

#[tokio::test]
async fn handler_error_is_recorded_and_truncated() {
    let long = "x".repeat(5000);
    let env = TestEnv::builder()
        .handler("payout_sent", "1", Arc::new(FailingHandler::new(long)), Arc::new(NeverApplied))
        .build();

    let outcome = env.deliver(&PayloadBuilder::new("evt_err", "payout_sent").build()).await.unwrap();

    assert_eq!(outcome.status, EventStatus::Failed);
    let event = env.event("evt_err").await.unwrap();
    assert_eq!(event.error_code, Some(FailureCode::HandlerException));
    let message = event.error_message.unwrap();
    assert_eq!(message.chars().count(), 1000);
    assert!(message.ends_with("..."));
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let env = TestEnv::builder()
        .handler("payout_sent", "1", Arc::new(PanickingHandler), Arc::new(NeverApplied))
        .build();

    let outcome = env.deliver(&PayloadBuilder::new("evt_panic", "payout_sent").build()).await.unwrap();

    assert_eq!(outcome.status, EventStatus::Failed);
    let event = env.event("evt_panic").await.unwrap();
    assert_eq!(event.error_code, Some(FailureCode::HandlerException));
    assert!(event.error_message.unwrap().contains("handler exploded"));

    // The service keeps working after the panic.
    let next = env.deliver(&PayloadBuilder::repair_requested("evt_after", "sink").build()).await.unwrap();
    assert_eq!(next.status, EventStatus::Processed);
}

#[tokio::test]
async fn notifier_failure_does_not_fail_the_event() {
    let env = TestEnv::new();
    env.notifier.set_failing(true);

    let outcome = env
        .deliver(&PayloadBuilder::quote_accepted("evt_quiet", "P-9").build())
        .await
        .unwrap();

    assert_eq!(outcome.status, EventStatus::Processed);
    let event = env.event("evt_quiet").await.unwrap();
    assert!(event.error_code.is_none());
    assert_eq!(event.related_entity, Some(RelatedEntity::Purchase("P-9".to_string())));
    assert!(env.notifier.sent().await.is_empty());
}

#[tokio::test]
async fn repair_request_creates_a_ticket_linked_to_the_event() {
    let env = TestEnv::new();

    env.deliver(&PayloadBuilder::repair_requested("evt_rep", "cracked tile").build())
        .await
        .unwrap();

    let tickets = env.repairs.all().await;
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].source_event_id, "evt_rep");
    assert_eq!(tickets[0].description, "cracked tile");

    let event = env.event("evt_rep").await.unwrap();
    assert_eq!(event.related_entity, Some(RelatedEntity::RepairTicket(tickets[0].id.clone())));
}
