//! Integration tests for safe and force replay.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use hookguard_core::{
    Clock, EventId, EventStatus, FailureCode, HookguardError, NewWebhookEvent, RelatedEntity,
    WebhookEvent,
};
use hookguard_processing::{
    handlers::books::{PurchaseBook, PurchaseStatus},
    ReplayMode, ReplayOutcome, ReplayRequest,
};
use hookguard_testing::{fixtures, BlockingHandler, NeverApplied, PayloadBuilder, TestEnv};

fn failed_event(env: &TestEnv, payload: serde_json::Value) -> WebhookEvent {
    let event_id = payload["event_id"].as_str().unwrap().to_string();
    let event_type = payload["event_type"].as_str().unwrap().to_string();
    let mut event = WebhookEvent::from_new(NewWebhookEvent {
        event_id: EventId::from(event_id.as_str()),
        event_type,
        version: "1".to_string(),
        signature_valid: true,
        signature_provided: "sha256=00".to_string(),
        signature_computed: "00".to_string(),
        source_ip: None,
        raw_payload: payload,
        received_at: env.clock.now_utc(),
    });
    event.status = EventStatus::Failed;
    event.error_code = Some(FailureCode::HandlerException);
    event.error_message = Some("collaborator failed: purchase service timed out".to_string());
    event
}

fn force(token: Option<String>) -> ReplayRequest {
    ReplayRequest { mode: ReplayMode::Force, confirmation_token: token }
}

#[tokio::test]
async fn safe_replay_of_applied_event_is_a_noop() {
    let env = TestEnv::new();
    env.purchases.insert_quoted("P-1").await;
    env.deliver(&PayloadBuilder::quote_accepted("evt_001", "P-1").build()).await.unwrap();
    let before = env.purchases.find("P-1").await.unwrap().unwrap();

    let result = env.safe_replay("evt_001").await.unwrap();

    assert!(result.noop);
    assert_eq!(result.status, EventStatus::Processed);
    assert_eq!(result.related_entity, Some(RelatedEntity::Purchase("P-1".to_string())));

    let after = env.purchases.find("P-1").await.unwrap().unwrap();
    assert_eq!(after.version, before.version);

    let event = env.event("evt_001").await.unwrap();
    assert!(event.reviewed_at.is_some());
    assert_eq!(event.retry_count, 0);
    assert_eq!(env.notifier.sent().await.len(), 1);
}

#[tokio::test]
async fn safe_replay_reprocesses_a_failed_event_without_its_effect() {
    let env = TestEnv::new();
    env.events
        .seed(failed_event(&env, PayloadBuilder::quote_accepted("evt_retry", "P-7").build()))
        .await;

    let result = env.safe_replay("evt_retry").await.unwrap();

    assert!(!result.noop);
    assert_eq!(result.status, EventStatus::Processed);

    let event = env.event("evt_retry").await.unwrap();
    assert_eq!(event.status, EventStatus::Processed);
    assert_eq!(event.retry_count, 1);
    assert!(event.last_retried_at.is_some());
    assert!(event.error_code.is_none());
    assert!(event.error_message.is_none());

    let purchase = env.purchases.find("P-7").await.unwrap().unwrap();
    assert_eq!(purchase.status, PurchaseStatus::Accepted);
    assert_eq!(purchase.accepted_event_id.as_deref(), Some("evt_retry"));
}

#[tokio::test]
async fn safe_replay_detects_effect_applied_before_a_crash() {
    let env = TestEnv::new();
    env.events
        .seed(failed_event(&env, PayloadBuilder::quote_accepted("evt_crash", "P-8").build()))
        .await;
    env.purchases
        .mark_accepted("P-8", &EventId::from("evt_crash"), Utc::now())
        .await
        .unwrap();

    let result = env.safe_replay("evt_crash").await.unwrap();

    assert!(result.noop);
    let event = env.event("evt_crash").await.unwrap();
    assert!(event.reviewed_at.is_some());
    assert_eq!(event.retry_count, 0);
    assert_eq!(event.related_entity, Some(RelatedEntity::Purchase("P-8".to_string())));
    assert_eq!(env.purchases.find("P-8").await.unwrap().unwrap().version, 1);
}

#[tokio::test]
async fn safe_replay_refuses_unverified_events() {
    let env = TestEnv::new();
    let body = PayloadBuilder::repair_requested("evt_forged", "gate").body();
    env.deliver_raw(&body, Some(&fixtures::sign_with(&body, "wrong"))).await.unwrap();

    let err = env.safe_replay("evt_forged").await.unwrap_err();
    let err = err.downcast::<HookguardError>().unwrap();

    assert!(matches!(err, HookguardError::SignatureInvalid { .. }));
    assert!(env.repairs.all().await.is_empty());
}

#[tokio::test]
async fn force_replay_without_token_only_issues_a_confirmation() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::repair_requested("evt_f1", "boiler").build()).await.unwrap();

    let outcome = env.service.replay(&EventId::from("evt_f1"), force(None)).await.unwrap();

    let ReplayOutcome::ConfirmationRequired { event_id, confirmation } = outcome else {
        panic!("expected a confirmation request, got {outcome:?}");
    };
    assert_eq!(event_id.as_str(), "evt_f1");
    assert!(confirmation.expires_at > env.clock.now_utc());
    assert_eq!(env.event("evt_f1").await.unwrap().retry_count, 0);
    assert_eq!(env.repairs.all().await.len(), 1);
}

#[tokio::test]
async fn confirmed_force_replay_repeats_a_non_idempotent_effect() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::repair_requested("evt_f2", "boiler").build()).await.unwrap();

    let result = env.confirmed_force_replay("evt_f2").await.unwrap();

    assert!(!result.noop);
    assert_eq!(result.mode, ReplayMode::Force);
    assert_eq!(result.status, EventStatus::Processed);

    let tickets = env.repairs.all().await;
    assert_eq!(tickets.len(), 2);
    assert!(tickets.iter().all(|t| t.source_event_id == "evt_f2"));
    assert_eq!(env.event("evt_f2").await.unwrap().retry_count, 1);
}

#[tokio::test]
async fn confirmed_force_replay_processes_an_unverified_event() {
    let env = TestEnv::new();
    let body = PayloadBuilder::quote_accepted("evt_sig", "P-3").body();
    env.deliver_raw(&body, Some("sha256=deadbeef")).await.unwrap();
    assert_eq!(env.event("evt_sig").await.unwrap().status, EventStatus::Failed);

    let result = env.confirmed_force_replay("evt_sig").await.unwrap();

    assert_eq!(result.status, EventStatus::Processed);
    let event = env.event("evt_sig").await.unwrap();
    assert!(!event.signature_valid, "signature validity is never rewritten");
    assert_eq!(
        env.purchases.find("P-3").await.unwrap().unwrap().accepted_event_id.as_deref(),
        Some("evt_sig")
    );
}

#[tokio::test]
async fn expired_or_foreign_tokens_are_rejected() {
    let env = TestEnv::builder().confirmation_ttl(Duration::from_secs(60)).build();
    env.deliver(&PayloadBuilder::repair_requested("evt_a", "a").build()).await.unwrap();
    env.deliver(&PayloadBuilder::repair_requested("evt_b", "b").build()).await.unwrap();

    let ReplayOutcome::ConfirmationRequired { confirmation, .. } =
        env.service.replay(&EventId::from("evt_a"), force(None)).await.unwrap()
    else {
        panic!("expected a confirmation request");
    };

    let err = env
        .service
        .replay(&EventId::from("evt_b"), force(Some(confirmation.token.clone())))
        .await
        .unwrap_err();
    assert!(matches!(err, HookguardError::ConfirmationRequired { .. }));

    env.advance(Duration::from_secs(120));
    let err = env
        .service
        .replay(&EventId::from("evt_a"), force(Some(confirmation.token)))
        .await
        .unwrap_err();
    assert!(matches!(err, HookguardError::ConfirmationRequired { .. }));

    assert_eq!(env.repairs.all().await.len(), 2);
}

#[tokio::test]
async fn confirmation_token_runs_a_force_replay_once() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::repair_requested("evt_once", "boiler").build()).await.unwrap();
    let id = EventId::from("evt_once");

    let ReplayOutcome::ConfirmationRequired { confirmation, .. } =
        env.service.replay(&id, force(None)).await.unwrap()
    else {
        panic!("expected a confirmation request");
    };

    let first = env.service.replay(&id, force(Some(confirmation.token.clone()))).await.unwrap();
    assert!(matches!(first, ReplayOutcome::Completed(_)));

    for _ in 0..2 {
        let err = env
            .service
            .replay(&id, force(Some(confirmation.token.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, HookguardError::ConfirmationRequired { .. }));
    }

    assert_eq!(env.repairs.all().await.len(), 2);
    assert_eq!(env.event("evt_once").await.unwrap().retry_count, 1);
}

#[tokio::test]
async fn token_issued_before_a_safe_replay_is_spent() {
    let env = TestEnv::new();
    env.events
        .seed(failed_event(&env, PayloadBuilder::repair_requested("evt_mixed", "pump").build()))
        .await;
    let id = EventId::from("evt_mixed");

    let ReplayOutcome::ConfirmationRequired { confirmation, .. } =
        env.service.replay(&id, force(None)).await.unwrap()
    else {
        panic!("expected a confirmation request");
    };
    env.safe_replay("evt_mixed").await.unwrap();

    let err = env.service.replay(&id, force(Some(confirmation.token))).await.unwrap_err();
    assert!(matches!(err, HookguardError::ConfirmationRequired { .. }));
    assert_eq!(env.repairs.all().await.len(), 1);
}

#[tokio::test]
async fn replay_of_unknown_event_is_not_found() {
    let env = TestEnv::new();

    let err = env
        .service
        .replay(&EventId::from("evt_missing"), ReplayRequest {
            mode: ReplayMode::Safe,
            confirmation_token: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, HookguardError::NotFound { .. }));
}

#[tokio::test]
async fn second_replay_while_one_is_in_flight_conflicts() {
    let gate = BlockingHandler::new();
    let env = Arc::new(
        TestEnv::builder()
            .handler("slow_job", "1", Arc::new(gate.clone()), Arc::new(NeverApplied))
            .build(),
    );

    gate.release();
    env.deliver(&PayloadBuilder::new("evt_slow", "slow_job").build()).await.unwrap();
    assert_eq!(gate.entered(), 1);

    let first = tokio::spawn({
        let env = env.clone();
        async move { env.safe_replay("evt_slow").await }
    });
    gate.wait_entered(2).await;
    assert_eq!(env.event("evt_slow").await.unwrap().status, EventStatus::Processing);

    let err = env.safe_replay("evt_slow").await.unwrap_err();
    let err = err.downcast::<HookguardError>().unwrap();
    assert!(matches!(
        err,
        HookguardError::ConcurrencyConflict { status: EventStatus::Processing, .. }
    ));

    let err = env
        .service
        .ignore(&EventId::from("evt_slow"), "ops-1", "trying to ignore mid-flight")
        .await
        .unwrap_err();
    assert!(matches!(err, HookguardError::ConcurrencyConflict { .. }));

    gate.release();
    let result = first.await.unwrap().unwrap();
    assert_eq!(result.status, EventStatus::Processed);
    assert_eq!(gate.entered(), 2);
    assert_eq!(env.event("evt_slow").await.unwrap().retry_count, 1);
}
