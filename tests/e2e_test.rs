//! End-to-end scenarios through the HTTP router.
//!
//! Each test drives the full stack (router, ingestion, dispatch, handlers,
//! scheduler) over in-memory storage and a controllable clock.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Method, Request, StatusCode},
    Router,
};
use hookguard_api::{create_router, AppState, OperatorKeys};
use hookguard_core::{models::JobStatus, EventStatus, RelatedEntity};
use hookguard_processing::{
    handlers::books::{PurchaseBook, PurchaseStatus},
    scheduler::PURCHASE_FOLLOW_UP,
};
use hookguard_testing::{fixtures, PayloadBuilder, TestEnv};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const OPERATOR_KEY: &str = "e2e-operator-key";

fn router(env: &TestEnv) -> Router {
    let operators = OperatorKeys::default().with_key("ops-e2e", OPERATOR_KEY);
    create_router(AppState::new(env.service.clone(), env.scheduler.clone(), operators))
}

fn signed_delivery(payload: &Value) -> Request<Body> {
    let body = payload.to_string();
    let signature = fixtures::sign(body.as_bytes());
    Request::builder()
        .method(Method::POST)
        .uri("/webhooks/bot")
        .header("content-type", "application/json")
        .header("x-bot-signature", signature)
        .body(Body::from(body))
        .expect("request build")
}

fn operator_request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder =
        Request::builder().method(method).uri(uri).header(AUTHORIZATION, format!("Bearer {OPERATOR_KEY}"));
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request build"),
        None => builder.body(Body::empty()).expect("request build"),
    }
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("request execution");
    let status = response.status();
    let bytes =
        axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body extraction");
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

/// A quote acceptance is applied once, survives redelivery and operator
/// replay without repeating its effect, and triggers the delayed follow-up.
#[tokio::test]
async fn quote_acceptance_lifecycle() {
    let env = TestEnv::builder().follow_up_delay(Duration::from_secs(3600)).build();
    env.purchases.insert_quoted("P-1").await;
    let app = router(&env);
    let payload = PayloadBuilder::quote_accepted("evt_001", "P-1").build();

    let (status, body) = call(&app, signed_delivery(&payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"event_id": "evt_001", "status": "processed"}));

    let purchase = env.purchases.find("P-1").await.unwrap().unwrap();
    assert_eq!(purchase.status, PurchaseStatus::Accepted);
    let accepted_version = purchase.version;

    let (status, body) = call(&app, signed_delivery(&payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");

    let (status, body) = call(
        &app,
        operator_request(Method::POST, "/api/webhook-events/evt_001/replay", Some(json!({"mode": "safe"}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["noop"], true);

    assert_eq!(env.purchases.find("P-1").await.unwrap().unwrap().version, accepted_version);

    let (_, detail) =
        call(&app, operator_request(Method::GET, "/api/webhook-events/evt_001", None)).await;
    assert_eq!(detail["status"], "processed");
    assert_eq!(detail["duplicate_count"], 1);
    assert_eq!(detail["retry_count"], 0);
    assert_eq!(detail["related_entity"], json!({"type": "purchase", "id": "P-1"}));
    assert!(detail["reviewed_at"].is_string());

    env.advance(Duration::from_secs(3601));
    let ran = env.job_runner(CancellationToken::new()).run_due().await.unwrap();
    assert_eq!(ran, 1);

    let jobs = env.scheduler.jobs_for(RelatedEntity::Purchase("P-1".to_string())).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert!(env.notifier.sent().await.iter().any(|n| n.kind == PURCHASE_FOLLOW_UP));
}

/// A failed event is recovered by an operator, then a different failure is
/// ignored and drops out of the open-failure count.
#[tokio::test]
async fn operator_recovers_and_retires_failures() {
    let env = TestEnv::new();
    let app = router(&env);

    let bad = PayloadBuilder::new("evt_bad", "quote_accepted").build();
    let (_, body) = call(&app, signed_delivery(&bad)).await;
    assert_eq!(body["status"], "failed");

    let unknown = PayloadBuilder::new("evt_unknown", "invoice_paid").build();
    call(&app, signed_delivery(&unknown)).await;

    let (_, summary) =
        call(&app, operator_request(Method::GET, "/api/webhook-events/summary", None)).await;
    assert_eq!(summary["open_failures"], 2);

    let (status, _) = call(
        &app,
        operator_request(
            Method::POST,
            "/api/webhook-events/evt_unknown/ignore",
            Some(json!({"note": "sender retired invoice events"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, failed) =
        call(&app, operator_request(Method::GET, "/api/webhook-events?status=failed", None)).await;
    let ids: Vec<_> = failed["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["evt_bad".to_string()]);

    let (_, summary) =
        call(&app, operator_request(Method::GET, "/api/webhook-events/summary", None)).await;
    assert_eq!(summary["open_failures"], 1);
    assert_eq!(summary["ignored"], 1);
}

/// Concurrent redeliveries of one event apply its effect exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redeliveries_apply_once() {
    let env = Arc::new(TestEnv::new());
    env.purchases.insert_quoted("P-9").await;
    let app = router(&env);
    let payload = PayloadBuilder::quote_accepted("evt_race", "P-9").build();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let app = app.clone();
        let request = signed_delivery(&payload);
        tasks.push(tokio::spawn(async move { call(&app, request).await }));
    }

    let mut statuses = Vec::new();
    for task in tasks {
        let (status, body) = task.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        statuses.push(body["status"].as_str().unwrap().to_string());
    }

    assert_eq!(statuses.iter().filter(|s| *s == "processed").count(), 1);
    assert_eq!(statuses.iter().filter(|s| *s == "duplicate").count(), 9);

    let event = env.event("evt_race").await.unwrap();
    assert_eq!(event.status, EventStatus::Processed);
    assert_eq!(event.duplicate_count, 9);
    assert_eq!(env.purchases.find("P-9").await.unwrap().unwrap().version, 2);
}
