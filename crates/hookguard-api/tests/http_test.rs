//! HTTP-level tests for the delivery and operator endpoints.
//!
//! The router runs over in-memory storage; requests are driven with
//! `tower::ServiceExt::oneshot`.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::time::Duration;

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Method, Request, StatusCode},
    Router,
};
use hookguard_api::{create_router, AppState, OperatorKeys};
use hookguard_processing::StoreRetry;
use hookguard_testing::{fixtures, PayloadBuilder, TestEnv};
use serde_json::{json, Value};
use tower::ServiceExt;

const OPERATOR_KEY: &str = "ops-key-0001";

fn app(env: &TestEnv) -> Router {
    app_with(env, |state| state)
}

fn app_with(env: &TestEnv, customize: impl FnOnce(AppState) -> AppState) -> Router {
    let operators = OperatorKeys::default().with_key("ops-7", OPERATOR_KEY);
    let state = AppState::new(env.service.clone(), env.scheduler.clone(), operators);
    create_router(customize(state))
}

fn delivery(body: Vec<u8>, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/bot")
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.9");
    if let Some(signature) = signature {
        builder = builder.header("X-Bot-Signature", signature);
    }
    builder.body(Body::from(body)).expect("request build")
}

fn signed(payload: &Value) -> Request<Body> {
    let body = payload.to_string().into_bytes();
    let signature = fixtures::sign(&body);
    delivery(body, Some(&signature))
}

fn operator(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(AUTHORIZATION, format!("Bearer {OPERATOR_KEY}"));
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request build"),
        None => builder.body(Body::empty()).expect("request build"),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("request execution");
    let status = response.status();
    let body =
        axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body extraction");
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn delivery_is_processed_then_deduplicated() {
    let env = TestEnv::new();
    let app = app(&env);
    let payload = PayloadBuilder::quote_accepted("evt_http_1", "P-100").build();

    let (status, body) = send(&app, signed(&payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"event_id": "evt_http_1", "status": "processed"}));

    let (status, body) = send(&app, signed(&payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");

    let event = env.event("evt_http_1").await.unwrap();
    assert_eq!(event.duplicate_count, 1);
    assert_eq!(event.source_ip.as_deref(), Some("203.0.113.9"));
}

#[tokio::test]
async fn bad_signature_is_acknowledged_but_recorded_as_failed() {
    let env = TestEnv::new();
    let app = app(&env);
    let body = PayloadBuilder::repair_requested("evt_http_sig", "door").body();
    let signature = fixtures::sign(&body);

    let (status, json) = send(&app, delivery(fixtures::tamper(&body), Some(&signature))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "failed");
    assert!(!env.event("evt_http_sig").await.unwrap().signature_valid);
    assert!(env.repairs.all().await.is_empty());
}

#[tokio::test]
async fn malformed_deliveries_are_bad_requests() {
    let env = TestEnv::new();
    let app = app(&env);

    let body = b"{not json".to_vec();
    let signature = fixtures::sign(&body);
    let (status, json) = send(&app, delivery(body, Some(&signature))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "validation_error");

    let payload = PayloadBuilder::new("evt_x", "quote_accepted").without_event_id().build();
    let (status, json) = send(&app, signed(&payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"]["message"].as_str().unwrap().contains("event_id"));

    assert!(env.events.is_empty().await);
}

#[tokio::test]
async fn oversized_delivery_is_rejected() {
    let env = TestEnv::new();
    let app = app_with(&env, |state| state.with_max_payload_bytes(64));
    let payload = PayloadBuilder::repair_requested("evt_big", &"z".repeat(500)).build();

    let (status, json) = send(&app, signed(&payload)).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json["error"]["code"], "payload_too_large");
    assert!(env.events.is_empty().await);
}

#[tokio::test]
async fn store_outage_asks_the_sender_to_retry() {
    let env = TestEnv::builder()
        .store_retry(StoreRetry { attempts: 2, delay: Duration::from_millis(1) })
        .build();
    env.events.fail_next_inserts(10);
    let app = app(&env);

    let (status, json) =
        send(&app, signed(&PayloadBuilder::repair_requested("evt_503", "roof").build())).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"]["code"], "store_unavailable");
}

#[tokio::test]
async fn operator_routes_require_a_known_key() {
    let env = TestEnv::new();
    let app = app(&env);

    let anonymous = Request::builder().uri("/api/webhook-events").body(Body::empty()).unwrap();
    let (status, json) = send(&app, anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"]["code"], "unauthorized");

    let wrong = Request::builder()
        .uri("/api/webhook-events/summary")
        .header(AUTHORIZATION, "Bearer not-a-key")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, operator(Method::GET, "/api/webhook-events", None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn listing_accepts_camel_case_filters() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::new("evt_l1", "invoice_paid").build()).await.unwrap();
    env.deliver(&PayloadBuilder::repair_requested("evt_l2", "tap").build()).await.unwrap();
    env.deliver(&PayloadBuilder::repair_requested("evt_l3", "sink").build()).await.unwrap();
    let app = app(&env);

    let (status, json) = send(
        &app,
        operator(Method::GET, "/api/webhook-events?eventType=repair_requested&pageSize=1", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["events"].as_array().unwrap().len(), 1);
    assert_eq!(json["pagination"]["total"], 2);
    assert_eq!(json["pagination"]["total_pages"], 2);

    let (_, json) =
        send(&app, operator(Method::GET, "/api/webhook-events?status=failed", None)).await;
    assert_eq!(json["events"][0]["event_id"], "evt_l1");

    let (status, json) =
        send(&app, operator(Method::GET, "/api/webhook-events?status=lost", None)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["error"]["code"], "validation_error");

    let (_, json) = send(&app, operator(Method::GET, "/api/webhook-events/summary", None)).await;
    assert_eq!(json["open_failures"], 1);
    assert_eq!(json["by_status"]["processed"], 2);
}

#[tokio::test]
async fn detail_of_unknown_event_is_not_found() {
    let env = TestEnv::new();
    let app = app(&env);

    let (status, json) =
        send(&app, operator(Method::GET, "/api/webhook-events/evt_ghost", None)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "not_found");
}

#[tokio::test]
async fn safe_replay_of_a_processed_event_is_a_noop() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::quote_accepted("evt_rp", "P-5").build()).await.unwrap();
    let app = app(&env);

    let (status, json) = send(
        &app,
        operator(Method::POST, "/api/webhook-events/evt_rp/replay", Some(json!({"mode": "safe"}))),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["noop"], true);
    assert_eq!(json["status"], "processed");
    assert!(json["message"].is_string());
}

#[tokio::test]
async fn force_replay_needs_a_confirmation_round_trip() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::repair_requested("evt_fr", "heater").build()).await.unwrap();
    let app = app(&env);
    let uri = "/api/webhook-events/evt_fr/replay";

    let (status, json) =
        send(&app, operator(Method::POST, uri, Some(json!({"mode": "force"})))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["status"], "confirmation_required");
    let token = json["confirmation_token"].as_str().unwrap().to_string();
    assert_eq!(env.repairs.all().await.len(), 1);

    let (status, json) = send(
        &app,
        operator(Method::POST, uri, Some(json!({"mode": "force", "confirmation_token": "forged"}))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"]["code"], "confirmation_required");

    let confirm = json!({"mode": "force", "confirmation_token": token});
    let (status, json) = send(&app, operator(Method::POST, uri, Some(confirm.clone()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["noop"], false);
    assert_eq!(env.repairs.all().await.len(), 2);

    let (status, json) = send(&app, operator(Method::POST, uri, Some(confirm))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"]["code"], "confirmation_required");
    assert_eq!(env.repairs.all().await.len(), 2);
}

#[tokio::test]
async fn replay_rejects_unparseable_bodies() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::repair_requested("evt_body", "x").build()).await.unwrap();
    let app = app(&env);

    let (status, json) = send(
        &app,
        operator(Method::POST, "/api/webhook-events/evt_body/replay", Some(json!({"mode": "yolo"}))),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "validation_error");
}

#[tokio::test]
async fn ignore_records_the_operator_and_is_final() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::new("evt_ig", "invoice_paid").build()).await.unwrap();
    let app = app(&env);
    let uri = "/api/webhook-events/evt_ig/ignore";

    let (status, json) = send(&app, operator(Method::POST, uri, Some(json!({"note": " "})))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["error"]["code"], "validation_error");

    let (status, json) =
        send(&app, operator(Method::POST, uri, Some(json!({"note": "sender bug, fixed upstream"}))))
            .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ignored_by_user_id"], "ops-7");
    assert_eq!(json["status"], "failed");

    let (status, json) =
        send(&app, operator(Method::POST, uri, Some(json!({"note": "again"})))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"]["code"], "already_ignored");

    let (status, _) = send(
        &app,
        operator(Method::POST, "/api/webhook-events/evt_ig/replay", Some(json!({"mode": "safe"}))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn undo_cancels_a_waiting_follow_up_once() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::quote_accepted("evt_job", "P-77").build()).await.unwrap();
    let app = app(&env);
    let uri = "/api/scheduled-jobs/purchase_follow_up/purchase/P-77";

    let (status, json) = send(&app, operator(Method::DELETE, uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cancelled"], true);

    let (status, json) = send(&app, operator(Method::DELETE, uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cancelled"], false);

    let (status, _) = send(
        &app,
        operator(Method::DELETE, "/api/scheduled-jobs/purchase_follow_up/invoice/P-77", None),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn health_endpoints_answer_without_auth() {
    let env = TestEnv::new();
    let app = app(&env);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let (status, json) =
        send(&app, Request::builder().uri("/ready").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["checks"]["database"]["status"], "up");

    let (status, json) =
        send(&app, Request::builder().uri("/live").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "alive");
}
