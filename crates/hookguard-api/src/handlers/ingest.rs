//! Bot delivery endpoint.
//!
//! The body is read as raw bytes so the signature is checked against exactly
//! what the sender signed. Every well-formed delivery is answered with 200 and
//! its outcome, including failures the operator must look at; the sender only
//! sees a non-2xx when retrying the same delivery could help (503) or can never
//! help (400, 413).

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hookguard_core::HookguardError;
use hookguard_processing::IncomingDelivery;
use tracing::{info, instrument, warn};

use crate::{
    error::{create_error_response, ApiError},
    state::AppState,
};

/// Accepts one signed delivery from the bot.
///
/// # Errors
///
/// Returns appropriate HTTP status codes:
/// - 400: Body is not JSON or lacks `event_id` / `event_type`
/// - 413: Body exceeds the configured limit
/// - 503: Event store unavailable after retries
#[instrument(
    name = "ingest_delivery",
    skip(state, request),
    fields(
        content_length = request
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    )
)]
pub async fn ingest_delivery(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();

    let Ok(body) = to_bytes(body, state.max_payload_bytes).await else {
        warn!(limit = state.max_payload_bytes, "Delivery exceeds size limit");
        return create_error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!("payload exceeds {} bytes", state.max_payload_bytes),
        );
    };

    let signature = parts.headers.get(state.signature_header.as_str()).and_then(|v| v.to_str().ok());
    let source_ip = source_ip(&parts.headers);

    let delivery = IncomingDelivery { body: &body, signature, source_ip: source_ip.as_deref() };

    match state.service.ingest(delivery).await {
        Ok(outcome) => {
            info!(event_id = %outcome.event_id, status = %outcome.status, "Delivery accepted");
            (StatusCode::OK, Json(outcome)).into_response()
        },
        Err(HookguardError::Validation { message }) => {
            warn!(%message, "Rejected malformed delivery");
            create_error_response(StatusCode::BAD_REQUEST, "validation_error", message)
        },
        Err(e) => ApiError(e).into_response(),
    }
}

/// Sender address from proxy headers, first hop wins.
fn source_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(String::from)
}
