//! Operator endpoints over the event log.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use hookguard_core::{EventFilter, EventId, EventPage, EventSummary, HookguardError, WebhookEvent};
use hookguard_processing::{ReplayOutcome, ReplayRequest};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    error::{create_error_response, ApiError},
    middleware::auth::Operator,
    state::AppState,
};

/// Listing query string. Values are parsed by hand so a bad value is a
/// validation error in the usual envelope rather than an extractor rejection.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// Status filter.
    pub status: Option<String>,
    /// Event type filter.
    pub event_type: Option<String>,
    /// Free text search.
    pub q: Option<String>,
    /// `true` or `false`.
    pub ignored: Option<String>,
    /// 1-based page.
    pub page: Option<String>,
    /// Rows per page.
    pub page_size: Option<String>,
}

impl ListQuery {
    /// Converts to a storage filter.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an unknown status or a non-numeric page.
    pub fn into_filter(self) -> Result<EventFilter, HookguardError> {
        let status = match self.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(raw.parse().map_err(|_| {
                HookguardError::validation(format!("unknown status filter: {raw}"))
            })?),
            None => None,
        };

        let ignored = match self.ignored.as_deref().map(str::trim) {
            None | Some("") => None,
            Some("true") => Some(true),
            Some("false") => Some(false),
            Some(other) => {
                return Err(HookguardError::validation(format!(
                    "ignored must be true or false, got {other}"
                )))
            },
        };

        Ok(EventFilter {
            status,
            event_type: self.event_type,
            q: self.q,
            ignored,
            page: parse_number("page", self.page.as_deref())?,
            page_size: parse_number("pageSize", self.page_size.as_deref())?,
        })
    }
}

fn parse_number(name: &str, raw: Option<&str>) -> Result<u32, HookguardError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .parse()
            .map_err(|_| HookguardError::validation(format!("{name} must be a positive integer"))),
        None => Ok(0),
    }
}

fn event_id(raw: &str) -> Result<EventId, ApiError> {
    EventId::parse(raw).map_err(|e| ApiError(HookguardError::validation(e.to_string())))
}

fn bad_body(rejection: &JsonRejection) -> Response {
    create_error_response(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
}

/// `GET /api/webhook-events`
#[instrument(name = "list_events", skip(state, query))]
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<EventPage>, ApiError> {
    let filter = query.into_filter()?;
    Ok(Json(state.service.list(filter).await?))
}

/// `GET /api/webhook-events/summary`
#[instrument(name = "event_summary", skip(state))]
pub async fn event_summary(State(state): State<AppState>) -> Result<Json<EventSummary>, ApiError> {
    Ok(Json(state.service.summary().await?))
}

/// `GET /api/webhook-events/{event_id}`
#[instrument(name = "event_detail", skip(state))]
pub async fn event_detail(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<WebhookEvent>, ApiError> {
    let id = event_id(&raw_id)?;
    Ok(Json(state.service.detail(&id).await?))
}

/// Body of a 202 answer to an unconfirmed force replay.
#[derive(Debug, Serialize)]
pub struct ConfirmationResponse {
    /// Event awaiting confirmation.
    pub event_id: EventId,
    /// Always `confirmation_required`.
    pub status: &'static str,
    /// Token to send back with the next request.
    pub confirmation_token: String,
    /// Token expiry.
    pub expires_at: DateTime<Utc>,
    /// What to do next.
    pub message: String,
}

/// `POST /api/webhook-events/{event_id}/replay`
#[instrument(name = "replay_event", skip(state, operator, body), fields(user_id = %operator.user_id))]
pub async fn replay_event(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Path(raw_id): Path<String>,
    body: Result<Json<ReplayRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(&rejection),
    };
    let id = match event_id(&raw_id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    match state.service.replay(&id, request).await {
        Ok(ReplayOutcome::Completed(result)) => {
            info!(event_id = %id, noop = result.noop, status = %result.status, "Replay finished");
            (StatusCode::OK, Json(result)).into_response()
        },
        Ok(ReplayOutcome::ConfirmationRequired { event_id, confirmation }) => {
            info!(event_id = %event_id, "Force replay awaiting confirmation");
            let message = format!(
                "force replay of {event_id} bypasses idempotency; resend with confirmation_token"
            );
            (
                StatusCode::ACCEPTED,
                Json(ConfirmationResponse {
                    event_id,
                    status: "confirmation_required",
                    confirmation_token: confirmation.token,
                    expires_at: confirmation.expires_at,
                    message,
                }),
            )
                .into_response()
        },
        Err(e) => ApiError(e).into_response(),
    }
}

/// Body of an ignore request.
#[derive(Debug, Deserialize)]
pub struct IgnoreRequest {
    /// Why the event is being ignored.
    #[serde(default)]
    pub note: Option<String>,
}

/// `POST /api/webhook-events/{event_id}/ignore`
#[instrument(name = "ignore_event", skip(state, operator, body), fields(user_id = %operator.user_id))]
pub async fn ignore_event(
    State(state): State<AppState>,
    Extension(operator): Extension<Operator>,
    Path(raw_id): Path<String>,
    body: Result<Json<IgnoreRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(&rejection),
    };
    let id = match event_id(&raw_id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let note = request.note.unwrap_or_default();

    match state.service.ignore(&id, &operator.user_id, &note).await {
        Ok(event) => (StatusCode::OK, Json(event)).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}
