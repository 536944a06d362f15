//! Error envelope returned by every endpoint.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hookguard_core::HookguardError;
use serde::Serialize;
use tracing::error;

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable machine-readable slug
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Builds the JSON error envelope.
pub fn create_error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail { code: code.to_string(), message: message.into() },
        }),
    )
        .into_response()
}

/// Domain error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub HookguardError);

impl ApiError {
    /// Status code for the wrapped error on operator endpoints.
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            HookguardError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            HookguardError::NotFound { .. } => StatusCode::NOT_FOUND,
            HookguardError::AlreadyIgnored { .. }
            | HookguardError::ConcurrencyConflict { .. }
            | HookguardError::SignatureInvalid { .. }
            | HookguardError::ConfirmationRequired { .. }
            | HookguardError::DuplicateEvent { .. } => StatusCode::CONFLICT,
            HookguardError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            HookguardError::UnsupportedEventType { .. }
            | HookguardError::HandlerException { .. }
            | HookguardError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<HookguardError> for ApiError {
    fn from(err: HookguardError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
            "Internal error".to_string()
        } else {
            self.0.to_string()
        };

        create_error_response(status, self.0.code(), message)
    }
}

#[cfg(test)]
mod tests {
    use hookguard_core::{CoreError, EventId, EventStatus};

    use super::*;

    #[test]
    fn domain_errors_map_to_statuses() {
        let id = EventId::from("evt_1");
        let cases = [
            (HookguardError::validation("bad"), StatusCode::UNPROCESSABLE_ENTITY),
            (HookguardError::NotFound { event_id: id.clone() }, StatusCode::NOT_FOUND),
            (HookguardError::AlreadyIgnored { event_id: id.clone() }, StatusCode::CONFLICT),
            (
                HookguardError::ConcurrencyConflict {
                    event_id: id.clone(),
                    status: EventStatus::Processing,
                },
                StatusCode::CONFLICT,
            ),
            (HookguardError::SignatureInvalid { event_id: id }, StatusCode::CONFLICT),
            (
                HookguardError::StoreUnavailable { message: "down".into() },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                HookguardError::Storage(CoreError::Database("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }

    #[test]
    fn internal_errors_hide_details() {
        let response =
            ApiError(HookguardError::Storage(CoreError::Database("password leaked".into())))
                .into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
