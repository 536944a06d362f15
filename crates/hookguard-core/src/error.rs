//! Error types shared across the ingestion and recovery pipeline.
//!
//! `CoreError` covers persistence failures and is what repositories return.
//! `HookguardError` is the operator- and sender-facing taxonomy: every variant
//! carries a stable slug so HTTP clients can branch on it without parsing
//! messages.

use thiserror::Error;

use crate::models::{EventId, EventStatus};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage operations.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// The store could not be reached (pool exhausted, connection refused).
    ///
    /// These are the only storage errors worth retrying.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Returns whether retrying the same operation may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Error taxonomy surfaced to senders and operators.
#[derive(Debug, Clone, Error)]
pub enum HookguardError {
    /// Supplied signature does not match the payload.
    #[error("[E1001] Invalid signature: event {event_id} failed HMAC verification")]
    SignatureInvalid {
        /// Event carrying the bad signature
        event_id: EventId,
    },

    /// No handler registered for the event type and version.
    #[error("[E1002] Unsupported event type: no handler for {event_type}@{version}")]
    UnsupportedEventType {
        /// Event type from the payload
        event_type: String,
        /// Schema version from the payload
        version: String,
    },

    /// Handler returned an error or panicked.
    #[error("[E1003] Handler exception: {message}")]
    HandlerException {
        /// Truncated failure description
        message: String,
    },

    /// Event id was already stored.
    #[error("[E1004] Duplicate event: {event_id} already recorded")]
    DuplicateEvent {
        /// The colliding event id
        event_id: EventId,
    },

    /// Event was ignored by an operator and is terminal.
    #[error("[E1005] Already ignored: event {event_id} is excluded from recovery")]
    AlreadyIgnored {
        /// The ignored event id
        event_id: EventId,
    },

    /// Request is missing or has malformed fields.
    #[error("[E1006] Validation error: {message}")]
    Validation {
        /// What was wrong with the request
        message: String,
    },

    /// Replay already in flight or event not in a replayable state.
    #[error("[E1007] Concurrency conflict: event {event_id} is {status}")]
    ConcurrencyConflict {
        /// Event that could not be claimed
        event_id: EventId,
        /// Status observed when the claim failed
        status: EventStatus,
    },

    /// Force replay needs a second, confirmed request.
    #[error("[E1008] Confirmation required: force replay of {event_id} must be confirmed")]
    ConfirmationRequired {
        /// Event awaiting confirmation
        event_id: EventId,
    },

    /// No event stored under the id.
    #[error("[E1009] Not found: event {event_id}")]
    NotFound {
        /// The unknown event id
        event_id: EventId,
    },

    /// Store unreachable after bounded retries.
    #[error("[E3001] Store unavailable: {message}")]
    StoreUnavailable {
        /// Last storage error
        message: String,
    },

    /// Any other storage failure.
    #[error("[E9999] Storage error: {0}")]
    Storage(CoreError),
}

impl HookguardError {
    /// Stable machine-readable slug for this error.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SignatureInvalid { .. } => "signature_invalid",
            Self::UnsupportedEventType { .. } => "unsupported_event_type",
            Self::HandlerException { .. } => "handler_exception",
            Self::DuplicateEvent { .. } => "duplicate_event",
            Self::AlreadyIgnored { .. } => "already_ignored",
            Self::Validation { .. } => "validation_error",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::ConfirmationRequired { .. } => "confirmation_required",
            Self::NotFound { .. } => "not_found",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::Storage(_) => "internal_error",
        }
    }

    /// Returns whether the caller may retry the same request later.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::ConcurrencyConflict { .. })
    }

    /// Creates a validation error from a message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }
}

impl From<CoreError> for HookguardError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Unavailable(message) => Self::StoreUnavailable { message },
            other => Self::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable_slugs() {
        let id = EventId::from("evt_1");
        assert_eq!(HookguardError::SignatureInvalid { event_id: id.clone() }.code(), "signature_invalid");
        assert_eq!(
            HookguardError::UnsupportedEventType {
                event_type: "quote_accepted".into(),
                version: "9".into()
            }
            .code(),
            "unsupported_event_type"
        );
        assert_eq!(HookguardError::AlreadyIgnored { event_id: id.clone() }.code(), "already_ignored");
        assert_eq!(HookguardError::validation("note required").code(), "validation_error");
        assert_eq!(
            HookguardError::ConcurrencyConflict { event_id: id, status: EventStatus::Processing }
                .code(),
            "concurrency_conflict"
        );
    }

    #[test]
    fn unavailable_store_maps_to_retryable_error() {
        let err = HookguardError::from(CoreError::Unavailable("pool timed out".into()));
        assert_eq!(err.code(), "store_unavailable");
        assert!(err.is_retryable());

        let err = HookguardError::from(CoreError::Database("syntax error".into()));
        assert_eq!(err.code(), "internal_error");
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(CoreError::Unavailable("io".into()).is_transient());
        assert!(!CoreError::ConstraintViolation("dup".into()).is_transient());
        assert!(!CoreError::NotFound("x".into()).is_transient());
    }
}
