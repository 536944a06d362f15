//! HTTP request handlers.
//!
//! - `ingest` - bot deliveries, signature-authenticated
//! - `events` - operator listing, detail, replay and ignore
//! - `jobs` - undo for delayed follow-ups
//! - `health` - liveness and readiness, unauthenticated
//!
//! Operator handlers return the `{error: {code, message}}` envelope on
//! failure; see [`crate::error::ApiError`] for the status mapping.

pub mod events;
pub mod health;
pub mod ingest;
pub mod jobs;

pub use events::{event_detail, event_summary, ignore_event, list_events, replay_event};
pub use health::{health_check, liveness_check, readiness_check};
pub use ingest::ingest_delivery;
pub use jobs::cancel_job;
