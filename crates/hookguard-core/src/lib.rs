//! Core domain models and persistence for inbound bot events.
//!
//! Provides strongly-typed identifiers, the webhook event record and its
//! lifecycle, the error taxonomy shared by every crate, a clock abstraction
//! and the PostgreSQL repositories backing the event log and the delayed job
//! scheduler.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod query;
pub mod storage;
pub mod time;

pub use error::{CoreError, HookguardError, Result};
pub use models::{
    EventId, EventStatus, FailureCode, InsertOutcome, JobId, JobStatus, NewScheduledJob,
    NewWebhookEvent, RelatedEntity, ScheduledJob, WebhookEvent,
};
pub use query::{EventFilter, EventPage, EventSummary, Pagination};
pub use time::{Clock, RealClock, TestClock};
