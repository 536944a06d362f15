//! Verification, dispatch and recovery for inbound bot events.
//!
//! # Pipeline
//!
//! ```text
//! delivery ──▶ SignatureVerifier ──▶ EventStorage::insert_if_absent
//!                                         │ inserted          │ duplicate
//!                                         ▼                   ▼
//!                                     Dispatcher          counter += 1
//!                          claim ─▶ guard ─▶ handler ─▶ processed / failed
//! ```
//!
//! Operators recover failures through [`ReplayController`] (safe or
//! confirmed force) and retire them through [`EventService::ignore`].
//! Two background workers run beside the request path: the
//! [`PendingSweeper`] for events stranded by a crash, and the [`JobRunner`]
//! for delayed follow-ups.
//!
//! Mutual exclusion lives entirely in storage: the unique `event_id` and
//! conditional status updates. Nothing here holds cross-request state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod confirmation;
pub mod dispatcher;
pub mod handler;
pub mod handlers;
pub mod ingest;
pub mod notifier;
pub mod replay;
pub mod scheduler;
pub mod service;
pub mod signature;
pub mod storage;
pub mod sweeper;

pub use confirmation::{ConfirmationToken, ConfirmationTokens};
pub use dispatcher::{AttemptMode, AttemptReport, Dispatcher};
pub use handler::{
    EventHandler, GuardVerdict, HandlerError, HandlerOutcome, HandlerRegistration,
    HandlerRegistry, IdempotencyGuard,
};
pub use ingest::{IncomingDelivery, IngestOutcome, Ingestor, StoreRetry};
pub use notifier::{HttpNotifier, LogNotifier, Notification, Notifier, NotifyError};
pub use replay::{ReplayController, ReplayMode, ReplayOutcome, ReplayRequest, ReplayResult};
pub use scheduler::{DelayedJobScheduler, FollowUpExecutor, JobExecutor, JobRunner, RunnerConfig};
pub use service::{EventService, ServiceParts};
pub use signature::{MatchedKey, PreviousSecret, SignatureCheck, SignatureVerifier};
pub use storage::{EventStorage, JobStorage, PostgresEventStorage, PostgresJobStorage};
pub use sweeper::{PendingSweeper, SweeperConfig};
