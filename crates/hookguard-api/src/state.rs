//! Shared state handed to every handler.

use std::sync::Arc;

use hookguard_processing::{DelayedJobScheduler, EventService};

use crate::middleware::auth::OperatorKeys;

/// Default largest delivery body.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Default delivery signature header.
pub const DEFAULT_SIGNATURE_HEADER: &str = "x-bot-signature";

/// Router state.
#[derive(Clone)]
pub struct AppState {
    /// Ingestion, replay, ignore and queries.
    pub service: EventService,
    /// Delayed job cancellation.
    pub scheduler: DelayedJobScheduler,
    /// Accepted operator API keys.
    pub operators: Arc<OperatorKeys>,
    /// Largest accepted delivery body in bytes.
    pub max_payload_bytes: usize,
    /// Lowercased name of the signature header.
    pub signature_header: String,
}

impl AppState {
    /// Creates state with default ingest limits.
    pub fn new(
        service: EventService,
        scheduler: DelayedJobScheduler,
        operators: OperatorKeys,
    ) -> Self {
        Self {
            service,
            scheduler,
            operators: Arc::new(operators),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
        }
    }

    /// Overrides the body size limit.
    #[must_use]
    pub fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    /// Overrides the signature header name.
    #[must_use]
    pub fn with_signature_header(mut self, header: impl AsRef<str>) -> Self {
        self.signature_header = header.as_ref().to_ascii_lowercase();
        self
    }
}
