//! Test infrastructure for hookguard.
//!
//! [`TestEnv`] wires the full event pipeline over in-memory storage, the
//! in-memory business books and a manually driven clock, so tests can drive
//! ingestion, replay, ignore and the background workers deterministically.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use hookguard_core::{Clock, EventId, HookguardError, TestClock, WebhookEvent};
use hookguard_processing::{
    handlers::{
        books::{InMemoryPurchaseBook, InMemoryRepairBook},
        register_reference_handlers, ReferenceCollaborators,
    },
    scheduler::PURCHASE_FOLLOW_UP,
    storage::mock::{MockEventStorage, MockJobStorage},
    ConfirmationTokens, DelayedJobScheduler, EventHandler, EventService, EventStorage,
    FollowUpExecutor, HandlerRegistry, IdempotencyGuard, IncomingDelivery, IngestOutcome,
    JobRunner, JobStorage, PendingSweeper, PreviousSecret, ReplayMode, ReplayOutcome,
    ReplayRequest, ReplayResult, RunnerConfig, ServiceParts, SignatureVerifier, StoreRetry,
    SweeperConfig,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub mod doubles;
pub mod fixtures;

pub use doubles::{
    BlockingHandler, CountingHandler, FailingHandler, NeverApplied, PanickingHandler,
    RecordingNotifier,
};
pub use fixtures::PayloadBuilder;

/// Active signing secret every [`TestEnv`] verifies with.
pub const TEST_SIGNING_SECRET: &str = "whsec_test_active_0001";

/// Secret used for force-replay confirmation tokens.
pub const TEST_CONFIRMATION_SECRET: &str = "confirm_test_secret_0001";

/// Source address recorded for deliveries made through [`TestEnv::deliver`].
pub const TEST_SOURCE_IP: &str = "203.0.113.7";

type ExtraHandler = (String, String, Arc<dyn EventHandler>, Arc<dyn IdempotencyGuard>);

/// Builder for [`TestEnv`].
pub struct TestEnvBuilder {
    follow_up_delay: Duration,
    confirmation_ttl: Duration,
    store_retry: StoreRetry,
    previous_secret: Option<(String, Duration)>,
    reference_handlers: bool,
    extra_handlers: Vec<ExtraHandler>,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            follow_up_delay: Duration::from_secs(3600),
            confirmation_ttl: Duration::from_secs(300),
            store_retry: StoreRetry { attempts: 3, delay: Duration::from_millis(10) },
            previous_secret: None,
            reference_handlers: true,
            extra_handlers: Vec::new(),
        }
    }
}

impl TestEnvBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before the purchase follow-up job becomes due (default: 1h).
    #[must_use]
    pub fn follow_up_delay(mut self, delay: Duration) -> Self {
        self.follow_up_delay = delay;
        self
    }

    /// Lifetime of force-replay confirmation tokens (default: 5m).
    #[must_use]
    pub fn confirmation_ttl(mut self, ttl: Duration) -> Self {
        self.confirmation_ttl = ttl;
        self
    }

    /// Insert retry policy.
    #[must_use]
    pub fn store_retry(mut self, retry: StoreRetry) -> Self {
        self.store_retry = retry;
        self
    }

    /// Also accepts `secret` until `valid_for` past the environment's start.
    #[must_use]
    pub fn previous_secret(mut self, secret: impl Into<String>, valid_for: Duration) -> Self {
        self.previous_secret = Some((secret.into(), valid_for));
        self
    }

    /// Starts with an empty registry instead of the reference handlers.
    #[must_use]
    pub fn without_reference_handlers(mut self) -> Self {
        self.reference_handlers = false;
        self
    }

    /// Registers an additional handler.
    #[must_use]
    pub fn handler(
        mut self,
        event_type: &str,
        version: &str,
        handler: Arc<dyn EventHandler>,
        guard: Arc<dyn IdempotencyGuard>,
    ) -> Self {
        self.extra_handlers.push((event_type.to_string(), version.to_string(), handler, guard));
        self
    }

    /// Assembles the environment.
    pub fn build(self) -> TestEnv {
        let clock = TestClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());

        let events = Arc::new(MockEventStorage::new());
        let jobs = Arc::new(MockJobStorage::new());
        let purchases = Arc::new(InMemoryPurchaseBook::new());
        let repairs = Arc::new(InMemoryRepairBook::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let job_storage: Arc<dyn JobStorage> = jobs.clone();
        let scheduler = DelayedJobScheduler::new(job_storage, shared_clock.clone());

        let mut registry = HandlerRegistry::new();
        if self.reference_handlers {
            let collaborators = ReferenceCollaborators {
                purchases: purchases.clone(),
                repairs: repairs.clone(),
                notifier: notifier.clone(),
                scheduler: Some(scheduler.clone()),
                follow_up_delay: self.follow_up_delay,
                clock: shared_clock.clone(),
            };
            register_reference_handlers(&mut registry, &collaborators);
        }
        for (event_type, version, handler, guard) in self.extra_handlers {
            registry.register(event_type, version, handler, guard);
        }

        let mut verifier = SignatureVerifier::new(TEST_SIGNING_SECRET);
        if let Some((secret, valid_for)) = self.previous_secret {
            let valid_for = chrono::Duration::from_std(valid_for).unwrap_or(chrono::Duration::zero());
            verifier =
                verifier.with_previous(PreviousSecret::new(secret, shared_clock.now_utc() + valid_for));
        }

        let event_storage: Arc<dyn EventStorage> = events.clone();
        let service = EventService::new(ServiceParts {
            storage: event_storage,
            registry: Arc::new(registry),
            verifier,
            tokens: ConfirmationTokens::new(TEST_CONFIRMATION_SECRET, self.confirmation_ttl),
            clock: shared_clock,
            store_retry: self.store_retry,
        });

        TestEnv { clock, events, jobs, purchases, repairs, notifier, scheduler, service }
    }
}

/// In-memory pipeline with handles on every collaborator.
pub struct TestEnv {
    /// Shared test clock.
    pub clock: TestClock,
    /// Event log.
    pub events: Arc<MockEventStorage>,
    /// Delayed job table.
    pub jobs: Arc<MockJobStorage>,
    /// Purchase module.
    pub purchases: Arc<InMemoryPurchaseBook>,
    /// Repair module.
    pub repairs: Arc<InMemoryRepairBook>,
    /// Captured notifications.
    pub notifier: Arc<RecordingNotifier>,
    /// Follow-up scheduler used by the handlers.
    pub scheduler: DelayedJobScheduler,
    /// Service under test.
    pub service: EventService,
}

impl TestEnv {
    /// Environment with the reference handlers and default settings.
    pub fn new() -> Self {
        TestEnvBuilder::new().build()
    }

    /// Builder for custom environments.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Delivers `payload` signed with the active test secret.
    ///
    /// # Errors
    ///
    /// Propagates ingestion errors.
    pub async fn deliver(&self, payload: &Value) -> Result<IngestOutcome, HookguardError> {
        let body = payload.to_string().into_bytes();
        let signature = fixtures::sign(&body);
        self.deliver_raw(&body, Some(&signature)).await
    }

    /// Delivers raw bytes with an arbitrary signature header.
    ///
    /// # Errors
    ///
    /// Propagates ingestion errors.
    pub async fn deliver_raw(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<IngestOutcome, HookguardError> {
        self.service
            .ingest(IncomingDelivery { body, signature, source_ip: Some(TEST_SOURCE_IP) })
            .await
    }

    /// Stored row for `event_id`.
    ///
    /// # Errors
    ///
    /// Fails if no row exists.
    pub async fn event(&self, event_id: &str) -> Result<WebhookEvent> {
        self.events
            .get(&EventId::from(event_id))
            .await
            .with_context(|| format!("event {event_id} not stored"))
    }

    /// Runs a safe replay and expects it to complete.
    ///
    /// # Errors
    ///
    /// Fails on replay errors or an unexpected confirmation request.
    pub async fn safe_replay(&self, event_id: &str) -> Result<ReplayResult> {
        let request = ReplayRequest { mode: ReplayMode::Safe, confirmation_token: None };
        match self.service.replay(&EventId::from(event_id), request).await? {
            ReplayOutcome::Completed(result) => Ok(result),
            ReplayOutcome::ConfirmationRequired { .. } => {
                bail!("safe replay unexpectedly asked for confirmation")
            },
        }
    }

    /// Runs both steps of a force replay: request a token, then confirm.
    ///
    /// # Errors
    ///
    /// Fails on replay errors or if no token was issued.
    pub async fn confirmed_force_replay(&self, event_id: &str) -> Result<ReplayResult> {
        let id = EventId::from(event_id);
        let request = ReplayRequest { mode: ReplayMode::Force, confirmation_token: None };
        let ReplayOutcome::ConfirmationRequired { confirmation, .. } =
            self.service.replay(&id, request).await?
        else {
            bail!("unconfirmed force replay ran without a token");
        };

        let request =
            ReplayRequest { mode: ReplayMode::Force, confirmation_token: Some(confirmation.token) };
        match self.service.replay(&id, request).await? {
            ReplayOutcome::Completed(result) => Ok(result),
            ReplayOutcome::ConfirmationRequired { .. } => bail!("confirmed force replay was not run"),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Pending sweeper over this environment.
    pub fn sweeper(&self, config: SweeperConfig, token: CancellationToken) -> PendingSweeper {
        PendingSweeper::new(
            self.service.storage(),
            self.service.dispatcher().clone(),
            Arc::new(self.clock.clone()),
            config,
            token,
        )
    }

    /// Job runner executing follow-ups through the recording notifier.
    pub fn job_runner(&self, token: CancellationToken) -> JobRunner {
        let jobs: Arc<dyn JobStorage> = self.jobs.clone();
        JobRunner::new(jobs, Arc::new(self.clock.clone()), RunnerConfig::default(), token)
            .with_executor(PURCHASE_FOLLOW_UP, Arc::new(FollowUpExecutor::new(self.notifier.clone())))
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
