//! Collaborator doubles: recording notifier and misbehaving handlers.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use hookguard_core::{RelatedEntity, WebhookEvent};
use hookguard_processing::{
    EventHandler, GuardVerdict, HandlerError, HandlerOutcome, IdempotencyGuard, Notification,
    Notifier, NotifyError,
};
use tokio::sync::{Mutex, Notify};

/// Notifier that records what it was asked to send.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    /// Creates a notifier that succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Notifications accepted so far.
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Transport("notification endpoint unreachable".to_string()));
        }
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

/// Handler that panics.
#[derive(Debug, Default)]
pub struct PanickingHandler;

#[async_trait]
impl EventHandler for PanickingHandler {
    async fn handle(&self, _event: &WebhookEvent) -> Result<HandlerOutcome, HandlerError> {
        panic!("handler exploded")
    }
}

/// Handler that fails with a fixed message.
#[derive(Debug)]
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    /// Creates a handler failing with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[async_trait]
impl EventHandler for FailingHandler {
    async fn handle(&self, _event: &WebhookEvent) -> Result<HandlerOutcome, HandlerError> {
        Err(HandlerError::Collaborator(self.message.clone()))
    }
}

/// Handler counting its calls and pointing at a fixed purchase.
#[derive(Debug, Clone, Default)]
pub struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

impl CountingHandler {
    /// Creates a handler with a zero count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<HandlerOutcome, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(HandlerOutcome::related(RelatedEntity::Purchase(event.event_id.to_string())))
    }
}

/// Guard that never finds the effect applied.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverApplied;

#[async_trait]
impl IdempotencyGuard for NeverApplied {
    async fn check(&self, _event: &WebhookEvent) -> Result<GuardVerdict, HandlerError> {
        Ok(GuardVerdict::NotApplied)
    }
}

/// Handler that parks until released, holding the event in `processing`.
#[derive(Debug, Clone, Default)]
pub struct BlockingHandler {
    gate: Arc<Notify>,
    entered: Arc<AtomicUsize>,
}

impl BlockingHandler {
    /// Creates a closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets one parked (or the next) call finish.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    /// Calls that reached the gate.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Yields until `count` calls reached the gate.
    pub async fn wait_entered(&self, count: usize) {
        while self.entered() < count {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl EventHandler for BlockingHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<HandlerOutcome, HandlerError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        Ok(HandlerOutcome::related(RelatedEntity::RepairTicket(event.event_id.to_string())))
    }
}
