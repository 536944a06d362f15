//! Handler contract and the `(event_type, version)` registry.
//!
//! A registration pairs the handler performing the business mutation with
//! the idempotency guard that decides whether that mutation is already
//! reflected downstream. Safe replay and first dispatch consult the guard;
//! force replay skips it.

use std::{collections::HashMap, fmt, sync::Arc};

use hookguard_core::{CoreError, RelatedEntity, WebhookEvent};
use thiserror::Error;

/// Error raised by a handler or guard.
///
/// Any of these flips the event to `failed` with `handler_exception`.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The stored payload lacks a field the handler needs.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The business collaborator rejected or failed the mutation.
    #[error("collaborator failed: {0}")]
    Collaborator(String),

    /// Collaborator storage failed.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

impl HandlerError {
    /// Builds an `InvalidPayload` for a missing string field.
    pub fn missing_field(field: &str) -> Self {
        Self::InvalidPayload(format!("missing string field `{field}`"))
    }
}

/// Result of a successful handler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// Business record the critical mutation touched.
    pub related_entity: Option<RelatedEntity>,
    /// Best-effort side effects that failed without failing the event.
    pub side_effect_failures: Vec<String>,
}

impl HandlerOutcome {
    /// Outcome pointing at the mutated entity.
    pub fn related(entity: RelatedEntity) -> Self {
        Self { related_entity: Some(entity), side_effect_failures: Vec::new() }
    }
}

/// Whether an event's effect is already present downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    /// The effect exists; the entity it lives on.
    Applied(RelatedEntity),
    /// The effect has not been applied.
    NotApplied,
}

/// Performs the business mutation for one event type.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + fmt::Debug {
    /// Applies the event. Must treat `event.raw_payload` as untrusted.
    async fn handle(&self, event: &WebhookEvent) -> Result<HandlerOutcome, HandlerError>;
}

/// Decides whether a handler's effect is already applied.
#[async_trait::async_trait]
pub trait IdempotencyGuard: Send + Sync + fmt::Debug {
    /// Inspects downstream state for `event`'s effect.
    async fn check(&self, event: &WebhookEvent) -> Result<GuardVerdict, HandlerError>;
}

/// A handler together with its idempotency predicate.
#[derive(Debug, Clone)]
pub struct HandlerRegistration {
    /// Business mutation.
    pub handler: Arc<dyn EventHandler>,
    /// Already-applied predicate.
    pub guard: Arc<dyn IdempotencyGuard>,
}

/// Maps `(event_type, version)` to a registration.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    registrations: HashMap<(String, String), HandlerRegistration>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any earlier one for the same pair.
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        version: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        guard: Arc<dyn IdempotencyGuard>,
    ) -> &mut Self {
        self.registrations
            .insert((event_type.into(), version.into()), HandlerRegistration { handler, guard });
        self
    }

    /// Looks up the registration for a pair.
    pub fn get(&self, event_type: &str, version: &str) -> Option<&HandlerRegistration> {
        self.registrations.get(&(event_type.to_string(), version.to_string()))
    }

    /// Registered pairs, sorted.
    pub fn registered(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self.registrations.keys().cloned().collect();
        pairs.sort();
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Noop;

    #[async_trait::async_trait]
    impl EventHandler for Noop {
        async fn handle(&self, _event: &WebhookEvent) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::default())
        }
    }

    #[async_trait::async_trait]
    impl IdempotencyGuard for Noop {
        async fn check(&self, _event: &WebhookEvent) -> Result<GuardVerdict, HandlerError> {
            Ok(GuardVerdict::NotApplied)
        }
    }

    #[test]
    fn lookup_is_keyed_by_type_and_version() {
        let mut registry = HandlerRegistry::new();
        registry.register("quote_accepted", "1", Arc::new(Noop), Arc::new(Noop));

        assert!(registry.get("quote_accepted", "1").is_some());
        assert!(registry.get("quote_accepted", "2").is_none());
        assert!(registry.get("repair_requested", "1").is_none());
        assert_eq!(registry.registered(), vec![("quote_accepted".to_string(), "1".to_string())]);
    }
}
