//! Best-effort outbound notifications.
//!
//! Handlers and the follow-up job report through a [`Notifier`]. A failing
//! notifier never fails the event that triggered it; callers record the
//! error as a side-effect failure instead.

use std::time::Duration;

use async_trait::async_trait;
use hookguard_core::RelatedEntity;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

/// Notification delivery failure.
#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    /// Could not reach the receiver, or timed out.
    #[error("notification transport failed: {0}")]
    Transport(String),

    /// The receiver answered with a non-success status.
    #[error("notification rejected with HTTP {status}")]
    Rejected {
        /// HTTP status returned by the receiver
        status: u16,
    },

    /// Notifier could not be configured.
    #[error("notifier configuration error: {0}")]
    Configuration(String),
}

/// A message for a human or downstream system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Machine-readable kind, e.g. `quote_accepted`.
    pub kind: String,
    /// Entity the message is about.
    pub entity: Option<RelatedEntity>,
    /// Human-readable text.
    pub message: String,
    /// Structured details.
    pub payload: serde_json::Value,
}

/// Sends notifications.
#[async_trait]
pub trait Notifier: Send + Sync + std::fmt::Debug {
    /// Delivers one notification.
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Notifier that only writes a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            kind = %notification.kind,
            entity = ?notification.entity,
            message = %notification.message,
            "notification"
        );
        Ok(())
    }
}

/// Notifier posting JSON to a configured URL.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    /// Creates a notifier with a bounded request timeout.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Configuration` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("hookguard-notifier/1.0")
            .build()
            .map_err(|e| NotifyError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let span = info_span!("notify", kind = %notification.kind, url = %self.url);

        async move {
            let response = self
                .client
                .post(&self.url)
                .json(notification)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        NotifyError::Transport("request timed out".to_string())
                    } else {
                        NotifyError::Transport(e.to_string())
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(NotifyError::Rejected { status: status.as_u16() });
            }

            tracing::debug!(status = status.as_u16(), "notification delivered");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
