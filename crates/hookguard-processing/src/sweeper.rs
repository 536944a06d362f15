//! Background recovery of events stranded in `pending` or `processing`.
//!
//! An instance that crashes between insert and dispatch leaves the row
//! `pending`. One that crashes mid-attempt, or loses the store before the
//! outcome is written, leaves it `processing`. The sweeper first returns
//! `processing` rows whose lease is older than the grace period to
//! `pending`, then re-dispatches stale `pending` rows through the same
//! conditional claim ingestion uses. The re-dispatch is guarded, so an
//! effect that landed before the crash is detected instead of repeated.

use std::{sync::Arc, time::Duration};

use hookguard_core::{Clock, HookguardError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{dispatcher::Dispatcher, storage::EventStorage};

/// Sweeper settings.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Wait between sweeps.
    pub interval: Duration,
    /// Minimum age of a `pending` row, or of a `processing` claim, before it
    /// is considered stranded.
    pub stale_after: Duration,
    /// Maximum events re-dispatched per sweep.
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            batch_size: 50,
        }
    }
}

/// Re-dispatches stranded `pending` events until cancelled.
pub struct PendingSweeper {
    storage: Arc<dyn EventStorage>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
    cancellation_token: CancellationToken,
}

impl PendingSweeper {
    /// Creates a sweeper.
    pub fn new(
        storage: Arc<dyn EventStorage>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { storage, dispatcher, clock, config, cancellation_token }
    }

    /// Sweeps every interval until cancelled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "pending sweeper starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            if let Err(error) = self.sweep_once().await {
                error!(error = %error, "pending sweep failed");
            }

            tokio::select! {
                () = self.clock.sleep(self.config.interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!("pending sweeper stopped");
    }

    /// Runs one sweep and returns how many events it completed.
    ///
    /// # Errors
    ///
    /// Returns `HookguardError` if loading candidates fails. Failures of
    /// individual dispatches are logged and skipped.
    pub async fn sweep_once(&self) -> Result<usize, HookguardError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .map_err(|e| HookguardError::validation(format!("stale_after out of range: {e}")))?;
        let cutoff = self.clock.now_utc() - stale_after;

        let released =
            self.storage.release_stale_processing(cutoff, self.config.batch_size).await?;
        for event_id in &released {
            warn!(event_id = %event_id, "processing lease expired, event returned to pending");
        }

        let candidates =
            self.storage.find_stale_pending(cutoff, self.config.batch_size).await?;
        if candidates.is_empty() {
            return Ok(0);
        }
        debug!(candidates = candidates.len(), "found stranded pending events");

        let mut completed = 0;
        for event_id in candidates {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            match self.dispatcher.dispatch(&event_id).await {
                Ok(Some(report)) => {
                    info!(event_id = %event_id, status = %report.status, "stranded event dispatched");
                    completed += 1;
                },
                Ok(None) => {},
                Err(error) => error!(event_id = %event_id, error = %error, "sweep dispatch failed"),
            }
        }

        Ok(completed)
    }
}
