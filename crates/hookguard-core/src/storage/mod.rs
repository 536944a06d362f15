//! PostgreSQL repositories for the event log and delayed jobs.
//!
//! The repository layer translates between domain models and table rows.
//! Every mutation that guards a lifecycle transition is a single conditional
//! `UPDATE ... WHERE status = ...`, so two instances racing on the same row
//! can never both win.

use std::sync::Arc;

use sqlx::PgPool;

pub mod scheduled_jobs;
pub mod schema;
pub mod webhook_events;

use crate::error::Result;

/// Container for all repository instances sharing one pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for the inbound event log.
    pub webhook_events: Arc<webhook_events::Repository>,

    /// Repository for delayed jobs.
    pub scheduled_jobs: Arc<scheduled_jobs::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            webhook_events: Arc::new(webhook_events::Repository::new(pool.clone())),
            scheduled_jobs: Arc::new(scheduled_jobs::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Creates tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError` if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        schema::migrate(&self.pool).await
    }

    /// Verifies the database answers a trivial query.
    ///
    /// Used by the `/ready` endpoint.
    ///
    /// # Errors
    ///
    /// Returns `CoreError` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_without_connecting() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }
}
