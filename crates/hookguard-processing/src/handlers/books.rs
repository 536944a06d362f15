//! Collaborator seams to the business modules the reference handlers drive.
//!
//! The event pipeline only needs two narrow operations per module: record
//! the mutation, and look up whether it is already recorded. In-memory books
//! back tests and local runs; the PostgreSQL books keep their own tables.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookguard_core::{CoreError, EventId};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Purchase lifecycle as far as the pipeline cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    /// Quote sent, not yet accepted.
    Quoted,
    /// Customer accepted the quote.
    Accepted,
}

impl PurchaseStatus {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Quoted => "quoted",
            Self::Accepted => "accepted",
        }
    }
}

/// A purchase record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    /// Purchase identifier.
    pub id: String,
    /// Current status.
    pub status: PurchaseStatus,
    /// Event that accepted it.
    pub accepted_event_id: Option<String>,
    /// When it was accepted.
    pub accepted_at: Option<DateTime<Utc>>,
    /// Bumped on every mutation.
    pub version: i64,
}

/// A repair ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairTicket {
    /// Ticket identifier.
    pub id: String,
    /// Event that created it.
    pub source_event_id: String,
    /// What needs repairing.
    pub description: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Purchase module seam.
#[async_trait]
pub trait PurchaseBook: Send + Sync + std::fmt::Debug {
    /// Loads a purchase.
    async fn find(&self, purchase_id: &str) -> Result<Option<Purchase>, CoreError>;

    /// Marks a purchase accepted by `event_id`, creating it if unknown.
    async fn mark_accepted(
        &self,
        purchase_id: &str,
        event_id: &EventId,
        at: DateTime<Utc>,
    ) -> Result<Purchase, CoreError>;
}

/// Repair module seam.
#[async_trait]
pub trait RepairBook: Send + Sync + std::fmt::Debug {
    /// Tickets created by an event.
    async fn find_by_source_event(&self, event_id: &EventId)
        -> Result<Vec<RepairTicket>, CoreError>;

    /// Creates a ticket. Not idempotent.
    async fn create(
        &self,
        event_id: &EventId,
        description: &str,
        at: DateTime<Utc>,
    ) -> Result<RepairTicket, CoreError>;
}

/// In-memory purchase book.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPurchaseBook {
    purchases: Arc<RwLock<HashMap<String, Purchase>>>,
}

impl InMemoryPurchaseBook {
    /// Creates an empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a purchase in the `quoted` state.
    pub async fn insert_quoted(&self, purchase_id: &str) -> Purchase {
        let purchase = Purchase {
            id: purchase_id.to_string(),
            status: PurchaseStatus::Quoted,
            accepted_event_id: None,
            accepted_at: None,
            version: 1,
        };
        self.purchases.write().await.insert(purchase.id.clone(), purchase.clone());
        purchase
    }
}

#[async_trait]
impl PurchaseBook for InMemoryPurchaseBook {
    async fn find(&self, purchase_id: &str) -> Result<Option<Purchase>, CoreError> {
        Ok(self.purchases.read().await.get(purchase_id).cloned())
    }

    async fn mark_accepted(
        &self,
        purchase_id: &str,
        event_id: &EventId,
        at: DateTime<Utc>,
    ) -> Result<Purchase, CoreError> {
        let mut purchases = self.purchases.write().await;
        let purchase = purchases.entry(purchase_id.to_string()).or_insert_with(|| Purchase {
            id: purchase_id.to_string(),
            status: PurchaseStatus::Quoted,
            accepted_event_id: None,
            accepted_at: None,
            version: 0,
        });
        purchase.status = PurchaseStatus::Accepted;
        purchase.accepted_event_id = Some(event_id.to_string());
        purchase.accepted_at = Some(at);
        purchase.version += 1;
        Ok(purchase.clone())
    }
}

/// In-memory repair book.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRepairBook {
    tickets: Arc<RwLock<Vec<RepairTicket>>>,
}

impl InMemoryRepairBook {
    /// Creates an empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every ticket, oldest first.
    pub async fn all(&self) -> Vec<RepairTicket> {
        self.tickets.read().await.clone()
    }
}

#[async_trait]
impl RepairBook for InMemoryRepairBook {
    async fn find_by_source_event(
        &self,
        event_id: &EventId,
    ) -> Result<Vec<RepairTicket>, CoreError> {
        Ok(self
            .tickets
            .read()
            .await
            .iter()
            .filter(|t| t.source_event_id == event_id.as_str())
            .cloned()
            .collect())
    }

    async fn create(
        &self,
        event_id: &EventId,
        description: &str,
        at: DateTime<Utc>,
    ) -> Result<RepairTicket, CoreError> {
        let ticket = RepairTicket {
            id: Uuid::new_v4().to_string(),
            source_event_id: event_id.to_string(),
            description: description.to_string(),
            created_at: at,
        };
        self.tickets.write().await.push(ticket.clone());
        Ok(ticket)
    }
}

const BOOK_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS purchases (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        accepted_event_id TEXT,
        accepted_at TIMESTAMPTZ,
        version BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repair_tickets (
        id TEXT PRIMARY KEY,
        source_event_id TEXT NOT NULL,
        description TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_repair_tickets_source_event
    ON repair_tickets (source_event_id)
    "#,
];

/// Creates the purchase and repair tables if they do not exist.
///
/// # Errors
///
/// Returns `CoreError` on the first failing statement.
pub async fn ensure_book_schema(pool: &PgPool) -> Result<(), CoreError> {
    for statement in BOOK_SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn purchase_from_row(row: &PgRow) -> Result<Purchase, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "accepted" => PurchaseStatus::Accepted,
        _ => PurchaseStatus::Quoted,
    };
    Ok(Purchase {
        id: row.try_get("id")?,
        status,
        accepted_event_id: row.try_get("accepted_event_id")?,
        accepted_at: row.try_get("accepted_at")?,
        version: row.try_get("version")?,
    })
}

fn ticket_from_row(row: &PgRow) -> Result<RepairTicket, sqlx::Error> {
    Ok(RepairTicket {
        id: row.try_get("id")?,
        source_event_id: row.try_get("source_event_id")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Purchase book stored in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgPurchaseBook {
    pool: PgPool,
}

impl PgPurchaseBook {
    /// Creates the book.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PurchaseBook for PgPurchaseBook {
    async fn find(&self, purchase_id: &str) -> Result<Option<Purchase>, CoreError> {
        let row = sqlx::query(
            "SELECT id, status, accepted_event_id, accepted_at, version FROM purchases WHERE id = $1",
        )
        .bind(purchase_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(purchase_from_row).transpose()?)
    }

    async fn mark_accepted(
        &self,
        purchase_id: &str,
        event_id: &EventId,
        at: DateTime<Utc>,
    ) -> Result<Purchase, CoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO purchases (id, status, accepted_event_id, accepted_at, version)
            VALUES ($1, $2, $3, $4, 1)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                accepted_event_id = EXCLUDED.accepted_event_id,
                accepted_at = EXCLUDED.accepted_at,
                version = purchases.version + 1
            RETURNING id, status, accepted_event_id, accepted_at, version
            "#,
        )
        .bind(purchase_id)
        .bind(PurchaseStatus::Accepted.as_str())
        .bind(event_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(purchase_from_row(&row)?)
    }
}

/// Repair book stored in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgRepairBook {
    pool: PgPool,
}

impl PgRepairBook {
    /// Creates the book.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RepairBook for PgRepairBook {
    async fn find_by_source_event(
        &self,
        event_id: &EventId,
    ) -> Result<Vec<RepairTicket>, CoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_event_id, description, created_at
            FROM repair_tickets
            WHERE source_event_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(ticket_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn create(
        &self,
        event_id: &EventId,
        description: &str,
        at: DateTime<Utc>,
    ) -> Result<RepairTicket, CoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO repair_tickets (id, source_event_id, description, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, source_event_id, description, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(event_id)
        .bind(description)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(ticket_from_row(&row)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepting_bumps_version_and_records_event() {
        let book = InMemoryPurchaseBook::new();
        book.insert_quoted("P1").await;

        let accepted = book.mark_accepted("P1", &EventId::from("evt_001"), Utc::now()).await.unwrap();
        assert_eq!(accepted.status, PurchaseStatus::Accepted);
        assert_eq!(accepted.accepted_event_id.as_deref(), Some("evt_001"));
        assert_eq!(accepted.version, 2);
    }

    #[tokio::test]
    async fn unknown_purchase_is_created_on_accept() {
        let book = InMemoryPurchaseBook::new();
        let accepted = book.mark_accepted("P9", &EventId::from("evt_9"), Utc::now()).await.unwrap();
        assert_eq!(accepted.version, 1);
        assert!(book.find("P9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn repair_book_creates_a_ticket_per_call() {
        let book = InMemoryRepairBook::new();
        let id = EventId::from("evt_r1");
        book.create(&id, "broken hinge", Utc::now()).await.unwrap();
        book.create(&id, "broken hinge", Utc::now()).await.unwrap();
        assert_eq!(book.find_by_source_event(&id).await.unwrap().len(), 2);
    }
}
