//! Listing filters, pagination and aggregate summaries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{EventStatus, WebhookEvent};

/// Page size used when the caller does not pass one.
pub const DEFAULT_PAGE_SIZE: u32 = 25;

/// Largest page an operator may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Operator listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Restrict to one status.
    pub status: Option<EventStatus>,
    /// Restrict to one event type.
    pub event_type: Option<String>,
    /// Case-insensitive free text over ids, type, related id, error and payload.
    pub q: Option<String>,
    /// `Some(true)` only ignored, `Some(false)` only active. `None` hides
    /// ignored events from the failed view and shows everything otherwise.
    pub ignored: Option<bool>,
    /// 1-based page number.
    pub page: u32,
    /// Rows per page.
    pub page_size: u32,
}

impl EventFilter {
    /// Clamps paging to valid bounds and drops blank text filters.
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.page_size = match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        self.q = self.q.map(|q| q.trim().to_string()).filter(|q| !q.is_empty());
        self.event_type =
            self.event_type.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        self
    }

    /// Effective ignored filter after applying the failed-view default.
    pub fn effective_ignored(&self) -> Option<bool> {
        match (self.ignored, self.status) {
            (Some(ignored), _) => Some(ignored),
            (None, Some(EventStatus::Failed)) => Some(false),
            (None, _) => None,
        }
    }

    /// Row offset of the first event on the page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    /// Evaluates the filter against one event in memory.
    ///
    /// Mirrors the SQL predicate built by the PostgreSQL repository.
    pub fn matches(&self, event: &WebhookEvent) -> bool {
        if let Some(status) = self.status {
            if event.status != status {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }
        if let Some(ignored) = self.effective_ignored() {
            if event.is_ignored() != ignored {
                return false;
            }
        }
        match &self.q {
            Some(q) => text_matches(event, &q.to_lowercase()),
            None => true,
        }
    }
}

fn text_matches(event: &WebhookEvent, needle: &str) -> bool {
    let haystacks = [
        Some(event.event_id.as_str().to_lowercase()),
        Some(event.event_type.to_lowercase()),
        event.related_entity.as_ref().map(|e| e.id().to_lowercase()),
        event.error_message.as_ref().map(|m| m.to_lowercase()),
        Some(event.raw_payload.to_string().to_lowercase()),
    ];
    haystacks.iter().flatten().any(|h| h.contains(needle))
}

/// Pagination envelope returned with every listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Current 1-based page.
    pub page: u32,
    /// Rows per page.
    pub page_size: u32,
    /// Rows matching the filter.
    pub total: u64,
    /// Pages available at this page size.
    pub total_pages: u64,
}

impl Pagination {
    /// Builds the envelope for a normalized filter.
    pub fn new(filter: &EventFilter, total: u64) -> Self {
        let page_size = u64::from(filter.page_size.max(1));
        Self {
            page: filter.page,
            page_size: filter.page_size,
            total,
            total_pages: total.div_ceil(page_size),
        }
    }
}

/// One page of events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    /// Events, newest first.
    pub events: Vec<WebhookEvent>,
    /// Paging metadata.
    pub pagination: Pagination,
}

/// Aggregate counts for the operator dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    /// Rows per status; `duplicate` counts absorbed redeliveries.
    pub by_status: BTreeMap<String, i64>,
    /// Rows per event type.
    pub by_event_type: BTreeMap<String, i64>,
    /// Failed and not ignored.
    pub open_failures: i64,
    /// Ignored by an operator.
    pub ignored: i64,
}

impl EventSummary {
    /// Builds a summary from in-memory events.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a WebhookEvent>) -> Self {
        let mut summary = Self::empty();
        for event in events {
            *summary.by_status.entry(event.status.to_string()).or_insert(0) += 1;
            *summary
                .by_status
                .entry(EventStatus::Duplicate.to_string())
                .or_insert(0) += i64::from(event.duplicate_count);
            *summary.by_event_type.entry(event.event_type.clone()).or_insert(0) += 1;
            if event.is_open_failure() {
                summary.open_failures += 1;
            }
            if event.is_ignored() {
                summary.ignored += 1;
            }
        }
        summary
    }

    /// Summary with every status present at zero.
    pub fn empty() -> Self {
        Self {
            by_status: EventStatus::ALL.iter().map(|s| (s.to_string(), 0)).collect(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::models::{EventId, NewWebhookEvent};

    fn event(id: &str, status: EventStatus) -> WebhookEvent {
        let mut event = WebhookEvent::from_new(NewWebhookEvent {
            event_id: EventId::from(id),
            event_type: "quote_accepted".to_string(),
            version: "1".to_string(),
            signature_valid: true,
            signature_provided: String::new(),
            signature_computed: String::new(),
            source_ip: None,
            raw_payload: json!({"purchase_id": "P-77"}),
            received_at: Utc::now(),
        });
        event.status = status;
        event
    }

    #[test]
    fn normalized_clamps_paging() {
        let filter = EventFilter { page: 0, page_size: 5000, ..Default::default() }.normalized();
        assert_eq!(filter.page, 1);
        assert_eq!(filter.page_size, MAX_PAGE_SIZE);

        let filter = EventFilter::default().normalized();
        assert_eq!(filter.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(filter.offset(), 0);
    }

    #[test]
    fn failed_view_hides_ignored_by_default() {
        let mut ignored = event("evt_a", EventStatus::Failed);
        ignored.ignored_at = Some(Utc::now());
        let open = event("evt_b", EventStatus::Failed);

        let failed_view =
            EventFilter { status: Some(EventStatus::Failed), ..Default::default() }.normalized();
        assert!(!failed_view.matches(&ignored));
        assert!(failed_view.matches(&open));

        let ignored_view = EventFilter {
            status: Some(EventStatus::Failed),
            ignored: Some(true),
            ..Default::default()
        };
        assert!(ignored_view.matches(&ignored));
        assert!(!ignored_view.matches(&open));

        let everything = EventFilter::default().normalized();
        assert!(everything.matches(&ignored));
    }

    #[test]
    fn free_text_searches_payload_and_identifiers() {
        let e = event("evt_search", EventStatus::Processed);
        let by_payload = EventFilter { q: Some("p-77".into()), ..Default::default() }.normalized();
        let by_id = EventFilter { q: Some("SEARCH".into()), ..Default::default() }.normalized();
        let miss = EventFilter { q: Some("nothing".into()), ..Default::default() }.normalized();
        assert!(by_payload.matches(&e));
        assert!(by_id.matches(&e));
        assert!(!miss.matches(&e));
    }

    #[test]
    fn pagination_rounds_pages_up() {
        let filter = EventFilter { page_size: 10, ..Default::default() }.normalized();
        assert_eq!(Pagination::new(&filter, 21).total_pages, 3);
        assert_eq!(Pagination::new(&filter, 0).total_pages, 0);
    }

    #[test]
    fn summary_counts_duplicates_and_open_failures() {
        let mut processed = event("evt_1", EventStatus::Processed);
        processed.duplicate_count = 2;
        let failed = event("evt_2", EventStatus::Failed);
        let mut ignored = event("evt_3", EventStatus::Failed);
        ignored.ignored_at = Some(Utc::now());

        let summary = EventSummary::from_events([&processed, &failed, &ignored]);
        assert_eq!(summary.by_status["processed"], 1);
        assert_eq!(summary.by_status["failed"], 2);
        assert_eq!(summary.by_status["duplicate"], 2);
        assert_eq!(summary.by_status["pending"], 0);
        assert_eq!(summary.by_event_type["quote_accepted"], 3);
        assert_eq!(summary.open_failures, 1);
        assert_eq!(summary.ignored, 1);
    }
}
