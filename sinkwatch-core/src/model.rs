// Stored record types and query parameters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sinkwatch_scanner::{Category, ExternalGroup, SinkKind, SourceType};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    /// Registrable domain.
    pub site_id: String,
    pub display_url: String,
    pub hosts: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_scan_at: Option<DateTime<Utc>>,
}

/// Latest observation of one page. Re-scans overwrite everything but `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub site_id: String,
    pub url_norm: String,
    pub url: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub endpoints: Vec<String>,
    pub resources: Vec<String>,
    pub script_urls: Vec<String>,
    pub endpoint_groups: BTreeMap<Category, Vec<String>>,
    pub resource_groups: BTreeMap<Category, Vec<String>>,
    pub externals: BTreeMap<String, ExternalGroup>,
    pub scanned_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub site_id: String,
    pub endpoint: String,
    pub category: Category,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub seen_count: i64,
    pub hosts: Vec<String>,
    /// Most recent first, distinct, at most [`MAX_SOURCE_URLS`].
    pub source_urls: Vec<String>,
}

pub const MAX_SOURCE_URLS: usize = 5;

/// One sighting of an endpoint on a page.
#[derive(Debug, Clone)]
pub struct EndpointObservation {
    pub site_id: String,
    pub endpoint: String,
    pub host: String,
    pub page_url: String,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    pub sig: String,
    pub site_id: String,
    pub page_url: String,
    pub source_type: SourceType,
    pub source_url: String,
    pub kind: SinkKind,
    pub line: u32,
    pub col: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub func: Option<String>,
    pub snippet: String,
    pub first_detected_at: DateTime<Utc>,
    pub last_detected_at: DateTime<Utc>,
    pub hits: i64,
}

/// Aggregates a watch compares between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSummary {
    pub endpoints: i64,
    pub sinks: i64,
    pub last_endpoint_at: Option<DateTime<Utc>>,
    pub last_sink_at: Option<DateTime<Utc>>,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchState {
    pub site_id: String,
    pub url_norm: String,
    pub url: String,
    pub enabled: bool,
    pub freq_min: i64,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_change_at: Option<DateTime<Utc>>,
    pub last_summary: WatchSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one watch execution, written back to the watch row.
#[derive(Debug, Clone)]
pub struct WatchRun {
    pub ran_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    /// `None` keeps the previous summary.
    pub summary: Option<WatchSummary>,
    pub changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscordSettings {
    pub webhook_url: String,
    pub enabled: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone)]
pub struct BulkItem {
    pub key: String,
    pub outcome: std::result::Result<UpsertOutcome, String>,
}

/// Per-item results of a best-effort bulk upsert.
#[derive(Debug, Clone, Default)]
pub struct BulkReport {
    pub items: Vec<BulkItem>,
}

impl BulkReport {
    pub fn push(&mut self, key: impl Into<String>, outcome: std::result::Result<UpsertOutcome, String>) {
        self.items.push(BulkItem {
            key: key.into(),
            outcome,
        });
    }

    pub fn inserted(&self) -> usize {
        self.count(UpsertOutcome::Inserted)
    }

    pub fn updated(&self) -> usize {
        self.count(UpsertOutcome::Updated)
    }

    pub fn failed(&self) -> Vec<&BulkItem> {
        self.items.iter().filter(|i| i.outcome.is_err()).collect()
    }

    fn count(&self, want: UpsertOutcome) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, Ok(o) if o == want))
            .count()
    }
}

/// A page of results plus the unpaged total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[derive(Debug, Clone)]
pub struct EndpointFilter {
    pub site_id: Option<String>,
    pub category: Option<Category>,
    pub contains: Option<String>,
    pub min_seen: Option<i64>,
    pub limit: usize,
    pub skip: usize,
}

impl Default for EndpointFilter {
    fn default() -> Self {
        Self {
            site_id: None,
            category: None,
            contains: None,
            min_seen: None,
            limit: 100,
            skip: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SinkFilter {
    pub site_id: Option<String>,
    /// Empty means every kind.
    pub kinds: Vec<SinkKind>,
    pub page_url: Option<String>,
    pub source_contains: Option<String>,
    pub limit: usize,
    pub skip: usize,
}

impl Default for SinkFilter {
    fn default() -> Self {
        Self {
            site_id: None,
            kinds: Vec::new(),
            page_url: None,
            source_contains: None,
            limit: 100,
            skip: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    pub site_id: Option<String>,
    pub url_norm: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStats {
    pub by_category: BTreeMap<String, i64>,
    /// Highest `seen_count` first.
    pub top: Vec<EndpointRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkStats {
    pub by_kind: BTreeMap<String, i64>,
    /// Most recently detected first.
    pub recent: Vec<SinkRecord>,
}
