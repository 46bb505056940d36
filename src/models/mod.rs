use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Listing ───────────────────────────────────────────────────────────────────

/// One calendar entry, rebuilt from scratch on every fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingRecord {
    pub identifier: String,
    pub company_name: String,
    pub symbol: Option<String>,
    pub share_type: String,
    pub opening_date: Option<NaiveDate>,
    pub closing_date: Option<NaiveDate>,
    pub price_per_unit: Option<f64>,
    pub url: Option<String>,
    /// Everything else the source published (units, issue_manager, status, ...).
    pub raw_fields: BTreeMap<String, String>,
}

impl ListingRecord {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.raw_fields.get(key).map(|s| s.as_str())
    }
}

// ── Seen marker ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeenRecord {
    pub identifier: String,
    pub first_seen_at: NaiveDateTime,
}

// ── Raw rows ──────────────────────────────────────────────────────────────────

/// One source entry before cleaning. Values are already stripped of markup.
#[derive(Debug, Clone, Default)]
pub struct RawListingRow {
    pub company_name: Option<String>,
    pub symbol: Option<String>,
    pub share_type: Option<String>,
    pub opening_date: Option<String>,
    pub closing_date: Option<String>,
    pub price: Option<String>,
    pub url: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// What a retrieval strategy hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum RawContent {
    /// API payload (DataTables server-side response).
    Json(String),
    /// Rendered page HTML.
    Markup(String),
}

impl RawContent {
    pub fn len(&self) -> usize {
        match self {
            RawContent::Json(s) | RawContent::Markup(s) => s.len(),
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            RawContent::Json(_) => "json",
            RawContent::Markup(_) => "markup",
        }
    }
}

// ── Fetch bookkeeping ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Primary,
    Fallback,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Primary => f.write_str("primary"),
            StrategyKind::Fallback => f.write_str("fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success { bytes: usize },
    Blocked,
    NetworkError,
    Timeout,
}

/// One try of one strategy; lives only for the duration of `fetch()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchAttempt {
    pub strategy: StrategyKind,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
}

/// Successful fetch result.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub content: RawContent,
    pub strategy: StrategyKind,
    pub attempts: Vec<FetchAttempt>,
}

// ── Cycle results ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub strategy: Option<StrategyKind>,
    pub fetched: usize,
    pub known: usize,
    pub new: usize,
    pub notified: usize,
    pub notify_failures: usize,
    pub persist_failures: usize,
}
