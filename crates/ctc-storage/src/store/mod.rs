//! Tournament persistence contract shared by every storage backend.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use ctc_core::{CrawlRunAudit, RunStatus, TournamentRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Exact-match filters plus a free-text `search` over name, description and city.
///
/// Every populated field must match (AND); `search` matches when any of its three
/// columns contains the term, ignoring case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TournamentFilter {
    pub name: Option<String>,
    pub month: Option<String>,
    pub year: Option<i32>,
    pub is_international: Option<bool>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub tournament_type: Option<String>,
    pub category: Option<String>,
    pub website_url: Option<String>,
    pub search: Option<String>,
}

impl TournamentFilter {
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
    }

    /// Text columns with an exact-match constraint, as (column, value).
    pub(crate) fn text_conditions(&self) -> Vec<(&'static str, &str)> {
        [
            ("name", &self.name),
            ("month", &self.month),
            ("city", &self.city),
            ("country", &self.country),
            ("tournament_type", &self.tournament_type),
            ("category", &self.category),
            ("website_url", &self.website_url),
        ]
        .into_iter()
        .filter_map(|(column, value)| value.as_deref().map(|v| (column, v)))
        .collect()
    }

    pub fn matches(&self, record: &TournamentRecord) -> bool {
        let text_ok = self.text_conditions().into_iter().all(|(column, expected)| {
            let actual = match column {
                "name" => Some(record.name.as_str()),
                "month" => Some(record.month.as_str()),
                "city" => record.city.as_deref(),
                "country" => record.country.as_deref(),
                "tournament_type" => record.tournament_type.as_deref(),
                "category" => record.category.as_deref(),
                "website_url" => record.website_url.as_deref(),
                _ => None,
            };
            actual == Some(expected)
        });
        if !text_ok {
            return false;
        }
        if self.year.is_some_and(|year| year != record.year) {
            return false;
        }
        if self
            .is_international
            .is_some_and(|flag| flag != record.is_international)
        {
            return false;
        }
        match self.search_term() {
            None => true,
            Some(term) => {
                let needle = term.to_lowercase();
                [
                    Some(record.name.as_str()),
                    record.description.as_deref(),
                    record.city.as_deref(),
                ]
                .into_iter()
                .flatten()
                .any(|haystack| haystack.to_lowercase().contains(&needle))
            }
        }
    }
}

/// 1-indexed page request. Zero values are raised to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
        }
    }
}

impl Pagination {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.page_size.max(1))
    }

    /// `ceil(total / page_size)`, never below 1.
    pub fn total_pages(&self, total: u64) -> u32 {
        let pages = total.div_ceil(u64::from(self.page_size.max(1))).max(1);
        u32::try_from(pages).unwrap_or(u32::MAX)
    }

    pub fn page_of<T>(&self, records: Vec<T>, total: u64) -> Page<T> {
        Page {
            records,
            total,
            page: self.page.max(1),
            page_size: self.page_size.max(1),
            pages: self.total_pages(total),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub pages: u32,
}

/// Columns whose distinct values are exposed for facet listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistinctField {
    Month,
    Year,
    City,
    Country,
    TournamentType,
    Category,
}

impl DistinctField {
    pub fn column(self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
            Self::City => "city",
            Self::Country => "country",
            Self::TournamentType => "tournament_type",
            Self::Category => "category",
        }
    }

    pub fn value_of(self, record: &TournamentRecord) -> Option<FieldValue> {
        let text = match self {
            Self::Year => return Some(FieldValue::Int(i64::from(record.year))),
            Self::Month => Some(record.month.as_str()),
            Self::City => record.city.as_deref(),
            Self::Country => record.country.as_deref(),
            Self::TournamentType => record.tournament_type.as_deref(),
            Self::Category => record.category.as_deref(),
        };
        text.filter(|t| has_text(t))
            .map(|t| FieldValue::Text(t.to_string()))
    }
}

/// Blank test shared by every backend's `distinct_values`.
pub(crate) fn has_text(value: &str) -> bool {
    !value.trim().is_empty()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Text(String),
}

/// Persistence capability the pipeline and the API are written against.
///
/// `insert` is idempotent on (name, month, year): inserting a record whose key is
/// already stored returns the stored row unchanged. Callers still check `exists`
/// first so they can tell new records from known ones.
#[async_trait]
pub trait TournamentStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn exists(&self, name: &str, month: &str, year: i32) -> Result<bool, StoreError>;

    async fn insert(&self, record: TournamentRecord) -> Result<TournamentRecord, StoreError>;

    async fn query(
        &self,
        filter: &TournamentFilter,
        pagination: Pagination,
    ) -> Result<Page<TournamentRecord>, StoreError>;

    /// Sorted, unique, non-empty values of `field`.
    async fn distinct_values(&self, field: DistinctField) -> Result<Vec<FieldValue>, StoreError>;

    async fn record_run(
        &self,
        tournaments_count: i64,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<CrawlRunAudit, StoreError>;

    /// Newest first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<CrawlRunAudit>, StoreError>;
}

pub(crate) fn validate_for_insert(record: &TournamentRecord) -> Result<(), StoreError> {
    if record.name.trim().is_empty() {
        return Err(StoreError::InvalidRecord("name must not be empty".into()));
    }
    if record.month.trim().is_empty() {
        return Err(StoreError::InvalidRecord(format!(
            "month must not be empty for {:?}",
            record.name
        )));
    }
    if record.year <= 0 {
        return Err(StoreError::InvalidRecord(format!(
            "year must be positive for {:?}, got {}",
            record.name, record.year
        )));
    }
    Ok(())
}
