//! Core domain model for the chess tournament crawler.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ctc-core";

/// Country assumed for every listing the source does not mark otherwise.
pub const DEFAULT_HOME_COUNTRY: &str = "Germany";

pub const DEFAULT_TOURNAMENT_TYPE: &str = "Standard";
pub const DEFAULT_CATEGORY: &str = "Open";

/// Canonical month names, in calendar order.
pub const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Returns the canonical spelling of `name` if it is one of [`MONTHS`] (case-insensitive).
pub fn canonical_month(name: &str) -> Option<&'static str> {
    MONTHS
        .iter()
        .copied()
        .find(|m| m.eq_ignore_ascii_case(name.trim()))
}

/// One tournament listing as it moves through the pipeline.
///
/// `id`, `created_at` and `updated_at` stay `None` until a store persists the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    pub month: String,
    pub year: i32,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_international: bool,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub tournament_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TournamentRecord {
    /// A bare, unpersisted record carrying only its natural key.
    pub fn new(name: impl Into<String>, month: impl Into<String>, year: i32) -> Self {
        Self {
            id: None,
            name: name.into(),
            month: month.into(),
            year,
            start_date: None,
            end_date: None,
            is_international: false,
            city: None,
            country: None,
            tournament_type: None,
            category: None,
            website_url: None,
            description: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn natural_key(&self) -> NaturalKey<'_> {
        NaturalKey {
            name: &self.name,
            month: &self.month,
            year: self.year,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

/// The (name, month, year) triple that identifies a tournament.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NaturalKey<'a> {
    pub name: &'a str,
    pub month: &'a str,
    pub year: i32,
}

impl NaturalKey<'_> {
    pub fn matches(&self, record: &TournamentRecord) -> bool {
        record.name == self.name && record.month == self.month && record.year == self.year
    }
}

impl fmt::Display for NaturalKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.name, self.month, self.year)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status {other:?}")),
        }
    }
}

/// Append-only outcome entry written once per pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRunAudit {
    pub id: Uuid,
    pub run_at: DateTime<Utc>,
    pub tournaments_count: i64,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_month_is_case_insensitive() {
        assert_eq!(canonical_month("april"), Some("April"));
        assert_eq!(canonical_month(" DECEMBER "), Some("December"));
        assert_eq!(canonical_month("Mai"), None);
    }

    #[test]
    fn natural_key_ignores_non_key_fields() {
        let a = TournamentRecord::new("Dresden Open", "May", 2025);
        let mut b = a.clone();
        b.city = Some("Dresden".into());
        b.is_international = true;
        assert!(a.natural_key().matches(&b));
        assert!(!a.natural_key().matches(&TournamentRecord::new("Dresden Open", "May", 2026)));
    }

    #[test]
    fn run_status_uses_lowercase_wire_names() {
        assert_eq!(serde_json::to_string(&RunStatus::Failed).unwrap(), "\"failed\"");
        assert_eq!("success".parse::<RunStatus>().unwrap(), RunStatus::Success);
        assert!("running".parse::<RunStatus>().is_err());
    }

    #[test]
    fn unpersisted_record_omits_store_fields() {
        let value = serde_json::to_value(TournamentRecord::new("Bonn Cup", "June", 2025)).unwrap();
        assert!(value.get("id").is_none());
        assert!(value.get("created_at").is_none());
        assert_eq!(value["is_international"], false);
    }
}
