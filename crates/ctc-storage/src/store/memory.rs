//! Process-local store backed by ordered vectors.
//!
//! Nothing is durable: every `MemoryStore::new()` starts empty and the data lives
//! exactly as long as the last clone of the handle.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ctc_core::{CrawlRunAudit, RunStatus, TournamentRecord};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{
    validate_for_insert, DistinctField, FieldValue, Page, Pagination, StoreError,
    TournamentFilter, TournamentStore,
};

#[derive(Debug, Default)]
struct MemoryState {
    tournaments: Vec<TournamentRecord>,
    runs: Vec<CrawlRunAudit>,
}

/// Cloning shares the underlying collections.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.tournaments.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TournamentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn exists(&self, name: &str, month: &str, year: i32) -> Result<bool, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .tournaments
            .iter()
            .any(|t| t.name == name && t.month == month && t.year == year))
    }

    async fn insert(&self, mut record: TournamentRecord) -> Result<TournamentRecord, StoreError> {
        validate_for_insert(&record)?;
        let mut state = self.state.write().await;
        let key = record.natural_key();
        if let Some(existing) = state.tournaments.iter().find(|t| key.matches(t)) {
            debug!(tournament = %key, "natural key already stored, keeping existing row");
            return Ok(existing.clone());
        }

        let now = Utc::now();
        record.id = Some(Uuid::new_v4());
        record.created_at = Some(now);
        record.updated_at = Some(now);
        state.tournaments.push(record.clone());
        Ok(record)
    }

    async fn query(
        &self,
        filter: &TournamentFilter,
        pagination: Pagination,
    ) -> Result<Page<TournamentRecord>, StoreError> {
        let state = self.state.read().await;
        let matching: Vec<&TournamentRecord> =
            state.tournaments.iter().filter(|t| filter.matches(t)).collect();
        let total = matching.len() as u64;
        let offset = usize::try_from(pagination.offset()).unwrap_or(usize::MAX);
        let records = matching
            .into_iter()
            .skip(offset)
            .take(pagination.page_size.max(1) as usize)
            .cloned()
            .collect();
        Ok(pagination.page_of(records, total))
    }

    async fn distinct_values(&self, field: DistinctField) -> Result<Vec<FieldValue>, StoreError> {
        let state = self.state.read().await;
        let mut values: Vec<FieldValue> = state
            .tournaments
            .iter()
            .filter_map(|t| field.value_of(t))
            .collect();
        values.sort();
        values.dedup();
        Ok(values)
    }

    async fn record_run(
        &self,
        tournaments_count: i64,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<CrawlRunAudit, StoreError> {
        let audit = CrawlRunAudit {
            id: Uuid::new_v4(),
            run_at: Utc::now(),
            tournaments_count,
            status,
            error_message,
        };
        self.state.write().await.runs.push(audit.clone());
        Ok(audit)
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<CrawlRunAudit>, StoreError> {
        let state = self.state.read().await;
        Ok(state.runs.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn record(name: &str, month: &str, year: i32) -> TournamentRecord {
        TournamentRecord::new(name, month, year)
    }

    async fn seeded(names: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        for name in names {
            store.insert(record(name, "April", 2025)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn new_store_is_empty_every_time() {
        let first = MemoryStore::new();
        first.insert(record("Bonn Open", "May", 2025)).await.unwrap();
        first.record_run(1, RunStatus::Success, None).await.unwrap();

        let restarted = MemoryStore::new();
        assert!(restarted.is_empty().await);
        assert!(restarted.recent_runs(10).await.unwrap().is_empty());
        assert!(!restarted.exists("Bonn Open", "May", 2025).await.unwrap());
    }

    #[tokio::test]
    async fn insert_assigns_identity_and_timestamps() {
        let store = MemoryStore::new();
        let saved = store.insert(record("Essen Cup", "June", 2025)).await.unwrap();
        assert!(saved.id.is_some());
        assert!(saved.created_at.is_some());
        assert_eq!(saved.created_at, saved.updated_at);
        assert!(store.exists("Essen Cup", "June", 2025).await.unwrap());
        assert!(!store.exists("Essen Cup", "July", 2025).await.unwrap());
    }

    #[tokio::test]
    async fn insert_is_idempotent_on_natural_key() {
        let store = MemoryStore::new();
        let first = store.insert(record("Bremen Open", "March", 2025)).await.unwrap();
        let mut again = record("Bremen Open", "March", 2025);
        again.city = Some("Bremen".into());
        let second = store.insert(again).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.city, None);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn search_page_size_one_splits_two_matches_over_two_pages() {
        let store = seeded(&["Berlin Open", "Hamburg Open", "Leipzig Blitz Cup"]).await;
        let filter = TournamentFilter {
            search: Some("open".into()),
            ..Default::default()
        };

        let page = store.query(&filter, Pagination::new(1, 1)).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.total, 2);
        assert_eq!(page.pages, 2);
    }

    #[tokio::test]
    async fn concatenated_pages_reproduce_the_full_result() {
        let names: Vec<String> = (0..7).map(|i| format!("Open No. {i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let store = seeded(&refs).await;
        store.insert(record("Unrelated Cup", "May", 2025)).await.unwrap();
        let filter = TournamentFilter {
            month: Some("April".into()),
            ..Default::default()
        };

        let first = store.query(&filter, Pagination::new(1, 3)).await.unwrap();
        assert_eq!(first.total, 7);
        assert_eq!(first.pages, 3);

        let mut collected = Vec::new();
        for page in 1..=first.pages {
            let p = store.query(&filter, Pagination::new(page, 3)).await.unwrap();
            collected.extend(p.records.into_iter().map(|r| r.name));
        }
        assert_eq!(collected, names);

        let past_end = store.query(&filter, Pagination::new(4, 3)).await.unwrap();
        assert!(past_end.records.is_empty());
        assert_eq!(past_end.total, 7);
    }

    #[tokio::test]
    async fn empty_result_still_reports_one_page() {
        let store = MemoryStore::new();
        let page = store
            .query(&TournamentFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert_eq!(page.pages, 1);
    }

    #[tokio::test]
    async fn distinct_values_are_sorted_unique_and_non_empty() {
        let store = MemoryStore::new();
        for (name, month, year, category) in [
            ("A Open", "May", 2026, Some("Youth")),
            ("B Open", "April", 2025, Some("Open")),
            ("C Open", "May", 2025, None),
            ("D Open", "April", 2025, Some("")),
            ("E Open", "April", 2025, Some("\t\n")),
        ] {
            let mut r = record(name, month, year);
            r.category = category.map(Into::into);
            store.insert(r).await.unwrap();
        }

        assert_eq!(
            store.distinct_values(DistinctField::Month).await.unwrap(),
            vec![FieldValue::Text("April".into()), FieldValue::Text("May".into())]
        );
        assert_eq!(
            store.distinct_values(DistinctField::Year).await.unwrap(),
            vec![FieldValue::Int(2025), FieldValue::Int(2026)]
        );
        assert_eq!(
            store.distinct_values(DistinctField::Category).await.unwrap(),
            vec![FieldValue::Text("Open".into()), FieldValue::Text("Youth".into())]
        );
    }

    #[tokio::test]
    async fn concurrent_inserts_of_one_key_keep_a_single_row() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert(record("Race Open", "May", 2025)).await.unwrap()
            }));
        }
        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().id);
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn runs_are_append_only_and_listed_newest_first() {
        let store = MemoryStore::new();
        store.record_run(3, RunStatus::Success, None).await.unwrap();
        store
            .record_run(0, RunStatus::Failed, Some("timeout".into()))
            .await
            .unwrap();

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].error_message.as_deref(), Some("timeout"));
        assert_eq!(runs[1].tournaments_count, 3);
        assert_eq!(store.recent_runs(1).await.unwrap().len(), 1);
    }
}
