//! One crawl: fetch → extract → enrich → dedup → persist → audit.

use std::sync::Arc;
use std::time::Instant;

use ctc_adapters::Extractor;
use ctc_core::{RunStatus, TournamentRecord};
use ctc_storage::{FetchError, PageArchive, PageSource, RawPage, StoreError, TournamentStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::enrich::Enricher;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CrawlReport {
    /// Newly inserted rows in stored form, known ones as extracted and enriched.
    pub records: Vec<TournamentRecord>,
    pub inserted: usize,
}

pub struct CrawlPipeline {
    source: Arc<dyn PageSource>,
    extractor: Extractor,
    enricher: Enricher,
    store: Arc<dyn TournamentStore>,
    archive: Option<PageArchive>,
    run_lock: Mutex<()>,
}

impl CrawlPipeline {
    pub fn new(
        source: Arc<dyn PageSource>,
        extractor: Extractor,
        enricher: Enricher,
        store: Arc<dyn TournamentStore>,
    ) -> Self {
        Self {
            source,
            extractor,
            enricher,
            store,
            archive: None,
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn store(&self) -> &Arc<dyn TournamentStore> {
        &self.store
    }

    /// Runs a full crawl and audits its outcome. Concurrent callers queue on an
    /// internal lock, so at most one run is in flight per pipeline.
    pub async fn run_once(&self) -> Result<CrawlReport, CrawlError> {
        let _running = self.run_lock.lock().await;
        let started = Instant::now();
        info!(url = %self.source.url(), store = self.store.backend(), "crawl started");

        match self.execute().await {
            Ok(report) => {
                info!(
                    tournaments = report.records.len(),
                    inserted = report.inserted,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "crawl finished"
                );
                self.audit(report.records.len(), RunStatus::Success, None)
                    .await;
                Ok(report)
            }
            Err(err) => {
                error!(error = %err, "crawl failed");
                self.audit(0, RunStatus::Failed, Some(err.to_string())).await;
                Err(err)
            }
        }
    }

    async fn execute(&self) -> Result<CrawlReport, CrawlError> {
        let page = self.source.fetch().await?;
        self.archive_page(&page).await;

        let extracted = self.extractor.extract(&page.html);
        if extracted.is_empty() {
            info!(url = %page.url, "no tournaments found on page");
            return Ok(CrawlReport::default());
        }
        info!(tournaments = extracted.len(), "extracted candidates");

        let enriched = self.enricher.enrich_all(extracted).await;

        let mut report = CrawlReport::default();
        for record in enriched {
            if self
                .store
                .exists(&record.name, &record.month, record.year)
                .await?
            {
                report.records.push(record);
                continue;
            }
            let stored = self.store.insert(record).await?;
            report.inserted += 1;
            report.records.push(stored);
        }
        Ok(report)
    }

    async fn archive_page(&self, page: &RawPage) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.store_page(page).await {
            Ok(archived) => info!(
                path = %archived.absolute_path.display(),
                bytes = archived.byte_size,
                already_present = archived.already_present,
                "archived source page"
            ),
            Err(err) => warn!(error = %format!("{err:#}"), "archiving source page failed"),
        }
    }

    async fn audit(&self, count: usize, status: RunStatus, error_message: Option<String>) {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        if let Err(err) = self.store.record_run(count, status, error_message).await {
            error!(error = %err, status = %status, "recording crawl run failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::enrich::tests::ScriptedGenerator;
    use async_trait::async_trait;
    use chrono::Utc;
    use ctc_core::CrawlRunAudit;
    use ctc_storage::{DistinctField, FieldValue, MemoryStore, Page, Pagination, TournamentFilter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    pub(crate) const CALENDAR: &str = r#"
        <html><body>
          <h1>Turnierkalender 2025</h1>
          <div class="month"><h2>April</h2>
            <ul>
              <li><a href="/t/1">Berlin Open International Championship</a></li>
              <li><a href="/t/2">Hamburg Schnellschach Cup</a></li>
            </ul>
          </div>
          <div class="month"><h2>Mai</h2>
            <ul><li><a href="/t/3">Dresden Jugend Open</a></li></ul>
          </div>
        </body></html>"#;

    pub(crate) struct StaticSource {
        html: String,
        pub(crate) calls: AtomicUsize,
    }

    impl StaticSource {
        pub(crate) fn new(html: &str) -> Self {
            Self {
                html: html.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageSource for StaticSource {
        fn url(&self) -> &str {
            "https://calendar.test/"
        }

        async fn fetch(&self) -> Result<RawPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawPage::new(self.url(), self.html.clone(), Utc::now()))
        }
    }

    pub(crate) struct TimeoutSource {
        pub(crate) calls: AtomicUsize,
    }

    #[async_trait]
    impl PageSource for TimeoutSource {
        fn url(&self) -> &str {
            "https://calendar.test/"
        }

        async fn fetch(&self) -> Result<RawPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Timeout {
                url: self.url().to_string(),
                timeout: Duration::from_secs(30),
            })
        }
    }

    /// Memory store whose lookups or audit writes can be made to fail.
    struct FlakyStore {
        inner: MemoryStore,
        fail_lookups: bool,
        fail_audits: bool,
    }

    impl FlakyStore {
        fn outage() -> StoreError {
            StoreError::CorruptRow("connection reset".into())
        }
    }

    #[async_trait]
    impl TournamentStore for FlakyStore {
        fn backend(&self) -> &'static str {
            "flaky"
        }

        async fn exists(&self, name: &str, month: &str, year: i32) -> Result<bool, StoreError> {
            if self.fail_lookups {
                return Err(Self::outage());
            }
            self.inner.exists(name, month, year).await
        }

        async fn insert(&self, record: TournamentRecord) -> Result<TournamentRecord, StoreError> {
            self.inner.insert(record).await
        }

        async fn query(
            &self,
            filter: &TournamentFilter,
            pagination: Pagination,
        ) -> Result<Page<TournamentRecord>, StoreError> {
            self.inner.query(filter, pagination).await
        }

        async fn distinct_values(
            &self,
            field: DistinctField,
        ) -> Result<Vec<FieldValue>, StoreError> {
            self.inner.distinct_values(field).await
        }

        async fn record_run(
            &self,
            tournaments_count: i64,
            status: RunStatus,
            error_message: Option<String>,
        ) -> Result<CrawlRunAudit, StoreError> {
            if self.fail_audits {
                return Err(Self::outage());
            }
            self.inner
                .record_run(tournaments_count, status, error_message)
                .await
        }

        async fn recent_runs(&self, limit: usize) -> Result<Vec<CrawlRunAudit>, StoreError> {
            self.inner.recent_runs(limit).await
        }
    }

    fn flaky_pipeline(
        store: &MemoryStore,
        fail_lookups: bool,
        fail_audits: bool,
    ) -> CrawlPipeline {
        CrawlPipeline::new(
            Arc::new(StaticSource::new(CALENDAR)),
            Extractor::default(),
            Enricher::disabled("Germany"),
            Arc::new(FlakyStore {
                inner: store.clone(),
                fail_lookups,
                fail_audits,
            }),
        )
    }

    fn pipeline(source: Arc<dyn PageSource>, store: &MemoryStore) -> CrawlPipeline {
        CrawlPipeline::new(
            source,
            Extractor::default(),
            Enricher::disabled("Germany"),
            Arc::new(store.clone()),
        )
    }

    #[tokio::test]
    async fn first_run_inserts_every_candidate() {
        let store = MemoryStore::new();
        let report = pipeline(Arc::new(StaticSource::new(CALENDAR)), &store)
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.inserted, 3);
        assert_eq!(report.records.len(), 3);
        assert!(report.records.iter().all(TournamentRecord::is_persisted));
        assert_eq!(report.records[0].name, "Berlin Open International Championship");
        assert_eq!(report.records[2].month, "May");
        assert_eq!(report.records[2].year, 2025);
        assert_eq!(store.len().await, 3);

        let runs = store.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].tournaments_count, 3);
    }

    #[tokio::test]
    async fn rerunning_identical_content_adds_nothing() {
        let store = MemoryStore::new();
        let pipeline = pipeline(Arc::new(StaticSource::new(CALENDAR)), &store);

        pipeline.run_once().await.unwrap();
        let second = pipeline.run_once().await.unwrap();

        assert_eq!(second.inserted, 0);
        assert_eq!(second.records.len(), 3);
        assert!(second.records.iter().all(|r| r.id.is_none()));
        assert_eq!(store.len().await, 3);
        assert_eq!(store.recent_runs(5).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fetch_timeout_is_audited_and_returned() {
        let store = MemoryStore::new();
        let err = pipeline(
            Arc::new(TimeoutSource {
                calls: AtomicUsize::new(0),
            }),
            &store,
        )
        .run_once()
        .await
        .unwrap_err();

        assert!(matches!(err, CrawlError::Fetch(FetchError::Timeout { .. })), "{err}");
        assert!(store.is_empty().await);
        let runs = store.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].tournaments_count, 0);
        assert!(runs[0]
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("timed out")));
    }

    #[tokio::test]
    async fn page_without_tournaments_is_a_successful_empty_run() {
        let store = MemoryStore::new();
        let report = pipeline(
            Arc::new(StaticSource::new("<html><body><p>Wartungsarbeiten</p></body></html>")),
            &store,
        )
        .run_once()
        .await
        .unwrap();

        assert_eq!(report, CrawlReport::default());
        let runs = store.recent_runs(5).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].tournaments_count, 0);
    }

    #[tokio::test]
    async fn enrichment_failures_keep_extracted_records() {
        let store = MemoryStore::new();
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err("service down".into()),
            Ok(r#"{"name":"Hamburg Schnellschach Cup","month":"April","year":2025,
                   "is_international":false,"description":"Seven rounds of rapid."}"#
                .into()),
            Ok("garbage".into()),
        ]));
        let pipeline = CrawlPipeline::new(
            Arc::new(StaticSource::new(CALENDAR)),
            Extractor::default(),
            Enricher::new(generator, "Germany"),
            Arc::new(store.clone()),
        );

        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(report.records[0].description, None);
        assert!(report.records[0].is_international);
        assert_eq!(
            report.records[1].description.as_deref(),
            Some("Seven rounds of rapid.")
        );
        assert_eq!(report.records[1].tournament_type.as_deref(), Some("Rapid"));
        assert_eq!(report.records[2].category.as_deref(), Some("Youth"));
    }

    #[tokio::test]
    async fn archive_snapshot_is_written_when_configured() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let pipeline = pipeline(Arc::new(StaticSource::new(CALENDAR)), &store)
            .with_archive(PageArchive::new(dir.path()));

        pipeline.run_once().await.unwrap();

        let day = Utc::now().format("%Y%m%d").to_string();
        let snapshot = dir
            .path()
            .join(day)
            .join(format!("{}.html", PageArchive::sha256_hex(CALENDAR.as_bytes())));
        assert_eq!(std::fs::read_to_string(snapshot).unwrap(), CALENDAR);
    }

    #[tokio::test]
    async fn concurrent_runs_do_not_duplicate_rows() {
        let store = MemoryStore::new();
        let source = Arc::new(StaticSource::new(CALENDAR));
        let pipeline = Arc::new(pipeline(source.clone(), &store));

        let a = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.run_once().await.unwrap() }
        });
        let b = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.run_once().await.unwrap() }
        });
        let inserted = a.await.unwrap().inserted + b.await.unwrap().inserted;

        assert_eq!(inserted, 3);
        assert_eq!(store.len().await, 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_failure_fails_and_audits_the_run() {
        let store = MemoryStore::new();
        let err = flaky_pipeline(&store, true, false)
            .run_once()
            .await
            .unwrap_err();

        assert!(matches!(err, CrawlError::Store(StoreError::CorruptRow(_))), "{err}");
        assert!(store.is_empty().await);
        let runs = store.recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].tournaments_count, 0);
        assert_eq!(runs[0].error_message.as_deref(), Some(err.to_string().as_str()));
    }

    #[tokio::test]
    async fn audit_failure_does_not_change_the_outcome() {
        let store = MemoryStore::new();
        let report = flaky_pipeline(&store, false, true).run_once().await.unwrap();

        assert_eq!(report.inserted, 3);
        assert_eq!(store.len().await, 3);
        assert!(store.recent_runs(5).await.unwrap().is_empty());
    }
}
