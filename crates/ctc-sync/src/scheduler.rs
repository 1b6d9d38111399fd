use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::pipeline::CrawlPipeline;

/// Runs the pipeline immediately, then again whenever `interval` has passed
/// since the previous run started. Elapsed time is checked every `poll`.
pub struct Scheduler {
    pipeline: Arc<CrawlPipeline>,
    interval: Duration,
    poll: Duration,
}

impl Scheduler {
    pub fn new(pipeline: Arc<CrawlPipeline>, interval: Duration, poll: Duration) -> Self {
        Self {
            pipeline,
            interval,
            poll: poll.max(Duration::from_millis(1)),
        }
    }

    /// Loops until `shutdown` resolves and returns the number of runs started.
    /// Shutdown is only observed between runs, never during one.
    pub async fn run<F>(&self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            interval_secs = self.interval.as_secs(),
            poll_secs = self.poll.as_secs(),
            "scheduler started"
        );

        let mut last_start = Instant::now();
        self.crawl().await;
        let mut runs = 1;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(runs, "scheduler stopping");
                    return runs;
                }
                _ = time::sleep(self.poll) => {
                    if last_start.elapsed() >= self.interval {
                        last_start = Instant::now();
                        self.crawl().await;
                        runs += 1;
                    }
                }
            }
        }
    }

    async fn crawl(&self) {
        match self.pipeline.run_once().await {
            Ok(report) => info!(
                tournaments = report.records.len(),
                inserted = report.inserted,
                "scheduled crawl complete"
            ),
            Err(err) => warn!(error = %err, "scheduled crawl failed, will retry next interval"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::Enricher;
    use crate::pipeline::tests::{StaticSource, TimeoutSource, CALENDAR};
    use ctc_adapters::Extractor;
    use ctc_core::RunStatus;
    use ctc_storage::{MemoryStore, PageSource, TournamentStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOUR: Duration = Duration::from_secs(3600);
    const MINUTE: Duration = Duration::from_secs(60);

    fn scheduler(source: Arc<dyn PageSource>, store: &MemoryStore) -> Scheduler {
        let pipeline = CrawlPipeline::new(
            source,
            Extractor::default(),
            Enricher::disabled("Germany"),
            Arc::new(store.clone()),
        );
        Scheduler::new(Arc::new(pipeline), HOUR, MINUTE)
    }

    #[tokio::test(start_paused = true)]
    async fn runs_on_start_and_after_each_interval() {
        let store = MemoryStore::new();
        let source = Arc::new(StaticSource::new(CALENDAR));
        let runs = scheduler(source.clone(), &store)
            .run(time::sleep(2 * HOUR + 30 * MINUTE))
            .await;

        assert_eq!(runs, 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.len().await, 3);
        assert_eq!(store.recent_runs(10).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_runs_do_not_stop_the_loop() {
        let store = MemoryStore::new();
        let source = Arc::new(TimeoutSource {
            calls: AtomicUsize::new(0),
        });
        let runs = scheduler(source.clone(), &store)
            .run(time::sleep(3 * HOUR + MINUTE))
            .await;

        assert_eq!(runs, 4);
        let audits = store.recent_runs(10).await.unwrap();
        assert_eq!(audits.len(), 4);
        assert!(audits.iter().all(|a| a.status == RunStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_shutdown_still_completes_the_first_run() {
        let store = MemoryStore::new();
        let source = Arc::new(StaticSource::new(CALENDAR));
        let runs = scheduler(source.clone(), &store)
            .run(std::future::ready(()))
            .await;

        assert_eq!(runs, 1);
        assert_eq!(store.len().await, 3);
    }
}
