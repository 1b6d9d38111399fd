//! Crawl orchestration: configuration, enrichment, the pipeline and its scheduler.

pub mod config;
pub mod enrich;
pub mod pipeline;
pub mod scheduler;

use std::sync::Arc;

use anyhow::Result;

pub use config::{
    build_enricher, build_extractor, build_pipeline, build_store, parse_interval, CrawlerConfig,
    StoreBackend,
};
pub use enrich::{
    merge_enrichment, parse_reply, AnthropicClient, EnrichError, Enricher, EnrichmentResult,
    TextGenerator, MERGE_POLICY,
};
pub use pipeline::{CrawlError, CrawlPipeline, CrawlReport};
pub use scheduler::Scheduler;

pub const CRATE_NAME: &str = "ctc-sync";

/// Store plus pipeline wired from `config`.
pub async fn pipeline_from_config(config: &CrawlerConfig) -> Result<Arc<CrawlPipeline>> {
    let store = build_store(config).await?;
    Ok(Arc::new(build_pipeline(config, store)?))
}

