use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ctc_adapters::{ExtractionRules, Extractor};
use ctc_core::DEFAULT_HOME_COUNTRY;
use ctc_storage::{
    HttpClientConfig, HttpFetcher, MemoryStore, PageArchive, PostgresStore, TableNames,
    TournamentStore,
};
use tracing::{info, warn};

use crate::enrich::{AnthropicClient, Enricher, DEFAULT_MODEL};
use crate::pipeline::CrawlPipeline;

pub const DEFAULT_TARGET_URL: &str = "https://www.schachinter.net/";
pub const DEFAULT_CRAWL_INTERVAL_HOURS: u64 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres { url: String },
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub target_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub enrich_timeout_secs: u64,
    pub crawl_interval_hours: u64,
    pub poll_secs: u64,
    pub store: StoreBackend,
    pub tables: TableNames,
    pub home_country: String,
    pub rules_path: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub web_port: u16,
}

impl CrawlerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key → value source; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} must be a non-negative integer, got {raw:?}")),
                None => Ok(default),
            }
        };

        let store = match get("CTC_STORE").map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("memory") => StoreBackend::Memory,
            Some("postgres") => StoreBackend::Postgres {
                url: get("DATABASE_URL").context("CTC_STORE=postgres requires DATABASE_URL")?,
            },
            Some(other) => bail!("CTC_STORE must be memory or postgres, got {other:?}"),
            None => match get("DATABASE_URL") {
                Some(url) => StoreBackend::Postgres { url },
                None => StoreBackend::Memory,
            },
        };

        let defaults = TableNames::default();
        Ok(Self {
            target_url: get("TARGET_URL").unwrap_or_else(|| DEFAULT_TARGET_URL.to_string()),
            user_agent: get("USER_AGENT")
                .unwrap_or_else(|| ctc_storage::fetch::DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: number("CTC_HTTP_TIMEOUT_SECS", 30)?,
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            anthropic_model: get("ANTHROPIC_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            enrich_timeout_secs: number("CTC_ENRICH_TIMEOUT_SECS", 60)?,
            crawl_interval_hours: parse_interval(get("CRAWL_INTERVAL").as_deref()),
            poll_secs: number("CTC_POLL_SECS", 60)?.max(1),
            store,
            tables: TableNames {
                tournaments: get("CTC_TOURNAMENT_TABLE").unwrap_or(defaults.tournaments),
                runs: get("CTC_RUNS_TABLE").unwrap_or(defaults.runs),
            },
            home_country: get("CTC_HOME_COUNTRY")
                .unwrap_or_else(|| DEFAULT_HOME_COUNTRY.to_string()),
            rules_path: get("CTC_RULES_PATH").map(PathBuf::from),
            archive_dir: get("CTC_ARCHIVE_DIR").map(PathBuf::from),
            web_port: match get("CTC_WEB_PORT") {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("CTC_WEB_PORT must be a port number, got {raw:?}"))?,
                None => 8000,
            },
        })
    }

    /// Saturates instead of overflowing for absurdly large hour counts.
    pub fn crawl_interval(&self) -> Duration {
        Duration::from_secs(self.crawl_interval_hours.saturating_mul(3600))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }
}

/// Hours between runs. Anything but a positive integer warns and falls back to 24.
pub fn parse_interval(raw: Option<&str>) -> u64 {
    let Some(raw) = raw else {
        return DEFAULT_CRAWL_INTERVAL_HOURS;
    };
    match raw.trim().parse::<u64>() {
        Ok(hours) if hours > 0 => hours,
        _ => {
            warn!(
                value = raw,
                fallback = DEFAULT_CRAWL_INTERVAL_HOURS,
                "invalid CRAWL_INTERVAL, using default"
            );
            DEFAULT_CRAWL_INTERVAL_HOURS
        }
    }
}

pub async fn build_store(config: &CrawlerConfig) -> Result<Arc<dyn TournamentStore>> {
    match &config.store {
        StoreBackend::Memory => {
            info!("using in-memory store; data is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres { url } => {
            let store = PostgresStore::connect(url, config.tables.clone())
                .await
                .context("connecting to postgres")?;
            store
                .ensure_schema()
                .await
                .context("creating tournament tables")?;
            info!(
                tournaments = %config.tables.tournaments,
                runs = %config.tables.runs,
                "using postgres store"
            );
            Ok(Arc::new(store))
        }
    }
}

pub fn build_extractor(config: &CrawlerConfig) -> Result<Extractor> {
    let rules = match &config.rules_path {
        Some(path) => ExtractionRules::from_yaml_file(path)
            .with_context(|| format!("loading extraction rules from {}", path.display()))?,
        None => ExtractionRules::default(),
    };
    Ok(Extractor::new(rules, config.home_country.clone()))
}

pub fn build_enricher(config: &CrawlerConfig) -> Result<Enricher> {
    let Some(api_key) = &config.anthropic_api_key else {
        info!("ANTHROPIC_API_KEY not set; enrichment disabled");
        return Ok(Enricher::disabled(config.home_country.clone()));
    };
    let client = AnthropicClient::new(
        api_key,
        config.anthropic_model.clone(),
        Duration::from_secs(config.enrich_timeout_secs),
    )
    .context("building enrichment client")?;
    Ok(Enricher::new(Arc::new(client), config.home_country.clone()))
}

pub fn build_pipeline(
    config: &CrawlerConfig,
    store: Arc<dyn TournamentStore>,
) -> Result<CrawlPipeline> {
    let fetcher = HttpFetcher::new(
        config.target_url.clone(),
        HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
        },
    )
    .context("building http client")?;

    let mut pipeline = CrawlPipeline::new(
        Arc::new(fetcher),
        build_extractor(config)?,
        build_enricher(config)?,
        store,
    );
    if let Some(dir) = &config.archive_dir {
        pipeline = pipeline.with_archive(PageArchive::new(dir));
    }
    Ok(pipeline)
}
