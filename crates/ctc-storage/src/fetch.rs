//! Single-page HTTP fetch with a fixed client identity.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{info, info_span, Instrument};

use crate::archive::PageArchive;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; ctc-crawler/0.1)";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Raw content of the source page plus the link targets found on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub url: String,
    pub html: String,
    /// `href` values in document order. Informational only; never followed.
    pub links: Vec<String>,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
}

impl RawPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        let html = html.into();
        Self {
            url: url.into(),
            links: extract_links(&html),
            content_hash: PageArchive::sha256_hex(html.as_bytes()),
            html,
            fetched_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out after {}s", .timeout.as_secs())]
    Timeout { url: String, timeout: Duration },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Where a pipeline run gets its page from.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn url(&self) -> &str;

    async fn fetch(&self) -> Result<RawPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        headers.insert(header::UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .default_headers(headers)
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            url: url.into(),
            timeout: config.timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: self.url.clone(),
                timeout: self.timeout,
            }
        } else {
            FetchError::Request {
                url: self.url.clone(),
                source: err,
            }
        }
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<RawPage, FetchError> {
        let span = info_span!("http_fetch", url = %self.url);
        async {
            let resp = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| self.classify(e))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let html = resp.text().await.map_err(|e| self.classify(e))?;
            let page = RawPage::new(self.url.clone(), html, Utc::now());
            info!(
                bytes = page.html.len(),
                links = page.links.len(),
                "fetched source page"
            );
            Ok(page)
        }
        .instrument(span)
        .await
    }
}

fn extract_links(html: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    Html::parse_document(html)
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .map(ToString::to_string)
        .collect()
}
