//! Best-effort refinement of extracted records through a language model.
//!
//! Enrichment never fails a run: every error is logged and the record passes
//! through unchanged. Without a configured generator the enricher is the
//! identity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ctc_core::TournamentRecord;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-3-haiku-20240307";
const MAX_TOKENS: u32 = 1000;

const SYSTEM_PROMPT: &str = "You analyze chess tournament information and return structured data as requested. Always respond with valid JSON.";

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("building enrichment client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("api key contains characters not allowed in a header")]
    InvalidCredential,
    #[error("enrichment request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("enrichment service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("enrichment reply had no text content")]
    EmptyReply,
    #[error("enrichment reply is not the expected JSON: {0}")]
    MalformedReply(#[from] serde_json::Error),
}

/// Single-shot text completion; the seam the enricher is tested through.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, EnrichError>;
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: [ApiMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Anthropic Messages API client.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(
        api_key: &str,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EnrichError> {
        let mut headers = HeaderMap::new();
        let mut key =
            HeaderValue::from_str(api_key).map_err(|_| EnrichError::InvalidCredential)?;
        key.set_sensitive(true);
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(EnrichError::Client)?;

        Ok(Self {
            http,
            base_url: ANTHROPIC_API_URL.to_string(),
            model: model.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl TextGenerator for AnthropicClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, EnrichError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            temperature: 0.0,
            system,
            messages: [ApiMessage {
                role: "user",
                content: prompt,
            }],
        };

        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EnrichError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let reply: MessagesResponse = resp.json().await?;
        reply
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text)
            .filter(|text| !text.trim().is_empty())
            .ok_or(EnrichError::EmptyReply)
    }
}

/// Structured reply expected from the model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnrichmentResult {
    pub name: String,
    pub month: String,
    pub year: i32,
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
    pub description: Option<String>,
}

pub fn build_prompt(record: &TournamentRecord) -> String {
    format!(
        "Analyze this chess tournament and return structured data.\n\n\
         Tournament name: {name}\n\
         Month: {month}\n\
         Year: {year}\n\n\
         Return a JSON object with these fields:\n\
         - name: the tournament name\n\
         - month: the month name in English\n\
         - year: the year as a number\n\
         - is_international: true if the tournament is international, otherwise false\n\
         - city: the host city, if it can be determined\n\
         - country: the host country, if it can be determined\n\
         - tournament_type: one of Standard, Rapid, Blitz, Online\n\
         - category: one of Open, Youth, Women, Senior, Team\n\
         - description: one short sentence describing the tournament\n\n\
         Respond with ONLY the JSON object, no other text.",
        name = record.name,
        month = record.month,
        year = record.year,
    )
}

/// Parses a reply that may be wrapped in a ```json fence.
pub fn parse_reply(reply: &str) -> Result<EnrichmentResult, EnrichError> {
    Ok(serde_json::from_str(strip_code_fence(reply))?)
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let body = &trimmed[start + 3..];
    let body = body.strip_prefix("json").unwrap_or(body);
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

pub type MergeRule = fn(&mut TournamentRecord, &EnrichmentResult, &str);

/// Field-by-field rules applied in order when merging a model reply.
/// The natural key (name, month, year) is never touched.
pub const MERGE_POLICY: &[(&str, MergeRule)] = &[
    ("is_international", merge_is_international),
    ("city", merge_city),
    ("country", merge_country),
    ("tournament_type", merge_tournament_type),
    ("category", merge_category),
    ("description", merge_description),
];

fn merge_is_international(record: &mut TournamentRecord, result: &EnrichmentResult, _: &str) {
    if !record.is_international {
        record.is_international = result.is_international;
    }
}

fn merge_city(record: &mut TournamentRecord, result: &EnrichmentResult, _: &str) {
    if record.city.is_none() {
        record.city = non_empty(&result.city);
    }
}

/// Only replaces the home-country default, and only for international events.
fn merge_country(record: &mut TournamentRecord, result: &EnrichmentResult, home_country: &str) {
    let still_default = record
        .country
        .as_deref()
        .map_or(true, |country| country == home_country);
    if result.is_international && still_default {
        if let Some(country) = non_empty(&result.country) {
            record.country = Some(country);
        }
    }
}

fn merge_tournament_type(record: &mut TournamentRecord, result: &EnrichmentResult, _: &str) {
    if record.tournament_type.is_none() {
        record.tournament_type = non_empty(&result.tournament_type);
    }
}

fn merge_category(record: &mut TournamentRecord, result: &EnrichmentResult, _: &str) {
    if record.category.is_none() {
        record.category = non_empty(&result.category);
    }
}

fn merge_description(record: &mut TournamentRecord, result: &EnrichmentResult, _: &str) {
    if let Some(description) = non_empty(&result.description) {
        record.description = Some(description);
    }
}

pub fn merge_enrichment(
    mut record: TournamentRecord,
    result: &EnrichmentResult,
    home_country: &str,
) -> TournamentRecord {
    for (_, rule) in MERGE_POLICY {
        rule(&mut record, result, home_country);
    }
    record
}

#[derive(Clone)]
pub struct Enricher {
    generator: Option<Arc<dyn TextGenerator>>,
    home_country: String,
}

impl std::fmt::Debug for Enricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enricher")
            .field("enabled", &self.is_enabled())
            .field("home_country", &self.home_country)
            .finish()
    }
}

impl Enricher {
    pub fn new(generator: Arc<dyn TextGenerator>, home_country: impl Into<String>) -> Self {
        Self {
            generator: Some(generator),
            home_country: home_country.into(),
        }
    }

    /// Identity enricher used when no credential is configured.
    pub fn disabled(home_country: impl Into<String>) -> Self {
        Self {
            generator: None,
            home_country: home_country.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.generator.is_some()
    }

    pub async fn enrich(&self, record: TournamentRecord) -> TournamentRecord {
        let Some(generator) = &self.generator else {
            return record;
        };
        let reply = generator.complete(SYSTEM_PROMPT, &build_prompt(&record)).await;
        match reply.and_then(|text| parse_reply(&text)) {
            Ok(result) => {
                debug!(tournament = %record.natural_key(), "enrichment merged");
                merge_enrichment(record, &result, &self.home_country)
            }
            Err(err) => {
                warn!(
                    tournament = %record.natural_key(),
                    error = %err,
                    "enrichment failed, keeping extracted record"
                );
                record
            }
        }
    }

    /// One request at a time, in input order.
    pub async fn enrich_all(&self, records: Vec<TournamentRecord>) -> Vec<TournamentRecord> {
        let mut enriched = Vec::with_capacity(records.len());
        for record in records {
            enriched.push(self.enrich(record).await);
        }
        enriched
    }
}
