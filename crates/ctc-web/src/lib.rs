//! JSON query API over the tournament store, plus a manual crawl trigger.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ctc_storage::{DistinctField, Pagination, TournamentFilter, TournamentStore};
use ctc_sync::CrawlPipeline;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "ctc-web";

pub const MAX_PAGE_SIZE: u32 = 100;
const DEFAULT_RUNS_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TournamentStore>,
    /// Absent when the API is served read-only; `POST /api/crawl` then answers 503.
    pub pipeline: Option<Arc<CrawlPipeline>>,
}

impl AppState {
    pub fn new(store: Arc<dyn TournamentStore>) -> Self {
        Self {
            store,
            pipeline: None,
        }
    }

    pub fn with_pipeline(pipeline: Arc<CrawlPipeline>) -> Self {
        Self {
            store: pipeline.store().clone(),
            pipeline: Some(pipeline),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TournamentsQuery {
    month: Option<String>,
    year: Option<i32>,
    is_international: Option<bool>,
    tournament_type: Option<String>,
    category: Option<String>,
    city: Option<String>,
    country: Option<String>,
    search: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

impl TournamentsQuery {
    fn into_parts(self) -> (TournamentFilter, Pagination) {
        let pagination = Pagination::new(
            self.page.unwrap_or(1),
            self.page_size.unwrap_or(20).min(MAX_PAGE_SIZE),
        );
        let filter = TournamentFilter {
            month: self.month,
            year: self.year,
            is_international: self.is_international,
            tournament_type: self.tournament_type,
            category: self.category,
            city: self.city,
            country: self.country,
            search: self.search,
            ..Default::default()
        };
        (filter, pagination)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/tournaments", get(tournaments_handler))
        .route("/api/months", get(months_handler))
        .route("/api/years", get(years_handler))
        .route("/api/categories", get(categories_handler))
        .route("/api/tournament-types", get(tournament_types_handler))
        .route("/api/countries", get(countries_handler))
        .route("/api/crawl", post(crawl_handler))
        .route("/api/crawl-runs", get(crawl_runs_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` resolves; in-flight requests are allowed to finish.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "healthy",
        "message": "API is up and running",
        "store": state.store.backend(),
    }))
    .into_response()
}

async fn tournaments_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TournamentsQuery>,
) -> Response {
    let (filter, pagination) = query.into_parts();
    match state.store.query(&filter, pagination).await {
        Ok(page) => Json(json!({
            "status": "success",
            "count": page.records.len(),
            "data": page.records,
            "meta": {
                "total": page.total,
                "page": page.page,
                "page_size": page.page_size,
                "pages": page.pages,
            },
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn months_handler(State(state): State<Arc<AppState>>) -> Response {
    distinct_values(&state, DistinctField::Month).await
}

async fn years_handler(State(state): State<Arc<AppState>>) -> Response {
    distinct_values(&state, DistinctField::Year).await
}

async fn categories_handler(State(state): State<Arc<AppState>>) -> Response {
    distinct_values(&state, DistinctField::Category).await
}

async fn tournament_types_handler(State(state): State<Arc<AppState>>) -> Response {
    distinct_values(&state, DistinctField::TournamentType).await
}

async fn countries_handler(State(state): State<Arc<AppState>>) -> Response {
    distinct_values(&state, DistinctField::Country).await
}

async fn distinct_values(state: &AppState, field: DistinctField) -> Response {
    match state.store.distinct_values(field).await {
        Ok(values) => Json(json!({ "status": "success", "data": values })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn crawl_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(pipeline) = &state.pipeline else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "detail": "crawling is not enabled on this server" })),
        )
            .into_response();
    };
    match pipeline.run_once().await {
        Ok(report) => Json(json!({
            "status": "success",
            "message": "Crawl operation completed successfully",
            "tournaments_processed": report.records.len(),
            "inserted": report.inserted,
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn crawl_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUNS_LIMIT)
        .clamp(1, MAX_PAGE_SIZE as usize);
    match state.store.recent_runs(limit).await {
        Ok(runs) => Json(json!({ "status": "success", "data": runs })).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "detail": err.to_string() })),
    )
        .into_response()
}
