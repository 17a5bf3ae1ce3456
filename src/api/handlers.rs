use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::analytics::{PageSummary, PageType, Statistics, Visit, VisitId, Visitor};

pub struct AppState {
    pub statistics: Arc<Statistics>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub status: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn not_found(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub visits: usize,
    pub visitors: usize,
    pub pages: usize,
    pub estimated_current_visitors: usize,
    pub average_visits_per_visitor: f64,
}

#[derive(Debug, Serialize)]
pub struct VisitResponse {
    pub id: VisitId,
    pub timestamp: DateTime<Utc>,
    pub page_type: PageType,
    pub loading_time_ms: f64,
    pub time_spent_ms: f64,
    pub status: u16,
    pub content_type: String,
    pub referer: String,
    pub visitor: String,
    pub page: String,
}

impl From<&Visit> for VisitResponse {
    fn from(visit: &Visit) -> Self {
        Self {
            id: visit.id,
            timestamp: visit.timestamp,
            page_type: visit.page_type,
            loading_time_ms: millis(visit.loading_time),
            time_spent_ms: millis(visit.time_spent),
            status: visit.status,
            content_type: visit.content_type.clone(),
            referer: visit.referer.clone(),
            visitor: visit.visitor.clone(),
            page: visit.page.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PageSummaryResponse {
    pub path: String,
    pub visits: usize,
    pub visitors: usize,
    pub average_time_spent_ms: f64,
    pub average_loading_time_ms: f64,
}

impl From<&PageSummary> for PageSummaryResponse {
    fn from(page: &PageSummary) -> Self {
        Self {
            path: page.path.clone(),
            visits: page.visits_count(),
            visitors: page.visitors,
            average_time_spent_ms: millis(page.average_time_spent()),
            average_loading_time_ms: millis(page.average_loading_time()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PageResponse {
    #[serde(flatten)]
    pub summary: PageSummaryResponse,
    pub history: Vec<VisitResponse>,
}

#[derive(Debug, Serialize)]
pub struct VisitorResponse {
    pub address: String,
    pub language: String,
    pub visits: usize,
    pub dynamic_visits: u64,
    pub static_visits: u64,
    pub average_time_spent_ms: f64,
    pub average_loading_time_ms: f64,
    pub history: Vec<VisitResponse>,
}

impl From<&Visitor> for VisitorResponse {
    fn from(visitor: &Visitor) -> Self {
        Self {
            address: visitor.address.clone(),
            language: visitor.language.clone(),
            visits: visitor.visits_count(),
            dynamic_visits: visitor.dynamic_visits,
            static_visits: visitor.static_visits,
            average_time_spent_ms: millis(visitor.average_time_spent()),
            average_loading_time_ms: millis(visitor.average_loading_time()),
            history: visitor.history.iter().map(VisitResponse::from).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PageOrder {
    #[default]
    Most,
    Least,
}

#[derive(Deserialize)]
pub struct PagesQuery {
    #[serde(default)]
    pub order: PageOrder,
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub path: String,
}

#[derive(Deserialize)]
pub struct PageVisitQuery {
    pub path: String,
    pub at: DateTime<Utc>,
}

/// Overall counts
pub async fn get_summary(State(state): State<Arc<AppState>>) -> Json<SummaryResponse> {
    let stats = &state.statistics;
    Json(SummaryResponse {
        visits: stats.visits_count(),
        visitors: stats.visitors_count(),
        pages: stats.pages_count(),
        estimated_current_visitors: stats.estimated_current_visitors(),
        average_visits_per_visitor: stats.average_visits_per_visitor(),
    })
}

/// All pages ordered by visit count
pub async fn list_pages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PagesQuery>,
) -> Json<Vec<PageSummaryResponse>> {
    let pages = match query.order {
        PageOrder::Most => state.statistics.most_visited_pages(),
        PageOrder::Least => state.statistics.least_visited_pages(),
    };

    Json(pages.iter().map(PageSummaryResponse::from).collect())
}

/// One page with its visits
pub async fn get_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<PageResponse> {
    let page = state
        .statistics
        .page(&query.path)
        .ok_or_else(|| not_found("Page not found"))?;

    Ok(Json(PageResponse {
        summary: PageSummaryResponse::from(&page.summary()),
        history: page.visits.iter().map(VisitResponse::from).collect(),
    }))
}

/// Visit of a page recorded at an exact timestamp
pub async fn get_page_visit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageVisitQuery>,
) -> ApiResult<VisitResponse> {
    let page = state
        .statistics
        .page(&query.path)
        .ok_or_else(|| not_found("Page not found"))?;

    match page.get_visit(query.at) {
        Ok(visit) => Ok(Json(VisitResponse::from(visit))),
        Err(e) => Err(not_found(e.to_string())),
    }
}

/// One visitor with its history
pub async fn get_visitor(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<VisitorResponse> {
    state
        .statistics
        .visitor(&address)
        .map(|visitor| Json(VisitorResponse::from(&visitor)))
        .ok_or_else(|| not_found("Visitor not found"))
}

/// One visit by identifier
pub async fn get_visit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> ApiResult<VisitResponse> {
    state
        .statistics
        .visit(VisitId(id))
        .map(|visit| Json(VisitResponse::from(&visit)))
        .ok_or_else(|| not_found("Visit not found"))
}

/// Visitors per primary language code
pub async fn get_languages(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, u64>> {
    Json(state.statistics.languages_count())
}

/// Health check endpoint
pub async fn health_check() -> Json<SuccessResponse> {
    Json(SuccessResponse {
        status: "OK".to_string(),
    })
}
