use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::analytics::Statistics;

use super::handlers::{
    get_languages, get_page, get_page_visit, get_summary, get_visit, get_visitor, health_check,
    list_pages, AppState,
};

/// Read-only reporting routes over `statistics`
pub fn create_stats_router(statistics: Arc<Statistics>) -> Router {
    let state = Arc::new(AppState { statistics });

    Router::new()
        .route("/health", get(health_check))
        .route("/summary", get(get_summary))
        .route("/pages", get(list_pages))
        .route("/page", get(get_page))
        .route("/page/visit", get(get_page_visit))
        .route("/visitors/{address}", get(get_visitor))
        .route("/visits/{id}", get(get_visit))
        .route("/languages", get(get_languages))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
