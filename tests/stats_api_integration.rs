//! Integration tests for the reporting API
//!
//! Visits are recorded directly on `Statistics` with explicit timestamps, then
//! read back through the JSON routes.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use pagestats::analytics::{PageType, Statistics, VisitRequest, VisitResponse};
use pagestats::api::create_stats_router;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Helper to record a visit at a fixed time
fn record(
    stats: &Statistics,
    path: &str,
    address: &str,
    content_type: &str,
    loading_ms: u64,
    secs: i64,
) {
    let request = VisitRequest {
        path: path.to_string(),
        address: address.to_string(),
        accept_language: "en;q=0.9".to_string(),
        ..Default::default()
    };
    let response = VisitResponse {
        status: 200,
        content_type: content_type.to_string(),
    };
    let pending = stats.begin_visit();
    stats.finish_visit_at(
        pending,
        &request,
        &response,
        Duration::from_millis(loading_ms),
        at(secs),
    );
}

/// Helper to create a populated statistics instance and router
fn create_test_app() -> (Arc<Statistics>, Router) {
    let stats = Arc::new(Statistics::new());
    record(&stats, "/a", "1.2.3.4", "text/html", 100, 0);
    record(&stats, "/a", "1.2.3.4", "text/html", 50, 10);
    record(&stats, "/a", "1.2.3.4", "text/html", 80, 20);
    record(&stats, "/b", "5.6.7.8", "text/html", 10, 30);
    record(&stats, "/style.css", "5.6.7.8", "text/css", 1, 31);

    let app = create_stats_router(Arc::clone(&stats));
    (stats, app)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    (status, json)
}

#[tokio::test]
async fn test_summary() {
    let (_stats, app) = create_test_app();

    let (status, json) = get_json(app, "/summary").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["visits"], 5);
    assert_eq!(json["visitors"], 2);
    assert_eq!(json["pages"], 3);
    assert_eq!(json["average_visits_per_visitor"], 2.5);
}

#[tokio::test]
async fn test_pages_ordering() {
    let (_stats, app) = create_test_app();

    let (_, most) = get_json(app.clone(), "/pages").await;
    let most: Vec<&str> = most
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["path"].as_str().unwrap())
        .collect();
    assert_eq!(most, vec!["/b", "/style.css", "/a"]);

    let (_, least) = get_json(app, "/pages?order=least").await;
    let mut least: Vec<&str> = least
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["path"].as_str().unwrap())
        .collect::<Vec<_>>();
    least.reverse();
    assert_eq!(least, most);
}

#[tokio::test]
async fn test_page_details() {
    let (_stats, app) = create_test_app();

    let (status, json) = get_json(app.clone(), "/page?path=/a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["visits"], 3);
    assert_eq!(json["visitors"], 1);
    let loading = json["average_loading_time_ms"].as_f64().unwrap();
    assert!((loading - 76.667).abs() < 0.01);
    // 10s + 10s + 0s over three dynamic visits
    let spent = json["average_time_spent_ms"].as_f64().unwrap();
    assert!((spent - 6666.667).abs() < 0.01);
    assert_eq!(json["history"].as_array().unwrap().len(), 3);
    assert_eq!(json["history"][0]["page_type"], "dynamic");

    let (status, json) = get_json(app, "/page?path=/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "Page not found");
}

#[tokio::test]
async fn test_page_visit_by_timestamp() {
    let (_stats, app) = create_test_app();

    let uri = format!("/page/visit?path=/a&at={}", at(10).format("%Y-%m-%dT%H:%M:%SZ"));
    let (status, json) = get_json(app.clone(), &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], 2);
    assert_eq!(json["time_spent_ms"], 10000.0);

    let uri = format!("/page/visit?path=/a&at={}", at(11).format("%Y-%m-%dT%H:%M:%SZ"));
    let (status, _) = get_json(app, &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_visitor_and_visit() {
    let (stats, app) = create_test_app();

    let (status, json) = get_json(app.clone(), "/visitors/5.6.7.8").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["dynamic_visits"], 1);
    assert_eq!(json["static_visits"], 1);
    assert_eq!(json["history"][1]["page_type"], "static");

    let (status, json) = get_json(app.clone(), "/visits/4").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["page"], "/b");
    assert_eq!(json["visitor"], "5.6.7.8");

    let (status, _) = get_json(app.clone(), "/visitors/0.0.0.0").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get_json(app, "/visits/99").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert_eq!(
        stats.visit(pagestats::analytics::VisitId(5)).unwrap().page_type,
        PageType::Static
    );
}

#[tokio::test]
async fn test_languages_and_health() {
    let (_stats, app) = create_test_app();

    let (_, json) = get_json(app.clone(), "/languages").await;
    assert_eq!(json["en"], 2);

    let (status, json) = get_json(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "OK");
}
