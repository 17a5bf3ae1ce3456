use anyhow::{Context, Result};
use axum::{
    http::header,
    response::{Html, IntoResponse},
    routing::get,
    Extension, Json, Router,
};
use clap::Parser;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pagestats::analytics::{PageType, Statistics, VisitId};
use pagestats::api::create_stats_router;
use pagestats::config::Config;
use pagestats::recorder::{with_recording, PageTypeOverride};

#[derive(Parser)]
#[command(name = "pagestats")]
#[command(about = "Demo site with in-process visit analytics", long_about = None)]
struct Cli {
    /// Listen host (overrides PAGESTATS_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides PAGESTATS_PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::from_env()?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    info!("Loaded configuration");

    let statistics = Arc::new(Statistics::new());

    let site = with_recording(
        site_router(),
        Arc::clone(&statistics),
        config.client_address.clone(),
    );
    let stats_router = create_stats_router(Arc::clone(&statistics));

    let app = if config.stats_path_prefix == "/" {
        site.merge(stats_router)
    } else {
        site.nest(&config.stats_path_prefix, stats_router)
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("🚀 Server listening on http://{}", addr);
    info!(
        "   - Statistics available at http://{}{}/summary",
        addr,
        config.stats_path_prefix.trim_end_matches('/')
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// A handful of pages to exercise the recorder
fn site_router() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/about", get(about))
        .route("/assets/site.css", get(stylesheet))
        .route("/app/state", get(app_state))
}

async fn index(Extension(visit_id): Extension<VisitId>) -> Html<String> {
    Html(format!(
        "<!doctype html><title>pagestats</title><p>Visit #{visit_id}</p><a href=\"/about\">About</a>"
    ))
}

async fn about() -> Html<&'static str> {
    Html("<!doctype html><title>About</title><p>Nothing here is persisted.</p>")
}

async fn stylesheet() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/css")], "body { font-family: sans-serif; }")
}

/// JSON endpoint that still counts as a page view
async fn app_state() -> impl IntoResponse {
    (
        Extension(PageTypeOverride(PageType::Dynamic)),
        Json(json!({ "ready": true })),
    )
}
