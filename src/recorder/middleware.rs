use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::analytics::{extract_client_ip, PageType, Statistics, VisitRequest, VisitResponse};
use crate::config::ClientAddressConfig;

/// Address recorded when neither the socket nor a trusted header names one
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Explicit page classification
///
/// Insert it into the request extensions before the recorder runs, or into
/// the response extensions from a handler (`Extension(PageTypeOverride(..))`);
/// the response side wins when both are present.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageTypeOverride(pub PageType);

pub struct RecorderState {
    pub statistics: Arc<Statistics>,
    pub client_address: ClientAddressConfig,
}

/// Record one visit per request passing through this layer
///
/// The visit identifier is allocated up front and exposed to handlers as a
/// `VisitId` request extension. The handler itself runs outside the
/// statistics lock.
pub async fn record_visit(
    State(state): State<Arc<RecorderState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let pending = state.statistics.begin_visit();
    request.extensions_mut().insert(pending.id());

    let socket_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let address = extract_client_ip(request.headers(), socket_ip, &state.client_address)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());

    let mut visit = VisitRequest {
        path: request.uri().path().to_string(),
        address,
        accept_language: header_value(request.headers(), header::ACCEPT_LANGUAGE),
        referer: header_value(request.headers(), header::REFERER),
        page_type: request
            .extensions()
            .get::<PageTypeOverride>()
            .map(|PageTypeOverride(page_type)| *page_type),
    };

    let start = Instant::now();
    let response = next.run(request).await;
    let loading_time = start.elapsed();

    if let Some(PageTypeOverride(page_type)) = response.extensions().get::<PageTypeOverride>() {
        visit.page_type = Some(*page_type);
    }

    let outcome = VisitResponse {
        status: response.status().as_u16(),
        content_type: header_value(response.headers(), header::CONTENT_TYPE),
    };

    state
        .statistics
        .finish_visit(pending, &visit, &outcome, loading_time);

    response
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
