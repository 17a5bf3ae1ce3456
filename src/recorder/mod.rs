//! Per-request visit recording for axum routers

pub mod middleware;

use axum::{middleware::from_fn_with_state, Router};
use std::sync::Arc;

use crate::analytics::Statistics;
use crate::config::ClientAddressConfig;

pub use middleware::{record_visit, PageTypeOverride, RecorderState, UNKNOWN_ADDRESS};

/// Wrap every route of `router` with the visit recorder
pub fn with_recording<S>(
    router: Router<S>,
    statistics: Arc<Statistics>,
    client_address: ClientAddressConfig,
) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let state = Arc::new(RecorderState {
        statistics,
        client_address,
    });

    router.layer(from_fn_with_state(state, record_visit))
}
