//! Visit analytics
//!
//! This module owns the in-memory entity model (visitors, pages, visits),
//! the recording step that mutates it once per served request, and the
//! aggregate queries computed over it.

pub mod aggregator;
pub mod error;
pub mod ip_extractor;
pub mod language;
pub mod models;

// Re-export commonly used types
pub use aggregator::{PendingVisit, Statistics};
pub use error::{StatsError, StatsResult};
pub use ip_extractor::extract_client_ip;
pub use models::{
    Page, PageSummary, PageType, Visit, VisitId, VisitRequest, VisitResponse, Visitor,
};
