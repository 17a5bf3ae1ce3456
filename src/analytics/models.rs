//! Data models for analytics
//!
//! `Visit` is the unit of recording. `Page` and `Visitor` are read snapshots
//! handed out by the aggregator: they own clones of the visits they reference,
//! so every metric below is computed without holding the model lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::analytics::error::{StatsError, StatsResult};

/// Process-wide unique, strictly increasing visit identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct VisitId(pub u64);

impl fmt::Display for VisitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Classification of a served response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PageType {
    /// HTML content, subject to time-spent and loading-time metrics
    Dynamic,
    /// Anything else (stylesheets, images, JSON, ...)
    Static,
}

impl PageType {
    /// Classify a response by its `Content-Type` header value
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.contains("text/html") {
            PageType::Dynamic
        } else {
            PageType::Static
        }
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, PageType::Dynamic)
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageType::Dynamic => f.write_str("dynamic"),
            PageType::Static => f.write_str("static"),
        }
    }
}

/// Request side of one observed visit
#[derive(Debug, Clone, Default)]
pub struct VisitRequest {
    /// Request path, the page key
    pub path: String,

    /// Resolved client address, the visitor key
    pub address: String,

    /// Raw `Accept-Language` header (may be empty)
    pub accept_language: String,

    /// Raw `Referer` header (may be empty)
    pub referer: String,

    /// Explicit classification attached to the request, wins over sniffing
    pub page_type: Option<PageType>,
}

/// Response side of one observed visit
#[derive(Debug, Clone, Default)]
pub struct VisitResponse {
    /// Status code issued by the downstream handler
    pub status: u16,

    /// Raw `Content-Type` header of the response (may be empty)
    pub content_type: String,
}

/// One observed request/response pair
#[derive(Debug, Clone, PartialEq)]
pub struct Visit {
    pub id: VisitId,

    /// Wall-clock time the visit was recorded
    pub timestamp: DateTime<Utc>,

    pub page_type: PageType,

    /// Time spent inside the downstream handler
    pub loading_time: Duration,

    /// Gap until the same visitor's next dynamic visit, zero until one arrives
    pub time_spent: Duration,

    /// Response status code
    pub status: u16,

    /// Response content type
    pub content_type: String,

    /// Referer header value
    pub referer: String,

    /// Address of the visitor that made this visit
    pub visitor: String,

    /// Path of the page this visit targeted
    pub page: String,
}

impl Visit {
    pub fn is_dynamic(&self) -> bool {
        self.page_type.is_dynamic()
    }
}

/// Snapshot of one distinct request path
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub path: String,

    /// Visits in the order they were recorded
    pub visits: Vec<Visit>,
}

impl Page {
    pub fn visits_count(&self) -> usize {
        self.visits.len()
    }

    /// Number of distinct visitors that hit this page
    pub fn visitors_count(&self) -> usize {
        self.visits
            .iter()
            .map(|visit| visit.visitor.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Mean time spent over dynamic visits, zero if there are none
    pub fn average_time_spent(&self) -> Duration {
        dynamic_mean(&self.visits, |visit| visit.time_spent)
    }

    /// Mean loading time over dynamic visits, zero if there are none
    pub fn average_loading_time(&self) -> Duration {
        dynamic_mean(&self.visits, |visit| visit.loading_time)
    }

    /// Find the visit recorded at exactly `timestamp`
    pub fn get_visit(&self, timestamp: DateTime<Utc>) -> StatsResult<&Visit> {
        find_by_timestamp(&self.visits, timestamp)
    }

    pub fn summary(&self) -> PageSummary {
        let dynamic = self.visits.iter().filter(|visit| visit.is_dynamic());
        PageSummary {
            path: self.path.clone(),
            visits: self.visits_count(),
            visitors: self.visitors_count(),
            dynamic_visits: dynamic.clone().count(),
            total_time_spent: dynamic.clone().map(|visit| visit.time_spent).sum(),
            total_loading_time: dynamic.map(|visit| visit.loading_time).sum(),
        }
    }
}

/// Counters of one page, without its visits
///
/// This is what page listings hand out: copying it costs the same whatever
/// the page's traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSummary {
    pub path: String,
    pub visits: usize,
    /// Distinct visitors
    pub visitors: usize,
    pub dynamic_visits: usize,
    /// Sum of time spent over dynamic visits
    pub total_time_spent: Duration,
    /// Sum of loading time over dynamic visits
    pub total_loading_time: Duration,
}

impl PageSummary {
    pub fn visits_count(&self) -> usize {
        self.visits
    }

    /// Mean time spent over dynamic visits, zero if there are none
    pub fn average_time_spent(&self) -> Duration {
        mean(self.total_time_spent, self.dynamic_visits as u128)
    }

    /// Mean loading time over dynamic visits, zero if there are none
    pub fn average_loading_time(&self) -> Duration {
        mean(self.total_loading_time, self.dynamic_visits as u128)
    }
}

/// Snapshot of one distinct client address
#[derive(Debug, Clone, PartialEq)]
pub struct Visitor {
    pub address: String,

    /// Raw Accept-Language header seen on first contact
    pub language: String,

    pub dynamic_visits: u64,

    pub static_visits: u64,

    /// Visits in chronological order
    pub history: Vec<Visit>,
}

impl Visitor {
    pub fn visits_count(&self) -> usize {
        self.history.len()
    }

    /// Mean time spent over dynamic visits, zero if there are none
    pub fn average_time_spent(&self) -> Duration {
        dynamic_mean(&self.history, |visit| visit.time_spent)
    }

    /// Mean loading time over dynamic visits, zero if there are none
    pub fn average_loading_time(&self) -> Duration {
        dynamic_mean(&self.history, |visit| visit.loading_time)
    }

    pub fn last_visit(&self) -> Option<&Visit> {
        self.history.last()
    }

    pub fn last_dynamic_visit(&self) -> Option<&Visit> {
        self.history.iter().rev().find(|visit| visit.is_dynamic())
    }

    /// Find the visit recorded at exactly `timestamp`
    pub fn get_visit(&self, timestamp: DateTime<Utc>) -> StatsResult<&Visit> {
        find_by_timestamp(&self.history, timestamp)
    }
}

/// Mean of `metric` over the dynamic visits in `visits`
pub(crate) fn dynamic_mean<'a, I, F>(visits: I, metric: F) -> Duration
where
    I: IntoIterator<Item = &'a Visit>,
    F: Fn(&Visit) -> Duration,
{
    let (count, total) = visits
        .into_iter()
        .filter(|visit| visit.is_dynamic())
        .fold((0u128, Duration::ZERO), |(count, total), visit| {
            (count + 1, total + metric(visit))
        });

    mean(total, count)
}

pub(crate) fn mean(total: Duration, count: u128) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }

    Duration::from_nanos((total.as_nanos() / count) as u64)
}

/// Binary search over a chronologically ordered visit sequence
fn find_by_timestamp(visits: &[Visit], timestamp: DateTime<Utc>) -> StatsResult<&Visit> {
    visits
        .binary_search_by(|visit| visit.timestamp.cmp(&timestamp))
        .map(|index| &visits[index])
        .map_err(|_| StatsError::VisitNotFound { timestamp })
}
