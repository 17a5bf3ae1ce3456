//! In-memory visit aggregator
//!
//! `Statistics` is the aggregate root: visitors by address, pages by path,
//! visits by identifier, and the language tally. A single mutex guards the
//! whole model. Recording is split in two so the downstream handler never
//! runs under the lock: `begin_visit` only allocates the identifier, and
//! `finish_visit` does all bookkeeping once the response exists.
//!
//! Pages and visitors carry running totals (distinct visitors, dynamic
//! visit counts, time sums) so listings and the current-visitor estimate
//! never walk visit histories while holding the lock.
//!
//! Nothing is ever evicted. Memory grows with traffic for the lifetime of the
//! aggregator.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::analytics::language::primary_languages;
use crate::analytics::models::{
    mean, Page, PageSummary, PageType, Visit, VisitId, VisitRequest, VisitResponse, Visitor,
};

/// Identifier allocated for a request whose handler has not completed yet
///
/// Consumed by [`Statistics::finish_visit`], so an identifier can only be
/// recorded once.
#[derive(Debug)]
#[must_use = "a pending visit is only recorded by Statistics::finish_visit"]
pub struct PendingVisit {
    id: VisitId,
}

impl PendingVisit {
    pub fn id(&self) -> VisitId {
        self.id
    }
}

struct PageRecord {
    path: String,
    visits: Vec<VisitId>,
    visitors: HashSet<String>,
    dynamic_visits: usize,
    time_spent_total: Duration,
    loading_time_total: Duration,
}

impl PageRecord {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            visits: Vec::new(),
            visitors: HashSet::new(),
            dynamic_visits: 0,
            time_spent_total: Duration::ZERO,
            loading_time_total: Duration::ZERO,
        }
    }

    fn summary(&self) -> PageSummary {
        PageSummary {
            path: self.path.clone(),
            visits: self.visits.len(),
            visitors: self.visitors.len(),
            dynamic_visits: self.dynamic_visits,
            total_time_spent: self.time_spent_total,
            total_loading_time: self.loading_time_total,
        }
    }
}

struct VisitorRecord {
    address: String,
    language: String,
    dynamic_visits: u64,
    static_visits: u64,
    history: Vec<VisitId>,
    /// Sum of time spent over dynamic visits
    time_spent_total: Duration,
    last_dynamic: Option<VisitId>,
}

#[derive(Default)]
struct Model {
    visitors: HashMap<String, VisitorRecord>,
    /// Pages in insertion order, indexed by `page_index`
    pages: Vec<PageRecord>,
    page_index: HashMap<String, usize>,
    visits: BTreeMap<VisitId, Visit>,
    languages: BTreeMap<String, u64>,
    last_visit_id: u64,
    /// Latest timestamp handed out; keeps every sequence non-decreasing
    /// even if the wall clock steps backwards
    last_timestamp: Option<DateTime<Utc>>,
}

impl Model {
    fn resolve(&self, ids: &[VisitId]) -> Vec<Visit> {
        ids.iter()
            .filter_map(|id| self.visits.get(id))
            .cloned()
            .collect()
    }

    fn page_snapshot(&self, record: &PageRecord) -> Page {
        Page {
            path: record.path.clone(),
            visits: self.resolve(&record.visits),
        }
    }

    fn visitor_snapshot(&self, record: &VisitorRecord) -> Visitor {
        Visitor {
            address: record.address.clone(),
            language: record.language.clone(),
            dynamic_visits: record.dynamic_visits,
            static_visits: record.static_visits,
            history: self.resolve(&record.history),
        }
    }

    fn page_slot(&mut self, path: &str) -> usize {
        if let Some(&slot) = self.page_index.get(path) {
            return slot;
        }

        let slot = self.pages.len();
        self.pages.push(PageRecord::new(path));
        self.page_index.insert(path.to_string(), slot);
        debug!(path, "new page");
        slot
    }

    fn ensure_visitor(&mut self, address: &str, accept_language: &str) {
        if self.visitors.contains_key(address) {
            return;
        }

        for code in primary_languages(accept_language) {
            trace!(address, language = %code, "language tally");
            *self.languages.entry(code).or_insert(0) += 1;
        }

        self.visitors.insert(
            address.to_string(),
            VisitorRecord {
                address: address.to_string(),
                language: accept_language.to_string(),
                dynamic_visits: 0,
                static_visits: 0,
                history: Vec::new(),
                time_spent_total: Duration::ZERO,
                last_dynamic: None,
            },
        );
        debug!(address, "new visitor");
    }

    /// Set the time spent on the visitor's latest dynamic visit to the gap
    /// until `now`, keeping the page and visitor totals in step
    fn close_previous_dynamic_visit(&mut self, address: &str, now: DateTime<Utc>) {
        let Some(visitor) = self.visitors.get_mut(address) else {
            return;
        };
        let Some(id) = visitor.last_dynamic else {
            return;
        };
        let Some(visit) = self.visits.get_mut(&id) else {
            return;
        };

        let previous = visit.time_spent;
        visit.time_spent = (now - visit.timestamp).to_std().unwrap_or_default();
        visitor.time_spent_total =
            visitor.time_spent_total.saturating_sub(previous) + visit.time_spent;

        if let Some(&slot) = self.page_index.get(&visit.page) {
            let page = &mut self.pages[slot];
            page.time_spent_total =
                page.time_spent_total.saturating_sub(previous) + visit.time_spent;
        }

        trace!(
            visit_id = %visit.id,
            time_spent = ?visit.time_spent,
            "closed previous dynamic visit"
        );
    }

    fn next_timestamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timestamp = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_timestamp = Some(timestamp);
        timestamp
    }
}

/// Shared aggregate of every visit observed by the recorder
pub struct Statistics {
    model: Mutex<Model>,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            model: Mutex::new(Model::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Model> {
        self.model.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("statistics lock poisoned, continuing with current state");
            poisoned.into_inner()
        })
    }

    /// Allocate the identifier of a visit about to be handled
    pub fn begin_visit(&self) -> PendingVisit {
        let mut model = self.lock();
        model.last_visit_id += 1;
        PendingVisit {
            id: VisitId(model.last_visit_id),
        }
    }

    /// Record a visit whose handler completed after `loading_time`
    pub fn finish_visit(
        &self,
        pending: PendingVisit,
        request: &VisitRequest,
        response: &VisitResponse,
        loading_time: Duration,
    ) -> VisitId {
        self.finish_visit_at(pending, request, response, loading_time, Utc::now())
    }

    /// Record a visit as if it completed at wall-clock time `now`
    ///
    /// [`Statistics::finish_visit`] passes `Utc::now()`. An explicit clock is
    /// for replaying captured traffic and for tests. `now` goes through the
    /// same clamp as live traffic: if it is earlier than a visit already
    /// recorded, the new visit takes that visit's timestamp, so timestamps
    /// never go backwards.
    pub fn finish_visit_at(
        &self,
        pending: PendingVisit,
        request: &VisitRequest,
        response: &VisitResponse,
        loading_time: Duration,
        now: DateTime<Utc>,
    ) -> VisitId {
        let id = pending.id;
        let mut model = self.lock();
        let timestamp = model.next_timestamp(now);

        let page_slot = model.page_slot(&request.path);
        model.ensure_visitor(&request.address, &request.accept_language);

        let page_type = request
            .page_type
            .unwrap_or_else(|| PageType::from_content_type(&response.content_type));

        if page_type.is_dynamic() {
            model.close_previous_dynamic_visit(&request.address, timestamp);
        }

        let visit = Visit {
            id,
            timestamp,
            page_type,
            loading_time,
            time_spent: Duration::ZERO,
            status: response.status,
            content_type: response.content_type.clone(),
            referer: request.referer.clone(),
            visitor: request.address.clone(),
            page: request.path.clone(),
        };

        if let Some(visitor) = model.visitors.get_mut(&request.address) {
            match page_type {
                PageType::Dynamic => {
                    visitor.dynamic_visits += 1;
                    visitor.last_dynamic = Some(id);
                }
                PageType::Static => visitor.static_visits += 1,
            }
            visitor.history.push(id);
        }

        let page = &mut model.pages[page_slot];
        page.visits.push(id);
        if !page.visitors.contains(&request.address) {
            page.visitors.insert(request.address.clone());
        }
        if page_type.is_dynamic() {
            page.dynamic_visits += 1;
            page.loading_time_total += loading_time;
        }

        model.visits.insert(id, visit);

        debug!(
            visit_id = %id,
            path = %request.path,
            address = %request.address,
            page_type = %page_type,
            status = response.status,
            loading_time = ?loading_time,
            "recorded visit"
        );

        id
    }

    /// Record a visit for a request that has already been handled
    pub fn record(
        &self,
        request: &VisitRequest,
        response: &VisitResponse,
        loading_time: Duration,
    ) -> VisitId {
        let pending = self.begin_visit();
        self.finish_visit(pending, request, response, loading_time)
    }

    pub fn page(&self, path: &str) -> Option<Page> {
        let model = self.lock();
        let slot = *model.page_index.get(path)?;
        Some(model.page_snapshot(&model.pages[slot]))
    }

    pub fn visitor(&self, address: &str) -> Option<Visitor> {
        let model = self.lock();
        model
            .visitors
            .get(address)
            .map(|record| model.visitor_snapshot(record))
    }

    pub fn visit(&self, id: VisitId) -> Option<Visit> {
        self.lock().visits.get(&id).cloned()
    }

    pub fn visits_count(&self) -> usize {
        self.lock().visits.len()
    }

    pub fn visitors_count(&self) -> usize {
        self.lock().visitors.len()
    }

    pub fn pages_count(&self) -> usize {
        self.lock().pages.len()
    }

    /// Visitors per primary language code
    pub fn languages_count(&self) -> BTreeMap<String, u64> {
        self.lock().languages.clone()
    }

    /// Visitors whose last dynamic visit is more recent than their own
    /// average time spent
    pub fn estimated_current_visitors(&self) -> usize {
        self.estimated_current_visitors_at(Utc::now())
    }

    /// [`Statistics::estimated_current_visitors`] against an explicit clock
    ///
    /// A `now` earlier than a visitor's last dynamic visit counts as zero
    /// elapsed time.
    pub fn estimated_current_visitors_at(&self, now: DateTime<Utc>) -> usize {
        let model = self.lock();

        model
            .visitors
            .values()
            .filter(|record| {
                let Some(last) = record.last_dynamic.and_then(|id| model.visits.get(&id)) else {
                    return false;
                };

                let average = mean(record.time_spent_total, u128::from(record.dynamic_visits));
                let elapsed = (now - last.timestamp).to_std().unwrap_or_default();
                elapsed < average
            })
            .count()
    }

    /// Mean history length per visitor, zero when there are no visitors
    pub fn average_visits_per_visitor(&self) -> f64 {
        let model = self.lock();
        if model.visitors.is_empty() {
            return 0.0;
        }

        let total: usize = model.visitors.values().map(|v| v.history.len()).sum();
        total as f64 / model.visitors.len() as f64
    }

    /// Every page, sorted by ascending visit count
    ///
    /// Summaries are copied under the lock and sorted after it is released;
    /// equal counts keep the order in which pages were first seen. Use
    /// [`Statistics::page`] for a page's visits.
    pub fn most_visited_pages(&self) -> Vec<PageSummary> {
        let mut pages: Vec<PageSummary> = {
            let model = self.lock();
            model.pages.iter().map(PageRecord::summary).collect()
        };

        pages.sort_by_key(PageSummary::visits_count);
        pages
    }

    /// Exact reverse of [`Statistics::most_visited_pages`]
    pub fn least_visited_pages(&self) -> Vec<PageSummary> {
        let mut pages = self.most_visited_pages();
        pages.reverse();
        pages
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn html_request(path: &str, address: &str) -> VisitRequest {
        VisitRequest {
            path: path.to_string(),
            address: address.to_string(),
            ..Default::default()
        }
    }

    fn html() -> VisitResponse {
        VisitResponse {
            status: 200,
            content_type: "text/html; charset=utf-8".to_string(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record_at(
        stats: &Statistics,
        request: &VisitRequest,
        response: &VisitResponse,
        loading_ms: u64,
        secs: i64,
    ) -> VisitId {
        let pending = stats.begin_visit();
        stats.finish_visit_at(
            pending,
            request,
            response,
            Duration::from_millis(loading_ms),
            at(secs),
        )
    }

    #[test]
    fn test_three_dynamic_visits_scenario() {
        let stats = Statistics::new();
        let request = html_request("/a", "1.2.3.4");

        let first = record_at(&stats, &request, &html(), 100, 0);
        assert_eq!(stats.visit(first).unwrap().time_spent, Duration::ZERO);

        record_at(&stats, &request, &html(), 50, 10);
        assert_eq!(
            stats.visit(first).unwrap().time_spent,
            Duration::from_secs(10)
        );

        let third = record_at(&stats, &request, &html(), 80, 25);

        assert_eq!(stats.visits_count(), 3);
        let page = stats.page("/a").unwrap();
        let average = page.average_loading_time().as_secs_f64() * 1000.0;
        assert!((average - 76.667).abs() < 0.01, "got {average}");

        let visitor = stats.visitor("1.2.3.4").unwrap();
        assert_eq!(visitor.visits_count(), 3);
        assert_eq!(visitor.dynamic_visits, 3);
        assert_eq!(stats.visit(third).unwrap().time_spent, Duration::ZERO);
    }

    #[test]
    fn test_static_visit_does_not_close_dynamic_visit() {
        let stats = Statistics::new();
        let first = record_at(&stats, &html_request("/", "1.1.1.1"), &html(), 5, 0);

        let png = VisitResponse {
            status: 200,
            content_type: "image/png".to_string(),
        };
        record_at(&stats, &html_request("/logo.png", "1.1.1.1"), &png, 1, 2);
        assert_eq!(stats.visit(first).unwrap().time_spent, Duration::ZERO);

        record_at(&stats, &html_request("/next", "1.1.1.1"), &html(), 5, 7);
        assert_eq!(stats.visit(first).unwrap().time_spent, Duration::from_secs(7));

        let visitor = stats.visitor("1.1.1.1").unwrap();
        assert_eq!(visitor.static_visits, 1);
        assert_eq!(visitor.dynamic_visits, 2);
    }

    #[test]
    fn test_page_type_override_and_sniffing() {
        let stats = Statistics::new();
        let png = VisitResponse {
            status: 200,
            content_type: "image/png".to_string(),
        };

        let sniffed = stats.record(&html_request("/img.png", "a"), &png, Duration::ZERO);
        assert_eq!(stats.visit(sniffed).unwrap().page_type, PageType::Static);

        let request = VisitRequest {
            page_type: Some(PageType::Dynamic),
            ..html_request("/api/app", "a")
        };
        let overridden = stats.record(&request, &png, Duration::ZERO);
        assert_eq!(stats.visit(overridden).unwrap().page_type, PageType::Dynamic);
    }

    #[test]
    fn test_language_tally_counts_first_contact_only() {
        let stats = Statistics::new();
        let english = VisitRequest {
            accept_language: "en;q=0.9".to_string(),
            ..html_request("/", "1.1.1.1")
        };
        let french = VisitRequest {
            accept_language: "fr;q=0.8".to_string(),
            ..html_request("/", "2.2.2.2")
        };

        stats.record(&english, &html(), Duration::ZERO);
        stats.record(&french, &html(), Duration::ZERO);
        stats.record(&english, &html(), Duration::ZERO);

        let expected: BTreeMap<String, u64> =
            [("en".to_string(), 1), ("fr".to_string(), 1)].into_iter().collect();
        assert_eq!(stats.languages_count(), expected);
        assert_eq!(stats.visitor("1.1.1.1").unwrap().language, "en;q=0.9");
    }

    #[test]
    fn test_accessors_signal_absence() {
        let stats = Statistics::new();
        assert!(stats.page("/missing").is_none());
        assert!(stats.visitor("0.0.0.0").is_none());
        assert!(stats.visit(VisitId(1)).is_none());
        assert_eq!(stats.average_visits_per_visitor(), 0.0);
        assert_eq!(stats.estimated_current_visitors(), 0);
        assert!(stats.most_visited_pages().is_empty());
    }

    #[test]
    fn test_sorted_pages_are_reverses() {
        let stats = Statistics::new();
        for (path, hits) in [("/b", 2), ("/a", 3), ("/c", 1), ("/d", 2)] {
            for _ in 0..hits {
                stats.record(&html_request(path, "9.9.9.9"), &html(), Duration::ZERO);
            }
        }

        let ascending: Vec<String> = stats
            .most_visited_pages()
            .into_iter()
            .map(|p| p.path)
            .collect();
        assert_eq!(ascending, vec!["/c", "/b", "/d", "/a"]);

        let mut descending: Vec<String> = stats
            .least_visited_pages()
            .into_iter()
            .map(|p| p.path)
            .collect();
        descending.reverse();
        assert_eq!(ascending, descending);
    }

    #[test]
    fn test_estimated_current_visitors() {
        let stats = Statistics::new();
        let active = html_request("/", "1.1.1.1");
        // 0s, 60s, 120s: time spent 60s, 60s, 0s => average 40s
        record_at(&stats, &active, &html(), 1, 0);
        record_at(&stats, &active, &html(), 1, 60);
        record_at(&stats, &active, &html(), 1, 120);

        let png = VisitResponse {
            status: 200,
            content_type: "image/png".to_string(),
        };
        record_at(&stats, &html_request("/x.png", "2.2.2.2"), &png, 1, 121);

        assert_eq!(stats.estimated_current_visitors_at(at(130)), 1);
        assert_eq!(stats.estimated_current_visitors_at(at(160)), 0);
    }

    #[test]
    fn test_listing_totals_match_page_visits() {
        let stats = Statistics::new();
        let png = VisitResponse {
            status: 200,
            content_type: "image/png".to_string(),
        };

        record_at(&stats, &html_request("/a", "1.1.1.1"), &html(), 100, 0);
        record_at(&stats, &html_request("/a", "2.2.2.2"), &html(), 40, 3);
        record_at(&stats, &html_request("/a.png", "1.1.1.1"), &png, 2, 4);
        record_at(&stats, &html_request("/b", "1.1.1.1"), &html(), 60, 9);
        record_at(&stats, &html_request("/a", "2.2.2.2"), &html(), 30, 15);
        record_at(&stats, &html_request("/a", "1.1.1.1"), &html(), 20, 30);
        record_at(&stats, &html_request("/b", "3.3.3.3"), &html(), 10, 31);

        let listed = stats.most_visited_pages();
        assert_eq!(listed.len(), 3);
        for summary in &listed {
            let page = stats.page(&summary.path).unwrap();
            assert_eq!(*summary, page.summary(), "{}", summary.path);
            assert_eq!(summary.average_time_spent(), page.average_time_spent());
            assert_eq!(summary.average_loading_time(), page.average_loading_time());
        }

        // 1.1.1.1 spent 9s on /a, 2.2.2.2 spent 12s on /a
        let a = listed.iter().find(|p| p.path == "/a").unwrap();
        assert_eq!(a.visitors, 2);
        assert_eq!(a.total_time_spent, Duration::from_secs(21));
        assert_eq!(a.total_loading_time, Duration::from_millis(190));
    }

    #[test]
    fn test_estimate_uses_last_dynamic_visit() {
        let stats = Statistics::new();
        let png = VisitResponse {
            status: 200,
            content_type: "image/png".to_string(),
        };
        // time spent 20s, 0s => average 10s
        record_at(&stats, &html_request("/", "1.1.1.1"), &html(), 1, 0);
        record_at(&stats, &html_request("/next", "1.1.1.1"), &html(), 1, 20);
        record_at(&stats, &html_request("/x.png", "1.1.1.1"), &png, 1, 29);

        assert_eq!(stats.estimated_current_visitors_at(at(25)), 1);
        assert_eq!(stats.estimated_current_visitors_at(at(31)), 0);
        // a clock behind the last visit is zero elapsed time
        assert_eq!(stats.estimated_current_visitors_at(at(5)), 1);
    }

    #[test]
    fn test_average_visits_per_visitor() {
        let stats = Statistics::new();
        stats.record(&html_request("/", "a"), &html(), Duration::ZERO);
        stats.record(&html_request("/", "a"), &html(), Duration::ZERO);
        stats.record(&html_request("/", "a"), &html(), Duration::ZERO);
        stats.record(&html_request("/", "b"), &html(), Duration::ZERO);

        assert_eq!(stats.average_visits_per_visitor(), 2.0);
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let stats = Statistics::new();
        let request = html_request("/", "a");
        record_at(&stats, &request, &html(), 1, 50);
        let late = record_at(&stats, &request, &html(), 1, 10);

        assert_eq!(stats.visit(late).unwrap().timestamp, at(50));
        let visitor = stats.visitor("a").unwrap();
        assert!(visitor
            .history
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
