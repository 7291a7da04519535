//! # Scheduler Module
//!
//! The per-domain request frontier consumed by the engine.
//!
//! ## Overview
//!
//! The engine never decides queue order itself. It hands every request to a
//! [`Scheduler`] together with the domain it belongs to and later pulls them
//! back one at a time while draining that domain. Each queued request is
//! paired with a [`Completer`]; the engine resolves it once the request's
//! pipeline has finished, which is what the caller of `enqueue_request` awaits.
//!
//! ## MemoryScheduler
//!
//! The bundled implementation keeps one priority queue per open domain
//! (highest priority first, FIFO within a priority) and filters duplicate
//! requests by fingerprint. Each domain session gets its own bounded `moka`
//! cache of seen fingerprints, dropped when the domain closes.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::scheduler::{MemoryScheduler, Scheduler};
//! use spider_engine::Request;
//!
//! let scheduler = MemoryScheduler::new();
//! scheduler.open_domain("example.com");
//! let done = scheduler.enqueue_request("example.com", Request::get("https://example.com/")?);
//! let (request, completer) = scheduler.next_request("example.com").unwrap();
//! ```

use crate::completion::{completion_pair, Completer, Completion};
use crate::error::{EngineError, Severity};
use crate::request::{Request, Response};
use moka::sync::Cache;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use tracing::{debug, trace};

/// Per-domain request queue contract.
pub trait Scheduler: Send + Sync {
    /// True when no domain is open in the scheduler.
    fn is_idle(&self) -> bool;
    fn domain_is_open(&self, domain: &str) -> bool;
    fn open_domain(&self, domain: &str);
    /// Drops the domain's queue. Pending completions resolve as cancelled.
    fn close_domain(&self, domain: &str);
    /// Queues `request`; the returned handle resolves when its pipeline finishes.
    fn enqueue_request(&self, domain: &str, request: Request) -> Completion<Response>;
    /// Pops the next request for `domain`, if any.
    fn next_request(&self, domain: &str) -> Option<(Request, Completer<Response>)>;
    fn domain_has_pending_requests(&self, domain: &str) -> bool;
    /// Discards queued requests for `domain` while keeping the domain open.
    fn clear_pending_requests(&self, domain: &str);
}

struct QueuedRequest {
    priority: i32,
    seq: u64,
    request: Request,
    completer: Completer<Response>,
}

impl QueuedRequest {
    fn key(&self) -> (i32, std::cmp::Reverse<u64>) {
        (self.priority, std::cmp::Reverse(self.seq))
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

struct DomainQueue {
    pending: BinaryHeap<QueuedRequest>,
    seen: Option<Cache<String, ()>>,
}

impl DomainQueue {
    /// Records the fingerprint of `request`, returning false if it was already seen.
    fn remember(&self, request: &Request) -> bool {
        let Some(seen) = &self.seen else {
            return true;
        };
        let fingerprint = request.fingerprint();
        if seen.contains_key(&fingerprint) {
            return false;
        }
        seen.insert(fingerprint, ());
        true
    }
}

#[derive(Default)]
struct Frontier {
    queues: HashMap<String, DomainQueue>,
    next_seq: u64,
}

/// In-memory priority scheduler with a fingerprint duplicate filter.
///
/// The filter lives as long as the domain's session: closing the domain
/// forgets every fingerprint seen for it.
pub struct MemoryScheduler {
    frontier: Mutex<Frontier>,
    dupefilter: bool,
}

impl MemoryScheduler {
    const SEEN_CAPACITY: u64 = 100_000;

    pub fn new() -> Self {
        Self {
            frontier: Mutex::new(Frontier::default()),
            dupefilter: true,
        }
    }

    /// A scheduler that queues every request, duplicates included.
    pub fn without_dupefilter() -> Self {
        Self {
            frontier: Mutex::new(Frontier::default()),
            dupefilter: false,
        }
    }

    /// Number of queued requests across all domains.
    pub fn len(&self) -> usize {
        self.frontier
            .lock()
            .queues
            .values()
            .map(|queue| queue.pending.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for MemoryScheduler {
    fn is_idle(&self) -> bool {
        self.frontier.lock().queues.is_empty()
    }

    fn domain_is_open(&self, domain: &str) -> bool {
        self.frontier.lock().queues.contains_key(domain)
    }

    fn open_domain(&self, domain: &str) {
        trace!("Scheduler opening domain {}", domain);
        let dupefilter = self.dupefilter;
        self.frontier
            .lock()
            .queues
            .entry(domain.to_string())
            .or_insert_with(|| DomainQueue {
                pending: BinaryHeap::new(),
                seen: dupefilter
                    .then(|| Cache::builder().max_capacity(Self::SEEN_CAPACITY).build()),
            });
    }

    fn close_domain(&self, domain: &str) {
        let removed = self.frontier.lock().queues.remove(domain);
        if let Some(queue) = removed.filter(|queue| !queue.pending.is_empty()) {
            debug!(
                "Scheduler closed domain {} with {} requests still queued",
                domain,
                queue.pending.len()
            );
        }
    }

    fn enqueue_request(&self, domain: &str, request: Request) -> Completion<Response> {
        let mut frontier = self.frontier.lock();
        let seq = frontier.next_seq;
        let Some(queue) = frontier.queues.get_mut(domain) else {
            return Completion::ready(Err(EngineError::ignore(format!(
                "Domain {} is not open in the scheduler",
                domain
            ))));
        };

        if !queue.remember(&request) {
            trace!("Filtered duplicate request: {}", request.url);
            return Completion::ready(Err(EngineError::ignore_with(
                format!("Filtered duplicate request: {}", request),
                Severity::Debug,
            )));
        }

        let (completer, completion) = completion_pair();
        trace!("Enqueuing request for {}: {}", domain, request.url);
        queue.pending.push(QueuedRequest {
            priority: request.priority,
            seq,
            request,
            completer,
        });
        frontier.next_seq += 1;
        completion
    }

    fn next_request(&self, domain: &str) -> Option<(Request, Completer<Response>)> {
        let queued = self.frontier.lock().queues.get_mut(domain)?.pending.pop()?;
        Some((queued.request, queued.completer))
    }

    fn domain_has_pending_requests(&self, domain: &str) -> bool {
        self.frontier
            .lock()
            .queues
            .get(domain)
            .is_some_and(|queue| !queue.pending.is_empty())
    }

    fn clear_pending_requests(&self, domain: &str) {
        let cleared = self
            .frontier
            .lock()
            .queues
            .get_mut(domain)
            .map(|queue| std::mem::take(&mut queue.pending));
        // Dropping the completers cancels every waiting pipeline.
        if let Some(cleared) = cleared.filter(|pending| !pending.is_empty()) {
            debug!("Cleared {} pending requests for {}", cleared.len(), domain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(url: &str) -> Request {
        Request::get(url).unwrap()
    }

    #[tokio::test]
    async fn pops_by_priority_then_fifo() {
        let scheduler = MemoryScheduler::new();
        scheduler.open_domain("a.com");
        let _first = scheduler.enqueue_request("a.com", req("https://a.com/1"));
        let _second = scheduler.enqueue_request("a.com", req("https://a.com/2"));
        let _urgent =
            scheduler.enqueue_request("a.com", req("https://a.com/urgent").with_priority(10));

        let order: Vec<String> = std::iter::from_fn(|| scheduler.next_request("a.com"))
            .map(|(request, _)| request.url.path().to_string())
            .collect();
        assert_eq!(order, vec!["/urgent", "/1", "/2"]);
    }

    #[tokio::test]
    async fn duplicate_requests_are_ignored() {
        let scheduler = MemoryScheduler::new();
        scheduler.open_domain("a.com");
        let _first = scheduler.enqueue_request("a.com", req("https://a.com/page"));
        let duplicate = scheduler.enqueue_request("a.com", req("https://a.com/page#frag"));

        assert!(matches!(
            duplicate.await,
            Err(EngineError::IgnoreRequest { severity: Severity::Debug, .. })
        ));
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test]
    async fn without_dupefilter_queues_duplicates() {
        let scheduler = MemoryScheduler::without_dupefilter();
        scheduler.open_domain("a.com");
        let _a = scheduler.enqueue_request("a.com", req("https://a.com/page"));
        let _b = scheduler.enqueue_request("a.com", req("https://a.com/page"));
        assert_eq!(scheduler.len(), 2);
    }

    #[tokio::test]
    async fn enqueue_on_unopened_domain_is_ignored() {
        let scheduler = MemoryScheduler::new();
        let completion = scheduler.enqueue_request("b.com", req("https://b.com/"));
        assert!(completion.await.unwrap_err().is_ignored());
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn clearing_pending_requests_cancels_their_completions() {
        let scheduler = MemoryScheduler::new();
        scheduler.open_domain("a.com");
        let pending = scheduler.enqueue_request("a.com", req("https://a.com/1"));
        assert!(scheduler.domain_has_pending_requests("a.com"));

        scheduler.clear_pending_requests("a.com");

        assert!(!scheduler.domain_has_pending_requests("a.com"));
        assert!(scheduler.domain_is_open("a.com"));
        assert!(matches!(pending.await, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn idle_tracks_open_domains() {
        let scheduler = MemoryScheduler::new();
        assert!(scheduler.is_idle());
        scheduler.open_domain("a.com");
        assert!(!scheduler.is_idle());
        scheduler.close_domain("a.com");
        assert!(scheduler.is_idle());
        assert!(scheduler.next_request("a.com").is_none());
    }

    #[tokio::test]
    async fn reopened_domain_starts_with_a_fresh_dupefilter() {
        let scheduler = MemoryScheduler::new();
        let rejected = scheduler.enqueue_request("a.com", req("https://a.com/"));
        assert!(rejected.await.unwrap_err().is_ignored());

        scheduler.open_domain("a.com");
        let _first = scheduler.enqueue_request("a.com", req("https://a.com/"));
        assert_eq!(scheduler.len(), 1);

        scheduler.close_domain("a.com");
        scheduler.open_domain("a.com");
        let _again = scheduler.enqueue_request("a.com", req("https://a.com/"));
        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test]
    async fn dupefilter_is_per_domain() {
        let scheduler = MemoryScheduler::new();
        scheduler.open_domain("a.com");
        scheduler.open_domain("b.com");
        let _a = scheduler.enqueue_request("a.com", req("https://a.com/shared"));
        let _b = scheduler.enqueue_request("b.com", req("https://a.com/shared"));
        assert_eq!(scheduler.len(), 2);
    }
}
