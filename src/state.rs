//! Bookkeeping for the engine's control flow.
//!
//! `EngineState` holds the flags and per-domain maps the engine mutates from
//! its callbacks: whether it is running, paused or killed, which domains are
//! closing and why, which domains already have a drain pending, and how many
//! crawls are in flight per domain. It lives behind a single mutex in the
//! engine that is never held across an await or while a collaborator runs.

use crate::completion::Completer;
use std::collections::{HashMap, HashSet};
use std::time::SystemTime;
use tokio::task::JoinHandle;

/// Lifecycle record of a domain between `close_domain` and finalization.
#[derive(Debug)]
pub(crate) struct ClosingDomain {
    pub reason: String,
    /// Pending idleness re-check, cancelled on finalization.
    pub recheck: Option<JoinHandle<()>>,
    /// Resolved once the domain is fully closed.
    pub waiters: Vec<Completer<()>>,
    /// Set once teardown has begun, so it runs only once.
    pub finalizing: bool,
}

impl ClosingDomain {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            recheck: None,
            waiters: Vec::new(),
            finalizing: false,
        }
    }

    pub fn cancel_recheck(&mut self) {
        if let Some(recheck) = self.recheck.take() {
            recheck.abort();
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct EngineState {
    pub running: bool,
    pub paused: bool,
    /// One-way latch set by `kill`.
    pub killed: bool,
    pub keep_alive: bool,
    pub start_time: Option<SystemTime>,
    pub closing: HashMap<String, ClosingDomain>,
    /// Domains with a drain already scheduled.
    pub pending_next_request: HashSet<String>,
    /// Crawls per domain whose scrape output has not been handed back yet.
    pub in_flight: HashMap<String, usize>,
    pub main_loop: Option<JoinHandle<()>>,
    /// Set once `engine_stopped` has fired for the current stop.
    pub stopped_notified: bool,
}

impl EngineState {
    pub fn in_flight(&self, domain: &str) -> usize {
        self.in_flight.get(domain).copied().unwrap_or(0)
    }

    pub fn total_in_flight(&self) -> usize {
        self.in_flight.values().sum()
    }

    pub fn begin_crawl(&mut self, domain: &str) {
        *self.in_flight.entry(domain.to_string()).or_insert(0) += 1;
    }

    pub fn end_crawl(&mut self, domain: &str) {
        if let Some(count) = self.in_flight.get_mut(domain) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(domain);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_counts_are_per_domain() {
        let mut state = EngineState::default();
        state.begin_crawl("a.com");
        state.begin_crawl("a.com");
        state.begin_crawl("b.com");
        assert_eq!(state.in_flight("a.com"), 2);
        assert_eq!(state.total_in_flight(), 3);

        state.end_crawl("a.com");
        state.end_crawl("a.com");
        state.end_crawl("a.com");
        assert_eq!(state.in_flight("a.com"), 0);
        assert!(!state.in_flight.contains_key("a.com"));
        assert_eq!(state.total_in_flight(), 1);
    }
}
