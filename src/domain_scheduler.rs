//! Admission order for domains.
//!
//! The engine's main loop asks a [`DomainScheduler`] which domain to open next
//! whenever the downloader has room for another one.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tracing::trace;

pub trait DomainScheduler: Send + Sync {
    /// The next domain to admit, if one is waiting.
    fn next_domain(&self) -> Option<String>;
    /// Queues `domain` for admission.
    fn add_domain(&self, domain: &str);
    /// True when nothing is waiting for admission.
    fn is_empty(&self) -> bool;
}

#[derive(Default)]
struct Waiting {
    order: VecDeque<String>,
    queued: HashSet<String>,
}

/// Admits domains in the order they were added. A domain already waiting is not queued twice.
#[derive(Default)]
pub struct FifoDomainScheduler {
    waiting: Mutex<Waiting>,
}

impl FifoDomainScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let scheduler = Self::new();
        for domain in domains {
            scheduler.add_domain(domain.as_ref());
        }
        scheduler
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().order.len()
    }
}

impl DomainScheduler for FifoDomainScheduler {
    fn next_domain(&self) -> Option<String> {
        let mut waiting = self.waiting.lock();
        let domain = waiting.order.pop_front()?;
        waiting.queued.remove(&domain);
        Some(domain)
    }

    fn add_domain(&self, domain: &str) {
        let mut waiting = self.waiting.lock();
        if waiting.queued.insert(domain.to_string()) {
            trace!("Domain {} queued for admission", domain);
            waiting.order.push_back(domain.to_string());
        }
    }

    fn is_empty(&self) -> bool {
        self.waiting.lock().order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_in_insertion_order_without_duplicates() {
        let scheduler = FifoDomainScheduler::with_domains(["a.com", "b.com"]);
        scheduler.add_domain("a.com");
        scheduler.add_domain("c.com");
        assert_eq!(scheduler.len(), 3);

        let admitted: Vec<String> = std::iter::from_fn(|| scheduler.next_domain()).collect();
        assert_eq!(admitted, vec!["a.com", "b.com", "c.com"]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn domain_can_be_requeued_after_admission() {
        let scheduler = FifoDomainScheduler::new();
        scheduler.add_domain("a.com");
        assert_eq!(scheduler.next_domain().as_deref(), Some("a.com"));
        scheduler.add_domain("a.com");
        assert_eq!(scheduler.next_domain().as_deref(), Some("a.com"));
        assert_eq!(scheduler.next_domain(), None);
    }
}
