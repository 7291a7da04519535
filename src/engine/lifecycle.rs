//! Domain lifecycle: open, idle, closing, closed.

use super::ExecutionEngine;
use crate::completion::{completion_pair, Completion};
use crate::signals::IdleVerdict;
use crate::state::ClosingDomain;
use std::sync::Arc;
use tokio::time;
use tracing::{debug, info, trace, warn};

const DEFAULT_CLOSE_REASON: &str = "finished";

impl ExecutionEngine {
    /// True when the downloader has the domain open and it is not closing.
    pub fn domain_is_open(&self, domain: &str) -> bool {
        self.downloader.is_domain_open(domain) && !self.domain_is_closing(domain)
    }

    /// True while the domain waits to finish closing.
    pub fn domain_is_closing(&self, domain: &str) -> bool {
        self.state.lock().closing.contains_key(domain)
    }

    /// True when the domain is neither open nor closing.
    pub fn domain_is_closed(&self, domain: &str) -> bool {
        !self.downloader.is_domain_open(domain) && !self.domain_is_closing(domain)
    }

    /// A domain is idle when the scraper has nothing in flight for it, the
    /// scheduler holds no requests for it, the downloader has no transfer
    /// running for it, and no crawl of it is waiting on its scrape output.
    pub fn domain_is_idle(&self, domain: &str) -> bool {
        self.scraper.is_domain_idle(domain)
            && !self.scheduler.domain_has_pending_requests(domain)
            && !self.downloader.active_transfers(domain)
            && self.state.lock().in_flight(domain) == 0
    }

    /// Domains the downloader has open, closing ones included.
    pub fn open_domains(&self) -> Vec<String> {
        let mut domains = self.downloader.open_domains();
        domains.sort();
        domains
    }

    /// Reason a closing domain was closed with.
    pub fn closing_reason(&self, domain: &str) -> Option<String> {
        self.state
            .lock()
            .closing
            .get(domain)
            .map(|record| record.reason.clone())
    }

    pub(crate) fn open_domain(self: &Arc<Self>, domain: &str) {
        info!("Domain opened: {}", domain);
        let spider = self.spiders.open_domain(domain);
        if spider.is_none() {
            warn!("No spider registered for {}", domain);
        }
        self.next_request(domain);

        self.downloader.open_domain(domain);
        self.scraper.open_domain(domain);
        self.stats.open_domain(domain);

        self.signals.domain_opened(domain, spider.as_ref());
    }

    /// Called when a drain leaves `domain` idle. Listeners may veto the
    /// close, in which case the domain is drained and evaluated again.
    pub(crate) fn domain_idle(self: &Arc<Self>, domain: &str) {
        let spider = self.spiders.lookup(domain);
        if self.signals.domain_idle(domain, spider.as_ref()) == IdleVerdict::Veto {
            self.next_request(domain);
            return;
        }
        if self.domain_is_idle(domain) {
            let _ = self.close_domain(domain, DEFAULT_CLOSE_REASON);
        }
    }

    /// Closes `domain` and discards its pending requests.
    ///
    /// The returned handle resolves once the domain has fully closed. Closing
    /// a domain that is already closing, or not open at all, does nothing and
    /// returns a resolved handle.
    pub fn close_domain(self: &Arc<Self>, domain: &str, reason: &str) -> Completion<()> {
        let open = self.downloader.is_domain_open(domain);
        let (completer, completion) = completion_pair();
        {
            let mut state = self.state.lock();
            if !open || state.closing.contains_key(domain) {
                drop(state);
                trace!("Domain {} is not open, nothing to close", domain);
                return Completion::ready(Ok(()));
            }
            let mut record = ClosingDomain::new(reason);
            record.waiters.push(completer);
            state.closing.insert(domain.to_string(), record);
        }

        info!("Closing domain {} ({})", domain, reason);
        self.downloader.close_domain(domain);
        self.scheduler.clear_pending_requests(domain);
        self.finish_closing_if_idle(domain);
        completion
    }

    /// Finalizes a closing domain once it is idle, or at once if the engine
    /// has been killed. Otherwise checks again after a delay.
    pub(crate) fn finish_closing_if_idle(self: &Arc<Self>, domain: &str) {
        let idle = self.domain_is_idle(domain);
        let delay = {
            let state = self.state.lock();
            match state.closing.get(domain) {
                None => return,
                Some(record) if record.finalizing => return,
                Some(_) if idle || state.killed => None,
                Some(_) if state.running => Some(self.config.close_recheck_delay),
                Some(_) => Some(self.config.stopped_recheck_delay),
            }
        };

        let Some(delay) = delay else {
            self.finish_closing(domain);
            return;
        };

        trace!("Domain {} not idle yet, checking again in {:?}", domain, delay);
        let engine = Arc::clone(self);
        let name = domain.to_string();
        let recheck = tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(record) = engine.state.lock().closing.get_mut(&name) {
                record.recheck = None;
            }
            engine.finish_closing_if_idle(&name);
        });

        let mut state = self.state.lock();
        match state.closing.get_mut(domain) {
            Some(record) => {
                if let Some(stale) = record.recheck.replace(recheck) {
                    stale.abort();
                }
            }
            None => recheck.abort(),
        }
    }

    /// Tears down a closing domain and reports it closed.
    pub(crate) fn finish_closing(self: &Arc<Self>, domain: &str) {
        let killed = {
            let mut state = self.state.lock();
            let Some(record) = state.closing.get_mut(domain) else {
                return;
            };
            if record.finalizing {
                return;
            }
            record.finalizing = true;
            record.cancel_recheck();
            state.killed
        };

        let spider = self.spiders.lookup(domain);
        if killed {
            self.downloader.abort_domain(domain);
        }
        self.scheduler.close_domain(domain);
        self.scraper.close_domain(domain);

        let (reason, waiters) = match self.state.lock().closing.remove(domain) {
            Some(record) => (record.reason, record.waiters),
            None => (DEFAULT_CLOSE_REASON.to_string(), Vec::new()),
        };

        self.signals.domain_closed(domain, spider.as_ref(), &reason);
        self.stats.close_domain(domain, &reason);
        info!("Domain closed: {} ({})", domain, reason);
        self.spiders.close_domain(domain);

        for waiter in waiters {
            waiter.complete(Ok(()));
        }

        if self.is_running() {
            debug!("Looking for more domains after closing {}", domain);
            self.main_loop_tick();
        } else {
            self.notify_stopped_if_drained();
        }
    }
}
