//! The request pipeline: crawl, schedule, drain, download.

use super::ExecutionEngine;
use crate::builder::ImplicitAdmission;
use crate::completion::Completion;
use crate::error::{EngineError, Severity};
use crate::request::{DownloadOutcome, Request, Response};
use crate::stats::{REQUEST_FAILED, REQUEST_IGNORED, REQUEST_SCHEDULED, RESPONSE_RECEIVED};
use futures_util::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

impl ExecutionEngine {
    /// Crawls `request` for `domain`: schedules it, and once it has been
    /// downloaded hands the outcome to the scraper and crawls whatever
    /// follow-up requests the scrape produced.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn crawl(self: &Arc<Self>, request: Request, domain: &str) {
        self.state.lock().begin_crawl(domain);
        let scheduled = self.schedule(request.clone(), domain);

        let engine = Arc::clone(self);
        let domain = domain.to_string();
        tokio::spawn(async move {
            let outcome = match scheduled {
                Ok(completion) => completion.await,
                Err(e) => Err(e),
            };
            if let Err(e) = &outcome {
                trace!("Crawl of {} ended without a response: {}", request, e);
            }

            let follow_ups = engine.scraper.enqueue_scrape(outcome, request, &domain).await;
            for follow_up in follow_ups {
                engine.crawl(follow_up, &domain);
            }

            engine.state.lock().end_crawl(&domain);
            engine.next_request(&domain);
        });
    }

    /// Crawls the start requests of the spider registered for `domain`.
    pub fn crawl_start_requests(self: &Arc<Self>, domain: &str) -> Result<usize, EngineError> {
        let spider = self.spiders.lookup(domain).ok_or_else(|| {
            EngineError::Configuration(format!("No spider registered for {}", domain))
        })?;
        let requests = spider.start_requests()?;
        let count = requests.len();
        info!("Crawling {} start requests for {}", count, domain);
        for request in requests {
            self.crawl(request, domain);
        }
        Ok(count)
    }

    /// Queues `request` for `domain`, opening the domain in the scheduler on
    /// first use. Fails with an ignored-request error while the domain is
    /// closing.
    ///
    /// The returned handle resolves once the request has been downloaded,
    /// including any follow-up the downloader asked for.
    pub fn schedule(
        self: &Arc<Self>,
        request: Request,
        domain: &str,
    ) -> Result<Completion<Response>, EngineError> {
        if self.domain_is_closing(domain) {
            return Err(EngineError::ignore(format!(
                "Domain {} is closing, not scheduling {}",
                domain, request
            )));
        }

        if !self.scheduler.domain_is_open(domain) {
            self.scheduler.open_domain(domain);
            if self.domain_is_closed(domain) {
                self.admit_implicitly(domain);
            }
        }
        self.next_request(domain);

        self.stats.inc_value(domain, REQUEST_SCHEDULED);
        trace!("Scheduling {} for {}", request, domain);
        Ok(self.scheduler.enqueue_request(domain, request))
    }

    fn admit_implicitly(self: &Arc<Self>, domain: &str) {
        match self.config.implicit_admission {
            ImplicitAdmission::Queue => {
                debug!("Queueing {} for admission", domain);
                self.domain_scheduler.add_domain(domain);
            }
            ImplicitAdmission::Immediate => {
                debug!("Opening {} without waiting for admission", domain);
                self.open_domain(domain);
            }
        }
    }

    /// Triggers a drain of `domain` on the next turn of the runtime. Calls
    /// made while a drain is already pending are coalesced into it.
    pub fn next_request(self: &Arc<Self>, domain: &str) {
        if !self.state.lock().pending_next_request.insert(domain.to_string()) {
            return;
        }
        let engine = Arc::clone(self);
        let domain = domain.to_string();
        tokio::spawn(async move {
            engine.drain(&domain);
        });
    }

    fn drain(self: &Arc<Self>, domain: &str) {
        let paused = {
            let mut state = self.state.lock();
            state.pending_next_request.remove(domain);
            state.paused
        };

        if paused {
            let delay = self.config.pause_retry_delay;
            trace!("Engine paused, draining {} again in {:?}", domain, delay);
            let engine = Arc::clone(self);
            let domain = domain.to_string();
            tokio::spawn(async move {
                time::sleep(delay).await;
                engine.next_request(&domain);
            });
            return;
        }

        while !self.needs_backout(domain) {
            if !self.dispatch_next(domain) {
                break;
            }
        }

        if self.domain_is_open(domain) && self.domain_is_idle(domain) {
            self.domain_idle(domain);
        }
    }

    fn needs_backout(&self, domain: &str) -> bool {
        !self.is_running()
            || !self.domain_is_open(domain)
            || self.downloader.needs_backout(domain)
            || self.scraper.needs_backout(domain)
    }

    /// Pulls one request for `domain` and starts downloading it. Returns
    /// false when the scheduler had nothing for the domain.
    fn dispatch_next(self: &Arc<Self>, domain: &str) -> bool {
        let Some((request, completer)) = self.scheduler.next_request(domain) else {
            return false;
        };
        let download = self.download(request, domain);
        tokio::spawn(async move {
            completer.complete(download.await);
        });
        true
    }

    /// Downloads `request` for `domain`.
    ///
    /// A follow-up request from the downloader is scheduled and its result
    /// becomes this download's result. Failures are logged and come back as
    /// ignored-request errors. Whatever the outcome, the domain is drained
    /// again afterwards.
    pub fn download(
        self: &Arc<Self>,
        request: Request,
        domain: &str,
    ) -> BoxFuture<'static, Result<Response, EngineError>> {
        let transfer = self.downloader.fetch(request.clone(), domain);
        let engine = Arc::clone(self);
        let domain = domain.to_string();

        async move {
            let referer = request.referer().unwrap_or("None").to_string();
            let result = match transfer.await {
                Ok(DownloadOutcome::Response(mut response)) => {
                    engine.stats.inc_value(&domain, RESPONSE_RECEIVED);
                    debug!("Crawled {} (referer: <{}>)", response, referer);
                    response.set_request(request);
                    Ok(response)
                }
                Ok(DownloadOutcome::FollowUp(follow_up)) => {
                    debug!("Rescheduling {} in place of {}", follow_up, request);
                    match engine.schedule(follow_up, &domain) {
                        Ok(completion) => completion.await.map_err(EngineError::into_ignored),
                        Err(e) => Err(e),
                    }
                }
                Err(e) => {
                    let key = if e.is_ignored() {
                        REQUEST_IGNORED
                    } else {
                        REQUEST_FAILED
                    };
                    engine.stats.inc_value(&domain, key);
                    let (severity, message) = e.classify();
                    if !message.is_empty() {
                        log_download_failure(severity, &request, &referer, &message);
                    }
                    Err(e.into_ignored())
                }
            };
            engine.next_request(&domain);
            result
        }
        .boxed()
    }
}

fn log_download_failure(severity: Severity, request: &Request, referer: &str, message: &str) {
    match severity {
        Severity::Trace => trace!(
            "Downloading <{}> (referer: <{}>): {}",
            request.url,
            referer,
            message
        ),
        Severity::Debug => debug!(
            "Downloading <{}> (referer: <{}>): {}",
            request.url,
            referer,
            message
        ),
        Severity::Info => info!(
            "Downloading <{}> (referer: <{}>): {}",
            request.url,
            referer,
            message
        ),
        Severity::Warning => warn!(
            "Downloading <{}> (referer: <{}>): {}",
            request.url,
            referer,
            message
        ),
        Severity::Error => error!(
            "Downloading <{}> (referer: <{}>): {}",
            request.url,
            referer,
            message
        ),
    }
}
