//! # Scraper Module
//!
//! Turns downloaded responses into scraped items and follow-up requests.
//!
//! ## Overview
//!
//! The engine hands every finished download to a [`Scraper`] together with
//! the request that produced it. The scraper runs the domain's spider over
//! the response, forwards scraped items, and returns the follow-up requests
//! so the engine can crawl them. Per domain it reports whether it is idle
//! and whether it is saturated enough that dispatch should back out.
//!
//! [`SpiderScraper`] is the bundled scraper. Items go to an optional `kanal`
//! channel as [`ScrapedItem`]s; counts land in the stats sink.

use crate::error::EngineError;
use crate::request::{Request, Response};
use crate::spider::SpiderProvider;
use crate::stats::{StatsSink, ITEM_SCRAPED};
use futures_util::future::{self, BoxFuture, FutureExt};
use kanal::{AsyncReceiver, AsyncSender};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use url::Url;

const DEFAULT_MAX_ACTIVE_PER_DOMAIN: usize = 16;

/// Follow-up requests produced by one scrape.
pub type ScrapeFuture = BoxFuture<'static, Vec<Request>>;

/// Response-processing contract consumed by the engine.
pub trait Scraper: Send + Sync {
    /// True when no domain is open in the scraper.
    fn is_idle(&self) -> bool;
    fn open_domain(&self, domain: &str);
    fn close_domain(&self, domain: &str);
    /// Hands the outcome of downloading `request` to the scraper.
    ///
    /// The scrape counts as in flight from the moment this returns, so a
    /// domain never looks idle between download completion and parsing.
    fn enqueue_scrape(
        &self,
        outcome: Result<Response, EngineError>,
        request: Request,
        domain: &str,
    ) -> ScrapeFuture;
    fn needs_backout(&self, domain: &str) -> bool;
    /// True when `domain` is open and has no scrape in flight.
    fn is_domain_idle(&self, domain: &str) -> bool;
}

/// An item scraped by a spider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapedItem {
    pub domain: String,
    /// URL of the page the item was scraped from.
    pub url: Url,
    pub value: Value,
}

type ActiveScrapes = Arc<Mutex<HashMap<String, usize>>>;

struct ScrapeGuard {
    active: ActiveScrapes,
    domain: String,
}

impl Drop for ScrapeGuard {
    fn drop(&mut self) {
        if let Some(count) = self.active.lock().get_mut(&self.domain) {
            *count = count.saturating_sub(1);
        }
    }
}

/// [`Scraper`] that feeds responses to the spider registered for the domain.
pub struct SpiderScraper {
    spiders: Arc<dyn SpiderProvider>,
    stats: Arc<dyn StatsSink>,
    active: ActiveScrapes,
    max_active_per_domain: usize,
    items: Option<AsyncSender<ScrapedItem>>,
}

impl SpiderScraper {
    pub fn new(spiders: Arc<dyn SpiderProvider>, stats: Arc<dyn StatsSink>) -> Self {
        Self {
            spiders,
            stats,
            active: Arc::new(Mutex::new(HashMap::new())),
            max_active_per_domain: DEFAULT_MAX_ACTIVE_PER_DOMAIN,
            items: None,
        }
    }

    /// Scrapes in flight per domain before the domain backs out.
    pub fn with_max_active_per_domain(mut self, limit: usize) -> Self {
        self.max_active_per_domain = limit.max(1);
        self
    }

    pub fn with_item_sender(mut self, sender: AsyncSender<ScrapedItem>) -> Self {
        self.items = Some(sender);
        self
    }

    /// Creates a bounded item channel and keeps its sending half.
    pub fn with_item_channel(self, capacity: usize) -> (Self, AsyncReceiver<ScrapedItem>) {
        let (sender, receiver) = kanal::bounded_async(capacity);
        (self.with_item_sender(sender), receiver)
    }
}

impl Scraper for SpiderScraper {
    fn is_idle(&self) -> bool {
        self.active.lock().is_empty()
    }

    fn open_domain(&self, domain: &str) {
        self.active.lock().entry(domain.to_string()).or_insert(0);
    }

    fn close_domain(&self, domain: &str) {
        if let Some(active) = self.active.lock().remove(domain) {
            if active > 0 {
                warn!("Scraper closed {} with {} scrapes in flight", domain, active);
            }
        }
    }

    fn enqueue_scrape(
        &self,
        outcome: Result<Response, EngineError>,
        request: Request,
        domain: &str,
    ) -> ScrapeFuture {
        {
            let mut active = self.active.lock();
            match active.get_mut(domain) {
                Some(count) => *count += 1,
                None => {
                    debug!("Dropping scrape of {} for closed domain {}", request, domain);
                    return future::ready(Vec::new()).boxed();
                }
            }
        }

        let guard = ScrapeGuard {
            active: Arc::clone(&self.active),
            domain: domain.to_string(),
        };
        let spiders = Arc::clone(&self.spiders);
        let stats = Arc::clone(&self.stats);
        let items = self.items.clone();
        let domain = domain.to_string();

        async move {
            let _guard = guard;
            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    trace!("Nothing to scrape for {}: {}", request, e);
                    return Vec::new();
                }
            };
            let Some(spider) = spiders.lookup(&domain) else {
                warn!("No spider found for {}, dropping {}", domain, response);
                return Vec::new();
            };

            let page_url = response.url.clone();
            let referer = request.referer().unwrap_or("None").to_string();
            let output = match spider.parse(response).await {
                Ok(output) => output,
                Err(e) => {
                    error!(
                        "Spider error processing {} (referer: <{}>): {}",
                        request, referer, e
                    );
                    return Vec::new();
                }
            };

            let (scraped, requests) = output.into_parts();
            trace!(
                "Spider output for {}: {} items, {} requests",
                page_url,
                scraped.len(),
                requests.len()
            );
            for value in scraped {
                stats.inc_value(&domain, ITEM_SCRAPED);
                debug!("Scraped from <{}>", page_url);
                if let Some(sender) = &items {
                    let item = ScrapedItem {
                        domain: domain.clone(),
                        url: page_url.clone(),
                        value,
                    };
                    if sender.send(item).await.is_err() {
                        warn!("Item channel is closed, dropping item from {}", page_url);
                    }
                }
            }

            requests
                .into_iter()
                .map(|follow_up| {
                    if follow_up.referer().is_some() {
                        follow_up
                    } else {
                        follow_up.with_referer(&page_url)
                    }
                })
                .collect()
        }
        .boxed()
    }

    fn needs_backout(&self, domain: &str) -> bool {
        self.active
            .lock()
            .get(domain)
            .is_some_and(|count| *count >= self.max_active_per_domain)
    }

    fn is_domain_idle(&self, domain: &str) -> bool {
        self.active.lock().get(domain).is_some_and(|count| *count == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spider::{ParseOutput, Spider, SpiderRegistry};
    use crate::stats::StatCollector;
    use async_trait::async_trait;
    use serde_json::json;

    struct Listing;

    #[async_trait]
    impl Spider for Listing {
        fn domain_name(&self) -> &str {
            "a.com"
        }

        async fn parse(&self, response: Response) -> Result<ParseOutput, EngineError> {
            if response.url.path() == "/broken" {
                return Err(EngineError::Spider("unexpected markup".into()));
            }
            let mut output = ParseOutput::new();
            output.add_item(json!({ "title": "first" }));
            output.add_item(json!({ "title": "second" }));
            output.add_request(Request::get("https://a.com/next")?);
            Ok(output)
        }
    }

    fn scraper() -> (SpiderScraper, Arc<StatCollector>) {
        let registry = Arc::new(SpiderRegistry::new());
        registry.register(Listing);
        let stats = Arc::new(StatCollector::new());
        let scraper = SpiderScraper::new(registry, stats.clone());
        (scraper, stats)
    }

    fn page(path: &str) -> (Request, Response) {
        let request = Request::get(&format!("https://a.com{}", path)).unwrap();
        let response = Response::new(request.url.clone(), 200, "<html></html>");
        (request, response)
    }

    #[tokio::test]
    async fn scrape_forwards_items_and_returns_follow_ups() {
        let (scraper, stats) = scraper();
        let (scraper, items) = scraper.with_item_channel(8);
        scraper.open_domain("a.com");
        let (request, response) = page("/list");

        let follow_ups = scraper
            .enqueue_scrape(Ok(response), request, "a.com")
            .await;

        assert_eq!(follow_ups.len(), 1);
        assert_eq!(follow_ups[0].referer(), Some("https://a.com/list"));
        assert_eq!(stats.get_value("a.com", ITEM_SCRAPED), 2);
        let first = items.recv().await.unwrap();
        assert_eq!(first.domain, "a.com");
        assert_eq!(first.value, json!({ "title": "first" }));
    }

    #[tokio::test]
    async fn scrape_is_in_flight_until_finished() {
        let (scraper, _) = scraper();
        let scraper = scraper.with_max_active_per_domain(1);
        scraper.open_domain("a.com");
        assert!(scraper.is_domain_idle("a.com"));

        let (request, response) = page("/list");
        let scrape = scraper.enqueue_scrape(Ok(response), request, "a.com");
        assert!(!scraper.is_domain_idle("a.com"));
        assert!(scraper.needs_backout("a.com"));

        scrape.await;
        assert!(scraper.is_domain_idle("a.com"));
        assert!(!scraper.needs_backout("a.com"));
    }

    #[tokio::test]
    async fn failures_produce_no_follow_ups() {
        let (scraper, stats) = scraper();
        scraper.open_domain("a.com");

        let (request, response) = page("/broken");
        assert!(scraper
            .enqueue_scrape(Ok(response), request, "a.com")
            .await
            .is_empty());

        let (request, _) = page("/gone");
        let failed = Err(EngineError::ignore("download aborted"));
        assert!(scraper.enqueue_scrape(failed, request, "a.com").await.is_empty());
        assert_eq!(stats.get_value("a.com", ITEM_SCRAPED), 0);
    }

    #[tokio::test]
    async fn unknown_domain_is_never_idle() {
        let (scraper, _) = scraper();
        assert!(!scraper.is_domain_idle("b.com"));
        assert!(scraper.is_idle());

        let (request, response) = page("/list");
        assert!(scraper
            .enqueue_scrape(Ok(response), request, "b.com")
            .await
            .is_empty());

        scraper.open_domain("a.com");
        assert!(!scraper.is_idle());
        scraper.close_domain("a.com");
        assert!(scraper.is_idle());
    }
}
