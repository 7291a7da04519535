//! # Spider Module
//!
//! Defines the `Spider` trait and the registry the engine uses to find the
//! spider responsible for a domain.
//!
//! ## Overview
//!
//! A spider owns one domain. It supplies the requests a crawl of that domain
//! starts from and turns each downloaded response into scraped items and
//! further requests. The engine itself never calls `parse`; it only looks
//! spiders up through a [`SpiderProvider`] so lifecycle notifications can
//! carry them and the scraper can hand responses to them.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::spider::{ParseOutput, Spider};
//! use spider_engine::{EngineError, Response};
//! use async_trait::async_trait;
//!
//! struct ExampleSpider;
//!
//! #[async_trait]
//! impl Spider for ExampleSpider {
//!     fn domain_name(&self) -> &str {
//!         "example.com"
//!     }
//!
//!     fn start_urls(&self) -> Vec<String> {
//!         vec!["https://example.com/".into()]
//!     }
//!
//!     async fn parse(&self, response: Response) -> Result<ParseOutput, EngineError> {
//!         let mut output = ParseOutput::new();
//!         output.add_item(serde_json::json!({ "url": response.url.as_str() }));
//!         Ok(output)
//!     }
//! }
//! ```

use crate::error::EngineError;
use crate::request::{Request, Response};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Defines the contract for a web spider.
#[async_trait]
pub trait Spider: Send + Sync + 'static {
    /// The domain this spider crawls.
    fn domain_name(&self) -> &str;

    /// Returns the initial URLs to start crawling from.
    fn start_urls(&self) -> Vec<String> {
        Vec::new()
    }

    /// Generates the initial requests to start crawling.
    fn start_requests(&self) -> Result<Vec<Request>, EngineError> {
        self.start_urls()
            .iter()
            .map(|url| Request::get(url))
            .collect()
    }

    /// Parses a response and extracts scraped items and new requests.
    async fn parse(&self, response: Response) -> Result<ParseOutput, EngineError>;
}

/// Shared handle to a spider.
pub type SpiderHandle = Arc<dyn Spider>;

/// Items and follow-up requests produced by one `parse` call.
#[derive(Debug, Default)]
pub struct ParseOutput {
    items: Vec<Value>,
    requests: Vec<Request>,
}

impl ParseOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&mut self, item: Value) {
        self.items.push(item);
    }

    pub fn add_request(&mut self, request: Request) {
        self.requests.push(request);
    }

    pub fn into_parts(self) -> (Vec<Value>, Vec<Request>) {
        (self.items, self.requests)
    }
}

/// Resolves the spider for a domain.
pub trait SpiderProvider: Send + Sync {
    fn lookup(&self, domain: &str) -> Option<SpiderHandle>;
    /// Acquires the spider for a new session of `domain`.
    fn open_domain(&self, domain: &str) -> Option<SpiderHandle> {
        self.lookup(domain)
    }
    /// Releases whatever the provider holds for `domain` once it has fully closed.
    fn close_domain(&self, domain: &str);
}

/// `SpiderProvider` backed by a map of registered spiders keyed by domain.
#[derive(Default)]
pub struct SpiderRegistry {
    spiders: DashMap<String, SpiderHandle>,
    in_use: DashSet<String>,
}

impl SpiderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `spider` under its domain name, replacing any previous one.
    pub fn register<S: Spider>(&self, spider: S) {
        self.register_handle(Arc::new(spider));
    }

    pub fn register_handle(&self, spider: SpiderHandle) {
        let domain = spider.domain_name().to_string();
        debug!("Registered spider for {}", domain);
        if self.spiders.insert(domain.clone(), spider).is_some() {
            warn!("Replaced existing spider for {}", domain);
        }
    }

    pub fn domains(&self) -> Vec<String> {
        self.spiders.iter().map(|entry| entry.key().clone()).collect()
    }

    /// True while the engine holds the spider for `domain` in an open session.
    pub fn is_in_use(&self, domain: &str) -> bool {
        self.in_use.contains(domain)
    }
}

impl SpiderProvider for SpiderRegistry {
    fn lookup(&self, domain: &str) -> Option<SpiderHandle> {
        self.spiders.get(domain).map(|entry| Arc::clone(entry.value()))
    }

    fn open_domain(&self, domain: &str) -> Option<SpiderHandle> {
        let spider = self.lookup(domain);
        if spider.is_some() {
            self.in_use.insert(domain.to_string());
        }
        spider
    }

    fn close_domain(&self, domain: &str) {
        self.in_use.remove(domain);
    }
}
