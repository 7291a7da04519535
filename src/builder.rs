//! # Builder Module
//!
//! Provides the `EngineBuilder`, a fluent API for wiring an
//! [`ExecutionEngine`] to its collaborators and configuring its timing.
//!
//! ## Overview
//!
//! Every collaborator has a bundled default, so the smallest useful engine
//! only needs spiders:
//!
//! - scheduler: [`MemoryScheduler`]
//! - domain scheduler: [`FifoDomainScheduler`]
//! - downloader: [`SlotDownloader`] over [`HttpFetcher`]
//! - scraper: [`SpiderScraper`] over the registered spiders
//! - spider provider: [`SpiderRegistry`]
//! - stats: [`StatCollector`]
//!
//! Any of them can be replaced by an implementation of the matching trait.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::EngineBuilder;
//! use std::time::Duration;
//!
//! let engine = EngineBuilder::new()
//!     .spider(MySpider)
//!     .concurrent_domains(4)
//!     .main_loop_interval(Duration::from_secs(1))
//!     .build()?;
//!
//! engine.crawl_start_requests("example.com")?;
//! engine.start();
//! engine.wait_until_stopped().await;
//! ```

use crate::domain_scheduler::{DomainScheduler, FifoDomainScheduler};
use crate::downloader::{Downloader, DownloaderConfig, Fetcher, HttpFetcher, SlotDownloader};
use crate::engine::{Collaborators, ExecutionEngine};
use crate::error::EngineError;
use crate::scheduler::{MemoryScheduler, Scheduler};
use crate::scraper::{ScrapedItem, Scraper, SpiderScraper};
use crate::signals::{EngineListener, SignalBus};
use crate::spider::{Spider, SpiderHandle, SpiderProvider, SpiderRegistry};
use crate::stats::{StatCollector, StatsSink};
use kanal::AsyncSender;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What happens to a domain that receives a request before it was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImplicitAdmission {
    /// Hand the domain to the domain scheduler; it opens once the main loop
    /// admits it, counting toward the downloader's domain capacity.
    #[default]
    Queue,
    /// Open the domain at once, bypassing the domain scheduler.
    Immediate,
}

/// Timing and shutdown behaviour of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of the main admission loop.
    pub main_loop_interval: Duration,
    /// Delay between idleness checks of a closing domain while running.
    pub close_recheck_delay: Duration,
    /// Delay between idleness checks of a closing domain once stopped.
    pub stopped_recheck_delay: Duration,
    /// Delay before a drain deferred by `pause` is retried.
    pub pause_retry_delay: Duration,
    /// Keep running when there is nothing left to crawl.
    pub keep_alive: bool,
    pub implicit_admission: ImplicitAdmission,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            main_loop_interval: Duration::from_secs(5),
            close_recheck_delay: Duration::from_secs(5),
            stopped_recheck_delay: Duration::from_secs(1),
            pause_retry_delay: Duration::from_secs(5),
            keep_alive: false,
            implicit_admission: ImplicitAdmission::Queue,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let delays = [
            ("main_loop_interval", self.main_loop_interval),
            ("close_recheck_delay", self.close_recheck_delay),
            ("stopped_recheck_delay", self.stopped_recheck_delay),
            ("pause_retry_delay", self.pause_retry_delay),
        ];
        for (name, delay) in delays {
            if delay.is_zero() {
                return Err(EngineError::Configuration(format!(
                    "{} must be greater than 0.",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Assembles an [`ExecutionEngine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    downloader_config: DownloaderConfig,
    max_active_scrapes_per_domain: Option<usize>,
    scheduler: Option<Arc<dyn Scheduler>>,
    domain_scheduler: Option<Arc<dyn DomainScheduler>>,
    downloader: Option<Arc<dyn Downloader>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    scraper: Option<Arc<dyn Scraper>>,
    spider_provider: Option<Arc<dyn SpiderProvider>>,
    spiders: Vec<SpiderHandle>,
    stats: Option<Arc<dyn StatsSink>>,
    item_sender: Option<AsyncSender<ScrapedItem>>,
    listeners: Vec<Arc<dyn EngineListener>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn main_loop_interval(mut self, interval: Duration) -> Self {
        self.config.main_loop_interval = interval;
        self
    }

    pub fn close_recheck_delay(mut self, delay: Duration) -> Self {
        self.config.close_recheck_delay = delay;
        self
    }

    pub fn stopped_recheck_delay(mut self, delay: Duration) -> Self {
        self.config.stopped_recheck_delay = delay;
        self
    }

    pub fn pause_retry_delay(mut self, delay: Duration) -> Self {
        self.config.pause_retry_delay = delay;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn implicit_admission(mut self, admission: ImplicitAdmission) -> Self {
        self.config.implicit_admission = admission;
        self
    }

    /// Sets how many domains the bundled downloader keeps open at once.
    pub fn concurrent_domains(mut self, limit: usize) -> Self {
        self.downloader_config.concurrent_domains = limit;
        self
    }

    /// Sets the per-domain transfer limit of the bundled downloader.
    pub fn concurrent_requests_per_domain(mut self, limit: usize) -> Self {
        self.downloader_config.concurrent_requests_per_domain = limit;
        self
    }

    /// Sets the global transfer limit of the bundled downloader.
    pub fn concurrent_requests(mut self, limit: usize) -> Self {
        self.downloader_config.concurrent_requests = limit;
        self
    }

    /// Sets how many scrapes per domain the bundled scraper runs before the
    /// domain backs out.
    pub fn max_active_scrapes_per_domain(mut self, limit: usize) -> Self {
        self.max_active_scrapes_per_domain = Some(limit);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn domain_scheduler(mut self, domain_scheduler: Arc<dyn DomainScheduler>) -> Self {
        self.domain_scheduler = Some(domain_scheduler);
        self
    }

    /// Uses a custom downloader. Downloader limits set on the builder no
    /// longer apply.
    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Uses a custom transport under the bundled downloader.
    pub fn fetcher<F: Fetcher>(mut self, fetcher: F) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    pub fn scraper(mut self, scraper: Arc<dyn Scraper>) -> Self {
        self.scraper = Some(scraper);
        self
    }

    /// Uses a custom spider provider instead of the bundled registry.
    pub fn spider_provider(mut self, provider: Arc<dyn SpiderProvider>) -> Self {
        self.spider_provider = Some(provider);
        self
    }

    /// Registers a spider with the bundled registry.
    pub fn spider<S: Spider>(mut self, spider: S) -> Self {
        self.spiders.push(Arc::new(spider));
        self
    }

    pub fn stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Sends every scraped item to `sender`.
    pub fn item_sender(mut self, sender: AsyncSender<ScrapedItem>) -> Self {
        self.item_sender = Some(sender);
        self
    }

    pub fn add_listener<L: EngineListener + 'static>(mut self, listener: L) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn add_shared_listener(mut self, listener: Arc<dyn EngineListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Builds the engine. Must be called from within a Tokio runtime when
    /// the bundled HTTP transport is used.
    pub fn build(self) -> Result<Arc<ExecutionEngine>, EngineError> {
        self.config.validate()?;

        let spiders = self.resolve_spiders()?;
        let stats = self
            .stats
            .clone()
            .unwrap_or_else(|| Arc::new(StatCollector::new()));
        let downloader = match self.downloader.clone() {
            Some(downloader) => downloader,
            None => {
                self.downloader_config.validate()?;
                let fetcher = match self.fetcher.clone() {
                    Some(fetcher) => fetcher,
                    None => Arc::new(HttpFetcher::new()?),
                };
                Arc::new(SlotDownloader::from_shared(
                    fetcher,
                    self.downloader_config.clone(),
                ))
            }
        };
        let scraper = match self.scraper.clone() {
            Some(scraper) => scraper,
            None => {
                let mut scraper = SpiderScraper::new(Arc::clone(&spiders), Arc::clone(&stats));
                if let Some(limit) = self.max_active_scrapes_per_domain {
                    scraper = scraper.with_max_active_per_domain(limit);
                }
                if let Some(sender) = self.item_sender.clone() {
                    scraper = scraper.with_item_sender(sender);
                }
                Arc::new(scraper)
            }
        };

        let signals = SignalBus::new();
        for listener in self.listeners {
            signals.add_listener(listener);
        }
        debug!(
            "Building engine with {} listeners and {:?}",
            signals.listener_count(),
            self.config
        );

        let parts = Collaborators {
            scheduler: self
                .scheduler
                .unwrap_or_else(|| Arc::new(MemoryScheduler::new())),
            domain_scheduler: self
                .domain_scheduler
                .unwrap_or_else(|| Arc::new(FifoDomainScheduler::new())),
            downloader,
            scraper,
            spiders,
            stats,
            signals,
        };
        Ok(ExecutionEngine::new(self.config, parts))
    }

    fn resolve_spiders(&self) -> Result<Arc<dyn SpiderProvider>, EngineError> {
        match self.spider_provider.clone() {
            Some(_) if !self.spiders.is_empty() => Err(EngineError::Configuration(
                "Spiders cannot be registered alongside a custom spider provider.".to_string(),
            )),
            Some(provider) => Ok(provider),
            None => {
                let registry = SpiderRegistry::new();
                for spider in &self.spiders {
                    registry.register_handle(Arc::clone(spider));
                }
                Ok(Arc::new(registry))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{DownloadOutcome, Request, Response};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Fetcher for Echo {
        async fn fetch(&self, request: &Request) -> Result<DownloadOutcome, EngineError> {
            Ok(DownloadOutcome::Response(Response::new(
                request.url.clone(),
                200,
                "",
            )))
        }
    }

    #[test]
    fn default_config_matches_documented_timings() {
        let config = EngineConfig::default();
        assert_eq!(config.main_loop_interval, Duration::from_secs(5));
        assert_eq!(config.close_recheck_delay, Duration::from_secs(5));
        assert_eq!(config.stopped_recheck_delay, Duration::from_secs(1));
        assert_eq!(config.pause_retry_delay, Duration::from_secs(5));
        assert!(!config.keep_alive);
        assert_eq!(config.implicit_admission, ImplicitAdmission::Queue);
    }

    #[test]
    fn zero_delays_are_rejected() {
        let result = EngineBuilder::new()
            .fetcher(Echo)
            .main_loop_interval(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn zero_downloader_limits_are_rejected() {
        let result = EngineBuilder::new()
            .fetcher(Echo)
            .concurrent_requests_per_domain(0)
            .build();
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn builds_with_bundled_collaborators() {
        let engine = EngineBuilder::new()
            .fetcher(Echo)
            .keep_alive(true)
            .build()
            .unwrap();
        assert!(!engine.is_running());
        assert!(engine.keep_alive());
        assert!(engine.is_idle());
        assert!(engine.open_domains().is_empty());
    }
}
