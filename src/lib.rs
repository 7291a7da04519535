//! # spider-engine
//!
//! Crawl orchestration engine for the `spider-engine` scraping framework.
//!
//! Drives many per-domain crawl sessions at once. Each domain is admitted,
//! drained through the schedule, download and scrape pipeline, detected idle,
//! negotiated closed and finalized, while the engine as a whole can be
//! started, paused, stopped gracefully or killed.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! struct Quotes;
//!
//! #[async_trait]
//! impl Spider for Quotes {
//!     fn domain_name(&self) -> &str { "quotes.toscrape.com" }
//!     fn start_urls(&self) -> Vec<String> { vec!["https://quotes.toscrape.com/".into()] }
//!     async fn parse(&self, response: Response) -> Result<ParseOutput, EngineError> {
//!         todo!()
//!     }
//! }
//!
//! async fn run() -> Result<(), EngineError> {
//!     let engine = EngineBuilder::new().spider(Quotes).build()?;
//!     engine.crawl_start_requests("quotes.toscrape.com")?;
//!     engine.start();
//!     engine.wait_until_stopped().await;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod completion;
pub mod domain_scheduler;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod prelude;
pub mod request;
pub mod scheduler;
pub mod scraper;
pub mod signals;
pub mod spider;
mod state;
pub mod stats;

pub use builder::{EngineBuilder, EngineConfig, ImplicitAdmission};
pub use completion::{Completer, Completion};
pub use domain_scheduler::{DomainScheduler, FifoDomainScheduler};
pub use downloader::{Downloader, DownloaderConfig, Fetcher, HttpFetcher, SlotDownloader};
pub use engine::ExecutionEngine;
pub use error::{EngineError, Severity};
pub use request::{DownloadOutcome, Request, Response};
pub use scheduler::{MemoryScheduler, Scheduler};
pub use scraper::{ScrapedItem, Scraper, SpiderScraper};
pub use signals::{EngineEvent, EngineListener, IdleVerdict, SignalBus};
pub use spider::{ParseOutput, Spider, SpiderHandle, SpiderProvider, SpiderRegistry};
pub use stats::{StatCollector, StatsSink};

pub use async_trait::async_trait;
pub use tokio;
