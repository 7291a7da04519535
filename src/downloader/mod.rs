//! # Downloader Module
//!
//! Fetching requests under per-domain and global concurrency limits.
//!
//! ## Overview
//!
//! The engine talks to a [`Downloader`]: it opens and closes domains on it,
//! asks whether there is room for another domain, and asks per domain whether
//! dispatch should back out because the domain is saturated. The actual
//! transfer is delegated further down to a [`Fetcher`], which only knows how
//! to turn one request into a [`DownloadOutcome`].
//!
//! ## Key Components
//!
//! - **Downloader**: capacity-aware contract the engine drives.
//! - **Fetcher**: transport contract, one request in, one outcome out.
//! - **SlotDownloader**: the bundled downloader, one slot per open domain.
//! - **HttpFetcher**: `reqwest`-backed transport with redirects surfaced as
//!   follow-up requests.

mod http;
mod slot;

pub use http::HttpFetcher;
pub use slot::SlotDownloader;

use crate::error::EngineError;
use crate::request::{DownloadOutcome, Request};
use async_trait::async_trait;
use futures_util::future::BoxFuture;

/// Result of a download as handed to the engine.
pub type FetchFuture = BoxFuture<'static, Result<DownloadOutcome, EngineError>>;

/// Capacity-aware downloader contract.
pub trait Downloader: Send + Sync {
    /// True when no domain is open in the downloader.
    fn is_idle(&self) -> bool;
    /// True when another domain may be opened.
    fn has_capacity(&self) -> bool;
    fn open_domain(&self, domain: &str);
    /// Stops accepting work for `domain`. The domain stays open until its
    /// active transfers have finished.
    fn close_domain(&self, domain: &str);
    /// Cancels every active transfer of `domain` and forgets it at once.
    fn abort_domain(&self, domain: &str);
    /// Starts fetching `request` for `domain`.
    ///
    /// The transfer counts as active from the moment this returns, before the
    /// future is first polled, so backout and idleness checks see it at once.
    fn fetch(&self, request: Request, domain: &str) -> FetchFuture;
    fn needs_backout(&self, domain: &str) -> bool;
    fn active_transfers(&self, domain: &str) -> bool;
    fn is_domain_open(&self, domain: &str) -> bool;
    fn open_domains(&self) -> Vec<String>;
}

/// Transport contract: performs one transfer.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, request: &Request) -> Result<DownloadOutcome, EngineError>;
}

/// Concurrency limits of a [`SlotDownloader`].
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Domains that may be open at the same time.
    pub concurrent_domains: usize,
    /// Active transfers per domain before the domain backs out.
    pub concurrent_requests_per_domain: usize,
    /// Transfers in progress across all domains.
    pub concurrent_requests: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        DownloaderConfig {
            concurrent_domains: 8,
            concurrent_requests_per_domain: 8,
            concurrent_requests: num_cpus::get().max(16),
        }
    }
}

impl DownloaderConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.concurrent_domains == 0 {
            return Err(EngineError::Configuration(
                "concurrent_domains must be greater than 0.".to_string(),
            ));
        }
        if self.concurrent_requests_per_domain == 0 {
            return Err(EngineError::Configuration(
                "concurrent_requests_per_domain must be greater than 0.".to_string(),
            ));
        }
        if self.concurrent_requests == 0 {
            return Err(EngineError::Configuration(
                "concurrent_requests must be greater than 0.".to_string(),
            ));
        }
        Ok(())
    }
}
