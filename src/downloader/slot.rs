//! Slot-based downloader.
//!
//! Every open domain owns a slot recording its active transfers. A domain
//! whose slot is full backs out, the number of slots bounds how many domains
//! may be open, and a semaphore bounds transfers across all domains.

use super::{Downloader, DownloaderConfig, FetchFuture, Fetcher};
use crate::error::{EngineError, Severity};
use crate::request::Request;
use futures_util::future::{self, AbortHandle, Abortable, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

#[derive(Default)]
struct DomainSlot {
    transfers: HashMap<u64, AbortHandle>,
    closing: bool,
}

type Slots = Arc<Mutex<HashMap<String, DomainSlot>>>;

/// Releases a transfer from its slot however the transfer ends, including
/// when its future is dropped before completion.
struct TransferGuard {
    slots: Slots,
    domain: String,
    id: u64,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&self.domain) else {
            return;
        };
        slot.transfers.remove(&self.id);
        if slot.closing && slot.transfers.is_empty() {
            slots.remove(&self.domain);
            debug!("Downloader released closed domain {}", self.domain);
        }
    }
}

/// Capacity-aware [`Downloader`] over a pluggable [`Fetcher`].
pub struct SlotDownloader {
    fetcher: Arc<dyn Fetcher>,
    config: DownloaderConfig,
    slots: Slots,
    permits: Arc<Semaphore>,
    next_transfer: AtomicU64,
}

impl SlotDownloader {
    pub fn new<F: Fetcher>(fetcher: F) -> Self {
        Self::with_config(fetcher, DownloaderConfig::default())
    }

    pub fn with_config<F: Fetcher>(fetcher: F, config: DownloaderConfig) -> Self {
        Self::from_shared(Arc::new(fetcher), config)
    }

    pub fn from_shared(fetcher: Arc<dyn Fetcher>, config: DownloaderConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrent_requests));
        Self {
            fetcher,
            config,
            slots: Arc::new(Mutex::new(HashMap::new())),
            permits,
            next_transfer: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }
}

impl Downloader for SlotDownloader {
    fn is_idle(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn has_capacity(&self) -> bool {
        self.slots.lock().len() < self.config.concurrent_domains
    }

    fn open_domain(&self, domain: &str) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(domain.to_string()).or_default();
        if slot.closing {
            warn!("Downloader reopening domain {} while it is closing", domain);
            slot.closing = false;
        }
    }

    fn close_domain(&self, domain: &str) {
        let mut slots = self.slots.lock();
        let drained = match slots.get_mut(domain) {
            Some(slot) => {
                slot.closing = true;
                slot.transfers.is_empty()
            }
            None => {
                debug!("Downloader asked to close unknown domain {}", domain);
                return;
            }
        };
        if drained {
            slots.remove(domain);
        } else {
            trace!("Downloader domain {} closing after active transfers", domain);
        }
    }

    fn abort_domain(&self, domain: &str) {
        let removed = self.slots.lock().remove(domain);
        if let Some(slot) = removed {
            if !slot.transfers.is_empty() {
                debug!(
                    "Aborting {} active transfers for {}",
                    slot.transfers.len(),
                    domain
                );
            }
            for handle in slot.transfers.values() {
                handle.abort();
            }
        }
    }

    fn fetch(&self, request: Request, domain: &str) -> FetchFuture {
        let id = self.next_transfer.fetch_add(1, Ordering::Relaxed);
        let (abort_handle, registration) = AbortHandle::new_pair();
        {
            let mut slots = self.slots.lock();
            match slots.get_mut(domain) {
                Some(slot) if !slot.closing => {
                    slot.transfers.insert(id, abort_handle);
                }
                _ => {
                    return future::ready(Err(EngineError::ignore(format!(
                        "Domain {} is not open in the downloader",
                        domain
                    ))))
                    .boxed();
                }
            }
        }

        let guard = TransferGuard {
            slots: Arc::clone(&self.slots),
            domain: domain.to_string(),
            id,
        };
        let fetcher = Arc::clone(&self.fetcher);
        let permits = Arc::clone(&self.permits);

        async move {
            let _guard = guard;
            let transfer = async {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|_| EngineError::ignore("Downloader is shut down"))?;
                trace!("Fetching {}", request.url);
                fetcher.fetch(&request).await
            };
            match Abortable::new(transfer, registration).await {
                Ok(outcome) => outcome,
                Err(_aborted) => Err(EngineError::ignore_with(
                    format!("Download aborted: {}", request.url),
                    Severity::Debug,
                )),
            }
        }
        .boxed()
    }

    fn needs_backout(&self, domain: &str) -> bool {
        self.slots.lock().get(domain).is_some_and(|slot| {
            slot.closing || slot.transfers.len() >= self.config.concurrent_requests_per_domain
        })
    }

    fn active_transfers(&self, domain: &str) -> bool {
        self.slots
            .lock()
            .get(domain)
            .is_some_and(|slot| !slot.transfers.is_empty())
    }

    fn is_domain_open(&self, domain: &str) -> bool {
        self.slots.lock().contains_key(domain)
    }

    fn open_domains(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{DownloadOutcome, Response};
    use async_trait::async_trait;

    struct Instant200;

    #[async_trait]
    impl Fetcher for Instant200 {
        async fn fetch(&self, request: &Request) -> Result<DownloadOutcome, EngineError> {
            Ok(DownloadOutcome::Response(Response::new(
                request.url.clone(),
                200,
                "ok",
            )))
        }
    }

    struct Hanging;

    #[async_trait]
    impl Fetcher for Hanging {
        async fn fetch(&self, _request: &Request) -> Result<DownloadOutcome, EngineError> {
            future::pending().await
        }
    }

    fn request() -> Request {
        Request::get("https://a.com/").unwrap()
    }

    fn config(domains: usize, per_domain: usize) -> DownloaderConfig {
        DownloaderConfig {
            concurrent_domains: domains,
            concurrent_requests_per_domain: per_domain,
            concurrent_requests: 16,
        }
    }

    #[tokio::test]
    async fn transfer_is_active_from_fetch_until_completion() {
        let downloader = SlotDownloader::new(Instant200);
        downloader.open_domain("a.com");

        let transfer = downloader.fetch(request(), "a.com");
        assert!(downloader.active_transfers("a.com"));

        let outcome = transfer.await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Response(ref r) if r.status == 200));
        assert!(!downloader.active_transfers("a.com"));
    }

    #[tokio::test]
    async fn full_slot_backs_out() {
        let downloader = SlotDownloader::with_config(Hanging, config(4, 2));
        downloader.open_domain("a.com");

        let first = downloader.fetch(request(), "a.com");
        assert!(!downloader.needs_backout("a.com"));
        let _second = downloader.fetch(request(), "a.com");
        assert!(downloader.needs_backout("a.com"));

        drop(first);
        assert!(!downloader.needs_backout("a.com"));
        assert!(downloader.active_transfers("a.com"));
    }

    #[tokio::test]
    async fn closing_waits_for_active_transfers() {
        let downloader = SlotDownloader::with_config(Hanging, config(4, 4));
        downloader.open_domain("a.com");
        let transfer = downloader.fetch(request(), "a.com");

        downloader.close_domain("a.com");
        assert!(downloader.is_domain_open("a.com"));
        assert!(downloader.needs_backout("a.com"));
        let rejected = downloader.fetch(request(), "a.com").await;
        assert!(rejected.unwrap_err().is_ignored());

        drop(transfer);
        assert!(!downloader.is_domain_open("a.com"));
        assert!(downloader.is_idle());
    }

    #[tokio::test]
    async fn closing_an_idle_domain_removes_it_at_once() {
        let downloader = SlotDownloader::new(Instant200);
        downloader.open_domain("a.com");
        downloader.close_domain("a.com");
        assert!(downloader.open_domains().is_empty());
    }

    #[tokio::test]
    async fn abort_cancels_active_transfers() {
        let downloader = SlotDownloader::with_config(Hanging, config(4, 4));
        downloader.open_domain("a.com");
        let transfer = tokio::spawn(downloader.fetch(request(), "a.com"));

        downloader.abort_domain("a.com");

        assert!(!downloader.is_domain_open("a.com"));
        let result = transfer.await.unwrap();
        assert!(matches!(
            result,
            Err(EngineError::IgnoreRequest { ref reason, .. }) if reason.starts_with("Download aborted")
        ));
    }

    #[tokio::test]
    async fn capacity_is_bounded_by_open_domains() {
        let downloader = SlotDownloader::with_config(Instant200, config(1, 4));
        assert!(downloader.has_capacity());
        downloader.open_domain("a.com");
        assert!(!downloader.has_capacity());
        assert!(!downloader.is_idle());
    }

    #[tokio::test]
    async fn fetch_for_unknown_domain_is_ignored() {
        let downloader = SlotDownloader::new(Instant200);
        let result = downloader.fetch(request(), "b.com").await;
        assert!(result.unwrap_err().is_ignored());
    }
}
