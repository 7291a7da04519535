//! # Engine Module
//!
//! The execution engine: the orchestrator that drives every domain of a
//! crawl from admission to close.
//!
//! ## Overview
//!
//! The engine owns no queues and performs no transfers. It coordinates its
//! collaborators:
//!
//! - the [`Scheduler`] holding each domain's pending requests,
//! - the [`DomainScheduler`] deciding which domain to admit next,
//! - the [`Downloader`] performing transfers under capacity limits,
//! - the [`Scraper`] turning responses into items and follow-up requests,
//! - the [`SpiderProvider`], [`StatsSink`] and [`SignalBus`] it reports to.
//!
//! ## Control flow
//!
//! A periodic main loop admits domains while the downloader has room and
//! stops the engine once nothing is left. Every open domain is drained by a
//! debounced loop that pulls requests from the scheduler and dispatches them
//! through download and scrape until the domain backs out or runs dry. A
//! drained domain that is idle is offered to listeners, which may veto the
//! close, and otherwise closes with reason `"finished"`. Closing waits for
//! the domain to go idle unless the engine has been killed.
//!
//! ## Internal Components
//!
//! - `core`: control surface (`start`, `stop`, `kill`, `pause`) and the main loop.
//! - `lifecycle`: opening, idle handling, closing and finalizing domains.
//! - `pipeline`: `crawl`, `schedule`, the drain loop and `download`.

mod core;
mod lifecycle;
mod pipeline;

use crate::builder::EngineConfig;
use crate::domain_scheduler::DomainScheduler;
use crate::downloader::Downloader;
use crate::scheduler::Scheduler;
use crate::scraper::Scraper;
use crate::signals::SignalBus;
use crate::spider::SpiderProvider;
use crate::state::EngineState;
use crate::stats::StatsSink;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

/// Collaborators wired into an engine by the builder.
pub(crate) struct Collaborators {
    pub scheduler: Arc<dyn Scheduler>,
    pub domain_scheduler: Arc<dyn DomainScheduler>,
    pub downloader: Arc<dyn Downloader>,
    pub scraper: Arc<dyn Scraper>,
    pub spiders: Arc<dyn SpiderProvider>,
    pub stats: Arc<dyn StatsSink>,
    pub signals: SignalBus,
}

/// Orchestrates per-domain crawl sessions.
///
/// Built by [`EngineBuilder`](crate::EngineBuilder) and always handled
/// through an `Arc`, since its timers and pipeline tasks hold references
/// back to it.
pub struct ExecutionEngine {
    config: EngineConfig,
    scheduler: Arc<dyn Scheduler>,
    domain_scheduler: Arc<dyn DomainScheduler>,
    downloader: Arc<dyn Downloader>,
    scraper: Arc<dyn Scraper>,
    spiders: Arc<dyn SpiderProvider>,
    stats: Arc<dyn StatsSink>,
    signals: SignalBus,
    state: Mutex<EngineState>,
    stopped: watch::Sender<bool>,
}

impl ExecutionEngine {
    pub(crate) fn new(config: EngineConfig, parts: Collaborators) -> Arc<Self> {
        let (stopped, _) = watch::channel(false);
        let state = EngineState {
            keep_alive: config.keep_alive,
            ..EngineState::default()
        };
        Arc::new(Self {
            config,
            scheduler: parts.scheduler,
            domain_scheduler: parts.domain_scheduler,
            downloader: parts.downloader,
            scraper: parts.scraper,
            spiders: parts.spiders,
            stats: parts.stats,
            signals: parts.signals,
            state: Mutex::new(state),
            stopped,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn downloader(&self) -> &Arc<dyn Downloader> {
        &self.downloader
    }

    pub fn scraper(&self) -> &Arc<dyn Scraper> {
        &self.scraper
    }

    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }
}
