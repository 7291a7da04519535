//! Control surface of the engine and the main admission loop.

use super::ExecutionEngine;
use crate::signals::EngineEvent;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

impl ExecutionEngine {
    /// Starts the engine and its main loop. The first tick runs at once.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.running {
                debug!("Engine already running");
                return;
            }
            state.running = true;
            state.stopped_notified = false;
            state.start_time = Some(SystemTime::now());
        }
        self.stopped.send_replace(false);
        info!(
            "Engine started (main loop every {:?}, keep_alive={})",
            self.config.main_loop_interval,
            self.keep_alive()
        );
        self.signals.engine_started();

        let engine = Arc::downgrade(self);
        let period = self.config.main_loop_interval;
        let main_loop = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.main_loop_tick();
            }
        });

        {
            let mut state = self.state.lock();
            if !state.running {
                main_loop.abort();
                return;
            }
            if let Some(stale) = state.main_loop.replace(main_loop) {
                stale.abort();
            }
        }

        // Domains opened while stopped have not been drained yet.
        for domain in self.open_domains() {
            self.next_request(&domain);
        }
    }

    /// Stops the engine gracefully: no more admission, every open domain
    /// closes with reason `"shutdown"` once it goes idle.
    pub fn stop(self: &Arc<Self>) {
        let main_loop = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.main_loop.take()
        };
        if let Some(main_loop) = main_loop {
            main_loop.abort();
        }

        let open = self.open_domains();
        info!("Engine stopping ({} domains open)", open.len());
        if open.is_empty() {
            self.notify_stopped_if_drained();
            return;
        }
        for domain in open {
            let _ = self.close_domain(&domain, "shutdown");
        }
    }

    /// Forces every closing domain to finalize without waiting for its
    /// transfers. Only takes effect once the engine has been stopped.
    pub fn kill(self: &Arc<Self>) {
        let closing: Vec<String> = {
            let mut state = self.state.lock();
            if state.running {
                drop(state);
                warn!("Engine must be stopped before it can be killed");
                return;
            }
            state.killed = true;
            for record in state.closing.values_mut() {
                record.cancel_recheck();
            }
            state.closing.keys().cloned().collect()
        };
        warn!("Killing engine, finalizing {} closing domains", closing.len());
        for domain in closing {
            self.finish_closing(&domain);
        }
    }

    /// Suspends admission and draining. Transfers already started carry on.
    pub fn pause(&self) {
        self.state.lock().paused = true;
        info!("Engine paused");
    }

    pub fn unpause(&self) {
        self.state.lock().paused = false;
        info!("Engine unpaused");
    }

    /// Keeps the engine running when it runs out of work.
    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.state.lock().keep_alive = keep_alive;
    }

    pub fn keep_alive(&self) -> bool {
        self.state.lock().keep_alive
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn is_killed(&self) -> bool {
        self.state.lock().killed
    }

    /// When the engine was last started.
    pub fn start_time(&self) -> Option<SystemTime> {
        self.state.lock().start_time
    }

    /// True when the scheduler, downloader and scraper are all idle, no
    /// domain waits for admission and no crawl is in flight.
    pub fn is_idle(&self) -> bool {
        self.domain_scheduler.is_empty()
            && self.scheduler.is_idle()
            && self.downloader.is_idle()
            && self.scraper.is_idle()
            && self.state.lock().total_in_flight() == 0
    }

    /// Receives a copy of every lifecycle notification.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.signals.subscribe()
    }

    /// Resolves once `engine_stopped` has fired for the current run.
    pub async fn wait_until_stopped(&self) {
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    /// One iteration of the main loop: admit domains while the downloader
    /// has room, and stop once there is nothing left to do.
    pub(crate) fn main_loop_tick(self: &Arc<Self>) {
        {
            let state = self.state.lock();
            if !state.running || state.paused {
                return;
            }
        }
        trace!("Main loop tick");
        // Closing domains go back in the queue once the tick is over.
        let mut deferred = Vec::new();
        let mut exhausted = false;
        while self.is_running() && self.downloader.has_capacity() {
            let Some(domain) = self.domain_scheduler.next_domain() else {
                exhausted = true;
                break;
            };
            if self.domain_is_closing(&domain) {
                debug!("Deferring admission of {} until it has closed", domain);
                deferred.push(domain);
            } else if self.domain_is_closed(&domain) {
                self.open_domain(&domain);
            } else {
                debug!("Skipping admission of {}, already open", domain);
            }
        }
        for domain in &deferred {
            self.domain_scheduler.add_domain(domain);
        }
        if exhausted {
            self.stop_if_idle();
        }
    }

    fn stop_if_idle(self: &Arc<Self>) {
        if self.is_idle() && !self.keep_alive() {
            debug!("Nothing left to crawl, stopping engine");
            self.stop();
        }
    }

    /// Fires `engine_stopped` once the engine is stopped and no domain is
    /// open or closing.
    pub(crate) fn notify_stopped_if_drained(&self) {
        let drained = self.downloader.open_domains().is_empty();
        {
            let mut state = self.state.lock();
            if state.running || state.stopped_notified || !drained || !state.closing.is_empty() {
                return;
            }
            state.stopped_notified = true;
        }
        info!("Engine stopped");
        self.signals.engine_stopped();
        self.stopped.send_replace(true);
    }
}
