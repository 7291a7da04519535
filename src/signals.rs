//! # Signals Module
//!
//! Lifecycle notifications emitted by the engine.
//!
//! ## Overview
//!
//! Interested parties hook into the engine in two ways:
//!
//! - **Listeners** implement [`EngineListener`] and are called synchronously,
//!   in registration order, from inside the engine's control flow. They are
//!   the only way to veto closing an idle domain (return [`IdleVerdict::Veto`]).
//! - **Subscribers** call [`SignalBus::subscribe`] and receive an
//!   [`EngineEvent`] for every notification over a broadcast channel. They
//!   observe, but cannot influence, the engine.
//!
//! A failing or panicking listener never disturbs the engine: the error is
//! logged and dispatch moves on to the next listener.

use crate::spider::SpiderHandle;
use parking_lot::RwLock;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error};

const EVENT_CAPACITY: usize = 1024;

/// A listener's answer to a domain going idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleVerdict {
    /// Let the engine close the domain.
    #[default]
    Proceed,
    /// Keep the domain open; the engine will check idleness again later.
    Veto,
}

/// Synchronous hooks into the engine lifecycle. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait EngineListener: Send + Sync {
    fn engine_started(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn domain_opened(&self, domain: &str, spider: Option<&SpiderHandle>) -> anyhow::Result<()> {
        Ok(())
    }

    fn domain_idle(
        &self,
        domain: &str,
        spider: Option<&SpiderHandle>,
    ) -> anyhow::Result<IdleVerdict> {
        Ok(IdleVerdict::Proceed)
    }

    fn domain_closed(
        &self,
        domain: &str,
        spider: Option<&SpiderHandle>,
        reason: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn engine_stopped(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Broadcast copy of a lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    EngineStarted,
    DomainOpened { domain: String },
    DomainIdle { domain: String },
    DomainClosed { domain: String, reason: String },
    EngineStopped,
}

/// Fire-and-log-errors dispatcher for engine lifecycle notifications.
pub struct SignalBus {
    listeners: RwLock<Vec<Arc<dyn EngineListener>>>,
    events: broadcast::Sender<EngineEvent>,
}

impl SignalBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn EngineListener>) {
        self.listeners.write().push(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    // Listeners may register other listeners while being dispatched to.
    fn snapshot(&self) -> Vec<Arc<dyn EngineListener>> {
        self.listeners.read().clone()
    }

    fn broadcast(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("No subscribers for engine event");
        }
    }

    pub fn engine_started(&self) {
        for listener in self.snapshot() {
            send_catch_log("engine_started", || listener.engine_started());
        }
        self.broadcast(EngineEvent::EngineStarted);
    }

    pub fn domain_opened(&self, domain: &str, spider: Option<&SpiderHandle>) {
        for listener in self.snapshot() {
            send_catch_log("domain_opened", || listener.domain_opened(domain, spider));
        }
        self.broadcast(EngineEvent::DomainOpened {
            domain: domain.to_string(),
        });
    }

    /// Asks every listener whether `domain` may close. The first veto wins.
    pub fn domain_idle(&self, domain: &str, spider: Option<&SpiderHandle>) -> IdleVerdict {
        self.broadcast(EngineEvent::DomainIdle {
            domain: domain.to_string(),
        });
        for listener in self.snapshot() {
            let verdict = send_catch_log("domain_idle", || listener.domain_idle(domain, spider));
            if verdict == Some(IdleVerdict::Veto) {
                debug!("Closing of idle domain {} vetoed by a listener", domain);
                return IdleVerdict::Veto;
            }
        }
        IdleVerdict::Proceed
    }

    pub fn domain_closed(&self, domain: &str, spider: Option<&SpiderHandle>, reason: &str) {
        for listener in self.snapshot() {
            send_catch_log("domain_closed", || {
                listener.domain_closed(domain, spider, reason)
            });
        }
        self.broadcast(EngineEvent::DomainClosed {
            domain: domain.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn engine_stopped(&self) {
        for listener in self.snapshot() {
            send_catch_log("engine_stopped", || listener.engine_stopped());
        }
        self.broadcast(EngineEvent::EngineStopped);
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

fn send_catch_log<T>(signal: &str, call: impl FnOnce() -> anyhow::Result<T>) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!("Error caught on {} signal handler: {:#}", signal, e);
            None
        }
        Err(payload) => {
            error!(
                "Panic caught on {} signal handler: {}",
                signal,
                panic_message(payload.as_ref())
            );
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        idle_calls: AtomicUsize,
        verdict: IdleVerdict,
    }

    impl Counting {
        fn new(verdict: IdleVerdict) -> Arc<Self> {
            Arc::new(Self {
                idle_calls: AtomicUsize::new(0),
                verdict,
            })
        }
    }

    impl EngineListener for Counting {
        fn domain_idle(&self, _: &str, _: Option<&SpiderHandle>) -> anyhow::Result<IdleVerdict> {
            self.idle_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.verdict)
        }
    }

    struct Faulty;

    impl EngineListener for Faulty {
        fn domain_opened(&self, _: &str, _: Option<&SpiderHandle>) -> anyhow::Result<()> {
            anyhow::bail!("listener failed")
        }

        fn domain_idle(&self, _: &str, _: Option<&SpiderHandle>) -> anyhow::Result<IdleVerdict> {
            panic!("listener panicked")
        }
    }

    #[test]
    fn first_veto_short_circuits() {
        let bus = SignalBus::new();
        let first = Counting::new(IdleVerdict::Veto);
        let second = Counting::new(IdleVerdict::Proceed);
        bus.add_listener(first.clone());
        bus.add_listener(second.clone());

        assert_eq!(bus.domain_idle("a.com", None), IdleVerdict::Veto);
        assert_eq!(first.idle_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.idle_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_errors_and_panics_are_contained() {
        let bus = SignalBus::new();
        let after = Counting::new(IdleVerdict::Proceed);
        bus.add_listener(Arc::new(Faulty));
        bus.add_listener(after.clone());

        bus.domain_opened("a.com", None);
        assert_eq!(bus.domain_idle("a.com", None), IdleVerdict::Proceed);
        assert_eq!(after.idle_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = SignalBus::new();
        let mut events = bus.subscribe();

        bus.engine_started();
        bus.domain_closed("a.com", None, "finished");
        bus.engine_stopped();

        assert_eq!(events.recv().await.unwrap(), EngineEvent::EngineStarted);
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::DomainClosed {
                domain: "a.com".into(),
                reason: "finished".into()
            }
        );
        assert_eq!(events.recv().await.unwrap(), EngineEvent::EngineStopped);
    }
}
