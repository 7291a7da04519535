//! Completion handles for asynchronous results.
//!
//! A [`Completer`] is the producing half, a [`Completion`] the awaitable half.
//! Dropping a `Completer` without resolving it resolves the `Completion` with
//! [`EngineError::Cancelled`], so an awaiting task never hangs on work that was
//! discarded (pending requests cleared when a domain closes, for example).

use crate::error::EngineError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Creates a linked completer/completion pair.
pub fn completion_pair<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, Completion { rx })
}

#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<Result<T, EngineError>>,
}

impl<T> Completer<T> {
    /// Resolves the linked completion. A completion nobody awaits any more is not an error.
    pub fn complete(self, result: Result<T, EngineError>) {
        let _ = self.tx.send(result);
    }
}

#[derive(Debug)]
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, EngineError>>,
}

impl<T> Completion<T> {
    /// A completion that is already resolved with `result`.
    pub fn ready(result: Result<T, EngineError>) -> Self {
        let (completer, completion) = completion_pair();
        completer.complete(result);
        completion
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(EngineError::Cancelled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_with_completed_value() {
        let (completer, completion) = completion_pair::<u32>();
        tokio::spawn(async move { completer.complete(Ok(7)) });
        assert_eq!(completion.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn dropped_completer_cancels() {
        let (completer, completion) = completion_pair::<()>();
        drop(completer);
        assert!(matches!(completion.await, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn ready_is_already_resolved() {
        let completion = Completion::ready(Ok("done"));
        assert_eq!(completion.await.unwrap(), "done");
    }
}
