//! One-shot boolean completions handed back by the sync agent
//!
//! A `Completion` resolves exactly once. If its `Resolver` is dropped without
//! resolving, the completion reads as `false`, the same as a timeout.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

#[derive(Debug)]
pub struct Completion {
    state: State,
}

#[derive(Debug)]
enum State {
    Ready(bool),
    Waiting(oneshot::Receiver<bool>),
}

/// Write half of a `Completion`
#[derive(Debug)]
pub struct Resolver {
    tx: oneshot::Sender<bool>,
}

impl Completion {
    /// An already-resolved completion
    pub fn ready(value: bool) -> Self {
        Self {
            state: State::Ready(value),
        }
    }

    pub fn channel() -> (Resolver, Completion) {
        let (tx, rx) = oneshot::channel();
        (
            Resolver { tx },
            Completion {
                state: State::Waiting(rx),
            },
        )
    }
}

impl Resolver {
    /// Completes the paired future. Ignored if the waiter has gone away.
    pub fn resolve(self, value: bool) {
        let _ = self.tx.send(value);
    }
}

impl Future for Completion {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match &mut self.get_mut().state {
            State::Ready(value) => Poll::Ready(*value),
            State::Waiting(rx) => Pin::new(rx).poll(cx).map(|result| result.unwrap_or(false)),
        }
    }
}
