//! The contract every delivery backend implements.
//!
//! Callers hold an `Arc<dyn Backend>` and never a concrete backend type, so
//! the in-process [`MemoryBus`][crate::memory::MemoryBus] and the
//! [`BrokerAdapter`][crate::broker::BrokerAdapter] are interchangeable.
//!
//! # Contract
//!
//! * Every call returns `Result<Completion, BusError>`.  The `Err` arm is a
//!   synchronous failure ([`BusError::UseAfterClose`] once the backend is
//!   closed); the [`Completion`] is the asynchronous "done" signal.
//! * Dropping a [`Completion`] never cancels the operation it tracks.
//! * `close` is idempotent and never fails synchronously.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use hearken_types::{BusError, BusNotification, LifecycleState, Message};
use tokio::sync::{broadcast, oneshot, watch};

type Callback = dyn Fn(&str, &Message) + Send + Sync;

/// A subscription callback.
///
/// Identity is the identity of the handle: clones of one `Subscriber` are the
/// same subscriber, while two subscribers built from identical closures are
/// not.
#[derive(Clone)]
pub struct Subscriber {
    callback: Arc<Callback>,
}

impl Subscriber {
    /// Wrap a `(topic, message)` callback.
    pub fn new(callback: impl Fn(&str, &Message) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Invoke the callback.
    pub fn deliver(&self, topic: &str, message: &Message) {
        (self.callback)(topic, message)
    }

    /// Stable key for this subscriber while any clone of it is alive.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.callback) as *const () as usize
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Subscriber {}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("key", &format_args!("{:#x}", self.key()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// One-shot completion signal of a backend call.
///
/// Resolves to `Ok(())` once the call has taken effect, or to the error that
/// prevented it (for instance [`BusError::AckTimeout`]).  A completion whose
/// producer went away without answering resolves to [`BusError::Abandoned`].
#[must_use = "a Completion does nothing unless awaited, but dropping it does not cancel the call"]
#[derive(Debug)]
pub struct Completion {
    state: CompletionState,
}

#[derive(Debug)]
enum CompletionState {
    Done(Option<Result<(), BusError>>),
    Pending(oneshot::Receiver<Result<(), BusError>>),
}

impl Completion {
    /// A completion that has already succeeded.
    pub fn done() -> Self {
        Self {
            state: CompletionState::Done(Some(Ok(()))),
        }
    }

    /// A completion that has already failed.
    pub fn failed(error: BusError) -> Self {
        Self {
            state: CompletionState::Done(Some(Err(error))),
        }
    }

    /// A completion answered later through the returned [`CompletionHandle`].
    pub fn pending() -> (CompletionHandle, Self) {
        let (tx, rx) = oneshot::channel();
        (
            CompletionHandle(tx),
            Self {
                state: CompletionState::Pending(rx),
            },
        )
    }
}

impl Future for Completion {
    type Output = Result<(), BusError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            CompletionState::Done(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
            CompletionState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(BusError::Abandoned))),
        }
    }
}

/// Producer side of a pending [`Completion`].
#[derive(Debug)]
pub struct CompletionHandle(oneshot::Sender<Result<(), BusError>>);

impl CompletionHandle {
    /// Resolve the paired completion.  A completion nobody awaits any more is
    /// not an error.
    pub fn complete(self, result: Result<(), BusError>) {
        let _ = self.0.send(result);
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Uniform publish/subscribe contract over interchangeable backends.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Register `subscriber` for every topic matching `pattern`.
    fn subscribe(&self, pattern: &str, subscriber: Subscriber) -> Result<Completion, BusError>;

    /// Deliver `message` to the current subscribers of `topic`.
    fn publish(&self, topic: &str, message: Message) -> Result<Completion, BusError>;

    /// Remove `subscriber` from `pattern`.  No-op when it is not subscribed.
    fn unsubscribe(&self, pattern: &str, subscriber: &Subscriber)
    -> Result<Completion, BusError>;

    /// Shut the backend down and release every subscription.
    fn close(&self) -> Completion;

    /// Watch the lifecycle state.
    fn lifecycle(&self) -> watch::Receiver<LifecycleState>;

    /// Receive every notification emitted from now on.
    fn notifications(&self) -> broadcast::Receiver<BusNotification>;

    /// Topics this backend has observed so far.
    fn known_topics(&self) -> Vec<String>;

    fn state(&self) -> LifecycleState {
        *self.lifecycle().borrow()
    }

    /// Resolve once the backend is ready.  Fails with
    /// [`BusError::UseAfterClose`] when it closes before getting there.
    async fn wait_ready(&self) -> Result<(), BusError> {
        let mut rx = self.lifecycle();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                LifecycleState::Ready => return Ok(()),
                LifecycleState::Closed => return Err(BusError::UseAfterClose),
                LifecycleState::Starting => {}
            }
            rx.changed().await.map_err(|_| BusError::Abandoned)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[test]
    fn subscriber_identity_follows_the_handle() {
        let a = Subscriber::new(|_, _| {});
        let b = Subscriber::new(|_, _| {});
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn done_and_failed_completions_resolve_immediately() {
        assert_eq!(Completion::done().await, Ok(()));
        assert_eq!(
            Completion::failed(BusError::NotConnected).await,
            Err(BusError::NotConnected)
        );
    }

    #[tokio::test]
    async fn pending_completion_waits_for_its_handle() {
        let (handle, mut completion) = Completion::pending();
        assert!((&mut completion).now_or_never().is_none());
        handle.complete(Ok(()));
        assert_eq!(completion.await, Ok(()));
    }

    #[tokio::test]
    async fn dropped_handle_resolves_as_abandoned() {
        let (handle, completion) = Completion::pending();
        drop(handle);
        assert_eq!(completion.await, Err(BusError::Abandoned));
    }
}
