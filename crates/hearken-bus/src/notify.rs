//! Lifecycle state and notification fan-out shared by the backends.
//!
//! The state lives in a [`tokio::sync::watch`] channel so late observers
//! still see that a bus became ready; transient notifications go through a
//! [`tokio::sync::broadcast`] channel so no listener blocks another.

use std::sync::Arc;

use hearken_types::{BusNotification, LifecycleState};
use tokio::sync::{broadcast, watch};
use tracing::trace;

/// Notifications buffered per listener before the slowest one starts
/// lagging.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub(crate) struct Lifecycle {
    state: Arc<watch::Sender<LifecycleState>>,
    events: broadcast::Sender<BusNotification>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        let (events, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self {
            state: Arc::new(state),
            events,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Move forward to `next`.  Returns `false` when the state is already at
    /// or past it, since transitions never go backwards.
    pub(crate) fn advance(&self, next: LifecycleState) -> bool {
        self.state.send_if_modified(|current| {
            if rank(next) > rank(*current) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Broadcast a notification.  Having nobody listening is normal.
    pub(crate) fn emit(&self, notification: BusNotification) {
        if self.events.send(notification).is_err() {
            trace!("notification emitted with no listeners");
        }
    }

    pub(crate) fn watch(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<BusNotification> {
        self.events.subscribe()
    }
}

fn rank(state: LifecycleState) -> u8 {
    match state {
        LifecycleState::Starting => 0,
        LifecycleState::Ready => 1,
        LifecycleState::Closed => 2,
    }
}
