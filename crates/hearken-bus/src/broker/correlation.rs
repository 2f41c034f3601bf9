//! Pending acknowledgement correlation.
//!
//! Every subscribe and unsubscribe the adapter sends reserves a packet
//! identifier here and gets back a [`Completion`].  The inbound packet task
//! resolves the entry when the matching SUBACK or UNSUBACK arrives; a timer
//! expires it when nothing arrives in time.
//!
//! Identifiers are non-zero 16-bit values drawn at random and re-drawn while
//! the candidate is still pending, so two outstanding requests never share
//! an identifier.

use std::collections::HashMap;

use hearken_types::{AckKind, BusError};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::backend::{Completion, CompletionHandle};

/// Random draws attempted before falling back to a linear scan.
const RANDOM_ATTEMPTS: usize = 32;

/// Work run when the acknowledgement arrives.  Its result completes the
/// caller's [`Completion`].
pub type AckContinuation = Box<dyn FnOnce() -> Result<(), BusError> + Send>;

/// Identifies one reservation.  `seq` tells a reservation apart from a later
/// one that reuses the same packet identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub packet_id: u16,
    seq: u64,
}

struct PendingEntry {
    kind: AckKind,
    seq: u64,
    handle: CompletionHandle,
    on_ack: AckContinuation,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<u16, PendingEntry>,
    next_seq: u64,
}

/// Map from packet identifier to the call waiting for its acknowledgement.
#[derive(Default)]
pub struct CorrelationTable {
    inner: Mutex<Inner>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh packet identifier for a request awaiting `kind`.
    pub fn reserve(
        &self,
        kind: AckKind,
        on_ack: AckContinuation,
    ) -> Result<(Ticket, Completion), BusError> {
        let mut inner = self.inner.lock();
        let packet_id = allocate_packet_id(&inner.entries)?;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let (handle, completion) = Completion::pending();
        inner.entries.insert(
            packet_id,
            PendingEntry {
                kind,
                seq,
                handle,
                on_ack,
            },
        );
        trace!(packet_id, %kind, "correlation reserved");
        Ok((Ticket { packet_id, seq }, completion))
    }

    /// Complete the request waiting for `kind` on `packet_id`.
    ///
    /// Acknowledgements nobody waits for, or of the wrong kind, are ignored
    /// and leave the table untouched.  Returns whether an entry completed.
    pub fn resolve(&self, packet_id: u16, kind: AckKind) -> bool {
        let entry = {
            let mut inner = self.inner.lock();
            let expected = inner.entries.get(&packet_id).map(|entry| entry.kind);
            match expected {
                Some(expected) if expected == kind => inner.entries.remove(&packet_id),
                Some(expected) => {
                    debug!(packet_id, %expected, got = %kind, "ignoring mismatched acknowledgement");
                    None
                }
                None => {
                    debug!(packet_id, %kind, "ignoring unsolicited acknowledgement");
                    None
                }
            }
        };
        let Some(entry) = entry else {
            return false;
        };
        let result = (entry.on_ack)();
        entry.handle.complete(result);
        true
    }

    /// Fail the reservation behind `ticket` with [`BusError::AckTimeout`] if
    /// it is still pending.
    pub fn expire(&self, ticket: Ticket) -> bool {
        let Some(entry) = self.take(ticket) else {
            return false;
        };
        warn!(packet_id = ticket.packet_id, kind = %entry.kind, "acknowledgement timed out");
        entry.handle.complete(Err(BusError::AckTimeout {
            kind: entry.kind,
            packet_id: ticket.packet_id,
        }));
        true
    }

    /// Drop a reservation whose request never made it onto the wire.
    pub fn discard(&self, ticket: Ticket) {
        self.take(ticket);
    }

    pub fn is_pending(&self, packet_id: u16) -> bool {
        self.inner.lock().entries.contains_key(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, ticket: Ticket) -> Option<PendingEntry> {
        let mut inner = self.inner.lock();
        let current = inner
            .entries
            .get(&ticket.packet_id)
            .is_some_and(|entry| entry.seq == ticket.seq);
        if current {
            inner.entries.remove(&ticket.packet_id)
        } else {
            None
        }
    }
}

/// A random non-zero packet identifier, used where nothing waits for an
/// answer (QoS 0 publishes).
pub fn random_packet_id() -> u16 {
    rand::thread_rng().gen_range(1..=u16::MAX)
}

fn allocate_packet_id<V>(pending: &HashMap<u16, V>) -> Result<u16, BusError> {
    if pending.len() >= usize::from(u16::MAX) {
        return Err(BusError::CorrelationExhausted);
    }
    for _ in 0..RANDOM_ATTEMPTS {
        let candidate = random_packet_id();
        if !pending.contains_key(&candidate) {
            return Ok(candidate);
        }
    }
    (1..=u16::MAX)
        .find(|candidate| !pending.contains_key(candidate))
        .ok_or(BusError::CorrelationExhausted)
}
