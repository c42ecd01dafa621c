//! # Request/Response Correlation
//!
//! Pending requests are tracked by message id. A blocking send registers a
//! single-shot slot *before* its frame is written, so a reply can never race
//! ahead of the registration. The read loop then offers every inbound
//! message to [`CorrelationTable::resolve`]; a message whose id has no slot
//! is simply not a reply and continues to dispatch as usual.
//!
//! ## Slot lifecycle
//! ```text
//! register(id) --> pending --+--> resolve(id, msg)   => Reply::Received
//!                            +--> timeout elapses    => Reply::TimedOut
//!                            +--> close_all()        => ConnectionClosed
//!                            +--> PendingReply drop  => slot removed
//! ```
//! Every path removes the slot, so the same id can be reused afterwards.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;
use crate::utils::metrics::global_metrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

type SlotResult = Result<Arc<Message>>;

struct Slot {
    // Distinguishes this registration from a later one reusing the same id.
    token: u64,
    tx: oneshot::Sender<SlotResult>,
}

#[derive(Default)]
struct Slots {
    pending: HashMap<u64, Slot>,
    next_token: u64,
    closed: bool,
}

/// Outcome of waiting for a correlated reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A message with the request's id arrived in time
    Received(Message),
    /// No reply arrived before the deadline
    TimedOut,
}

impl Reply {
    pub fn into_message(self) -> Option<Message> {
        match self {
            Reply::Received(msg) => Some(msg),
            Reply::TimedOut => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Reply::TimedOut)
    }
}

/// Table of pending waits for one endpoint
#[derive(Default)]
pub struct CorrelationTable {
    slots: Mutex<Slots>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slots>> {
        self.slots
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_CORRELATION_LOCK.into()))
    }

    /// Create the wait slot for `id`.
    ///
    /// Fails with [`ProtocolError::DuplicatePendingRequest`] if `id` already
    /// has an outstanding wait, and with [`ProtocolError::ConnectionClosed`]
    /// once the table has been closed.
    pub fn register(&self, id: u64) -> Result<PendingReply<'_>> {
        let mut slots = self.lock()?;
        if slots.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        if slots.pending.contains_key(&id) {
            warn!(id, "Duplicate pending request id");
            return Err(ProtocolError::DuplicatePendingRequest(id));
        }

        let token = slots.next_token;
        slots.next_token = slots.next_token.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        slots.pending.insert(id, Slot { token, tx });
        trace!(id, "Pending reply registered");

        Ok(PendingReply {
            table: self,
            id,
            token,
            rx,
        })
    }

    /// Register a wait for `id` and block the calling task until it resolves.
    pub async fn await_reply(&self, id: u64, timeout: Duration) -> Result<Reply> {
        self.register(id)?.wait(timeout).await
    }

    /// Deliver `msg` to the waiter registered under `id`, if any.
    ///
    /// Returns whether a waiter was found.
    pub fn resolve(&self, id: u64, msg: &Arc<Message>) -> bool {
        let slot = match self.lock() {
            Ok(mut slots) => slots.pending.remove(&id),
            Err(e) => {
                warn!(error = %e, id, "Cannot resolve pending reply");
                return false;
            }
        };

        match slot {
            Some(slot) => {
                if slot.tx.send(Ok(Arc::clone(msg))).is_err() {
                    // The waiter gave up between lookup and delivery.
                    debug!(id, "Reply arrived for an abandoned wait");
                    return false;
                }
                global_metrics().reply_matched();
                trace!(id, code = msg.code(), "Pending reply resolved");
                true
            }
            None => false,
        }
    }

    /// Fail every pending wait with [`ProtocolError::ConnectionClosed`] and
    /// refuse new registrations. Returns how many waits were cancelled.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(u64, Slot)> = match self.lock() {
            Ok(mut slots) => {
                slots.closed = true;
                slots.pending.drain().collect()
            }
            Err(e) => {
                warn!(error = %e, "Cannot close pending replies");
                return 0;
            }
        };

        let count = drained.len();
        for (id, slot) in drained {
            trace!(id, "Pending reply cancelled by connection close");
            let _ = slot.tx.send(Err(ProtocolError::ConnectionClosed));
        }
        if count > 0 {
            debug!(count, "Cancelled pending replies");
        }
        count
    }

    /// Whether `close_all` has been called
    pub fn is_closed(&self) -> bool {
        self.lock().map(|slots| slots.closed).unwrap_or(true)
    }

    /// Whether `id` currently has an outstanding wait
    pub fn contains(&self, id: u64) -> bool {
        self.lock()
            .map(|slots| slots.pending.contains_key(&id))
            .unwrap_or(false)
    }

    /// Number of outstanding waits
    pub fn len(&self) -> usize {
        self.lock().map(|slots| slots.pending.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn discard(&self, id: u64, token: u64) {
        if let Ok(mut slots) = self.lock() {
            if slots.pending.get(&id).is_some_and(|slot| slot.token == token) {
                slots.pending.remove(&id);
                trace!(id, "Pending reply discarded");
            }
        }
    }
}

/// A registered wait slot.
///
/// Dropping it without waiting (for instance when the caller's future is
/// cancelled) removes the slot from the table.
pub struct PendingReply<'a> {
    table: &'a CorrelationTable,
    id: u64,
    token: u64,
    rx: oneshot::Receiver<SlotResult>,
}

impl PendingReply<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the reply, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Reply> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(Ok(msg))) => Ok(Reply::Received(Arc::unwrap_or_clone(msg))),
            Ok(Ok(Err(e))) => Err(e),
            // Sender dropped without a value: the table went away.
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                global_metrics().reply_timeout();
                debug!(id = self.id, timeout_ms = timeout.as_millis() as u64, "Timed out waiting for reply");
                Ok(Reply::TimedOut)
            }
        }
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.table.discard(self.id, self.token);
    }
}
