//! Pending call table: one settlement slot per correlation id
//!
//! A call registers a slot and waits on the receiving half. Two completion
//! sources race for the slot: the session driver when the matching reply
//! arrives, and the caller's own timer. Whoever removes the slot from the
//! table first settles the call; the other finds nothing and does nothing.
//! A caller that stops waiting gives its slot up when its [`PendingCall`]
//! drops, and a session that goes away fails every slot still in the table.

use crate::error::RpcError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// Outcome delivered to a waiting caller
pub type Settlement<T> = Result<T, RpcError>;

/// The right to settle one call. Consumed on use, so a call settles at most once.
pub struct Settler<T> {
    tx: oneshot::Sender<Settlement<T>>,
}

impl<T> Settler<T> {
    pub fn settle(self, outcome: Settlement<T>) {
        // Receiver gone means the caller already returned; nothing to deliver.
        let _ = self.tx.send(outcome);
    }
}

struct Slot<K, T> {
    kind: K,
    tx: oneshot::Sender<Settlement<T>>,
}

/// Correlation table owned by exactly one session.
///
/// `K` is the call-kind data kept for validating the reply; `T` is what the
/// caller receives on success.
pub struct PendingCalls<K, T> {
    slots: Mutex<HashMap<u64, Slot<K, T>>>,
}

impl<K, T> PendingCalls<K, T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a slot for `id` and return the handle the caller waits on.
    pub fn register(&self, id: u64, kind: K) -> PendingCall<'_, K, T> {
        let (tx, rx) = oneshot::channel();
        let previous = self.slots.lock().insert(id, Slot { kind, tx });
        debug_assert!(previous.is_none(), "correlation id {} reused", id);
        PendingCall {
            table: self,
            id,
            rx,
        }
    }

    /// Remove the slot for `id`, if it is still pending.
    pub fn claim(&self, id: u64) -> Option<(K, Settler<T>)> {
        self.slots
            .lock()
            .remove(&id)
            .map(|slot| (slot.kind, Settler { tx: slot.tx }))
    }

    /// Remove the slot for `id` only if its call kind satisfies `accept`.
    ///
    /// A reply of the wrong type leaves the call pending.
    pub fn claim_matching(&self, id: u64, accept: impl FnOnce(&K) -> bool) -> Option<(K, Settler<T>)> {
        let mut slots = self.slots.lock();
        let accepted = slots.get(&id).map_or(false, |slot| accept(&slot.kind));
        if !accepted {
            return None;
        }
        slots
            .remove(&id)
            .map(|slot| (slot.kind, Settler { tx: slot.tx }))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.slots.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Settle every pending call with `NotOnline`. Returns how many there were.
    pub fn fail_all(&self) -> usize {
        let slots: Vec<Slot<K, T>> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        let failed = slots.len();
        for slot in slots {
            let _ = slot.tx.send(Err(RpcError::NotOnline));
        }
        failed
    }
}

/// A registered call. Dropping it before it settles removes its slot.
pub struct PendingCall<'a, K, T> {
    table: &'a PendingCalls<K, T>,
    id: u64,
    rx: oneshot::Receiver<Settlement<T>>,
}

impl<K, T> PendingCall<'_, K, T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the call to settle, or settle it with `Timeout` after `window`.
    pub async fn wait(mut self, window: Duration) -> Settlement<T> {
        match tokio::time::timeout(window, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            // Slot claimed and dropped without an outcome: the session went away.
            Ok(Err(_)) => Err(RpcError::NotOnline),
            Err(_) => {
                if self.table.claim(self.id).is_some() {
                    Err(RpcError::Timeout)
                } else {
                    // The reply claimed the slot first; its outcome is in flight.
                    (&mut self.rx).await.unwrap_or(Err(RpcError::Timeout))
                }
            }
        }
    }
}

impl<K, T> Drop for PendingCall<'_, K, T> {
    fn drop(&mut self) {
        self.table.claim(self.id);
    }
}

impl<K, T> Default for PendingCalls<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Correlation id allocator with a fixed parity.
///
/// Connection initiators allocate even ids (`n * 2`), relays originating a
/// forwarded request allocate odd ids (`n * 2 + 1`), so the two id spaces on
/// one connection never collide. Even ids start at 2; 0 is reserved for
/// self-registration.
pub struct CorrelationIds {
    counter: AtomicU64,
    odd: bool,
}

impl CorrelationIds {
    pub fn even() -> Self {
        Self {
            counter: AtomicU64::new(1),
            odd: false,
        }
    }

    pub fn odd() -> Self {
        Self {
            counter: AtomicU64::new(1),
            odd: true,
        }
    }

    pub fn next(&self) -> u64 {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        if self.odd {
            n * 2 + 1
        } else {
            n * 2
        }
    }
}

// ===== TESTS =====
