//! Bounded record of recently seen inbound message ids.
//!
//! Webhook gateways retry deliveries they believe failed, so the same event
//! can arrive more than once. The cache remembers the last `capacity` ids and
//! rejects repeats.
//!
//! This is a best-effort window, not exactly-once delivery:
//! - when the cache fills, the oldest 20% of ids are evicted, and an evicted id
//!   is accepted again if the gateway redelivers it later;
//! - the cache lives in process memory, so a restart forgets every id and
//!   redeliveries arriving around the restart are processed again.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

/// Fraction of the capacity dropped per eviction round (1/5 = 20%).
const EVICTION_DIVISOR: usize = 5;

/// Insertion-ordered set of message ids with a hard size cap.
///
/// Safe to share across tasks; every operation takes one short lock.
pub struct IdempotencyCache {
    capacity: usize,
    inner: Mutex<Seen>,
}

#[derive(Default)]
struct Seen {
    ids: HashSet<String>,
    /// Insertion order for eviction, parallel to `ids`.
    order: VecDeque<String>,
}

impl IdempotencyCache {
    /// Create a cache remembering at most `capacity` ids (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Seen::default()),
        }
    }

    /// Record `id` and return `true` if it has not been seen; return `false`
    /// for a repeat, in which case the message must be dropped.
    pub fn accept(&self, id: &str) -> bool {
        let mut seen = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if seen.ids.contains(id) {
            debug!(id, "duplicate message id rejected");
            return false;
        }

        seen.ids.insert(id.to_string());
        seen.order.push_back(id.to_string());

        if seen.order.len() >= self.capacity {
            // Never evict the id that was just inserted.
            let evict = (self.capacity / EVICTION_DIVISOR)
                .max(1)
                .min(seen.order.len() - 1);
            for _ in 0..evict {
                if let Some(old) = seen.order.pop_front() {
                    seen.ids.remove(&old);
                }
            }
            if evict > 0 {
                debug!(evicted = evict, remaining = seen.order.len(), "idempotency cache trimmed");
            }
        }

        true
    }

    /// Drop `id` so a later redelivery is accepted again. Used when a message
    /// was accepted but could not be processed and the sender should retry.
    pub fn forget(&self, id: &str) -> bool {
        let mut seen = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !seen.ids.remove(id) {
            return false;
        }
        seen.order.retain(|seen_id| seen_id != id);
        debug!(id, "message id forgotten");
        true
    }

    /// Whether `id` is currently remembered. Does not record it.
    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(solara_core::config::DEFAULT_IDEMPOTENCY_CAPACITY)
    }
}
