//! Per-order write serialization.
//!
//! Every write to an order or its result set holds that order's guard for the
//! whole transaction. Different orders never contend. Waiting is bounded: a
//! caller that cannot get the guard within the store timeout gets
//! `LockError::Timeout` and may retry.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Errors from OrderLocks operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Order {0} is busy; gave up waiting")]
    Timeout(Uuid),
    #[error("Internal lock error")]
    LockPoisoned,
}

// ═══════════════════════════════════════════════════════════
// OrderLocks
// ═══════════════════════════════════════════════════════════

/// Keyed exclusive locks, one per order id.
pub struct OrderLocks {
    /// Ids currently held.
    held: Mutex<HashSet<Uuid>>,
    /// Signalled whenever a guard is released.
    released: Condvar,
    timeout: Duration,
}

impl OrderLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Acquire exclusive access to `order_id`, waiting at most the configured
    /// timeout.
    pub fn acquire(&self, order_id: Uuid) -> Result<OrderGuard<'_>, LockError> {
        let deadline = Instant::now() + self.timeout;
        let mut held = self.held.lock().map_err(|_| LockError::LockPoisoned)?;
        while held.contains(&order_id) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(%order_id, "Order lock wait timed out");
                return Err(LockError::Timeout(order_id));
            }
            let (next, _) = self
                .released
                .wait_timeout(held, remaining)
                .map_err(|_| LockError::LockPoisoned)?;
            held = next;
        }
        held.insert(order_id);
        Ok(OrderGuard {
            locks: self,
            order_id,
        })
    }

    fn release(&self, order_id: &Uuid) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(order_id);
        }
        self.released.notify_all();
    }
}

// ═══════════════════════════════════════════════════════════
// OrderGuard: RAII exclusive access token
// ═══════════════════════════════════════════════════════════

/// Dropping the guard releases the order for the next writer.
pub struct OrderGuard<'a> {
    locks: &'a OrderLocks,
    order_id: Uuid,
}

impl Drop for OrderGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.order_id);
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
