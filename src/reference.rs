//! Reference generation for push/reply correlation.
//!
//! Every push sent over the socket carries a `ref` the server echoes back in
//! its `phx_reply`. Subscription handles draw from the same counter so a
//! [`SubscriptionRef`](crate::SubscriptionRef) can be minted on the caller's
//! thread without a round trip to the socket driver.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic, lock-free reference counter.
///
/// Starts at 1 and is never reset for the lifetime of the owning socket.
#[derive(Debug)]
pub struct RefGenerator {
    next: AtomicU64,
}

impl Default for RefGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RefGenerator {
    /// Create a new generator.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1), // 0 is never issued
        }
    }

    /// Next reference as a raw integer.
    pub fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Next reference in its wire form.
    pub fn next(&self) -> String {
        self.next_raw().to_string()
    }
}
