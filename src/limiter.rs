//! Leaky-bucket rate limiter for outbound notifications.
//!
//! The bucket holds up to `capacity` tokens. Once a full refill interval has
//! elapsed since the last top-up, the bucket is filled back to capacity, so
//! the behavior is burst-then-steady-state rather than a per-token drip.
//! Excess events are dropped by the caller; `pour` never waits.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Default burst size: this many matches pass before throttling kicks in.
pub const DEFAULT_BURST: u32 = 6;

/// Default refill period (1.5s).
pub const DEFAULT_REFILL: Duration = Duration::from_millis(1500);

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Burst-tolerant limiter shared by every watched file.
///
/// # Thread Safety
///
/// `pour` takes a short internal lock; the bucket can be shared behind an
/// `Arc` and called from any task.
#[derive(Debug)]
pub struct LeakyBucket {
    capacity: u32,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl LeakyBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        if capacity == 0 {
            tracing::warn!("Leaky bucket capacity is 0, every pour will fail");
        }

        Self {
            capacity,
            refill_interval,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to draw `amount` tokens now. Returns `false` when rate limited.
    pub fn pour(&self, amount: u32) -> bool {
        self.pour_at(amount, Instant::now())
    }

    /// Try to draw `amount` tokens as of `now`.
    pub fn pour_at(&self, amount: u32, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if now.saturating_duration_since(state.last_refill) >= self.refill_interval {
            state.tokens = self.capacity;
            state.last_refill = now;
        }

        if state.tokens < amount {
            return false;
        }

        state.tokens -= amount;
        true
    }

    /// Tokens currently available (without applying a refill).
    pub fn available(&self) -> u32 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }
}

impl Default for LeakyBucket {
    fn default() -> Self {
        Self::new(DEFAULT_BURST, DEFAULT_REFILL)
    }
}
