//! Token Bucket - burst control
//!
//! Tokens accumulate at `refill_rate` per second up to `capacity`. Refill is
//! lazy: it happens on every consume attempt based on elapsed time.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Outcome of a consume attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BucketOutcome {
    /// Tokens were taken; `remaining` is the balance afterwards
    Consumed { remaining: f64 },
    /// Not enough tokens; nothing was taken
    Insufficient { available: f64, wait: Duration },
}

impl BucketOutcome {
    pub fn is_consumed(&self) -> bool {
        matches!(self, BucketOutcome::Consumed { .. })
    }
}

/// Token bucket guarded by a mutex
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::new_at(capacity, refill_rate, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`
    pub fn new_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_rate: refill_rate.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Try to take `cost` tokens now
    pub fn try_consume(&self, cost: u32) -> BucketOutcome {
        self.try_consume_at(cost, Instant::now())
    }

    /// Try to take `cost` tokens at the given instant
    pub fn try_consume_at(&self, cost: u32, now: Instant) -> BucketOutcome {
        let cost = f64::from(cost);
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= cost {
            state.tokens -= cost;
            BucketOutcome::Consumed {
                remaining: state.tokens,
            }
        } else {
            BucketOutcome::Insufficient {
                available: state.tokens,
                wait: self.wait_for(cost - state.tokens),
            }
        }
    }

    /// Give back tokens taken by a consume that was later rejected elsewhere
    pub fn refund(&self, cost: u32) {
        let mut state = self.state.lock();
        state.tokens = (state.tokens + f64::from(cost)).min(self.capacity);
    }

    /// Current balance (after lazy refill)
    pub fn available(&self) -> f64 {
        self.available_at(Instant::now())
    }

    pub fn available_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    /// Time until `cost` tokens are available, zero if they already are
    pub fn time_until(&self, cost: u32, now: Instant) -> Duration {
        let available = self.available_at(now);
        let needed = f64::from(cost) - available;
        if needed <= 0.0 {
            Duration::ZERO
        } else {
            self.wait_for(needed)
        }
    }

    /// Refill to capacity
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.tokens = self.capacity;
        state.last_refill = Instant::now();
    }

    fn wait_for(&self, needed: f64) -> Duration {
        Duration::from_secs_f64(needed / self.refill_rate)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // A caller-supplied instant may predate the last refill.
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}
