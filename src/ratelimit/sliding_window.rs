//! Sliding Window - sustained-rate control
//!
//! Keeps the timestamps of admitted events inside a trailing window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Sliding window log guarded by a mutex
#[derive(Debug)]
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `cost` events if they fit in the window
    pub fn try_acquire(&self, cost: usize) -> bool {
        self.try_acquire_at(cost, Instant::now())
    }

    pub fn try_acquire_at(&self, cost: usize, now: Instant) -> bool {
        let mut events = self.events.lock();
        Self::prune(&mut events, self.window, now);

        if events.len() + cost > self.limit {
            return false;
        }
        events.extend(std::iter::repeat(now).take(cost));
        true
    }

    /// Number of events currently inside the window
    pub fn count_at(&self, now: Instant) -> usize {
        let mut events = self.events.lock();
        Self::prune(&mut events, self.window, now);
        events.len()
    }

    pub fn count(&self) -> usize {
        self.count_at(Instant::now())
    }

    pub fn remaining_at(&self, now: Instant) -> usize {
        self.limit.saturating_sub(self.count_at(now))
    }

    /// Time until `cost` more events would fit
    pub fn time_until(&self, cost: usize, now: Instant) -> Duration {
        let mut events = self.events.lock();
        Self::prune(&mut events, self.window, now);

        let overflow = (events.len() + cost).saturating_sub(self.limit);
        if overflow == 0 {
            return Duration::ZERO;
        }
        // The `overflow`-th oldest event has to leave the window first.
        events
            .get(overflow - 1)
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(self.window)
    }

    /// When the oldest retained event leaves the window
    pub fn reset_in(&self, now: Instant) -> Duration {
        let mut events = self.events.lock();
        Self::prune(&mut events, self.window, now);
        events
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn prune(events: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while let Some(front) = events.front() {
            if now.saturating_duration_since(*front) >= window {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}
