//! Property-Based Tests for Rate Limiting Primitives
//!
//! # Test Properties
//!
//! 1. **Bucket bounds**: tokens stay within `[0, capacity]` for any schedule
//! 2. **Bucket recovery**: after waiting `ceil((n - tokens) / rate)` seconds,
//!    consuming `n` tokens succeeds
//! 3. **Window bounds**: retained events never exceed the limit

#![cfg(test)]

use std::time::{Duration, Instant};

use proptest::prelude::*;

use super::sliding_window::SlidingWindow;
use super::token_bucket::TokenBucket;

// =============================================================================
// Property Strategies
// =============================================================================

/// (capacity, refill rate per second)
fn bucket_strategy() -> impl Strategy<Value = (u32, f64)> {
    (1u32..=50, 0.1f64..20.0)
}

/// Sequence of (milliseconds since previous call, cost)
fn schedule_strategy() -> impl Strategy<Value = Vec<(u64, u32)>> {
    prop::collection::vec((0u64..2_000, 0u32..10), 1..200)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the balance never leaves [0, capacity].
    #[test]
    fn prop_bucket_tokens_bounded(
        (capacity, rate) in bucket_strategy(),
        schedule in schedule_strategy(),
    ) {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(capacity, rate, start);
        let mut now = start;

        for (gap_ms, cost) in schedule {
            now += Duration::from_millis(gap_ms);
            bucket.try_consume_at(cost, now);
            let tokens = bucket.available_at(now);
            prop_assert!(tokens >= 0.0);
            prop_assert!(tokens <= capacity as f64);
        }
    }

    /// Property: waiting the advertised time always makes room for n tokens.
    #[test]
    fn prop_bucket_recovers_after_wait(
        (capacity, rate) in bucket_strategy(),
        schedule in schedule_strategy(),
        n in 1u32..=50,
    ) {
        let n = n.min(capacity);
        let start = Instant::now();
        let bucket = TokenBucket::new_at(capacity, rate, start);
        let mut now = start;

        for (gap_ms, cost) in schedule {
            now += Duration::from_millis(gap_ms);
            bucket.try_consume_at(cost, now);
        }

        let tokens = bucket.available_at(now);
        let wait_secs = ((n as f64 - tokens) / rate).max(0.0).ceil();
        // 1ms of slack absorbs float rounding in the refill arithmetic.
        let later = now + Duration::from_secs_f64(wait_secs) + Duration::from_millis(1);
        prop_assert!(bucket.try_consume_at(n, later).is_consumed());
    }

    /// Property: the window never holds more than `limit` events.
    #[test]
    fn prop_window_bounded(
        limit in 1usize..30,
        window_ms in 100u64..5_000,
        schedule in schedule_strategy(),
    ) {
        let start = Instant::now();
        let window = SlidingWindow::new(limit, Duration::from_millis(window_ms));
        let mut now = start;

        for (gap_ms, cost) in schedule {
            now += Duration::from_millis(gap_ms);
            window.try_acquire_at(cost as usize, now);
            prop_assert!(window.count_at(now) <= limit);
        }
    }
}
