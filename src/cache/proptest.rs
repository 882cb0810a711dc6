//! Property-Based Tests for the Memory Tier
//!
//! # Test Properties
//!
//! 1. **Budget**: stored bytes never exceed the budget
//! 2. **Strict LRU**: with insert-only traffic the survivors are a suffix of
//!    the insertion order, and the last evicted entry would not have fit

#![cfg(test)]

use bytes::Bytes;
use proptest::prelude::*;

use super::entry::CacheEntry;
use super::memory::{MemoryCache, MemoryCacheConfig};

fn sizes_strategy() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..=200, 1..100)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the byte budget is never exceeded, and the size counter
    /// matches the stored entries.
    #[test]
    fn prop_budget_respected(
        budget in 50u64..2_000,
        sizes in sizes_strategy(),
        reads in prop::collection::vec(0usize..100, 0..50),
    ) {
        let cache = MemoryCache::with_config(MemoryCacheConfig { max_size_bytes: budget });

        for (i, size) in sizes.iter().enumerate() {
            cache.insert(CacheEntry::new(format!("k{}", i), Bytes::from(vec![0u8; *size])));
            if let Some(r) = reads.get(i) {
                cache.get(&format!("k{}", r));
            }
            prop_assert!(cache.size() <= budget);
        }

        let total: u64 = cache
            .keys_by_recency()
            .iter()
            .filter_map(|k| cache.peek(k))
            .map(|e| e.size())
            .sum();
        prop_assert_eq!(total, cache.size());
    }

    /// Property: without reads, eviction removes the oldest insertions first.
    #[test]
    fn prop_strict_lru_suffix(
        budget in 50u64..2_000,
        sizes in sizes_strategy(),
    ) {
        let cache = MemoryCache::with_config(MemoryCacheConfig { max_size_bytes: budget });
        let mut accepted = Vec::new();

        for (i, size) in sizes.iter().enumerate() {
            let key = format!("k{}", i);
            if cache.insert(CacheEntry::new(key.clone(), Bytes::from(vec![0u8; *size]))) {
                accepted.push((key, *size as u64));
            }
        }

        let survivors = cache.keys_by_recency();
        let suffix: Vec<String> = accepted[accepted.len() - survivors.len()..]
            .iter()
            .map(|(k, _)| k.clone())
            .collect();
        prop_assert_eq!(&survivors, &suffix);

        // The newest evicted entry plus the survivors would overflow.
        if survivors.len() < accepted.len() {
            let (_, evicted_size) = &accepted[accepted.len() - survivors.len() - 1];
            prop_assert!(cache.size() + evicted_size > budget);
        }
    }
}
