//! Property-Based Tests for the Memory Cache
//!
//! Drives random put/get sequences against the cache and a plain LRU list
//! model, checking after every step that both agree.
//!
//! # Test Properties
//!
//! 1. **Cost Bound**: total cost never exceeds the cost ceiling
//! 2. **Count Bound**: entry count never exceeds the count ceiling
//! 3. **LRU Order**: residency matches the reference model exactly
//! 4. **Accounting**: reported total cost equals the sum of resident costs

#![cfg(test)]

use proptest::prelude::*;

use super::entry::Locator;
use super::memory::{MemoryCache, MemoryCacheConfig};
use crate::imaging::Bitmap;

const KEY_SPACE: u8 = 16;

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u64),
    Get(u8),
}

// =============================================================================
// Property Strategies
// =============================================================================

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..KEY_SPACE, 1u64..400).prop_map(|(k, c)| Op::Put(k, c)),
        2 => (0..KEY_SPACE).prop_map(Op::Get),
    ]
}

fn config_strategy() -> impl Strategy<Value = (u64, usize)> {
    (200u64..2000, 1usize..10)
}

// =============================================================================
// Reference Model
// =============================================================================

/// Entries ordered least to most recently used
#[derive(Default)]
struct Model {
    entries: Vec<(u8, u64)>,
}

impl Model {
    fn put(&mut self, key: u8, cost: u64, max_cost: u64, max_entries: usize) {
        if cost > max_cost {
            return;
        }
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, cost));
        while self.total() > max_cost || self.entries.len() > max_entries {
            self.entries.remove(0);
        }
    }

    fn get(&mut self, key: u8) -> bool {
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(pos) => {
                let entry = self.entries.remove(pos);
                self.entries.push(entry);
                true
            }
            None => false,
        }
    }

    fn contains(&self, key: u8) -> bool {
        self.entries.iter().any(|(k, _)| *k == key)
    }

    fn total(&self) -> u64 {
        self.entries.iter().map(|(_, c)| c).sum()
    }
}

fn locator(key: u8) -> Locator {
    Locator::new(format!("https://img/{}.jpg", key))
}

// =============================================================================
// Eviction Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: both ceilings hold after every operation.
    #[test]
    fn prop_ceilings_always_hold(
        (max_cost, max_entries) in config_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..200)
    ) {
        let cache = MemoryCache::with_config(MemoryCacheConfig {
            max_cost_bytes: max_cost,
            max_entries,
        });
        let bitmap = Bitmap::new(image::RgbaImage::new(1, 1));

        for op in ops {
            match op {
                Op::Put(k, c) => { cache.put(locator(k), bitmap.clone(), c); }
                Op::Get(k) => { cache.get(&locator(k)); }
            }
            prop_assert!(cache.total_cost() <= max_cost);
            prop_assert!(cache.len() <= max_entries);
        }
    }

    /// Property: residency and cost accounting match an LRU list model.
    #[test]
    fn prop_matches_lru_model(
        (max_cost, max_entries) in config_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..200)
    ) {
        let cache = MemoryCache::with_config(MemoryCacheConfig {
            max_cost_bytes: max_cost,
            max_entries,
        });
        let bitmap = Bitmap::new(image::RgbaImage::new(1, 1));
        let mut model = Model::default();

        for op in ops {
            match op {
                Op::Put(k, c) => {
                    let accepted = cache.put(locator(k), bitmap.clone(), c);
                    prop_assert_eq!(accepted, c <= max_cost);
                    model.put(k, c, max_cost, max_entries);
                }
                Op::Get(k) => {
                    let hit = cache.get(&locator(k)).is_some();
                    prop_assert_eq!(hit, model.get(k));
                }
            }

            prop_assert_eq!(cache.total_cost(), model.total());
            prop_assert_eq!(cache.len(), model.entries.len());
            for k in 0..KEY_SPACE {
                prop_assert_eq!(cache.contains(&locator(k)), model.contains(k));
            }
        }
    }
}
