//! Cache of merged goals.
//!
//! A chunk referenced by several files carries several goal ids; merging
//! their goals is not free, and the same small set of id combinations
//! shows up over and over. The cache maps a combination to its merged
//! goal, keyed by a fingerprint and verified against the stored
//! combination to rule out collisions.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use sfs_tools::lru_cache::LruCache;
use sfs_types::goal::GoalId;
use sfs_types::Goal;

/// Sorted `(goal id, reference count)` pairs describing which goals apply
/// to one chunk.
pub type GoalCounters = Vec<(GoalId, u32)>;

fn fingerprint(counters: &GoalCounters) -> u64 {
    let mut hasher = DefaultHasher::new();
    counters.hash(&mut hasher);
    hasher.finish()
}

pub struct GoalCache {
    entries: LruCache<u64, (GoalCounters, Goal)>,
}

impl GoalCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, counters: &GoalCounters) -> Option<Goal> {
        let (stored, goal) = self.entries.get_mut(fingerprint(counters))?;
        if stored != counters {
            return None;
        }
        Some(goal.clone())
    }

    pub fn insert(&mut self, counters: GoalCounters, goal: Goal) {
        self.entries.insert(fingerprint(&counters), (counters, goal));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(pairs: &[(u8, u32)]) -> GoalCounters {
        pairs.iter().map(|(id, count)| (GoalId(*id), *count)).collect()
    }

    #[test]
    fn hit_and_miss() {
        let mut cache = GoalCache::new(4);
        assert!(cache.get(&counters(&[(1, 2)])).is_none());
        cache.insert(counters(&[(1, 2)]), Goal::new("merged"));
        let hit = cache.get(&counters(&[(1, 2)])).unwrap();
        assert_eq!(hit.name(), "merged");
        assert!(cache.get(&counters(&[(1, 3)])).is_none());
    }

    #[test]
    fn capacity_is_bounded() {
        let mut cache = GoalCache::new(2);
        cache.insert(counters(&[(1, 1)]), Goal::new("a"));
        cache.insert(counters(&[(2, 1)]), Goal::new("b"));
        cache.insert(counters(&[(3, 1)]), Goal::new("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&counters(&[(1, 1)])).is_none());
        assert!(cache.get(&counters(&[(3, 1)])).is_some());
    }
}
