//! Interval cache in front of the chunk reader.
//!
//! Entries are keyed by `(inode, chunk index)` and hold one contiguous
//! block range; they expire after a configured TTL so a re-opened file
//! sees fresh data reasonably soon.

use std::time::{Duration, Instant};

use sfs_tools::lru_cache::LruCache;
use sfs_types::BLOCK_SIZE;

struct CacheEntry {
    first_block: u32,
    data: Vec<u8>,
    stored_at: Instant,
}

pub struct ReadCache {
    entries: LruCache<(u32, u32), CacheEntry>,
    ttl: Duration,
}

impl ReadCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Cached bytes for `[first_block, first_block + block_count)` if a
    /// fresh entry covers the whole range.
    pub fn query(
        &mut self,
        inode: u32,
        chunk_index: u32,
        first_block: u32,
        block_count: u32,
    ) -> Option<Vec<u8>> {
        let ttl = self.ttl;
        let entry = self.entries.get_mut((inode, chunk_index))?;
        if entry.stored_at.elapsed() > ttl {
            self.entries.remove((inode, chunk_index));
            return None;
        }
        let entry = self.entries.get_mut((inode, chunk_index))?;
        let cached_blocks = (entry.data.len() / BLOCK_SIZE as usize) as u32;
        if first_block < entry.first_block
            || first_block + block_count > entry.first_block + cached_blocks
        {
            return None;
        }
        let from = ((first_block - entry.first_block) * BLOCK_SIZE) as usize;
        let to = from + (block_count * BLOCK_SIZE) as usize;
        Some(entry.data[from..to].to_vec())
    }

    pub fn store(&mut self, inode: u32, chunk_index: u32, first_block: u32, data: Vec<u8>) {
        self.entries.insert(
            (inode, chunk_index),
            CacheEntry {
                first_block,
                data,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop everything cached for an inode, e.g. after a write.
    pub fn invalidate_inode(&mut self, inode: u32) {
        self.entries.retire(|&(entry_inode, _), _| entry_inode == inode);
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

    fn blocks(count: u32, byte: u8) -> Vec<u8> {
        vec![byte; (count * BLOCK_SIZE) as usize]
    }

    #[test]
    fn sub_range_hits() {
        let mut cache = ReadCache::new(8, Duration::from_secs(60));
        cache.store(1, 0, 2, blocks(4, 0x33));
        assert!(cache.query(1, 0, 2, 4).is_some());
        let hit = cache.query(1, 0, 3, 2).unwrap();
        assert_eq!(hit.len(), 2 * BLOCK_SIZE as usize);
        assert!(hit.iter().all(|&b| b == 0x33));
        // outside the cached range
        assert!(cache.query(1, 0, 1, 2).is_none());
        assert!(cache.query(1, 0, 5, 2).is_none());
        // different chunk
        assert!(cache.query(1, 1, 2, 1).is_none());
    }

    #[test]
    fn expired_entries_miss() {
        let mut cache = ReadCache::new(8, Duration::from_millis(0));
        cache.store(1, 0, 0, blocks(1, 0x44));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.query(1, 0, 0, 1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidation_by_inode() {
        let mut cache = ReadCache::new(8, Duration::from_secs(60));
        cache.store(1, 0, 0, blocks(1, 1));
        cache.store(1, 1, 0, blocks(1, 2));
        cache.store(2, 0, 0, blocks(1, 3));
        cache.invalidate_inode(1);
        assert!(cache.query(1, 0, 0, 1).is_none());
        assert!(cache.query(1, 1, 0, 1).is_none());
        assert!(cache.query(2, 0, 0, 1).is_some());
    }
}
