//! Readahead adviser.
//!
//! Tracks the recent access pattern per inode and grows the effective
//! request size toward a maximum window while the accesses stay
//! sequential. A seek resets the window to the requested size.

use sfs_tools::lru_cache::LruCache;

#[derive(Clone, Copy, Debug)]
struct InodeState {
    next_expected_block: u64,
    window_blocks: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct ReadaheadConfig {
    /// Window granted to the first or a non-sequential access.
    pub initial_window_blocks: u32,
    pub max_window_blocks: u32,
}

impl Default for ReadaheadConfig {
    fn default() -> Self {
        Self {
            initial_window_blocks: 1,
            max_window_blocks: 16,
        }
    }
}

pub struct ReadaheadAdviser {
    config: ReadaheadConfig,
    inodes: LruCache<u32, InodeState>,
}

impl ReadaheadAdviser {
    pub fn new(capacity: usize, config: ReadaheadConfig) -> Self {
        Self {
            config,
            inodes: LruCache::new(capacity),
        }
    }

    /// Note an access and return the advised block count, always at least
    /// the requested one.
    pub fn advise(&mut self, inode: u32, absolute_block: u64, block_count: u32) -> u32 {
        let state = match self.inodes.get_mut(inode) {
            Some(state) if state.next_expected_block == absolute_block => {
                state.window_blocks = (state.window_blocks * 2).min(self.config.max_window_blocks);
                state.next_expected_block = absolute_block + block_count as u64;
                *state
            }
            _ => {
                let state = InodeState {
                    next_expected_block: absolute_block + block_count as u64,
                    window_blocks: self.config.initial_window_blocks,
                };
                self.inodes.insert(inode, state);
                state
            }
        };
        block_count.max(state.window_blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_reads_grow_the_window() {
        let mut adviser = ReadaheadAdviser::new(
            8,
            ReadaheadConfig {
                initial_window_blocks: 1,
                max_window_blocks: 8,
            },
        );
        assert_eq!(adviser.advise(1, 0, 1), 1);
        assert_eq!(adviser.advise(1, 1, 1), 2);
        assert_eq!(adviser.advise(1, 2, 1), 4);
        assert_eq!(adviser.advise(1, 3, 1), 8);
        // capped at the maximum
        assert_eq!(adviser.advise(1, 4, 1), 8);
    }

    #[test]
    fn seek_resets_the_window() {
        let mut adviser = ReadaheadAdviser::new(8, ReadaheadConfig::default());
        adviser.advise(1, 0, 1);
        adviser.advise(1, 1, 1);
        // a jump far away starts over
        assert_eq!(adviser.advise(1, 100, 1), 1);
    }

    #[test]
    fn the_request_is_never_shrunk() {
        let mut adviser = ReadaheadAdviser::new(8, ReadaheadConfig::default());
        assert_eq!(adviser.advise(1, 0, 6), 6);
    }

    #[test]
    fn inodes_are_independent() {
        let mut adviser = ReadaheadAdviser::new(8, ReadaheadConfig::default());
        adviser.advise(1, 0, 1);
        adviser.advise(1, 1, 1);
        assert_eq!(adviser.advise(2, 0, 1), 1);
    }
}
