//! In-memory chunk part registry of a storage node.
//!
//! The registry is sharded by chunk id hash; every entry is behind its own
//! mutex and operations hold a shard lock only for the lookup itself.
//! Handles returned from [`ChunkRegistry::get`] are ref-counted clones, so
//! a scanner replacing the map cannot pull a chunk out from under an I/O
//! worker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use sfs_types::{ChunkId, ChunkPartType, ChunkVersion};

use crate::format::ChunkFormat;

/// Lifecycle state of a chunk part on this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    Available,
    /// A job is mutating the part; readers are refused.
    Locked,
    /// Deletion was requested while the part was still open; the last
    /// close removes it.
    ToBeDeleted,
}

#[derive(Debug)]
pub struct ChunkEntry {
    pub id: ChunkId,
    pub version: ChunkVersion,
    pub part_type: ChunkPartType,
    pub state: ChunkState,
    pub format: ChunkFormat,
    /// Blocks currently stored in the part file.
    pub blocks: u32,
    /// Index of the owning folder in the manager's folder table.
    pub folder: usize,
    /// Open handles; deletion is deferred while non-zero.
    pub refcount: u32,
    /// Set once the on-disk signature was checked against this entry.
    pub signature_verified: bool,
}

impl ChunkEntry {
    pub fn file_path(&self, folder_root: &std::path::Path) -> PathBuf {
        crate::format::part_file_path(folder_root, self.id, self.version, self.part_type)
    }
}

pub type ChunkHandle = Arc<Mutex<ChunkEntry>>;

/// Key of a chunk part: a node may hold several parts of one chunk, but
/// only one file per part type.
pub type ChunkKey = (ChunkId, ChunkPartType);

const SHARD_COUNT: usize = 64;

pub struct ChunkRegistry {
    shards: Vec<Mutex<HashMap<ChunkKey, ChunkHandle>>>,
}

impl Default for ChunkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkRegistry {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard(&self, id: ChunkId) -> MutexGuard<'_, HashMap<ChunkKey, ChunkHandle>> {
        self.shards[(id.0 as usize) % SHARD_COUNT].lock().unwrap()
    }

    pub fn get(&self, id: ChunkId, part_type: ChunkPartType) -> Option<ChunkHandle> {
        self.shard(id).get(&(id, part_type)).cloned()
    }

    /// Register a new chunk part. Fails with the existing handle if the
    /// part is already present.
    pub fn insert(&self, entry: ChunkEntry) -> Result<ChunkHandle, ChunkHandle> {
        let key = (entry.id, entry.part_type);
        let mut shard = self.shard(entry.id);
        if let Some(existing) = shard.get(&key) {
            return Err(existing.clone());
        }
        let handle = Arc::new(Mutex::new(entry));
        shard.insert(key, handle.clone());
        Ok(handle)
    }

    pub fn remove(&self, id: ChunkId, part_type: ChunkPartType) -> Option<ChunkHandle> {
        self.shard(id).remove(&(id, part_type))
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered part, for master registration.
    pub fn snapshot(&self) -> Vec<sfs_types::ChunkWithVersionAndType> {
        let mut parts = Vec::with_capacity(self.len());
        for shard in &self.shards {
            for handle in shard.lock().unwrap().values() {
                let chunk = handle.lock().unwrap();
                parts.push(sfs_types::ChunkWithVersionAndType::new(
                    chunk.id,
                    chunk.version,
                    chunk.part_type,
                ));
            }
        }
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, part_type: ChunkPartType) -> ChunkEntry {
        ChunkEntry {
            id: ChunkId(id),
            version: 1,
            part_type,
            state: ChunkState::Available,
            format: ChunkFormat::Interleaved,
            blocks: 0,
            folder: 0,
            refcount: 0,
            signature_verified: false,
        }
    }

    #[test]
    fn insert_get_remove() {
        let registry = ChunkRegistry::new();
        let std_part = ChunkPartType::standard();
        registry.insert(entry(1, std_part)).unwrap();
        assert!(registry.get(ChunkId(1), std_part).is_some());
        assert!(registry.get(ChunkId(2), std_part).is_none());
        assert_eq!(registry.len(), 1);

        // duplicate registration is refused
        assert!(registry.insert(entry(1, std_part)).is_err());

        // a different part of the same chunk is a separate entry
        let parity = ChunkPartType::xor_parity(2).unwrap();
        registry.insert(entry(1, parity)).unwrap();
        assert_eq!(registry.len(), 2);

        registry.remove(ChunkId(1), std_part).unwrap();
        assert!(registry.get(ChunkId(1), std_part).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_lists_everything() {
        let registry = ChunkRegistry::new();
        for id in 0..100u64 {
            registry.insert(entry(id, ChunkPartType::standard())).unwrap();
        }
        let mut snapshot = registry.snapshot();
        snapshot.sort();
        assert_eq!(snapshot.len(), 100);
        assert_eq!(snapshot[0].id, ChunkId(0));
        assert_eq!(snapshot[99].id, ChunkId(99));
    }
}
