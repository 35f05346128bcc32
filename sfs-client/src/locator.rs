//! Master-side collaborators of the client chunk paths.
//!
//! The reader and writer never talk to the master directly; they go
//! through these traits. The real implementation speaks the client-master
//! message families over a connection owned by the mount agent; tests
//! provide in-memory stands-ins.

use anyhow::Error;

use sfs_types::{ChunkId, ChunkPartType, ChunkVersion, NetworkAddress};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartWithAddress {
    pub address: NetworkAddress,
    pub part_type: ChunkPartType,
}

/// Everything the master tells a reader about one chunk.
#[derive(Clone, Debug)]
pub struct ChunkLocation {
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    pub file_length: u64,
    pub parts: Vec<PartWithAddress>,
}

/// Lock and locations granted for one chunk write.
#[derive(Clone, Debug)]
pub struct WriteLock {
    pub lock_id: u32,
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    pub file_length: u64,
    pub parts: Vec<PartWithAddress>,
}

pub trait ChunkLocator: Send + Sync {
    /// Locations of the parts of `(inode, chunk_index)` for reading.
    fn locate_for_read(&self, inode: u32, chunk_index: u32) -> Result<ChunkLocation, Error>;

    /// Acquire (or, with a non-zero `lock_id`, re-acquire after a retry)
    /// the write lock of a chunk.
    fn acquire_write(&self, inode: u32, chunk_index: u32, lock_id: u32) -> Result<WriteLock, Error>;

    /// Release the write lock, reporting the authoritative file length.
    fn write_end(
        &self,
        lock_id: u32,
        inode: u32,
        chunk_id: ChunkId,
        file_length: u64,
    ) -> Result<(), Error>;
}
