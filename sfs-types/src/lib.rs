//! Value types shared by every ShardFS layer.
//!
//! A *chunk* is the fixed-size unit of file data, identified by a 64 bit id
//! and a monotonically increasing 32 bit version. Chunks are stored as
//! *parts*: either full copies (`Standard`), XOR slices (`Xor2`..`Xor9`,
//! N data parts plus one parity part) or Reed-Solomon slices (`ec(k,m)`,
//! any k of k+m parts reconstruct the chunk). The desired redundancy and
//! placement of a chunk is described by a [`Goal`](goal::Goal).

pub mod availability;
pub mod chunk;
pub mod goal;
pub mod label;
pub mod part_type;
pub mod status;

pub use availability::{ChunksAvailabilityState, ChunksReplicationState};
pub use chunk::{ChunkId, ChunkVersion, ChunkWithVersion, ChunkWithVersionAndType, NetworkAddress};
pub use goal::{Goal, GoalId, Labels, Slice};
pub use label::MediaLabel;
pub use part_type::{ChunkPartType, SliceType, MAX_XOR_LEVEL, MIN_XOR_LEVEL};
pub use status::Status;

/// Size of a single CRC-guarded block inside a chunk.
pub const BLOCK_SIZE: u32 = 64 * 1024;

/// Number of blocks in a full chunk.
pub const BLOCKS_PER_CHUNK: u32 = 1024;

/// Logical size of a full chunk.
pub const CHUNK_SIZE: u64 = BLOCK_SIZE as u64 * BLOCKS_PER_CHUNK as u64;

/// Size of the per-block CRC as stored on disk and on the wire.
pub const CRC_SIZE: u32 = 4;
