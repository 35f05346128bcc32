//! Storage node core: owns disks and chunk part files, serves concurrent
//! chunk operations through a background job pool, and replicates chunk
//! parts from peer storage nodes.
//!
//! The durable unit here is a *chunk part file*: one file per
//! `(chunk id, version, part type)`, stored under a 256-way fan-out
//! directory on one of the node's disks. Every 64 KiB block inside a part
//! has its own CRC; the CRCs live either in the legacy file header or in a
//! trailing index, see [`format`].

pub mod chunk;
pub mod folder;
pub mod format;
pub mod hdd;
pub mod job_pool;
pub mod replicator;
pub mod serve;

pub use chunk::{ChunkEntry, ChunkRegistry};
pub use hdd::HddManager;
pub use job_pool::{JobCompletion, JobOp, JobPool};
pub use replicator::{ReplicationSource, Replicator, ReplicatorConfig};
pub use serve::serve_connection;
