//! Shared primitives used by every ShardFS component: CRC-32 with
//! combine-over-zeros, a counting semaphore, the bounded job queue, a
//! generic LRU cache, the output buffer pair and small parser helpers.

pub mod crc;
pub mod lru_cache;
pub mod nom;
pub mod output_buffer;
pub mod queue;
pub mod sem;
pub mod time;
