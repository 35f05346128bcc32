//! Message families of the ShardFS protocol.
//!
//! Naming follows the packet direction: `CLTOCS` client to storage node,
//! `CSTOCL` storage node to client, `CSTOCS` between storage nodes,
//! `CSTOMA`/`MATOCS` storage node and master, `CLTOMA`/`MATOCL` client and
//! master. The numeric values are wire-stable.

use crate::wire_packet;
use sfs_types::{ChunkId, ChunkPartType, ChunkWithVersionAndType, NetworkAddress, Status};

// client <-> storage node
pub const CLTOCS_READ: u32 = 200;
pub const CSTOCL_READ_DATA: u32 = 201;
pub const CSTOCL_READ_STATUS: u32 = 202;
pub const CLTOCS_WRITE_INIT: u32 = 210;
pub const CLTOCS_WRITE_DATA: u32 = 211;
pub const CLTOCS_WRITE_END: u32 = 212;
pub const CSTOCL_WRITE_STATUS: u32 = 213;
pub const CLTOCS_PREFETCH: u32 = 220;

// storage node <-> storage node (replication)
pub const CSTOCS_GET_CHUNK_BLOCKS: u32 = 250;
pub const CSTOCS_GET_CHUNK_BLOCKS_STATUS: u32 = 251;

// storage node -> master
pub const CSTOMA_REGISTER_HOST: u32 = 300;
pub const CSTOMA_REGISTER_CHUNKS: u32 = 301;
pub const CSTOMA_REGISTER_SPACE: u32 = 302;
pub const CSTOMA_CHUNK_NEW: u32 = 310;
pub const CSTOMA_CHUNK_DAMAGED: u32 = 311;
pub const CSTOMA_CHUNK_LOST: u32 = 312;
pub const CSTOMA_CREATE: u32 = 320;
pub const CSTOMA_DELETE: u32 = 321;
pub const CSTOMA_SET_VERSION: u32 = 322;
pub const CSTOMA_DUPLICATE: u32 = 323;
pub const CSTOMA_TRUNCATE: u32 = 324;
pub const CSTOMA_DUPTRUNC: u32 = 325;
pub const CSTOMA_REPLICATE: u32 = 326;

// client <-> master
pub const CLTOMA_READ_CHUNK: u32 = 400;
pub const MATOCL_READ_CHUNK: u32 = 401;
pub const CLTOMA_WRITE_CHUNK: u32 = 402;
pub const MATOCL_WRITE_CHUNK: u32 = 403;
pub const CLTOMA_WRITE_CHUNK_END: u32 = 404;
pub const MATOCL_WRITE_CHUNK_END: u32 = 405;
pub const CLTOMA_TRUNCATE: u32 = 406;
pub const MATOCL_TRUNCATE: u32 = 407;
pub const CLTOMA_TRUNCATE_END: u32 = 408;
pub const MATOCL_TRUNCATE_END: u32 = 409;
pub const CLTOMA_CHUNKS_HEALTH: u32 = 410;
pub const MATOCL_CHUNKS_HEALTH: u32 = 411;

wire_packet!(
    /// Read `size` bytes of one chunk part starting at `offset`. Answered
    /// by a stream of [`ReadData`] messages followed by [`ReadStatus`].
    ReadRequest {
        chunk_id: ChunkId,
        chunk_version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
    }
);

wire_packet!(
    /// One block of read data; the block bytes follow the packet body.
    ReadData {
        chunk_id: ChunkId,
        block: u16,
        offset: u32,
        size: u32,
        crc: u32,
    }
);

wire_packet!(ReadStatus {
    chunk_id: ChunkId,
    status: Status,
});

wire_packet!(
    /// Speculative read; the storage node warms its cache and sends no
    /// reply.
    PrefetchRequest {
        chunk_id: ChunkId,
        chunk_version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
    }
);

wire_packet!(
    /// Opens a write chain. The first storage node strips itself from
    /// `chain` and forwards the packet to the next hop.
    WriteInit {
        chunk_id: ChunkId,
        chunk_version: u32,
        part_type: ChunkPartType,
        chain: Vec<NetworkAddress>,
    }
);

wire_packet!(
    /// One write; the data bytes follow the packet body. Every data packet
    /// is confirmed by a [`WriteStatus`] carrying the same `write_id`.
    WriteData {
        chunk_id: ChunkId,
        write_id: u32,
        block: u16,
        offset: u32,
        size: u32,
        crc: u32,
    }
);

wire_packet!(WriteEnd {
    chunk_id: ChunkId,
});

wire_packet!(WriteStatus {
    chunk_id: ChunkId,
    write_id: u32,
    status: Status,
});

wire_packet!(
    /// Ask a peer how many blocks of a chunk part it holds.
    GetChunkBlocks {
        chunk_id: ChunkId,
        chunk_version: u32,
        part_type: ChunkPartType,
    }
);

wire_packet!(GetChunkBlocksStatus {
    chunk_id: ChunkId,
    chunk_version: u32,
    blocks: u16,
    status: Status,
});

wire_packet!(RegisterHost {
    ip: u32,
    port: u16,
    timeout_ms: u32,
    node_version: u32,
});

wire_packet!(RegisterChunks {
    chunks: Vec<ChunkWithVersionAndType>,
});

wire_packet!(
    /// Disk space report; `td_*` values cover folders marked for removal.
    RegisterSpace {
        used: u64,
        total: u64,
        chunk_count: u32,
        td_used: u64,
        td_total: u64,
        td_chunk_count: u32,
    }
);

wire_packet!(ChunkNew {
    chunks: Vec<ChunkWithVersionAndType>,
});

wire_packet!(ChunkDamaged {
    chunks: Vec<ChunkWithVersionAndType>,
});

wire_packet!(ChunkLost {
    chunks: Vec<ChunkWithVersionAndType>,
});

wire_packet!(
    /// Completion report for a chunk operation ordered by the master
    /// (create / delete / set-version / duplicate / truncate / duptrunc).
    ChunkOpStatus {
        chunk_id: ChunkId,
        status: Status,
    }
);

wire_packet!(ReplicateStatus {
    chunk_id: ChunkId,
    chunk_version: u32,
    status: Status,
});

wire_packet!(
    /// Location of one chunk part as handed out by the master.
    PartLocation {
        address: NetworkAddress,
        part_type: ChunkPartType,
    }
);

wire_packet!(ReadChunkRequest {
    inode: u32,
    chunk_index: u32,
});

wire_packet!(ReadChunkReply {
    packet_version: u8,
    status: Status,
    file_length: u64,
    chunk_id: ChunkId,
    chunk_version: u32,
    locations: Vec<PartLocation>,
});

wire_packet!(ReadChunkError {
    packet_version: u8,
    status: Status,
});

wire_packet!(
    /// Asks the master for the write lock and part locations of a chunk.
    /// `lock_id` 0 requests a fresh lock, a non-zero value resumes a
    /// previously granted one after a retry.
    WriteChunkRequest {
        inode: u32,
        chunk_index: u32,
        lock_id: u32,
    }
);

wire_packet!(WriteChunkReply {
    packet_version: u8,
    status: Status,
    lock_id: u32,
    file_length: u64,
    chunk_id: ChunkId,
    chunk_version: u32,
    locations: Vec<PartLocation>,
});

wire_packet!(
    /// Releases the write lock and carries the authoritative new file
    /// length.
    WriteChunkEnd {
        lock_id: u32,
        inode: u32,
        chunk_id: ChunkId,
        file_length: u64,
    }
);

wire_packet!(WriteChunkEndReply {
    status: Status,
});

wire_packet!(TruncateRequest {
    inode: u32,
    file_length: u64,
});

wire_packet!(TruncateReply {
    status: Status,
    lock_id: u32,
    file_length: u64,
});

wire_packet!(TruncateEnd {
    inode: u32,
    lock_id: u32,
    file_length: u64,
});

wire_packet!(TruncateEndReply {
    status: Status,
});

wire_packet!(ChunksHealthRequest {
    regular_only: bool,
});

wire_packet!(
    /// Health counters per goal id: chunks in each availability state plus
    /// the replication and deletion matrices, all as flat rows of
    /// `(goal_id, values...)`.
    ChunksHealthReply {
        safe: Vec<GoalCounter>,
        endangered: Vec<GoalCounter>,
        lost: Vec<GoalCounter>,
        to_replicate: Vec<GoalPartsCounter>,
        to_delete: Vec<GoalPartsCounter>,
    }
);

wire_packet!(GoalCounter {
    goal_id: u8,
    chunks: u64,
});

wire_packet!(GoalPartsCounter {
    goal_id: u8,
    parts: u8,
    chunks: u64,
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Wire;

    fn roundtrip<T: Wire + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = Vec::new();
        value.serialize(&mut buf);
        let mut slice = &buf[..];
        assert_eq!(T::deserialize(&mut slice).unwrap(), value);
        assert!(slice.is_empty());
    }

    #[test]
    fn read_family() {
        roundtrip(ReadRequest {
            chunk_id: ChunkId(0x42),
            chunk_version: 1,
            part_type: ChunkPartType::standard(),
            offset: 0,
            size: 128 * 1024,
        });
        roundtrip(ReadData {
            chunk_id: ChunkId(0x42),
            block: 3,
            offset: 196608,
            size: 65536,
            crc: 0x1234_5678,
        });
        roundtrip(ReadStatus {
            chunk_id: ChunkId(0x42),
            status: Status::Ok,
        });
    }

    #[test]
    fn write_family() {
        roundtrip(WriteInit {
            chunk_id: ChunkId(9),
            chunk_version: 4,
            part_type: ChunkPartType::xor_parity(2).unwrap(),
            chain: vec![
                NetworkAddress::new(0x0a000001, 9422),
                NetworkAddress::new(0x0a000002, 9422),
            ],
        });
        roundtrip(WriteData {
            chunk_id: ChunkId(9),
            write_id: 17,
            block: 0,
            offset: 100,
            size: 200,
            crc: 0xcafe,
        });
        roundtrip(WriteStatus {
            chunk_id: ChunkId(9),
            write_id: 17,
            status: Status::Locked,
        });
    }

    #[test]
    fn master_families() {
        roundtrip(RegisterSpace {
            used: 1 << 40,
            total: 1 << 42,
            chunk_count: 12345,
            td_used: 0,
            td_total: 0,
            td_chunk_count: 0,
        });
        roundtrip(ChunkDamaged {
            chunks: vec![ChunkWithVersionAndType::new(
                ChunkId(5),
                2,
                ChunkPartType::xor_data(3, 1).unwrap(),
            )],
        });
        roundtrip(WriteChunkReply {
            packet_version: 0,
            status: Status::Ok,
            lock_id: 77,
            file_length: 1 << 26,
            chunk_id: ChunkId(100),
            chunk_version: 3,
            locations: vec![PartLocation {
                address: NetworkAddress::new(0x7f000001, 9422),
                part_type: ChunkPartType::standard(),
            }],
        });
        roundtrip(ChunksHealthReply {
            safe: vec![GoalCounter { goal_id: 1, chunks: 10 }],
            endangered: vec![],
            lost: vec![GoalCounter { goal_id: 2, chunks: 1 }],
            to_replicate: vec![GoalPartsCounter {
                goal_id: 2,
                parts: 1,
                chunks: 1,
            }],
            to_delete: vec![],
        });
    }
}
