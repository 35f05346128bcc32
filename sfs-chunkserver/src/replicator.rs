//! Background replication of chunk parts from peer storage nodes.
//!
//! The target part is created locally at version 0, so no peer can observe
//! a half-built chunk; only after every block has been fetched, verified
//! and committed is the version upgraded to the target version. Any
//! failure along the way deletes the version-0 part and surfaces a
//! recoverable status.

use std::io::Write;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reed_solomon_erasure::galois_8::ReedSolomon;

use sfs_proto::net::{read_packet, write_packet};
use sfs_proto::{
    messages, GetChunkBlocks, GetChunkBlocksStatus, ReadData, ReadRequest, ReadStatus,
};
use sfs_tools::crc::{crc, xor_blocks_crc};
use sfs_types::{
    ChunkId, ChunkPartType, ChunkVersion, NetworkAddress, SliceType, Status, BLOCK_SIZE,
};

use crate::format::ChunkFormat;
use crate::hdd::HddManager;

#[derive(Clone, Copy, Debug)]
pub struct ReplicationSource {
    pub address: NetworkAddress,
    pub part_type: ChunkPartType,
}

#[derive(Clone, Copy, Debug)]
pub struct ReplicatorConfig {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(5),
        }
    }
}

struct SourceConn {
    stream: TcpStream,
    part_type: ChunkPartType,
    blocks: u32,
}

/// How the fetched blocks are combined into the target part.
#[derive(Clone, Copy)]
enum Mode {
    /// One source holding exactly the target part: blocks are copied.
    Copy,
    /// XOR-style reconstruction: the target block is the XOR of all
    /// source blocks, and the CRC is derived from the source CRCs.
    Xor,
    /// General erasure decode over GF(2^8).
    Ec { k: u8, m: u8 },
}

pub struct Replicator {
    hdd: Arc<HddManager>,
    config: ReplicatorConfig,
    replications_done: Mutex<u64>,
}

impl Replicator {
    pub fn new(hdd: Arc<HddManager>, config: ReplicatorConfig) -> Self {
        Self {
            hdd,
            config,
            replications_done: Mutex::new(0),
        }
    }

    /// Number of replications finished since the last call.
    pub fn take_stats(&self) -> u64 {
        std::mem::take(&mut *self.replications_done.lock().unwrap())
    }

    /// Fetch `(chunk_id, target_version, target_part_type)` from the given
    /// sources and commit it locally.
    pub fn replicate(
        &self,
        chunk_id: ChunkId,
        target_version: ChunkVersion,
        target_part_type: ChunkPartType,
        sources: &[ReplicationSource],
    ) -> Result<(), Status> {
        if sources.is_empty() {
            return Err(Status::Einval);
        }
        let mode = classify(target_part_type, sources)?;

        self.hdd
            .create(chunk_id, 0, target_part_type, ChunkFormat::Interleaved)?;
        let result = self.run(chunk_id, target_version, target_part_type, sources, mode);
        if result.is_err() {
            // the target was created at version 0; no intermediate state
            // may stay visible
            let _ = self.hdd.delete(chunk_id, 0, target_part_type);
        }
        result
    }

    fn run(
        &self,
        chunk_id: ChunkId,
        target_version: ChunkVersion,
        target_part_type: ChunkPartType,
        sources: &[ReplicationSource],
        mode: Mode,
    ) -> Result<(), Status> {
        let mut conns = self.connect_sources(chunk_id, sources)?;

        // ask every source for its block count
        for conn in &mut conns {
            write_packet(
                &mut conn.stream,
                messages::CSTOCS_GET_CHUNK_BLOCKS,
                &GetChunkBlocks {
                    chunk_id,
                    chunk_version: target_version,
                    part_type: conn.part_type,
                },
            )
            .map_err(|_| Status::Disconnected)?;
        }
        let mut total_blocks = 0u32;
        for conn in &mut conns {
            let (header, body) = read_packet(&mut conn.stream).map_err(|_| Status::Disconnected)?;
            if header.msg_type != messages::CSTOCS_GET_CHUNK_BLOCKS_STATUS {
                log::warn!("replicator: got wrong answer type {} from peer", header.msg_type);
                return Err(Status::Disconnected);
            }
            let reply: GetChunkBlocksStatus =
                sfs_proto::parse_body(&body).map_err(|_| Status::Disconnected)?;
            if reply.chunk_id != chunk_id {
                return Err(Status::WrongChunkId);
            }
            if reply.chunk_version != target_version {
                return Err(Status::WrongVersion);
            }
            reply.status.into_result()?;
            conn.blocks = reply.blocks as u32;
            total_blocks = total_blocks.max(conn.blocks);
        }

        // one READ request per source covering its whole part
        for conn in &mut conns {
            if conn.blocks == 0 {
                continue;
            }
            write_packet(
                &mut conn.stream,
                messages::CLTOCS_READ,
                &ReadRequest {
                    chunk_id,
                    chunk_version: target_version,
                    part_type: conn.part_type,
                    offset: 0,
                    size: conn.blocks * BLOCK_SIZE,
                },
            )
            .map_err(|_| Status::Disconnected)?;
        }

        for block in 0..total_blocks {
            let mut arrived: Vec<(usize, Vec<u8>, u32)> = Vec::new();
            for (index, conn) in conns.iter_mut().enumerate() {
                if block >= conn.blocks {
                    continue;
                }
                let (data, block_crc) = recv_block(conn, chunk_id, block)?;
                if crc(0, &data) != block_crc {
                    log::warn!("replicator: block {} of {} arrived with a wrong checksum", block, chunk_id);
                    return Err(Status::Crc);
                }
                arrived.push((index, data, block_crc));
            }
            if arrived.is_empty() {
                log::warn!("replicator: no data received for block {}", block);
                return Err(Status::Disconnected);
            }
            let (data, block_crc) = match mode {
                Mode::Copy => {
                    let (_, data, block_crc) = arrived.into_iter().next().unwrap();
                    (data, block_crc)
                }
                Mode::Xor => {
                    let mut combined = vec![0u8; BLOCK_SIZE as usize];
                    let mut crcs = Vec::with_capacity(arrived.len());
                    for (_, data, block_crc) in &arrived {
                        for (dst, src) in combined.iter_mut().zip(data) {
                            *dst ^= src;
                        }
                        crcs.push(*block_crc);
                    }
                    (combined, xor_blocks_crc(&crcs, BLOCK_SIZE))
                }
                Mode::Ec { k, m } => {
                    let data = decode_ec_block(
                        k,
                        m,
                        target_part_type.slice_part(),
                        &conns,
                        &arrived,
                        block,
                    )?;
                    let block_crc = crc(0, &data);
                    (data, block_crc)
                }
            };
            self.hdd.write(
                chunk_id,
                0,
                target_part_type,
                block,
                0,
                BLOCK_SIZE,
                block_crc,
                &data,
            )?;
        }

        // every source finishes its read with a status packet
        for conn in &mut conns {
            if conn.blocks == 0 {
                continue;
            }
            let (header, body) = read_packet(&mut conn.stream).map_err(|_| Status::Disconnected)?;
            if header.msg_type != messages::CSTOCL_READ_STATUS {
                return Err(Status::Disconnected);
            }
            let status: ReadStatus =
                sfs_proto::parse_body(&body).map_err(|_| Status::Disconnected)?;
            if status.chunk_id != chunk_id {
                return Err(Status::WrongChunkId);
            }
            status.status.into_result()?;
        }

        self.hdd
            .set_version(chunk_id, 0, target_version, target_part_type)?;
        *self.replications_done.lock().unwrap() += 1;
        Ok(())
    }

    fn connect_sources(
        &self,
        chunk_id: ChunkId,
        sources: &[ReplicationSource],
    ) -> Result<Vec<SourceConn>, Status> {
        let mut conns = Vec::with_capacity(sources.len());
        for source in sources {
            let addr: std::net::SocketAddr = source.address.into();
            let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout)
                .map_err(|err| {
                    log::warn!(
                        "replicator: connecting to {} for {} failed - {}",
                        source.address,
                        chunk_id,
                        err
                    );
                    Status::CantConnect
                })?;
            stream
                .set_read_timeout(Some(self.config.recv_timeout))
                .and_then(|()| stream.set_write_timeout(Some(self.config.send_timeout)))
                .and_then(|()| stream.set_nodelay(true))
                .map_err(|_| Status::CantConnect)?;
            conns.push(SourceConn {
                stream,
                part_type: source.part_type,
                blocks: 0,
            });
        }
        Ok(conns)
    }
}

/// Work out how source blocks combine into the target part, refusing
/// source sets the replicator cannot use.
fn classify(target: ChunkPartType, sources: &[ReplicationSource]) -> Result<Mode, Status> {
    if sources.len() == 1 && sources[0].part_type == target {
        return Ok(Mode::Copy);
    }
    match target.slice_type() {
        SliceType::Ec(k, m) => {
            let same_slice = sources
                .iter()
                .all(|s| s.part_type.slice_type() == target.slice_type());
            if !same_slice || sources.len() < k as usize {
                return Err(Status::Einval);
            }
            Ok(Mode::Ec { k, m })
        }
        SliceType::Xor(level) => {
            // reconstruction from the remaining parts of the same level
            let same_level = sources
                .iter()
                .all(|s| s.part_type.slice_type() == target.slice_type());
            if !same_level || sources.len() != level as usize {
                return Err(Status::Einval);
            }
            Ok(Mode::Xor)
        }
        SliceType::Standard => Err(Status::Einval),
    }
}

fn recv_block(conn: &mut SourceConn, chunk_id: ChunkId, block: u32) -> Result<(Vec<u8>, u32), Status> {
    let (header, body) = read_packet(&mut conn.stream).map_err(|_| Status::Disconnected)?;
    match header.msg_type {
        messages::CSTOCL_READ_DATA => {
            let (data_msg, payload) =
                sfs_proto::parse_body_with_payload::<ReadData>(&body, BLOCK_SIZE as usize)
                    .map_err(|_| Status::Disconnected)?;
            if data_msg.chunk_id != chunk_id {
                return Err(Status::WrongChunkId);
            }
            if data_msg.block as u32 != block {
                log::warn!(
                    "replicator: got block {} while waiting for {}",
                    data_msg.block,
                    block
                );
                return Err(Status::Disconnected);
            }
            if data_msg.offset != block * BLOCK_SIZE {
                return Err(Status::WrongOffset);
            }
            if data_msg.size != BLOCK_SIZE {
                return Err(Status::WrongSize);
            }
            Ok((payload.to_vec(), data_msg.crc))
        }
        messages::CSTOCL_READ_STATUS => {
            // a status before the last block is always an error report
            let status: ReadStatus =
                sfs_proto::parse_body(&body).map_err(|_| Status::Disconnected)?;
            if status.status.is_ok() {
                log::warn!("replicator: got unexpected ok status mid-stream");
                return Err(Status::Disconnected);
            }
            Err(status.status)
        }
        other => {
            log::warn!("replicator: got wrong answer type {} from peer", other);
            Err(Status::Disconnected)
        }
    }
}

/// Reconstruct the target shard of one block stripe from the shards that
/// arrived. Sources whose part is shorter than the stripe contribute zero
/// blocks.
fn decode_ec_block(
    k: u8,
    m: u8,
    target_shard: usize,
    conns: &[SourceConn],
    arrived: &[(usize, Vec<u8>, u32)],
    block: u32,
) -> Result<Vec<u8>, Status> {
    let rs = ReedSolomon::new(k as usize, m as usize).map_err(|_| Status::Einval)?;
    let mut shards: Vec<Option<Vec<u8>>> = vec![None; k as usize + m as usize];
    for (conn_index, data, _) in arrived {
        let shard_index = conns[*conn_index].part_type.slice_part();
        shards[shard_index] = Some(data.clone());
    }
    for conn in conns {
        // short parts hold zeros at this stripe index
        if block >= conn.blocks {
            shards[conn.part_type.slice_part()] = Some(vec![0u8; BLOCK_SIZE as usize]);
        }
    }
    rs.reconstruct(&mut shards).map_err(|err| {
        log::warn!("replicator: erasure decode failed - {:?}", err);
        Status::Crc
    })?;
    shards[target_shard].take().ok_or(Status::Crc)
}

/// Serve one read request block by block, ending with a status packet.
pub fn serve_read(hdd: &HddManager, stream: &mut TcpStream, request: &ReadRequest) -> Result<(), Status> {
    let result = stream_blocks(hdd, stream, request);
    let status = match &result {
        Ok(()) => Status::Ok,
        Err(status) => *status,
    };
    let _ = write_packet(
        stream,
        messages::CSTOCL_READ_STATUS,
        &ReadStatus {
            chunk_id: request.chunk_id,
            status,
        },
    );
    result
}

fn stream_blocks(hdd: &HddManager, stream: &mut TcpStream, request: &ReadRequest) -> Result<(), Status> {
    if request.offset % BLOCK_SIZE != 0 || request.size % BLOCK_SIZE != 0 {
        return Err(Status::WrongOffset);
    }
    let first_block = request.offset / BLOCK_SIZE;
    let block_count = request.size / BLOCK_SIZE;
    for block in first_block..first_block + block_count {
        let mut output = sfs_tools::output_buffer::OutputBuffer::heap(BLOCK_SIZE as usize + 8);
        hdd.read(
            request.chunk_id,
            request.chunk_version,
            request.part_type,
            block * BLOCK_SIZE,
            BLOCK_SIZE,
            &mut output,
        )?;
        // the buffer now holds crc || data
        let served = output.as_slice().ok_or(Status::Io)?;
        let block_crc = u32::from_le_bytes(served[..4].try_into().unwrap());
        let packet = sfs_proto::build_packet_with_payload(
            messages::CSTOCL_READ_DATA,
            &ReadData {
                chunk_id: request.chunk_id,
                block: block as u16,
                offset: block * BLOCK_SIZE,
                size: BLOCK_SIZE,
                crc: block_crc,
            },
            &served[4..],
        );
        stream.write_all(&packet).map_err(|_| Status::Disconnected)?;
    }
    Ok(())
}
