//! Wave execution of a read plan.
//!
//! Basic operations are started first, each on its own non-blocking
//! socket. The executor then polls the sockets under three deadlines: a
//! connect timeout per source, a wave timeout after which the additional
//! (redundant) operations are started, and a total timeout for the whole
//! attempt. Reading stops as soon as the plan says the finished subset is
//! sufficient; outstanding sockets are simply closed.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

use sfs_proto::{messages, PacketHeader, ReadRequest, HEADER_SIZE};
use sfs_tools::crc::{crc, recompute_crc_if_block_empty};
use sfs_tools::time::Deadline;
use sfs_types::{ChunkId, ChunkPartType, ChunkVersion, NetworkAddress, Status, BLOCK_SIZE};

use crate::error::ChunkError;
use crate::read_plan::{ReadOperation, ReadPlan};

#[derive(Clone, Copy, Debug)]
pub struct ExecutorConfig {
    pub connect_timeout: Duration,
    pub wave_timeout: Duration,
    pub total_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            wave_timeout: Duration::from_millis(500),
            total_timeout: Duration::from_secs(10),
        }
    }
}

enum RecvState {
    Header { bytes: [u8; HEADER_SIZE], got: usize },
    Body { header: PacketHeader, bytes: Vec<u8>, got: usize },
}

impl RecvState {
    fn new() -> Self {
        RecvState::Header {
            bytes: [0; HEADER_SIZE],
            got: 0,
        }
    }
}

struct Operation {
    part_type: ChunkPartType,
    op: ReadOperation,
    stream: Option<TcpStream>,
    state: RecvState,
    blocks_done: usize,
    finished: bool,
    failed: bool,
    peer_status: Option<Status>,
}

impl Operation {
    fn expected_blocks(&self) -> usize {
        self.op.read_data_offsets.len()
    }

    fn is_active(&self) -> bool {
        self.stream.is_some() && !self.finished && !self.failed
    }

    fn fail(&mut self, why: &str) {
        log::debug!("read from {} failed: {}", self.part_type, why);
        self.failed = true;
        self.stream = None;
    }
}

/// Result of one plan execution: the filled plan buffer plus the sources
/// that did not finish (feeds the extended post-process).
pub struct ExecutionResult {
    pub buffer: Vec<u8>,
    pub unfinished: BTreeSet<ChunkPartType>,
}

pub struct WavesExecutor<'a> {
    chunk_id: ChunkId,
    version: ChunkVersion,
    plan: &'a ReadPlan,
    locations: &'a dyn Fn(ChunkPartType) -> Option<NetworkAddress>,
    config: ExecutorConfig,
}

impl<'a> WavesExecutor<'a> {
    pub fn new(
        chunk_id: ChunkId,
        version: ChunkVersion,
        plan: &'a ReadPlan,
        locations: &'a dyn Fn(ChunkPartType) -> Option<NetworkAddress>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            chunk_id,
            version,
            plan,
            locations,
            config,
        }
    }

    fn start_operation(&self, part_type: ChunkPartType, op: &ReadOperation) -> Operation {
        let mut operation = Operation {
            part_type,
            op: op.clone(),
            stream: None,
            state: RecvState::new(),
            blocks_done: 0,
            finished: false,
            failed: false,
            peer_status: None,
        };
        let Some(address) = (self.locations)(part_type) else {
            operation.fail("no location");
            return operation;
        };
        let addr: std::net::SocketAddr = address.into();
        let stream = match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
            Ok(stream) => stream,
            Err(err) => {
                operation.fail(&format!("connect to {}: {}", address, err));
                return operation;
            }
        };
        let request = sfs_proto::build_packet(
            messages::CLTOCS_READ,
            &ReadRequest {
                chunk_id: self.chunk_id,
                chunk_version: self.version,
                part_type,
                offset: op.request_offset,
                size: op.request_size,
            },
        );
        let started = stream
            .set_nodelay(true)
            .and_then(|()| (&stream).write_all(&request))
            .and_then(|()| stream.set_nonblocking(true));
        match started {
            Ok(()) => operation.stream = Some(stream),
            Err(err) => operation.fail(&format!("sending request: {}", err)),
        }
        operation
    }

    /// Run the plan to completion (or failure) and hand back the buffer.
    pub fn execute(&self) -> Result<ExecutionResult, ChunkError> {
        let mut buffer = vec![0u8; self.plan.required_buffer_size as usize];
        let total_deadline = Deadline::in_duration(self.config.total_timeout);
        let mut wave_deadline = Deadline::in_duration(self.config.wave_timeout);

        let mut operations: Vec<Operation> = self
            .plan
            .basic_read_operations
            .iter()
            .map(|(part_type, op)| self.start_operation(*part_type, op))
            .collect();
        let mut additional_started = self.plan.additional_read_operations.is_empty();

        loop {
            let unfinished = self.unfinished_set(&operations, additional_started);
            if self.plan.is_reading_finished(&unfinished) {
                return Ok(ExecutionResult { buffer, unfinished });
            }
            // a peer reporting the chunk gone ends the whole attempt; the
            // master's view was stale and no replica will do better
            if let Some(operation) = operations
                .iter()
                .find(|op| op.peer_status == Some(Status::NoSuchChunk))
            {
                return Err(ChunkError::new(
                    Status::NoSuchChunk,
                    format!(
                        "chunk {} is gone from {} holder",
                        self.chunk_id, operation.part_type
                    ),
                ));
            }
            let someone_failed = operations.iter().any(|op| op.failed);
            if !additional_started && (someone_failed || wave_deadline.expired()) {
                for (part_type, op) in &self.plan.additional_read_operations {
                    operations.push(self.start_operation(*part_type, op));
                }
                additional_started = true;
                wave_deadline = Deadline::in_duration(self.config.wave_timeout);
                continue;
            }
            if operations.iter().all(|op| !op.is_active()) {
                // nothing in flight and the plan is not satisfied
                return Err(ChunkError::new(
                    Status::Io,
                    format!("chunk {}: all read sources failed", self.chunk_id),
                ));
            }
            if total_deadline.expired() {
                return Err(ChunkError::new(
                    Status::Timeout,
                    format!("chunk {}: read timed out", self.chunk_id),
                ));
            }

            let mut fds: Vec<PollFd> = Vec::new();
            let mut fd_ops: Vec<usize> = Vec::new();
            for (index, operation) in operations.iter().enumerate() {
                if let Some(stream) = operation.stream.as_ref() {
                    if operation.is_active() {
                        fds.push(PollFd::new(stream.as_raw_fd(), PollFlags::POLLIN));
                        fd_ops.push(index);
                    }
                }
            }
            let timeout_ms = total_deadline
                .remaining_ms()
                .min(if additional_started { i32::MAX } else { wave_deadline.remaining_ms() })
                .max(1);
            match poll(&mut fds, timeout_ms) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    return Err(ChunkError::new(
                        Status::Io,
                        format!("poll failed: {}", err),
                    ));
                }
            }
            let readable: Vec<usize> = fds
                .iter()
                .zip(&fd_ops)
                .filter(|(fd, _)| {
                    fd.revents()
                        .map(|ev| ev.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
                        .unwrap_or(false)
                })
                .map(|(_, index)| *index)
                .collect();
            for index in readable {
                self.drain_socket(&mut operations[index], &mut buffer);
            }
        }
    }

    fn unfinished_set(
        &self,
        operations: &[Operation],
        additional_started: bool,
    ) -> BTreeSet<ChunkPartType> {
        let mut unfinished: BTreeSet<ChunkPartType> = operations
            .iter()
            .filter(|op| !op.finished)
            .map(|op| op.part_type)
            .collect();
        if !additional_started {
            unfinished.extend(self.plan.additional_read_operations.keys().copied());
        }
        unfinished
    }

    /// Pull whatever is available from one socket and feed the message
    /// state machine.
    fn drain_socket(&self, operation: &mut Operation, buffer: &mut [u8]) {
        enum Step {
            More,
            Blocked,
            Fail(String),
            HeaderDone(PacketHeader),
            MessageDone(PacketHeader, Vec<u8>),
        }
        loop {
            if operation.stream.is_none() || operation.finished || operation.failed {
                return;
            }
            let step = {
                let stream = operation.stream.as_mut().unwrap();
                match &mut operation.state {
                    RecvState::Header { bytes, got } => match stream.read(&mut bytes[*got..]) {
                        Ok(0) => Step::Fail("connection closed".to_string()),
                        Ok(n) => {
                            *got += n;
                            if *got == HEADER_SIZE {
                                match PacketHeader::parse(bytes) {
                                    Ok(header) => Step::HeaderDone(header),
                                    Err(err) => Step::Fail(format!("bad header: {}", err)),
                                }
                            } else {
                                Step::More
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Step::Blocked,
                        Err(err) => Step::Fail(format!("read error: {}", err)),
                    },
                    RecvState::Body { header, bytes, got } => {
                        if bytes.is_empty() {
                            Step::MessageDone(*header, Vec::new())
                        } else {
                            match stream.read(&mut bytes[*got..]) {
                                Ok(0) => Step::Fail("connection closed mid-packet".to_string()),
                                Ok(n) => {
                                    *got += n;
                                    if *got == bytes.len() {
                                        Step::MessageDone(*header, std::mem::take(bytes))
                                    } else {
                                        Step::More
                                    }
                                }
                                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                                    Step::Blocked
                                }
                                Err(err) => Step::Fail(format!("read error: {}", err)),
                            }
                        }
                    }
                }
            };
            match step {
                Step::More => {}
                Step::Blocked => return,
                Step::Fail(why) => {
                    operation.fail(&why);
                    return;
                }
                Step::HeaderDone(header) => {
                    operation.state = RecvState::Body {
                        header,
                        bytes: vec![0; header.length as usize],
                        got: 0,
                    };
                }
                Step::MessageDone(header, body) => {
                    operation.state = RecvState::new();
                    self.handle_message(operation, header, body, buffer);
                }
            }
        }
    }

    fn handle_message(
        &self,
        operation: &mut Operation,
        header: PacketHeader,
        body: Vec<u8>,
        buffer: &mut [u8],
    ) {
        match header.msg_type {
            messages::CSTOCL_READ_DATA => {
                let parsed = sfs_proto::parse_body_with_payload::<sfs_proto::ReadData>(
                    &body,
                    BLOCK_SIZE as usize,
                );
                let (message, payload) = match parsed {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        operation.fail(&format!("malformed READ_DATA: {}", err));
                        return;
                    }
                };
                if message.chunk_id != self.chunk_id {
                    operation.fail("READ_DATA for a different chunk");
                    return;
                }
                if operation.blocks_done >= operation.expected_blocks() {
                    operation.fail("more blocks than requested");
                    return;
                }
                let mut block_crc = message.crc;
                recompute_crc_if_block_empty(payload, &mut block_crc);
                if crc(0, payload) != block_crc {
                    operation.fail("block CRC mismatch");
                    return;
                }
                let offset = operation.op.read_data_offsets[operation.blocks_done] as usize;
                buffer[offset..offset + BLOCK_SIZE as usize].copy_from_slice(payload);
                operation.blocks_done += 1;
            }
            messages::CSTOCL_READ_STATUS => {
                let message: sfs_proto::ReadStatus = match sfs_proto::parse_body(&body) {
                    Ok(message) => message,
                    Err(err) => {
                        operation.fail(&format!("malformed READ_STATUS: {}", err));
                        return;
                    }
                };
                if message.chunk_id != self.chunk_id {
                    operation.fail("READ_STATUS for a different chunk");
                    return;
                }
                if !message.status.is_ok() {
                    operation.peer_status = Some(message.status);
                    operation.fail(&format!("peer status {}", message.status));
                    return;
                }
                if operation.blocks_done == operation.expected_blocks() {
                    operation.finished = true;
                    operation.stream = None;
                } else {
                    operation.fail("status before all blocks arrived");
                }
            }
            other => {
                operation.fail(&format!("unexpected message type {}", other));
            }
        }
    }
}

/// Apply the plan's post-process operations to the buffer:
/// `buffer[dst] <- buffer[src] ^ buffer[x] ^ ...` over whole blocks.
pub fn apply_post_process(buffer: &mut [u8], operations: &[crate::read_plan::PostProcessOperation]) {
    let block = BLOCK_SIZE as usize;
    for op in operations {
        let dst = op.destination_offset as usize;
        let src = op.source_offset as usize;
        if dst != src {
            buffer.copy_within(src..src + block, dst);
        }
        for &xor_offset in &op.xor_offsets {
            let xor_offset = xor_offset as usize;
            // split to get two non-overlapping views
            let (a, b) = if xor_offset > dst {
                let (head, tail) = buffer.split_at_mut(xor_offset);
                (&mut head[dst..dst + block], &tail[..block])
            } else {
                let (head, tail) = buffer.split_at_mut(dst);
                (&mut tail[..block], &head[xor_offset..xor_offset + block])
            };
            for (dst_byte, src_byte) in a.iter_mut().zip(b.iter()) {
                *dst_byte ^= src_byte;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_plan::PostProcessOperation;

    #[test]
    fn post_process_xors_in_place() {
        let block = BLOCK_SIZE as usize;
        let mut buffer = vec![0u8; 3 * block];
        buffer[..block].fill(0xff);
        buffer[block..2 * block].fill(0xaa);
        buffer[2 * block..].fill(0x55);
        apply_post_process(
            &mut buffer,
            &[PostProcessOperation {
                destination_offset: 0,
                source_offset: 0,
                xor_offsets: vec![BLOCK_SIZE, 2 * BLOCK_SIZE],
            }],
        );
        // 0xff ^ 0xaa ^ 0x55 == 0x00
        assert!(buffer[..block].iter().all(|&b| b == 0));
        assert!(buffer[block..2 * block].iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn post_process_copies_then_xors() {
        let block = BLOCK_SIZE as usize;
        let mut buffer = vec![0u8; 3 * block];
        buffer[block..2 * block].fill(0x0f);
        buffer[2 * block..].fill(0xf0);
        apply_post_process(
            &mut buffer,
            &[PostProcessOperation {
                destination_offset: 0,
                source_offset: BLOCK_SIZE,
                xor_offsets: vec![2 * BLOCK_SIZE],
            }],
        );
        assert!(buffer[..block].iter().all(|&b| b == 0xff));
    }
}
