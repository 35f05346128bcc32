//! One write chain: a connection to the head storage node of a part,
//! through which init, data and end packets travel, and from which one
//! status per packet comes back.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use sfs_proto::{messages, PacketHeader, HEADER_SIZE};
use sfs_types::{ChunkId, ChunkPartType, ChunkVersion, NetworkAddress, Status};

use crate::error::ChunkError;

/// A confirmed packet: the status the chain head reported for `write_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteStatusReport {
    pub write_id: u32,
    pub status: Status,
}

pub struct WriteExecutor {
    chunk_id: ChunkId,
    version: ChunkVersion,
    part_type: ChunkPartType,
    head: NetworkAddress,
    chain: Vec<NetworkAddress>,
    stream: TcpStream,
    recv_header: [u8; HEADER_SIZE],
    recv_got: usize,
    recv_body: Option<(PacketHeader, Vec<u8>, usize)>,
    /// write_ids sent but not yet confirmed (0 is the init packet).
    unconfirmed: BTreeSet<u32>,
    last_activity: Instant,
    response_timeout: Duration,
}

impl WriteExecutor {
    pub fn new(
        head: NetworkAddress,
        connect_timeout: Duration,
        response_timeout: Duration,
        chunk_id: ChunkId,
        version: ChunkVersion,
        part_type: ChunkPartType,
    ) -> Result<Self, ChunkError> {
        let addr: std::net::SocketAddr = head.into();
        let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|err| {
            ChunkError::recoverable(
                Status::CantConnect,
                format!("connect to {} failed: {}", head, err),
            )
        })?;
        stream
            .set_nodelay(true)
            .and_then(|()| stream.set_nonblocking(true))
            .map_err(|err| ChunkError::recoverable(Status::Io, err.to_string()))?;
        Ok(Self {
            chunk_id,
            version,
            part_type,
            head,
            chain: Vec::new(),
            stream,
            recv_header: [0; HEADER_SIZE],
            recv_got: 0,
            recv_body: None,
            unconfirmed: BTreeSet::new(),
            last_activity: Instant::now(),
            response_timeout,
        })
    }

    pub fn add_chain_server(&mut self, address: NetworkAddress) {
        self.chain.push(address);
    }

    pub fn part_type(&self) -> ChunkPartType {
        self.part_type
    }

    pub fn server(&self) -> NetworkAddress {
        self.head
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        self.stream.as_raw_fd()
    }

    pub fn pending_count(&self) -> usize {
        self.unconfirmed.len()
    }

    /// True when the chain head owes a status for longer than the
    /// response timeout.
    pub fn server_timed_out(&self) -> bool {
        !self.unconfirmed.is_empty() && self.last_activity.elapsed() > self.response_timeout
    }

    fn send(&mut self, packet: &[u8]) -> Result<(), ChunkError> {
        // data packets are small enough for the socket buffer; a full
        // buffer here means the chain is stuck anyway
        self.stream.write_all(packet).map_err(|err| {
            ChunkError::recoverable(
                Status::Disconnected,
                format!("write to {} failed: {}", self.head, err),
            )
        })
    }

    /// Open the chain. Confirmed like a data packet, with write id 0.
    pub fn send_init(&mut self) -> Result<(), ChunkError> {
        let packet = sfs_proto::build_packet(
            messages::CLTOCS_WRITE_INIT,
            &sfs_proto::WriteInit {
                chunk_id: self.chunk_id,
                chunk_version: self.version,
                part_type: self.part_type,
                chain: self.chain.clone(),
            },
        );
        self.unconfirmed.insert(0);
        self.last_activity = Instant::now();
        self.send(&packet)
    }

    pub fn send_data(
        &mut self,
        write_id: u32,
        block: u16,
        offset: u32,
        size: u32,
        crc: u32,
        data: &[u8],
    ) -> Result<(), ChunkError> {
        debug_assert!(write_id != 0, "write id 0 is reserved for the init packet");
        let packet = sfs_proto::build_packet_with_payload(
            messages::CLTOCS_WRITE_DATA,
            &sfs_proto::WriteData {
                chunk_id: self.chunk_id,
                write_id,
                block,
                offset,
                size,
                crc,
            },
            data,
        );
        self.unconfirmed.insert(write_id);
        self.send(&packet)
    }

    pub fn send_end(&mut self) -> Result<(), ChunkError> {
        let packet = sfs_proto::build_packet(
            messages::CLTOCS_WRITE_END,
            &sfs_proto::WriteEnd {
                chunk_id: self.chunk_id,
            },
        );
        self.send(&packet)
    }

    /// Drain whatever statuses are available without blocking.
    pub fn receive_statuses(&mut self) -> Result<Vec<WriteStatusReport>, ChunkError> {
        enum Step {
            More,
            Blocked,
            Closed(String),
            HeaderDone(PacketHeader),
            MessageDone(PacketHeader, Vec<u8>),
        }
        let mut reports = Vec::new();
        loop {
            let step = if let Some((header, body, got)) = &mut self.recv_body {
                if body.is_empty() {
                    Step::MessageDone(*header, Vec::new())
                } else {
                    match self.stream.read(&mut body[*got..]) {
                        Ok(0) => Step::Closed("connection closed".to_string()),
                        Ok(n) => {
                            *got += n;
                            if *got == body.len() {
                                Step::MessageDone(*header, std::mem::take(body))
                            } else {
                                Step::More
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Step::Blocked,
                        Err(err) => Step::Closed(err.to_string()),
                    }
                }
            } else {
                match self.stream.read(&mut self.recv_header[self.recv_got..]) {
                    Ok(0) => Step::Closed("connection closed".to_string()),
                    Ok(n) => {
                        self.recv_got += n;
                        if self.recv_got == HEADER_SIZE {
                            match PacketHeader::parse(&self.recv_header) {
                                Ok(header) => Step::HeaderDone(header),
                                Err(err) => Step::Closed(err.to_string()),
                            }
                        } else {
                            Step::More
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Step::Blocked,
                    Err(err) => Step::Closed(err.to_string()),
                }
            };
            match step {
                Step::More => {}
                Step::Blocked => break,
                Step::Closed(why) => return Err(self.disconnected(&why)),
                Step::HeaderDone(header) => {
                    self.recv_body = Some((header, vec![0; header.length as usize], 0));
                }
                Step::MessageDone(header, body) => {
                    self.recv_body = None;
                    self.recv_got = 0;
                    reports.push(self.parse_status(header, &body)?);
                }
            }
        }
        Ok(reports)
    }

    fn parse_status(&mut self, header: PacketHeader, body: &[u8]) -> Result<WriteStatusReport, ChunkError> {
        if header.msg_type != messages::CSTOCL_WRITE_STATUS {
            return Err(self.disconnected(&format!("unexpected message type {}", header.msg_type)));
        }
        let message: sfs_proto::WriteStatus = sfs_proto::parse_body(body)
            .map_err(|err| ChunkError::recoverable(Status::Disconnected, err.to_string()))?;
        if message.chunk_id != self.chunk_id {
            return Err(self.disconnected("status for a different chunk"));
        }
        if !self.unconfirmed.remove(&message.write_id) {
            return Err(self.disconnected(&format!("status for unknown write id {}", message.write_id)));
        }
        self.last_activity = Instant::now();
        Ok(WriteStatusReport {
            write_id: message.write_id,
            status: message.status,
        })
    }

    fn disconnected(&self, why: &str) -> ChunkError {
        ChunkError::recoverable(
            Status::Disconnected,
            format!("chain head {} ({}): {}", self.head, self.part_type, why),
        )
    }
}
