//! Connection to the metadata master.
//!
//! The mount agent owns exactly one of these; it is plain data, created
//! once and torn down on drop, and every chunk path borrows it through
//! the [`ChunkLocator`] trait. All exchanges are synchronous
//! request/reply pairs over one stream, serialized by a mutex.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Error};

use sfs_proto::net::{read_packet, write_packet};
use sfs_proto::{messages, Wire};
use sfs_types::{ChunkId, NetworkAddress, Status};

use crate::locator::{ChunkLocation, ChunkLocator, PartWithAddress, WriteLock};

pub struct MasterConnection {
    stream: Mutex<TcpStream>,
}

impl MasterConnection {
    pub fn connect(address: NetworkAddress, timeout: Duration) -> Result<Self, Error> {
        let addr: std::net::SocketAddr = address.into();
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    fn exchange<Req: Wire, Reply: Wire>(
        &self,
        request_type: u32,
        request: &Req,
        reply_type: u32,
    ) -> Result<Reply, Error> {
        let mut stream = self.stream.lock().unwrap();
        write_packet(&mut *stream, request_type, request)?;
        stream.flush()?;
        let (header, body) = read_packet(&mut *stream)?;
        if header.msg_type != reply_type {
            bail!(
                "master answered with message type {} instead of {}",
                header.msg_type,
                reply_type
            );
        }
        sfs_proto::parse_body(&body)
    }

    /// Ask the master to truncate a file; the reply carries the lock id
    /// for the follow-up [`Self::truncate_end`].
    pub fn truncate(&self, inode: u32, file_length: u64) -> Result<(Status, u32), Error> {
        let reply: sfs_proto::TruncateReply = self.exchange(
            messages::CLTOMA_TRUNCATE,
            &sfs_proto::TruncateRequest { inode, file_length },
            messages::MATOCL_TRUNCATE,
        )?;
        Ok((reply.status, reply.lock_id))
    }

    pub fn truncate_end(&self, inode: u32, lock_id: u32, file_length: u64) -> Result<Status, Error> {
        let reply: sfs_proto::TruncateEndReply = self.exchange(
            messages::CLTOMA_TRUNCATE_END,
            &sfs_proto::TruncateEnd {
                inode,
                lock_id,
                file_length,
            },
            messages::MATOCL_TRUNCATE_END,
        )?;
        Ok(reply.status)
    }

    fn convert_parts(locations: Vec<sfs_proto::PartLocation>) -> Vec<PartWithAddress> {
        locations
            .into_iter()
            .map(|location| PartWithAddress {
                address: location.address,
                part_type: location.part_type,
            })
            .collect()
    }
}

impl ChunkLocator for MasterConnection {
    fn locate_for_read(&self, inode: u32, chunk_index: u32) -> Result<ChunkLocation, Error> {
        let reply: sfs_proto::ReadChunkReply = self.exchange(
            messages::CLTOMA_READ_CHUNK,
            &sfs_proto::ReadChunkRequest { inode, chunk_index },
            messages::MATOCL_READ_CHUNK,
        )?;
        if !reply.status.is_ok() {
            bail!("read chunk refused: {}", reply.status);
        }
        Ok(ChunkLocation {
            chunk_id: reply.chunk_id,
            version: reply.chunk_version,
            file_length: reply.file_length,
            parts: Self::convert_parts(reply.locations),
        })
    }

    fn acquire_write(&self, inode: u32, chunk_index: u32, lock_id: u32) -> Result<WriteLock, Error> {
        let reply: sfs_proto::WriteChunkReply = self.exchange(
            messages::CLTOMA_WRITE_CHUNK,
            &sfs_proto::WriteChunkRequest {
                inode,
                chunk_index,
                lock_id,
            },
            messages::MATOCL_WRITE_CHUNK,
        )?;
        if !reply.status.is_ok() {
            bail!("write chunk refused: {}", reply.status);
        }
        Ok(WriteLock {
            lock_id: reply.lock_id,
            chunk_id: reply.chunk_id,
            version: reply.chunk_version,
            file_length: reply.file_length,
            parts: Self::convert_parts(reply.locations),
        })
    }

    fn write_end(
        &self,
        lock_id: u32,
        inode: u32,
        chunk_id: ChunkId,
        file_length: u64,
    ) -> Result<(), Error> {
        let reply: sfs_proto::WriteChunkEndReply = self.exchange(
            messages::CLTOMA_WRITE_CHUNK_END,
            &sfs_proto::WriteChunkEnd {
                lock_id,
                inode,
                chunk_id,
                file_length,
            },
            messages::MATOCL_WRITE_CHUNK_END,
        )?;
        if !reply.status.is_ok() {
            bail!("write end refused: {}", reply.status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_types::ChunkPartType;
    use std::net::TcpListener;

    fn fake_master_once(
        reply_type: u32,
        reply: impl Wire + Send + 'static,
    ) -> NetworkAddress {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (_, _) = read_packet(&mut stream).unwrap();
            write_packet(&mut stream, reply_type, &reply).unwrap();
        });
        NetworkAddress::new(0x7f000001, port)
    }

    #[test]
    fn read_chunk_exchange() {
        let address = fake_master_once(
            messages::MATOCL_READ_CHUNK,
            sfs_proto::ReadChunkReply {
                packet_version: 0,
                status: Status::Ok,
                file_length: 1234,
                chunk_id: ChunkId(9),
                chunk_version: 2,
                locations: vec![sfs_proto::PartLocation {
                    address: NetworkAddress::new(0x0a000001, 9422),
                    part_type: ChunkPartType::standard(),
                }],
            },
        );
        let master = MasterConnection::connect(address, Duration::from_secs(1)).unwrap();
        let location = master.locate_for_read(1, 0).unwrap();
        assert_eq!(location.chunk_id, ChunkId(9));
        assert_eq!(location.version, 2);
        assert_eq!(location.file_length, 1234);
        assert_eq!(location.parts.len(), 1);
    }

    #[test]
    fn refused_write_is_an_error() {
        let address = fake_master_once(
            messages::MATOCL_WRITE_CHUNK,
            sfs_proto::WriteChunkReply {
                packet_version: 0,
                status: Status::Locked,
                lock_id: 0,
                file_length: 0,
                chunk_id: ChunkId(0),
                chunk_version: 0,
                locations: Vec::new(),
            },
        );
        let master = MasterConnection::connect(address, Duration::from_secs(1)).unwrap();
        assert!(master.acquire_write(1, 0, 0).is_err());
    }
}
