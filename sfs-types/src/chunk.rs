use std::fmt;

use serde::{Deserialize, Serialize};

use crate::part_type::ChunkPartType;

/// Chunk identifier, unique across the whole file system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl From<u64> for ChunkId {
    fn from(id: u64) -> Self {
        ChunkId(id)
    }
}

/// Chunk version. The master bumps it before every mutation that could
/// leave the parts of a chunk inconsistent, so a part carrying an old
/// version is never silently served.
pub type ChunkVersion = u32;

/// Identity of one concrete chunk revision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkWithVersion {
    pub id: ChunkId,
    pub version: ChunkVersion,
}

impl ChunkWithVersion {
    pub fn new(id: ChunkId, version: ChunkVersion) -> Self {
        Self { id, version }
    }
}

impl fmt::Display for ChunkWithVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}_{:08X}", self.id, self.version)
    }
}

/// Identity of one chunk part revision, used in damage and loss reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkWithVersionAndType {
    pub id: ChunkId,
    pub version: ChunkVersion,
    pub part_type: ChunkPartType,
}

impl ChunkWithVersionAndType {
    pub fn new(id: ChunkId, version: ChunkVersion, part_type: ChunkPartType) -> Self {
        Self {
            id,
            version,
            part_type,
        }
    }
}

impl fmt::Display for ChunkWithVersionAndType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "chunk {}_{:08X} ({})", self.id, self.version, self.part_type)
    }
}

/// Storage node address as carried in chunk location replies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
pub struct NetworkAddress {
    pub ip: u32,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}:{}",
            (self.ip >> 24) & 0xff,
            (self.ip >> 16) & 0xff,
            (self.ip >> 8) & 0xff,
            self.ip & 0xff,
            self.port
        )
    }
}

impl From<std::net::SocketAddrV4> for NetworkAddress {
    fn from(addr: std::net::SocketAddrV4) -> Self {
        Self {
            ip: u32::from_be_bytes(addr.ip().octets()),
            port: addr.port(),
        }
    }
}

impl From<NetworkAddress> for std::net::SocketAddr {
    fn from(addr: NetworkAddress) -> Self {
        std::net::SocketAddr::V4(std::net::SocketAddrV4::new(
            std::net::Ipv4Addr::from(addr.ip.to_be_bytes()),
            addr.port,
        ))
    }
}
