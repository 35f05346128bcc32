//! Wire protocol of ShardFS.
//!
//! Every message is `type:u32 length:u32 payload[length]`, all integers
//! little-endian, strings length-prefixed. Where a message family exists in
//! several revisions the first payload byte is the packet version.
//!
//! A malformed or truncated packet, or an unknown message type, is a
//! protocol error: the receiving side kills the connection.

pub mod messages;
pub mod net;
pub mod wire;

pub use messages::*;
pub use wire::Wire;

use anyhow::{bail, Error};
use bytes::{Buf, BufMut};

/// Framing header preceding every payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub msg_type: u32,
    pub length: u32,
}

pub const HEADER_SIZE: usize = 8;

/// Upper bound for a packet body; data messages carry one block plus a
/// small fixed preamble.
pub const MAX_PACKET_SIZE: u32 = sfs_types::BLOCK_SIZE + 128;

impl PacketHeader {
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, Error> {
        let mut buf = &bytes[..];
        let msg_type = buf.get_u32_le();
        let length = buf.get_u32_le();
        if length > MAX_PACKET_SIZE {
            bail!("packet too long ({} bytes, type {})", length, msg_type);
        }
        Ok(Self { msg_type, length })
    }

    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.msg_type);
        buf.put_u32_le(self.length);
    }
}

/// Build a complete framed packet from a body.
pub fn build_packet<T: Wire>(msg_type: u32, body: &T) -> Vec<u8> {
    let body_size = body.serialized_size();
    let mut packet = Vec::with_capacity(HEADER_SIZE + body_size);
    PacketHeader {
        msg_type,
        length: body_size as u32,
    }
    .write(&mut packet);
    body.serialize(&mut packet);
    debug_assert_eq!(packet.len(), HEADER_SIZE + body_size);
    packet
}

/// Build a framed packet whose body is followed by a raw payload (the block
/// bytes of a data message).
pub fn build_packet_with_payload<T: Wire>(msg_type: u32, body: &T, payload: &[u8]) -> Vec<u8> {
    let body_size = body.serialized_size();
    let mut packet = Vec::with_capacity(HEADER_SIZE + body_size + payload.len());
    PacketHeader {
        msg_type,
        length: (body_size + payload.len()) as u32,
    }
    .write(&mut packet);
    body.serialize(&mut packet);
    packet.extend_from_slice(payload);
    packet
}

/// Deserialize a packet body, requiring that every byte is consumed.
pub fn parse_body<T: Wire>(mut body: &[u8]) -> Result<T, Error> {
    let value = T::deserialize(&mut body)?;
    if !body.is_empty() {
        bail!("{} trailing bytes after packet body", body.len());
    }
    Ok(value)
}

/// Deserialize a packet body followed by a raw payload of `payload_len`
/// bytes; returns the body and the payload slice.
pub fn parse_body_with_payload<T: Wire>(body: &[u8], payload_len: usize) -> Result<(T, &[u8]), Error> {
    if body.len() < payload_len {
        bail!("packet shorter than its declared payload");
    }
    let (head, payload) = body.split_at(body.len() - payload_len);
    Ok((parse_body(head)?, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_types::ChunkId;

    #[test]
    fn header_roundtrip() {
        let header = PacketHeader {
            msg_type: messages::CLTOCS_READ,
            length: 20,
        };
        let mut bytes = Vec::new();
        header.write(&mut bytes);
        assert_eq!(bytes.len(), HEADER_SIZE);
        let parsed = PacketHeader::parse(bytes[..].try_into().unwrap()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn oversized_header_is_refused() {
        let mut bytes = Vec::new();
        PacketHeader {
            msg_type: 1,
            length: MAX_PACKET_SIZE + 1,
        }
        .write(&mut bytes);
        assert!(PacketHeader::parse(bytes[..].try_into().unwrap()).is_err());
    }

    #[test]
    fn packet_roundtrip() {
        let body = messages::ReadStatus {
            chunk_id: ChunkId(7),
            status: sfs_types::Status::Ok,
        };
        let packet = build_packet(messages::CSTOCL_READ_STATUS, &body);
        let header = PacketHeader::parse(packet[..HEADER_SIZE].try_into().unwrap()).unwrap();
        assert_eq!(header.msg_type, messages::CSTOCL_READ_STATUS);
        assert_eq!(header.length as usize, packet.len() - HEADER_SIZE);
        let parsed: messages::ReadStatus = parse_body(&packet[HEADER_SIZE..]).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn trailing_bytes_are_a_protocol_error() {
        let body = messages::WriteEnd {
            chunk_id: ChunkId(1),
        };
        let mut packet = build_packet(messages::CLTOCS_WRITE_END, &body);
        packet.push(0);
        assert!(parse_body::<messages::WriteEnd>(&packet[HEADER_SIZE..]).is_err());
    }

    #[test]
    fn payload_split() {
        let body = messages::ReadData {
            chunk_id: ChunkId(3),
            block: 1,
            offset: 0,
            size: 4,
            crc: 0xabcd,
        };
        let packet = build_packet_with_payload(messages::CSTOCL_READ_DATA, &body, b"data");
        let (parsed, payload) =
            parse_body_with_payload::<messages::ReadData>(&packet[HEADER_SIZE..], 4).unwrap();
        assert_eq!(parsed, body);
        assert_eq!(payload, b"data");
    }
}
