//! Synchronous framed packet I/O over byte streams.

use std::io::{Read, Write};

use anyhow::{bail, Error};

use crate::{PacketHeader, Wire, HEADER_SIZE};

/// Read one framed packet: header plus body.
pub fn read_packet<R: Read>(stream: &mut R) -> Result<(PacketHeader, Vec<u8>), Error> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_bytes)?;
    let header = PacketHeader::parse(&header_bytes)?;
    let mut body = vec![0u8; header.length as usize];
    stream.read_exact(&mut body)?;
    Ok((header, body))
}

/// Read one framed packet and require the given message type.
pub fn read_packet_of_type<R: Read, T: Wire>(stream: &mut R, msg_type: u32) -> Result<T, Error> {
    let (header, body) = read_packet(stream)?;
    if header.msg_type != msg_type {
        bail!(
            "unexpected message type {} (wanted {})",
            header.msg_type,
            msg_type
        );
    }
    crate::parse_body(&body)
}

/// Serialize and send one framed packet.
pub fn write_packet<W: Write, T: Wire>(stream: &mut W, msg_type: u32, body: &T) -> Result<(), Error> {
    stream.write_all(&crate::build_packet(msg_type, body))?;
    Ok(())
}

/// Serialize and send one framed packet with a raw payload after the body.
pub fn write_packet_with_payload<W: Write, T: Wire>(
    stream: &mut W,
    msg_type: u32,
    body: &T,
    payload: &[u8],
) -> Result<(), Error> {
    stream.write_all(&crate::build_packet_with_payload(msg_type, body, payload))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::*;
    use sfs_types::{ChunkId, Status};

    #[test]
    fn stream_roundtrip() {
        let mut wire = Vec::new();
        write_packet(
            &mut wire,
            CSTOCL_READ_STATUS,
            &ReadStatus {
                chunk_id: ChunkId(5),
                status: Status::Ok,
            },
        )
        .unwrap();
        write_packet_with_payload(
            &mut wire,
            CSTOCL_READ_DATA,
            &ReadData {
                chunk_id: ChunkId(5),
                block: 0,
                offset: 0,
                size: 3,
                crc: 7,
            },
            b"abc",
        )
        .unwrap();

        let mut cursor = &wire[..];
        let status: ReadStatus = read_packet_of_type(&mut cursor, CSTOCL_READ_STATUS).unwrap();
        assert_eq!(status.chunk_id, ChunkId(5));
        let (header, body) = read_packet(&mut cursor).unwrap();
        assert_eq!(header.msg_type, CSTOCL_READ_DATA);
        let (data, payload) = crate::parse_body_with_payload::<ReadData>(&body, 3).unwrap();
        assert_eq!(data.size, 3);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn wrong_type_is_refused() {
        let mut wire = Vec::new();
        write_packet(
            &mut wire,
            CSTOCL_READ_STATUS,
            &ReadStatus {
                chunk_id: ChunkId(5),
                status: Status::Ok,
            },
        )
        .unwrap();
        let mut cursor = &wire[..];
        assert!(read_packet_of_type::<_, ReadStatus>(&mut cursor, CSTOCL_WRITE_STATUS).is_err());
    }
}
