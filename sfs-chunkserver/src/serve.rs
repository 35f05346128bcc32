//! Per-connection serving loop of a storage node.
//!
//! One connection speaks one of the client-facing message families:
//! reads (`READ` answered by `READ_DATA`* + `READ_STATUS`), write chains
//! (`WRITE_INIT`/`WRITE_DATA`/`WRITE_END` answered by one `WRITE_STATUS`
//! per packet) and the inter-node block count query. A write chain with
//! remaining hops forwards every packet to the next storage node and
//! confirms a packet only once its own write and the downstream
//! confirmation both succeeded.

use std::net::TcpStream;
use std::time::Duration;

use sfs_proto::net::{read_packet, write_packet};
use sfs_proto::{messages, GetChunkBlocks, GetChunkBlocksStatus, ReadRequest, WriteInit};
use sfs_types::Status;

use crate::hdd::HddManager;
use crate::replicator::serve_read;

/// Serve one accepted connection until the peer hangs up.
pub fn serve_connection(hdd: &HddManager, stream: &mut TcpStream) -> Result<(), Status> {
    loop {
        let Ok((header, body)) = read_packet(stream) else {
            // peer closed the connection; a read error here is routine
            return Ok(());
        };
        match header.msg_type {
            messages::CLTOCS_READ => {
                let request: ReadRequest =
                    sfs_proto::parse_body(&body).map_err(|_| Status::Disconnected)?;
                // a failed read already sent its status; keep serving
                let _ = serve_read(hdd, stream, &request);
            }
            messages::CLTOCS_PREFETCH => {
                // side effect only: touch the blocks so the page cache
                // warms up; errors are nobody's business
                let Ok(request) = sfs_proto::parse_body::<sfs_proto::PrefetchRequest>(&body) else {
                    continue;
                };
                let mut sink = sfs_tools::output_buffer::OutputBuffer::heap(
                    (request.size + 8 * (request.size / sfs_types::BLOCK_SIZE + 1)) as usize,
                );
                let _ = hdd.read(
                    request.chunk_id,
                    request.chunk_version,
                    request.part_type,
                    request.offset,
                    request.size,
                    &mut sink,
                );
            }
            messages::CSTOCS_GET_CHUNK_BLOCKS => {
                let request: GetChunkBlocks =
                    sfs_proto::parse_body(&body).map_err(|_| Status::Disconnected)?;
                serve_get_chunk_blocks(hdd, stream, &request)?;
            }
            messages::CLTOCS_WRITE_INIT => {
                let init: WriteInit =
                    sfs_proto::parse_body(&body).map_err(|_| Status::Disconnected)?;
                serve_write_chain(hdd, stream, init)?;
            }
            other => {
                log::warn!("serving: unknown message type {}, closing", other);
                return Err(Status::Disconnected);
            }
        }
    }
}

fn serve_get_chunk_blocks(
    hdd: &HddManager,
    stream: &mut TcpStream,
    request: &GetChunkBlocks,
) -> Result<(), Status> {
    let (blocks, status) = match hdd.registry().get(request.chunk_id, request.part_type) {
        Some(handle) => {
            let chunk = handle.lock().unwrap();
            if chunk.version == request.chunk_version {
                (chunk.blocks as u16, Status::Ok)
            } else {
                (0, Status::WrongVersion)
            }
        }
        None => (0, Status::NoSuchChunk),
    };
    write_packet(
        stream,
        messages::CSTOCS_GET_CHUNK_BLOCKS_STATUS,
        &GetChunkBlocksStatus {
            chunk_id: request.chunk_id,
            chunk_version: request.chunk_version,
            blocks,
            status,
        },
    )
    .map_err(|_| Status::Disconnected)
}

fn send_write_status(
    stream: &mut TcpStream,
    chunk_id: sfs_types::ChunkId,
    write_id: u32,
    status: Status,
) -> Result<(), Status> {
    write_packet(
        stream,
        messages::CSTOCL_WRITE_STATUS,
        &sfs_proto::WriteStatus {
            chunk_id,
            write_id,
            status,
        },
    )
    .map_err(|_| Status::Disconnected)
}

/// Run one write chain session on this node.
fn serve_write_chain(hdd: &HddManager, stream: &mut TcpStream, init: WriteInit) -> Result<(), Status> {
    let mut downstream: Option<TcpStream> = None;
    let init_status = if init.chain.is_empty() {
        Status::Ok
    } else {
        match open_downstream(&init) {
            Ok(connection) => {
                downstream = Some(connection);
                Status::Ok
            }
            Err(status) => status,
        }
    };
    // downstream init confirmation folds into our own
    let init_status = match (&mut downstream, init_status) {
        (Some(connection), Status::Ok) => await_status(connection, 0),
        (_, status) => status,
    };
    send_write_status(stream, init.chunk_id, 0, init_status)?;
    init_status.into_result()?;

    loop {
        let (header, body) = read_packet(stream).map_err(|_| Status::Disconnected)?;
        match header.msg_type {
            messages::CLTOCS_WRITE_DATA => {
                let Ok(parsed) = split_write_data(&body) else {
                    return Err(Status::Disconnected);
                };
                let (message, payload) = parsed;
                if let Some(connection) = &mut downstream {
                    let packet = sfs_proto::build_packet_with_payload(
                        messages::CLTOCS_WRITE_DATA,
                        &message,
                        payload,
                    );
                    use std::io::Write;
                    if connection.write_all(&packet).is_err() {
                        send_write_status(stream, init.chunk_id, message.write_id, Status::Disconnected)?;
                        return Err(Status::Disconnected);
                    }
                }
                let mut status = hdd
                    .write(
                        message.chunk_id,
                        init.chunk_version,
                        init.part_type,
                        message.block as u32,
                        message.offset,
                        message.size,
                        message.crc,
                        payload,
                    )
                    .err()
                    .unwrap_or(Status::Ok);
                if let Some(connection) = &mut downstream {
                    let downstream_status = await_status(connection, message.write_id);
                    if status.is_ok() {
                        status = downstream_status;
                    }
                }
                send_write_status(stream, init.chunk_id, message.write_id, status)?;
            }
            messages::CLTOCS_WRITE_END => {
                if let Some(connection) = &mut downstream {
                    let _ = write_packet(
                        connection,
                        messages::CLTOCS_WRITE_END,
                        &sfs_proto::WriteEnd {
                            chunk_id: init.chunk_id,
                        },
                    );
                }
                return Ok(());
            }
            other => {
                log::warn!("write chain: unexpected message type {}", other);
                return Err(Status::Disconnected);
            }
        }
    }
}

fn open_downstream(init: &WriteInit) -> Result<TcpStream, Status> {
    let addr: std::net::SocketAddr = init.chain[0].into();
    let connection = TcpStream::connect_timeout(&addr, Duration::from_secs(5))
        .map_err(|_| Status::CantConnect)?;
    connection.set_nodelay(true).map_err(|_| Status::Io)?;
    connection
        .set_read_timeout(Some(Duration::from_secs(10)))
        .map_err(|_| Status::Io)?;
    let mut connection = connection;
    write_packet(
        &mut connection,
        messages::CLTOCS_WRITE_INIT,
        &WriteInit {
            chunk_id: init.chunk_id,
            chunk_version: init.chunk_version,
            part_type: init.part_type,
            chain: init.chain[1..].to_vec(),
        },
    )
    .map_err(|_| Status::Disconnected)?;
    Ok(connection)
}

fn await_status(connection: &mut TcpStream, write_id: u32) -> Status {
    match read_packet(connection) {
        Ok((header, body)) if header.msg_type == messages::CSTOCL_WRITE_STATUS => {
            match sfs_proto::parse_body::<sfs_proto::WriteStatus>(&body) {
                Ok(message) if message.write_id == write_id => message.status,
                Ok(_) => Status::Disconnected,
                Err(_) => Status::Disconnected,
            }
        }
        _ => Status::Disconnected,
    }
}

fn split_write_data(body: &[u8]) -> Result<(sfs_proto::WriteData, &[u8]), anyhow::Error> {
    use sfs_proto::Wire;
    let mut cursor = body;
    let message = sfs_proto::WriteData::deserialize(&mut cursor)?;
    Ok((message, cursor))
}
