//! Replication between live storage nodes over loopback TCP.

use std::net::TcpListener;
use std::sync::Arc;

use sfs_chunkserver::format::ChunkFormat;
use sfs_chunkserver::replicator::{ReplicationSource, Replicator, ReplicatorConfig};
use sfs_chunkserver::{serve_connection, HddManager};
use sfs_tools::crc::crc;
use sfs_tools::output_buffer::OutputBuffer;
use sfs_types::{ChunkId, ChunkPartType, NetworkAddress, SliceType, Status, BLOCK_SIZE};

struct Node {
    hdd: Arc<HddManager>,
    address: NetworkAddress,
    _dir: tempfile::TempDir,
}

fn spawn_node() -> Node {
    let dir = tempfile::tempdir().unwrap();
    let mut hdd = HddManager::new();
    hdd.add_folder(dir.path()).unwrap();
    let hdd = Arc::new(hdd);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let address = NetworkAddress::new(0x7f000001, port);

    let server_hdd = Arc::clone(&hdd);
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let hdd = Arc::clone(&server_hdd);
            std::thread::spawn(move || {
                let _ = serve_connection(&hdd, &mut stream);
            });
        }
    });

    Node {
        hdd,
        address,
        _dir: dir,
    }
}

fn put_block(hdd: &HddManager, id: ChunkId, version: u32, part: ChunkPartType, block: u32, data: &[u8]) {
    hdd.write(id, version, part, block, 0, BLOCK_SIZE, crc(0, data), data)
        .unwrap();
}

fn get_block(hdd: &HddManager, id: ChunkId, version: u32, part: ChunkPartType, block: u32) -> Vec<u8> {
    let mut output = OutputBuffer::heap(BLOCK_SIZE as usize + 8);
    hdd.read(id, version, part, block * BLOCK_SIZE, BLOCK_SIZE, &mut output)
        .unwrap();
    output.as_slice().unwrap()[4..].to_vec()
}

#[test]
fn missing_xor4_part_is_rebuilt_from_peers() {
    let chunk = ChunkId(0x1001);
    let version = 7;
    let level = 4u8;
    let parts: Vec<ChunkPartType> = (1..=level)
        .map(|p| ChunkPartType::xor_data(level, p).unwrap())
        .collect();
    let parity = ChunkPartType::xor_parity(level).unwrap();

    // three data parts and parity live on four nodes; data part 4 is lost
    let blocks = 2u32;
    let sources: Vec<_> = (0..4).map(|_| spawn_node()).collect();
    let mut payloads: Vec<Vec<Vec<u8>>> = Vec::new();
    for (node, part) in sources.iter().zip([parts[0], parts[1], parts[2], parity]) {
        node.hdd
            .create(chunk, version, part, ChunkFormat::Interleaved)
            .unwrap();
        let mut node_blocks = Vec::new();
        for block in 0..blocks {
            let byte = (0x10 + part.id() as u8).wrapping_add(block as u8 * 0x21);
            let data = vec![byte; BLOCK_SIZE as usize];
            put_block(&node.hdd, chunk, version, part, block, &data);
            node_blocks.push(data);
        }
        payloads.push(node_blocks);
    }

    let target = spawn_node();
    let replicator = Replicator::new(Arc::clone(&target.hdd), ReplicatorConfig::default());
    let source_list: Vec<ReplicationSource> = sources
        .iter()
        .zip([parts[0], parts[1], parts[2], parity])
        .map(|(node, part_type)| ReplicationSource {
            address: node.address,
            part_type,
        })
        .collect();
    replicator
        .replicate(chunk, version, parts[3], &source_list)
        .unwrap();
    assert_eq!(replicator.take_stats(), 1);

    // the rebuilt part carries the target version and exactly B blocks
    let handle = target.hdd.registry().get(chunk, parts[3]).unwrap();
    {
        let entry = handle.lock().unwrap();
        assert_eq!(entry.version, version);
        assert_eq!(entry.blocks, blocks);
    }
    // content is the XOR of the three data parts and parity, block by block
    for block in 0..blocks {
        let mut expected = vec![0u8; BLOCK_SIZE as usize];
        for source in &payloads {
            for (dst, src) in expected.iter_mut().zip(&source[block as usize]) {
                *dst ^= src;
            }
        }
        assert_eq!(get_block(&target.hdd, chunk, version, parts[3], block), expected);
    }
    // stored CRCs are consistent
    target.hdd.test(chunk, version, parts[3]).unwrap();
}

#[test]
fn single_source_copy() {
    let chunk = ChunkId(0x1002);
    let part = ChunkPartType::xor_data(2, 1).unwrap();
    let source = spawn_node();
    source
        .hdd
        .create(chunk, 3, part, ChunkFormat::Legacy)
        .unwrap();
    let data = vec![0x5eu8; BLOCK_SIZE as usize];
    put_block(&source.hdd, chunk, 3, part, 0, &data);

    let target = spawn_node();
    let replicator = Replicator::new(Arc::clone(&target.hdd), ReplicatorConfig::default());
    replicator
        .replicate(
            chunk,
            3,
            part,
            &[ReplicationSource {
                address: source.address,
                part_type: part,
            }],
        )
        .unwrap();
    assert_eq!(get_block(&target.hdd, chunk, 3, part, 0), data);
}

#[test]
fn erasure_coded_part_is_reconstructed() {
    let chunk = ChunkId(0x1003);
    let version = 1;
    let k = 3usize;
    let m = 2usize;
    let slice = SliceType::Ec(k as u8, m as u8);
    let part = |shard| ChunkPartType::new(slice, shard).unwrap();

    // encode one stripe
    let rs = reed_solomon_erasure::galois_8::ReedSolomon::new(k, m).unwrap();
    let mut shards: Vec<Vec<u8>> = (0..k)
        .map(|i| vec![0x30 + i as u8; BLOCK_SIZE as usize])
        .collect();
    for _ in 0..m {
        shards.push(vec![0u8; BLOCK_SIZE as usize]);
    }
    rs.encode(&mut shards).unwrap();

    // shard 1 is lost; peers hold shards 0, 2 and 3
    let holders = [0usize, 2, 3];
    let sources: Vec<_> = holders
        .iter()
        .map(|&shard| {
            let node = spawn_node();
            node.hdd
                .create(chunk, version, part(shard), ChunkFormat::Interleaved)
                .unwrap();
            put_block(&node.hdd, chunk, version, part(shard), 0, &shards[shard]);
            node
        })
        .collect();

    let target = spawn_node();
    let replicator = Replicator::new(Arc::clone(&target.hdd), ReplicatorConfig::default());
    let source_list: Vec<ReplicationSource> = sources
        .iter()
        .zip(holders)
        .map(|(node, shard)| ReplicationSource {
            address: node.address,
            part_type: part(shard),
        })
        .collect();
    replicator
        .replicate(chunk, version, part(1), &source_list)
        .unwrap();
    assert_eq!(get_block(&target.hdd, chunk, version, part(1), 0), shards[1]);
}

#[test]
fn failed_replication_leaves_no_trace() {
    let chunk = ChunkId(0x1004);
    let part = ChunkPartType::xor_data(2, 1).unwrap();
    let source = spawn_node();
    // the source holds a different version than the one requested
    source
        .hdd
        .create(chunk, 1, part, ChunkFormat::Interleaved)
        .unwrap();

    let target = spawn_node();
    let replicator = Replicator::new(Arc::clone(&target.hdd), ReplicatorConfig::default());
    let result = replicator.replicate(
        chunk,
        2,
        part,
        &[ReplicationSource {
            address: source.address,
            part_type: part,
        }],
    );
    assert_eq!(result, Err(Status::WrongVersion));
    // the half-built version-0 part was removed
    assert!(target.hdd.registry().get(chunk, part).is_none());
    assert_eq!(replicator.take_stats(), 0);
}

#[test]
fn unreachable_source_is_a_connect_error() {
    let chunk = ChunkId(0x1005);
    let part = ChunkPartType::standard();
    let target = spawn_node();
    let replicator = Replicator::new(
        Arc::clone(&target.hdd),
        ReplicatorConfig {
            connect_timeout: std::time::Duration::from_millis(200),
            ..ReplicatorConfig::default()
        },
    );
    // nobody listens on this port
    let result = replicator.replicate(
        chunk,
        1,
        part,
        &[ReplicationSource {
            address: NetworkAddress::new(0x7f000001, 1),
            part_type: part,
        }],
    );
    assert_eq!(result, Err(Status::CantConnect));
    assert!(target.hdd.registry().get(chunk, part).is_none());
}
