//! On-disk layout of chunk part files.
//!
//! Two formats coexist. The *legacy* format starts with a header area:
//!
//! ```text
//! offset 0     signature id ("LIZC 1.0" or "MFSC 1.0")
//! offset 8     chunk id (u64 LE)
//! offset 16    chunk version (u32 LE)
//! offset 20    chunk part type id (u16 LE)
//! offset 1024  per-block CRCs (4 bytes each, 1024 slots)
//! offset 8192  first data byte (4 KiB aligned)
//! ```
//!
//! The *interleaved* format stores raw blocks back-to-back from offset 0
//! and keeps the per-block CRCs in a trailing index after the last block.
//! Readers pick the layout from the first eight bytes of the file: a known
//! signature means legacy, anything else interleaved.

use std::fmt;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};

use sfs_types::{ChunkId, ChunkPartType, ChunkVersion, SliceType, BLOCKS_PER_CHUNK, BLOCK_SIZE, CRC_SIZE};

pub const SIGNATURE_LIZ: &[u8; 8] = b"LIZC 1.0";
pub const SIGNATURE_MFS: &[u8; 8] = b"MFSC 1.0";

pub const SIGNATURE_AREA_SIZE: u64 = 1024;
pub const CRC_AREA_SIZE: u64 = BLOCKS_PER_CHUNK as u64 * CRC_SIZE as u64;
/// First data byte of a legacy file; 4 KiB aligned.
pub const LEGACY_DATA_OFFSET: u64 = 8192;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkFormat {
    Legacy,
    Interleaved,
}

impl fmt::Display for ChunkFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChunkFormat::Legacy => write!(f, "legacy"),
            ChunkFormat::Interleaved => write!(f, "interleaved"),
        }
    }
}

/// Signature block at the head of a legacy chunk part file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSignature {
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    pub part_type: ChunkPartType,
}

impl ChunkSignature {
    pub const SERIALIZED_SIZE: usize = 8 + 8 + 4 + 2;

    pub fn new(chunk_id: ChunkId, version: ChunkVersion, part_type: ChunkPartType) -> Self {
        Self {
            chunk_id,
            version,
            part_type,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SERIALIZED_SIZE] {
        let mut bytes = [0u8; Self::SERIALIZED_SIZE];
        bytes[0..8].copy_from_slice(SIGNATURE_LIZ);
        bytes[8..16].copy_from_slice(&self.chunk_id.0.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.version.to_le_bytes());
        bytes[20..22].copy_from_slice(&self.part_type.id().to_le_bytes());
        bytes
    }

    /// Read a signature from the head of an open file. `Ok(None)` means
    /// the file carries no known signature and is an interleaved file.
    pub fn read_from(file: &File) -> Result<Option<Self>, Error> {
        let mut bytes = [0u8; Self::SERIALIZED_SIZE];
        match file.read_exact_at(&mut bytes, 0) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        if &bytes[0..8] != SIGNATURE_LIZ && &bytes[0..8] != SIGNATURE_MFS {
            return Ok(None);
        }
        let chunk_id = ChunkId(u64::from_le_bytes(bytes[8..16].try_into().unwrap()));
        let version = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let part_type_id = u16::from_le_bytes(bytes[20..22].try_into().unwrap());
        let part_type = ChunkPartType::from_id(part_type_id)
            .map_err(|_| anyhow::format_err!("signature names unknown part type {}", part_type_id))?;
        Ok(Some(Self {
            chunk_id,
            version,
            part_type,
        }))
    }

    pub fn write_to(&self, file: &File) -> Result<(), Error> {
        file.write_all_at(&self.to_bytes(), 0)?;
        Ok(())
    }
}

/// Number of blocks this part holds when the whole chunk has
/// `chunk_blocks` blocks.
///
/// XOR slices distribute blocks round-robin over the data parts; the
/// parity part is as long as the longest data part. EC slices use the same
/// round-robin rule over k data parts.
pub fn part_blocks(part_type: ChunkPartType, chunk_blocks: u32) -> u32 {
    match part_type.slice_type() {
        SliceType::Standard => chunk_blocks,
        SliceType::Xor(level) => {
            let level = level as u32;
            let part = part_type.slice_part() as u32;
            if part == 0 {
                // parity: as long as data part 1
                chunk_blocks.div_ceil(level)
            } else {
                (chunk_blocks + level - part) / level
            }
        }
        SliceType::Ec(k, _) => {
            let k = k as u32;
            let part = part_type.slice_part() as u32;
            if part >= k {
                chunk_blocks.div_ceil(k)
            } else {
                (chunk_blocks + k - 1 - part) / k
            }
        }
    }
}

/// Expected file size of a part with `blocks` blocks; any other size on
/// disk renders the part invalid.
pub fn expected_file_size(format: ChunkFormat, blocks: u32) -> u64 {
    match format {
        ChunkFormat::Legacy => LEGACY_DATA_OFFSET + blocks as u64 * BLOCK_SIZE as u64,
        ChunkFormat::Interleaved => blocks as u64 * (BLOCK_SIZE as u64 + CRC_SIZE as u64),
    }
}

/// Derive the block count back from a file size, refusing sizes that no
/// valid part can have.
pub fn blocks_from_file_size(format: ChunkFormat, file_size: u64) -> Result<u32, Error> {
    let blocks = match format {
        ChunkFormat::Legacy => {
            if file_size < LEGACY_DATA_OFFSET {
                bail!("legacy chunk file shorter than its header ({} bytes)", file_size);
            }
            let data = file_size - LEGACY_DATA_OFFSET;
            if data % BLOCK_SIZE as u64 != 0 {
                bail!("legacy chunk file has a partial block ({} bytes)", file_size);
            }
            data / BLOCK_SIZE as u64
        }
        ChunkFormat::Interleaved => {
            let stride = BLOCK_SIZE as u64 + CRC_SIZE as u64;
            if file_size % stride != 0 {
                bail!("interleaved chunk file has a partial block ({} bytes)", file_size);
            }
            file_size / stride
        }
    };
    if blocks > BLOCKS_PER_CHUNK as u64 {
        bail!("chunk file holds {} blocks, more than a chunk can have", blocks);
    }
    Ok(blocks as u32)
}

/// Byte offset of a block's data inside the file.
pub fn data_offset(format: ChunkFormat, block: u32) -> u64 {
    match format {
        ChunkFormat::Legacy => LEGACY_DATA_OFFSET + block as u64 * BLOCK_SIZE as u64,
        ChunkFormat::Interleaved => block as u64 * BLOCK_SIZE as u64,
    }
}

/// Byte offset of a block's CRC inside the file.
///
/// For the interleaved format the trailing index starts after the last
/// block, so the offset depends on the file's current block count.
pub fn crc_offset(format: ChunkFormat, block: u32, total_blocks: u32) -> u64 {
    match format {
        ChunkFormat::Legacy => SIGNATURE_AREA_SIZE + block as u64 * CRC_SIZE as u64,
        ChunkFormat::Interleaved => {
            total_blocks as u64 * BLOCK_SIZE as u64 + block as u64 * CRC_SIZE as u64
        }
    }
}

/// File name of a chunk part, e.g. `chunk_xor3_2_0000000000000042_00000001.dat`.
pub fn part_file_name(chunk_id: ChunkId, version: ChunkVersion, part_type: ChunkPartType) -> String {
    match part_type.slice_type() {
        SliceType::Standard => format!("chunk_{:016X}_{:08X}.dat", chunk_id.0, version),
        SliceType::Xor(level) => format!(
            "chunk_xor{}_{}_{:016X}_{:08X}.dat",
            level,
            part_type.slice_part(),
            chunk_id.0,
            version
        ),
        SliceType::Ec(k, m) => format!(
            "chunk_ec_{}_{}_{}_{:016X}_{:08X}.dat",
            k,
            m,
            part_type.slice_part(),
            chunk_id.0,
            version
        ),
    }
}

/// Parse a part file name back into its identity.
pub fn parse_part_file_name(name: &str) -> Option<(ChunkId, ChunkVersion, ChunkPartType)> {
    let stem = name.strip_prefix("chunk_")?.strip_suffix(".dat")?;
    let fields: Vec<&str> = stem.split('_').collect();
    let (part_type, id_hex, version_hex) = match fields.as_slice() {
        [id, version] => (ChunkPartType::standard(), *id, *version),
        [xor, part, id, version] if xor.starts_with("xor") => {
            let level: u8 = xor[3..].parse().ok()?;
            let part: usize = part.parse().ok()?;
            let cpt = ChunkPartType::new(SliceType::xor(level).ok()?, part).ok()?;
            (cpt, *id, *version)
        }
        ["ec", k, m, part, id, version] => {
            let k: u8 = k.parse().ok()?;
            let m: u8 = m.parse().ok()?;
            let part: usize = part.parse().ok()?;
            let cpt = ChunkPartType::new(SliceType::ec(k, m).ok()?, part).ok()?;
            (cpt, *id, *version)
        }
        _ => return None,
    };
    if id_hex.len() != 16 || version_hex.len() != 8 {
        return None;
    }
    let chunk_id = ChunkId(u64::from_str_radix(id_hex, 16).ok()?);
    let version = u32::from_str_radix(version_hex, 16).ok()?;
    Some((chunk_id, version, part_type))
}

/// Path of a part file relative to its folder root: 256-way fan-out by
/// `chunk id mod 256`.
pub fn part_file_path(
    folder: &Path,
    chunk_id: ChunkId,
    version: ChunkVersion,
    part_type: ChunkPartType,
) -> PathBuf {
    let mut path = folder.to_path_buf();
    path.push(format!("{:02X}", chunk_id.0 % 256));
    path.push(part_file_name(chunk_id, version, part_type));
    path
}
