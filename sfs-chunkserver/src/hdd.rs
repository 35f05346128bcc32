//! Disk-backed chunk part operations.
//!
//! All operations return [`Status`] errors with the wire-stable codes; the
//! surrounding job pool forwards them verbatim to the requesting peer.
//! Mutating operations hold the chunk entry lock for their whole duration,
//! which makes each of them atomic with respect to readers of the same
//! part.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Error;

use sfs_proto::RegisterSpace;
use sfs_tools::crc::{crc, zero_block_crc};
use sfs_tools::output_buffer::OutputBuffer;
use sfs_types::{
    ChunkId, ChunkPartType, ChunkVersion, ChunkWithVersionAndType, SliceType, Status,
    BLOCKS_PER_CHUNK, BLOCK_SIZE, CRC_SIZE,
};

use crate::chunk::{ChunkEntry, ChunkHandle, ChunkRegistry, ChunkState};
use crate::folder::Folder;
use crate::format::{
    self, blocks_from_file_size, crc_offset, data_offset, expected_file_size, part_blocks,
    ChunkFormat, ChunkSignature,
};

#[derive(Default)]
struct Reports {
    damaged: Vec<ChunkWithVersionAndType>,
    lost: Vec<ChunkWithVersionAndType>,
    new_chunks: Vec<ChunkWithVersionAndType>,
}

pub struct HddManager {
    registry: ChunkRegistry,
    folders: Vec<Mutex<Folder>>,
    reports: Mutex<Reports>,
    last_space_report: Mutex<Option<RegisterSpace>>,
}

impl HddManager {
    pub fn new() -> Self {
        Self {
            registry: ChunkRegistry::new(),
            folders: Vec::new(),
            reports: Mutex::new(Reports::default()),
            last_space_report: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &ChunkRegistry {
        &self.registry
    }

    /// Attach a disk, creating the fan-out directories and scanning any
    /// chunk part files already present.
    pub fn add_folder(&mut self, root: impl AsRef<Path>) -> Result<usize, Error> {
        let folder = Folder::new(root.as_ref());
        folder.prepare()?;
        let index = self.folders.len();
        self.folders.push(Mutex::new(folder));
        self.scan_folder(index)?;
        Ok(index)
    }

    fn scan_folder(&self, folder_index: usize) -> Result<(), Error> {
        let root = self.folders[folder_index].lock().unwrap().root().to_path_buf();
        for entry in walkdir::WalkDir::new(&root).min_depth(2).max_depth(2) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let Some((id, version, part_type)) = format::parse_part_file_name(&name) else {
                continue;
            };
            match self.scan_part_file(entry.path(), id, version, part_type, folder_index) {
                Ok(()) => {}
                Err(err) => {
                    log::warn!("scan: refusing chunk file {:?} - {}", entry.path(), err);
                    self.report_damaged(ChunkWithVersionAndType::new(id, version, part_type));
                }
            }
        }
        Ok(())
    }

    fn scan_part_file(
        &self,
        path: &Path,
        id: ChunkId,
        version: ChunkVersion,
        part_type: ChunkPartType,
        folder_index: usize,
    ) -> Result<(), Error> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let (chunk_format, signature) = match ChunkSignature::read_from(&file)? {
            Some(signature) => (ChunkFormat::Legacy, Some(signature)),
            None => (ChunkFormat::Interleaved, None),
        };
        if let Some(signature) = signature {
            if signature.chunk_id != id
                || signature.version != version
                || signature.part_type != part_type
            {
                anyhow::bail!(
                    "signature {}/{:08X}/{} does not match file name",
                    signature.chunk_id,
                    signature.version,
                    signature.part_type
                );
            }
        }
        let blocks = blocks_from_file_size(chunk_format, file_size)?;
        let entry = ChunkEntry {
            id,
            version,
            part_type,
            state: ChunkState::Available,
            format: chunk_format,
            blocks,
            folder: folder_index,
            refcount: 0,
            signature_verified: signature.is_some(),
        };
        if self.registry.insert(entry).is_err() {
            anyhow::bail!("duplicate part {} {}", id, part_type);
        }
        self.folders[folder_index].lock().unwrap().note_chunk_added();
        Ok(())
    }

    fn report_damaged(&self, chunk: ChunkWithVersionAndType) {
        log::warn!("marking {} as damaged", chunk);
        self.reports.lock().unwrap().damaged.push(chunk);
    }

    fn report_lost(&self, chunk: ChunkWithVersionAndType) {
        self.reports.lock().unwrap().lost.push(chunk);
    }

    fn report_new(&self, chunk: ChunkWithVersionAndType) {
        self.reports.lock().unwrap().new_chunks.push(chunk);
    }

    pub fn take_damaged(&self) -> Vec<ChunkWithVersionAndType> {
        std::mem::take(&mut self.reports.lock().unwrap().damaged)
    }

    pub fn take_lost(&self) -> Vec<ChunkWithVersionAndType> {
        std::mem::take(&mut self.reports.lock().unwrap().lost)
    }

    pub fn take_new_chunks(&self) -> Vec<ChunkWithVersionAndType> {
        std::mem::take(&mut self.reports.lock().unwrap().new_chunks)
    }

    fn folder_root(&self, index: usize) -> std::path::PathBuf {
        self.folders[index].lock().unwrap().root().to_path_buf()
    }

    /// Pick the folder with the most free space for a new part.
    fn pick_folder(&self) -> Result<usize, Status> {
        let mut best: Option<(usize, u64)> = None;
        for (index, folder) in self.folders.iter().enumerate() {
            let folder = folder.lock().unwrap();
            if folder.to_delete || folder.damaged {
                continue;
            }
            let Ok(usage) = folder.space_usage() else {
                continue;
            };
            let free = usage.total.saturating_sub(usage.used);
            if best.map_or(true, |(_, best_free)| free > best_free) {
                best = Some((index, free));
            }
        }
        best.map(|(index, _)| index).ok_or(Status::NoSpace)
    }

    fn handle(&self, id: ChunkId, part_type: ChunkPartType) -> Result<ChunkHandle, Status> {
        self.registry.get(id, part_type).ok_or(Status::NoSuchChunk)
    }

    fn open_file(&self, chunk: &ChunkEntry, write: bool) -> Result<File, Status> {
        let path = chunk.file_path(&self.folder_root(chunk.folder));
        OpenOptions::new()
            .read(true)
            .write(write)
            .open(&path)
            .map_err(|err| {
                log::error!("open {:?} failed - {}", path, err);
                self.note_io_error(chunk, err.raw_os_error().unwrap_or(0));
                Status::Io
            })
    }

    fn note_io_error(&self, chunk: &ChunkEntry, errno: i32) {
        self.folders[chunk.folder].lock().unwrap().note_error(
            Some(ChunkWithVersionAndType::new(
                chunk.id,
                chunk.version,
                chunk.part_type,
            )),
            errno,
        );
    }

    /// Open a chunk part for reading or writing. The first open verifies
    /// the on-disk signature against the registration; a mismatch refuses
    /// the open and reports the part as damaged.
    pub fn open(&self, id: ChunkId, part_type: ChunkPartType) -> Result<(), Status> {
        let handle = self.handle(id, part_type)?;
        let mut chunk = handle.lock().unwrap();
        if chunk.state == ChunkState::ToBeDeleted {
            return Err(Status::NoSuchChunk);
        }
        if !chunk.signature_verified && chunk.format == ChunkFormat::Legacy {
            let file = self.open_file(&chunk, false)?;
            let signature = ChunkSignature::read_from(&file).map_err(|_| Status::Io)?;
            let expected = ChunkSignature::new(chunk.id, chunk.version, chunk.part_type);
            if signature != Some(expected) {
                drop(file);
                self.report_damaged(ChunkWithVersionAndType::new(
                    chunk.id,
                    chunk.version,
                    chunk.part_type,
                ));
                return Err(Status::Io);
            }
            chunk.signature_verified = true;
        }
        chunk.refcount += 1;
        Ok(())
    }

    pub fn close(&self, id: ChunkId, part_type: ChunkPartType) -> Result<(), Status> {
        let handle = self.handle(id, part_type)?;
        let mut chunk = handle.lock().unwrap();
        if chunk.refcount == 0 {
            return Err(Status::NoSuchChunk);
        }
        chunk.refcount -= 1;
        if chunk.refcount == 0 && chunk.state == ChunkState::ToBeDeleted {
            let path = chunk.file_path(&self.folder_root(chunk.folder));
            if let Err(err) = std::fs::remove_file(&path) {
                log::warn!("deferred delete of {:?} failed - {}", path, err);
            }
            let folder = chunk.folder;
            let (chunk_id, part) = (chunk.id, chunk.part_type);
            drop(chunk);
            self.registry.remove(chunk_id, part);
            self.folders[folder].lock().unwrap().note_chunk_removed();
        }
        Ok(())
    }

    /// Create an empty chunk part.
    pub fn create(
        &self,
        id: ChunkId,
        version: ChunkVersion,
        part_type: ChunkPartType,
        chunk_format: ChunkFormat,
    ) -> Result<(), Status> {
        if self.registry.get(id, part_type).is_some() {
            return Err(Status::ChunkExists);
        }
        let folder_index = self.pick_folder()?;
        let root = self.folder_root(folder_index);
        let path = format::part_file_path(&root, id, version, part_type);
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                log::error!("create {:?} failed - {}", path, err);
                Status::Io
            })?;
        if chunk_format == ChunkFormat::Legacy {
            let result = ChunkSignature::new(id, version, part_type)
                .write_to(&file)
                .and_then(|()| {
                    file.set_len(format::LEGACY_DATA_OFFSET)?;
                    Ok(())
                });
            if result.is_err() {
                let _ = std::fs::remove_file(&path);
                return Err(Status::Io);
            }
        }
        let entry = ChunkEntry {
            id,
            version,
            part_type,
            state: ChunkState::Available,
            format: chunk_format,
            blocks: 0,
            folder: folder_index,
            refcount: 0,
            signature_verified: true,
        };
        if self.registry.insert(entry).is_err() {
            let _ = std::fs::remove_file(&path);
            return Err(Status::ChunkExists);
        }
        self.folders[folder_index].lock().unwrap().note_chunk_added();
        self.report_new(ChunkWithVersionAndType::new(id, version, part_type));
        Ok(())
    }

    /// Delete a chunk part; deferred to the last close while handles are
    /// open.
    pub fn delete(
        &self,
        id: ChunkId,
        version: ChunkVersion,
        part_type: ChunkPartType,
    ) -> Result<(), Status> {
        let handle = self.handle(id, part_type)?;
        let mut chunk = handle.lock().unwrap();
        if version != 0 && chunk.version != version {
            return Err(Status::WrongVersion);
        }
        if chunk.refcount > 0 {
            chunk.state = ChunkState::ToBeDeleted;
            return Ok(());
        }
        let path = chunk.file_path(&self.folder_root(chunk.folder));
        let folder = chunk.folder;
        let (chunk_id, part) = (chunk.id, chunk.part_type);
        drop(chunk);
        self.registry.remove(chunk_id, part);
        self.folders[folder].lock().unwrap().note_chunk_removed();
        std::fs::remove_file(&path).map_err(|err| {
            log::warn!("delete {:?} failed - {}", path, err);
            Status::Io
        })
    }

    fn read_block_checked(
        &self,
        chunk: &ChunkEntry,
        file: &File,
        block: u32,
    ) -> Result<(Vec<u8>, u32), Status> {
        let mut data = vec![0u8; BLOCK_SIZE as usize];
        file.read_exact_at(&mut data, data_offset(chunk.format, block))
            .map_err(|err| {
                self.note_io_error(chunk, err.raw_os_error().unwrap_or(0));
                Status::Io
            })?;
        let mut stored_crc = [0u8; CRC_SIZE as usize];
        file.read_exact_at(&mut stored_crc, crc_offset(chunk.format, block, chunk.blocks))
            .map_err(|err| {
                self.note_io_error(chunk, err.raw_os_error().unwrap_or(0));
                Status::Io
            })?;
        let stored_crc = u32::from_le_bytes(stored_crc);
        if crc(0, &data) != stored_crc {
            self.report_damaged(ChunkWithVersionAndType::new(
                chunk.id,
                chunk.version,
                chunk.part_type,
            ));
            return Err(Status::Crc);
        }
        Ok((data, stored_crc))
    }

    /// Serve `size` bytes starting at `offset` of a part, writing one CRC
    /// followed by the data fragment per touched block into `output`.
    /// Every touched block's stored CRC is verified against its data.
    pub fn read(
        &self,
        id: ChunkId,
        version: ChunkVersion,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
        output: &mut OutputBuffer,
    ) -> Result<(), Status> {
        let handle = self.handle(id, part_type)?;
        let chunk = handle.lock().unwrap();
        if chunk.version != version {
            return Err(Status::WrongVersion);
        }
        // blocks beyond the written count read as zeros, like any sparse
        // file; the capacity of the part itself is the hard limit
        let capacity = part_blocks(part_type, BLOCKS_PER_CHUNK) * BLOCK_SIZE;
        if offset >= capacity && !(offset == 0 && size == 0) {
            return Err(Status::WrongOffset);
        }
        if size == 0 {
            return Ok(());
        }
        if offset.checked_add(size).map_or(true, |end| end > capacity) {
            return Err(Status::WrongSize);
        }
        let file = self.open_file(&chunk, false)?;
        let first_block = offset / BLOCK_SIZE;
        let last_block = (offset + size - 1) / BLOCK_SIZE;
        let mut bytes_served = 0u64;
        for block in first_block..=last_block {
            let (data, stored_crc) = if block < chunk.blocks {
                self.read_block_checked(&chunk, &file, block)?
            } else {
                (vec![0u8; BLOCK_SIZE as usize], zero_block_crc(0, BLOCK_SIZE))
            };
            let block_start = block * BLOCK_SIZE;
            let from = offset.max(block_start) - block_start;
            let to = (offset + size).min(block_start + BLOCK_SIZE) - block_start;
            let fragment = &data[from as usize..to as usize];
            let fragment_crc = if from == 0 && to == BLOCK_SIZE {
                stored_crc
            } else {
                crc(0, fragment)
            };
            output
                .copy_in_mem(&fragment_crc.to_le_bytes())
                .map_err(|_| Status::Io)?;
            output.copy_in_mem(fragment).map_err(|_| Status::Io)?;
            bytes_served += fragment.len() as u64;
        }
        self.folders[chunk.folder].lock().unwrap().note_read(bytes_served);
        Ok(())
    }

    /// Rewrite the interleaved trailing CRC index when the block count
    /// changes.
    fn resize_interleaved(
        &self,
        chunk: &ChunkEntry,
        file: &File,
        old_blocks: u32,
        new_blocks: u32,
    ) -> Result<Vec<u32>, Status> {
        let mut crcs = Vec::with_capacity(new_blocks as usize);
        let mut index = vec![0u8; (old_blocks * CRC_SIZE) as usize];
        file.read_exact_at(&mut index, old_blocks as u64 * BLOCK_SIZE as u64)
            .map_err(|_| Status::Io)?;
        for i in 0..old_blocks.min(new_blocks) as usize {
            crcs.push(u32::from_le_bytes(
                index[i * 4..i * 4 + 4].try_into().unwrap(),
            ));
        }
        while crcs.len() < new_blocks as usize {
            crcs.push(zero_block_crc(0, BLOCK_SIZE));
        }
        Ok(crcs)
    }

    fn write_crc_index(&self, file: &File, crcs: &[u32], format: ChunkFormat) -> Result<(), Status> {
        let total = crcs.len() as u32;
        for (block, block_crc) in crcs.iter().enumerate() {
            file.write_all_at(
                &block_crc.to_le_bytes(),
                crc_offset(format, block as u32, total),
            )
            .map_err(|_| Status::Io)?;
        }
        Ok(())
    }

    fn grow_blocks(&self, chunk: &mut ChunkEntry, file: &File, new_blocks: u32) -> Result<(), Status> {
        let old_blocks = chunk.blocks;
        match chunk.format {
            ChunkFormat::Legacy => {
                file.set_len(expected_file_size(ChunkFormat::Legacy, new_blocks))
                    .map_err(|_| Status::Io)?;
                let zero_crc = zero_block_crc(0, BLOCK_SIZE);
                for block in old_blocks..new_blocks {
                    file.write_all_at(
                        &zero_crc.to_le_bytes(),
                        crc_offset(ChunkFormat::Legacy, block, new_blocks),
                    )
                    .map_err(|_| Status::Io)?;
                }
            }
            ChunkFormat::Interleaved => {
                let crcs = self.resize_interleaved(chunk, file, old_blocks, new_blocks)?;
                file.set_len(expected_file_size(ChunkFormat::Interleaved, new_blocks))
                    .map_err(|_| Status::Io)?;
                self.write_crc_index(file, &crcs, ChunkFormat::Interleaved)?;
            }
        }
        chunk.blocks = new_blocks;
        Ok(())
    }

    /// Write a byte range of one block. The provided CRC covers exactly
    /// the written bytes; the stored per-block CRC is updated. The block
    /// count may grow.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        id: ChunkId,
        version: ChunkVersion,
        part_type: ChunkPartType,
        block: u32,
        offset: u32,
        size: u32,
        data_crc: u32,
        data: &[u8],
    ) -> Result<(), Status> {
        let handle = self.handle(id, part_type)?;
        let mut chunk = handle.lock().unwrap();
        if chunk.version != version && version != 0 {
            return Err(Status::WrongVersion);
        }
        if block >= part_blocks(part_type, BLOCKS_PER_CHUNK) {
            return Err(Status::WrongBlockNumber);
        }
        if offset + size > BLOCK_SIZE || size as usize != data.len() {
            return Err(Status::WrongOffset);
        }
        if crc(0, data) != data_crc {
            return Err(Status::Crc);
        }
        let file = self.open_file(&chunk, true)?;
        if block >= chunk.blocks {
            self.grow_blocks(&mut chunk, &file, block + 1)?;
        }
        let new_crc = if offset == 0 && size == BLOCK_SIZE {
            data_crc
        } else {
            // partial write: patch the block in memory to update its CRC
            let (mut old, _) = self.read_block_checked(&chunk, &file, block)?;
            old[offset as usize..(offset + size) as usize].copy_from_slice(data);
            crc(0, &old)
        };
        file.write_all_at(data, data_offset(chunk.format, block) + offset as u64)
            .map_err(|err| {
                self.note_io_error(&chunk, err.raw_os_error().unwrap_or(0));
                Status::Io
            })?;
        file.write_all_at(
            &new_crc.to_le_bytes(),
            crc_offset(chunk.format, block, chunk.blocks),
        )
        .map_err(|_| Status::Io)?;
        self.folders[chunk.folder].lock().unwrap().note_write(size as u64);
        Ok(())
    }

    fn rename_to_version(&self, chunk: &mut ChunkEntry, new_version: ChunkVersion) -> Result<(), Status> {
        let root = self.folder_root(chunk.folder);
        let old_path = chunk.file_path(&root);
        let new_path = format::part_file_path(&root, chunk.id, new_version, chunk.part_type);
        std::fs::rename(&old_path, &new_path).map_err(|err| {
            log::error!("rename {:?} -> {:?} failed - {}", old_path, new_path, err);
            Status::Io
        })?;
        if chunk.format == ChunkFormat::Legacy {
            let file = OpenOptions::new()
                .write(true)
                .open(&new_path)
                .map_err(|_| Status::Io)?;
            ChunkSignature::new(chunk.id, new_version, chunk.part_type)
                .write_to(&file)
                .map_err(|_| Status::Io)?;
        }
        chunk.version = new_version;
        Ok(())
    }

    /// Atomically move a part to a new version. The registry key does not
    /// change, so readers looking up `(id, part type)` observe either the
    /// old or the new version, never a half-renamed part.
    pub fn set_version(
        &self,
        id: ChunkId,
        version: ChunkVersion,
        new_version: ChunkVersion,
        part_type: ChunkPartType,
    ) -> Result<(), Status> {
        let handle = self.handle(id, part_type)?;
        let mut chunk = handle.lock().unwrap();
        if chunk.version != version {
            return Err(Status::WrongVersion);
        }
        self.rename_to_version(&mut chunk, new_version)
    }

    /// Truncate the part to match a chunk-level length, zero-padding the
    /// cut data block and refreshing its CRC with the zero-run shortcut.
    pub fn truncate(
        &self,
        id: ChunkId,
        part_type: ChunkPartType,
        version: ChunkVersion,
        new_version: ChunkVersion,
        chunk_length: u64,
    ) -> Result<(), Status> {
        if chunk_length > sfs_types::CHUNK_SIZE {
            return Err(Status::WrongSize);
        }
        let handle = self.handle(id, part_type)?;
        let mut chunk = handle.lock().unwrap();
        if chunk.version != version {
            return Err(Status::WrongVersion);
        }
        let chunk_blocks = chunk_length.div_ceil(BLOCK_SIZE as u64) as u32;
        let new_blocks = part_blocks(part_type, chunk_blocks);
        let file = self.open_file(&chunk, true)?;
        if new_blocks > chunk.blocks {
            self.grow_blocks(&mut chunk, &file, new_blocks)?;
        } else if new_blocks < chunk.blocks {
            match chunk.format {
                ChunkFormat::Legacy => {
                    file.set_len(expected_file_size(ChunkFormat::Legacy, new_blocks))
                        .map_err(|_| Status::Io)?;
                }
                ChunkFormat::Interleaved => {
                    let crcs = self.resize_interleaved(&chunk, &file, chunk.blocks, new_blocks)?;
                    file.set_len(expected_file_size(ChunkFormat::Interleaved, new_blocks))
                        .map_err(|_| Status::Io)?;
                    self.write_crc_index(&file, &crcs, ChunkFormat::Interleaved)?;
                }
            }
            chunk.blocks = new_blocks;
        }
        // zero the tail of the cut block if this part owns it
        let cut = (chunk_length % BLOCK_SIZE as u64) as u32;
        if cut != 0 && chunk_blocks > 0 {
            if let Some(local_block) = owning_local_block(part_type, chunk_blocks - 1) {
                if local_block < chunk.blocks {
                    let (data, _) = self.read_block_checked(&chunk, &file, local_block)?;
                    let zeros = vec![0u8; (BLOCK_SIZE - cut) as usize];
                    file.write_all_at(
                        &zeros,
                        data_offset(chunk.format, local_block) + cut as u64,
                    )
                    .map_err(|_| Status::Io)?;
                    let new_crc = zero_block_crc(crc(0, &data[..cut as usize]), BLOCK_SIZE - cut);
                    file.write_all_at(
                        &new_crc.to_le_bytes(),
                        crc_offset(chunk.format, local_block, chunk.blocks),
                    )
                    .map_err(|_| Status::Io)?;
                }
            }
        }
        drop(file);
        self.rename_to_version(&mut chunk, new_version)
    }

    /// Copy a part into a new chunk id, used by snapshotting.
    pub fn duplicate(
        &self,
        id: ChunkId,
        version: ChunkVersion,
        part_type: ChunkPartType,
        copy_id: ChunkId,
        copy_version: ChunkVersion,
    ) -> Result<(), Status> {
        let handle = self.handle(id, part_type)?;
        let chunk = handle.lock().unwrap();
        if chunk.version != version {
            return Err(Status::WrongVersion);
        }
        if self.registry.get(copy_id, part_type).is_some() {
            return Err(Status::ChunkExists);
        }
        let folder_index = self.pick_folder()?;
        let src_path = chunk.file_path(&self.folder_root(chunk.folder));
        let dst_path = format::part_file_path(
            &self.folder_root(folder_index),
            copy_id,
            copy_version,
            part_type,
        );
        std::fs::copy(&src_path, &dst_path).map_err(|err| {
            log::error!("duplicate {:?} -> {:?} failed - {}", src_path, dst_path, err);
            Status::Io
        })?;
        let entry = ChunkEntry {
            id: copy_id,
            version: copy_version,
            part_type,
            state: ChunkState::Available,
            format: chunk.format,
            blocks: chunk.blocks,
            folder: folder_index,
            refcount: 0,
            signature_verified: false,
        };
        if chunk.format == ChunkFormat::Legacy {
            let file = OpenOptions::new()
                .write(true)
                .open(&dst_path)
                .map_err(|_| Status::Io)?;
            ChunkSignature::new(copy_id, copy_version, part_type)
                .write_to(&file)
                .map_err(|_| Status::Io)?;
        }
        if self.registry.insert(entry).is_err() {
            let _ = std::fs::remove_file(&dst_path);
            return Err(Status::ChunkExists);
        }
        self.folders[folder_index].lock().unwrap().note_chunk_added();
        self.report_new(ChunkWithVersionAndType::new(copy_id, copy_version, part_type));
        Ok(())
    }

    /// Duplicate and truncate the copy in one operation.
    #[allow(clippy::too_many_arguments)]
    pub fn duptrunc(
        &self,
        id: ChunkId,
        version: ChunkVersion,
        part_type: ChunkPartType,
        copy_id: ChunkId,
        copy_version: ChunkVersion,
        chunk_length: u64,
    ) -> Result<(), Status> {
        self.duplicate(id, version, part_type, copy_id, copy_version)?;
        match self.truncate(copy_id, part_type, copy_version, copy_version, chunk_length) {
            Ok(()) => Ok(()),
            Err(status) => {
                let _ = self.delete(copy_id, copy_version, part_type);
                Err(status)
            }
        }
    }

    /// Verify every block CRC of a part; a failure reports the part
    /// damaged.
    pub fn test(
        &self,
        id: ChunkId,
        version: ChunkVersion,
        part_type: ChunkPartType,
    ) -> Result<(), Status> {
        let handle = self.handle(id, part_type)?;
        let chunk = handle.lock().unwrap();
        if chunk.version != version {
            return Err(Status::WrongVersion);
        }
        let file = self.open_file(&chunk, false)?;
        for block in 0..chunk.blocks {
            self.read_block_checked(&chunk, &file, block)?;
        }
        Ok(())
    }

    /// Mark a part lost after an unrecoverable disk error.
    pub fn mark_lost(&self, id: ChunkId, part_type: ChunkPartType) {
        if let Some(handle) = self.registry.remove(id, part_type) {
            let chunk = handle.lock().unwrap();
            self.folders[chunk.folder].lock().unwrap().note_chunk_removed();
            self.report_lost(ChunkWithVersionAndType::new(
                chunk.id,
                chunk.version,
                chunk.part_type,
            ));
        }
    }

    /// Aggregate space report over all folders.
    pub fn space_report(&self) -> RegisterSpace {
        let mut report = RegisterSpace {
            used: 0,
            total: 0,
            chunk_count: 0,
            td_used: 0,
            td_total: 0,
            td_chunk_count: 0,
        };
        for folder in &self.folders {
            let folder = folder.lock().unwrap();
            let Ok(usage) = folder.space_usage() else {
                continue;
            };
            if folder.to_delete {
                report.td_used += usage.used;
                report.td_total += usage.total;
                report.td_chunk_count += usage.chunk_count;
            } else {
                report.used += usage.used;
                report.total += usage.total;
                report.chunk_count += usage.chunk_count;
            }
        }
        report
    }

    /// Space report, but only when something changed since the last one.
    pub fn space_report_if_changed(&self) -> Option<RegisterSpace> {
        let report = self.space_report();
        let mut last = self.last_space_report.lock().unwrap();
        if last.as_ref() == Some(&report) {
            return None;
        }
        *last = Some(report.clone());
        Some(report)
    }
}

impl Default for HddManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The local block index of the chunk-level block `chunk_block` inside
/// `part_type`, or `None` when the part does not store that block.
fn owning_local_block(part_type: ChunkPartType, chunk_block: u32) -> Option<u32> {
    match part_type.slice_type() {
        SliceType::Standard => Some(chunk_block),
        SliceType::Xor(level) => {
            let level = level as u32;
            let part = part_type.slice_part() as u32;
            if part == 0 {
                // parity content is recomputed by the writer
                None
            } else if chunk_block % level + 1 == part {
                Some(chunk_block / level)
            } else {
                None
            }
        }
        SliceType::Ec(k, _) => {
            let k = k as u32;
            let part = part_type.slice_part() as u32;
            if part < k && chunk_block % k == part {
                Some(chunk_block / k)
            } else {
                None
            }
        }
    }
}
