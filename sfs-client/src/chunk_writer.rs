//! The chunk writer: buffers dirty blocks, groups them into stripe
//! operations, computes parity on the fly and pushes everything through
//! one write chain per part type, under the chunk's write lock.
//!
//! One writer instance handles one chunk write session. The caller feeds
//! bytes with [`ChunkWriter::write`], pumps the network with
//! [`ChunkWriter::process_operations`] and ends the session with
//! [`ChunkWriter::finish`], which releases the lock with the authoritative
//! file length. A failed session surfaces one recoverable error; the
//! retry loop in [`write_to_chunk`] decides how often to start over.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};
use reed_solomon_erasure::galois_8::ReedSolomon;

use sfs_tools::crc::crc;
use sfs_tools::time::Deadline;
use sfs_types::{ChunkPartType, SliceType, Status, BLOCKS_PER_CHUNK, BLOCK_SIZE, CHUNK_SIZE};

use crate::error::ChunkError;
use crate::locator::{ChunkLocator, WriteLock};
use crate::write_cache::{BlockType, CacheBlockBudget, WriteCacheBlock};
use crate::write_executor::WriteExecutor;

#[derive(Clone, Copy, Debug)]
pub struct WriteConfig {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// Maximum in-flight data packets per chain.
    pub write_window_size: usize,
    /// A partial stripe older than this is flushed even without an
    /// explicit flush.
    pub max_age_in_journal: Duration,
    pub max_retries: u32,
    pub retry_base_sleep: Duration,
    pub retry_max_sleep: Duration,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(5),
            write_window_size: 16,
            max_age_in_journal: Duration::from_secs(2),
            max_retries: 5,
            retry_base_sleep: Duration::from_millis(100),
            retry_max_sleep: Duration::from_secs(5),
        }
    }
}

/// Source of current block contents, used to complete partial stripes
/// before computing parity. Blocks beyond the file length are zeros and
/// are never requested.
pub trait BlockSource: Send + Sync {
    fn read_block(&self, chunk_index: u32, block: u32) -> Result<Vec<u8>, ChunkError>;
}

/// The redundancy slices the writer has to keep consistent, derived from
/// the granted part locations.
#[derive(Debug, Default)]
struct SliceSet {
    standard: bool,
    xor_level: Option<u8>,
    ec: Option<(u8, u8)>,
}

impl SliceSet {
    /// Width of a stripe: parity is computed over this many data blocks.
    fn stripe_width(&self) -> u32 {
        let xor = self.xor_level.unwrap_or(1) as u32;
        let ec = self.ec.map(|(k, _)| k).unwrap_or(1) as u32;
        xor.max(ec)
    }
}

struct JournalEntry {
    serial: u64,
    block: WriteCacheBlock,
    born: Instant,
    in_operation: bool,
}

struct Operation {
    unfinished_writes: usize,
    serials: Vec<u64>,
    offset_of_end: u64,
}

pub struct ChunkWriter {
    config: WriteConfig,
    locator: Arc<dyn ChunkLocator>,
    block_source: Option<Arc<dyn BlockSource>>,
    inode: u32,
    chunk_index: u32,
    lock: Option<WriteLock>,
    slices: SliceSet,
    executors: BTreeMap<ChunkPartType, WriteExecutor>,
    journal: VecDeque<JournalEntry>,
    pending_writes: HashMap<u32, u64>,
    operations: HashMap<u64, Operation>,
    id_counter: u32,
    operation_counter: u64,
    accepts_new_operations: bool,
    file_length: u64,
    /// Set by a truncate; overrides the computed length at release time.
    authoritative_length: Option<u64>,
    serial_counter: u64,
    /// Shared cache block budget of the mount agent, when one is set.
    budget: Option<Arc<CacheBlockBudget>>,
    budget_held: u64,
}

impl ChunkWriter {
    pub fn new(
        locator: Arc<dyn ChunkLocator>,
        block_source: Option<Arc<dyn BlockSource>>,
        inode: u32,
        chunk_index: u32,
        config: WriteConfig,
    ) -> Self {
        Self {
            config,
            locator,
            block_source,
            inode,
            chunk_index,
            lock: None,
            slices: SliceSet::default(),
            executors: BTreeMap::new(),
            journal: VecDeque::new(),
            pending_writes: HashMap::new(),
            operations: HashMap::new(),
            id_counter: 0,
            operation_counter: 0,
            accepts_new_operations: true,
            file_length: 0,
            authoritative_length: None,
            serial_counter: 0,
            budget: None,
            budget_held: 0,
        }
    }

    /// Draw journal blocks from a shared cache budget; `write` blocks
    /// while the budget refuses new blocks.
    pub fn with_cache_budget(mut self, budget: Arc<CacheBlockBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    fn allocate_write_id(&mut self) -> u32 {
        // id 0 is reserved for the init packet
        self.id_counter += 1;
        self.id_counter
    }

    /// Acquire the write lock and open one chain per part type. Entries
    /// sharing a part type form the chain: the first address is the head,
    /// the rest forward.
    pub fn init(&mut self, previous_lock_id: u32) -> Result<(), ChunkError> {
        let lock = self
            .locator
            .acquire_write(self.inode, self.chunk_index, previous_lock_id)
            .map_err(|err| ChunkError::recoverable(Status::Io, err.to_string()))?;
        self.file_length = lock.file_length;

        let mut chains: BTreeMap<ChunkPartType, Vec<sfs_types::NetworkAddress>> = BTreeMap::new();
        for part in &lock.parts {
            chains.entry(part.part_type).or_default().push(part.address);
        }
        self.slices = derive_slices(chains.keys())?;

        for (part_type, addresses) in chains {
            let mut executor = WriteExecutor::new(
                addresses[0],
                self.config.connect_timeout,
                self.config.response_timeout,
                lock.chunk_id,
                lock.version,
                part_type,
            )?;
            for &address in &addresses[1..] {
                executor.add_chain_server(address);
            }
            executor.send_init()?;
            self.executors.insert(part_type, executor);
        }
        self.lock = Some(lock);
        Ok(())
    }

    pub fn lock_id(&self) -> u32 {
        self.lock.as_ref().map(|lock| lock.lock_id).unwrap_or(0)
    }

    /// Append dirty bytes at `offset` within the chunk. Consecutive small
    /// writes into the same block are absorbed into the unsent packet.
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), ChunkError> {
        if !self.accepts_new_operations {
            return Err(ChunkError::unrecoverable(
                Status::WriteNotStarted,
                "writer no longer accepts data",
            ));
        }
        if offset as u64 + data.len() as u64 > CHUNK_SIZE {
            return Err(ChunkError::unrecoverable(
                Status::WrongOffset,
                "write beyond chunk boundary",
            ));
        }
        let mut cursor = 0usize;
        while cursor < data.len() {
            let absolute = offset + cursor as u32;
            let block_index = absolute / BLOCK_SIZE;
            let from = absolute % BLOCK_SIZE;
            let to = (from + (data.len() - cursor) as u32).min(BLOCK_SIZE);
            let piece = &data[cursor..cursor + (to - from) as usize];

            let absorbed = self
                .journal
                .iter_mut()
                .rev()
                .find(|entry| {
                    entry.block.block_index == block_index
                        && entry.block.block_type == BlockType::Writable
                })
                .map(|entry| entry.block.expand(from, to, piece))
                .unwrap_or(false);
            if !absorbed {
                let mut block =
                    WriteCacheBlock::new(self.chunk_index, block_index, BlockType::Writable);
                if !block.expand(from, to, piece) {
                    return Err(ChunkError::unrecoverable(Status::Einval, "bad write range"));
                }
                if let Some(budget) = &self.budget {
                    budget.acquire(self.budget_held);
                    self.budget_held += 1;
                }
                self.serial_counter += 1;
                self.journal.push_back(JournalEntry {
                    serial: self.serial_counter,
                    block,
                    born: Instant::now(),
                    in_operation: false,
                });
            }
            cursor += (to - from) as usize;
        }
        Ok(())
    }

    /// Blocks waiting in the journal, started or not.
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    pub fn unfinished_operations_count(&self) -> usize {
        self.operations.len()
    }

    pub fn accepts_new_operations(&self) -> bool {
        self.accepts_new_operations
    }

    /// Stop starting new operations; data already started is still
    /// written out.
    pub fn drop_new_operations(&mut self) {
        self.accepts_new_operations = false;
    }

    /// Group journal blocks into stripe operations and start those worth
    /// starting: full stripes always, partial ones on flush or when their
    /// oldest block exceeds the journal age limit.
    pub fn start_new_operations(&mut self, flush: bool) -> Result<u32, ChunkError> {
        if !self.accepts_new_operations && !flush {
            return Ok(0);
        }
        let width = self.slices.stripe_width();
        let mut stripes: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
        for entry in &self.journal {
            if !entry.in_operation {
                stripes
                    .entry(entry.block.block_index / width)
                    .or_default()
                    .push(entry.serial);
            }
        }
        let mut started = 0;
        for (stripe, serials) in stripes {
            let full = self.is_full_stripe(&serials, width);
            let oldest = serials
                .iter()
                .filter_map(|serial| self.journal_entry(*serial))
                .map(|entry| entry.born)
                .min()
                .unwrap();
            if full || flush || oldest.elapsed() > self.config.max_age_in_journal {
                self.start_operation(stripe, serials)?;
                started += 1;
            }
        }
        Ok(started)
    }

    fn journal_entry(&self, serial: u64) -> Option<&JournalEntry> {
        self.journal.iter().find(|entry| entry.serial == serial)
    }

    fn journal_entry_mut(&mut self, serial: u64) -> Option<&mut JournalEntry> {
        self.journal.iter_mut().find(|entry| entry.serial == serial)
    }

    fn is_full_stripe(&self, serials: &[u64], width: u32) -> bool {
        if width == 1 {
            // no parity to compute; a fully dirty block is enough
            return serials.iter().all(|serial| {
                self.journal_entry(*serial)
                    .map(|entry| entry.block.size() == BLOCK_SIZE)
                    .unwrap_or(false)
            });
        }
        serials.len() == width as usize
            && serials.iter().all(|serial| {
                self.journal_entry(*serial)
                    .map(|entry| entry.block.size() == BLOCK_SIZE)
                    .unwrap_or(false)
            })
    }

    /// The full content a chunk block will have after this operation:
    /// journal data overlaid over the current content (read back when the
    /// block already exists, zeros when it lies beyond the file).
    fn full_block_content(&self, block_index: u32, serials: &[u64]) -> Result<Vec<u8>, ChunkError> {
        let mut entries: Vec<&JournalEntry> = serials
            .iter()
            .filter_map(|serial| self.journal_entry(*serial))
            .filter(|entry| entry.block.block_index == block_index)
            .collect();
        entries.sort_by_key(|entry| entry.serial);
        // a full-block entry makes everything before it irrelevant
        let last_full = entries
            .iter()
            .rposition(|entry| entry.block.size() == BLOCK_SIZE);

        let mut base = match last_full {
            Some(index) => {
                let full = entries[index].block.block_data().to_vec();
                entries.drain(..=index);
                full
            }
            None => {
                let block_start =
                    self.chunk_index as u64 * CHUNK_SIZE + block_index as u64 * BLOCK_SIZE as u64;
                if block_start < self.file_length {
                    match &self.block_source {
                        Some(source) => source.read_block(self.chunk_index, block_index)?,
                        None => {
                            return Err(ChunkError::recoverable(
                                Status::Io,
                                "partial stripe needs a block source for parity",
                            ))
                        }
                    }
                } else {
                    vec![0u8; BLOCK_SIZE as usize]
                }
            }
        };
        for entry in entries {
            let block = &entry.block;
            base[block.from as usize..block.to as usize].copy_from_slice(block.data());
        }
        Ok(base)
    }

    fn start_operation(&mut self, stripe: u32, serials: Vec<u64>) -> Result<(), ChunkError> {
        let width = self.slices.stripe_width();
        self.operation_counter += 1;
        let operation_id = self.operation_counter;

        let mut offset_of_end = 0u64;
        let mut packets: Vec<(ChunkPartType, u16, u32, u32, Vec<u8>)> = Vec::new();

        // data packets: the dirty range of every journal block goes to the
        // chains holding that block
        for serial in &serials {
            let entry = self.journal_entry(*serial).unwrap();
            let block = &entry.block;
            offset_of_end = offset_of_end.max(block.offset_in_file() + block.size() as u64);
            let payload = block.data().to_vec();
            if self.slices.standard {
                packets.push((
                    ChunkPartType::standard(),
                    block.block_index as u16,
                    block.from,
                    block.to,
                    payload.clone(),
                ));
            }
            if let Some(level) = self.slices.xor_level {
                let part = (block.block_index % level as u32 + 1) as u8;
                packets.push((
                    ChunkPartType::xor_data(level, part).unwrap(),
                    stripe as u16,
                    block.from,
                    block.to,
                    payload.clone(),
                ));
            }
            if let Some((k, m)) = self.slices.ec {
                let shard = (block.block_index % k as u32) as usize;
                packets.push((
                    ChunkPartType::new(SliceType::Ec(k, m), shard).unwrap(),
                    stripe as u16,
                    block.from,
                    block.to,
                    payload.clone(),
                ));
            }
        }

        // parity packets need the full stripe content
        if self.slices.xor_level.is_some() || self.slices.ec.is_some() {
            let mut stripe_blocks: Vec<Vec<u8>> = Vec::with_capacity(width as usize);
            for block_index in stripe * width..(stripe + 1) * width {
                if block_index >= BLOCKS_PER_CHUNK {
                    stripe_blocks.push(vec![0u8; BLOCK_SIZE as usize]);
                } else {
                    stripe_blocks.push(self.full_block_content(block_index, &serials)?);
                }
            }
            if let Some(level) = self.slices.xor_level {
                let mut parity = vec![0u8; BLOCK_SIZE as usize];
                for data in &stripe_blocks {
                    for (dst, src) in parity.iter_mut().zip(data) {
                        *dst ^= src;
                    }
                }
                packets.push((
                    ChunkPartType::xor_parity(level).unwrap(),
                    stripe as u16,
                    0,
                    BLOCK_SIZE,
                    parity,
                ));
            }
            if let Some((k, m)) = self.slices.ec {
                let rs = ReedSolomon::new(k as usize, m as usize)
                    .map_err(|err| ChunkError::unrecoverable(Status::Einval, format!("{:?}", err)))?;
                let mut shards = stripe_blocks.clone();
                for _ in 0..m {
                    shards.push(vec![0u8; BLOCK_SIZE as usize]);
                }
                rs.encode(&mut shards)
                    .map_err(|err| ChunkError::unrecoverable(Status::Einval, format!("{:?}", err)))?;
                for parity_index in 0..m as usize {
                    packets.push((
                        ChunkPartType::new(SliceType::Ec(k, m), k as usize + parity_index).unwrap(),
                        stripe as u16,
                        0,
                        BLOCK_SIZE,
                        shards[k as usize + parity_index].clone(),
                    ));
                }
            }
        }

        // everything computed; now mark journal blocks read-only and send
        for serial in &serials {
            if let Some(entry) = self.journal_entry_mut(*serial) {
                entry.block.make_read_only();
                entry.in_operation = true;
            }
        }
        let packet_count = packets.len();
        for (part_type, block, from, to, payload) in packets {
            let write_id = self.allocate_write_id();
            self.pending_writes.insert(write_id, operation_id);
            self.wait_for_window(part_type)?;
            let executor = self
                .executors
                .get_mut(&part_type)
                .ok_or_else(|| ChunkError::recoverable(Status::NoChunkServers, format!("no chain for {}", part_type)))?;
            let payload_crc = crc(0, &payload);
            executor.send_data(write_id, block, from, to - from, payload_crc, &payload)?;
        }

        self.operations.insert(
            operation_id,
            Operation {
                unfinished_writes: packet_count,
                serials,
                offset_of_end,
            },
        );
        Ok(())
    }

    /// Backpressure: wait until the chain has room for one more packet.
    fn wait_for_window(&mut self, part_type: ChunkPartType) -> Result<(), ChunkError> {
        let deadline = Deadline::in_duration(self.config.response_timeout);
        loop {
            let pending = self
                .executors
                .get(&part_type)
                .map(|executor| executor.pending_count())
                .unwrap_or(0);
            if pending < self.config.write_window_size {
                return Ok(());
            }
            if deadline.expired() {
                return Err(ChunkError::recoverable(
                    Status::Timeout,
                    format!("write window to {} did not drain", part_type),
                ));
            }
            self.process_operations(Duration::from_millis(50))?;
        }
    }

    /// Wait up to `timeout` for statuses and account them.
    pub fn process_operations(&mut self, timeout: Duration) -> Result<(), ChunkError> {
        let mut fds: Vec<PollFd> = self
            .executors
            .values()
            .map(|executor| PollFd::new(executor.fd(), PollFlags::POLLIN))
            .collect();
        match poll(&mut fds, timeout.as_millis() as i32) {
            Ok(_) | Err(nix::errno::Errno::EINTR) => {}
            Err(err) => {
                return Err(ChunkError::recoverable(
                    Status::Io,
                    format!("poll failed: {}", err),
                ))
            }
        }
        drop(fds);

        let part_types: Vec<ChunkPartType> = self.executors.keys().copied().collect();
        for part_type in part_types {
            let reports = {
                let executor = self.executors.get_mut(&part_type).unwrap();
                executor.receive_statuses()?
            };
            for report in reports {
                if !report.status.is_ok() {
                    return Err(ChunkError::new(
                        report.status,
                        format!("chain {} refused write {}", part_type, report.write_id),
                    ));
                }
                if report.write_id == 0 {
                    continue;
                }
                let Some(operation_id) = self.pending_writes.remove(&report.write_id) else {
                    continue;
                };
                let finished = {
                    let operation = self.operations.get_mut(&operation_id).unwrap();
                    operation.unfinished_writes -= 1;
                    operation.unfinished_writes == 0
                };
                if finished {
                    let operation = self.operations.remove(&operation_id).unwrap();
                    self.file_length = self.file_length.max(operation.offset_of_end);
                    let before = self.journal.len();
                    self.journal
                        .retain(|entry| !operation.serials.contains(&entry.serial));
                    self.give_back_budget((before - self.journal.len()) as u64);
                }
            }
        }

        for executor in self.executors.values() {
            if executor.server_timed_out() {
                return Err(ChunkError::recoverable(
                    Status::Timeout,
                    format!("chain head {} stopped responding", executor.server()),
                ));
            }
        }
        Ok(())
    }

    /// A shrinking truncate that does not land on a stripe boundary must
    /// zero the rest of the cut stripe so parity stays consistent with the
    /// shortened data.
    pub fn pad_stripe_after_truncate(&mut self, new_length_in_file: u64) -> Result<(), ChunkError> {
        self.authoritative_length = Some(new_length_in_file);
        let chunk_start = self.chunk_index as u64 * CHUNK_SIZE;
        if new_length_in_file <= chunk_start {
            return Ok(());
        }
        let in_chunk = (new_length_in_file - chunk_start).min(CHUNK_SIZE) as u32;
        let stripe_bytes = self.slices.stripe_width() * BLOCK_SIZE;
        let stripe_end = in_chunk.div_ceil(stripe_bytes) * stripe_bytes;
        if stripe_end > in_chunk {
            let zeros = vec![0u8; (stripe_end - in_chunk) as usize];
            self.write(in_chunk, &zeros)?;
        }
        Ok(())
    }

    /// Flush everything, close the chains and release the lock with the
    /// authoritative file length.
    pub fn finish(&mut self) -> Result<u64, ChunkError> {
        let deadline = Deadline::in_duration(self.config.response_timeout);
        loop {
            self.start_new_operations(true)?;
            if self.operations.is_empty() && self.pending_count() == 0 {
                break;
            }
            if deadline.expired() {
                return Err(ChunkError::recoverable(
                    Status::Timeout,
                    "write operations did not finish in time",
                ));
            }
            self.process_operations(Duration::from_millis(50))?;
        }
        self.accepts_new_operations = false;
        for executor in self.executors.values_mut() {
            executor.send_end()?;
        }

        let length = self.authoritative_length.unwrap_or(self.file_length);
        let lock = self.lock.take().ok_or_else(|| {
            ChunkError::unrecoverable(Status::WriteNotStarted, "finish without init")
        })?;
        // the lock must not leak, but release cannot be retried forever
        let mut release_error = None;
        for _ in 0..3 {
            match self
                .locator
                .write_end(lock.lock_id, self.inode, lock.chunk_id, length)
            {
                Ok(()) => {
                    release_error = None;
                    break;
                }
                Err(err) => {
                    log::warn!("releasing write lock of chunk {} failed: {}", lock.chunk_id, err);
                    release_error = Some(err);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
        if let Some(err) = release_error {
            return Err(ChunkError::recoverable(Status::Io, err.to_string()));
        }
        Ok(length)
    }

    fn pending_count(&self) -> usize {
        self.executors
            .values()
            .map(|executor| executor.pending_count())
            .sum()
    }

    /// Immediately close the chains and drop the pending state.
    pub fn abort_operations(&mut self) {
        self.executors.clear();
        self.operations.clear();
        self.pending_writes.clear();
        self.accepts_new_operations = false;
    }

    /// Take the journal out of a failed writer; the blocks it holds are
    /// the data a retry has to write again. The returned blocks no longer
    /// count against the cache budget.
    pub fn release_journal(&mut self) -> Vec<WriteCacheBlock> {
        self.give_back_budget(self.budget_held);
        self.journal.drain(..).map(|entry| entry.block).collect()
    }

    fn give_back_budget(&mut self, blocks: u64) {
        let blocks = blocks.min(self.budget_held);
        if blocks > 0 {
            if let Some(budget) = &self.budget {
                budget.release(blocks);
            }
            self.budget_held -= blocks;
        }
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        self.give_back_budget(self.budget_held);
    }
}

fn derive_slices<'a>(part_types: impl Iterator<Item = &'a ChunkPartType>) -> Result<SliceSet, ChunkError> {
    let mut slices = SliceSet::default();
    let mut xor_parts: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
    let mut ec_parts: BTreeMap<(u8, u8), Vec<usize>> = BTreeMap::new();
    for part_type in part_types {
        match part_type.slice_type() {
            SliceType::Standard => slices.standard = true,
            SliceType::Xor(level) => {
                xor_parts.entry(level).or_default().push(part_type.slice_part());
            }
            SliceType::Ec(k, m) => {
                ec_parts.entry((k, m)).or_default().push(part_type.slice_part());
            }
        }
    }
    if xor_parts.len() > 1 || ec_parts.len() > 1 {
        return Err(ChunkError::unrecoverable(
            Status::Einval,
            "conflicting slice families in the granted locations",
        ));
    }
    if let Some((&level, parts)) = xor_parts.iter().next() {
        // writing an xor slice needs every data chain and the parity chain
        if parts.len() != level as usize + 1 {
            return Err(ChunkError::recoverable(
                Status::NoChunkServers,
                format!("xor{} slice is missing chains", level),
            ));
        }
        slices.xor_level = Some(level);
    }
    if let Some((&(k, m), parts)) = ec_parts.iter().next() {
        if parts.len() != (k + m) as usize {
            return Err(ChunkError::recoverable(
                Status::NoChunkServers,
                format!("ec({},{}) slice is missing chains", k, m),
            ));
        }
        slices.ec = Some((k, m));
    }
    Ok(slices)
}

/// Write a batch of byte ranges into one chunk, retrying recoverable
/// failures with exponential backoff until the retry budget is spent.
pub fn write_to_chunk(
    locator: Arc<dyn ChunkLocator>,
    block_source: Option<Arc<dyn BlockSource>>,
    inode: u32,
    chunk_index: u32,
    config: WriteConfig,
    writes: &[(u32, Vec<u8>)],
) -> Result<u64, ChunkError> {
    let mut sleep = config.retry_base_sleep;
    let mut previous_lock_id = 0;
    let mut last_error: Option<ChunkError> = None;
    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            std::thread::sleep(sleep);
            sleep = (sleep * 2).min(config.retry_max_sleep);
        }
        let mut writer = ChunkWriter::new(
            Arc::clone(&locator),
            block_source.clone(),
            inode,
            chunk_index,
            config,
        );
        let result = (|| {
            writer.init(previous_lock_id)?;
            for (offset, data) in writes {
                writer.write(*offset, data)?;
            }
            writer.finish()
        })();
        match result {
            Ok(length) => return Ok(length),
            Err(err) if err.is_recoverable() => {
                log::debug!(
                    "write to inode {} chunk {} attempt {} failed: {}",
                    inode,
                    chunk_index,
                    attempt,
                    err
                );
                previous_lock_id = writer.lock_id();
                writer.abort_operations();
                if err.status == Status::Locked {
                    // someone else holds the chunk; sleep a little longer
                    std::thread::sleep(config.retry_base_sleep);
                }
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_error
        .unwrap_or_else(|| ChunkError::unrecoverable(Status::Io, "write failed"))
        .into_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_derivation() {
        let parts = vec![
            ChunkPartType::standard(),
            ChunkPartType::xor_parity(2).unwrap(),
            ChunkPartType::xor_data(2, 1).unwrap(),
            ChunkPartType::xor_data(2, 2).unwrap(),
        ];
        let slices = derive_slices(parts.iter()).unwrap();
        assert!(slices.standard);
        assert_eq!(slices.xor_level, Some(2));
        assert_eq!(slices.stripe_width(), 2);

        // a missing data chain makes the xor slice unwritable
        let parts = vec![
            ChunkPartType::xor_parity(3).unwrap(),
            ChunkPartType::xor_data(3, 1).unwrap(),
        ];
        assert!(derive_slices(parts.iter()).is_err());
    }

    #[test]
    fn standard_only_width_is_one() {
        let parts = vec![ChunkPartType::standard()];
        let slices = derive_slices(parts.iter()).unwrap();
        assert_eq!(slices.stripe_width(), 1);
        assert!(slices.standard);
        assert_eq!(slices.xor_level, None);
    }

    #[test]
    fn ec_slices_need_all_chains() {
        let ec = |shard| ChunkPartType::new(SliceType::Ec(2, 1), shard).unwrap();
        let parts = vec![ec(0), ec(1), ec(2)];
        let slices = derive_slices(parts.iter()).unwrap();
        assert_eq!(slices.ec, Some((2, 1)));
        assert_eq!(slices.stripe_width(), 2);

        let parts = vec![ec(0), ec(1)];
        assert!(derive_slices(parts.iter()).is_err());
    }
}
