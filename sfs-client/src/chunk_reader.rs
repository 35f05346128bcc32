//! The chunk reader: planner, wave executor, post-processing and the
//! retry loop, fronted by the interval cache and the readahead adviser.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reed_solomon_erasure::galois_8::ReedSolomon;

use sfs_types::{ChunkPartType, Status, BLOCKS_PER_CHUNK, BLOCK_SIZE};

use crate::error::ChunkError;
use crate::locator::{ChunkLocation, ChunkLocator};
use crate::read_cache::ReadCache;
use crate::read_executor::{apply_post_process, ExecutorConfig, WavesExecutor};
use crate::read_plan::{EcLayout, PlanVariant};
use crate::read_planner::ReadPlanner;
use crate::readahead::{ReadaheadAdviser, ReadaheadConfig};

#[derive(Clone, Copy, Debug)]
pub struct ReadConfig {
    pub executor: ExecutorConfig,
    pub max_retries: u32,
    pub retry_base_sleep: Duration,
    pub retry_max_sleep: Duration,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub readahead: ReadaheadConfig,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            max_retries: 5,
            retry_base_sleep: Duration::from_millis(100),
            retry_max_sleep: Duration::from_secs(5),
            cache_capacity: 256,
            cache_ttl: Duration::from_millis(500),
            readahead: ReadaheadConfig::default(),
        }
    }
}

pub struct ChunkReader {
    locator: Arc<dyn ChunkLocator>,
    config: ReadConfig,
    cache: Mutex<ReadCache>,
    adviser: Mutex<ReadaheadAdviser>,
}

impl ChunkReader {
    pub fn new(locator: Arc<dyn ChunkLocator>, config: ReadConfig) -> Self {
        Self {
            locator,
            cache: Mutex::new(ReadCache::new(config.cache_capacity, config.cache_ttl)),
            adviser: Mutex::new(ReadaheadAdviser::new(config.cache_capacity, config.readahead)),
            config,
        }
    }

    /// Drop cached data of an inode, called after local writes.
    pub fn invalidate_inode(&self, inode: u32) {
        self.cache.lock().unwrap().invalidate_inode(inode);
    }

    /// Read `[first_block, first_block + block_count)` of one chunk. The
    /// readahead adviser may fetch more than asked; the surplus lands in
    /// the cache for the next sequential request.
    pub fn read_blocks(
        &self,
        inode: u32,
        chunk_index: u32,
        first_block: u32,
        block_count: u32,
    ) -> Result<Vec<u8>, ChunkError> {
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap()
            .query(inode, chunk_index, first_block, block_count)
        {
            return Ok(hit);
        }

        let absolute_block = chunk_index as u64 * BLOCKS_PER_CHUNK as u64 + first_block as u64;
        let advised = self
            .adviser
            .lock()
            .unwrap()
            .advise(inode, absolute_block, block_count)
            .min(BLOCKS_PER_CHUNK - first_block);

        let data = self.read_blocks_with_retries(inode, chunk_index, first_block, advised)?;
        let result = data[..(block_count * BLOCK_SIZE) as usize].to_vec();
        self.cache
            .lock()
            .unwrap()
            .store(inode, chunk_index, first_block, data);
        Ok(result)
    }

    fn read_blocks_with_retries(
        &self,
        inode: u32,
        chunk_index: u32,
        first_block: u32,
        block_count: u32,
    ) -> Result<Vec<u8>, ChunkError> {
        let mut sleep = self.config.retry_base_sleep;
        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                std::thread::sleep(sleep);
                sleep = (sleep * 2).min(self.config.retry_max_sleep);
            }
            match self.read_attempt(inode, chunk_index, first_block, block_count) {
                Ok(data) => return Ok(data),
                Err(err) if err.is_recoverable() => {
                    log::debug!(
                        "read of inode {} chunk {} attempt {} failed: {}",
                        inode,
                        chunk_index,
                        attempt,
                        err
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        // repeated recoverable failures become the terminal status
        Err(last_error
            .unwrap_or_else(|| ChunkError::unrecoverable(Status::Io, "read failed"))
            .into_terminal())
    }

    fn read_attempt(
        &self,
        inode: u32,
        chunk_index: u32,
        first_block: u32,
        block_count: u32,
    ) -> Result<Vec<u8>, ChunkError> {
        let location = self
            .locator
            .locate_for_read(inode, chunk_index)
            .map_err(|err| ChunkError::recoverable(Status::Io, err.to_string()))?;
        if location.chunk_id.0 == 0 && location.parts.is_empty() {
            // a hole in the file reads as zeros
            return Ok(vec![0u8; (block_count * BLOCK_SIZE) as usize]);
        }
        if location.parts.is_empty() {
            return Err(ChunkError::recoverable(
                Status::NoChunkServers,
                format!("no locations for chunk {}", location.chunk_id),
            ));
        }

        let available: Vec<ChunkPartType> =
            location.parts.iter().map(|part| part.part_type).collect();
        let mut planner = ReadPlanner::new();
        planner.prepare(&available);
        if !planner.is_reading_possible() {
            return Err(ChunkError::recoverable(
                Status::ChunkLost,
                format!("chunk {} has no readable part combination", location.chunk_id),
            ));
        }
        let plan = planner
            .build_plan_for(first_block, block_count)
            .map_err(|err| ChunkError::unrecoverable(Status::Einval, err.to_string()))?;

        let find_address = make_address_lookup(&location);
        let executor = WavesExecutor::new(
            location.chunk_id,
            location.version,
            &plan,
            &find_address,
            self.config.executor,
        );
        let mut result = executor.execute()?;

        let operations = plan
            .post_process_for_extended_plan(&result.unfinished)
            .map_err(|err| ChunkError::recoverable(Status::Io, err.to_string()))?;
        apply_post_process(&mut result.buffer, &operations);

        match &plan.variant {
            PlanVariant::Ec(layout) => extract_ec_window(
                layout,
                &result.buffer,
                &result.unfinished,
                first_block,
                block_count,
            ),
            _ => Ok(result.buffer[..(block_count * BLOCK_SIZE) as usize].to_vec()),
        }
    }
}

fn make_address_lookup(
    location: &ChunkLocation,
) -> impl Fn(ChunkPartType) -> Option<sfs_types::NetworkAddress> + '_ {
    move |part_type| {
        location
            .parts
            .iter()
            .find(|part| part.part_type == part_type)
            .map(|part| part.address)
    }
}

/// Decode the requested window out of the shard regions of an EC plan.
fn extract_ec_window(
    layout: &EcLayout,
    buffer: &[u8],
    unfinished: &std::collections::BTreeSet<ChunkPartType>,
    first_block: u32,
    block_count: u32,
) -> Result<Vec<u8>, ChunkError> {
    let block = BLOCK_SIZE as usize;
    let k = layout.k as usize;
    let total_shards = k + layout.m as usize;

    // shard index -> finished region offset
    let mut region_of_shard: Vec<Option<u32>> = vec![None; total_shards];
    for (shard, region) in &layout.regions {
        let part_type = ChunkPartType::new(sfs_types::SliceType::Ec(layout.k, layout.m), *shard)
            .map_err(|err| ChunkError::unrecoverable(Status::Einval, err.to_string()))?;
        if !unfinished.contains(&part_type) {
            region_of_shard[*shard] = Some(*region);
        }
    }

    let rs = ReedSolomon::new(k, layout.m as usize)
        .map_err(|err| ChunkError::unrecoverable(Status::Einval, format!("{:?}", err)))?;

    let mut output = vec![0u8; block_count as usize * block];
    for stripe in layout.first_stripe..layout.first_stripe + layout.stripe_count {
        let relative = (stripe - layout.first_stripe) as usize;
        let mut shards: Vec<Option<Vec<u8>>> = (0..total_shards)
            .map(|shard| {
                region_of_shard[shard].map(|region| {
                    let from = region as usize + relative * block;
                    buffer[from..from + block].to_vec()
                })
            })
            .collect();
        let data_missing = shards[..k].iter().any(Option::is_none);
        if data_missing {
            rs.reconstruct_data(&mut shards).map_err(|err| {
                ChunkError::recoverable(Status::Crc, format!("erasure decode failed: {:?}", err))
            })?;
        }
        for chunk_block in first_block..first_block + block_count {
            if chunk_block / layout.k as u32 != stripe {
                continue;
            }
            let shard = (chunk_block % layout.k as u32) as usize;
            let data = shards[shard]
                .as_ref()
                .ok_or_else(|| ChunkError::recoverable(Status::Crc, "shard not reconstructed"))?;
            let out_from = ((chunk_block - first_block) as usize) * block;
            output[out_from..out_from + block].copy_from_slice(data);
        }
    }
    Ok(output)
}
