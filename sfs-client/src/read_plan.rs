//! Read plans.
//!
//! A plan describes how to serve one block range of a chunk from a set of
//! available parts: which reads to issue (`basic`), which redundant reads
//! may be started to tolerate a straggling or failed source
//! (`additional`), which speculative reads are worth issuing for their
//! side effect (`prefetch`), and how to post-process the buffer once
//! enough reads finished.
//!
//! Buffer layout: the requested blocks always occupy the front of the
//! buffer, in logical order; helper blocks (other parts of the first and
//! last stripe, parity) live behind them. A missing data block is
//! recovered in place by XOR-ing its stripe peers into its slot.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Error};

use sfs_types::{ChunkPartType, BLOCK_SIZE};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadOperation {
    /// Offset to be sent in the READ request.
    pub request_offset: u32,
    /// Size to be sent in the READ request.
    pub request_size: u32,
    /// Buffer position for each received block, in arrival order.
    pub read_data_offsets: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrefetchOperation {
    pub request_offset: u32,
    pub request_size: u32,
}

/// `buffer[dst] <- buffer[src] ^ buffer[x] ^ ...` over whole blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostProcessOperation {
    pub destination_offset: u32,
    pub source_offset: u32,
    pub xor_offsets: Vec<u32>,
}

/// Erasure-decode step of an EC plan: which shard region belongs to which
/// shard index, and which stripes must be decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EcLayout {
    pub k: u8,
    pub m: u8,
    pub first_stripe: u32,
    pub stripe_count: u32,
    /// `(shard index, buffer offset of the shard's stripe region)`.
    pub regions: Vec<(usize, u32)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanVariant {
    /// Requested blocks arrive in place; nothing to post-process.
    Standard,
    /// Single-variant XOR plan; `missing_part` 0 means no recovery.
    Xor { level: u8, missing_part: u8 },
    /// All data parts plus parity are read; any single source may be
    /// dropped and recovered via the extended post-process.
    XorRecoverable {
        level: u8,
        first_block: u32,
        block_count: u32,
        /// Buffer offset of the first parity stripe slot.
        parity_offset: u32,
    },
    /// Reed-Solomon plan; the reader decodes and copies the requested
    /// window out of the shard regions.
    Ec(EcLayout),
}

#[derive(Clone, Debug)]
pub struct ReadPlan {
    pub variant: PlanVariant,
    pub required_buffer_size: u32,
    pub basic_read_operations: BTreeMap<ChunkPartType, ReadOperation>,
    pub additional_read_operations: BTreeMap<ChunkPartType, ReadOperation>,
    pub prefetch_operations: BTreeMap<ChunkPartType, PrefetchOperation>,
    pub post_process_basic: Vec<PostProcessOperation>,
}

impl ReadPlan {
    pub fn new(variant: PlanVariant) -> Self {
        Self {
            variant,
            required_buffer_size: 0,
            basic_read_operations: BTreeMap::new(),
            additional_read_operations: BTreeMap::new(),
            prefetch_operations: BTreeMap::new(),
            post_process_basic: Vec::new(),
        }
    }

    pub fn all_read_operations(&self) -> impl Iterator<Item = (&ChunkPartType, &ReadOperation)> {
        self.basic_read_operations
            .iter()
            .chain(self.additional_read_operations.iter())
    }

    /// True once reading can stop with `unfinished` sources outstanding.
    /// Used during wave execution after additional operations were
    /// started; when all basic operations are done, reading is finished by
    /// definition.
    pub fn is_reading_finished(&self, unfinished: &BTreeSet<ChunkPartType>) -> bool {
        let unfinished_basic = self
            .basic_read_operations
            .keys()
            .filter(|part| unfinished.contains(part))
            .count();
        match &self.variant {
            PlanVariant::Standard | PlanVariant::Xor { .. } => unfinished_basic == 0,
            PlanVariant::XorRecoverable { level, .. } => {
                if unfinished_basic == 0 {
                    return true;
                }
                let parity = ChunkPartType::xor_parity(*level).unwrap();
                unfinished_basic == 1 && !unfinished.contains(&parity)
            }
            PlanVariant::Ec(layout) => {
                let finished = self
                    .all_read_operations()
                    .filter(|(part, _)| !unfinished.contains(part))
                    .count();
                finished >= layout.k as usize
            }
        }
    }

    /// Post-process operations when every basic operation finished.
    pub fn post_process_for_basic_plan(&self) -> Vec<PostProcessOperation> {
        self.post_process_basic.clone()
    }

    /// Post-process operations when reading stopped with `unfinished`
    /// sources outstanding.
    pub fn post_process_for_extended_plan(
        &self,
        unfinished: &BTreeSet<ChunkPartType>,
    ) -> Result<Vec<PostProcessOperation>, Error> {
        if !self.is_reading_finished(unfinished) {
            bail!("extended plan queried while reading is not finished");
        }
        let unfinished_basic: Vec<ChunkPartType> = self
            .basic_read_operations
            .keys()
            .filter(|part| unfinished.contains(part))
            .copied()
            .collect();
        if unfinished_basic.is_empty() {
            return Ok(self.post_process_basic.clone());
        }
        match &self.variant {
            PlanVariant::XorRecoverable {
                level,
                first_block,
                block_count,
                parity_offset,
            } => {
                let missing = unfinished_basic[0];
                let missing_part = missing.slice_part() as u32;
                let geometry = XorGeometry::new(*level as u32, *first_block, *block_count, true);
                let mut operations = self.post_process_basic.clone();
                for stripe in geometry.first_stripe()..=geometry.last_stripe() {
                    let slot = geometry.destination_offset(stripe, missing_part);
                    // the parity block seeds the slot, the peers xor in
                    let peers: Vec<u32> = (1..=geometry.last_part_in_stripe(stripe))
                        .filter(|part| *part != missing_part)
                        .map(|part| geometry.destination_offset(stripe, part) * BLOCK_SIZE)
                        .collect();
                    operations.push(PostProcessOperation {
                        destination_offset: slot * BLOCK_SIZE,
                        source_offset: parity_offset
                            + (stripe - geometry.first_stripe()) * BLOCK_SIZE,
                        xor_offsets: peers,
                    });
                }
                Ok(operations)
            }
            PlanVariant::Ec(_) => Ok(Vec::new()),
            _ => bail!(
                "plan cannot recover from an unfinished basic source ({})",
                unfinished_basic[0]
            ),
        }
    }
}

/// Block arithmetic of an XOR slice, shared by the plan builders.
///
/// Data blocks of a chunk are distributed round-robin: chunk block `b`
/// belongs to part `b % level + 1` at stripe `b / level`.
#[derive(Clone, Copy, Debug)]
pub struct XorGeometry {
    pub level: u32,
    pub first_block: u32,
    pub last_block: u32,
    /// Helper-block spacing accounts for last-stripe extras.
    pub recovery: bool,
}

impl XorGeometry {
    pub fn new(level: u32, first_block: u32, block_count: u32, recovery: bool) -> Self {
        Self {
            level,
            first_block,
            last_block: first_block + block_count - 1,
            recovery,
        }
    }

    pub fn part_of(&self, block: u32) -> u32 {
        block % self.level + 1
    }

    pub fn stripe_of(&self, block: u32) -> u32 {
        block / self.level
    }

    pub fn first_stripe(&self) -> u32 {
        self.stripe_of(self.first_block)
    }

    pub fn last_stripe(&self) -> u32 {
        self.stripe_of(self.last_block)
    }

    pub fn stripe_count(&self) -> u32 {
        self.last_stripe() - self.first_stripe() + 1
    }

    pub fn is_many_stripes(&self) -> bool {
        self.stripe_count() > 1
    }

    /// Last part of a stripe; the last stripe of a chunk may be shorter.
    pub fn last_part_in_stripe(&self, stripe: u32) -> u32 {
        let last_block_in_chunk = sfs_types::BLOCKS_PER_CHUNK - 1;
        if stripe < self.stripe_of(last_block_in_chunk) {
            self.level
        } else {
            self.part_of(last_block_in_chunk)
        }
    }

    pub fn preceding_parts_count(&self, part: u32) -> u32 {
        part - 1
    }

    fn succeeding_parts_count(&self, part: u32) -> u32 {
        self.level - part
    }

    /// Succeeding parts of `block`'s stripe, honoring end-of-chunk.
    pub fn actual_succeeding_parts_count(&self, block: u32) -> u32 {
        self.succeeding_parts_count(self.part_of(block))
            - self.succeeding_parts_count(self.last_part_in_stripe(self.stripe_of(block)))
    }

    pub fn is_first_stripe_requested_for(&self, part: u32) -> bool {
        part >= self.part_of(self.first_block)
            && (self.is_many_stripes() || part <= self.part_of(self.last_block))
    }

    pub fn is_last_stripe_requested_for(&self, part: u32) -> bool {
        part <= self.part_of(self.last_block)
            && (self.is_many_stripes() || part >= self.part_of(self.first_block))
    }

    /// Buffer slot (in blocks) of `part`'s block in `stripe`.
    ///
    /// Requested blocks land at their logical position relative to
    /// `first_block`; first-stripe helper blocks are appended behind the
    /// requested region and the last-stripe extras.
    pub fn destination_offset(&self, stripe: u32, part: u32) -> u32 {
        if stripe == self.first_stripe() && part < self.part_of(self.first_block) {
            return self.last_block - self.first_block
                + 1
                + if self.recovery {
                    self.actual_succeeding_parts_count(self.last_block)
                } else {
                    0
                }
                + self.preceding_parts_count(part);
        }
        stripe * self.level + self.preceding_parts_count(part) - self.first_block
    }
}
