//! Chooses which available parts to read and builds the plan.
//!
//! Choice rules, in order: a `Standard` replica wins outright; otherwise
//! the highest XOR level with all data parts (reading parity additionally
//! when present makes the plan tolerate one straggler); otherwise the
//! highest XOR level with one data part missing but parity present;
//! otherwise an erasure-coded slice with at least `k` parts.

use std::collections::BTreeSet;

use anyhow::{bail, Error};

use sfs_types::{ChunkPartType, SliceType, BLOCKS_PER_CHUNK, BLOCK_SIZE, MAX_XOR_LEVEL, MIN_XOR_LEVEL};

use crate::read_plan::{
    EcLayout, PlanVariant, PostProcessOperation, PrefetchOperation, ReadOperation, ReadPlan,
    XorGeometry,
};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Strategy {
    Standard,
    /// All data parts present; parity may be read additionally.
    XorFull { level: u8, parity_available: bool },
    /// One data part missing, reconstructed from parity.
    XorRecovery { level: u8, missing_part: u8 },
    Ec { k: u8, m: u8, shards: Vec<usize> },
}

#[derive(Debug, Default)]
pub struct ReadPlanner {
    strategy: Option<Strategy>,
}

impl ReadPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the available parts and pick a strategy. With no usable
    /// combination the planner reports reading impossible.
    pub fn prepare(&mut self, available_parts: &[ChunkPartType]) {
        self.strategy = None;
        let mut parts: Vec<ChunkPartType> = available_parts.to_vec();
        parts.sort();
        parts.dedup();

        let mut parity_for_level = [false; MAX_XOR_LEVEL as usize + 1];
        let mut data_parts_for_level = vec![BTreeSet::new(); MAX_XOR_LEVEL as usize + 1];
        let mut ec_candidates: Vec<(u8, u8, Vec<usize>)> = Vec::new();

        for part in &parts {
            match part.slice_type() {
                SliceType::Standard => {
                    self.strategy = Some(Strategy::Standard);
                    return;
                }
                SliceType::Xor(level) => {
                    if part.slice_part() == 0 {
                        parity_for_level[level as usize] = true;
                    } else {
                        data_parts_for_level[level as usize].insert(part.slice_part());
                    }
                }
                SliceType::Ec(k, m) => {
                    match ec_candidates.iter_mut().find(|(ck, cm, _)| *ck == k && *cm == m) {
                        Some((_, _, shards)) => shards.push(part.slice_part()),
                        None => ec_candidates.push((k, m, vec![part.slice_part()])),
                    }
                }
            }
        }

        for level in (MIN_XOR_LEVEL..=MAX_XOR_LEVEL).rev() {
            if data_parts_for_level[level as usize].len() == level as usize {
                self.strategy = Some(Strategy::XorFull {
                    level,
                    parity_available: parity_for_level[level as usize],
                });
                return;
            }
        }

        for level in (MIN_XOR_LEVEL..=MAX_XOR_LEVEL).rev() {
            let data = &data_parts_for_level[level as usize];
            if data.len() == level as usize - 1 && parity_for_level[level as usize] {
                let missing_part = (1..=level as usize)
                    .find(|part| !data.contains(part))
                    .unwrap() as u8;
                self.strategy = Some(Strategy::XorRecovery {
                    level,
                    missing_part,
                });
                return;
            }
        }

        for (k, m, mut shards) in ec_candidates {
            if shards.len() >= k as usize {
                shards.sort();
                self.strategy = Some(Strategy::Ec { k, m, shards });
                return;
            }
        }
    }

    pub fn is_reading_possible(&self) -> bool {
        self.strategy.is_some()
    }

    /// The parts the built plans will read from.
    pub fn parts_to_use(&self) -> Vec<ChunkPartType> {
        match &self.strategy {
            None => Vec::new(),
            Some(Strategy::Standard) => vec![ChunkPartType::standard()],
            Some(Strategy::XorFull {
                level,
                parity_available,
            }) => {
                let mut parts = Vec::new();
                if *parity_available {
                    parts.push(ChunkPartType::xor_parity(*level).unwrap());
                }
                for part in 1..=*level {
                    parts.push(ChunkPartType::xor_data(*level, part).unwrap());
                }
                parts
            }
            Some(Strategy::XorRecovery {
                level,
                missing_part,
            }) => {
                let mut parts = vec![ChunkPartType::xor_parity(*level).unwrap()];
                for part in 1..=*level {
                    if part != *missing_part {
                        parts.push(ChunkPartType::xor_data(*level, part).unwrap());
                    }
                }
                parts
            }
            Some(Strategy::Ec { k, m, shards }) => shards
                .iter()
                .map(|&shard| {
                    ChunkPartType::new(SliceType::Ec(*k, *m), shard).unwrap()
                })
                .collect(),
        }
    }

    pub fn build_plan_for(&self, first_block: u32, block_count: u32) -> Result<ReadPlan, Error> {
        if block_count == 0 || first_block + block_count > BLOCKS_PER_CHUNK {
            bail!(
                "invalid block range [{}, {})",
                first_block,
                first_block + block_count
            );
        }
        match self.strategy.as_ref() {
            None => bail!("no parts to read from"),
            Some(Strategy::Standard) => Ok(build_standard_plan(first_block, block_count)),
            Some(Strategy::XorFull {
                level,
                parity_available: false,
            }) => Ok(build_xor_plan(*level, 0, first_block, block_count)),
            Some(Strategy::XorFull {
                level,
                parity_available: true,
            }) => Ok(build_xor_recoverable_plan(*level, first_block, block_count)),
            Some(Strategy::XorRecovery {
                level,
                missing_part,
            }) => Ok(build_xor_plan(*level, *missing_part, first_block, block_count)),
            Some(Strategy::Ec { k, m, shards }) => {
                Ok(build_ec_plan(*k, *m, shards, first_block, block_count))
            }
        }
    }
}

fn build_standard_plan(first_block: u32, block_count: u32) -> ReadPlan {
    let mut plan = ReadPlan::new(PlanVariant::Standard);
    let operation = ReadOperation {
        request_offset: first_block * BLOCK_SIZE,
        request_size: block_count * BLOCK_SIZE,
        read_data_offsets: (0..block_count).map(|block| block * BLOCK_SIZE).collect(),
    };
    plan.required_buffer_size = operation.request_size;
    plan.basic_read_operations
        .insert(ChunkPartType::standard(), operation);
    plan
}

/// Single-variant XOR plan. With `missing_part != 0` the parity part is
/// read into the missing part's slots and the post-process XOR recovers
/// the data in place.
fn build_xor_plan(level: u8, missing_part: u8, first_block: u32, block_count: u32) -> ReadPlan {
    let mut plan = ReadPlan::new(PlanVariant::Xor {
        level,
        missing_part,
    });
    let missing = missing_part as u32;
    let last_stripe_recovery_spacing = missing != 0;
    let geometry = XorGeometry::new(level as u32, first_block, block_count, last_stripe_recovery_spacing);

    let first_stripe_recovery = missing != 0 && geometry.is_first_stripe_requested_for(missing);
    let last_stripe_recovery = missing != 0 && geometry.is_last_stripe_requested_for(missing);

    for part in 1..=level as u32 {
        let first_block_needed =
            geometry.is_first_stripe_requested_for(part) || first_stripe_recovery;
        let last_block_needed = geometry.is_last_stripe_requested_for(part)
            || (last_stripe_recovery && part <= geometry.last_part_in_stripe(geometry.last_stripe()));

        let mut read_offset = geometry.first_stripe();
        let mut read_size = geometry.stripe_count() as i64;
        if !first_block_needed {
            read_offset += 1;
            read_size -= 1;
        }
        if !last_block_needed {
            read_size -= 1;
        }

        let part_type = if part == missing {
            ChunkPartType::xor_parity(level).unwrap()
        } else {
            ChunkPartType::xor_data(level, part as u8).unwrap()
        };

        if read_size > 0 {
            let read_size = read_size as u32;
            let operation = ReadOperation {
                request_offset: read_offset * BLOCK_SIZE,
                request_size: read_size * BLOCK_SIZE,
                read_data_offsets: (read_offset..read_offset + read_size)
                    .map(|stripe| geometry.destination_offset(stripe, part) * BLOCK_SIZE)
                    .collect(),
            };
            plan.required_buffer_size += operation.request_size;
            plan.basic_read_operations.insert(part_type, operation);
        } else {
            // the next request will likely need this part's first stripe
            plan.prefetch_operations.insert(
                part_type,
                PrefetchOperation {
                    request_offset: geometry.first_stripe() * BLOCK_SIZE,
                    request_size: BLOCK_SIZE,
                },
            );
        }
    }

    if missing != 0 {
        plan.prefetch_operations.clear();
        for stripe in geometry.first_stripe()..=geometry.last_stripe() {
            if (stripe == geometry.first_stripe() && !first_stripe_recovery)
                || (stripe == geometry.last_stripe() && !last_stripe_recovery)
            {
                continue;
            }
            let slot = geometry.destination_offset(stripe, missing) * BLOCK_SIZE;
            let xor_offsets = (1..=geometry.last_part_in_stripe(stripe))
                .filter(|part| *part != missing)
                .map(|part| geometry.destination_offset(stripe, part) * BLOCK_SIZE)
                .collect();
            plan.post_process_basic.push(PostProcessOperation {
                destination_offset: slot,
                source_offset: slot,
                xor_offsets,
            });
        }
    }
    plan
}

/// XOR plan reading the full stripe range from every data part plus the
/// parity part, so that any one source may fail or straggle.
fn build_xor_recoverable_plan(level: u8, first_block: u32, block_count: u32) -> ReadPlan {
    let geometry = XorGeometry::new(level as u32, first_block, block_count, true);
    let first_stripe = geometry.first_stripe();
    let stripe_count = geometry.stripe_count();
    let last_part_in_last_stripe = geometry.last_part_in_stripe(geometry.last_stripe());

    let data_region_blocks = block_count
        + geometry.actual_succeeding_parts_count(first_block + block_count - 1)
        + geometry.preceding_parts_count(geometry.part_of(first_block));
    let parity_offset = data_region_blocks * BLOCK_SIZE;

    let mut plan = ReadPlan::new(PlanVariant::XorRecoverable {
        level,
        first_block,
        block_count,
        parity_offset,
    });

    for part in 1..=level as u32 {
        // a part past the end of the chunk's last stripe has no block there
        let stripes_for_part = if part <= last_part_in_last_stripe {
            stripe_count
        } else {
            stripe_count - 1
        };
        if stripes_for_part == 0 {
            continue;
        }
        let operation = ReadOperation {
            request_offset: first_stripe * BLOCK_SIZE,
            request_size: stripes_for_part * BLOCK_SIZE,
            read_data_offsets: (first_stripe..first_stripe + stripes_for_part)
                .map(|stripe| geometry.destination_offset(stripe, part) * BLOCK_SIZE)
                .collect(),
        };
        plan.basic_read_operations
            .insert(ChunkPartType::xor_data(level, part as u8).unwrap(), operation);
    }

    let parity_operation = ReadOperation {
        request_offset: first_stripe * BLOCK_SIZE,
        request_size: stripe_count * BLOCK_SIZE,
        read_data_offsets: (0..stripe_count)
            .map(|stripe| parity_offset + stripe * BLOCK_SIZE)
            .collect(),
    };
    plan.additional_read_operations.insert(
        ChunkPartType::xor_parity(level).unwrap(),
        parity_operation,
    );

    plan.required_buffer_size = parity_offset + stripe_count * BLOCK_SIZE;
    plan
}

/// Erasure-coded plan: at least `k` shards are read over the stripe range,
/// preferring data shards; the reader decodes whatever arrived.
fn build_ec_plan(k: u8, m: u8, shards: &[usize], first_block: u32, block_count: u32) -> ReadPlan {
    let k_usize = k as usize;
    let first_stripe = first_block / k as u32;
    let last_stripe = (first_block + block_count - 1) / k as u32;
    let stripe_count = last_stripe - first_stripe + 1;

    let mut chosen: Vec<usize> = shards.iter().copied().filter(|&s| s < k_usize).collect();
    for &shard in shards.iter().filter(|&&s| s >= k_usize) {
        if chosen.len() >= k_usize {
            break;
        }
        chosen.push(shard);
    }
    let extra: Vec<usize> = shards
        .iter()
        .copied()
        .filter(|shard| !chosen.contains(shard))
        .collect();

    let mut layout = EcLayout {
        k,
        m,
        first_stripe,
        stripe_count,
        regions: Vec::new(),
    };
    let mut plan_operations = Vec::new();
    let mut region_offset = 0u32;
    for (index, shard) in chosen.iter().chain(extra.iter()).enumerate() {
        let operation = ReadOperation {
            request_offset: first_stripe * BLOCK_SIZE,
            request_size: stripe_count * BLOCK_SIZE,
            read_data_offsets: (0..stripe_count)
                .map(|stripe| region_offset + stripe * BLOCK_SIZE)
                .collect(),
        };
        layout.regions.push((*shard, region_offset));
        region_offset += stripe_count * BLOCK_SIZE;
        plan_operations.push((index < chosen.len(), *shard, operation));
    }

    let mut plan = ReadPlan::new(PlanVariant::Ec(layout));
    for (is_basic, shard, operation) in plan_operations {
        let part_type = ChunkPartType::new(SliceType::Ec(k, m), shard).unwrap();
        if is_basic {
            plan.basic_read_operations.insert(part_type, operation);
        } else {
            plan.additional_read_operations.insert(part_type, operation);
        }
    }
    plan.required_buffer_size = region_offset;
    plan
}
