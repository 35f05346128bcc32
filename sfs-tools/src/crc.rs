//! CRC-32 used by every data path.
//!
//! Every 64 KiB block carries an independent CRC. Replication and parity
//! computation lean on two identities:
//!
//! * `crc(seed, A || B) == combine(crc(seed, A), crc(0, B), |B|)`
//! * `crc(A) ^ crc(B) == crc(A ^ B)` for equal-length `A`, `B`
//!   (the XOR identity; callers use it to derive the CRC of an XOR-combined
//!   block from the CRCs of its inputs)
//!
//! The zero-run shortcut `zero_block_crc` is derived from `combine` by
//! doubling, so extending a block with zeros never touches the data.

use once_cell::sync::Lazy;

/// CRC of `data` continuing from `seed`. A fresh computation uses seed 0.
pub fn crc(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

/// Combine two CRCs: the result is the CRC of the concatenation of the
/// buffer behind `crc_a` and the `len_b` bytes behind `crc_b`.
pub fn crc_combine(crc_a: u32, crc_b: u32, len_b: u64) -> u32 {
    let mut a = crc32fast::Hasher::new_with_initial_len(crc_a, 0);
    let b = crc32fast::Hasher::new_with_initial_len(crc_b, len_b);
    a.combine(&b);
    a.finalize()
}

// crc(0, zeros(1 << k)), derived by doubling
static ZERO_RUN_CRCS: Lazy<[u32; 32]> = Lazy::new(|| {
    let mut table = [0u32; 32];
    table[0] = crc(0, &[0u8]);
    for k in 1..32 {
        table[k] = crc_combine(table[k - 1], table[k - 1], 1u64 << (k - 1));
    }
    table
});

/// CRC of `len` zero bytes appended to `seed`, without touching any data.
pub fn zero_block_crc(seed: u32, len: u32) -> u32 {
    let mut result = seed;
    for k in 0..32 {
        if len & (1 << k) != 0 {
            result = crc_combine(result, ZERO_RUN_CRCS[k], 1u64 << k);
        }
    }
    result
}

/// CRC of the XOR of several equal-length blocks, derived from the block
/// CRCs alone.
///
/// CRC-32 is affine, not linear: `crc(X) = L(X) ^ K(len)` with `K(len)`
/// the CRC of a zero run. XOR-ing an even number of blocks cancels the
/// constant, so it has to be added back.
pub fn xor_blocks_crc(crcs: &[u32], block_len: u32) -> u32 {
    let mut result = if crcs.len() % 2 == 0 {
        zero_block_crc(0, block_len)
    } else {
        0
    };
    for &c in crcs {
        result ^= c;
    }
    result
}

/// A block of zeros transferred by a peer that does not checksum sparse
/// regions arrives with CRC 0. If the block really is all zeros, replace
/// the CRC with the correct value instead of failing verification.
pub fn recompute_crc_if_block_empty(block: &[u8], crc_value: &mut u32) {
    if *crc_value == 0 && block.iter().all(|&b| b == 0) {
        *crc_value = zero_block_crc(0, block.len() as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_of_empty() {
        assert_eq!(crc(0, b""), 0);
    }

    #[test]
    fn combine_matches_concatenation() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let whole = crc(0, data);
        for split in 0..data.len() {
            let (a, b) = data.split_at(split);
            let combined = crc_combine(crc(0, a), crc(0, b), b.len() as u64);
            assert_eq!(combined, whole, "split at {}", split);
        }
    }

    #[test]
    fn combine_folds_over_partitions() {
        let data: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();
        let whole = crc(0, &data);
        let folded = data
            .chunks(100)
            .fold((0u32, true), |(acc, first), part| {
                let part_crc = crc(0, part);
                if first {
                    (part_crc, false)
                } else {
                    (crc_combine(acc, part_crc, part.len() as u64), false)
                }
            })
            .0;
        assert_eq!(folded, whole);
    }

    #[test]
    fn zero_block_shortcut() {
        for len in [0u32, 1, 2, 3, 255, 4096, 65535, 65536] {
            let zeros = vec![0u8; len as usize];
            assert_eq!(zero_block_crc(0, len), crc(0, &zeros), "len {}", len);
        }
        // continuing from a non-zero seed
        let seed = crc(0, b"prefix");
        let mut padded = b"prefix".to_vec();
        padded.extend_from_slice(&[0u8; 1000]);
        assert_eq!(zero_block_crc(seed, 1000), crc(0, &padded));
    }

    #[test]
    fn xor_blocks_crc_matches_data() {
        const LEN: usize = 4096;
        let blocks: Vec<Vec<u8>> = (0..4u32)
            .map(|seed| {
                (0..LEN)
                    .map(|i| ((i as u32).wrapping_mul(7).wrapping_add(seed * 13) % 251) as u8)
                    .collect()
            })
            .collect();
        for count in 1..=4 {
            let mut xored = vec![0u8; LEN];
            for block in &blocks[..count] {
                for (dst, src) in xored.iter_mut().zip(block) {
                    *dst ^= src;
                }
            }
            let crcs: Vec<u32> = blocks[..count].iter().map(|b| crc(0, b)).collect();
            assert_eq!(
                xor_blocks_crc(&crcs, LEN as u32),
                crc(0, &xored),
                "{} sources",
                count
            );
        }
    }

    #[test]
    fn empty_block_recompute() {
        let zeros = vec![0u8; 64 * 1024];
        let mut crc_value = 0u32;
        recompute_crc_if_block_empty(&zeros, &mut crc_value);
        assert_eq!(crc_value, crc(0, &zeros));

        // a non-empty block keeps its (wrong) CRC and fails verification
        let mut data = zeros.clone();
        data[17] = 1;
        let mut crc_value = 0u32;
        recompute_crc_if_block_empty(&data, &mut crc_value);
        assert_eq!(crc_value, 0);

        // a non-zero CRC is never touched
        let mut crc_value = 0xdeadbeef;
        recompute_crc_if_block_empty(&zeros, &mut crc_value);
        assert_eq!(crc_value, 0xdeadbeef);
    }
}
