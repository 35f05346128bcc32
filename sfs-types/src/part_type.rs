//! Slice kinds and the compact chunk part type.
//!
//! A part type combines the redundancy scheme of a slice with the index of
//! the part inside it. The master keeps one of these in every chunk part
//! entry, so the representation is a single `u16`.

use std::fmt;

use anyhow::{bail, Error};

/// Limits of the Reed-Solomon slice family.
pub const EC_MIN_DATA_PARTS: u8 = 2;
pub const EC_MAX_DATA_PARTS: u8 = 32;
pub const EC_MIN_PARITY_PARTS: u8 = 1;
pub const EC_MAX_PARITY_PARTS: u8 = 32;

pub const MIN_XOR_LEVEL: u8 = 2;
pub const MAX_XOR_LEVEL: u8 = 9;

/// Redundancy scheme of a slice.
///
/// `Xor1` does not exist: `Standard` is the only single-part slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SliceType {
    /// A single part holding a full copy of the chunk.
    Standard,
    /// N data parts (round-robin over blocks) plus one XOR parity part.
    Xor(u8),
    /// k data parts plus m Reed-Solomon parity parts over GF(2^8).
    Ec(u8, u8),
}

const EC_ID_BASE: u16 = 1 + (MAX_XOR_LEVEL - MIN_XOR_LEVEL + 1) as u16;

impl SliceType {
    /// Number of parts a complete slice of this type consists of.
    pub fn expected_parts(&self) -> usize {
        match *self {
            SliceType::Standard => 1,
            SliceType::Xor(level) => level as usize + 1,
            SliceType::Ec(k, m) => k as usize + m as usize,
        }
    }

    /// Number of parts carrying plain chunk data.
    pub fn data_parts(&self) -> usize {
        match *self {
            SliceType::Standard => 1,
            SliceType::Xor(level) => level as usize,
            SliceType::Ec(k, _) => k as usize,
        }
    }

    pub fn parity_parts(&self) -> usize {
        self.expected_parts() - self.data_parts()
    }

    pub fn is_standard(&self) -> bool {
        matches!(self, SliceType::Standard)
    }

    pub fn is_xor(&self) -> bool {
        matches!(self, SliceType::Xor(_))
    }

    pub fn is_ec(&self) -> bool {
        matches!(self, SliceType::Ec(..))
    }

    pub fn xor_level(&self) -> Option<u8> {
        match *self {
            SliceType::Xor(level) => Some(level),
            _ => None,
        }
    }

    /// Dense numeric id: 0 is `Standard`, 1..=8 are `Xor2`..`Xor9`, the
    /// `ec(k,m)` family is mapped above them.
    pub fn id(&self) -> u16 {
        match *self {
            SliceType::Standard => 0,
            SliceType::Xor(level) => (level - MIN_XOR_LEVEL) as u16 + 1,
            SliceType::Ec(k, m) => {
                EC_ID_BASE
                    + (k - EC_MIN_DATA_PARTS) as u16 * EC_MAX_PARITY_PARTS as u16
                    + (m - EC_MIN_PARITY_PARTS) as u16
            }
        }
    }

    pub fn from_id(id: u16) -> Result<Self, Error> {
        if id == 0 {
            return Ok(SliceType::Standard);
        }
        if id < EC_ID_BASE {
            return Ok(SliceType::Xor((id - 1) as u8 + MIN_XOR_LEVEL));
        }
        let ec = id - EC_ID_BASE;
        let k = (ec / EC_MAX_PARITY_PARTS as u16) as u8 + EC_MIN_DATA_PARTS;
        let m = (ec % EC_MAX_PARITY_PARTS as u16) as u8 + EC_MIN_PARITY_PARTS;
        if k > EC_MAX_DATA_PARTS {
            bail!("unknown slice type id {}", id);
        }
        Ok(SliceType::Ec(k, m))
    }

    pub fn xor(level: u8) -> Result<Self, Error> {
        if !(MIN_XOR_LEVEL..=MAX_XOR_LEVEL).contains(&level) {
            bail!("xor level {} out of range", level);
        }
        Ok(SliceType::Xor(level))
    }

    pub fn ec(k: u8, m: u8) -> Result<Self, Error> {
        if !(EC_MIN_DATA_PARTS..=EC_MAX_DATA_PARTS).contains(&k)
            || !(EC_MIN_PARITY_PARTS..=EC_MAX_PARITY_PARTS).contains(&m)
        {
            bail!("erasure code ec({},{}) out of range", k, m);
        }
        Ok(SliceType::Ec(k, m))
    }
}

impl fmt::Display for SliceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SliceType::Standard => write!(f, "std"),
            SliceType::Xor(level) => write!(f, "xor{}", level),
            SliceType::Ec(k, m) => write!(f, "ec({},{})", k, m),
        }
    }
}

/// Maximum number of parts in any slice, fixed by the part type encoding.
pub const MAX_PARTS_IN_SLICE: usize = 64;

/// Compact `(slice type, part index)` pair.
///
/// For `Standard` the only part index is 0. For `XorN` index 0 is the
/// parity part and 1..=N are the data parts. For `ec(k,m)` indices 0..k
/// are data and k..k+m are parity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkPartType {
    id: u16,
}

impl ChunkPartType {
    pub fn new(slice_type: SliceType, part: usize) -> Result<Self, Error> {
        if part >= slice_type.expected_parts() {
            bail!("part index {} out of range for slice {}", part, slice_type);
        }
        Ok(Self {
            id: slice_type.id() * MAX_PARTS_IN_SLICE as u16 + part as u16,
        })
    }

    pub fn standard() -> Self {
        Self { id: 0 }
    }

    pub fn xor_data(level: u8, part: u8) -> Result<Self, Error> {
        if part == 0 || part > level {
            bail!("xor{} has no data part {}", level, part);
        }
        Self::new(SliceType::xor(level)?, part as usize)
    }

    pub fn xor_parity(level: u8) -> Result<Self, Error> {
        Self::new(SliceType::xor(level)?, 0)
    }

    pub fn slice_type(&self) -> SliceType {
        // the id was validated on construction
        SliceType::from_id(self.id / MAX_PARTS_IN_SLICE as u16).unwrap()
    }

    pub fn slice_part(&self) -> usize {
        (self.id % MAX_PARTS_IN_SLICE as u16) as usize
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn from_id(id: u16) -> Result<Self, Error> {
        let slice_type = SliceType::from_id(id / MAX_PARTS_IN_SLICE as u16)?;
        let part = (id % MAX_PARTS_IN_SLICE as u16) as usize;
        Self::new(slice_type, part)
    }

    pub fn is_standard(&self) -> bool {
        self.slice_type().is_standard()
    }

    pub fn is_xor_parity(&self) -> bool {
        self.slice_type().is_xor() && self.slice_part() == 0
    }

    pub fn is_xor_data(&self) -> bool {
        self.slice_type().is_xor() && self.slice_part() != 0
    }

    /// True for parts whose loss does not remove plain chunk data.
    pub fn is_parity(&self) -> bool {
        match self.slice_type() {
            SliceType::Standard => false,
            SliceType::Xor(_) => self.slice_part() == 0,
            SliceType::Ec(k, _) => self.slice_part() >= k as usize,
        }
    }
}

impl Default for ChunkPartType {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Display for ChunkPartType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.slice_type(), self.slice_part())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_type_id_roundtrip() {
        let mut types = vec![SliceType::Standard];
        for level in MIN_XOR_LEVEL..=MAX_XOR_LEVEL {
            types.push(SliceType::Xor(level));
        }
        for k in [2u8, 3, 17, 32] {
            for m in [1u8, 2, 31, 32] {
                types.push(SliceType::Ec(k, m));
            }
        }
        for t in types {
            assert_eq!(SliceType::from_id(t.id()).unwrap(), t, "{}", t);
        }
    }

    #[test]
    fn slice_type_ids_unique() {
        let mut seen = std::collections::HashSet::new();
        assert!(seen.insert(SliceType::Standard.id()));
        for level in MIN_XOR_LEVEL..=MAX_XOR_LEVEL {
            assert!(seen.insert(SliceType::Xor(level).id()));
        }
        for k in EC_MIN_DATA_PARTS..=EC_MAX_DATA_PARTS {
            for m in EC_MIN_PARITY_PARTS..=EC_MAX_PARITY_PARTS {
                assert!(seen.insert(SliceType::Ec(k, m).id()));
            }
        }
    }

    #[test]
    fn xor1_is_rejected() {
        assert!(SliceType::xor(1).is_err());
        assert!(ChunkPartType::xor_parity(1).is_err());
    }

    #[test]
    fn part_type_roundtrip() {
        let cases = [
            ChunkPartType::standard(),
            ChunkPartType::xor_parity(3).unwrap(),
            ChunkPartType::xor_data(3, 2).unwrap(),
            ChunkPartType::new(SliceType::Ec(4, 2), 5).unwrap(),
        ];
        for cpt in cases {
            assert_eq!(ChunkPartType::from_id(cpt.id()).unwrap(), cpt);
        }
    }

    #[test]
    fn part_type_rejects_out_of_range_part() {
        assert!(ChunkPartType::new(SliceType::Standard, 1).is_err());
        assert!(ChunkPartType::new(SliceType::Xor(3), 4).is_err());
        assert!(ChunkPartType::new(SliceType::Ec(4, 2), 6).is_err());
        // id 1 in the standard range names a nonexistent part
        assert!(ChunkPartType::from_id(1).is_err());
    }

    #[test]
    fn parity_classification() {
        assert!(!ChunkPartType::standard().is_parity());
        assert!(ChunkPartType::xor_parity(2).unwrap().is_parity());
        assert!(!ChunkPartType::xor_data(2, 1).unwrap().is_parity());
        let ec = SliceType::Ec(4, 2);
        assert!(!ChunkPartType::new(ec, 3).unwrap().is_parity());
        assert!(ChunkPartType::new(ec, 4).unwrap().is_parity());
    }

    #[test]
    fn display_forms() {
        assert_eq!(ChunkPartType::standard().to_string(), "std:0");
        assert_eq!(ChunkPartType::xor_data(5, 4).unwrap().to_string(), "xor5:4");
        assert_eq!(
            ChunkPartType::new(SliceType::Ec(6, 3), 7).unwrap().to_string(),
            "ec(6,3):7"
        );
    }
}
