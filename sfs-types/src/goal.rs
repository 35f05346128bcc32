//! Goals: the desired redundancy and placement of a chunk.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use crate::label::MediaLabel;
use crate::part_type::SliceType;

/// Numeric goal id as referenced by inodes. Ids outside the range are
/// refused by the configuration loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoalId(pub u8);

impl GoalId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 40;

    pub fn is_valid(id: i64) -> bool {
        (Self::MIN as i64..=Self::MAX as i64).contains(&id)
    }
}

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Multiset of labels: label -> requested (or present) count.
///
/// Ordered so that iteration visits concrete labels before the wildcard,
/// which is the order label-aware matching wants.
pub type Labels = BTreeMap<MediaLabel, u32>;

/// Sum of all counts in a label multiset.
pub fn labels_count(labels: &Labels) -> u32 {
    labels.values().sum()
}

/// One redundancy slice of a goal: a label multiset per expected part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slice {
    slice_type: SliceType,
    parts: Vec<Labels>,
}

impl Slice {
    pub fn new(slice_type: SliceType) -> Self {
        let parts = vec![Labels::new(); slice_type.expected_parts()];
        Self { slice_type, parts }
    }

    pub fn slice_type(&self) -> SliceType {
        self.slice_type
    }

    pub fn expected_parts(&self) -> usize {
        self.parts.len()
    }

    pub fn part(&self, index: usize) -> &Labels {
        &self.parts[index]
    }

    pub fn part_mut(&mut self, index: usize) -> &mut Labels {
        &mut self.parts[index]
    }

    pub fn parts(&self) -> impl Iterator<Item = &Labels> {
        self.parts.iter()
    }

    pub fn parts_mut(&mut self) -> impl Iterator<Item = &mut Labels> {
        self.parts.iter_mut()
    }

    /// Number of parts with at least one copy present.
    pub fn parts_present(&self) -> usize {
        self.parts.iter().filter(|labels| labels_count(labels) > 0).count()
    }

    /// Total number of part copies over all parts of the slice.
    pub fn copies_count(&self) -> u32 {
        self.parts.iter().map(labels_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.copies_count() == 0
    }

    /// Swap the label sets of two parts. Renaming parts inside a slice is
    /// free for XOR and EC slices, where all data parts are symmetric.
    pub fn swap_parts(&mut self, a: usize, b: usize) {
        self.parts.swap(a, b);
    }
}

/// Desired (or observed) state of a chunk's parts: an ordered collection of
/// slices, at most one per slice type.
///
/// A goal may combine `Standard` with at most one `XorN` slice and at most
/// one `ec(k,m)` slice; each contributes independently to redundancy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Goal {
    name: String,
    slices: BTreeMap<SliceType, Slice>,
}

impl Goal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slices: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_name_valid(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 32
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// Insert a slice, replacing a previous slice of the same type.
    ///
    /// Refuses a second XOR level or a second erasure code: the goal of a
    /// chunk holds at most one of each family.
    pub fn set_slice(&mut self, slice: Slice) -> Result<(), Error> {
        let slice_type = slice.slice_type();
        let conflict = self.slices.keys().any(|existing| {
            *existing != slice_type
                && ((existing.is_xor() && slice_type.is_xor())
                    || (existing.is_ec() && slice_type.is_ec()))
        });
        if conflict {
            bail!(
                "goal '{}' already has a {} slice",
                self.name,
                if slice_type.is_xor() { "xor" } else { "ec" }
            );
        }
        self.slices.insert(slice_type, slice);
        Ok(())
    }

    /// Insert or overwrite a slice without the one-per-family check. The
    /// available-parts goal tracked by the master is built this way, since
    /// stale parts of many levels can coexist on disk.
    pub fn put_slice(&mut self, slice: Slice) {
        self.slices.insert(slice.slice_type(), slice);
    }

    pub fn slice(&self, slice_type: SliceType) -> Option<&Slice> {
        self.slices.get(&slice_type)
    }

    pub fn slice_mut(&mut self, slice_type: SliceType) -> Option<&mut Slice> {
        self.slices.get_mut(&slice_type)
    }

    pub fn slice_or_insert(&mut self, slice_type: SliceType) -> &mut Slice {
        self.slices
            .entry(slice_type)
            .or_insert_with(|| Slice::new(slice_type))
    }

    pub fn remove_slice(&mut self, slice_type: SliceType) -> Option<Slice> {
        self.slices.remove(&slice_type)
    }

    pub fn slices(&self) -> impl Iterator<Item = &Slice> {
        self.slices.values()
    }

    pub fn slice_types(&self) -> impl Iterator<Item = SliceType> + '_ {
        self.slices.keys().copied()
    }

    pub fn has_slice(&self, slice_type: SliceType) -> bool {
        self.slices.contains_key(&slice_type)
    }

    pub fn is_empty(&self) -> bool {
        self.slices.values().all(Slice::is_empty)
    }

    /// Total number of part copies requested by the goal.
    pub fn expected_copies(&self) -> u32 {
        self.slices.values().map(Slice::copies_count).sum()
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:", self.name)?;
        for slice in self.slices.values() {
            write!(f, " ${}{{", slice.slice_type())?;
            let mut first = true;
            for labels in slice.parts() {
                for (label, count) in labels {
                    for _ in 0..*count {
                        if !first {
                            write!(f, " ")?;
                        }
                        write!(f, "{}", label)?;
                        first = false;
                    }
                }
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard_slice(copies: &[(& str, u32)]) -> Slice {
        let mut slice = Slice::new(SliceType::Standard);
        for (label, count) in copies {
            slice.part_mut(0).insert(MediaLabel::new(label).unwrap(), *count);
        }
        slice
    }

    #[test]
    fn slice_counting() {
        let slice = standard_slice(&[("_", 2), ("ssd", 1)]);
        assert_eq!(slice.copies_count(), 3);
        assert_eq!(slice.parts_present(), 1);

        let empty = Slice::new(SliceType::Xor(3));
        assert_eq!(empty.expected_parts(), 4);
        assert_eq!(empty.parts_present(), 0);
        assert!(empty.is_empty());
    }

    #[test]
    fn one_xor_slice_per_goal() {
        let mut goal = Goal::new("mixed");
        goal.set_slice(standard_slice(&[("_", 2)])).unwrap();
        goal.set_slice(Slice::new(SliceType::Xor(3))).unwrap();
        // replacing the same level is fine
        goal.set_slice(Slice::new(SliceType::Xor(3))).unwrap();
        assert!(goal.set_slice(Slice::new(SliceType::Xor(5))).is_err());
        // one ec slice is still allowed next to the xor slice
        goal.set_slice(Slice::new(SliceType::Ec(4, 2))).unwrap();
        assert!(goal.set_slice(Slice::new(SliceType::Ec(3, 2))).is_err());
    }

    #[test]
    fn expected_copies() {
        let mut goal = Goal::new("two");
        goal.set_slice(standard_slice(&[("_", 2)])).unwrap();
        let mut xor = Slice::new(SliceType::Xor(2));
        for part in xor.parts_mut() {
            part.insert(MediaLabel::WILDCARD, 1);
        }
        goal.set_slice(xor).unwrap();
        assert_eq!(goal.expected_copies(), 5);
    }

    #[test]
    fn goal_names() {
        assert!(Goal::is_name_valid("archive_goal"));
        assert!(!Goal::is_name_valid(""));
        assert!(!Goal::is_name_valid("white space"));
    }
}
