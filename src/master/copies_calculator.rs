//! Decides what to create, replicate and delete to bring a chunk from its
//! *available* part set to its *target* goal.
//!
//! Matching between available and target label multisets is label-aware
//! and greedy: explicit labels are satisfied first, wildcard slots absorb
//! whatever is left. An optimization pass may permute the part indices of
//! an XOR or EC slice, which is free because data parts are symmetric
//! under renaming; it reduces the number of cross-part moves the
//! replication scheduler would otherwise perform.

use std::collections::BTreeMap;

use sfs_types::availability::ChunkState;
use sfs_types::goal::labels_count;
use sfs_types::{Goal, Labels, MediaLabel, Slice, SliceType};

/// Per-part operation count: `(to_recover, to_remove)`.
type OpCount = (u32, u32);

pub struct ChunkCopiesCalculator {
    available: Goal,
    target: Goal,
    state: ChunkState,
    redundancy_level: i32,
    slice_state: BTreeMap<SliceType, ChunkState>,
    slice_op_count: BTreeMap<SliceType, Vec<OpCount>>,
    operation_count: OpCount,
}

impl ChunkCopiesCalculator {
    pub fn new(target: Goal) -> Self {
        Self {
            available: Goal::new("available"),
            target,
            state: ChunkState::Lost,
            redundancy_level: i32::MIN,
            slice_state: BTreeMap::new(),
            slice_op_count: BTreeMap::new(),
            operation_count: (0, 0),
        }
    }

    pub fn set_target(&mut self, target: Goal) {
        self.target = target;
    }

    pub fn available(&self) -> &Goal {
        &self.available
    }

    pub fn target(&self) -> &Goal {
        &self.target
    }

    pub fn add_part(&mut self, slice_type: SliceType, part: usize, label: MediaLabel) {
        let slice = self.available.slice_or_insert(slice_type);
        *slice.part_mut(part).entry(label).or_insert(0) += 1;
    }

    pub fn remove_part(&mut self, slice_type: SliceType, part: usize, label: &MediaLabel) {
        if let Some(slice) = self.available.slice_mut(slice_type) {
            if let Some(count) = slice.part_mut(part).get_mut(label) {
                *count -= 1;
                if *count == 0 {
                    slice.part_mut(part).remove(label);
                }
            }
            if slice.is_empty() {
                self.available.remove_slice(slice_type);
            }
        }
    }

    /// Permute part indices inside each slice to minimize the operation
    /// count, then evaluate state and per-slice operation counts. Query
    /// methods are meaningful only after this ran.
    pub fn optimize(&mut self) {
        let slice_types: Vec<SliceType> = self.available.slice_types().collect();
        for slice_type in slice_types {
            if slice_type.expected_parts() < 2 || !self.target.has_slice(slice_type) {
                continue;
            }
            self.permute_slice(slice_type);
        }
        self.eval_operation_count();
        self.eval_state();
    }

    /// Greedy assignment of target label columns to available part
    /// columns, cheapest pair first. Only the label *requirements* are
    /// permuted; which concrete part carries which label never matters,
    /// while the available parts keep their identities.
    fn permute_slice(&mut self, slice_type: SliceType) {
        let parts = slice_type.expected_parts();
        let available = self.available.slice(slice_type).unwrap();
        let target = self.target.slice(slice_type).unwrap();

        let mut costs: Vec<(u32, usize, usize)> = Vec::with_capacity(parts * parts);
        for part in 0..parts {
            for column in 0..parts {
                let (recover, remove) = operation_count(available.part(part), target.part(column));
                costs.push((recover + remove, part, column));
            }
        }
        costs.sort();

        let mut taken_part = vec![false; parts];
        let mut taken_column = vec![false; parts];
        let mut assignment = vec![usize::MAX; parts];
        for (_, part, column) in costs {
            if !taken_part[part] && !taken_column[column] {
                taken_part[part] = true;
                taken_column[column] = true;
                assignment[part] = column;
            }
        }

        let mut permuted = Slice::new(slice_type);
        for (part, column) in assignment.iter().enumerate() {
            *permuted.part_mut(part) = target.part(*column).clone();
        }
        self.target.put_slice(permuted);
    }

    fn eval_operation_count(&mut self) {
        self.slice_op_count.clear();
        let mut total = (0u32, 0u32);

        let mut slice_types: Vec<SliceType> = self.target.slice_types().collect();
        for slice_type in self.available.slice_types() {
            if !slice_types.contains(&slice_type) {
                slice_types.push(slice_type);
            }
        }

        for slice_type in slice_types {
            let empty = Slice::new(slice_type);
            let available = self.available.slice(slice_type).unwrap_or(&empty);
            let target = self.target.slice(slice_type).unwrap_or(&empty);
            let mut per_part = Vec::with_capacity(slice_type.expected_parts());
            for part in 0..slice_type.expected_parts() {
                let ops = operation_count(available.part(part), target.part(part));
                total.0 += ops.0;
                total.1 += ops.1;
                per_part.push(ops);
            }
            self.slice_op_count.insert(slice_type, per_part);
        }
        self.operation_count = total;
    }

    /// Evaluate the chunk state from the redundancy level of every
    /// available slice; the chunk is as healthy as its healthiest slice.
    pub fn eval_state(&mut self) {
        self.slice_state.clear();
        self.redundancy_level = i32::MIN;
        for slice in self.available.slices() {
            let level = slice_redundancy_level(slice);
            self.slice_state.insert(slice.slice_type(), state_of(level));
            self.redundancy_level = self.redundancy_level.max(level);
        }
        if self.available.slices().next().is_none() {
            self.redundancy_level = -1;
        }
        self.state = state_of(self.redundancy_level);
    }

    /// Re-evaluate after modifications to one slice.
    pub fn update_state(&mut self, slice_type: SliceType) {
        match self.available.slice(slice_type) {
            Some(slice) => {
                let level = slice_redundancy_level(slice);
                self.slice_state.insert(slice_type, state_of(level));
            }
            None => {
                self.slice_state.remove(&slice_type);
            }
        }
        // the combined state is cheap enough to recompute outright
        self.eval_state();
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Signed redundancy level: how many more parts may be lost without
    /// losing data.
    pub fn redundancy_level(&self) -> i32 {
        self.redundancy_level
    }

    pub fn count_parts_to_recover(&self) -> u32 {
        self.operation_count.0
    }

    pub fn count_parts_to_remove(&self) -> u32 {
        self.operation_count.1
    }

    pub fn count_parts_to_move(&self, slice_type: SliceType, part: usize) -> OpCount {
        self.slice_op_count
            .get(&slice_type)
            .and_then(|parts| parts.get(part))
            .copied()
            .unwrap_or((0, 0))
    }

    pub fn is_recovery_possible(&self) -> bool {
        self.state != ChunkState::Lost
    }

    pub fn is_writing_possible(&self) -> bool {
        // writing to an unrecoverable chunk would only spread damage
        self.state != ChunkState::Lost
    }

    /// Number of full copies of the chunk data: every standard part is one
    /// copy, a complete data part set of an XOR or EC slice is one copy.
    pub fn full_copies_count(&self) -> u32 {
        full_copies_count(&self.available)
    }

    /// True if removing one part copy from `label` keeps the chunk safe.
    pub fn can_remove_part(&self, slice_type: SliceType, part: usize, label: &MediaLabel) -> bool {
        let Some(slice) = self.available.slice(slice_type) else {
            return false;
        };
        if slice.part(part).get(label).copied().unwrap_or(0) == 0 {
            return false;
        }
        let mut trimmed = self.available.clone();
        if let Some(slice) = trimmed.slice_mut(slice_type) {
            if let Some(count) = slice.part_mut(part).get_mut(label) {
                *count -= 1;
                if *count == 0 {
                    slice.part_mut(part).remove(label);
                }
            }
        }
        let mut level = i32::MIN;
        for slice in trimmed.slices() {
            level = level.max(slice_redundancy_level(slice));
        }
        state_of(level) == ChunkState::Safe
    }

    /// True if a part copy on `label` may move to a differently labelled
    /// server without violating the target goal.
    pub fn can_move_part_to_different_label(
        &self,
        slice_type: SliceType,
        part: usize,
        label: &MediaLabel,
    ) -> bool {
        if label.is_wildcard() {
            return true;
        }
        let have = self
            .available
            .slice(slice_type)
            .map(|slice| slice.part(part).get(label).copied().unwrap_or(0))
            .unwrap_or(0);
        if have == 0 {
            return false;
        }
        let pinned = self
            .target
            .slice(slice_type)
            .map(|slice| slice.part(part).get(label).copied().unwrap_or(0))
            .unwrap_or(0);
        have > pinned
    }

    /// Labels new replicas of `(slice, part)` must be created on; wildcard
    /// entries may land anywhere.
    pub fn labels_to_recover(&self, slice_type: SliceType, part: usize) -> Labels {
        let empty = Slice::new(slice_type);
        let available = self
            .available
            .slice(slice_type)
            .unwrap_or(&empty)
            .part(part);
        let Some(target_slice) = self.target.slice(slice_type) else {
            return Labels::new();
        };
        let target = target_slice.part(part);

        let mut result = Labels::new();
        let mut surplus = 0u32;
        for (label, &have) in available {
            if label.is_wildcard() {
                surplus += have;
                continue;
            }
            let wanted = target.get(label).copied().unwrap_or(0);
            surplus += have.saturating_sub(wanted);
        }
        for (label, &wanted) in target {
            if label.is_wildcard() {
                continue;
            }
            let have = available.get(label).copied().unwrap_or(0);
            if wanted > have {
                result.insert(*label, wanted - have);
            }
        }
        let wildcard_wanted = target.get(&MediaLabel::WILDCARD).copied().unwrap_or(0);
        if wildcard_wanted > surplus {
            result.insert(MediaLabel::WILDCARD, wildcard_wanted - surplus);
        }
        result
    }

    /// Labels from which exactly one copy of `(slice, part)` may be
    /// removed; the scheduler picks the actual server by disk usage.
    pub fn remove_pool(&self, slice_type: SliceType, part: usize) -> Labels {
        let Some(available_slice) = self.available.slice(slice_type) else {
            return Labels::new();
        };
        let available = available_slice.part(part);
        let empty = Labels::new();
        let target = self
            .target
            .slice(slice_type)
            .map(|slice| slice.part(part))
            .unwrap_or(&empty);
        let baseline = operation_count(available, target);

        let mut pool = Labels::new();
        for label in available.keys() {
            let mut trimmed = available.clone();
            let count = trimmed.get_mut(label).unwrap();
            *count -= 1;
            if *count == 0 {
                trimmed.remove(label);
            }
            let after = operation_count(&trimmed, target);
            // removing this copy must not create a recovery
            if after.0 == baseline.0 {
                pool.insert(*label, 1);
            }
        }
        pool
    }
}

/// Greedy label-aware matching of one available label multiset against one
/// target multiset: `(to_recover, to_remove)`.
///
/// Concrete labels match first; target wildcard slots then absorb any
/// remaining copies regardless of their label.
pub fn operation_count(available: &Labels, target: &Labels) -> OpCount {
    let mut matched = 0u32;
    for (label, &wanted) in target {
        if label.is_wildcard() {
            continue;
        }
        matched += wanted.min(available.get(label).copied().unwrap_or(0));
    }
    let available_total = labels_count(available);
    let target_total = labels_count(target);
    let wildcard_wanted = target.get(&MediaLabel::WILDCARD).copied().unwrap_or(0);
    let leftover = available_total - matched;
    matched += wildcard_wanted.min(leftover);

    (target_total - matched, available_total - matched)
}

/// Redundancy contributed by one available slice: how many more parts it
/// can lose before the chunk data it encodes becomes unavailable.
pub fn slice_redundancy_level(slice: &Slice) -> i32 {
    match slice.slice_type() {
        SliceType::Standard => labels_count(slice.part(0)) as i32 - 1,
        SliceType::Xor(_) | SliceType::Ec(..) => {
            let needed = slice.slice_type().data_parts() as i32;
            let distinct_present = slice.parts_present() as i32;
            // duplicate copies of one part add tolerance for that part only;
            // counting distinct parts is the conservative lower bound
            distinct_present - needed
        }
    }
}

fn state_of(redundancy_level: i32) -> ChunkState {
    if redundancy_level > 0 {
        ChunkState::Safe
    } else if redundancy_level == 0 {
        ChunkState::Endangered
    } else {
        ChunkState::Lost
    }
}

/// Full data copies in a goal: standard parts count each, a complete data
/// set of an XOR or EC slice counts once.
pub fn full_copies_count(goal: &Goal) -> u32 {
    let mut copies = 0;
    for slice in goal.slices() {
        match slice.slice_type() {
            SliceType::Standard => copies += labels_count(slice.part(0)),
            SliceType::Xor(level) => {
                let complete = (1..=level as usize)
                    .map(|part| labels_count(slice.part(part)))
                    .min()
                    .unwrap_or(0);
                copies += complete;
            }
            SliceType::Ec(k, _) => {
                let complete = (0..k as usize)
                    .map(|part| labels_count(slice.part(part)))
                    .min()
                    .unwrap_or(0);
                copies += complete;
            }
        }
    }
    copies
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(name: &str) -> MediaLabel {
        MediaLabel::new(name).unwrap()
    }

    fn labels(entries: &[(&str, u32)]) -> Labels {
        entries
            .iter()
            .map(|(name, count)| (label(name), *count))
            .collect()
    }

    fn standard_target(entries: &[(&str, u32)]) -> Goal {
        let mut goal = Goal::new("test");
        let mut slice = Slice::new(SliceType::Standard);
        *slice.part_mut(0) = labels(entries);
        goal.set_slice(slice).unwrap();
        goal
    }

    #[test]
    fn label_matching() {
        // target: 2 anywhere + 1 on ssd
        let target = labels(&[("_", 2), ("ssd", 1)]);
        // nothing available: recover 3
        assert_eq!(operation_count(&Labels::new(), &target), (3, 0));
        // one ssd + one hdd: recover 1 (wildcard), remove 0
        assert_eq!(operation_count(&labels(&[("ssd", 1), ("hdd", 1)]), &target), (1, 0));
        // three hdd: the ssd slot stays empty, one hdd is surplus
        assert_eq!(operation_count(&labels(&[("hdd", 3)]), &target), (1, 1));
        // exactly satisfied
        assert_eq!(
            operation_count(&labels(&[("ssd", 1), ("hdd", 2)]), &target),
            (0, 0)
        );
        // over-satisfied
        assert_eq!(operation_count(&labels(&[("ssd", 4)]), &target), (0, 1));
    }

    #[test]
    fn standard_goal_accounting() {
        let mut calculator = ChunkCopiesCalculator::new(standard_target(&[("_", 2)]));
        calculator.add_part(SliceType::Standard, 0, label("A"));
        calculator.add_part(SliceType::Standard, 0, label("B"));
        calculator.add_part(SliceType::Standard, 0, label("C"));
        calculator.optimize();
        assert_eq!(calculator.count_parts_to_recover(), 0);
        assert_eq!(calculator.count_parts_to_remove(), 1);
        assert_eq!(calculator.state(), ChunkState::Safe);
        assert_eq!(calculator.redundancy_level(), 2);
        assert_eq!(calculator.full_copies_count(), 3);
    }

    #[test]
    fn standard_and_xor3_goal() {
        // target: two standard copies anywhere plus a full xor3 slice
        let mut target = standard_target(&[("_", 2)]);
        let mut xor = Slice::new(SliceType::Xor(3));
        for part in xor.parts_mut() {
            part.insert(MediaLabel::WILDCARD, 1);
        }
        target.set_slice(xor).unwrap();

        // available: one standard copy, xor3 parts 1 and 2
        let mut calculator = ChunkCopiesCalculator::new(target);
        calculator.add_part(SliceType::Standard, 0, label("A"));
        calculator.add_part(SliceType::Xor(3), 1, label("A"));
        calculator.add_part(SliceType::Xor(3), 2, label("B"));
        calculator.optimize();

        // one standard copy plus xor part 3 and parity are missing
        assert_eq!(calculator.count_parts_to_recover(), 3);
        assert_eq!(calculator.count_parts_to_remove(), 0);
        // the standard copy keeps the data readable, but losing it loses
        // data: redundancy 0, endangered
        assert_eq!(calculator.redundancy_level(), 0);
        assert_eq!(calculator.state(), ChunkState::Endangered);
        assert_eq!(calculator.full_copies_count(), 1);
        assert!(calculator.is_recovery_possible());
    }

    #[test]
    fn redundancy_levels_per_slice() {
        let slice_of = |slice_type: SliceType, parts: &[usize]| {
            let mut slice = Slice::new(slice_type);
            for &part in parts {
                slice.part_mut(part).insert(MediaLabel::WILDCARD, 1);
            }
            slice
        };
        // full xor2 slice: 3 of 2 needed parts
        assert_eq!(slice_redundancy_level(&slice_of(SliceType::Xor(2), &[0, 1, 2])), 1);
        // missing parity: exactly 2 of 2
        assert_eq!(slice_redundancy_level(&slice_of(SliceType::Xor(2), &[1, 2])), 0);
        // missing a data part and parity: lost
        assert_eq!(slice_redundancy_level(&slice_of(SliceType::Xor(2), &[1])), -1);
        // ec(3,2) with 4 parts: one to spare
        assert_eq!(
            slice_redundancy_level(&slice_of(SliceType::Ec(3, 2), &[0, 1, 2, 3])),
            1
        );
        assert_eq!(
            slice_redundancy_level(&slice_of(SliceType::Ec(3, 2), &[0, 1])),
            -1
        );
    }

    #[test]
    fn permutation_reduces_operations() {
        // target xor2 requires: parity on ssd, part 1 on hdd, part 2
        // anywhere; the available copies sit on the "wrong" columns
        let mut target = Goal::new("xor2");
        let mut slice = Slice::new(SliceType::Xor(2));
        slice.part_mut(0).insert(label("ssd"), 1);
        slice.part_mut(1).insert(label("hdd"), 1);
        slice.part_mut(2).insert(MediaLabel::WILDCARD, 1);
        target.set_slice(slice).unwrap();

        let mut calculator = ChunkCopiesCalculator::new(target);
        calculator.add_part(SliceType::Xor(2), 0, label("hdd"));
        calculator.add_part(SliceType::Xor(2), 1, label("ssd"));
        calculator.optimize();
        // relabeling the requirement columns makes both existing parts
        // match; only part 2 needs a new copy
        assert_eq!(calculator.count_parts_to_recover(), 1);
        assert_eq!(calculator.count_parts_to_remove(), 0);
    }

    #[test]
    fn can_remove_part_keeps_chunk_safe() {
        let mut calculator = ChunkCopiesCalculator::new(standard_target(&[("_", 2)]));
        calculator.add_part(SliceType::Standard, 0, label("A"));
        calculator.add_part(SliceType::Standard, 0, label("B"));
        calculator.add_part(SliceType::Standard, 0, label("C"));
        calculator.optimize();
        assert!(calculator.can_remove_part(SliceType::Standard, 0, &label("C")));

        let mut calculator = ChunkCopiesCalculator::new(standard_target(&[("_", 2)]));
        calculator.add_part(SliceType::Standard, 0, label("A"));
        calculator.add_part(SliceType::Standard, 0, label("B"));
        calculator.optimize();
        // removing either copy would leave the chunk endangered
        assert!(!calculator.can_remove_part(SliceType::Standard, 0, &label("A")));
        // a label with no copy cannot be removed from
        assert!(!calculator.can_remove_part(SliceType::Standard, 0, &label("C")));
    }

    #[test]
    fn move_and_recover_queries() {
        let mut calculator =
            ChunkCopiesCalculator::new(standard_target(&[("ssd", 1), ("_", 1)]));
        calculator.add_part(SliceType::Standard, 0, label("ssd"));
        calculator.optimize();
        // the only ssd copy is pinned by the goal
        assert!(!calculator.can_move_part_to_different_label(
            SliceType::Standard,
            0,
            &label("ssd")
        ));
        let to_recover = calculator.labels_to_recover(SliceType::Standard, 0);
        assert_eq!(to_recover, labels(&[("_", 1)]));

        calculator.add_part(SliceType::Standard, 0, label("ssd"));
        calculator.optimize();
        // now one of the two ssd copies may move
        assert!(calculator.can_move_part_to_different_label(
            SliceType::Standard,
            0,
            &label("ssd")
        ));
        assert!(calculator.labels_to_recover(SliceType::Standard, 0).is_empty());
    }

    #[test]
    fn remove_pool_prefers_surplus_labels() {
        let mut calculator =
            ChunkCopiesCalculator::new(standard_target(&[("ssd", 1), ("_", 1)]));
        calculator.add_part(SliceType::Standard, 0, label("ssd"));
        calculator.add_part(SliceType::Standard, 0, label("hdd"));
        calculator.add_part(SliceType::Standard, 0, label("hdd"));
        calculator.optimize();
        let pool = calculator.remove_pool(SliceType::Standard, 0);
        // removing an hdd copy costs nothing; removing the ssd copy would
        // force a recovery
        assert!(pool.contains_key(&label("hdd")));
        assert!(!pool.contains_key(&label("ssd")));
    }

    #[test]
    fn monotonicity_after_applying_operations() {
        // applying the recoveries suggested by the calculator never
        // lowers the redundancy level
        let mut target = Goal::new("xor3");
        let mut slice = Slice::new(SliceType::Xor(3));
        for part in slice.parts_mut() {
            part.insert(MediaLabel::WILDCARD, 1);
        }
        target.set_slice(slice).unwrap();

        let mut calculator = ChunkCopiesCalculator::new(target.clone());
        calculator.add_part(SliceType::Xor(3), 1, label("A"));
        calculator.add_part(SliceType::Xor(3), 2, label("B"));
        calculator.add_part(SliceType::Xor(3), 3, label("C"));
        calculator.optimize();
        let before = calculator.redundancy_level();
        assert_eq!(before, 0);
        let recover_count = calculator.count_parts_to_recover();
        assert_eq!(recover_count, 1);

        // apply: create the missing parity part
        calculator.add_part(SliceType::Xor(3), 0, label("D"));
        calculator.optimize();
        assert!(calculator.redundancy_level() >= before);
        assert_eq!(calculator.state(), ChunkState::Safe);
    }
}
