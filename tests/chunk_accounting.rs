//! Master-side accounting: goal configuration feeding the copies
//! calculator, the server chooser and the per-goal health counters.

use shardfs::master::goal_config;
use shardfs::master::server_chooser::{ChooserOptions, ServerChooser, ServerEntry};
use shardfs::ChunkCopiesCalculator;

use sfs_types::availability::{ChunkState, ChunksAvailabilityState, ChunksReplicationState};
use sfs_types::goal::GoalId;
use sfs_types::{MediaLabel, SliceType};

fn label(name: &str) -> MediaLabel {
    MediaLabel::new(name).unwrap()
}

#[test]
fn standard_two_plus_xor3_accounting() {
    // goal 21: two plain copies; goal 22: an xor3 slice. A chunk carrying
    // both goals is accounted against their union.
    let goals = goal_config::load("21 twocopies: _ _\n22 striped: $xor3\n").unwrap();

    let mut target = goals[&GoalId(21)].clone();
    for slice in goals[&GoalId(22)].slices() {
        target.set_slice(slice.clone()).unwrap();
    }

    // available: one standard copy on A, xor3 parts 1 on A and 2 on B
    let mut calculator = ChunkCopiesCalculator::new(target);
    calculator.add_part(SliceType::Standard, 0, label("A"));
    calculator.add_part(SliceType::Xor(3), 1, label("A"));
    calculator.add_part(SliceType::Xor(3), 2, label("B"));
    calculator.optimize();

    // one standard copy, xor part 3 and parity are missing; nothing is
    // redundant
    assert_eq!(calculator.count_parts_to_recover(), 3);
    assert_eq!(calculator.count_parts_to_remove(), 0);
    // the standard copy keeps the data readable, but it is the only
    // thing standing between the chunk and data loss
    assert_eq!(calculator.redundancy_level(), 0);
    assert_eq!(calculator.state(), ChunkState::Endangered);
    assert!(calculator.is_recovery_possible());

    // recovery targets: anywhere, for each missing part
    let recover_standard = calculator.labels_to_recover(SliceType::Standard, 0);
    assert_eq!(recover_standard.get(&MediaLabel::WILDCARD), Some(&1));
    let recover_parity = calculator.labels_to_recover(SliceType::Xor(3), 0);
    assert_eq!(recover_parity.get(&MediaLabel::WILDCARD), Some(&1));
    assert!(calculator.labels_to_recover(SliceType::Xor(3), 1).is_empty());
}

#[test]
fn scheduled_recovery_feeds_the_chooser_and_counters() {
    let goals = goal_config::load("5 five: _ _ _\n").unwrap();
    let target = goals[&GoalId(5)].clone();

    let mut calculator = ChunkCopiesCalculator::new(target);
    calculator.add_part(SliceType::Standard, 0, label("A"));
    calculator.optimize();
    assert_eq!(calculator.count_parts_to_recover(), 2);
    assert_eq!(calculator.state(), ChunkState::Endangered);

    // health counters before recovery
    let mut availability = ChunksAvailabilityState::new();
    let mut replication = ChunksReplicationState::new();
    availability.add_chunk(GoalId(5), calculator.state());
    replication.add_chunk(
        GoalId(5),
        calculator.count_parts_to_recover() as usize,
        calculator.count_parts_to_remove() as usize,
    );
    assert_eq!(availability.endangered_chunks(GoalId(5)), 1);
    assert_eq!(replication.chunks_to_replicate(GoalId(5), 2), 1);

    // the chooser places the two new replicas on distinct servers
    let mut chooser = ServerChooser::new(ChooserOptions { avoid_same_ip: false });
    for (id, server_label, weight) in [(1, "A", 100), (2, "B", 200), (3, "C", 50)] {
        chooser.add_server(ServerEntry {
            id,
            label: label(server_label),
            ip: id as u32,
            weight,
            active_replications: 0,
            replication_limit: 4,
        });
    }
    let to_recover = calculator.labels_to_recover(SliceType::Standard, 0);
    let mut used = vec![1]; // server A already holds a copy
    let chosen = chooser.choose_servers_for_labels(&to_recover, &mut used);
    assert_eq!(chosen.len(), 2);
    assert!(!chosen.contains(&1));
    assert_ne!(chosen[0], chosen[1]);

    // after the recoveries complete the chunk is safe and the counters
    // move over
    availability.remove_chunk(GoalId(5), calculator.state());
    replication.remove_chunk(GoalId(5), 2, 0);
    calculator.add_part(SliceType::Standard, 0, label("B"));
    calculator.add_part(SliceType::Standard, 0, label("C"));
    calculator.optimize();
    assert_eq!(calculator.count_parts_to_recover(), 0);
    assert_eq!(calculator.state(), ChunkState::Safe);
    assert_eq!(calculator.redundancy_level(), 2);
    availability.add_chunk(GoalId(5), calculator.state());
    assert_eq!(availability.endangered_chunks(GoalId(5)), 0);
    assert_eq!(availability.safe_chunks(GoalId(5)), 1);
}

#[test]
fn surplus_copies_are_removed_from_the_fullest_servers() {
    let goals = goal_config::load("2 two: _ _\n").unwrap();
    let mut calculator = ChunkCopiesCalculator::new(goals[&GoalId(2)].clone());
    for server in ["A", "B", "C", "D"] {
        calculator.add_part(SliceType::Standard, 0, label(server));
    }
    calculator.optimize();
    assert_eq!(calculator.count_parts_to_recover(), 0);
    assert_eq!(calculator.count_parts_to_remove(), 2);
    assert_eq!(calculator.state(), ChunkState::Safe);

    // any of the four labels may lose one copy without endangering the
    // chunk; the master picks the actual victim by free-space policy
    let pool = calculator.remove_pool(SliceType::Standard, 0);
    assert_eq!(pool.len(), 4);
    for server in ["A", "B", "C", "D"] {
        assert!(calculator.can_remove_part(SliceType::Standard, 0, &label(server)));
    }
}

#[test]
fn ec_goal_end_to_end_accounting() {
    let goals = goal_config::load("30 wide: $ec(4,2)\n").unwrap();
    let mut calculator = ChunkCopiesCalculator::new(goals[&GoalId(30)].clone());
    // five of six shards present
    for shard in 0..5 {
        calculator.add_part(SliceType::Ec(4, 2), shard, label("A"));
    }
    calculator.optimize();
    assert_eq!(calculator.count_parts_to_recover(), 1);
    assert_eq!(calculator.redundancy_level(), 1);
    assert_eq!(calculator.state(), ChunkState::Safe);

    // losing two shards makes it endangered, three lost
    calculator.remove_part(SliceType::Ec(4, 2), 4, &label("A"));
    calculator.optimize();
    assert_eq!(calculator.redundancy_level(), 0);
    assert_eq!(calculator.state(), ChunkState::Endangered);
    calculator.remove_part(SliceType::Ec(4, 2), 3, &label("A"));
    calculator.optimize();
    assert_eq!(calculator.state(), ChunkState::Lost);
    assert!(!calculator.is_writing_possible());
}
