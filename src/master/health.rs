//! Builds the chunks-health reply from the master's availability
//! counters. Zero rows are left out, which keeps the packet small on
//! healthy clusters.

use sfs_proto::{ChunksHealthReply, GoalCounter, GoalPartsCounter};
use sfs_types::availability::{
    ChunksAvailabilityState, ChunksReplicationState, MAX_TRACKED_PARTS,
};
use sfs_types::goal::GoalId;

pub fn health_reply(
    availability: &ChunksAvailabilityState,
    replication: &ChunksReplicationState,
) -> ChunksHealthReply {
    let mut reply = ChunksHealthReply {
        safe: Vec::new(),
        endangered: Vec::new(),
        lost: Vec::new(),
        to_replicate: Vec::new(),
        to_delete: Vec::new(),
    };
    for id in GoalId::MIN..=GoalId::MAX {
        let goal = GoalId(id);
        for (count, bucket) in [
            (availability.safe_chunks(goal), &mut reply.safe),
            (availability.endangered_chunks(goal), &mut reply.endangered),
            (availability.lost_chunks(goal), &mut reply.lost),
        ] {
            if count > 0 {
                bucket.push(GoalCounter {
                    goal_id: id,
                    chunks: count,
                });
            }
        }
        for parts in 0..MAX_TRACKED_PARTS {
            let to_replicate = replication.chunks_to_replicate(goal, parts);
            if to_replicate > 0 {
                reply.to_replicate.push(GoalPartsCounter {
                    goal_id: id,
                    parts: parts as u8,
                    chunks: to_replicate,
                });
            }
            let to_delete = replication.chunks_to_delete(goal, parts);
            if to_delete > 0 {
                reply.to_delete.push(GoalPartsCounter {
                    goal_id: id,
                    parts: parts as u8,
                    chunks: to_delete,
                });
            }
        }
    }
    reply
}
