//! ShardFS master-side chunk accounting.
//!
//! The master never touches chunk data; it decides. Given the parts that
//! storage nodes report and the goal attached to a chunk, the
//! [`master::copies_calculator`] yields the minimum set of recoveries and
//! removals, [`master::goal_config`] turns the textual goal language into
//! target goals, and [`master::server_chooser`] picks the storage nodes
//! new replicas land on.

pub mod master;

pub use master::copies_calculator::ChunkCopiesCalculator;
pub use master::goal_config;
pub use master::server_chooser::{ServerChooser, ServerId};
