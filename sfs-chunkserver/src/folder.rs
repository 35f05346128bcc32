//! One disk of a storage node: space accounting, rolling I/O statistics
//! and the ring of recent I/O errors.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Error;

use sfs_types::ChunkWithVersionAndType;

/// One-minute statistics bin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsBin {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u32,
    pub write_ops: u32,
    pub errors: u32,
}

/// 24 hours of one-minute bins, overwritten in place.
pub const STATS_BINS: usize = 24 * 60;

pub struct RollingStats {
    bins: Vec<StatsBin>,
    current_minute: u64,
}

fn minute_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / 60
}

impl RollingStats {
    pub fn new() -> Self {
        Self {
            bins: vec![StatsBin::default(); STATS_BINS],
            current_minute: minute_now(),
        }
    }

    fn bin_mut(&mut self) -> &mut StatsBin {
        let minute = minute_now();
        if minute != self.current_minute {
            // clear every bin we skipped over
            let skipped = (minute - self.current_minute).min(STATS_BINS as u64);
            for i in 1..=skipped {
                let index = ((self.current_minute + i) % STATS_BINS as u64) as usize;
                self.bins[index] = StatsBin::default();
            }
            self.current_minute = minute;
        }
        &mut self.bins[(minute % STATS_BINS as u64) as usize]
    }

    pub fn note_read(&mut self, bytes: u64) {
        let bin = self.bin_mut();
        bin.read_bytes += bytes;
        bin.read_ops += 1;
    }

    pub fn note_write(&mut self, bytes: u64) {
        let bin = self.bin_mut();
        bin.write_bytes += bytes;
        bin.write_ops += 1;
    }

    pub fn note_error(&mut self) {
        self.bin_mut().errors += 1;
    }

    /// Sum over the most recent `minutes` bins.
    pub fn sum_last(&self, minutes: usize) -> StatsBin {
        let minutes = minutes.min(STATS_BINS);
        let mut total = StatsBin::default();
        for i in 0..minutes as u64 {
            let index = ((self.current_minute + STATS_BINS as u64 - i) % STATS_BINS as u64) as usize;
            let bin = &self.bins[index];
            total.read_bytes += bin.read_bytes;
            total.write_bytes += bin.write_bytes;
            total.read_ops += bin.read_ops;
            total.write_ops += bin.write_ops;
            total.errors += bin.errors;
        }
        total
    }
}

impl Default for RollingStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Record of a recent I/O error on this disk.
#[derive(Clone, Debug)]
pub struct IoErrorRecord {
    pub chunk: Option<ChunkWithVersionAndType>,
    pub timestamp: u64,
    pub errno: i32,
}

pub const ERROR_RING_SIZE: usize = 16;

/// Free space figures as reported to the master.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    pub used: u64,
    pub total: u64,
    pub chunk_count: u32,
}

pub struct Folder {
    root: PathBuf,
    /// Marked for removal: chunks are migrated away, no new parts land here.
    pub to_delete: bool,
    pub damaged: bool,
    chunk_count: u32,
    reserved_bytes: u64,
    stats: RollingStats,
    errors: VecDeque<IoErrorRecord>,
}

impl Folder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            to_delete: false,
            damaged: false,
            chunk_count: 0,
            reserved_bytes: 0,
            stats: RollingStats::new(),
            errors: VecDeque::with_capacity(ERROR_RING_SIZE),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the 256 fan-out subdirectories.
    pub fn prepare(&self) -> Result<(), Error> {
        for i in 0..256u32 {
            std::fs::create_dir_all(self.root.join(format!("{:02X}", i)))?;
        }
        Ok(())
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn note_chunk_added(&mut self) {
        self.chunk_count += 1;
    }

    pub fn note_chunk_removed(&mut self) {
        debug_assert!(self.chunk_count > 0);
        self.chunk_count = self.chunk_count.saturating_sub(1);
    }

    pub fn note_read(&mut self, bytes: u64) {
        self.stats.note_read(bytes);
    }

    pub fn note_write(&mut self, bytes: u64) {
        self.stats.note_write(bytes);
    }

    pub fn note_error(&mut self, chunk: Option<ChunkWithVersionAndType>, errno: i32) {
        self.stats.note_error();
        if self.errors.len() == ERROR_RING_SIZE {
            self.errors.pop_front();
        }
        self.errors.push_back(IoErrorRecord {
            chunk,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            errno,
        });
    }

    pub fn recent_errors(&self) -> impl Iterator<Item = &IoErrorRecord> {
        self.errors.iter()
    }

    pub fn stats_last(&self, minutes: usize) -> StatsBin {
        self.stats.sum_last(minutes)
    }

    /// Current space usage from the file system, plus the chunk count the
    /// manager maintains.
    pub fn space_usage(&self) -> Result<SpaceUsage, Error> {
        let stat = nix::sys::statvfs::statvfs(&self.root)?;
        let fragment = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * fragment;
        let available = stat.blocks_available() as u64 * fragment;
        Ok(SpaceUsage {
            used: total.saturating_sub(available) + self.reserved_bytes,
            total,
            chunk_count: self.chunk_count,
        })
    }
}
