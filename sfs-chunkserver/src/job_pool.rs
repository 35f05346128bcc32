//! Background job pool of the storage node.
//!
//! A fixed set of worker threads drains a bounded FIFO whose items carry
//! `(job_id, op_code, argument_blob)`; the blob is packed with the wire
//! serializer, exactly like the packet the request arrived in. Finished
//! jobs push a completion record into a channel and poke a wake-up pipe so
//! the poll-driven master connection notices without busy waiting.
//!
//! A job can be *disabled* mid-flight: its eventual completion is routed
//! to a no-op and only releases the job's resources.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::Error;
use crossbeam_channel::{unbounded, Receiver, Sender};

use sfs_proto::{wire_packet, Wire};
use sfs_tools::output_buffer::OutputBuffer;
use sfs_tools::queue::{BoundedQueue, QueueEntry};
use sfs_types::{ChunkId, ChunkPartType, ChunkVersion, NetworkAddress, Status};

use crate::format::ChunkFormat;
use crate::hdd::HddManager;
use crate::replicator::{ReplicationSource, Replicator, ReplicatorConfig};

const OP_CHUNKOP: u32 = 1;
const OP_OPEN: u32 = 2;
const OP_CLOSE: u32 = 3;
const OP_READ: u32 = 4;
const OP_WRITE: u32 = 5;
const OP_REPLICATE: u32 = 6;
const OP_STOP: u32 = u32::MAX;

/// Sentinel meaning "no truncate length" in a chunkop blob.
const NO_LENGTH: u64 = u64::MAX;

wire_packet!(ChunkOpArgs {
    chunk_id: ChunkId,
    version: u32,
    new_version: u32,
    copy_chunk_id: ChunkId,
    copy_version: u32,
    length: u64,
    part_type: ChunkPartType,
});

wire_packet!(HandleArgs {
    chunk_id: ChunkId,
    part_type: ChunkPartType,
});

wire_packet!(ReadArgs {
    chunk_id: ChunkId,
    version: u32,
    part_type: ChunkPartType,
    offset: u32,
    size: u32,
});

wire_packet!(WriteArgs {
    chunk_id: ChunkId,
    version: u32,
    part_type: ChunkPartType,
    block: u32,
    offset: u32,
    size: u32,
    crc: u32,
});

wire_packet!(SourceArg {
    address: NetworkAddress,
    part_type: ChunkPartType,
});

wire_packet!(ReplicateArgs {
    chunk_id: ChunkId,
    version: u32,
    part_type: ChunkPartType,
    sources: Vec<SourceArg>,
});

/// Decoded chunk operation, see the argument conventions in
/// [`JobPool::chunkop`].
#[derive(Debug, PartialEq)]
pub enum JobOp {
    Create,
    Delete,
    Test,
    SetVersion,
    Duplicate,
    Truncate,
    DupTrunc,
}

fn decode_chunkop(args: &ChunkOpArgs) -> Result<JobOp, Status> {
    if args.new_version == 0 {
        return match args.length {
            0 => Ok(JobOp::Delete),
            1 => Ok(JobOp::Create),
            2 => Ok(JobOp::Test),
            _ => Err(Status::Einval),
        };
    }
    match (args.copy_chunk_id.0, args.length) {
        (0, NO_LENGTH) => Ok(JobOp::SetVersion),
        (_, NO_LENGTH) => Ok(JobOp::Duplicate),
        (0, length) if length <= sfs_types::CHUNK_SIZE => Ok(JobOp::Truncate),
        (_, length) if length <= sfs_types::CHUNK_SIZE => Ok(JobOp::DupTrunc),
        _ => Err(Status::Einval),
    }
}

#[derive(Clone, Debug)]
pub struct JobCompletion {
    pub job_id: u32,
    pub status: Status,
}

struct JobEntry {
    disabled: bool,
    /// Sink for read jobs; the connection owns the buffer, the job fills it.
    output: Option<Arc<Mutex<OutputBuffer>>>,
}

struct PoolInner {
    hdd: Arc<HddManager>,
    replicator: Replicator,
    jobs: Mutex<HashMap<u32, JobEntry>>,
    completions: Sender<JobCompletion>,
    wakeup_write: OwnedFd,
}

impl PoolInner {
    fn finish(&self, job_id: u32, status: Status) {
        let entry = self.jobs.lock().unwrap().remove(&job_id);
        match entry {
            Some(entry) if entry.disabled => {
                // disabled job: deliver a no-op, resources are gone now
            }
            _ => {
                let _ = self.completions.send(JobCompletion { job_id, status });
                // wake the poller; a full pipe already guarantees a wake-up
                let _ = nix::unistd::write(self.wakeup_write.as_raw_fd(), &[0u8]);
            }
        }
    }

    fn execute(&self, entry: &QueueEntry) -> Result<Status, Error> {
        let mut blob = &entry.data[..];
        let status = match entry.op {
            OP_CHUNKOP => {
                let args = ChunkOpArgs::deserialize(&mut blob)?;
                self.run_chunkop(&args)
            }
            OP_OPEN => {
                let args = HandleArgs::deserialize(&mut blob)?;
                self.hdd.open(args.chunk_id, args.part_type)
            }
            OP_CLOSE => {
                let args = HandleArgs::deserialize(&mut blob)?;
                self.hdd.close(args.chunk_id, args.part_type)
            }
            OP_READ => {
                let args = ReadArgs::deserialize(&mut blob)?;
                self.run_read(entry.id, &args)
            }
            OP_WRITE => {
                let args = WriteArgs::deserialize(&mut blob)?;
                self.hdd.write(
                    args.chunk_id,
                    args.version,
                    args.part_type,
                    args.block,
                    args.offset,
                    args.size,
                    args.crc,
                    blob,
                )
            }
            OP_REPLICATE => {
                let args = ReplicateArgs::deserialize(&mut blob)?;
                let sources: Vec<ReplicationSource> = args
                    .sources
                    .iter()
                    .map(|s| ReplicationSource {
                        address: s.address,
                        part_type: s.part_type,
                    })
                    .collect();
                self.replicator
                    .replicate(args.chunk_id, args.version, args.part_type, &sources)
            }
            other => {
                log::error!("job pool: unknown op code {}", other);
                Err(Status::Einval)
            }
        };
        Ok(match status {
            Ok(()) => Status::Ok,
            Err(status) => status,
        })
    }

    fn run_chunkop(&self, args: &ChunkOpArgs) -> Result<(), Status> {
        match decode_chunkop(args)? {
            JobOp::Create => self.hdd.create(
                args.chunk_id,
                args.version,
                args.part_type,
                ChunkFormat::Interleaved,
            ),
            JobOp::Delete => self.hdd.delete(args.chunk_id, args.version, args.part_type),
            JobOp::Test => self.hdd.test(args.chunk_id, args.version, args.part_type),
            JobOp::SetVersion => self.hdd.set_version(
                args.chunk_id,
                args.version,
                args.new_version,
                args.part_type,
            ),
            JobOp::Duplicate => self.hdd.duplicate(
                args.chunk_id,
                args.version,
                args.part_type,
                args.copy_chunk_id,
                args.copy_version,
            ),
            JobOp::Truncate => self.hdd.truncate(
                args.chunk_id,
                args.part_type,
                args.version,
                args.new_version,
                args.length,
            ),
            JobOp::DupTrunc => self.hdd.duptrunc(
                args.chunk_id,
                args.version,
                args.part_type,
                args.copy_chunk_id,
                args.copy_version,
                args.length,
            ),
        }
    }

    fn run_read(&self, job_id: u32, args: &ReadArgs) -> Result<(), Status> {
        let output = self
            .jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .and_then(|entry| entry.output.clone())
            .ok_or(Status::Einval)?;
        let mut output = output.lock().unwrap();
        self.hdd.read(
            args.chunk_id,
            args.version,
            args.part_type,
            args.offset,
            args.size,
            &mut output,
        )
    }
}

pub struct JobPool {
    queue: Arc<BoundedQueue>,
    inner: Arc<PoolInner>,
    completion_rx: Receiver<JobCompletion>,
    wakeup_read: OwnedFd,
    workers: Vec<JoinHandle<()>>,
    next_job_id: AtomicU32,
}

impl JobPool {
    pub fn new(workers: usize, queue_byte_budget: u64, hdd: Arc<HddManager>) -> Result<Self, Error> {
        Self::with_replicator_config(workers, queue_byte_budget, hdd, ReplicatorConfig::default())
    }

    pub fn with_replicator_config(
        workers: usize,
        queue_byte_budget: u64,
        hdd: Arc<HddManager>,
        replicator_config: ReplicatorConfig,
    ) -> Result<Self, Error> {
        let (completion_tx, completion_rx) = unbounded();
        let (pipe_read, pipe_write) = nix::unistd::pipe()?;
        use std::os::unix::io::FromRawFd;
        let wakeup_read = unsafe { OwnedFd::from_raw_fd(pipe_read) };
        let wakeup_write = unsafe { OwnedFd::from_raw_fd(pipe_write) };
        nix::fcntl::fcntl(
            wakeup_write.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let queue = Arc::new(BoundedQueue::new(queue_byte_budget));
        let inner = Arc::new(PoolInner {
            replicator: Replicator::new(Arc::clone(&hdd), replicator_config),
            hdd,
            jobs: Mutex::new(HashMap::new()),
            completions: completion_tx,
            wakeup_write,
        });

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let queue = Arc::clone(&queue);
            let inner = Arc::clone(&inner);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("sfs-job ({})", index))
                    .spawn(move || loop {
                        let entry = queue.get();
                        if entry.op == OP_STOP {
                            return;
                        }
                        let status = match inner.execute(&entry) {
                            Ok(status) => status,
                            Err(err) => {
                                log::error!("job {}: malformed argument blob - {}", entry.id, err);
                                Status::Einval
                            }
                        };
                        inner.finish(entry.id, status);
                    })?,
            );
        }

        Ok(Self {
            queue,
            inner,
            completion_rx,
            wakeup_read,
            workers: handles,
            next_job_id: AtomicU32::new(1),
        })
    }

    /// Channel carrying finished jobs.
    pub fn completions(&self) -> &Receiver<JobCompletion> {
        &self.completion_rx
    }

    /// File descriptor that becomes readable whenever a completion is
    /// enqueued; drain it with small reads.
    pub fn wakeup_fd(&self) -> RawFd {
        self.wakeup_read.as_raw_fd()
    }

    pub fn jobs_count(&self) -> usize {
        self.queue.elements() + self.inner.jobs.lock().unwrap().len()
    }

    /// Route the eventual completion of `job_id` to a no-op.
    pub fn disable_job(&self, job_id: u32) {
        if let Some(entry) = self.inner.jobs.lock().unwrap().get_mut(&job_id) {
            entry.disabled = true;
        }
    }

    fn submit(&self, op: u32, blob: Vec<u8>, output: Option<Arc<Mutex<OutputBuffer>>>) -> Result<u32, Error> {
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        self.inner.jobs.lock().unwrap().insert(
            job_id,
            JobEntry {
                disabled: false,
                output,
            },
        );
        self.queue.put(QueueEntry {
            id: job_id,
            op,
            data: blob,
        })?;
        Ok(job_id)
    }

    fn pack<T: Wire>(args: &T) -> Vec<u8> {
        let mut blob = Vec::with_capacity(args.serialized_size());
        args.serialize(&mut blob);
        blob
    }

    /// Submit a combined chunk operation. Conventions of the argument
    /// blob: `new_version == 0` selects delete/create/test by `length`
    /// (0/1/2); otherwise `length == u64::MAX` selects set-version or
    /// duplicate (by `copy_chunk_id`), and a real `length` selects
    /// truncate or duplicate-truncate.
    #[allow(clippy::too_many_arguments)]
    pub fn chunkop(
        &self,
        chunk_id: ChunkId,
        version: ChunkVersion,
        new_version: ChunkVersion,
        copy_chunk_id: ChunkId,
        copy_version: ChunkVersion,
        length: u64,
        part_type: ChunkPartType,
    ) -> Result<u32, Error> {
        let args = ChunkOpArgs {
            chunk_id,
            version,
            new_version,
            copy_chunk_id,
            copy_version,
            length,
            part_type,
        };
        self.submit(OP_CHUNKOP, Self::pack(&args), None)
    }

    pub fn create(&self, chunk_id: ChunkId, version: ChunkVersion, part_type: ChunkPartType) -> Result<u32, Error> {
        self.chunkop(chunk_id, version, 0, ChunkId(0), 0, 1, part_type)
    }

    pub fn delete(&self, chunk_id: ChunkId, version: ChunkVersion, part_type: ChunkPartType) -> Result<u32, Error> {
        self.chunkop(chunk_id, version, 0, ChunkId(0), 0, 0, part_type)
    }

    pub fn test(&self, chunk_id: ChunkId, version: ChunkVersion, part_type: ChunkPartType) -> Result<u32, Error> {
        self.chunkop(chunk_id, version, 0, ChunkId(0), 0, 2, part_type)
    }

    pub fn set_version(
        &self,
        chunk_id: ChunkId,
        version: ChunkVersion,
        new_version: ChunkVersion,
        part_type: ChunkPartType,
    ) -> Result<u32, Error> {
        self.chunkop(chunk_id, version, new_version, ChunkId(0), 0, NO_LENGTH, part_type)
    }

    pub fn truncate(
        &self,
        chunk_id: ChunkId,
        version: ChunkVersion,
        new_version: ChunkVersion,
        length: u64,
        part_type: ChunkPartType,
    ) -> Result<u32, Error> {
        self.chunkop(chunk_id, version, new_version, ChunkId(0), 0, length, part_type)
    }

    pub fn open(&self, chunk_id: ChunkId, part_type: ChunkPartType) -> Result<u32, Error> {
        self.submit(OP_OPEN, Self::pack(&HandleArgs { chunk_id, part_type }), None)
    }

    pub fn close(&self, chunk_id: ChunkId, part_type: ChunkPartType) -> Result<u32, Error> {
        self.submit(OP_CLOSE, Self::pack(&HandleArgs { chunk_id, part_type }), None)
    }

    /// Submit a read; the job writes `crc || fragment` pairs into `output`.
    pub fn read(
        &self,
        chunk_id: ChunkId,
        version: ChunkVersion,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
        output: Arc<Mutex<OutputBuffer>>,
    ) -> Result<u32, Error> {
        let args = ReadArgs {
            chunk_id,
            version,
            part_type,
            offset,
            size,
        };
        self.submit(OP_READ, Self::pack(&args), Some(output))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        chunk_id: ChunkId,
        version: ChunkVersion,
        part_type: ChunkPartType,
        block: u32,
        offset: u32,
        size: u32,
        crc: u32,
        data: &[u8],
    ) -> Result<u32, Error> {
        let args = WriteArgs {
            chunk_id,
            version,
            part_type,
            block,
            offset,
            size,
            crc,
        };
        let mut blob = Vec::with_capacity(args.serialized_size() + data.len());
        args.serialize(&mut blob);
        blob.extend_from_slice(data);
        self.submit(OP_WRITE, blob, None)
    }

    pub fn replicate(
        &self,
        chunk_id: ChunkId,
        version: ChunkVersion,
        part_type: ChunkPartType,
        sources: &[ReplicationSource],
    ) -> Result<u32, Error> {
        let args = ReplicateArgs {
            chunk_id,
            version,
            part_type,
            sources: sources
                .iter()
                .map(|s| SourceArg {
                    address: s.address,
                    part_type: s.part_type,
                })
                .collect(),
        };
        self.submit(OP_REPLICATE, Self::pack(&args), None)
    }

    /// Replication statistics counter, drained by the master connection.
    pub fn take_replication_stats(&self) -> u64 {
        self.inner.replicator.take_stats()
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.queue.put(QueueEntry {
                id: 0,
                op: OP_STOP,
                data: Vec::new(),
            });
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_tools::crc::crc;
    use sfs_types::BLOCK_SIZE;
    use std::time::Duration;

    fn pool() -> (tempfile::TempDir, JobPool) {
        let dir = tempfile::tempdir().unwrap();
        let mut hdd = HddManager::new();
        hdd.add_folder(dir.path()).unwrap();
        let pool = JobPool::new(4, 1 << 20, Arc::new(hdd)).unwrap();
        (dir, pool)
    }

    fn wait_completion(pool: &JobPool, job_id: u32) -> Status {
        loop {
            let completion = pool
                .completions()
                .recv_timeout(Duration::from_secs(5))
                .expect("job did not complete");
            if completion.job_id == job_id {
                return completion.status;
            }
        }
    }

    #[test]
    fn create_write_read_through_jobs() {
        let (_dir, pool) = pool();
        let id = ChunkId(0x100);
        let part = ChunkPartType::standard();

        let job = pool.create(id, 1, part).unwrap();
        assert_eq!(wait_completion(&pool, job), Status::Ok);

        let data = vec![0x5au8; BLOCK_SIZE as usize];
        let job = pool
            .write(id, 1, part, 0, 0, BLOCK_SIZE, crc(0, &data), &data)
            .unwrap();
        assert_eq!(wait_completion(&pool, job), Status::Ok);

        let output = Arc::new(Mutex::new(OutputBuffer::heap(BLOCK_SIZE as usize + 8)));
        let job = pool
            .read(id, 1, part, 0, BLOCK_SIZE, Arc::clone(&output))
            .unwrap();
        assert_eq!(wait_completion(&pool, job), Status::Ok);
        let output = output.lock().unwrap();
        let served = output.as_slice().unwrap();
        assert_eq!(served.len() as u32, 4 + BLOCK_SIZE);
        assert_eq!(&served[4..], &data[..]);
    }

    #[test]
    fn completion_wakes_the_pipe() {
        let (_dir, pool) = pool();
        let job = pool.create(ChunkId(0x200), 1, ChunkPartType::standard()).unwrap();
        assert_eq!(wait_completion(&pool, job), Status::Ok);
        let mut byte = [0u8; 16];
        let n = nix::unistd::read(pool.wakeup_fd(), &mut byte).unwrap();
        assert!(n >= 1);
    }

    #[test]
    fn chunkop_codes_roundtrip() {
        let args = |new_version, copy, length| ChunkOpArgs {
            chunk_id: ChunkId(1),
            version: 1,
            new_version,
            copy_chunk_id: ChunkId(copy),
            copy_version: 0,
            length,
            part_type: ChunkPartType::standard(),
        };
        assert_eq!(decode_chunkop(&args(0, 0, 0)).unwrap(), JobOp::Delete);
        assert_eq!(decode_chunkop(&args(0, 0, 1)).unwrap(), JobOp::Create);
        assert_eq!(decode_chunkop(&args(0, 0, 2)).unwrap(), JobOp::Test);
        assert_eq!(decode_chunkop(&args(2, 0, NO_LENGTH)).unwrap(), JobOp::SetVersion);
        assert_eq!(decode_chunkop(&args(2, 9, NO_LENGTH)).unwrap(), JobOp::Duplicate);
        assert_eq!(decode_chunkop(&args(2, 0, 100)).unwrap(), JobOp::Truncate);
        assert_eq!(decode_chunkop(&args(2, 9, 100)).unwrap(), JobOp::DupTrunc);
        assert!(decode_chunkop(&args(0, 0, 3)).is_err());
        assert!(decode_chunkop(&args(2, 0, sfs_types::CHUNK_SIZE + 1)).is_err());
    }

    #[test]
    fn failed_jobs_report_their_status() {
        let (_dir, pool) = pool();
        let job = pool
            .delete(ChunkId(0x300), 1, ChunkPartType::standard())
            .unwrap();
        assert_eq!(wait_completion(&pool, job), Status::NoSuchChunk);
    }

    #[test]
    fn disabled_job_completes_silently() {
        let (_dir, pool) = pool();
        let id = ChunkId(0x400);
        let job = pool.create(id, 1, ChunkPartType::standard()).unwrap();
        pool.disable_job(job);
        // the job still runs; only its completion is swallowed
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.jobs_count() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.jobs_count(), 0);
        assert!(pool.completions().try_recv().is_err());
        // and its effect is visible
        let job = pool.test(id, 1, ChunkPartType::standard()).unwrap();
        assert_eq!(wait_completion(&pool, job), Status::Ok);
    }

    #[test]
    fn set_version_and_truncate_via_chunkop() {
        let (_dir, pool) = pool();
        let id = ChunkId(0x500);
        let part = ChunkPartType::standard();
        let job = pool.create(id, 1, part).unwrap();
        assert_eq!(wait_completion(&pool, job), Status::Ok);

        let data = vec![0x11u8; BLOCK_SIZE as usize];
        let job = pool
            .write(id, 1, part, 1, 0, BLOCK_SIZE, crc(0, &data), &data)
            .unwrap();
        assert_eq!(wait_completion(&pool, job), Status::Ok);

        let job = pool.set_version(id, 1, 2, part).unwrap();
        assert_eq!(wait_completion(&pool, job), Status::Ok);

        let job = pool.truncate(id, 2, 3, BLOCK_SIZE as u64, part).unwrap();
        assert_eq!(wait_completion(&pool, job), Status::Ok);

        let job = pool.test(id, 3, part).unwrap();
        assert_eq!(wait_completion(&pool, job), Status::Ok);
    }
}
