//! Output buffers for the storage-node read path.
//!
//! Two implementations share one shape: the heap variant copies block data
//! into a plain buffer, the splice variant owns a kernel pipe pair and
//! moves bytes between file descriptors without copying them through user
//! space. The set of implementations is closed, so dispatch is an enum,
//! not a trait object.
//!
//! Flow control is cooperative: `write_out` returns `Again` when the
//! destination would block and the caller re-invokes it until `Done`.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use anyhow::{bail, Error};
use nix::fcntl::{fcntl, splice, FcntlArg, OFlag, SpliceFFlags};

use crate::crc::crc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    Done,
    Again,
    Error,
}

pub enum OutputBuffer {
    Heap(HeapBuffer),
    Splice(SpliceBuffer),
}

impl OutputBuffer {
    pub fn heap(capacity: usize) -> Self {
        OutputBuffer::Heap(HeapBuffer::new(capacity))
    }

    pub fn splice(capacity: usize) -> Result<Self, Error> {
        Ok(OutputBuffer::Splice(SpliceBuffer::new(capacity)?))
    }

    /// Pull `len` bytes from a file descriptor into the buffer, reading at
    /// `offset` when one is given.
    pub fn copy_in_fd(&mut self, fd: RawFd, len: usize, offset: Option<i64>) -> Result<usize, Error> {
        match self {
            OutputBuffer::Heap(buffer) => buffer.copy_in_fd(fd, len, offset),
            OutputBuffer::Splice(buffer) => buffer.copy_in_fd(fd, len, offset),
        }
    }

    pub fn copy_in_mem(&mut self, data: &[u8]) -> Result<usize, Error> {
        match self {
            OutputBuffer::Heap(buffer) => buffer.copy_in_mem(data),
            OutputBuffer::Splice(buffer) => buffer.copy_in_mem(data),
        }
    }

    pub fn write_out(&mut self, fd: RawFd) -> WriteStatus {
        match self {
            OutputBuffer::Heap(buffer) => buffer.write_out(fd),
            OutputBuffer::Splice(buffer) => buffer.write_out(fd),
        }
    }

    pub fn bytes_in_buffer(&self) -> usize {
        match self {
            OutputBuffer::Heap(buffer) => buffer.bytes_in_buffer(),
            OutputBuffer::Splice(buffer) => buffer.bytes_in_buffer(),
        }
    }

    /// Verify the CRC of the last `bytes` bytes put into the buffer. Only
    /// the heap variant can look at its own content.
    pub fn check_crc(&self, bytes: usize, expected: u32) -> Result<bool, Error> {
        match self {
            OutputBuffer::Heap(buffer) => Ok(buffer.check_crc(bytes, expected)),
            OutputBuffer::Splice(_) => {
                bail!("CRC verification is not possible on a zero-copy buffer")
            }
        }
    }

    /// Unflushed bytes of the heap variant; `None` for the zero-copy
    /// buffer, whose content lives in the kernel pipe.
    pub fn as_slice(&self) -> Option<&[u8]> {
        match self {
            OutputBuffer::Heap(buffer) => Some(buffer.as_slice()),
            OutputBuffer::Splice(_) => None,
        }
    }
}

pub struct HeapBuffer {
    buffer: Vec<u8>,
    // window of bytes accepted but not yet flushed
    first_unflushed: usize,
    one_after_last: usize,
}

impl HeapBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            buffer: vec![0; capacity],
            first_unflushed: 0,
            one_after_last: 0,
        }
    }

    pub fn bytes_in_buffer(&self) -> usize {
        self.one_after_last - self.first_unflushed
    }

    pub fn clear(&mut self) {
        self.first_unflushed = 0;
        self.one_after_last = 0;
    }

    fn copy_in_fd(&mut self, fd: RawFd, len: usize, offset: Option<i64>) -> Result<usize, Error> {
        if self.one_after_last + len > self.buffer.len() {
            bail!("output buffer overflow ({} + {} bytes)", self.one_after_last, len);
        }
        let mut copied = 0usize;
        while copied < len {
            let target = &mut self.buffer[self.one_after_last..self.one_after_last + (len - copied)];
            let got = match offset {
                Some(off) => nix::sys::uio::pread(fd, target, off + copied as i64),
                None => nix::unistd::read(fd, target),
            };
            match got {
                Ok(0) => break,
                Ok(n) => {
                    copied += n;
                    self.one_after_last += n;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(copied)
    }

    fn copy_in_mem(&mut self, data: &[u8]) -> Result<usize, Error> {
        if self.one_after_last + data.len() > self.buffer.len() {
            bail!(
                "output buffer overflow ({} + {} bytes)",
                self.one_after_last,
                data.len()
            );
        }
        self.buffer[self.one_after_last..self.one_after_last + data.len()].copy_from_slice(data);
        self.one_after_last += data.len();
        Ok(data.len())
    }

    fn write_out(&mut self, fd: RawFd) -> WriteStatus {
        while self.bytes_in_buffer() > 0 {
            let window = &self.buffer[self.first_unflushed..self.one_after_last];
            match nix::unistd::write(fd, window) {
                Ok(0) => return WriteStatus::Again,
                Ok(n) => self.first_unflushed += n,
                Err(nix::errno::Errno::EAGAIN) => return WriteStatus::Again,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => return WriteStatus::Error,
            }
        }
        WriteStatus::Done
    }

    pub fn check_crc(&self, bytes: usize, expected: u32) -> bool {
        if bytes > self.one_after_last {
            return false;
        }
        crc(0, &self.buffer[self.one_after_last - bytes..self.one_after_last]) == expected
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[self.first_unflushed..self.one_after_last]
    }
}

pub struct SpliceBuffer {
    read_end: OwnedFd,
    write_end: OwnedFd,
    capacity: usize,
    in_flight: usize,
}

impl SpliceBuffer {
    pub fn new(capacity: usize) -> Result<Self, Error> {
        let (read_end, write_end) = nix::unistd::pipe()?;
        let read_end = unsafe { <OwnedFd as std::os::unix::io::FromRawFd>::from_raw_fd(read_end) };
        let write_end = unsafe { <OwnedFd as std::os::unix::io::FromRawFd>::from_raw_fd(write_end) };
        fcntl(write_end.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        fcntl(read_end.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        Ok(Self {
            read_end,
            write_end,
            capacity,
            in_flight: 0,
        })
    }

    pub fn bytes_in_buffer(&self) -> usize {
        self.in_flight
    }

    fn copy_in_fd(&mut self, fd: RawFd, len: usize, offset: Option<i64>) -> Result<usize, Error> {
        if self.in_flight + len > self.capacity {
            bail!("splice buffer overflow ({} + {} bytes)", self.in_flight, len);
        }
        let mut copied = 0usize;
        let mut off = offset;
        while copied < len {
            let moved = splice(
                fd,
                off.as_mut(),
                self.write_end.as_raw_fd(),
                None,
                len - copied,
                SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_NONBLOCK,
            );
            match moved {
                Ok(0) => break,
                Ok(n) => {
                    copied += n;
                    self.in_flight += n;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(copied)
    }

    fn copy_in_mem(&mut self, data: &[u8]) -> Result<usize, Error> {
        if self.in_flight + data.len() > self.capacity {
            bail!(
                "splice buffer overflow ({} + {} bytes)",
                self.in_flight,
                data.len()
            );
        }
        let mut written = 0usize;
        while written < data.len() {
            match nix::unistd::write(self.write_end.as_raw_fd(), &data[written..]) {
                Ok(n) => {
                    written += n;
                    self.in_flight += n;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(written)
    }

    fn write_out(&mut self, fd: RawFd) -> WriteStatus {
        while self.in_flight > 0 {
            let moved = splice(
                self.read_end.as_raw_fd(),
                None,
                fd,
                None,
                self.in_flight,
                SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_NONBLOCK,
            );
            match moved {
                Ok(0) => return WriteStatus::Again,
                Ok(n) => self.in_flight -= n,
                Err(nix::errno::Errno::EAGAIN) => return WriteStatus::Again,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => return WriteStatus::Error,
            }
        }
        WriteStatus::Done
    }
}
