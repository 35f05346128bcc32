//! Status codes exchanged between clients, storage nodes and the master.
//!
//! The numeric values are part of the wire protocol and must not change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
#[derive(Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    #[error("OK")]
    Ok = 0,
    #[error("operation not permitted")]
    Eperm = 1,
    #[error("not a directory")]
    Enotdir = 2,
    #[error("no such file or directory")]
    Enoent = 3,
    #[error("permission denied")]
    Eacces = 4,
    #[error("file exists")]
    Eexist = 5,
    #[error("invalid argument")]
    Einval = 6,
    #[error("directory not empty")]
    Enotempty = 7,
    #[error("chunk lost")]
    ChunkLost = 8,
    #[error("out of memory")]
    OutOfMemory = 9,
    #[error("index too big")]
    IndexTooBig = 10,
    #[error("chunk locked")]
    Locked = 11,
    #[error("no chunk servers")]
    NoChunkServers = 12,
    #[error("no such chunk")]
    NoSuchChunk = 13,
    #[error("chunk is busy")]
    ChunkIsBusy = 14,
    #[error("write not started")]
    WriteNotStarted = 18,
    #[error("wrong chunk version")]
    WrongVersion = 19,
    #[error("chunk already exists")]
    ChunkExists = 20,
    #[error("no space left")]
    NoSpace = 21,
    #[error("I/O error")]
    Io = 22,
    #[error("wrong block number")]
    WrongBlockNumber = 23,
    #[error("wrong size")]
    WrongSize = 24,
    #[error("wrong offset")]
    WrongOffset = 25,
    #[error("can't connect")]
    CantConnect = 26,
    #[error("wrong chunk id")]
    WrongChunkId = 27,
    #[error("disconnected")]
    Disconnected = 28,
    #[error("CRC mismatch")]
    Crc = 29,
    #[error("operation delayed")]
    Delayed = 30,
    #[error("quota exceeded")]
    Quota = 34,
    #[error("timed out")]
    Timeout = 38,
}

impl Status {
    pub fn from_u8(value: u8) -> Option<Status> {
        use Status::*;
        Some(match value {
            0 => Ok,
            1 => Eperm,
            2 => Enotdir,
            3 => Enoent,
            4 => Eacces,
            5 => Eexist,
            6 => Einval,
            7 => Enotempty,
            8 => ChunkLost,
            9 => OutOfMemory,
            10 => IndexTooBig,
            11 => Locked,
            12 => NoChunkServers,
            13 => NoSuchChunk,
            14 => ChunkIsBusy,
            18 => WriteNotStarted,
            19 => WrongVersion,
            20 => ChunkExists,
            21 => NoSpace,
            22 => Io,
            23 => WrongBlockNumber,
            24 => WrongSize,
            25 => WrongOffset,
            26 => CantConnect,
            27 => WrongChunkId,
            28 => Disconnected,
            29 => Crc,
            30 => Delayed,
            34 => Quota,
            38 => Timeout,
            _ => return None,
        })
    }

    pub fn is_ok(&self) -> bool {
        *self == Status::Ok
    }

    /// Classification used by the client retry loops: a recoverable status
    /// is worth retrying against another replica or after a backoff sleep,
    /// an unrecoverable one is surfaced to the caller as-is.
    pub fn is_recoverable(&self) -> bool {
        use Status::*;
        matches!(
            self,
            ChunkLost
                | Locked
                | NoChunkServers
                | ChunkIsBusy
                | WrongVersion
                | Io
                | CantConnect
                | Disconnected
                | Crc
                | Delayed
                | Timeout
        )
    }

    /// Result wrapper used by storage node operations.
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_values() {
        assert_eq!(Status::Ok as u8, 0);
        assert_eq!(Status::ChunkLost as u8, 8);
        assert_eq!(Status::Locked as u8, 11);
        assert_eq!(Status::NoSuchChunk as u8, 13);
        assert_eq!(Status::WrongVersion as u8, 19);
        assert_eq!(Status::Crc as u8, 29);
        assert_eq!(Status::Quota as u8, 34);
        assert_eq!(Status::Timeout as u8, 38);
    }

    #[test]
    fn u8_roundtrip() {
        for value in 0..=255u8 {
            if let Some(status) = Status::from_u8(value) {
                assert_eq!(status as u8, value);
            }
        }
        assert!(Status::from_u8(15).is_none());
        assert!(Status::from_u8(255).is_none());
    }

    #[test]
    fn classification() {
        assert!(Status::Locked.is_recoverable());
        assert!(Status::Timeout.is_recoverable());
        assert!(!Status::NoSuchChunk.is_recoverable());
        assert!(!Status::Quota.is_recoverable());
        assert!(!Status::NoSpace.is_recoverable());
    }
}
