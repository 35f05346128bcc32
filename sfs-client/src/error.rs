//! Error taxonomy of the client chunk paths.
//!
//! Retry loops branch on a plain discriminator instead of exception
//! classes: a `Recoverable` error is worth another attempt against other
//! replicas or after a backoff sleep, an `Unrecoverable` one is the
//! terminal status of the chunk, and `Fatal` means the session itself is
//! broken (protocol violation, master unreachable).

use thiserror::Error;

use sfs_types::Status;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Recoverable,
    Unrecoverable,
    Fatal,
}

#[derive(Clone, Debug, Error)]
#[error("{message} ({status})")]
pub struct ChunkError {
    pub status: Status,
    pub kind: ErrorKind,
    pub message: String,
}

impl ChunkError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        let kind = if status == Status::NoSuchChunk {
            // the chunk is gone; no amount of retrying brings it back
            ErrorKind::Unrecoverable
        } else if status.is_recoverable() {
            ErrorKind::Recoverable
        } else {
            ErrorKind::Unrecoverable
        };
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn recoverable(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: ErrorKind::Recoverable,
            message: message.into(),
        }
    }

    pub fn unrecoverable(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: ErrorKind::Unrecoverable,
            message: message.into(),
        }
    }

    pub fn fatal(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: ErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind == ErrorKind::Recoverable
    }

    /// A recoverable error that exhausted its retry budget becomes the
    /// chunk's terminal status.
    pub fn into_terminal(mut self) -> Self {
        if self.kind == ErrorKind::Recoverable {
            self.kind = ErrorKind::Unrecoverable;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_status() {
        assert_eq!(
            ChunkError::new(Status::Locked, "locked").kind,
            ErrorKind::Recoverable
        );
        assert_eq!(
            ChunkError::new(Status::NoSuchChunk, "gone").kind,
            ErrorKind::Unrecoverable
        );
        assert_eq!(
            ChunkError::new(Status::Quota, "quota").kind,
            ErrorKind::Unrecoverable
        );
    }

    #[test]
    fn terminal_promotion() {
        let err = ChunkError::new(Status::Timeout, "slow");
        assert!(err.is_recoverable());
        let terminal = err.into_terminal();
        assert_eq!(terminal.kind, ErrorKind::Unrecoverable);
        assert_eq!(terminal.status, Status::Timeout);
    }
}
