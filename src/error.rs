use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A block read back does not match the checksum stored in its address cookie.
    /// Never retried: the bytes on disk are corrupt.
    #[error(
        "checksum mismatch reading {table} object {object_id} at offset {offset}: expected {expected:#010x}, found {actual:#010x}"
    )]
    ChecksumMismatch {
        table: String,
        object_id: u32,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// A handle was swept between lookup and use; callers re-acquire.
    #[error("handle for {table} object {object_id} was removed concurrently")]
    ConcurrentModification { table: String, object_id: u32 },

    #[error("no viable query plan: {0}")]
    PlanningFailure(String),

    #[error("invalid address cookie: {0}")]
    InvalidCookie(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("lock error: {0}")]
    Lock(io::Error),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl Error {
    /// Data-integrity failures that must never be masked by a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ChecksumMismatch { .. })
    }

    /// Resource-lifetime races that are recovered by re-acquiring.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrentModification { .. })
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
