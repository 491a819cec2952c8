//! Engine-wide error taxonomy.
//!
//! Errors fall into three tiers: structural corruption and I/O failures are
//! fatal (the host must shut the store down), resource exhaustion is
//! retryable, and concurrency conflicts require the caller to retry the
//! whole transaction. Logical absence of a record is never an error; those
//! paths return `Ok(None)`.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("xid status file is corrupt")]
    CorruptXidFile,

    #[error("log file is corrupt")]
    CorruptLog,

    #[error("memory budget below minimum page-cache size")]
    MemTooSmall,

    #[error("store files already exist")]
    StoreExists,

    #[error("store files do not exist")]
    StoreMissing,

    #[error("cache is full")]
    CacheFull,

    #[error("data exceeds the maximum record size")]
    DataTooLarge,

    #[error("store is busy, no page with enough free space")]
    Busy,

    #[error("deadlock detected")]
    Deadlock,

    #[error("concurrent update conflict")]
    ConcurrentUpdate,

    #[error("unknown transaction id {0}")]
    UnknownXid(u64),

    /// Internal marker for an item address that resolves to no live entry.
    /// Surfaced to callers as `Ok(None)`, never escapes the crate API.
    #[error("no entry at the given address")]
    MissingEntry,
}

impl Error {
    /// True for errors that indicate the store can no longer be trusted.
    /// Hosts must treat a fatal error as a forced-shutdown signal rather
    /// than an exception to catch and continue from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::CorruptXidFile
                | Error::CorruptLog
                | Error::MemTooSmall
                | Error::StoreExists
                | Error::StoreMissing
        )
    }
}
