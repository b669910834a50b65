//! Error types for the storage and transaction substrate.
//!
//! Defines a unified error type that can represent failures from every layer:
//! the transaction status store, the page store, the write-ahead log, the
//! cache, the lock table, and the version manager.

use std::fmt;
use std::io;

/// Unified error type for the storage and transaction core.
#[derive(Debug)]
pub enum QuarryError {
    /// I/O error from the underlying filesystem.
    Io(io::Error),
    /// The `.xid` status file failed its length/counter integrity check.
    BadXidFile(String),
    /// The `.log` file failed checksum verification beyond a repairable tail.
    BadLogFile(String),
    /// A file that was expected to exist did not.
    FileNotExists(String),
    /// A file that was expected to be created already exists.
    FileExists(String),
    /// A file could not be opened for reading and writing.
    FileCannotRw(String),
    /// Requested page cache capacity is too small to be useful.
    MemTooSmall,
    /// The resource cache is at capacity and cannot admit a new entry.
    CacheFull,
    /// A cache or item lookup produced no entry where one was required.
    NullEntry,
    /// Lock acquisition would complete a wait-for cycle.
    Deadlock,
    /// A transaction observed a conflicting concurrent update and must abort.
    ConcurrentUpdate,
    /// An internal invariant was violated (e.g. a poisoned mutex).
    Internal(String),
}

impl fmt::Display for QuarryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarryError::Io(e) => write!(f, "io error: {}", e),
            QuarryError::BadXidFile(msg) => write!(f, "bad xid file: {}", msg),
            QuarryError::BadLogFile(msg) => write!(f, "bad log file: {}", msg),
            QuarryError::FileNotExists(path) => write!(f, "file does not exist: {}", path),
            QuarryError::FileExists(path) => write!(f, "file already exists: {}", path),
            QuarryError::FileCannotRw(path) => write!(f, "cannot open file for read/write: {}", path),
            QuarryError::MemTooSmall => write!(f, "requested cache capacity is too small"),
            QuarryError::CacheFull => write!(f, "cache is full"),
            QuarryError::NullEntry => write!(f, "entry not found"),
            QuarryError::Deadlock => write!(f, "deadlock detected"),
            QuarryError::ConcurrentUpdate => write!(f, "concurrent update conflict"),
            QuarryError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for QuarryError {}

impl From<io::Error> for QuarryError {
    fn from(e: io::Error) -> Self {
        QuarryError::Io(e)
    }
}

/// Result type alias for the storage and transaction core.
pub type Result<T> = std::result::Result<T, QuarryError>;
