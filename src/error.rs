use thiserror::Error;

/// Errors surfaced by the storage layer.
///
/// Operational errors (I/O failure, no free frame, no space, corruption)
/// are returned as values and bubble up unchanged; they are never
/// retried internally. Programmer errors (bad `PageId`, unregistered
/// `FileId`, malformed buffer lengths) are preconditions enforced with
/// `assert!`/`debug_assert!` at the call site and are never represented
/// here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    #[error("I/O failed: {0}")]
    IoFailed(String),

    #[error("no free frame available in buffer pool")]
    NoFreeFrame,

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("no space left for tuple of {needed} bytes (best page has {available})")]
    NoSpace { needed: u32, available: u32 },

    #[error("not implemented: {0}")]
    Unimplemented(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// `parking_lot` locks never poison, so nothing in this crate
    /// constructs this today; it exists for callers built on lock types
    /// that do poison.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

pub type Result<T> = std::result::Result<T, DbError>;
