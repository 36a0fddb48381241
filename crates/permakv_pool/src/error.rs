//! Error types for pool operations.

use std::io;
use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur in the pool runtime.
#[derive(Debug, Error)]
pub enum PoolError {
    /// An I/O error on the backing media.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file is not a pool, or its format version is unsupported.
    #[error("invalid pool: {message}")]
    InvalidPool {
        /// Description of the problem.
        message: String,
    },

    /// The pool was created for a different engine layout.
    #[error("pool layout mismatch: pool holds {found:?}, requested {requested:?}")]
    LayoutMismatch {
        /// Layout name stored in the pool header.
        found: String,
        /// Layout name the caller asked for.
        requested: String,
    },

    /// The requested pool size is outside the supported range.
    #[error("invalid pool size: {size} bytes")]
    InvalidSize {
        /// The rejected size.
        size: u64,
    },

    /// The heap cannot satisfy an allocation.
    #[error("pool is full: failed to allocate {requested} bytes")]
    OutOfSpace {
        /// Bytes requested by the failed allocation.
        requested: usize,
    },

    /// An access landed outside the pool.
    #[error("access outside pool bounds: offset {offset}, len {len}, size {size}")]
    OutOfBounds {
        /// Offset of the access.
        offset: u64,
        /// Length of the access.
        len: usize,
        /// Total pool size.
        size: u64,
    },

    /// A transaction's undo records do not fit the log region.
    #[error("undo log overflow: transaction needs {required} bytes, capacity {capacity}")]
    LogOverflow {
        /// Bytes the transaction would write to the log.
        required: u64,
        /// Capacity of the log region.
        capacity: u64,
    },

    /// The pool contents failed validation.
    #[error("pool corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The calling thread is already inside a pool transaction.
    #[error("operation not permitted inside a pool transaction")]
    InTransaction,

    /// `free` was called with an offset that is not an allocated block.
    #[error("invalid free: offset {offset} is not an allocated block")]
    InvalidFree {
        /// The rejected offset.
        offset: u64,
    },
}

impl PoolError {
    /// Creates an invalid-pool error.
    pub fn invalid_pool(message: impl Into<String>) -> Self {
        Self::InvalidPool {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}
