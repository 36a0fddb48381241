//! Status and error types for the engine layer.

use permakv_pool::PoolError;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Statuses surfaced by the engine layer.
///
/// Lookup misses (`NotFound`) and callback stops (`StoppedByCallback`)
/// are ordinary control-flow signals, never fatal. Open-time failures
/// use the finer `WrongPath` / `WrongSize` statuses rather than a
/// catch-all.
#[derive(Debug, Error)]
pub enum Error {
    /// The key (or config item) does not exist.
    #[error("not found")]
    NotFound,

    /// Iteration was stopped early by the caller's callback.
    #[error("iteration stopped by callback")]
    StoppedByCallback,

    /// The caller violated an operation's contract.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the violation.
        message: String,
    },

    /// A config item was fetched with an incompatible type.
    #[error("config type error: {message}")]
    ConfigTypeError {
        /// Description of the mismatch.
        message: String,
    },

    /// Defragmentation failed.
    #[error("defragmentation error: {message}")]
    DefragError {
        /// Description of the failure.
        message: String,
    },

    /// The engine does not provide this operation.
    #[error("operation not supported: {operation}")]
    NotSupported {
        /// Name of the unsupported operation.
        operation: String,
    },

    /// The operation was entered from inside a pool transaction.
    #[error("operation not permitted inside a pool transaction")]
    TransactionScope,

    /// Unknown engine name, or the pool belongs to a different engine.
    #[error("wrong engine name: {message}")]
    WrongEngineName {
        /// Description of the mismatch.
        message: String,
    },

    /// The persisted comparator cannot be re-bound.
    #[error("comparator mismatch: {message}")]
    ComparatorMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// The backing file path cannot be used.
    #[error("wrong path: {path}: {message}")]
    WrongPath {
        /// The offending path.
        path: String,
        /// Description of the failure.
        message: String,
    },

    /// The requested pool size is outside the supported range.
    #[error("wrong size: {size} bytes ({message})")]
    WrongSize {
        /// The rejected size.
        size: u64,
        /// Description of the bound that was violated.
        message: String,
    },

    /// A pool runtime failure surfaced through an engine operation.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Failure that does not fit a finer status.
    #[error("unknown error: {message}")]
    Unknown {
        /// Description of the failure.
        message: String,
    },
}

impl Error {
    /// Creates an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a config type error.
    pub fn config_type(message: impl Into<String>) -> Self {
        Self::ConfigTypeError {
            message: message.into(),
        }
    }

    /// Creates a defrag error.
    pub fn defrag(message: impl Into<String>) -> Self {
        Self::DefragError {
            message: message.into(),
        }
    }

    /// Creates a not-supported error.
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
        }
    }

    /// Creates a wrong-engine-name error.
    pub fn wrong_engine(message: impl Into<String>) -> Self {
        Self::WrongEngineName {
            message: message.into(),
        }
    }

    /// Creates a comparator mismatch error.
    pub fn comparator_mismatch(message: impl Into<String>) -> Self {
        Self::ComparatorMismatch {
            message: message.into(),
        }
    }

    /// Creates a wrong-path error.
    pub fn wrong_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WrongPath {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a wrong-size error.
    pub fn wrong_size(size: u64, message: impl Into<String>) -> Self {
        Self::WrongSize {
            size,
            message: message.into(),
        }
    }

    /// Creates an unknown error.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// Returns `true` for `NotFound`, useful in assertions.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
