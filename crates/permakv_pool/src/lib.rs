//! # permakv pool
//!
//! Persistent memory pool and transaction runtime for permakv.
//!
//! A pool is a single backing file holding a byte-addressable arena. The
//! engine layer stores its containers inside the arena and reaches them
//! through offsets; the pool provides:
//!
//! - a media abstraction ([`PoolFile`]) so tests can inject faults
//! - a first-fit free-list allocator over the arena heap
//! - undo-log transactions ([`Pool::run`]) with snapshot, commit and
//!   rollback, and crash recovery at open
//! - a root offset, a layout name identifying the owning engine, and a
//!   persisted comparator name
//!
//! The pool does not interpret the bytes it stores. Logical isolation
//! between concurrent operations is the engine layer's responsibility;
//! the pool only guarantees that each committed transaction is applied
//! atomically with respect to crashes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod alloc;
mod error;
mod media;
mod pool;
mod tx;

pub use error::{PoolError, PoolResult};
pub use media::{FsPoolFile, PoolFile};
pub use pool::{Pool, PoolReader, FORMAT_VERSION, MAGIC, MAX_POOL, MIN_POOL};
pub use tx::PoolTx;
