//! # permakv core
//!
//! Embedded key-value storage library with pluggable persistent engines.
//!
//! A host program opens a named engine over a pool backed by a file and
//! performs point and range operations on string-to-string mappings:
//!
//! - [`engines::Cmap`] (`"cmap"`) — unordered concurrent hash map
//! - [`engines::Stree`] (`"stree"`) — sorted B-tree with neighbor queries
//! - [`engines::Csmap`] (`"csmap"`) — concurrent sorted map
//! - [`engines::Radix`] (`"radix"`) — radix trie with batched
//!   transactions and write-range cursors
//!
//! All engines share one operation vocabulary ([`KvEngine`]); ordered
//! engines additionally honor a pluggable, named [`Comparator`]. Every
//! mutation is crash-atomic through the pool's transaction runtime.
//!
//! ## Example
//!
//! ```rust,ignore
//! use permakv_core::{Config, Db};
//!
//! let config = Config::new()
//!     .put_path("/mnt/pmem/store")
//!     .put_size(64 * 1024 * 1024)
//!     .put_force_create(true);
//!
//! let db = Db::open("cmap", config)?;
//! db.put(b"key1", b"value1")?;
//! assert_eq!(db.get_copy(b"key1")?, b"value1");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod comparator;
mod config;
mod db;
pub mod engines;
mod error;
mod iterator;

pub use comparator::{
    lookup_comparator, register_comparator, Comparator, LexicographicComparator, LEXICOGRAPHIC,
};
pub use config::Config;
pub use db::Db;
pub use engines::{BatchTransaction, KvCallback, KvEngine, ValueCallback};
pub use error::{Error, Result};
pub use iterator::{KvIterator, ReadIterator, WriteIterator};

// The pool types surface in the public API through `Config::put_oid`.
pub use permakv_pool::{Pool, PoolError, MAX_POOL, MIN_POOL};
