//! Storage engines and the capability interface they implement.

use crate::error::{Error, Result};
use crate::iterator::{KvIterator, ReadIterator, WriteIterator};
use std::ops::ControlFlow;

pub(crate) mod common;

pub mod cmap;
pub mod csmap;
pub mod radix;
pub mod stree;

pub use cmap::Cmap;
pub use csmap::Csmap;
pub use radix::Radix;
pub use stree::Stree;

/// Callback receiving a value.
pub type ValueCallback<'a> = &'a mut dyn FnMut(&[u8]);

/// Callback receiving a key and value during iteration.
///
/// Returning [`ControlFlow::Break`] stops the scan; the enclosing
/// operation then reports [`Error::StoppedByCallback`].
pub type KvCallback<'a> = &'a mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>;

/// A batch of put/remove operations staged in volatile memory and
/// committed into the container atomically.
pub trait BatchTransaction {
    /// Stages an insert-or-replace of `key`.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Stages a removal of `key`.
    fn remove(&mut self, key: &[u8]) -> Result<()>;

    /// Replays every staged operation into the container inside one
    /// pool transaction. The batch is empty afterwards.
    fn commit(&mut self) -> Result<()>;

    /// Discards every staged operation.
    fn abort(&mut self);
}

/// The operation vocabulary shared by every engine.
///
/// Each engine implements the operations its container supports;
/// everything else falls through to a default that reports
/// [`Error::NotSupported`] instead of dispatching into a stub. The
/// unordered `cmap` engine therefore rejects every ranged form, and
/// only `stree` answers the neighbor queries.
pub trait KvEngine: Send + Sync {
    /// Engine name as used at open.
    fn name(&self) -> &'static str;

    /// Number of entries in the container.
    fn count_all(&self) -> Result<usize>;

    /// Number of entries with keys strictly greater than `key`.
    fn count_above(&self, key: &[u8]) -> Result<usize> {
        let _ = key;
        Err(Error::not_supported("count_above"))
    }

    /// Number of entries with keys greater than or equal to `key`.
    fn count_equal_above(&self, key: &[u8]) -> Result<usize> {
        let _ = key;
        Err(Error::not_supported("count_equal_above"))
    }

    /// Number of entries with keys less than or equal to `key`.
    fn count_equal_below(&self, key: &[u8]) -> Result<usize> {
        let _ = key;
        Err(Error::not_supported("count_equal_below"))
    }

    /// Number of entries with keys strictly less than `key`.
    fn count_below(&self, key: &[u8]) -> Result<usize> {
        let _ = key;
        Err(Error::not_supported("count_below"))
    }

    /// Number of entries in `[key1, key2)`; empty unless `key1 < key2`
    /// under the active comparator.
    fn count_between(&self, key1: &[u8], key2: &[u8]) -> Result<usize> {
        let _ = (key1, key2);
        Err(Error::not_supported("count_between"))
    }

    /// Visits every entry.
    fn get_all(&self, callback: KvCallback<'_>) -> Result<()>;

    /// Visits entries with keys strictly greater than `key`.
    fn get_above(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        let _ = (key, callback);
        Err(Error::not_supported("get_above"))
    }

    /// Visits entries with keys greater than or equal to `key`.
    fn get_equal_above(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        let _ = (key, callback);
        Err(Error::not_supported("get_equal_above"))
    }

    /// Visits entries with keys less than or equal to `key`.
    fn get_equal_below(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        let _ = (key, callback);
        Err(Error::not_supported("get_equal_below"))
    }

    /// Visits entries with keys strictly less than `key`.
    fn get_below(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        let _ = (key, callback);
        Err(Error::not_supported("get_below"))
    }

    /// Visits entries in `[key1, key2)`; empty unless `key1 < key2`
    /// under the active comparator.
    fn get_between(&self, key1: &[u8], key2: &[u8], callback: KvCallback<'_>) -> Result<()> {
        let _ = (key1, key2, callback);
        Err(Error::not_supported("get_between"))
    }

    /// Whether `key` is present.
    fn exists(&self, key: &[u8]) -> Result<bool>;

    /// Delivers the value of `key` to `callback`, or `NotFound`.
    fn get(&self, key: &[u8], callback: ValueCallback<'_>) -> Result<()>;

    /// Inserts `key` or replaces its value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Removes `key`; returns `false` when it was absent.
    fn remove(&self, key: &[u8]) -> Result<bool>;

    /// Visits the entry with the greatest key less than or equal to `key`.
    fn get_floor_entry(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        let _ = (key, callback);
        Err(Error::not_supported("get_floor_entry"))
    }

    /// Visits the entry with the greatest key strictly less than `key`.
    fn get_lower_entry(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        let _ = (key, callback);
        Err(Error::not_supported("get_lower_entry"))
    }

    /// Visits the entry with the least key greater than or equal to `key`.
    fn get_ceiling_entry(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        let _ = (key, callback);
        Err(Error::not_supported("get_ceiling_entry"))
    }

    /// Visits the entry with the least key strictly greater than `key`.
    fn get_higher_entry(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        let _ = (key, callback);
        Err(Error::not_supported("get_higher_entry"))
    }

    /// Creates a bidirectional cursor.
    fn iter(&self) -> Result<Box<dyn KvIterator + '_>> {
        Err(Error::not_supported("iter"))
    }

    /// Creates a seek-capable read cursor.
    fn read_iter(&self) -> Result<Box<dyn ReadIterator + '_>> {
        Err(Error::not_supported("read_iter"))
    }

    /// Creates a seek-capable cursor with write-range staging.
    fn write_iter(&self) -> Result<Box<dyn WriteIterator + '_>> {
        Err(Error::not_supported("write_iter"))
    }

    /// Begins a batched transaction.
    fn begin_tx(&self) -> Result<Box<dyn BatchTransaction + '_>> {
        Err(Error::not_supported("begin_tx"))
    }

    /// Compacts a range of the container given as percentages.
    fn defrag(&self, start_percent: u64, amount_percent: u64) -> Result<()> {
        let _ = (start_percent, amount_percent);
        Err(Error::not_supported("defrag"))
    }
}
