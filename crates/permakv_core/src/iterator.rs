//! Iterator contracts shared by the engines.

use crate::error::Result;

/// A bidirectional cursor over an engine's entries.
///
/// Stepping past the end wraps to the first entry and stepping before
/// the first wraps to the end sentinel; callers test [`valid`] after
/// every move. Cursors are transient: they are not persisted and are
/// invalidated by concurrent mutations unless the engine documents
/// otherwise.
///
/// [`valid`]: KvIterator::valid
pub trait KvIterator {
    /// Positions at the first entry.
    fn seek_to_first(&mut self) -> Result<()>;

    /// Positions at the last entry.
    fn seek_to_last(&mut self) -> Result<()>;

    /// Positions at exactly `key`, or at the end sentinel.
    fn seek(&mut self, key: &[u8]) -> Result<()>;

    /// Positions at the greatest key strictly less than `key`, or end.
    fn seek_for_prev(&mut self, key: &[u8]) -> Result<()>;

    /// Positions at the least key strictly greater than `key`, or end.
    fn seek_for_next(&mut self, key: &[u8]) -> Result<()>;

    /// Steps forward; from the end sentinel this wraps to the first entry.
    fn advance(&mut self) -> Result<()>;

    /// Steps backward; from the first entry this wraps to the end sentinel.
    fn retreat(&mut self) -> Result<()>;

    /// Returns `true` while the cursor is on an entry.
    fn valid(&self) -> bool;

    /// Returns the current key.
    fn key(&self) -> Result<Vec<u8>>;

    /// Returns the current value.
    fn value(&self) -> Result<Vec<u8>>;
}

/// A seek-capable read cursor with byte-range access to the value.
///
/// All positioning methods answer `Ok` when the cursor lands on an
/// entry and `Err(NotFound)` when no entry qualifies.
pub trait ReadIterator {
    /// Positions at exactly `key`.
    fn seek(&mut self, key: &[u8]) -> Result<()>;

    /// Positions at the greatest key strictly less than `key`.
    fn seek_lower(&mut self, key: &[u8]) -> Result<()>;

    /// Positions at the greatest key less than or equal to `key`.
    fn seek_lower_eq(&mut self, key: &[u8]) -> Result<()>;

    /// Positions at the least key strictly greater than `key`.
    fn seek_higher(&mut self, key: &[u8]) -> Result<()>;

    /// Positions at the least key greater than or equal to `key`.
    fn seek_higher_eq(&mut self, key: &[u8]) -> Result<()>;

    /// Positions at the first entry.
    fn seek_to_first(&mut self) -> Result<()>;

    /// Positions at the last entry.
    fn seek_to_last(&mut self) -> Result<()>;

    /// Answers whether a following entry exists, without moving.
    fn is_next(&mut self) -> Result<()>;

    /// Steps to the following entry.
    fn next(&mut self) -> Result<()>;

    /// Steps to the preceding entry.
    fn prev(&mut self) -> Result<()>;

    /// Returns the current key.
    fn key(&self) -> Result<Vec<u8>>;

    /// Reads bytes `[pos, pos + n)` of the current value, clamped to the
    /// value length.
    fn read_range(&self, pos: usize, n: usize) -> Result<Vec<u8>>;
}

/// A read cursor that can stage in-place edits of the current value.
pub trait WriteIterator: ReadIterator {
    /// Returns a writable staging buffer covering bytes `[pos, pos + n)`
    /// of the current value, clamped to the value length. Multiple
    /// staged ranges may be open at once; none touches the live value
    /// until [`commit`].
    ///
    /// [`commit`]: WriteIterator::commit
    fn write_range(&mut self, pos: usize, n: usize) -> Result<&mut [u8]>;

    /// Atomically applies all staged ranges to the live value.
    fn commit(&mut self) -> Result<()>;

    /// Discards all staged ranges.
    fn abort(&mut self);
}
