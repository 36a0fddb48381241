//! Helpers shared by the engine containers.

use crate::error::Result;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use permakv_pool::{PoolReader, PoolTx};
use std::hash::Hasher;

/// Writes a length-prefixed byte string into the heap, returning its
/// offset. Engines store every key and value through this layout.
pub(crate) fn write_bytes(tx: &mut PoolTx<'_>, data: &[u8]) -> Result<u64> {
    let off = tx.alloc(8 + data.len())?;
    tx.write_u64(off, data.len() as u64)?;
    tx.write(off + 8, data)?;
    Ok(off)
}

/// Reads a length-prefixed byte string at `offset`.
pub(crate) fn read_bytes<R: PoolReader>(reader: &R, offset: u64) -> Result<Vec<u8>> {
    let len = reader.read_u64(offset)?;
    Ok(reader.read(offset + 8, len as usize)?)
}

/// Length of the byte string at `offset` without copying it.
pub(crate) fn bytes_len<R: PoolReader>(reader: &R, offset: u64) -> Result<usize> {
    Ok(reader.read_u64(offset)? as usize)
}

/// Frees a length-prefixed byte string.
pub(crate) fn free_bytes(tx: &mut PoolTx<'_>, offset: u64) -> Result<()> {
    tx.free(offset)?;
    Ok(())
}

/// Deterministic 64-bit hash of a key.
///
/// Must be stable across process restarts: `cmap` persists chains under
/// it and `csmap` derives skip-list levels from it.
pub(crate) fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    hasher.write(key);
    hasher.finish()
}

/// A fixed array of reader-writer locks indexed by hashable position.
///
/// Grants per-entry shared or exclusive access without volatile state in
/// the pool; two entries mapping to the same stripe merely serialize.
pub(crate) struct LockStripes {
    stripes: Vec<RwLock<()>>,
}

impl LockStripes {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            stripes: (0..count.next_power_of_two()).map(|_| RwLock::new(())).collect(),
        }
    }

    fn index(&self, position: u64) -> usize {
        (position as usize) & (self.stripes.len() - 1)
    }

    pub(crate) fn shared(&self, position: u64) -> RwLockReadGuard<'_, ()> {
        self.stripes[self.index(position)].read()
    }

    pub(crate) fn exclusive(&self, position: u64) -> RwLockWriteGuard<'_, ()> {
        self.stripes[self.index(position)].write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permakv_pool::{Pool, MIN_POOL};
    use tempfile::tempdir;

    #[test]
    fn byte_strings_round_trip() {
        let dir = tempdir().unwrap();
        let pool = Pool::create(&dir.path().join("pool"), "t", MIN_POOL).unwrap();

        let off = pool.run(|tx| write_bytes(tx, b"some value")).unwrap();

        assert_eq!(read_bytes(&pool, off).unwrap(), b"some value");
        assert_eq!(bytes_len(&pool, off).unwrap(), 10);
    }

    #[test]
    fn empty_byte_string_round_trips() {
        let dir = tempdir().unwrap();
        let pool = Pool::create(&dir.path().join("pool"), "t", MIN_POOL).unwrap();

        let off = pool.run(|tx| write_bytes(tx, b"")).unwrap();

        assert_ne!(off, 0);
        assert_eq!(read_bytes(&pool, off).unwrap(), b"");
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_key(b"key1"), hash_key(b"key1"));
        assert_ne!(hash_key(b"key1"), hash_key(b"key2"));
    }
}
