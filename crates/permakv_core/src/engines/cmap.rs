//! Concurrent hash map engine (`cmap`).
//!
//! An open-chaining hash map persisted as a bucket directory of chain
//! heads plus fixed-size chain nodes, all addressed by offset. The hash
//! function is deterministic across restarts, so persisted chains stay
//! valid; the only volatile state is the entry count, rebuilt from the
//! directory at open, and the lock table.
//!
//! Locking follows the accessor discipline: each operation takes the
//! resize lock shared and its bucket's stripe shared (reads) or
//! exclusive (writes), so readers and writers proceed in parallel across
//! distinct buckets and serialize per key. Rehashing takes the resize
//! lock exclusively and runs inside one pool transaction.
//!
//! No ordering: every ranged operation reports `NotSupported` through
//! the capability trait's defaults, and the cursor is forward-only.

use crate::comparator::Comparator;
use crate::engines::common::{self, free_bytes, read_bytes, write_bytes, LockStripes};
use crate::engines::{KvCallback, KvEngine, ValueCallback};
use crate::error::{Error, Result};
use crate::iterator::KvIterator;
use parking_lot::RwLock;
use permakv_pool::{Pool, PoolError, PoolReader};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Layout name stored in pools owned by this engine.
pub const LAYOUT: &str = "permakv_cmap";

const INITIAL_BUCKETS: u64 = 128;
const MAX_LOAD_FACTOR: u64 = 2;
const LOCK_STRIPES: usize = 64;

// Meta block: directory offset, bucket count.
const META_SIZE: usize = 16;

// Chain node: next, hash, key offset, value offset.
const NODE_SIZE: usize = 32;

/// The `cmap` engine.
pub struct Cmap {
    pool: Arc<Pool>,
    resize: RwLock<()>,
    stripes: LockStripes,
    count: AtomicUsize,
}

impl Cmap {
    /// Attaches to the pool's map, creating it on a fresh pool.
    pub(crate) fn open(
        pool: Arc<Pool>,
        configured: Option<Arc<dyn Comparator>>,
    ) -> Result<Self> {
        if configured.is_some() {
            return Err(Error::invalid_argument(
                "cmap is unordered and accepts no comparator",
            ));
        }

        if pool.root()? == 0 {
            pool.run(|tx| -> Result<()> {
                let meta = tx.alloc(META_SIZE)?;
                let dir = tx.alloc(INITIAL_BUCKETS as usize * 8)?;
                tx.write(dir, &vec![0u8; INITIAL_BUCKETS as usize * 8])?;
                tx.write_u64(meta, dir)?;
                tx.write_u64(meta + 8, INITIAL_BUCKETS)?;
                tx.set_root(meta)?;
                Ok(())
            })?;
        }

        let engine = Self {
            pool,
            resize: RwLock::new(()),
            stripes: LockStripes::new(LOCK_STRIPES),
            count: AtomicUsize::new(0),
        };
        engine.runtime_initialize()?;
        debug!(entries = engine.count.load(AtomicOrdering::Relaxed), "cmap engine started");
        Ok(engine)
    }

    /// Rebuilds volatile metadata from the persisted directory.
    fn runtime_initialize(&self) -> Result<()> {
        let (dir, buckets) = self.geometry()?;
        let pool = self.pool.as_ref();
        let mut entries = 0;
        for bucket in 0..buckets {
            let mut node = PoolReader::read_u64(pool, dir + bucket * 8)?;
            while node != 0 {
                entries += 1;
                node = PoolReader::read_u64(pool, node)?;
            }
        }
        self.count.store(entries, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn geometry(&self) -> Result<(u64, u64)> {
        let meta = self.pool.root()?;
        let pool = self.pool.as_ref();
        let dir = PoolReader::read_u64(pool, meta)?;
        let buckets = PoolReader::read_u64(pool, meta + 8)?;
        Ok((dir, buckets))
    }

    fn bucket_of(hash: u64, buckets: u64) -> u64 {
        hash % buckets
    }

    /// Walks a chain for `key`, returning `(previous node, node)`.
    fn find_in_chain<R: PoolReader>(
        reader: &R,
        head: u64,
        hash: u64,
        key: &[u8],
    ) -> Result<Option<(u64, u64)>> {
        let mut prev = 0;
        let mut node = head;
        while node != 0 {
            let node_hash = reader.read_u64(node + 8)?;
            if node_hash == hash {
                let key_off = reader.read_u64(node + 16)?;
                if read_bytes(reader, key_off)? == key {
                    return Ok(Some((prev, node)));
                }
            }
            prev = node;
            node = reader.read_u64(node)?;
        }
        Ok(None)
    }

    fn load_exceeded(&self, buckets: u64) -> bool {
        self.count.load(AtomicOrdering::Relaxed) as u64 > buckets * MAX_LOAD_FACTOR
    }

    /// Doubles the directory when the load factor is exceeded.
    ///
    /// Iterators are not required to survive this.
    fn maybe_rehash(&self) -> Result<()> {
        let _guard = self.resize.write();
        let (old_dir, old_buckets) = self.geometry()?;
        if !self.load_exceeded(old_buckets) {
            return Ok(());
        }
        let new_buckets = old_buckets * 2;
        trace!(old_buckets, new_buckets, "rehash");

        self.pool.run(|tx| -> Result<()> {
            let meta = tx.pool().root()?;
            let new_dir = tx.alloc(new_buckets as usize * 8)?;
            let mut heads = vec![0u64; new_buckets as usize];

            for bucket in 0..old_buckets {
                let mut node = tx.read_u64(old_dir + bucket * 8)?;
                while node != 0 {
                    let next = tx.read_u64(node)?;
                    let hash = tx.read_u64(node + 8)?;
                    let target = Self::bucket_of(hash, new_buckets) as usize;
                    tx.write_u64(node, heads[target])?;
                    heads[target] = node;
                    node = next;
                }
            }

            let mut dir_bytes = Vec::with_capacity(new_buckets as usize * 8);
            for head in &heads {
                dir_bytes.extend_from_slice(&head.to_le_bytes());
            }
            tx.write(new_dir, &dir_bytes)?;
            tx.write_u64(meta, new_dir)?;
            tx.write_u64(meta + 8, new_buckets)?;
            tx.free(old_dir)?;
            Ok(())
        })
    }
}

impl KvEngine for Cmap {
    fn name(&self) -> &'static str {
        "cmap"
    }

    fn count_all(&self) -> Result<usize> {
        trace!("count_all");
        Ok(self.count.load(AtomicOrdering::Relaxed))
    }

    fn get_all(&self, callback: KvCallback<'_>) -> Result<()> {
        trace!("get_all");
        let _resize = self.resize.read();
        let (dir, buckets) = self.geometry()?;
        let pool = self.pool.as_ref();
        // Bucket by bucket under its stripe; the scan is not atomic
        // across buckets.
        for bucket in 0..buckets {
            let _stripe = self.stripes.shared(bucket);
            let mut node = PoolReader::read_u64(pool, dir + bucket * 8)?;
            while node != 0 {
                let key_off = PoolReader::read_u64(pool, node + 16)?;
                let val_off = PoolReader::read_u64(pool, node + 24)?;
                let key = read_bytes(pool, key_off)?;
                let value = read_bytes(pool, val_off)?;
                if callback(&key, &value).is_break() {
                    return Err(Error::StoppedByCallback);
                }
                node = PoolReader::read_u64(pool, node)?;
            }
        }
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        trace!(key_len = key.len(), "exists");
        let _resize = self.resize.read();
        let (dir, buckets) = self.geometry()?;
        let hash = common::hash_key(key);
        let bucket = Self::bucket_of(hash, buckets);
        let _stripe = self.stripes.shared(bucket);
        let pool = self.pool.as_ref();
        let head = PoolReader::read_u64(pool, dir + bucket * 8)?;
        Ok(Self::find_in_chain(pool, head, hash, key)?.is_some())
    }

    fn get(&self, key: &[u8], callback: ValueCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get");
        let _resize = self.resize.read();
        let (dir, buckets) = self.geometry()?;
        let hash = common::hash_key(key);
        let bucket = Self::bucket_of(hash, buckets);
        let _stripe = self.stripes.shared(bucket);
        let pool = self.pool.as_ref();
        let head = PoolReader::read_u64(pool, dir + bucket * 8)?;
        match Self::find_in_chain(pool, head, hash, key)? {
            None => Err(Error::NotFound),
            Some((_, node)) => {
                let val_off = PoolReader::read_u64(pool, node + 24)?;
                let value = read_bytes(pool, val_off)?;
                callback(&value);
                Ok(())
            }
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        trace!(key_len = key.len(), value_len = value.len(), "put");
        let inserted = {
            let _resize = self.resize.read();
            let (dir, buckets) = self.geometry()?;
            let hash = common::hash_key(key);
            let bucket = Self::bucket_of(hash, buckets);
            let _stripe = self.stripes.exclusive(bucket);
            let pool = self.pool.as_ref();
            let slot = dir + bucket * 8;
            let head = PoolReader::read_u64(pool, slot)?;

            match Self::find_in_chain(pool, head, hash, key)? {
                Some((_, node)) => {
                    // Replace the value field in place.
                    self.pool.run(|tx| -> Result<()> {
                        let old_val = tx.read_u64(node + 24)?;
                        let new_val = write_bytes(tx, value)?;
                        tx.write_u64(node + 24, new_val)?;
                        free_bytes(tx, old_val)?;
                        Ok(())
                    })?;
                    false
                }
                None => {
                    self.pool.run(|tx| -> Result<()> {
                        let node = tx.alloc(NODE_SIZE)?;
                        let key_off = write_bytes(tx, key)?;
                        let val_off = write_bytes(tx, value)?;
                        tx.write_u64(node, head)?;
                        tx.write_u64(node + 8, hash)?;
                        tx.write_u64(node + 16, key_off)?;
                        tx.write_u64(node + 24, val_off)?;
                        tx.write_u64(slot, node)?;
                        Ok(())
                    })?;
                    self.count.fetch_add(1, AtomicOrdering::Relaxed);
                    true
                }
            }
        };

        if inserted {
            let (_, buckets) = self.geometry()?;
            if self.load_exceeded(buckets) {
                self.maybe_rehash()?;
            }
        }
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<bool> {
        trace!(key_len = key.len(), "remove");
        let _resize = self.resize.read();
        let (dir, buckets) = self.geometry()?;
        let hash = common::hash_key(key);
        let bucket = Self::bucket_of(hash, buckets);
        let _stripe = self.stripes.exclusive(bucket);
        let pool = self.pool.as_ref();
        let slot = dir + bucket * 8;
        let head = PoolReader::read_u64(pool, slot)?;

        match Self::find_in_chain(pool, head, hash, key)? {
            None => Ok(false),
            Some((prev, node)) => {
                self.pool.run(|tx| -> Result<()> {
                    let next = tx.read_u64(node)?;
                    if prev == 0 {
                        tx.write_u64(slot, next)?;
                    } else {
                        tx.write_u64(prev, next)?;
                    }
                    let key_off = tx.read_u64(node + 16)?;
                    let val_off = tx.read_u64(node + 24)?;
                    free_bytes(tx, key_off)?;
                    free_bytes(tx, val_off)?;
                    tx.free(node)?;
                    Ok(())
                })?;
                self.count.fetch_sub(1, AtomicOrdering::Relaxed);
                Ok(true)
            }
        }
    }

    fn iter(&self) -> Result<Box<dyn KvIterator + '_>> {
        trace!("iter");
        Ok(Box::new(CmapIter {
            engine: self,
            pos: None,
        }))
    }

    fn defrag(&self, start_percent: u64, amount_percent: u64) -> Result<()> {
        trace!(start_percent, amount_percent, "defrag");
        if start_percent >= 100 || amount_percent == 0 || amount_percent > 100 {
            return Err(Error::invalid_argument(format!(
                "defrag range {start_percent}% + {amount_percent}% is not a valid bucket range"
            )));
        }
        let end_percent = (start_percent + amount_percent).min(100);

        let _guard = self.resize.write();
        let (dir, buckets) = self.geometry()?;
        let first = buckets * start_percent / 100;
        let last = buckets * end_percent / 100;

        // Reallocate every key and value block in the selected buckets so
        // they pack tightly at the current free-list frontier.
        let result = self.pool.run(|tx| -> Result<()> {
            for bucket in first..last {
                let mut node = tx.read_u64(dir + bucket * 8)?;
                while node != 0 {
                    let key_off = tx.read_u64(node + 16)?;
                    let val_off = tx.read_u64(node + 24)?;
                    let key = read_bytes(tx, key_off)?;
                    let value = read_bytes(tx, val_off)?;
                    let new_key = write_bytes(tx, &key)?;
                    let new_val = write_bytes(tx, &value)?;
                    tx.write_u64(node + 16, new_key)?;
                    tx.write_u64(node + 24, new_val)?;
                    free_bytes(tx, key_off)?;
                    free_bytes(tx, val_off)?;
                    node = tx.read_u64(node)?;
                }
            }
            Ok(())
        });

        match result {
            Err(Error::Pool(PoolError::OutOfSpace { .. })) => {
                Err(Error::defrag("allocation failed while compacting"))
            }
            other => other,
        }
    }
}

/// Forward-only cursor over the map.
///
/// The underlying chain walk cannot run backwards, so `retreat`,
/// `seek_to_last` and `seek_for_prev` report `NotSupported`. Iteration
/// order is arbitrary and unstable.
struct CmapIter<'a> {
    engine: &'a Cmap,
    pos: Option<(u64, u64)>,
}

impl CmapIter<'_> {
    /// First node at or after `bucket`.
    fn first_from(&self, bucket: u64) -> Result<Option<(u64, u64)>> {
        let (dir, buckets) = self.engine.geometry()?;
        let pool = self.engine.pool.as_ref();
        for b in bucket..buckets {
            let head = PoolReader::read_u64(pool, dir + b * 8)?;
            if head != 0 {
                return Ok(Some((b, head)));
            }
        }
        Ok(None)
    }

    fn node_field(&self, node: u64, field: u64) -> Result<u64> {
        Ok(PoolReader::read_u64(self.engine.pool.as_ref(), node + field)?)
    }
}

impl KvIterator for CmapIter<'_> {
    fn seek_to_first(&mut self) -> Result<()> {
        self.pos = self.first_from(0)?;
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        Err(Error::not_supported("seek_to_last"))
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.seek_to_first()?;
        while let Some((_, node)) = self.pos {
            let key_off = self.node_field(node, 16)?;
            if read_bytes(self.engine.pool.as_ref(), key_off)? == key {
                return Ok(());
            }
            self.advance_inner()?;
        }
        Ok(())
    }

    fn seek_for_prev(&mut self, _key: &[u8]) -> Result<()> {
        Err(Error::not_supported("seek_for_prev"))
    }

    fn seek_for_next(&mut self, key: &[u8]) -> Result<()> {
        self.seek(key)?;
        if self.pos.is_some() {
            self.advance_inner()?;
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        if self.pos.is_none() {
            return self.seek_to_first();
        }
        self.advance_inner()
    }

    fn retreat(&mut self) -> Result<()> {
        Err(Error::not_supported("retreat"))
    }

    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn key(&self) -> Result<Vec<u8>> {
        match self.pos {
            None => Err(Error::NotFound),
            Some((_, node)) => {
                let key_off = self.node_field(node, 16)?;
                read_bytes(self.engine.pool.as_ref(), key_off)
            }
        }
    }

    fn value(&self) -> Result<Vec<u8>> {
        match self.pos {
            None => Err(Error::NotFound),
            Some((_, node)) => {
                let val_off = self.node_field(node, 24)?;
                read_bytes(self.engine.pool.as_ref(), val_off)
            }
        }
    }
}

impl CmapIter<'_> {
    fn advance_inner(&mut self) -> Result<()> {
        let Some((bucket, node)) = self.pos else {
            return Ok(());
        };
        let next = self.node_field(node, 0)?;
        self.pos = if next != 0 {
            Some((bucket, next))
        } else {
            self.first_from(bucket + 1)?
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permakv_pool::MIN_POOL;
    use tempfile::tempdir;

    fn open_map(dir: &std::path::Path) -> Cmap {
        let path = dir.join("cmap.pool");
        let pool = if path.exists() {
            Pool::open(&path, LAYOUT).unwrap()
        } else {
            Pool::create(&path, LAYOUT, MIN_POOL).unwrap()
        };
        Cmap::open(Arc::new(pool), None).unwrap()
    }

    #[test]
    fn put_get_remove_round_trip() {
        let dir = tempdir().unwrap();
        let map = open_map(dir.path());

        map.put(b"key1", b"value1").unwrap();
        assert_eq!(map.count_all().unwrap(), 1);
        assert!(map.exists(b"key1").unwrap());

        let mut got = Vec::new();
        map.get(b"key1", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"value1");

        map.put(b"key1", b"replaced").unwrap();
        assert_eq!(map.count_all().unwrap(), 1);
        map.get(b"key1", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"replaced");

        assert!(map.remove(b"key1").unwrap());
        assert!(!map.remove(b"key1").unwrap());
        assert!(!map.exists(b"key1").unwrap());
        assert!(matches!(
            map.get(b"key1", &mut |_| {}).unwrap_err(),
            Error::NotFound
        ));
    }

    #[test]
    fn range_operations_are_not_supported() {
        let dir = tempdir().unwrap();
        let map = open_map(dir.path());

        assert!(matches!(
            map.count_above(b"k").unwrap_err(),
            Error::NotSupported { .. }
        ));
        assert!(matches!(
            map.get_between(b"a", b"z", &mut |_, _| ControlFlow::Continue(()))
                .unwrap_err(),
            Error::NotSupported { .. }
        ));
    }

    #[test]
    fn rehash_preserves_entries() {
        let dir = tempdir().unwrap();
        let map = open_map(dir.path());

        let n = (INITIAL_BUCKETS * MAX_LOAD_FACTOR * 4) as usize;
        for i in 0..n {
            let key = format!("key{i}");
            map.put(key.as_bytes(), key.as_bytes()).unwrap();
        }
        assert_eq!(map.count_all().unwrap(), n);

        let (_, buckets) = map.geometry().unwrap();
        assert!(buckets > INITIAL_BUCKETS);

        for i in 0..n {
            let key = format!("key{i}");
            assert!(map.exists(key.as_bytes()).unwrap(), "missing {key}");
        }
    }

    #[test]
    fn reopen_recounts_entries() {
        let dir = tempdir().unwrap();
        {
            let map = open_map(dir.path());
            for i in 0..500 {
                map.put(format!("key{i}").as_bytes(), b"v").unwrap();
            }
        }
        let map = open_map(dir.path());
        assert_eq!(map.count_all().unwrap(), 500);
        assert!(map.exists(b"key499").unwrap());
    }

    #[test]
    fn get_all_visits_every_entry_once() {
        let dir = tempdir().unwrap();
        let map = open_map(dir.path());
        for i in 0..50 {
            map.put(format!("key{i}").as_bytes(), b"v").unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        map.get_all(&mut |k, _| {
            assert!(seen.insert(k.to_vec()));
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn callback_stop_is_reported() {
        let dir = tempdir().unwrap();
        let map = open_map(dir.path());
        for i in 0..10 {
            map.put(format!("key{i}").as_bytes(), b"v").unwrap();
        }

        let mut visited = 0;
        let err = map
            .get_all(&mut |_, _| {
                visited += 1;
                if visited == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::StoppedByCallback));
        assert_eq!(visited, 3);
    }

    #[test]
    fn reverse_iteration_is_rejected() {
        let dir = tempdir().unwrap();
        let map = open_map(dir.path());
        map.put(b"a", b"1").unwrap();

        let mut it = map.iter().unwrap();
        it.seek_to_first().unwrap();
        assert!(it.valid());

        assert!(matches!(
            it.retreat().unwrap_err(),
            Error::NotSupported { .. }
        ));
        assert!(matches!(
            it.seek_to_last().unwrap_err(),
            Error::NotSupported { .. }
        ));
        assert!(matches!(
            it.seek_for_prev(b"a").unwrap_err(),
            Error::NotSupported { .. }
        ));
    }

    #[test]
    fn defrag_validates_arguments_and_compacts() {
        let dir = tempdir().unwrap();
        let map = open_map(dir.path());
        for i in 0..100 {
            map.put(format!("key{i}").as_bytes(), format!("value{i}").as_bytes())
                .unwrap();
        }

        assert!(matches!(
            map.defrag(100, 1).unwrap_err(),
            Error::InvalidArgument { .. }
        ));
        assert!(matches!(
            map.defrag(0, 0).unwrap_err(),
            Error::InvalidArgument { .. }
        ));
        assert!(matches!(
            map.defrag(0, 101).unwrap_err(),
            Error::InvalidArgument { .. }
        ));

        map.defrag(0, 100).unwrap();
        for i in 0..100 {
            let mut got = Vec::new();
            map.get(format!("key{i}").as_bytes(), &mut |v| got = v.to_vec())
                .unwrap();
            assert_eq!(got, format!("value{i}").as_bytes());
        }
    }
}
