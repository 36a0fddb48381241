//! Concurrent sorted map engine (`csmap`).
//!
//! An ordered skip list persisted as offset-linked tower nodes hanging
//! off a fixed-height head node. A node's tower height is derived from
//! the deterministic key hash, so recovery needs no random state.
//!
//! Two-level locking discipline:
//!
//! - a container-wide reader-writer lock protects the skeleton. Pure
//!   reads, range scans and value overwrites of existing keys take it
//!   shared; inserting a new key and removal take it exclusive.
//! - a striped per-node lock protects individual entry values. Readers
//!   take the node lock shared while delivering a value; a value
//!   overwrite takes it exclusive under the shared container lock.
//!
//! Range bounds are compared with the active comparator, so a reversed
//! range is empty exactly when the comparator says the bounds are out
//! of order.

use crate::comparator::{bind_comparator, Comparator};
use crate::engines::common::{self, free_bytes, read_bytes, write_bytes, LockStripes};
use crate::engines::{KvCallback, KvEngine, ValueCallback};
use crate::error::{Error, Result};
use crate::iterator::KvIterator;
use parking_lot::RwLock;
use permakv_pool::{Pool, PoolReader, PoolTx};
use std::cmp::Ordering;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, trace};

/// Layout name stored in pools owned by this engine.
pub const LAYOUT: &str = "permakv_csmap";

const MAX_LEVEL: usize = 16;
const LOCK_STRIPES: usize = 64;

// Meta block: head node offset, entry count.
const META_SIZE: usize = 16;

// Node: tower height, key offset, value offset, then one forward link
// per level. The head node has the full height and a zero key offset.
const NODE_HEADER: usize = 24;

fn node_size(level: usize) -> usize {
    NODE_HEADER + level * 8
}

/// The `csmap` engine.
pub struct Csmap {
    pool: Arc<Pool>,
    cmp: Arc<dyn Comparator>,
    meta: u64,
    global: RwLock<()>,
    node_locks: LockStripes,
}

impl std::fmt::Debug for Csmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Csmap").field("meta", &self.meta).finish()
    }
}

struct SearchResult {
    /// Per level, the last node whose key is strictly less than the
    /// target (the head node where none is).
    preds: [u64; MAX_LEVEL],
    /// The node holding the target key, when present.
    found: Option<u64>,
}

impl Csmap {
    /// Attaches to the pool's map, creating it on a fresh pool.
    pub(crate) fn open(
        pool: Arc<Pool>,
        configured: Option<Arc<dyn Comparator>>,
    ) -> Result<Self> {
        let cmp = bind_comparator(&pool, configured)?;
        let meta = match pool.root()? {
            0 => pool.run(|tx| -> Result<u64> {
                let meta = tx.alloc(META_SIZE)?;
                let head = tx.alloc(node_size(MAX_LEVEL))?;
                tx.write(head, &vec![0u8; node_size(MAX_LEVEL)])?;
                tx.write_u64(head, MAX_LEVEL as u64)?;
                tx.write_u64(meta, head)?;
                tx.write_u64(meta + 8, 0)?;
                tx.set_comparator_name(cmp.name())?;
                tx.set_root(meta)?;
                Ok(meta)
            })?,
            offset => offset,
        };
        debug!(comparator = cmp.name(), "csmap engine started");
        Ok(Self {
            pool,
            cmp,
            meta,
            global: RwLock::new(()),
            node_locks: LockStripes::new(LOCK_STRIPES),
        })
    }

    /// Tower height for `key`: a geometric distribution read off the
    /// key's hash bits, capped at the head height.
    fn level_for(key: &[u8]) -> usize {
        let mut hash = common::hash_key(key);
        let mut level = 1;
        while hash & 1 == 1 && level < MAX_LEVEL {
            level += 1;
            hash >>= 1;
        }
        level
    }

    fn head(&self) -> Result<u64> {
        Ok(PoolReader::read_u64(self.pool.as_ref(), self.meta)?)
    }

    fn entry_count(&self) -> Result<u64> {
        Ok(PoolReader::read_u64(self.pool.as_ref(), self.meta + 8)?)
    }

    fn next_of<R: PoolReader>(reader: &R, node: u64, level: usize) -> Result<u64> {
        reader.read_u64(node + NODE_HEADER as u64 + level as u64 * 8).map_err(Error::from)
    }

    fn key_of<R: PoolReader>(reader: &R, node: u64) -> Result<Vec<u8>> {
        let key_off = reader.read_u64(node + 8)?;
        read_bytes(reader, key_off)
    }

    fn value_of<R: PoolReader>(reader: &R, node: u64) -> Result<Vec<u8>> {
        let val_off = reader.read_u64(node + 16)?;
        read_bytes(reader, val_off)
    }

    /// Skip-list descent collecting the predecessor at every level.
    fn search<R: PoolReader>(&self, reader: &R, key: &[u8]) -> Result<SearchResult> {
        let head = reader.read_u64(self.meta).map_err(Error::from)?;
        let mut preds = [head; MAX_LEVEL];
        let mut current = head;
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next = Self::next_of(reader, current, level)?;
                if next == 0 {
                    break;
                }
                let next_key = Self::key_of(reader, next)?;
                if self.cmp.compare(&next_key, key) == Ordering::Less {
                    current = next;
                } else {
                    break;
                }
            }
            preds[level] = current;
        }

        let candidate = Self::next_of(reader, current, 0)?;
        let found = if candidate != 0 {
            let candidate_key = Self::key_of(reader, candidate)?;
            (self.cmp.compare(&candidate_key, key) == Ordering::Equal).then_some(candidate)
        } else {
            None
        };
        Ok(SearchResult { preds, found })
    }

    /// First node with key greater than or equal to `key`; 0 at end.
    fn lower_bound(&self, key: &[u8]) -> Result<u64> {
        let result = self.search(self.pool.as_ref(), key)?;
        Self::next_of(self.pool.as_ref(), result.preds[0], 0)
    }

    /// First node with key strictly greater than `key`; 0 at end.
    fn upper_bound(&self, key: &[u8]) -> Result<u64> {
        let result = self.search(self.pool.as_ref(), key)?;
        match result.found {
            Some(node) => Self::next_of(self.pool.as_ref(), node, 0),
            None => Self::next_of(self.pool.as_ref(), result.preds[0], 0),
        }
    }

    fn first_node(&self) -> Result<u64> {
        Self::next_of(self.pool.as_ref(), self.head()?, 0)
    }

    fn last_node(&self) -> Result<u64> {
        let pool = self.pool.as_ref();
        let head = self.head()?;
        let mut current = head;
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next = Self::next_of(pool, current, level)?;
                if next == 0 {
                    break;
                }
                current = next;
            }
        }
        Ok(if current == head { 0 } else { current })
    }

    /// Walks nodes from `first`, stopping before the first key at or
    /// past `bound` (when given). Node values are read under the node's
    /// shared lock.
    fn iterate(
        &self,
        first: u64,
        bound: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        let pool = self.pool.as_ref();
        let mut node = first;
        while node != 0 {
            let key = Self::key_of(pool, node)?;
            if let Some(bound) = bound {
                if self.cmp.compare(&key, bound) != Ordering::Less {
                    return Ok(());
                }
            }
            let value = {
                let _node_guard = self.node_locks.shared(node >> 3);
                Self::value_of(pool, node)?
            };
            if visit(&key, &value).is_break() {
                return Err(Error::StoppedByCallback);
            }
            node = Self::next_of(pool, node, 0)?;
        }
        Ok(())
    }

    fn count_from(&self, first: u64, bound: Option<&[u8]>) -> Result<usize> {
        let pool = self.pool.as_ref();
        let mut node = first;
        let mut count = 0;
        while node != 0 {
            if let Some(bound) = bound {
                let key = Self::key_of(pool, node)?;
                if self.cmp.compare(&key, bound) != Ordering::Less {
                    break;
                }
            }
            count += 1;
            node = Self::next_of(pool, node, 0)?;
        }
        Ok(count)
    }

    /// Replaces the value of `node` under its exclusive node lock.
    fn overwrite_value(&self, node: u64, value: &[u8]) -> Result<()> {
        let _node_guard = self.node_locks.exclusive(node >> 3);
        self.pool.run(|tx| -> Result<()> {
            let old_val = tx.read_u64(node + 16)?;
            let new_val = write_bytes(tx, value)?;
            tx.write_u64(node + 16, new_val)?;
            free_bytes(tx, old_val)?;
            Ok(())
        })
    }

    fn insert_node(
        &self,
        tx: &mut PoolTx<'_>,
        search: &SearchResult,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let level = Self::level_for(key);
        let node = tx.alloc(node_size(level))?;
        let key_off = write_bytes(tx, key)?;
        let val_off = write_bytes(tx, value)?;
        tx.write_u64(node, level as u64)?;
        tx.write_u64(node + 8, key_off)?;
        tx.write_u64(node + 16, val_off)?;
        for l in 0..level {
            let pred = search.preds[l];
            let succ = Self::next_of(tx, pred, l)?;
            tx.write_u64(node + NODE_HEADER as u64 + l as u64 * 8, succ)?;
            tx.write_u64(pred + NODE_HEADER as u64 + l as u64 * 8, node)?;
        }
        let count = tx.read_u64(self.meta + 8)?;
        tx.write_u64(self.meta + 8, count + 1)?;
        Ok(())
    }

    fn remove_node(&self, tx: &mut PoolTx<'_>, search: &SearchResult, node: u64) -> Result<()> {
        let level = tx.read_u64(node)? as usize;
        for l in 0..level.min(MAX_LEVEL) {
            let pred = search.preds[l];
            let pred_next = Self::next_of(tx, pred, l)?;
            if pred_next == node {
                let succ = Self::next_of(tx, node, l)?;
                tx.write_u64(pred + NODE_HEADER as u64 + l as u64 * 8, succ)?;
            }
        }
        let key_off = tx.read_u64(node + 8)?;
        let val_off = tx.read_u64(node + 16)?;
        free_bytes(tx, key_off)?;
        free_bytes(tx, val_off)?;
        tx.free(node)?;
        let count = tx.read_u64(self.meta + 8)?;
        tx.write_u64(self.meta + 8, count.saturating_sub(1))?;
        Ok(())
    }
}

impl KvEngine for Csmap {
    fn name(&self) -> &'static str {
        "csmap"
    }

    fn count_all(&self) -> Result<usize> {
        trace!("count_all");
        let _guard = self.global.read();
        Ok(self.entry_count()? as usize)
    }

    fn count_above(&self, key: &[u8]) -> Result<usize> {
        trace!(key_len = key.len(), "count_above");
        let _guard = self.global.read();
        let first = self.upper_bound(key)?;
        self.count_from(first, None)
    }

    fn count_equal_above(&self, key: &[u8]) -> Result<usize> {
        trace!(key_len = key.len(), "count_equal_above");
        let _guard = self.global.read();
        let first = self.lower_bound(key)?;
        self.count_from(first, None)
    }

    fn count_equal_below(&self, key: &[u8]) -> Result<usize> {
        trace!(key_len = key.len(), "count_equal_below");
        let _guard = self.global.read();
        let total = self.entry_count()? as usize;
        let above = self.count_from(self.upper_bound(key)?, None)?;
        Ok(total - above)
    }

    fn count_below(&self, key: &[u8]) -> Result<usize> {
        trace!(key_len = key.len(), "count_below");
        let _guard = self.global.read();
        self.count_from(self.first_node()?, Some(key))
    }

    fn count_between(&self, key1: &[u8], key2: &[u8]) -> Result<usize> {
        trace!(key1_len = key1.len(), key2_len = key2.len(), "count_between");
        let _guard = self.global.read();
        if self.cmp.compare(key1, key2) != Ordering::Less {
            return Ok(0);
        }
        let first = self.lower_bound(key1)?;
        self.count_from(first, Some(key2))
    }

    fn get_all(&self, callback: KvCallback<'_>) -> Result<()> {
        trace!("get_all");
        let _guard = self.global.read();
        self.iterate(self.first_node()?, None, callback)
    }

    fn get_above(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_above");
        let _guard = self.global.read();
        let first = self.upper_bound(key)?;
        self.iterate(first, None, callback)
    }

    fn get_equal_above(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_equal_above");
        let _guard = self.global.read();
        let first = self.lower_bound(key)?;
        self.iterate(first, None, callback)
    }

    fn get_equal_below(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_equal_below");
        let _guard = self.global.read();
        let first = self.first_node()?;
        let mut bounded = false;
        let result = self.iterate(first, None, &mut |k, v| {
            if self.cmp.compare(k, key) == Ordering::Greater {
                bounded = true;
                return ControlFlow::Break(());
            }
            callback(k, v)
        });
        match result {
            Err(Error::StoppedByCallback) if bounded => Ok(()),
            other => other,
        }
    }

    fn get_below(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_below");
        let _guard = self.global.read();
        self.iterate(self.first_node()?, Some(key), callback)
    }

    fn get_between(&self, key1: &[u8], key2: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key1_len = key1.len(), key2_len = key2.len(), "get_between");
        let _guard = self.global.read();
        if self.cmp.compare(key1, key2) != Ordering::Less {
            return Ok(());
        }
        let first = self.lower_bound(key1)?;
        self.iterate(first, Some(key2), callback)
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        trace!(key_len = key.len(), "exists");
        let _guard = self.global.read();
        Ok(self.search(self.pool.as_ref(), key)?.found.is_some())
    }

    fn get(&self, key: &[u8], callback: ValueCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get");
        let _guard = self.global.read();
        match self.search(self.pool.as_ref(), key)?.found {
            None => Err(Error::NotFound),
            Some(node) => {
                let _node_guard = self.node_locks.shared(node >> 3);
                let value = Self::value_of(self.pool.as_ref(), node)?;
                callback(&value);
                Ok(())
            }
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        trace!(key_len = key.len(), value_len = value.len(), "put");
        // Overwriting an existing key only needs the shared container
        // lock plus the node's exclusive lock.
        {
            let _guard = self.global.read();
            if let Some(node) = self.search(self.pool.as_ref(), key)?.found {
                return self.overwrite_value(node, value);
            }
        }

        // A new key changes the skeleton; retry under the exclusive lock
        // since another writer may have inserted it meanwhile.
        let _guard = self.global.write();
        let search = self.search(self.pool.as_ref(), key)?;
        match search.found {
            Some(node) => self.overwrite_value(node, value),
            None => self
                .pool
                .run(|tx| -> Result<()> { self.insert_node(tx, &search, key, value) }),
        }
    }

    fn remove(&self, key: &[u8]) -> Result<bool> {
        trace!(key_len = key.len(), "remove");
        let _guard = self.global.write();
        let search = self.search(self.pool.as_ref(), key)?;
        match search.found {
            None => Ok(false),
            Some(node) => {
                self.pool
                    .run(|tx| -> Result<()> { self.remove_node(tx, &search, node) })?;
                Ok(true)
            }
        }
    }

    fn iter(&self) -> Result<Box<dyn KvIterator + '_>> {
        trace!("iter");
        Ok(Box::new(CsmapIter {
            engine: self,
            node: 0,
        }))
    }
}

/// Bidirectional cursor over the skip list.
///
/// `node == 0` is the end sentinel; stepping off either end wraps, per
/// the shared cursor contract.
struct CsmapIter<'a> {
    engine: &'a Csmap,
    node: u64,
}

impl CsmapIter<'_> {
    /// Greatest node below the current one, via a fresh descent.
    fn pred_of(&self, key: &[u8]) -> Result<u64> {
        let engine = self.engine;
        let result = engine.search(engine.pool.as_ref(), key)?;
        let pred = result.preds[0];
        Ok(if pred == engine.head()? { 0 } else { pred })
    }
}

impl KvIterator for CsmapIter<'_> {
    fn seek_to_first(&mut self) -> Result<()> {
        self.node = self.engine.first_node()?;
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        self.node = self.engine.last_node()?;
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.node = self
            .engine
            .search(self.engine.pool.as_ref(), key)?
            .found
            .unwrap_or(0);
        Ok(())
    }

    fn seek_for_prev(&mut self, key: &[u8]) -> Result<()> {
        let result = self.engine.search(self.engine.pool.as_ref(), key)?;
        self.node = match result.found {
            Some(node) => node,
            None => {
                let pred = result.preds[0];
                if pred == self.engine.head()? {
                    0
                } else {
                    pred
                }
            }
        };
        Ok(())
    }

    fn seek_for_next(&mut self, key: &[u8]) -> Result<()> {
        self.node = self.engine.upper_bound(key)?;
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        self.node = if self.node == 0 {
            self.engine.first_node()?
        } else {
            Csmap::next_of(self.engine.pool.as_ref(), self.node, 0)?
        };
        Ok(())
    }

    fn retreat(&mut self) -> Result<()> {
        self.node = if self.node == 0 {
            self.engine.last_node()?
        } else {
            let key = Csmap::key_of(self.engine.pool.as_ref(), self.node)?;
            self.pred_of(&key)?
        };
        Ok(())
    }

    fn valid(&self) -> bool {
        self.node != 0
    }

    fn key(&self) -> Result<Vec<u8>> {
        if self.node == 0 {
            return Err(Error::NotFound);
        }
        Csmap::key_of(self.engine.pool.as_ref(), self.node)
    }

    fn value(&self) -> Result<Vec<u8>> {
        if self.node == 0 {
            return Err(Error::NotFound);
        }
        let _node_guard = self.engine.node_locks.shared(self.node >> 3);
        Csmap::value_of(self.engine.pool.as_ref(), self.node)
    }
}
