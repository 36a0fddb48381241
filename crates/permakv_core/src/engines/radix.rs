//! Radix trie engine (`radix`).
//!
//! A byte-wise patricia trie persisted as offset-linked nodes. Each node
//! carries a compressed prefix, an optional value, and a 256-way child
//! table; the edge to a child consumes one key byte and the child's
//! prefix holds the remainder, so a stored key is the concatenation of
//! prefixes and edge bytes along its path. Iteration order is therefore
//! lexicographic over raw key bytes; the engine accepts no comparator.
//!
//! Mutations descend inside the pool transaction, which serializes
//! writers. Range scans take no tree-wide lock: a concurrent writer may
//! cause a scan to observe a mix of committed states between adjacent
//! steps, each step re-seeking from the last delivered key.
//!
//! Beyond the common vocabulary the engine offers a batched transaction
//! (staged puts and removes replayed atomically) and read/write cursors
//! with byte-range access to values, including staged `write_range`
//! edits applied atomically on commit.

use crate::comparator::Comparator;
use crate::engines::{BatchTransaction, KvCallback, KvEngine, ValueCallback};
use crate::engines::common::{bytes_len, free_bytes, read_bytes, write_bytes};
use crate::error::{Error, Result};
use crate::iterator::{ReadIterator, WriteIterator};
use permakv_pool::{Pool, PoolReader, PoolTx};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, trace};

/// Layout name stored in pools owned by this engine.
pub const LAYOUT: &str = "permakv_radix";

const FANOUT: usize = 256;

// Meta block: root node offset, entry count.
const META_SIZE: usize = 16;

// Node: prefix byte-string offset, value byte-string offset (0 when the
// node holds no value), then the child table.
const NODE_SIZE: usize = 16 + FANOUT * 8;

struct RadixNode {
    prefix_off: u64,
    value_off: u64,
    children: Vec<u64>,
}

impl RadixNode {
    fn child_count(&self) -> usize {
        self.children.iter().filter(|&&c| c != 0).count()
    }

    fn first_child(&self) -> Option<usize> {
        self.children.iter().position(|&c| c != 0)
    }

    fn last_child(&self) -> Option<usize> {
        self.children.iter().rposition(|&c| c != 0)
    }

    fn single_child(&self) -> Option<usize> {
        match self.child_count() {
            1 => self.first_child(),
            _ => None,
        }
    }
}

fn read_radix_node<R: PoolReader>(reader: &R, offset: u64) -> Result<RadixNode> {
    let buf = reader.read(offset, NODE_SIZE)?;
    let u64_at = |pos: usize| {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&buf[pos..pos + 8]);
        u64::from_le_bytes(arr)
    };
    let mut children = Vec::with_capacity(FANOUT);
    for i in 0..FANOUT {
        children.push(u64_at(16 + i * 8));
    }
    Ok(RadixNode {
        prefix_off: u64_at(0),
        value_off: u64_at(8),
        children,
    })
}

fn child_slot(node: u64, byte: u8) -> u64 {
    node + 16 + byte as u64 * 8
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// The `radix` engine.
pub struct Radix {
    pool: Arc<Pool>,
    meta: u64,
}

impl Radix {
    /// Attaches to the pool's trie, creating it on a fresh pool.
    pub(crate) fn open(
        pool: Arc<Pool>,
        configured: Option<Arc<dyn Comparator>>,
    ) -> Result<Self> {
        if configured.is_some() {
            return Err(Error::invalid_argument(
                "radix orders keys by raw bytes and accepts no comparator",
            ));
        }
        let meta = match pool.root()? {
            0 => pool.run(|tx| -> Result<u64> {
                let meta = tx.alloc(META_SIZE)?;
                tx.write_u64(meta, 0)?;
                tx.write_u64(meta + 8, 0)?;
                tx.set_root(meta)?;
                Ok(meta)
            })?,
            offset => offset,
        };
        debug!("radix engine started");
        Ok(Self { pool, meta })
    }

    fn root(&self) -> Result<u64> {
        Ok(PoolReader::read_u64(self.pool.as_ref(), self.meta)?)
    }

    fn entry_count(&self) -> Result<u64> {
        Ok(PoolReader::read_u64(self.pool.as_ref(), self.meta + 8)?)
    }

    fn bump_count(&self, tx: &mut PoolTx<'_>, delta: i64) -> Result<()> {
        let count = tx.read_u64(self.meta + 8)?;
        let next = count
            .checked_add_signed(delta)
            .ok_or_else(|| Error::unknown("entry count underflow"))?;
        tx.write_u64(self.meta + 8, next)?;
        Ok(())
    }

    /// Allocates a node holding `suffix` as its prefix and `value`.
    fn new_leaf(&self, tx: &mut PoolTx<'_>, suffix: &[u8], value: &[u8]) -> Result<u64> {
        let node = tx.alloc(NODE_SIZE)?;
        let prefix_off = write_bytes(tx, suffix)?;
        let value_off = write_bytes(tx, value)?;
        let mut buf = vec![0u8; NODE_SIZE];
        buf[0..8].copy_from_slice(&prefix_off.to_le_bytes());
        buf[8..16].copy_from_slice(&value_off.to_le_bytes());
        tx.write(node, &buf)?;
        Ok(node)
    }

    /// Inserts or replaces `key` inside the transaction. Returns `true`
    /// when a new entry was created.
    fn insert(&self, tx: &mut PoolTx<'_>, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut slot = self.meta;
        let mut node_off = tx.read_u64(slot)?;
        let mut pos = 0usize;

        if node_off == 0 {
            let leaf = self.new_leaf(tx, key, value)?;
            tx.write_u64(slot, leaf)?;
            self.bump_count(tx, 1)?;
            return Ok(true);
        }

        loop {
            let node = read_radix_node(tx, node_off)?;
            let prefix = read_bytes(tx, node.prefix_off)?;
            let rest = &key[pos..];
            let common = common_prefix_len(rest, &prefix);

            if common < prefix.len() {
                // The paths diverge inside this node's prefix: interpose
                // a branch holding the shared part.
                let branch = tx.alloc(NODE_SIZE)?;
                let branch_prefix = write_bytes(tx, &prefix[..common])?;

                // The existing node keeps the remainder past the edge byte.
                let node_prefix = write_bytes(tx, &prefix[common + 1..])?;
                free_bytes(tx, node.prefix_off)?;
                tx.write_u64(node_off, node_prefix)?;

                let mut buf = vec![0u8; NODE_SIZE];
                buf[0..8].copy_from_slice(&branch_prefix.to_le_bytes());
                let old_edge = prefix[common] as usize;
                buf[16 + old_edge * 8..16 + old_edge * 8 + 8]
                    .copy_from_slice(&node_off.to_le_bytes());

                if rest.len() == common {
                    let value_off = write_bytes(tx, value)?;
                    buf[8..16].copy_from_slice(&value_off.to_le_bytes());
                } else {
                    let new_edge = rest[common] as usize;
                    let leaf = self.new_leaf(tx, &rest[common + 1..], value)?;
                    buf[16 + new_edge * 8..16 + new_edge * 8 + 8]
                        .copy_from_slice(&leaf.to_le_bytes());
                }
                tx.write(branch, &buf)?;
                tx.write_u64(slot, branch)?;
                self.bump_count(tx, 1)?;
                return Ok(true);
            }

            pos += common;
            if pos == key.len() {
                let value_off = write_bytes(tx, value)?;
                let created = node.value_off == 0;
                if !created {
                    free_bytes(tx, node.value_off)?;
                }
                tx.write_u64(node_off + 8, value_off)?;
                if created {
                    self.bump_count(tx, 1)?;
                }
                return Ok(created);
            }

            let edge = key[pos];
            let next_slot = child_slot(node_off, edge);
            let child = tx.read_u64(next_slot)?;
            if child == 0 {
                let leaf = self.new_leaf(tx, &key[pos + 1..], value)?;
                tx.write_u64(next_slot, leaf)?;
                self.bump_count(tx, 1)?;
                return Ok(true);
            }
            slot = next_slot;
            node_off = child;
            pos += 1;
        }
    }

    /// Removes `key` inside the transaction. Returns `true` when an
    /// entry existed.
    fn erase(&self, tx: &mut PoolTx<'_>, key: &[u8]) -> Result<bool> {
        // Path of (pointer cell, node) pairs from the root down.
        let mut path: Vec<(u64, u64)> = Vec::new();
        let mut slot = self.meta;
        let mut node_off = tx.read_u64(slot)?;
        let mut pos = 0usize;

        while node_off != 0 {
            let node = read_radix_node(tx, node_off)?;
            let prefix = read_bytes(tx, node.prefix_off)?;
            let rest = &key[pos..];
            if rest.len() < prefix.len() || rest[..prefix.len()] != prefix[..] {
                return Ok(false);
            }
            pos += prefix.len();
            if pos == key.len() {
                if node.value_off == 0 {
                    return Ok(false);
                }
                free_bytes(tx, node.value_off)?;
                tx.write_u64(node_off + 8, 0)?;
                self.bump_count(tx, -1)?;
                self.cleanup(tx, &path, slot, node_off)?;
                return Ok(true);
            }
            let edge = rest[prefix.len()];
            path.push((slot, node_off));
            slot = child_slot(node_off, edge);
            node_off = tx.read_u64(slot)?;
            pos += 1;
        }
        Ok(false)
    }

    /// Restores the patricia invariant after a value removal: a node
    /// without a value must keep at least two children, so empty nodes
    /// disappear and single-child nodes merge with that child.
    fn cleanup(
        &self,
        tx: &mut PoolTx<'_>,
        path: &[(u64, u64)],
        slot: u64,
        node_off: u64,
    ) -> Result<()> {
        let node = read_radix_node(tx, node_off)?;
        match node.child_count() {
            0 => {
                free_bytes(tx, node.prefix_off)?;
                tx.free(node_off)?;
                tx.write_u64(slot, 0)?;
                // The parent just lost a child and may itself have
                // become a pass-through.
                if let Some(&(parent_slot, parent_off)) = path.last() {
                    let parent = read_radix_node(tx, parent_off)?;
                    if parent.value_off == 0 {
                        if let Some(edge) = parent.single_child() {
                            self.merge_with_child(tx, parent_slot, parent_off, &parent, edge)?;
                        }
                    }
                }
                Ok(())
            }
            1 => {
                let edge = node
                    .first_child()
                    .ok_or_else(|| Error::unknown("child table out of sync"))?;
                self.merge_with_child(tx, slot, node_off, &node, edge)
            }
            _ => Ok(()),
        }
    }

    /// Splices `node` out by folding its prefix and edge byte into its
    /// only child.
    fn merge_with_child(
        &self,
        tx: &mut PoolTx<'_>,
        slot: u64,
        node_off: u64,
        node: &RadixNode,
        edge: usize,
    ) -> Result<()> {
        let child_off = node.children[edge];
        let child = read_radix_node(tx, child_off)?;
        let node_prefix = read_bytes(tx, node.prefix_off)?;
        let child_prefix = read_bytes(tx, child.prefix_off)?;

        let mut merged = Vec::with_capacity(node_prefix.len() + 1 + child_prefix.len());
        merged.extend_from_slice(&node_prefix);
        merged.push(edge as u8);
        merged.extend_from_slice(&child_prefix);

        let merged_off = write_bytes(tx, &merged)?;
        free_bytes(tx, child.prefix_off)?;
        tx.write_u64(child_off, merged_off)?;
        tx.write_u64(slot, child_off)?;
        free_bytes(tx, node.prefix_off)?;
        tx.free(node_off)?;
        Ok(())
    }

    /// Finds the node holding `key`, if any.
    fn find(&self, key: &[u8]) -> Result<Option<u64>> {
        let pool = self.pool.as_ref();
        let mut node_off = self.root()?;
        let mut pos = 0usize;
        while node_off != 0 {
            let node = read_radix_node(pool, node_off)?;
            let prefix = read_bytes(pool, node.prefix_off)?;
            let rest = &key[pos..];
            if rest.len() < prefix.len() || rest[..prefix.len()] != prefix[..] {
                return Ok(None);
            }
            pos += prefix.len();
            if pos == key.len() {
                return Ok((node.value_off != 0).then_some(node_off));
            }
            node_off = node.children[key[pos] as usize];
            pos += 1;
        }
        Ok(None)
    }

    fn value_of_node(&self, node_off: u64) -> Result<Vec<u8>> {
        let pool = self.pool.as_ref();
        let node = read_radix_node(pool, node_off)?;
        read_bytes(pool, node.value_off)
    }

    /// Smallest key in the subtree at `node_off`.
    fn min_key_from(&self, mut node_off: u64, mut acc: Vec<u8>) -> Result<Vec<u8>> {
        let pool = self.pool.as_ref();
        loop {
            let node = read_radix_node(pool, node_off)?;
            acc.extend_from_slice(&read_bytes(pool, node.prefix_off)?);
            if node.value_off != 0 {
                return Ok(acc);
            }
            let edge = node
                .first_child()
                .ok_or_else(|| Error::unknown("valueless leaf in trie"))?;
            acc.push(edge as u8);
            node_off = node.children[edge];
        }
    }

    /// Greatest key in the subtree at `node_off`.
    fn max_key_from(&self, mut node_off: u64, mut acc: Vec<u8>) -> Result<Vec<u8>> {
        let pool = self.pool.as_ref();
        loop {
            let node = read_radix_node(pool, node_off)?;
            acc.extend_from_slice(&read_bytes(pool, node.prefix_off)?);
            match node.last_child() {
                None => return Ok(acc),
                Some(edge) => {
                    acc.push(edge as u8);
                    node_off = node.children[edge];
                }
            }
        }
    }

    /// Smallest stored key `>= target` (`> target` when `strict`).
    ///
    /// `acc` holds the bytes consumed above this node, excluding its own
    /// prefix.
    fn seek_above(
        &self,
        node_off: u64,
        acc: &[u8],
        target: &[u8],
        strict: bool,
    ) -> Result<Option<Vec<u8>>> {
        if node_off == 0 {
            return Ok(None);
        }
        let pool = self.pool.as_ref();
        let node = read_radix_node(pool, node_off)?;
        let mut full = acc.to_vec();
        full.extend_from_slice(&read_bytes(pool, node.prefix_off)?);

        let overlap = full.len().min(target.len());
        match full[..overlap].cmp(&target[..overlap]) {
            // Every key in this subtree starts with `full`; the shared
            // span already decides the comparison.
            std::cmp::Ordering::Less => Ok(None),
            std::cmp::Ordering::Greater => {
                Ok(Some(self.min_key_from(node_off, acc.to_vec())?))
            }
            std::cmp::Ordering::Equal if target.len() < full.len() => {
                // Every key here extends `full`, which already exceeds
                // the target.
                Ok(Some(self.min_key_from(node_off, acc.to_vec())?))
            }
            std::cmp::Ordering::Equal if target.len() == full.len() => {
                if !strict && node.value_off != 0 {
                    return Ok(Some(full));
                }
                match node.first_child() {
                    None => Ok(None),
                    Some(edge) => {
                        let mut below = full;
                        below.push(edge as u8);
                        Ok(Some(self.min_key_from(node.children[edge], below)?))
                    }
                }
            }
            std::cmp::Ordering::Equal => {
                // The target continues past this node's key.
                let edge = target[full.len()] as usize;
                let child = node.children[edge];
                if child != 0 {
                    let mut below = full.clone();
                    below.push(edge as u8);
                    if let Some(key) = self.seek_above(child, &below, target, strict)? {
                        return Ok(Some(key));
                    }
                }
                for later in edge + 1..FANOUT {
                    if node.children[later] != 0 {
                        let mut below = full.clone();
                        below.push(later as u8);
                        return Ok(Some(self.min_key_from(node.children[later], below)?));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Greatest stored key `<= target` (`< target` when `strict`).
    fn seek_below(
        &self,
        node_off: u64,
        acc: &[u8],
        target: &[u8],
        strict: bool,
    ) -> Result<Option<Vec<u8>>> {
        if node_off == 0 {
            return Ok(None);
        }
        let pool = self.pool.as_ref();
        let node = read_radix_node(pool, node_off)?;
        let mut full = acc.to_vec();
        full.extend_from_slice(&read_bytes(pool, node.prefix_off)?);

        let overlap = full.len().min(target.len());
        match full[..overlap].cmp(&target[..overlap]) {
            std::cmp::Ordering::Greater => Ok(None),
            std::cmp::Ordering::Less => {
                Ok(Some(self.max_key_from(node_off, acc.to_vec())?))
            }
            std::cmp::Ordering::Equal if target.len() < full.len() => Ok(None),
            std::cmp::Ordering::Equal if target.len() == full.len() => {
                if !strict && node.value_off != 0 {
                    Ok(Some(full))
                } else {
                    Ok(None)
                }
            }
            std::cmp::Ordering::Equal => {
                let edge = target[full.len()] as usize;
                let child = node.children[edge];
                if child != 0 {
                    let mut below = full.clone();
                    below.push(edge as u8);
                    if let Some(key) = self.seek_below(child, &below, target, strict)? {
                        return Ok(Some(key));
                    }
                }
                for earlier in (0..edge).rev() {
                    if node.children[earlier] != 0 {
                        let mut below = full.clone();
                        below.push(earlier as u8);
                        return Ok(Some(self.max_key_from(node.children[earlier], below)?));
                    }
                }
                // This node's own key is a proper prefix of the target,
                // so it sorts below it regardless of strictness.
                if node.value_off != 0 {
                    Ok(Some(full))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn first_key(&self) -> Result<Option<Vec<u8>>> {
        match self.root()? {
            0 => Ok(None),
            root => Ok(Some(self.min_key_from(root, Vec::new())?)),
        }
    }

    fn last_key(&self) -> Result<Option<Vec<u8>>> {
        match self.root()? {
            0 => Ok(None),
            root => Ok(Some(self.max_key_from(root, Vec::new())?)),
        }
    }

    fn succ(&self, key: &[u8], strict: bool) -> Result<Option<Vec<u8>>> {
        self.seek_above(self.root()?, &[], key, strict)
    }

    fn pred(&self, key: &[u8], strict: bool) -> Result<Option<Vec<u8>>> {
        self.seek_below(self.root()?, &[], key, strict)
    }

    /// Walks keys from `start` (inclusive) up to the exclusive `bound`,
    /// re-seeking between steps so each step observes the then-current
    /// committed state.
    fn scan(
        &self,
        start: Option<Vec<u8>>,
        bound: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        let mut cursor = start;
        while let Some(key) = cursor {
            if let Some(bound) = bound {
                if key.as_slice() >= bound {
                    return Ok(());
                }
            }
            if let Some(node) = self.find(&key)? {
                let value = self.value_of_node(node)?;
                if visit(&key, &value).is_break() {
                    return Err(Error::StoppedByCallback);
                }
            }
            cursor = self.succ(&key, true)?;
        }
        Ok(())
    }

    fn count_scanned(&self, start: Option<Vec<u8>>, bound: Option<&[u8]>) -> Result<usize> {
        let mut count = 0;
        self.scan(start, bound, &mut |_, _| {
            count += 1;
            ControlFlow::Continue(())
        })?;
        Ok(count)
    }
}

impl KvEngine for Radix {
    fn name(&self) -> &'static str {
        "radix"
    }

    fn count_all(&self) -> Result<usize> {
        trace!("count_all");
        Ok(self.entry_count()? as usize)
    }

    fn count_above(&self, key: &[u8]) -> Result<usize> {
        trace!(key_len = key.len(), "count_above");
        self.count_scanned(self.succ(key, true)?, None)
    }

    fn count_equal_above(&self, key: &[u8]) -> Result<usize> {
        trace!(key_len = key.len(), "count_equal_above");
        self.count_scanned(self.succ(key, false)?, None)
    }

    fn count_equal_below(&self, key: &[u8]) -> Result<usize> {
        trace!(key_len = key.len(), "count_equal_below");
        let above = self.count_scanned(self.succ(key, true)?, None)?;
        Ok((self.entry_count()? as usize).saturating_sub(above))
    }

    fn count_below(&self, key: &[u8]) -> Result<usize> {
        trace!(key_len = key.len(), "count_below");
        self.count_scanned(self.first_key()?, Some(key))
    }

    fn count_between(&self, key1: &[u8], key2: &[u8]) -> Result<usize> {
        trace!(key1_len = key1.len(), key2_len = key2.len(), "count_between");
        if key1 >= key2 {
            return Ok(0);
        }
        self.count_scanned(self.succ(key1, false)?, Some(key2))
    }

    fn get_all(&self, callback: KvCallback<'_>) -> Result<()> {
        trace!("get_all");
        self.scan(self.first_key()?, None, callback)
    }

    fn get_above(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_above");
        self.scan(self.succ(key, true)?, None, callback)
    }

    fn get_equal_above(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_equal_above");
        self.scan(self.succ(key, false)?, None, callback)
    }

    fn get_equal_below(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_equal_below");
        let mut bounded = false;
        let result = self.scan(self.first_key()?, None, &mut |k, v| {
            if k > key {
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
        self.scan(self.first_key()?, Some(key), callback)
    }

    fn get_between(&self, key1: &[u8], key2: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key1_len = key1.len(), key2_len = key2.len(), "get_between");
        if key1 >= key2 {
            return Ok(());
        }
        self.scan(self.succ(key1, false)?, Some(key2), callback)
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        trace!(key_len = key.len(), "exists");
        Ok(self.find(key)?.is_some())
    }

    fn get(&self, key: &[u8], callback: ValueCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get");
        match self.find(key)? {
            None => Err(Error::NotFound),
            Some(node) => {
                let value = self.value_of_node(node)?;
                callback(&value);
                Ok(())
            }
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        trace!(key_len = key.len(), value_len = value.len(), "put");
        self.pool.run(|tx| -> Result<()> {
            self.insert(tx, key, value)?;
            Ok(())
        })
    }

    fn remove(&self, key: &[u8]) -> Result<bool> {
        trace!(key_len = key.len(), "remove");
        self.pool.run(|tx| self.erase(tx, key))
    }

    fn read_iter(&self) -> Result<Box<dyn ReadIterator + '_>> {
        trace!("read_iter");
        Ok(Box::new(RadixIter {
            engine: self,
            key: None,
            staged: Vec::new(),
        }))
    }

    fn write_iter(&self) -> Result<Box<dyn WriteIterator + '_>> {
        trace!("write_iter");
        Ok(Box::new(RadixIter {
            engine: self,
            key: None,
            staged: Vec::new(),
        }))
    }

    fn begin_tx(&self) -> Result<Box<dyn BatchTransaction + '_>> {
        trace!("begin_tx");
        Ok(Box::new(RadixTx {
            engine: self,
            log: BTreeMap::new(),
        }))
    }
}

/// A batched transaction: staged operations live in volatile memory
/// until commit replays them inside one pool transaction.
///
/// The log coalesces by key, so repeated writes keep only the last one
/// and a put followed by a remove of the same key commits to absence.
struct RadixTx<'a> {
    engine: &'a Radix,
    log: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl BatchTransaction for RadixTx<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.log.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.log.insert(key.to_vec(), None);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        trace!(staged = self.log.len(), "batch commit");
        let engine = self.engine;
        let log = std::mem::take(&mut self.log);
        engine.pool.run(|tx| -> Result<()> {
            for (key, op) in &log {
                match op {
                    Some(value) => {
                        engine.insert(tx, key, value)?;
                    }
                    None => {
                        engine.erase(tx, key)?;
                    }
                }
            }
            Ok(())
        })
    }

    fn abort(&mut self) {
        trace!(staged = self.log.len(), "batch abort");
        self.log.clear();
    }
}

/// Seek-capable cursor; doubles as the write cursor with staged ranges.
///
/// The cursor holds the current key and re-resolves it against the live
/// trie on every step, so a positioning call after a failed one leaves
/// the previous position untouched, matching the seek contract.
struct RadixIter<'a> {
    engine: &'a Radix,
    key: Option<Vec<u8>>,
    staged: Vec<(usize, Vec<u8>)>,
}

impl RadixIter<'_> {
    fn settle(&mut self, key: Option<Vec<u8>>) -> Result<()> {
        self.staged.clear();
        match key {
            Some(key) => {
                self.key = Some(key);
                Ok(())
            }
            None => {
                self.key = None;
                Err(Error::NotFound)
            }
        }
    }

    fn current_value_len(&self) -> Result<usize> {
        let key = self.key.as_ref().ok_or(Error::NotFound)?;
        let node = self.engine.find(key)?.ok_or(Error::NotFound)?;
        let pool = self.engine.pool.as_ref();
        let node = read_radix_node(pool, node)?;
        bytes_len(pool, node.value_off)
    }
}

impl ReadIterator for RadixIter<'_> {
    fn seek(&mut self, key: &[u8]) -> Result<()> {
        let found = self.engine.find(key)?.map(|_| key.to_vec());
        self.settle(found)
    }

    fn seek_lower(&mut self, key: &[u8]) -> Result<()> {
        let found = self.engine.pred(key, true)?;
        self.settle(found)
    }

    fn seek_lower_eq(&mut self, key: &[u8]) -> Result<()> {
        let found = self.engine.pred(key, false)?;
        self.settle(found)
    }

    fn seek_higher(&mut self, key: &[u8]) -> Result<()> {
        let found = self.engine.succ(key, true)?;
        self.settle(found)
    }

    fn seek_higher_eq(&mut self, key: &[u8]) -> Result<()> {
        let found = self.engine.succ(key, false)?;
        self.settle(found)
    }

    fn seek_to_first(&mut self) -> Result<()> {
        let found = self.engine.first_key()?;
        self.settle(found)
    }

    fn seek_to_last(&mut self) -> Result<()> {
        let found = self.engine.last_key()?;
        self.settle(found)
    }

    fn is_next(&mut self) -> Result<()> {
        match &self.key {
            None => Err(Error::NotFound),
            Some(key) => match self.engine.succ(key, true)? {
                Some(_) => Ok(()),
                None => Err(Error::NotFound),
            },
        }
    }

    fn next(&mut self) -> Result<()> {
        match self.key.take() {
            None => Err(Error::NotFound),
            Some(key) => {
                let found = self.engine.succ(&key, true)?;
                self.settle(found)
            }
        }
    }

    fn prev(&mut self) -> Result<()> {
        match &self.key {
            // Stepping back from the end sentinel lands on the last entry.
            None => self.seek_to_last(),
            Some(key) => {
                let found = self.engine.pred(key, true)?;
                match found {
                    Some(found) => self.settle(Some(found)),
                    // At the first entry; stay put.
                    None => Err(Error::NotFound),
                }
            }
        }
    }

    fn key(&self) -> Result<Vec<u8>> {
        self.key.clone().ok_or(Error::NotFound)
    }

    fn read_range(&self, pos: usize, n: usize) -> Result<Vec<u8>> {
        let key = self.key.as_ref().ok_or(Error::NotFound)?;
        let node = self.engine.find(key)?.ok_or(Error::NotFound)?;
        let value = self.engine.value_of_node(node)?;
        let pos = pos.min(value.len());
        let n = n.min(value.len() - pos);
        Ok(value[pos..pos + n].to_vec())
    }
}

impl WriteIterator for RadixIter<'_> {
    fn write_range(&mut self, pos: usize, n: usize) -> Result<&mut [u8]> {
        let len = self.current_value_len()?;
        let pos = pos.min(len);
        let n = n.min(len - pos);

        let current = self.read_range(pos, n)?;
        self.staged.push((pos, current));
        let (_, buf) = self
            .staged
            .last_mut()
            .ok_or_else(|| Error::unknown("staging log empty after push"))?;
        Ok(buf.as_mut_slice())
    }

    fn commit(&mut self) -> Result<()> {
        trace!(ranges = self.staged.len(), "write iterator commit");
        if self.staged.is_empty() {
            return Ok(());
        }
        let key = self.key.clone().ok_or(Error::NotFound)?;
        let staged = std::mem::take(&mut self.staged);
        let engine = self.engine;
        engine.pool.run(|tx| -> Result<()> {
            let mut node_off = tx.read_u64(engine.meta)?;
            let mut pos = 0usize;
            let val_off = loop {
                if node_off == 0 {
                    return Err(Error::NotFound);
                }
                let node = read_radix_node(tx, node_off)?;
                let prefix = read_bytes(tx, node.prefix_off)?;
                let rest = &key[pos..];
                if rest.len() < prefix.len() || rest[..prefix.len()] != prefix[..] {
                    return Err(Error::NotFound);
                }
                pos += prefix.len();
                if pos == key.len() {
                    if node.value_off == 0 {
                        return Err(Error::NotFound);
                    }
                    break node.value_off;
                }
                node_off = node.children[key[pos] as usize];
                pos += 1;
            };

            let len = tx.read_u64(val_off)? as usize;
            for (start, bytes) in &staged {
                if *start >= len {
                    continue;
                }
                let n = bytes.len().min(len - start);
                tx.write(val_off + 8 + *start as u64, &bytes[..n])?;
            }
            Ok(())
        })
    }

    fn abort(&mut self) {
        trace!(ranges = self.staged.len(), "write iterator abort");
        self.staged.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permakv_pool::MIN_POOL;
    use tempfile::tempdir;

    fn open_trie(dir: &std::path::Path) -> Radix {
        let path = dir.join("radix.pool");
        let pool = if path.exists() {
            Pool::open(&path, LAYOUT).unwrap()
        } else {
            Pool::create(&path, LAYOUT, MIN_POOL).unwrap()
        };
        Radix::open(Arc::new(pool), None).unwrap()
    }

    fn keys_of(trie: &Radix) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        trie.get_all(&mut |k, _| {
            keys.push(k.to_vec());
            ControlFlow::Continue(())
        })
        .unwrap();
        keys
    }

    #[test]
    fn put_get_remove_round_trip() {
        let dir = tempdir().unwrap();
        let trie = open_trie(dir.path());

        trie.put(b"key1", b"value1").unwrap();
        assert_eq!(trie.count_all().unwrap(), 1);

        let mut got = Vec::new();
        trie.get(b"key1", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"value1");

        trie.put(b"key1", b"value2").unwrap();
        assert_eq!(trie.count_all().unwrap(), 1);
        trie.get(b"key1", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"value2");

        assert!(trie.remove(b"key1").unwrap());
        assert!(!trie.remove(b"key1").unwrap());
        assert_eq!(trie.count_all().unwrap(), 0);
    }

    #[test]
    fn prefix_splits_and_merges() {
        let dir = tempdir().unwrap();
        let trie = open_trie(dir.path());

        // Keys that share prefixes of different lengths force splits.
        for key in [
            b"123456789ABCDE" as &[u8],
            b"123456789ABCDEF",
            b"12345678ABCDEFG",
            b"123456789",
            b"123456789ABCDEFGHI",
        ] {
            trie.put(key, b"v").unwrap();
        }
        assert_eq!(trie.count_all().unwrap(), 5);
        for key in [
            b"123456789ABCDE" as &[u8],
            b"123456789ABCDEF",
            b"12345678ABCDEFG",
            b"123456789",
            b"123456789ABCDEFGHI",
        ] {
            assert!(trie.exists(key).unwrap());
        }

        // Removing interior keys exercises merge-with-child.
        assert!(trie.remove(b"123456789ABCDE").unwrap());
        assert!(trie.remove(b"123456789").unwrap());
        assert_eq!(trie.count_all().unwrap(), 3);
        assert!(trie.exists(b"123456789ABCDEF").unwrap());
        assert!(trie.exists(b"12345678ABCDEFG").unwrap());
        assert!(trie.exists(b"123456789ABCDEFGHI").unwrap());
    }

    #[test]
    fn iteration_is_lexicographic() {
        let dir = tempdir().unwrap();
        let trie = open_trie(dir.path());

        for key in [b"b" as &[u8], b"aa", b"a", b"ab", b"ba", b"" as &[u8], b"z"] {
            trie.put(key, b"v").unwrap();
        }
        let keys = keys_of(&trie);
        let mut expected: Vec<Vec<u8>> = [b"b" as &[u8], b"aa", b"a", b"ab", b"ba", b"", b"z"]
            .iter()
            .map(|k| k.to_vec())
            .collect();
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn range_counts_partition_the_key_space() {
        let dir = tempdir().unwrap();
        let trie = open_trie(dir.path());

        for i in 0..60 {
            trie.put(format!("{i:02}").as_bytes(), b"v").unwrap();
        }
        for probe in ["00", "31", "59", "60", "zz"] {
            let below = trie.count_below(probe.as_bytes()).unwrap();
            let above = trie.count_above(probe.as_bytes()).unwrap();
            let present = usize::from(trie.exists(probe.as_bytes()).unwrap());
            assert_eq!(below + present + above, 60, "probe {probe}");
        }
        assert_eq!(trie.count_between(b"10", b"20").unwrap(), 10);
        assert_eq!(trie.count_between(b"20", b"10").unwrap(), 0);
    }

    #[test]
    fn reopen_recovers_entries() {
        let dir = tempdir().unwrap();
        {
            let trie = open_trie(dir.path());
            for i in 0..100 {
                trie.put(format!("key{i:03}").as_bytes(), format!("v{i}").as_bytes())
                    .unwrap();
            }
        }
        let trie = open_trie(dir.path());
        assert_eq!(trie.count_all().unwrap(), 100);
        let mut got = Vec::new();
        trie.get(b"key042", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"v42");
    }

    #[test]
    fn batched_tx_commit_and_abort() {
        let dir = tempdir().unwrap();
        let trie = open_trie(dir.path());

        let mut tx = trie.begin_tx().unwrap();
        tx.put(b"a", b"1").unwrap();
        tx.put(b"b", b"2").unwrap();
        tx.remove(b"a").unwrap();
        tx.commit().unwrap();

        assert!(!trie.exists(b"a").unwrap());
        let mut got = Vec::new();
        trie.get(b"b", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"2");

        let mut tx = trie.begin_tx().unwrap();
        tx.put(b"c", b"3").unwrap();
        tx.remove(b"b").unwrap();
        tx.abort();
        tx.commit().unwrap();

        assert!(!trie.exists(b"c").unwrap());
        assert!(trie.exists(b"b").unwrap());
    }

    #[test]
    fn batched_tx_last_write_wins() {
        let dir = tempdir().unwrap();
        let trie = open_trie(dir.path());

        let mut tx = trie.begin_tx().unwrap();
        tx.put(b"k", b"first").unwrap();
        tx.put(b"k", b"second").unwrap();
        tx.commit().unwrap();

        let mut got = Vec::new();
        trie.get(b"k", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"second");
    }

    #[test]
    fn read_iterator_seeks() {
        let dir = tempdir().unwrap();
        let trie = open_trie(dir.path());
        for key in [b"b" as &[u8], b"d", b"f"] {
            trie.put(key, key).unwrap();
        }

        let mut it = trie.read_iter().unwrap();
        it.seek(b"d").unwrap();
        assert_eq!(it.key().unwrap(), b"d");
        assert!(it.seek(b"c").unwrap_err().is_not_found());

        it.seek_higher_eq(b"c").unwrap();
        assert_eq!(it.key().unwrap(), b"d");
        it.seek_higher(b"d").unwrap();
        assert_eq!(it.key().unwrap(), b"f");
        it.seek_lower(b"d").unwrap();
        assert_eq!(it.key().unwrap(), b"b");
        it.seek_lower_eq(b"d").unwrap();
        assert_eq!(it.key().unwrap(), b"d");
        assert!(it.seek_lower(b"b").unwrap_err().is_not_found());

        it.seek_to_first().unwrap();
        assert_eq!(it.key().unwrap(), b"b");
        it.is_next().unwrap();
        it.next().unwrap();
        assert_eq!(it.key().unwrap(), b"d");
        it.next().unwrap();
        assert_eq!(it.key().unwrap(), b"f");
        assert!(it.is_next().unwrap_err().is_not_found());
        assert!(it.next().unwrap_err().is_not_found());

        it.seek_to_last().unwrap();
        assert_eq!(it.key().unwrap(), b"f");
        it.prev().unwrap();
        assert_eq!(it.key().unwrap(), b"d");
        it.prev().unwrap();
        it.prev().unwrap_err();
        assert_eq!(it.key().unwrap(), b"b");

        assert_eq!(it.read_range(0, 100).unwrap(), b"b");
    }

    #[test]
    fn write_iterator_stages_and_commits() {
        let dir = tempdir().unwrap();
        let trie = open_trie(dir.path());
        trie.put(b"k", b"hello world").unwrap();

        let mut it = trie.write_iter().unwrap();
        it.seek(b"k").unwrap();

        let range = it.write_range(0, 5).unwrap();
        range.copy_from_slice(b"HELLO");
        let range = it.write_range(6, 5).unwrap();
        range.copy_from_slice(b"WORLD");
        it.commit().unwrap();

        let mut got = Vec::new();
        trie.get(b"k", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"HELLO WORLD");
    }

    #[test]
    fn write_iterator_abort_discards_staging() {
        let dir = tempdir().unwrap();
        let trie = open_trie(dir.path());
        trie.put(b"k", b"hello").unwrap();

        let mut it = trie.write_iter().unwrap();
        it.seek(b"k").unwrap();
        let range = it.write_range(0, 5).unwrap();
        range.copy_from_slice(b"XXXXX");
        it.abort();
        it.commit().unwrap();

        let mut got = Vec::new();
        trie.get(b"k", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn write_range_clamps_to_value_length() {
        let dir = tempdir().unwrap();
        let trie = open_trie(dir.path());
        trie.put(b"k", b"abc").unwrap();

        let mut it = trie.write_iter().unwrap();
        it.seek(b"k").unwrap();
        let range = it.write_range(1, 100).unwrap();
        assert_eq!(range.len(), 2);
        range.copy_from_slice(b"BC");
        it.commit().unwrap();

        let mut got = Vec::new();
        trie.get(b"k", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"aBC");
    }
}
