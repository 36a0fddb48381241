//! Persistent B-tree engine (`stree`).
//!
//! A leaf-linked B-tree with fixed fanout, allocated entirely inside the
//! pool. Nodes are fixed-size blocks addressed by offset; children and
//! entry key/value byte strings are offsets too, so the structure has no
//! volatile pointers to rebuild at recovery. Entries live in the leaves;
//! inner nodes carry copies of separator keys.
//!
//! Every structural change (insert with splits, erase with borrow/merge
//! rebalancing) runs inside a single pool transaction, so the tree is
//! crash-atomic. Replacing the value of an existing key runs in its own
//! transaction.
//!
//! A container-wide reader-writer lock serializes mutations against
//! reads; range scans hold the shared lock for their entire duration.

use crate::comparator::{bind_comparator, Comparator};
use crate::engines::common::{free_bytes, read_bytes, write_bytes};
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
pub const LAYOUT: &str = "permakv_stree";

/// Node fanout.
pub const DEGREE: usize = 32;

/// Longest accepted key.
pub const MAX_KEY_SIZE: usize = 256;

const MAX_LEAF_ENTRIES: usize = DEGREE;
const MIN_LEAF_ENTRIES: usize = DEGREE / 2;
const MAX_INNER_KEYS: usize = DEGREE - 1;
const MIN_INNER_KEYS: usize = DEGREE / 2 - 1;

// Meta block: root node offset, entry count.
const META_SIZE: usize = 16;

// Node block: tag byte, u16 count, then per-kind payload. Sized for the
// larger (leaf) kind so both allocate uniformly.
const NODE_SIZE: usize = 16 + MAX_LEAF_ENTRIES * 16;

const TAG_LEAF: u8 = 0;
const TAG_INNER: u8 = 1;

#[derive(Debug, Clone)]
struct LeafNode {
    next: u64,
    entries: Vec<(u64, u64)>,
}

#[derive(Debug, Clone)]
struct InnerNode {
    keys: Vec<u64>,
    children: Vec<u64>,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf(LeafNode),
    Inner(InnerNode),
}

fn decode_node(buf: &[u8]) -> Result<Node> {
    let count = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    let u64_at = |pos: usize| {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&buf[pos..pos + 8]);
        u64::from_le_bytes(arr)
    };
    match buf[0] {
        TAG_LEAF => {
            let next = u64_at(8);
            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                let base = 16 + i * 16;
                entries.push((u64_at(base), u64_at(base + 8)));
            }
            Ok(Node::Leaf(LeafNode { next, entries }))
        }
        TAG_INNER => {
            let mut keys = Vec::with_capacity(count);
            let mut children = Vec::with_capacity(count + 1);
            for i in 0..count {
                keys.push(u64_at(8 + i * 8));
            }
            let children_base = 8 + MAX_INNER_KEYS * 8;
            for i in 0..=count {
                children.push(u64_at(children_base + i * 8));
            }
            Ok(Node::Inner(InnerNode { keys, children }))
        }
        tag => Err(Error::unknown(format!("corrupt tree node tag {tag}"))),
    }
}

fn encode_node(node: &Node) -> Vec<u8> {
    let mut buf = vec![0u8; NODE_SIZE];
    let mut put_u64 = |buf: &mut [u8], pos: usize, value: u64| {
        buf[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
    };
    match node {
        Node::Leaf(leaf) => {
            buf[0] = TAG_LEAF;
            buf[2..4].copy_from_slice(&(leaf.entries.len() as u16).to_le_bytes());
            put_u64(&mut buf, 8, leaf.next);
            for (i, (key_off, val_off)) in leaf.entries.iter().enumerate() {
                put_u64(&mut buf, 16 + i * 16, *key_off);
                put_u64(&mut buf, 16 + i * 16 + 8, *val_off);
            }
        }
        Node::Inner(inner) => {
            buf[0] = TAG_INNER;
            buf[2..4].copy_from_slice(&(inner.keys.len() as u16).to_le_bytes());
            for (i, key_off) in inner.keys.iter().enumerate() {
                put_u64(&mut buf, 8 + i * 8, *key_off);
            }
            let children_base = 8 + MAX_INNER_KEYS * 8;
            for (i, child) in inner.children.iter().enumerate() {
                put_u64(&mut buf, children_base + i * 8, *child);
            }
        }
    }
    buf
}

fn read_node<R: PoolReader>(reader: &R, offset: u64) -> Result<Node> {
    decode_node(&reader.read(offset, NODE_SIZE)?)
}

fn write_node(tx: &mut PoolTx<'_>, offset: u64, node: &Node) -> Result<()> {
    tx.write(offset, &encode_node(node))?;
    Ok(())
}

/// A valid cursor position: a leaf offset and an entry index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pos {
    leaf: u64,
    idx: usize,
}

/// The `stree` engine.
pub struct Stree {
    pool: Arc<Pool>,
    cmp: Arc<dyn Comparator>,
    meta: u64,
    lock: RwLock<()>,
}

impl Stree {
    /// Attaches to the pool's tree, creating it on a fresh pool.
    pub(crate) fn open(
        pool: Arc<Pool>,
        configured: Option<Arc<dyn Comparator>>,
    ) -> Result<Self> {
        let cmp = bind_comparator(&pool, configured)?;
        let meta = match pool.root()? {
            0 => pool.run(|tx| -> Result<u64> {
                let meta = tx.alloc(META_SIZE)?;
                let root = tx.alloc(NODE_SIZE)?;
                write_node(
                    tx,
                    root,
                    &Node::Leaf(LeafNode {
                        next: 0,
                        entries: Vec::new(),
                    }),
                )?;
                tx.write_u64(meta, root)?;
                tx.write_u64(meta + 8, 0)?;
                tx.set_comparator_name(cmp.name())?;
                tx.set_root(meta)?;
                Ok(meta)
            })?,
            offset => offset,
        };
        debug!(comparator = cmp.name(), "stree engine started");
        Ok(Self {
            pool,
            cmp,
            meta,
            lock: RwLock::new(()),
        })
    }

    fn root_node(&self) -> Result<u64> {
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

    /// Child index to descend into for `key`: the number of separators
    /// that are less than or equal to it.
    fn descend_index<R: PoolReader>(
        &self,
        reader: &R,
        inner: &InnerNode,
        key: &[u8],
    ) -> Result<usize> {
        let mut idx = 0;
        for key_off in &inner.keys {
            let separator = read_bytes(reader, *key_off)?;
            if self.cmp.compare(&separator, key) == Ordering::Greater {
                break;
            }
            idx += 1;
        }
        Ok(idx)
    }

    /// Descends to the leaf that would hold `key`, recording the path of
    /// `(inner node offset, taken child index)` pairs.
    fn find_leaf(&self, key: &[u8]) -> Result<(Vec<(u64, usize)>, u64, LeafNode)> {
        let pool = self.pool.as_ref();
        let mut path = Vec::new();
        let mut offset = self.root_node()?;
        loop {
            match read_node(pool, offset)? {
                Node::Leaf(leaf) => return Ok((path, offset, leaf)),
                Node::Inner(inner) => {
                    let idx = self.descend_index(pool, &inner, key)?;
                    path.push((offset, idx));
                    offset = inner.children[idx];
                }
            }
        }
    }

    /// First index in `leaf` whose key is greater than or equal to `key`.
    fn leaf_lower_bound(&self, leaf: &LeafNode, key: &[u8]) -> Result<usize> {
        let pool = self.pool.as_ref();
        for (idx, (key_off, _)) in leaf.entries.iter().enumerate() {
            let entry_key = read_bytes(pool, *key_off)?;
            if self.cmp.compare(&entry_key, key) != Ordering::Less {
                return Ok(idx);
            }
        }
        Ok(leaf.entries.len())
    }

    fn leaf_at(&self, offset: u64) -> Result<LeafNode> {
        match read_node(self.pool.as_ref(), offset)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Inner(_) => Err(Error::unknown("expected leaf node")),
        }
    }

    fn entry_at(&self, pos: Pos) -> Result<(Vec<u8>, Vec<u8>)> {
        let leaf = self.leaf_at(pos.leaf)?;
        // A concurrent mutation can shrink the leaf under a live cursor.
        let (key_off, val_off) = *leaf.entries.get(pos.idx).ok_or(Error::NotFound)?;
        let pool = self.pool.as_ref();
        Ok((read_bytes(pool, key_off)?, read_bytes(pool, val_off)?))
    }

    fn first_pos(&self) -> Result<Option<Pos>> {
        let pool = self.pool.as_ref();
        let mut offset = self.root_node()?;
        loop {
            match read_node(pool, offset)? {
                Node::Inner(inner) => offset = inner.children[0],
                Node::Leaf(leaf) => {
                    return Ok(if leaf.entries.is_empty() {
                        None
                    } else {
                        Some(Pos {
                            leaf: offset,
                            idx: 0,
                        })
                    });
                }
            }
        }
    }

    fn last_pos(&self) -> Result<Option<Pos>> {
        let pool = self.pool.as_ref();
        let mut offset = self.root_node()?;
        loop {
            match read_node(pool, offset)? {
                Node::Inner(inner) => {
                    offset = *inner
                        .children
                        .last()
                        .ok_or_else(|| Error::unknown("inner node without children"))?;
                }
                Node::Leaf(leaf) => {
                    return Ok(if leaf.entries.is_empty() {
                        None
                    } else {
                        Some(Pos {
                            leaf: offset,
                            idx: leaf.entries.len() - 1,
                        })
                    });
                }
            }
        }
    }

    fn next_pos(&self, pos: Pos) -> Result<Option<Pos>> {
        let leaf = self.leaf_at(pos.leaf)?;
        if pos.idx + 1 < leaf.entries.len() {
            return Ok(Some(Pos {
                leaf: pos.leaf,
                idx: pos.idx + 1,
            }));
        }
        if leaf.next == 0 {
            return Ok(None);
        }
        Ok(Some(Pos {
            leaf: leaf.next,
            idx: 0,
        }))
    }

    /// Position of the first entry greater than or equal to `key`.
    fn lower_bound_pos(&self, key: &[u8]) -> Result<Option<Pos>> {
        let (_, leaf_off, leaf) = self.find_leaf(key)?;
        let idx = self.leaf_lower_bound(&leaf, key)?;
        if idx < leaf.entries.len() {
            return Ok(Some(Pos {
                leaf: leaf_off,
                idx,
            }));
        }
        if leaf.next == 0 {
            return Ok(None);
        }
        Ok(Some(Pos {
            leaf: leaf.next,
            idx: 0,
        }))
    }

    /// Position of the first entry strictly greater than `key`.
    fn upper_bound_pos(&self, key: &[u8]) -> Result<Option<Pos>> {
        match self.lower_bound_pos(key)? {
            None => Ok(None),
            Some(pos) => {
                let (entry_key, _) = self.entry_at(pos)?;
                if self.cmp.compare(&entry_key, key) == Ordering::Equal {
                    self.next_pos(pos)
                } else {
                    Ok(Some(pos))
                }
            }
        }
    }

    /// Position of the greatest entry below `key` (`<=` when
    /// `inclusive`, `<` otherwise).
    fn pred_pos(&self, key: &[u8], inclusive: bool) -> Result<Option<Pos>> {
        let pool = self.pool.as_ref();
        let mut candidate: Option<u64> = None;
        let mut offset = self.root_node()?;
        loop {
            match read_node(pool, offset)? {
                Node::Inner(inner) => {
                    let idx = self.descend_index(pool, &inner, key)?;
                    if idx > 0 {
                        candidate = Some(inner.children[idx - 1]);
                    }
                    offset = inner.children[idx];
                }
                Node::Leaf(leaf) => {
                    let mut found = None;
                    for (idx, (key_off, _)) in leaf.entries.iter().enumerate() {
                        let entry_key = read_bytes(pool, *key_off)?;
                        let ord = self.cmp.compare(&entry_key, key);
                        let below = match ord {
                            Ordering::Less => true,
                            Ordering::Equal => inclusive,
                            Ordering::Greater => false,
                        };
                        if below {
                            found = Some(Pos { leaf: offset, idx });
                        } else {
                            break;
                        }
                    }
                    if found.is_some() {
                        return Ok(found);
                    }
                    return match candidate {
                        None => Ok(None),
                        Some(subtree) => self.rightmost_pos(subtree).map(Some),
                    };
                }
            }
        }
    }

    fn rightmost_pos(&self, mut offset: u64) -> Result<Pos> {
        let pool = self.pool.as_ref();
        loop {
            match read_node(pool, offset)? {
                Node::Inner(inner) => {
                    offset = *inner
                        .children
                        .last()
                        .ok_or_else(|| Error::unknown("inner node without children"))?;
                }
                Node::Leaf(leaf) => {
                    if leaf.entries.is_empty() {
                        return Err(Error::unknown("empty non-root leaf"));
                    }
                    return Ok(Pos {
                        leaf: offset,
                        idx: leaf.entries.len() - 1,
                    });
                }
            }
        }
    }

    /// Walks entries from `first`, stopping before the first key at or
    /// past `bound` (when given), feeding each entry to `visit`.
    fn for_each_in(
        &self,
        first: Option<Pos>,
        bound: Option<&[u8]>,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        let Some(start) = first else {
            return Ok(());
        };
        let pool = self.pool.as_ref();
        let mut leaf_off = start.leaf;
        let mut idx = start.idx;
        loop {
            let leaf = self.leaf_at(leaf_off)?;
            while idx < leaf.entries.len() {
                let (key_off, val_off) = leaf.entries[idx];
                let key = read_bytes(pool, key_off)?;
                if let Some(bound) = bound {
                    if self.cmp.compare(&key, bound) != Ordering::Less {
                        return Ok(());
                    }
                }
                let value = read_bytes(pool, val_off)?;
                if visit(&key, &value).is_break() {
                    return Err(Error::StoppedByCallback);
                }
                idx += 1;
            }
            if leaf.next == 0 {
                return Ok(());
            }
            leaf_off = leaf.next;
            idx = 0;
        }
    }

    fn count_in(&self, first: Option<Pos>, bound: Option<&[u8]>) -> Result<usize> {
        let mut count = 0;
        self.for_each_in(first, bound, &mut |_, _| {
            count += 1;
            ControlFlow::Continue(())
        })?;
        Ok(count)
    }

    /// Delivers the entry at `pos` to a kv callback.
    fn deliver(&self, pos: Option<Pos>, callback: KvCallback<'_>) -> Result<()> {
        match pos {
            None => Err(Error::NotFound),
            Some(pos) => {
                let (key, value) = self.entry_at(pos)?;
                if callback(&key, &value).is_break() {
                    return Err(Error::StoppedByCallback);
                }
                Ok(())
            }
        }
    }

    fn check_key(key: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::invalid_argument(format!(
                "key length {} exceeds stree maximum {MAX_KEY_SIZE}",
                key.len()
            )));
        }
        Ok(())
    }

    fn insert_entry(
        &self,
        tx: &mut PoolTx<'_>,
        mut path: Vec<(u64, usize)>,
        leaf_off: u64,
        mut leaf: LeafNode,
        idx: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let key_off = write_bytes(tx, key)?;
        let val_off = write_bytes(tx, value)?;
        leaf.entries.insert(idx, (key_off, val_off));
        self.bump_count(tx, 1)?;

        if leaf.entries.len() <= MAX_LEAF_ENTRIES {
            return write_node(tx, leaf_off, &Node::Leaf(leaf));
        }

        // Leaf split: upper half moves to a new right sibling, a copy of
        // its first key becomes the separator.
        let mid = leaf.entries.len() / 2;
        let right_entries = leaf.entries.split_off(mid);
        let right_off = tx.alloc(NODE_SIZE)?;
        let right = LeafNode {
            next: leaf.next,
            entries: right_entries,
        };
        leaf.next = right_off;

        let separator_bytes = read_bytes(tx, right.entries[0].0)?;
        let separator = write_bytes(tx, &separator_bytes)?;

        write_node(tx, right_off, &Node::Leaf(right))?;
        write_node(tx, leaf_off, &Node::Leaf(leaf))?;

        let mut sep_off = separator;
        let mut right_child = right_off;
        loop {
            match path.pop() {
                None => {
                    // The split reached the top; grow a new root.
                    let old_root = tx.read_u64(self.meta)?;
                    let new_root = tx.alloc(NODE_SIZE)?;
                    write_node(
                        tx,
                        new_root,
                        &Node::Inner(InnerNode {
                            keys: vec![sep_off],
                            children: vec![old_root, right_child],
                        }),
                    )?;
                    tx.write_u64(self.meta, new_root)?;
                    return Ok(());
                }
                Some((inner_off, child_idx)) => {
                    let mut inner = match read_node(tx, inner_off)? {
                        Node::Inner(inner) => inner,
                        Node::Leaf(_) => return Err(Error::unknown("leaf on inner path")),
                    };
                    inner.keys.insert(child_idx, sep_off);
                    inner.children.insert(child_idx + 1, right_child);

                    if inner.keys.len() <= MAX_INNER_KEYS {
                        return write_node(tx, inner_off, &Node::Inner(inner));
                    }

                    // Inner split: the middle key moves (not copies) up.
                    let mid = inner.keys.len() / 2;
                    let promoted = inner.keys[mid];
                    let right_keys = inner.keys.split_off(mid + 1);
                    inner.keys.pop();
                    let right_children = inner.children.split_off(mid + 1);

                    let new_right = tx.alloc(NODE_SIZE)?;
                    write_node(
                        tx,
                        new_right,
                        &Node::Inner(InnerNode {
                            keys: right_keys,
                            children: right_children,
                        }),
                    )?;
                    write_node(tx, inner_off, &Node::Inner(inner))?;

                    sep_off = promoted;
                    right_child = new_right;
                }
            }
        }
    }

    fn remove_entry(
        &self,
        tx: &mut PoolTx<'_>,
        mut path: Vec<(u64, usize)>,
        leaf_off: u64,
        mut leaf: LeafNode,
        idx: usize,
    ) -> Result<()> {
        let (key_off, val_off) = leaf.entries.remove(idx);
        free_bytes(tx, key_off)?;
        free_bytes(tx, val_off)?;
        self.bump_count(tx, -1)?;
        write_node(tx, leaf_off, &Node::Leaf(leaf.clone()))?;

        if path.is_empty() || leaf.entries.len() >= MIN_LEAF_ENTRIES {
            return Ok(());
        }

        let (parent_off, child_idx) = path
            .pop()
            .ok_or_else(|| Error::unknown("missing rebalance parent"))?;
        self.rebalance(tx, path, parent_off, child_idx, leaf_off)?;
        Ok(())
    }

    /// Restores minimum occupancy of `child` (at `child_idx` under
    /// `parent_off`) by borrowing from a sibling or merging with one,
    /// propagating upward when the parent underflows in turn.
    fn rebalance(
        &self,
        tx: &mut PoolTx<'_>,
        mut path: Vec<(u64, usize)>,
        parent_off: u64,
        child_idx: usize,
        child_off: u64,
    ) -> Result<()> {
        let mut parent = match read_node(tx, parent_off)? {
            Node::Inner(inner) => inner,
            Node::Leaf(_) => return Err(Error::unknown("leaf used as parent")),
        };
        let child = read_node(tx, child_off)?;

        // Borrow from the left sibling when it has spare entries.
        if child_idx > 0 {
            let left_off = parent.children[child_idx - 1];
            let left = read_node(tx, left_off)?;
            if self.try_borrow_left(tx, &mut parent, child_idx, left_off, left, child_off, &child)? {
                return write_node(tx, parent_off, &Node::Inner(parent));
            }
        }

        // Then from the right sibling.
        if child_idx + 1 < parent.children.len() {
            let right_off = parent.children[child_idx + 1];
            let right = read_node(tx, right_off)?;
            if self.try_borrow_right(tx, &mut parent, child_idx, right_off, right, child_off, &child)? {
                return write_node(tx, parent_off, &Node::Inner(parent));
            }
        }

        // No spare entries on either side: merge into the left neighbor
        // (or absorb the right one when the child is leftmost).
        let (dst_idx, dst_off, src_off) = if child_idx > 0 {
            (child_idx - 1, parent.children[child_idx - 1], child_off)
        } else {
            (child_idx, child_off, parent.children[child_idx + 1])
        };
        let sep_idx = dst_idx;
        let sep_off = parent.keys[sep_idx];
        let dst = read_node(tx, dst_off)?;
        let src = read_node(tx, src_off)?;

        match (dst, src) {
            (Node::Leaf(mut dst_leaf), Node::Leaf(src_leaf)) => {
                dst_leaf.entries.extend(src_leaf.entries);
                dst_leaf.next = src_leaf.next;
                write_node(tx, dst_off, &Node::Leaf(dst_leaf))?;
                // Leaf keys live in the entries; the separator copy dies
                // with the merge.
                free_bytes(tx, sep_off)?;
            }
            (Node::Inner(mut dst_inner), Node::Inner(src_inner)) => {
                // The separator moves down between the merged halves.
                dst_inner.keys.push(sep_off);
                dst_inner.keys.extend(src_inner.keys);
                dst_inner.children.extend(src_inner.children);
                write_node(tx, dst_off, &Node::Inner(dst_inner))?;
            }
            _ => return Err(Error::unknown("sibling kind mismatch")),
        }
        tx.free(src_off)?;
        parent.keys.remove(sep_idx);
        parent.children.remove(sep_idx + 1);

        if path.is_empty() {
            // The parent is the root.
            if parent.keys.is_empty() {
                tx.write_u64(self.meta, dst_off)?;
                tx.free(parent_off)?;
                return Ok(());
            }
            return write_node(tx, parent_off, &Node::Inner(parent));
        }

        write_node(tx, parent_off, &Node::Inner(parent.clone()))?;
        if parent.keys.len() >= MIN_INNER_KEYS {
            return Ok(());
        }
        let (grand_off, parent_idx) = path
            .pop()
            .ok_or_else(|| Error::unknown("missing rebalance parent"))?;
        self.rebalance(tx, path, grand_off, parent_idx, parent_off)
    }

    #[allow(clippy::too_many_arguments)]
    fn try_borrow_left(
        &self,
        tx: &mut PoolTx<'_>,
        parent: &mut InnerNode,
        child_idx: usize,
        left_off: u64,
        left: Node,
        child_off: u64,
        child: &Node,
    ) -> Result<bool> {
        let sep_idx = child_idx - 1;
        match (left, child) {
            (Node::Leaf(mut left_leaf), Node::Leaf(child_leaf)) => {
                if left_leaf.entries.len() <= MIN_LEAF_ENTRIES {
                    return Ok(false);
                }
                let mut child_leaf = child_leaf.clone();
                let moved = left_leaf
                    .entries
                    .pop()
                    .ok_or_else(|| Error::unknown("empty leaf sibling"))?;
                child_leaf.entries.insert(0, moved);

                // The child's first key changed; refresh the separator copy.
                let new_sep_bytes = read_bytes(tx, moved.0)?;
                let new_sep = write_bytes(tx, &new_sep_bytes)?;
                free_bytes(tx, parent.keys[sep_idx])?;
                parent.keys[sep_idx] = new_sep;

                write_node(tx, left_off, &Node::Leaf(left_leaf))?;
                write_node(tx, child_off, &Node::Leaf(child_leaf))?;
                Ok(true)
            }
            (Node::Inner(mut left_inner), Node::Inner(child_inner)) => {
                if left_inner.keys.len() <= MIN_INNER_KEYS {
                    return Ok(false);
                }
                let mut child_inner = child_inner.clone();
                // Rotate: separator drops into the child, the left
                // sibling's last key rises into the parent.
                let rising = left_inner
                    .keys
                    .pop()
                    .ok_or_else(|| Error::unknown("empty inner sibling"))?;
                let moved_child = left_inner
                    .children
                    .pop()
                    .ok_or_else(|| Error::unknown("inner sibling without children"))?;
                child_inner.keys.insert(0, parent.keys[sep_idx]);
                child_inner.children.insert(0, moved_child);
                parent.keys[sep_idx] = rising;

                write_node(tx, left_off, &Node::Inner(left_inner))?;
                write_node(tx, child_off, &Node::Inner(child_inner))?;
                Ok(true)
            }
            _ => Err(Error::unknown("sibling kind mismatch")),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_borrow_right(
        &self,
        tx: &mut PoolTx<'_>,
        parent: &mut InnerNode,
        child_idx: usize,
        right_off: u64,
        right: Node,
        child_off: u64,
        child: &Node,
    ) -> Result<bool> {
        let sep_idx = child_idx;
        match (right, child) {
            (Node::Leaf(mut right_leaf), Node::Leaf(child_leaf)) => {
                if right_leaf.entries.len() <= MIN_LEAF_ENTRIES {
                    return Ok(false);
                }
                let mut child_leaf = child_leaf.clone();
                let moved = right_leaf.entries.remove(0);
                child_leaf.entries.push(moved);

                // The right sibling's first key changed; refresh the
                // separator copy.
                let new_sep_bytes = read_bytes(tx, right_leaf.entries[0].0)?;
                let new_sep = write_bytes(tx, &new_sep_bytes)?;
                free_bytes(tx, parent.keys[sep_idx])?;
                parent.keys[sep_idx] = new_sep;

                write_node(tx, right_off, &Node::Leaf(right_leaf))?;
                write_node(tx, child_off, &Node::Leaf(child_leaf))?;
                Ok(true)
            }
            (Node::Inner(mut right_inner), Node::Inner(child_inner)) => {
                if right_inner.keys.len() <= MIN_INNER_KEYS {
                    return Ok(false);
                }
                let mut child_inner = child_inner.clone();
                let falling = parent.keys[sep_idx];
                let rising = right_inner.keys.remove(0);
                let moved_child = right_inner.children.remove(0);
                child_inner.keys.push(falling);
                child_inner.children.push(moved_child);
                parent.keys[sep_idx] = rising;

                write_node(tx, right_off, &Node::Inner(right_inner))?;
                write_node(tx, child_off, &Node::Inner(child_inner))?;
                Ok(true)
            }
            _ => Err(Error::unknown("sibling kind mismatch")),
        }
    }
}

impl KvEngine for Stree {
    fn name(&self) -> &'static str {
        "stree"
    }

    fn count_all(&self) -> Result<usize> {
        trace!("count_all");
        let _guard = self.lock.read();
        Ok(self.entry_count()? as usize)
    }

    fn count_above(&self, key: &[u8]) -> Result<usize> {
        trace!(key_len = key.len(), "count_above");
        let _guard = self.lock.read();
        let first = self.upper_bound_pos(key)?;
        self.count_in(first, None)
    }

    fn count_equal_above(&self, key: &[u8]) -> Result<usize> {
        trace!(key_len = key.len(), "count_equal_above");
        let _guard = self.lock.read();
        let first = self.lower_bound_pos(key)?;
        self.count_in(first, None)
    }

    fn count_equal_below(&self, key: &[u8]) -> Result<usize> {
        trace!(key_len = key.len(), "count_equal_below");
        let _guard = self.lock.read();
        let total = self.entry_count()? as usize;
        let first = self.upper_bound_pos(key)?;
        Ok(total - self.count_in(first, None)?)
    }

    fn count_below(&self, key: &[u8]) -> Result<usize> {
        trace!(key_len = key.len(), "count_below");
        let _guard = self.lock.read();
        self.count_in(self.first_pos()?, Some(key))
    }

    fn count_between(&self, key1: &[u8], key2: &[u8]) -> Result<usize> {
        trace!(key1_len = key1.len(), key2_len = key2.len(), "count_between");
        let _guard = self.lock.read();
        if self.cmp.compare(key1, key2) != Ordering::Less {
            return Ok(0);
        }
        let first = self.lower_bound_pos(key1)?;
        self.count_in(first, Some(key2))
    }

    fn get_all(&self, callback: KvCallback<'_>) -> Result<()> {
        trace!("get_all");
        let _guard = self.lock.read();
        self.for_each_in(self.first_pos()?, None, callback)
    }

    fn get_above(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_above");
        let _guard = self.lock.read();
        let first = self.upper_bound_pos(key)?;
        self.for_each_in(first, None, callback)
    }

    fn get_equal_above(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_equal_above");
        let _guard = self.lock.read();
        let first = self.lower_bound_pos(key)?;
        self.for_each_in(first, None, callback)
    }

    fn get_equal_below(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_equal_below");
        let _guard = self.lock.read();
        let first = self.first_pos()?;
        let mut stopped = false;
        let result = self.for_each_in(first, None, &mut |k, v| {
            if self.cmp.compare(k, key) == Ordering::Greater {
                stopped = true;
                return ControlFlow::Break(());
            }
            callback(k, v)
        });
        match result {
            Err(Error::StoppedByCallback) if stopped => Ok(()),
            other => other,
        }
    }

    fn get_below(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_below");
        let _guard = self.lock.read();
        self.for_each_in(self.first_pos()?, Some(key), callback)
    }

    fn get_between(&self, key1: &[u8], key2: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key1_len = key1.len(), key2_len = key2.len(), "get_between");
        let _guard = self.lock.read();
        if self.cmp.compare(key1, key2) != Ordering::Less {
            return Ok(());
        }
        let first = self.lower_bound_pos(key1)?;
        self.for_each_in(first, Some(key2), callback)
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        trace!(key_len = key.len(), "exists");
        let _guard = self.lock.read();
        let (_, _, leaf) = self.find_leaf(key)?;
        let idx = self.leaf_lower_bound(&leaf, key)?;
        if idx >= leaf.entries.len() {
            return Ok(false);
        }
        let entry_key = read_bytes(self.pool.as_ref(), leaf.entries[idx].0)?;
        Ok(self.cmp.compare(&entry_key, key) == Ordering::Equal)
    }

    fn get(&self, key: &[u8], callback: ValueCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get");
        let _guard = self.lock.read();
        let (_, _, leaf) = self.find_leaf(key)?;
        let idx = self.leaf_lower_bound(&leaf, key)?;
        if idx >= leaf.entries.len() {
            return Err(Error::NotFound);
        }
        let pool = self.pool.as_ref();
        let entry_key = read_bytes(pool, leaf.entries[idx].0)?;
        if self.cmp.compare(&entry_key, key) != Ordering::Equal {
            return Err(Error::NotFound);
        }
        let value = read_bytes(pool, leaf.entries[idx].1)?;
        callback(&value);
        Ok(())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        trace!(key_len = key.len(), value_len = value.len(), "put");
        Self::check_key(key)?;
        let _guard = self.lock.write();

        let (path, leaf_off, leaf) = self.find_leaf(key)?;
        let idx = self.leaf_lower_bound(&leaf, key)?;
        let existing = if idx < leaf.entries.len() {
            let entry_key = read_bytes(self.pool.as_ref(), leaf.entries[idx].0)?;
            self.cmp.compare(&entry_key, key) == Ordering::Equal
        } else {
            false
        };

        if existing {
            // The entry stays in place; only its value field is replaced,
            // in a transaction of its own.
            let mut leaf = leaf;
            self.pool.run(|tx| -> Result<()> {
                let new_val = write_bytes(tx, value)?;
                free_bytes(tx, leaf.entries[idx].1)?;
                leaf.entries[idx].1 = new_val;
                write_node(tx, leaf_off, &Node::Leaf(leaf.clone()))
            })
        } else {
            self.pool.run(|tx| -> Result<()> {
                self.insert_entry(tx, path, leaf_off, leaf, idx, key, value)
            })
        }
    }

    fn remove(&self, key: &[u8]) -> Result<bool> {
        trace!(key_len = key.len(), "remove");
        let _guard = self.lock.write();

        let (path, leaf_off, leaf) = self.find_leaf(key)?;
        let idx = self.leaf_lower_bound(&leaf, key)?;
        if idx >= leaf.entries.len() {
            return Ok(false);
        }
        let entry_key = read_bytes(self.pool.as_ref(), leaf.entries[idx].0)?;
        if self.cmp.compare(&entry_key, key) != Ordering::Equal {
            return Ok(false);
        }

        self.pool
            .run(|tx| -> Result<()> { self.remove_entry(tx, path, leaf_off, leaf, idx) })?;
        Ok(true)
    }

    fn get_floor_entry(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_floor_entry");
        let _guard = self.lock.read();
        let pos = self.pred_pos(key, true)?;
        self.deliver(pos, callback)
    }

    fn get_lower_entry(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_lower_entry");
        let _guard = self.lock.read();
        let pos = self.pred_pos(key, false)?;
        self.deliver(pos, callback)
    }

    fn get_ceiling_entry(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_ceiling_entry");
        let _guard = self.lock.read();
        let pos = self.lower_bound_pos(key)?;
        self.deliver(pos, callback)
    }

    fn get_higher_entry(&self, key: &[u8], callback: KvCallback<'_>) -> Result<()> {
        trace!(key_len = key.len(), "get_higher_entry");
        let _guard = self.lock.read();
        let pos = self.upper_bound_pos(key)?;
        self.deliver(pos, callback)
    }

    fn iter(&self) -> Result<Box<dyn KvIterator + '_>> {
        trace!("iter");
        Ok(Box::new(StreeIter {
            engine: self,
            pos: None,
        }))
    }
}

/// Bidirectional cursor over the tree.
///
/// `pos == None` is the end sentinel; stepping off either end wraps, per
/// the shared cursor contract.
struct StreeIter<'a> {
    engine: &'a Stree,
    pos: Option<Pos>,
}

impl StreeIter<'_> {
    fn current_key(&self) -> Result<Vec<u8>> {
        match self.pos {
            None => Err(Error::NotFound),
            Some(pos) => Ok(self.engine.entry_at(pos)?.0),
        }
    }
}

impl KvIterator for StreeIter<'_> {
    fn seek_to_first(&mut self) -> Result<()> {
        self.pos = self.engine.first_pos()?;
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        self.pos = self.engine.last_pos()?;
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        let pos = self.engine.lower_bound_pos(key)?;
        self.pos = match pos {
            Some(pos) => {
                let (entry_key, _) = self.engine.entry_at(pos)?;
                if self.engine.cmp.compare(&entry_key, key) == Ordering::Equal {
                    Some(pos)
                } else {
                    None
                }
            }
            None => None,
        };
        Ok(())
    }

    fn seek_for_prev(&mut self, key: &[u8]) -> Result<()> {
        self.pos = self.engine.pred_pos(key, true)?;
        Ok(())
    }

    fn seek_for_next(&mut self, key: &[u8]) -> Result<()> {
        self.pos = self.engine.upper_bound_pos(key)?;
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        self.pos = match self.pos {
            None => self.engine.first_pos()?,
            Some(pos) => self.engine.next_pos(pos)?,
        };
        Ok(())
    }

    fn retreat(&mut self) -> Result<()> {
        self.pos = match self.pos.take() {
            None => self.engine.last_pos()?,
            Some(pos) => {
                let key = self.engine.entry_at(pos)?.0;
                self.engine.pred_pos(&key, false)?
            }
        };
        Ok(())
    }

    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn key(&self) -> Result<Vec<u8>> {
        self.current_key()
    }

    fn value(&self) -> Result<Vec<u8>> {
        match self.pos {
            None => Err(Error::NotFound),
            Some(pos) => Ok(self.engine.entry_at(pos)?.1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permakv_pool::MIN_POOL;
    use tempfile::tempdir;

    fn open_tree(dir: &std::path::Path) -> Stree {
        let path = dir.join("stree.pool");
        let pool = if path.exists() {
            Pool::open(&path, LAYOUT).unwrap()
        } else {
            Pool::create(&path, LAYOUT, MIN_POOL).unwrap()
        };
        Stree::open(Arc::new(pool), None).unwrap()
    }

    fn keys_of(engine: &Stree) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        engine
            .get_all(&mut |k, _| {
                keys.push(k.to_vec());
                ControlFlow::Continue(())
            })
            .unwrap();
        keys
    }

    #[test]
    fn put_get_remove_round_trip() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path());

        tree.put(b"key1", b"value1").unwrap();
        assert_eq!(tree.count_all().unwrap(), 1);
        assert!(tree.exists(b"key1").unwrap());

        let mut got = Vec::new();
        tree.get(b"key1", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"value1");

        assert!(tree.remove(b"key1").unwrap());
        assert!(!tree.exists(b"key1").unwrap());
        assert!(!tree.remove(b"key1").unwrap());
        assert_eq!(tree.count_all().unwrap(), 0);
    }

    #[test]
    fn put_replaces_value() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path());

        tree.put(b"k", b"first").unwrap();
        tree.put(b"k", b"second").unwrap();
        assert_eq!(tree.count_all().unwrap(), 1);

        let mut got = Vec::new();
        tree.get(b"k", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"second");
    }

    #[test]
    fn splits_preserve_order_and_membership() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path());

        let n = DEGREE * 6;
        for i in 0..n {
            let key = format!("{i:05}");
            tree.put(key.as_bytes(), key.as_bytes()).unwrap();
        }
        assert_eq!(tree.count_all().unwrap(), n);

        let keys = keys_of(&tree);
        assert_eq!(keys.len(), n);
        for window in keys.windows(2) {
            assert!(window[0] < window[1]);
        }

        for i in 0..n {
            let key = format!("{i:05}");
            assert!(tree.exists(key.as_bytes()).unwrap(), "missing {key}");
        }
    }

    #[test]
    fn removals_rebalance_down_to_empty() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path());

        let n = DEGREE * 5;
        for i in 0..n {
            let key = format!("{i:05}");
            tree.put(key.as_bytes(), b"v").unwrap();
        }
        // Interleave removals from both ends to exercise borrow and merge
        // on both siblings.
        for i in 0..n / 2 {
            let low = format!("{i:05}");
            let high = format!("{:05}", n - 1 - i);
            assert!(tree.remove(low.as_bytes()).unwrap());
            assert!(tree.remove(high.as_bytes()).unwrap());
        }
        assert_eq!(tree.count_all().unwrap(), 0);
        assert_eq!(keys_of(&tree), Vec::<Vec<u8>>::new());

        // The tree stays usable after collapsing to an empty root.
        tree.put(b"again", b"v").unwrap();
        assert!(tree.exists(b"again").unwrap());
    }

    #[test]
    fn range_counts_partition_the_key_space() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path());

        for i in 0..100 {
            let key = format!("{i:03}");
            tree.put(key.as_bytes(), b"v").unwrap();
        }

        for probe in ["000", "042", "050", "099", "100", "zzz"] {
            let below = tree.count_below(probe.as_bytes()).unwrap();
            let above = tree.count_above(probe.as_bytes()).unwrap();
            let present = usize::from(tree.exists(probe.as_bytes()).unwrap());
            assert_eq!(below + present + above, 100, "probe {probe}");
        }

        assert_eq!(tree.count_between(b"010", b"020").unwrap(), 10);
        assert_eq!(tree.count_between(b"020", b"010").unwrap(), 0);
        assert_eq!(tree.count_between(b"010", b"010").unwrap(), 0);
        assert_eq!(tree.count_equal_above(b"090").unwrap(), 10);
        assert_eq!(tree.count_equal_below(b"009").unwrap(), 10);
    }

    #[test]
    fn oversized_key_is_rejected() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path());

        let key = vec![b'x'; MAX_KEY_SIZE + 1];
        assert!(matches!(
            tree.put(&key, b"v").unwrap_err(),
            Error::InvalidArgument { .. }
        ));
    }

    #[test]
    fn reopen_recovers_entries() {
        let dir = tempdir().unwrap();
        {
            let tree = open_tree(dir.path());
            for i in 0..100 {
                let key = format!("{i:03}");
                tree.put(key.as_bytes(), key.as_bytes()).unwrap();
            }
        }
        let tree = open_tree(dir.path());
        assert_eq!(tree.count_all().unwrap(), 100);
        let mut got = Vec::new();
        tree.get(b"042", &mut |v| got = v.to_vec()).unwrap();
        assert_eq!(got, b"042");
    }

    #[test]
    fn iterator_wraps_at_both_ends() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path());
        tree.put(b"a", b"1").unwrap();
        tree.put(b"b", b"2").unwrap();

        let mut it = tree.iter().unwrap();
        it.seek_to_first().unwrap();
        assert!(it.valid());
        assert_eq!(it.key().unwrap(), b"a");

        it.advance().unwrap();
        assert_eq!(it.key().unwrap(), b"b");
        it.advance().unwrap();
        assert!(!it.valid());
        it.advance().unwrap();
        assert_eq!(it.key().unwrap(), b"a");

        it.retreat().unwrap();
        assert!(!it.valid());
        it.retreat().unwrap();
        assert_eq!(it.key().unwrap(), b"b");
    }

    #[test]
    fn iterator_seeks() {
        let dir = tempdir().unwrap();
        let tree = open_tree(dir.path());
        for key in [b"b" as &[u8], b"d", b"f"] {
            tree.put(key, b"v").unwrap();
        }

        let mut it = tree.iter().unwrap();
        it.seek(b"d").unwrap();
        assert_eq!(it.key().unwrap(), b"d");
        it.seek(b"c").unwrap();
        assert!(!it.valid());

        it.seek_for_prev(b"d").unwrap();
        assert_eq!(it.key().unwrap(), b"d");
        it.seek_for_prev(b"c").unwrap();
        assert_eq!(it.key().unwrap(), b"b");
        it.seek_for_prev(b"a").unwrap();
        assert!(!it.valid());

        it.seek_for_next(b"d").unwrap();
        assert_eq!(it.key().unwrap(), b"f");
        it.seek_for_next(b"f").unwrap();
        assert!(!it.valid());
    }
}
