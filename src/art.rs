use std::ops::RangeBounds;

use triomphe::Arc;

use crate::{
    allocator::AllocatorStats,
    error::{error_corrupted, error_validation, Error},
    iter::Iter,
    leaf,
    legacy,
    options::ArtOptions,
    pool::{AllocationCounts, AllocatorSet, ArenaPool},
    prefix::Prefix,
    repr::{Node, Repr, RowId},
    utils::{ByteSize, EscapedBytes},
};

/// An adaptive radix tree mapping keys to sets of row ids.
///
/// Keys are arbitrary non empty byte strings, but no key may be a prefix of another key,
/// which [crate::ArtKey] encodings guarantee.
/// The tree isn't synchronized, see [crate::ArtIndex] for a shareable version.
#[derive(Debug)]
pub struct Art {
    opts: Arc<ArtOptions>,
    pool: ArenaPool,
    root: Node,
    len: usize,
}

impl Default for Art {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn is_leaf_position(node: Node) -> bool {
    node.is_gate() || matches!(node.repr(), Repr::LeafInlined(_) | Repr::LeafDeprecated(_))
}

/// Builds the path for the rest of a new key
fn leaf_path(pool: &mut ArenaPool, bytes: &[u8], row_id: RowId) -> Result<Node, Error> {
    Prefix::new_chain(pool, bytes, Node::leaf(row_id), false)
}

fn prefix_conflict(key: &[u8]) -> Error {
    error_validation!(
        "Key {:?} is a prefix of an indexed key or the other way around",
        EscapedBytes(key)
    )
}

/// Inserts `(key, row_id)` under `node`, which is at `depth` bytes of `key`.
/// Children are always written back to their parent before an error is propagated.
fn insert_at(
    pool: &mut ArenaPool,
    node: &mut Node,
    key: &[u8],
    depth: usize,
    row_id: RowId,
) -> Result<bool, Error> {
    if node.is_empty() {
        *node = leaf_path(pool, &key[depth..], row_id)?;
        return Ok(true);
    }
    if is_leaf_position(*node) {
        if depth != key.len() {
            return Err(prefix_conflict(key));
        }
        return leaf::insert_row(pool, node, row_id);
    }
    if depth == key.len() {
        return Err(prefix_conflict(key));
    }
    match node.repr() {
        Repr::Prefix(mut s) => {
            // chains are walked iteratively, they can be long
            let mut segment_node = *node;
            let mut parent = None;
            let mut depth = depth;
            loop {
                let segment = pool.get(s);
                let (count, child) = (segment.count(), segment.child);
                let m = segment.mismatch(&key[depth..]);
                if m == count {
                    depth += count;
                    match child.repr() {
                        Repr::Prefix(next) if !child.is_gate() && depth < key.len() => {
                            parent = Some(s);
                            segment_node = child;
                            s = next;
                            continue;
                        }
                        _ => (),
                    }
                    let mut child = child;
                    let result = insert_at(pool, &mut child, key, depth, row_id);
                    pool.get_mut(s).child = child;
                    return result;
                }
                if depth + m == key.len() {
                    return Err(prefix_conflict(key));
                }
                let mut tail = leaf_path(pool, &key[depth + m + 1..], row_id)?;
                return match Prefix::branch(pool, segment_node, m, key[depth + m], tail) {
                    Ok(new) => {
                        match parent {
                            Some(p) => pool.get_mut(p).child = new,
                            None => *node = new,
                        }
                        Ok(true)
                    }
                    Err(e) => {
                        tail.free(pool);
                        Err(e)
                    }
                };
            }
        }
        Repr::Node4(_) | Repr::Node16(_) | Repr::Node48(_) | Repr::Node256(_) => {
            let byte = key[depth];
            if let Some(mut child) = node.get_child(pool, byte) {
                let result = insert_at(pool, &mut child, key, depth + 1, row_id);
                node.replace_child(pool, byte, child);
                return result;
            }
            let mut tail = leaf_path(pool, &key[depth + 1..], row_id)?;
            if let Err(e) = node.insert_child(pool, byte, tail) {
                tail.free(pool);
                return Err(e);
            }
            Ok(true)
        }
        _ => Err(error_corrupted!("Unexpected {node:?} at depth {depth}")),
    }
}

/// Deletes `(key, row_id)` under `node`, which is at `depth` bytes of `key`.
/// Emptied children are removed from their parent, a prefix segment that lost its branching
/// child is merged with the prefix replacing it.
fn delete_at(
    pool: &mut ArenaPool,
    node: &mut Node,
    key: &[u8],
    depth: usize,
    row_id: RowId,
) -> Result<bool, Error> {
    if node.is_empty() {
        return Ok(false);
    }
    if is_leaf_position(*node) {
        if depth != key.len() {
            return Ok(false);
        }
        return leaf::delete_row(pool, node, row_id);
    }
    if depth >= key.len() {
        return Ok(false);
    }
    match node.repr() {
        Repr::Prefix(mut s) => {
            let mut parent = None;
            let mut depth = depth;
            loop {
                let segment = pool.get(s);
                let (count, child) = (segment.count(), segment.child);
                if segment.mismatch(&key[depth..]) != count {
                    return Ok(false);
                }
                depth += count;
                match child.repr() {
                    Repr::Prefix(next) if !child.is_gate() && depth < key.len() => {
                        parent = Some(s);
                        s = next;
                    }
                    _ => break,
                }
            }
            let mut child = pool.get(s).child;
            let result = delete_at(pool, &mut child, key, depth, row_id);
            if child.is_empty() {
                // the whole chain only led to the emptied child
                let mut segment = *node;
                while let Repr::Prefix(slot) = segment.repr() {
                    let last = slot == s;
                    segment = pool.free(slot).child;
                    if last {
                        break;
                    }
                }
                node.clear();
                return result;
            }
            pool.get_mut(s).child = child;
            let deleted = result?;
            if deleted
                && pool.get(s).count() < pool.prefix_count()
                && matches!(child.repr(), Repr::Prefix(_))
                && !child.is_gate()
            {
                match parent {
                    Some(p) => {
                        let head = pool.get(p).child;
                        let normalized = Prefix::normalize(pool, head)?;
                        pool.get_mut(p).child = normalized;
                    }
                    None => *node = Prefix::normalize(pool, *node)?,
                }
            }
            Ok(deleted)
        }
        Repr::Node4(_) | Repr::Node16(_) | Repr::Node48(_) | Repr::Node256(_) => {
            let byte = key[depth];
            let Some(mut child) = node.get_child(pool, byte) else {
                return Ok(false);
            };
            let result = delete_at(pool, &mut child, key, depth + 1, row_id);
            if child.is_empty() {
                node.delete_child(pool, byte)?;
            } else {
                node.replace_child(pool, byte, child);
            }
            result
        }
        _ => Err(error_corrupted!("Unexpected {node:?} at depth {depth}")),
    }
}

/// The leaf position of `key`, if any
fn lookup(pool: &ArenaPool, root: Node, key: &[u8]) -> Option<Node> {
    let mut node = root;
    let mut depth = 0;
    loop {
        if node.is_empty() {
            return None;
        }
        if is_leaf_position(node) {
            return (depth == key.len()).then_some(node);
        }
        match node.repr() {
            Repr::Prefix(_) => node = Prefix::traverse(pool, node, key, &mut depth)?,
            Repr::Node4(_) | Repr::Node16(_) | Repr::Node48(_) | Repr::Node256(_) => {
                node = node.get_child(pool, *key.get(depth)?)?;
                depth += 1;
            }
            _ => return None,
        }
    }
}

impl Art {
    pub fn new() -> Self {
        Self::from_options(Arc::new(ArtOptions::default()))
    }

    pub fn with_options(opts: ArtOptions) -> Result<Self, Error> {
        opts.validate()?;
        Ok(Self::from_options(Arc::new(opts)))
    }

    fn from_options(opts: Arc<ArtOptions>) -> Self {
        Self {
            pool: ArenaPool::new(&opts),
            opts,
            root: Node::EMPTY,
            len: 0,
        }
    }

    #[inline]
    pub fn options(&self) -> &ArtOptions {
        &self.opts
    }

    /// Number of `(key, row id)` pairs
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    #[inline]
    pub fn root(&self) -> Node {
        self.root
    }

    #[inline]
    pub fn pool(&self) -> &ArenaPool {
        &self.pool
    }

    fn check_key(key: &[u8]) -> Result<(), Error> {
        if key.is_empty() {
            return Err(error_validation!("Keys can't be empty"));
        }
        Ok(())
    }

    /// Adds `row_id` to the row ids of `key`. Returns false if it was already present.
    ///
    /// Fails with [Error::Validation] if `key` is a prefix of an indexed key or the other way
    /// around, and with [Error::OutOfMemory] if the allocators can't grow.
    /// The tree is unchanged in both cases.
    pub fn insert(&mut self, key: &[u8], row_id: RowId) -> Result<bool, Error> {
        Self::check_key(key)?;
        self.pool.reserve_update(key.len())?;
        let mut root = self.root;
        let result = insert_at(&mut self.pool, &mut root, key, 0, row_id);
        self.root = root;
        let inserted = result?;
        self.len += inserted as usize;
        trace!("Insert {:?} {row_id}: {inserted}", EscapedBytes(key));
        Ok(inserted)
    }

    /// Removes `row_id` from the row ids of `key`. Returns false if it wasn't present.
    pub fn delete(&mut self, key: &[u8], row_id: RowId) -> Result<bool, Error> {
        if key.is_empty() || self.root.is_empty() {
            return Ok(false);
        }
        self.pool.reserve_update(key.len())?;
        let mut root = self.root;
        let result = delete_at(&mut self.pool, &mut root, key, 0, row_id);
        self.root = root;
        let deleted = result?;
        self.len -= deleted as usize;
        trace!("Delete {:?} {row_id}: {deleted}", EscapedBytes(key));
        Ok(deleted)
    }

    /// The row ids of `key`, in ascending order
    pub fn get(&self, key: &[u8]) -> Vec<RowId> {
        let mut rows = Vec::new();
        if let Some(node) = lookup(&self.pool, self.root, key) {
            leaf::collect_rows(&self.pool, node, &mut rows);
        }
        rows
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        lookup(&self.pool, self.root, key).is_some()
    }

    pub fn contains(&self, key: &[u8], row_id: RowId) -> bool {
        lookup(&self.pool, self.root, key)
            .is_some_and(|node| leaf::contains_row(&self.pool, node, row_id))
    }

    /// Ascending iterator over all `(key, row id)` pairs
    pub fn iter(&self) -> Iter<'_> {
        Iter::new::<&[u8]>(&self.pool, self.root, ..)
    }

    /// Ascending iterator over the `(key, row id)` pairs with keys in `bounds`
    pub fn range<K: AsRef<[u8]>>(&self, bounds: impl RangeBounds<K>) -> Iter<'_> {
        Iter::new(&self.pool, self.root, bounds)
    }

    /// Relocates the nodes of fragmented allocators into fewer buffers and releases the
    /// emptied ones. Returns the set of vacuumed allocators.
    pub fn vacuum(&mut self) -> Result<AllocatorSet, Error> {
        let set = self.pool.initialize_vacuum(self.opts.vacuum_threshold);
        if set.is_empty() {
            return Ok(set);
        }
        let before = self.pool.memory_usage();
        // relocations only fill the free slots of the kept buffers, they can't fail
        let result = self.root.vacuum(&mut self.pool, &set);
        debug_assert!(result.is_ok(), "{result:?}");
        if let Ok(root) = result {
            self.root = root;
        }
        self.pool.finalize_vacuum(set)?;
        result?;
        debug!(
            "Vacuumed {} allocators, memory usage {} -> {}",
            set.len(),
            ByteSize(before as u64),
            ByteSize(self.pool.memory_usage() as u64)
        );
        Ok(set)
    }

    /// Checks the structure of the tree and the allocators bookkeeping.
    pub fn verify(&self) -> Result<(), Error> {
        self.root.verify_and_to_string(&self.pool, true)?;
        self.verify_allocations()?;
        self.pool.validate()
    }

    /// Checks that the nodes reachable from the root are exactly the live slots of the
    /// allocators.
    pub fn verify_allocations(&self) -> Result<(), Error> {
        let mut counts = AllocationCounts::default();
        self.root.verify_allocations(&self.pool, &mut counts);
        let live = self.pool.live_counts();
        if counts != live {
            return Err(error_corrupted!(
                "Reachable nodes {counts:?} don't match the live slots {live:?}"
            ));
        }
        Ok(())
    }

    /// Verifies the tree and returns its textual dump
    pub fn to_string_dump(&self) -> Result<String, Error> {
        self.root.verify_and_to_string(&self.pool, false)
    }

    /// Rewrites every gate into a deprecated leaf chain, the row id set format of older
    /// trees.
    pub fn transform_to_deprecated(&mut self) -> Result<(), Error> {
        self.root = legacy::transform_to_deprecated(&mut self.pool, self.root)?;
        Ok(())
    }

    /// Migrates every deprecated leaf chain into the current format.
    pub fn transform_from_deprecated(&mut self) -> Result<(), Error> {
        self.root = legacy::transform_from_deprecated(&mut self.pool, self.root)?;
        Ok(())
    }

    /// Removes all entries and releases all allocator buffers.
    pub fn clear(&mut self) {
        self.root = Node::EMPTY;
        self.pool.clear();
        self.len = 0;
    }

    pub fn memory_usage(&self) -> usize {
        self.pool.memory_usage()
    }

    pub fn allocator_stats(&self) -> Vec<AllocatorStats> {
        self.pool.stats()
    }
}
