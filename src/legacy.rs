//! Deprecated leaf format.
//!
//! Older trees stored the row ids of a key in chains of [DeprecatedLeaf] segments instead of
//! gates. These chains are still understood by lookups, iteration, vacuum, verification and
//! free. Any insert or delete reaching one migrates it to the current format first.

use crate::{
    error::{error_corrupted, Error},
    leaf,
    pool::{AllocationCounts, AllocatorIdx, AllocatorSet, ArenaNode, ArenaPool},
    repr::{Node, Repr, RowId, Slot},
};

/// Row ids held by each segment of a deprecated leaf chain
pub const DEPRECATED_LEAF_CAPACITY: usize = 4;

#[derive(Debug, Clone)]
pub struct DeprecatedLeaf {
    count: u8,
    row_ids: [RowId; DEPRECATED_LEAF_CAPACITY],
    /// Next segment of the chain, or empty
    next: Node,
}

impl DeprecatedLeaf {
    #[inline]
    pub fn row_ids(&self) -> &[RowId] {
        &self.row_ids[..self.count as usize]
    }

    /// Builds a chain holding `row_ids`, in order.
    pub fn from_rows(pool: &mut ArenaPool, row_ids: &[RowId]) -> Result<Node, Error> {
        let mut next = Node::EMPTY;
        for chunk in row_ids.chunks(DEPRECATED_LEAF_CAPACITY).rev() {
            let mut segment = DeprecatedLeaf {
                count: chunk.len() as u8,
                row_ids: [0; DEPRECATED_LEAF_CAPACITY],
                next,
            };
            segment.row_ids[..chunk.len()].copy_from_slice(chunk);
            match pool.alloc(segment) {
                Ok(slot) => next = Repr::LeafDeprecated(slot).into(),
                Err(e) => {
                    next.free(pool);
                    return Err(e);
                }
            }
        }
        Ok(next)
    }

    fn segments(
        pool: &ArenaPool,
        slot: Slot<Self>,
    ) -> impl Iterator<Item = (Slot<Self>, &Self)> + '_ {
        let mut next = Some(slot);
        std::iter::from_fn(move || {
            let current = next?;
            let segment = pool.get(current);
            next = match segment.next.repr() {
                Repr::LeafDeprecated(s) => Some(s),
                _ => None,
            };
            Some((current, segment))
        })
    }

    pub fn free_chain(pool: &mut ArenaPool, slot: Slot<Self>) {
        let mut next = Some(slot);
        while let Some(current) = next {
            next = match pool.free(current).next.repr() {
                Repr::LeafDeprecated(s) => Some(s),
                _ => None,
            };
        }
    }

    pub fn contains(pool: &ArenaPool, slot: Slot<Self>, row_id: RowId) -> bool {
        Self::segments(pool, slot).any(|(_, s)| s.row_ids().contains(&row_id))
    }

    /// Appends the row ids of the chain to `out`, in storage order.
    pub fn collect(pool: &ArenaPool, slot: Slot<Self>, out: &mut Vec<RowId>) {
        for (_, segment) in Self::segments(pool, slot) {
            out.extend_from_slice(segment.row_ids());
        }
    }

    pub fn count_chain(pool: &ArenaPool, slot: Slot<Self>, counts: &mut AllocationCounts) {
        counts[Self::IDX.index()] += Self::segments(pool, slot).count();
    }

    /// Relocates the segments of the chain living in evacuated buffers.
    /// Returns the (possibly new) head of the chain.
    pub fn vacuum(
        pool: &mut ArenaPool,
        set: &AllocatorSet,
        slot: Slot<Self>,
    ) -> Result<Slot<Self>, Error> {
        if !set.contains(AllocatorIdx::LeafDeprecated) {
            return Ok(slot);
        }
        let relocate = |pool: &mut ArenaPool, s: Slot<Self>| {
            if pool.needs_vacuum(s) {
                pool.relocate(s)
            } else {
                Ok(s)
            }
        };
        let head = relocate(pool, slot)?;
        let mut current = head;
        while let Repr::LeafDeprecated(next) = pool.get(current).next.repr() {
            let next = relocate(pool, next)?;
            pool.get_mut(current).next = Repr::LeafDeprecated(next).into();
            current = next;
        }
        Ok(head)
    }

    /// Verifies the chain, returning its dump.
    pub fn verify_chain(pool: &ArenaPool, slot: Slot<Self>) -> Result<String, Error> {
        let mut rows = String::new();
        let mut count = 0;
        for (s, segment) in Self::segments(pool, slot) {
            if segment.count == 0 || segment.count as usize > DEPRECATED_LEAF_CAPACITY {
                return Err(error_corrupted!(
                    "Deprecated leaf {s:?} holds {} row ids",
                    segment.count
                ));
            }
            if segment.next.is_gate()
                || !matches!(segment.next.repr(), Repr::Empty | Repr::LeafDeprecated(_))
            {
                return Err(error_corrupted!(
                    "Deprecated leaf {s:?} continues into {:?}",
                    segment.next
                ));
            }
            for row_id in segment.row_ids() {
                rows.push_str(&row_id.to_string());
                rows.push('-');
            }
            count += segment.row_ids().len();
        }
        Ok(format!("Leaf [count: {count}, row ids: {rows}]"))
    }

    /// Builds the inlined leaf or gate holding the row ids of the chain, leaving the chain
    /// untouched.
    pub fn rebuild(pool: &mut ArenaPool, slot: Slot<Self>) -> Result<Node, Error> {
        let mut rows = Vec::new();
        Self::collect(pool, slot, &mut rows);
        let mut new = Node::EMPTY;
        for row_id in rows {
            if let Err(e) = leaf::insert_row(pool, &mut new, row_id) {
                new.free(pool);
                return Err(e);
            }
        }
        Ok(new)
    }

    /// Converts the deprecated leaf `node` into an inlined leaf or a gate.
    /// The chain is only freed once the replacement is complete.
    pub fn migrate(pool: &mut ArenaPool, node: Node) -> Result<Node, Error> {
        let Repr::LeafDeprecated(slot) = node.repr() else {
            panic!("Migrating {node:?} which isn't a deprecated leaf");
        };
        let new = Self::rebuild(pool, slot)?;
        Self::free_chain(pool, slot);
        trace!("Deprecated leaf {slot:?} migrated into {new:?}");
        Ok(new)
    }
}

/// Applies `convert` to every leaf position under `node`, storing the results in place.
/// Conversions are atomic, an error leaves a valid tree with part of its leaves converted.
fn transform_leaves(
    pool: &mut ArenaPool,
    node: Node,
    convert: &mut impl FnMut(&mut ArenaPool, Node) -> Result<Node, Error>,
) -> Result<Node, Error> {
    if node.is_gate() {
        return convert(pool, node);
    }
    match node.repr() {
        Repr::LeafInlined(_) | Repr::LeafDeprecated(_) => convert(pool, node),
        Repr::Prefix(mut s) => {
            let mut child = pool.get(s).child;
            while let (Repr::Prefix(next), false) = (child.repr(), child.is_gate()) {
                s = next;
                child = pool.get(s).child;
            }
            let new = transform_leaves(pool, child, convert)?;
            pool.get_mut(s).child = new;
            Ok(node)
        }
        Repr::Node4(_) | Repr::Node16(_) | Repr::Node48(_) | Repr::Node256(_) => {
            let mut next = Some(0);
            while let Some((byte, child)) = next.and_then(|b| node.get_next_child(pool, b)) {
                let new = transform_leaves(pool, child, convert)?;
                if new != child {
                    node.replace_child(pool, byte, new);
                }
                next = byte.checked_add(1);
            }
            Ok(node)
        }
        _ => Ok(node),
    }
}

/// Rewrites every gate under `node` into a deprecated leaf chain.
pub fn transform_to_deprecated(pool: &mut ArenaPool, node: Node) -> Result<Node, Error> {
    transform_leaves(pool, node, &mut |pool, leaf_node| {
        if !leaf_node.is_gate() {
            return Ok(leaf_node);
        }
        let mut rows = Vec::new();
        leaf::collect_rows(pool, leaf_node, &mut rows);
        let new = DeprecatedLeaf::from_rows(pool, &rows)?;
        let mut old = leaf_node;
        old.free(pool);
        Ok(new)
    })
}

/// Migrates every deprecated leaf chain under `node` into the current format.
pub fn transform_from_deprecated(pool: &mut ArenaPool, node: Node) -> Result<Node, Error> {
    transform_leaves(pool, node, &mut |pool, leaf_node| match leaf_node.repr() {
        Repr::LeafDeprecated(_) if !leaf_node.is_gate() => DeprecatedLeaf::migrate(pool, leaf_node),
        _ => Ok(leaf_node),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ArtOptions;

    fn pool() -> ArenaPool {
        let mut opts = ArtOptions::default();
        opts.buffer_size = 4 * std::mem::size_of::<Option<DeprecatedLeaf>>();
        ArenaPool::new(&opts)
    }

    #[test]
    fn test_chain() {
        let mut pool = pool();
        let rows = [9, 3, 7, 1, 5, 2, 8, 4, 6];
        let node = DeprecatedLeaf::from_rows(&mut pool, &rows).unwrap();
        let Repr::LeafDeprecated(slot) = node.repr() else {
            panic!()
        };
        assert_eq!(pool.live(AllocatorIdx::LeafDeprecated), 3);
        let mut out = Vec::new();
        DeprecatedLeaf::collect(&pool, slot, &mut out);
        assert_eq!(out, rows);
        assert!(DeprecatedLeaf::contains(&pool, slot, 6));
        assert!(!DeprecatedLeaf::contains(&pool, slot, 10));
        assert_eq!(
            node.verify_and_to_string(&pool, false).unwrap(),
            "Leaf [count: 9, row ids: 9-3-7-1-5-2-8-4-6-]"
        );
        let mut counts = AllocationCounts::default();
        node.verify_allocations(&pool, &mut counts);
        assert_eq!(counts, pool.live_counts());

        let mut sorted = Vec::new();
        leaf::collect_rows(&pool, node, &mut sorted);
        assert_eq!(sorted, (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn test_migrate() {
        let mut pool = pool();
        let node = DeprecatedLeaf::from_rows(&mut pool, &[3, 1, 2]).unwrap();
        let gate = DeprecatedLeaf::migrate(&mut pool, node).unwrap();
        assert!(gate.is_gate());
        assert_eq!(pool.live(AllocatorIdx::LeafDeprecated), 0);
        assert_eq!(
            gate.verify_and_to_string(&pool, false).unwrap(),
            "Gate [Prefix: |128-0-0-0-0-0-0-| Leaf Node7: [1-2-3-]]"
        );

        let single = DeprecatedLeaf::from_rows(&mut pool, &[5]).unwrap();
        assert_eq!(DeprecatedLeaf::migrate(&mut pool, single).unwrap(), Node::leaf(5));
    }

    #[test]
    fn test_insert_and_delete_migrate() {
        let mut pool = pool();
        let mut node = DeprecatedLeaf::from_rows(&mut pool, &[10, 20]).unwrap();
        assert!(!leaf::delete_row(&mut pool, &mut node, 30).unwrap());
        assert_eq!(node.ntype(), Some(crate::repr::NType::LeafDeprecated));
        assert!(leaf::delete_row(&mut pool, &mut node, 10).unwrap());
        assert_eq!(node, Node::leaf(20));

        let mut node = DeprecatedLeaf::from_rows(&mut pool, &[10, 20]).unwrap();
        assert!(!leaf::insert_row(&mut pool, &mut node, 20).unwrap());
        assert!(node.is_gate());
        assert!(leaf::insert_row(&mut pool, &mut node, 30).unwrap());
        let mut rows = Vec::new();
        leaf::collect_rows(&pool, node, &mut rows);
        assert_eq!(rows, vec![10, 20, 30]);
        node.free(&mut pool);
        assert_eq!(pool.live_counts(), [0; 10]);
    }

    #[test]
    fn test_migrate_out_of_memory() {
        // the migrated gate fits, but not the room reserved for the following update
        let mut opts = ArtOptions::default();
        opts.buffer_size = 3 * std::mem::size_of::<Option<crate::prefix::Prefix>>();
        opts.max_buffers_per_allocator = Some(1);
        let mut pool = ArenaPool::new(&opts);
        let mut node = DeprecatedLeaf::from_rows(&mut pool, &[3, 1, 2]).unwrap();
        let dump = node.verify_and_to_string(&pool, false).unwrap();
        let live = pool.live_counts();

        let err = leaf::insert_row(&mut pool, &mut node, 4).unwrap_err();
        assert!(err.is_out_of_memory(), "{err}");
        assert_eq!(node.verify_and_to_string(&pool, false).unwrap(), dump);
        assert_eq!(pool.live_counts(), live);

        let err = leaf::delete_row(&mut pool, &mut node, 2).unwrap_err();
        assert!(err.is_out_of_memory(), "{err}");
        assert_eq!(node.verify_and_to_string(&pool, false).unwrap(), dump);
        assert_eq!(pool.live_counts(), live);
        pool.validate().unwrap();
    }

    #[test]
    fn test_vacuum_chain() {
        let mut pool = pool();
        // 3 segments per chain, 4 slots per buffer
        let mut chains = (0..5)
            .map(|c| {
                let rows = (c * 100..c * 100 + 12).collect::<Vec<_>>();
                DeprecatedLeaf::from_rows(&mut pool, &rows).unwrap()
            })
            .collect::<Vec<_>>();
        for c in [0, 2, 3] {
            chains[c].free(&mut pool);
        }
        let kept = [chains[1], chains[4]];
        let before = kept.map(|n| n.verify_and_to_string(&pool, false).unwrap());
        let set = pool.initialize_vacuum(0.1);
        assert!(set.contains(AllocatorIdx::LeafDeprecated));
        let after = kept.map(|n| n.vacuum(&mut pool, &set).unwrap());
        pool.finalize_vacuum(set).unwrap();
        for (node, dump) in after.iter().zip(before) {
            assert_eq!(node.verify_and_to_string(&pool, false).unwrap(), dump);
        }
        assert_eq!(pool.stats()[AllocatorIdx::LeafDeprecated.index()].buffers, 2);
        assert_eq!(pool.live(AllocatorIdx::LeafDeprecated), 6);
        pool.validate().unwrap();
    }
}
