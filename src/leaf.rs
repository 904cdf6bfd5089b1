//! Row id sets of a single key.
//!
//! A key with a single row id ends in an inlined leaf. Once a second row id is added the
//! leaf becomes a gate: the root of a nested tree keyed by [row_key]. The nested tree is
//! kept in a canonical form so that a subtree holding a single row id is always an
//! [InlinedPrefix] with the rest of its key:
//! - inner nodes sit at depths 0 to 6, leaf byte nodes at depth 7
//! - prefixes never reach the last byte and never lead to an inlined prefix
//!
//! The nested functions operate on the gate root with its gate flag stripped.

use crate::{
    error::{error_corrupted, Error},
    inner::{InnerNode, Node4},
    key::{row_id_from_key, row_key, RowKey, ROW_KEY_LEN},
    legacy::DeprecatedLeaf,
    pool::ArenaPool,
    prefix::{ChainBytes, InlinedPrefix, Prefix},
    repr::{NType, Node, Repr, RowId, Slot},
    utils::common_prefix_len,
};

/// Builds the nested subtree at `depth` holding two distinct row key tails.
fn two_rows(pool: &mut ArenaPool, depth: usize, a: &[u8], b: &[u8]) -> Result<Node, Error> {
    debug_assert_eq!(depth + a.len(), ROW_KEY_LEN);
    debug_assert_eq!(a.len(), b.len());
    let m = common_prefix_len(a, b);
    debug_assert!(m < a.len());

    let mut branch = if depth + m == ROW_KEY_LEN - 1 {
        let mut node = Node::new(pool, NType::Node7Leaf)?;
        for byte in [a[m], b[m]] {
            if let Err(e) = node.insert_byte(pool, byte) {
                node.free(pool);
                return Err(e);
            }
        }
        node
    } else {
        let a_tail = InlinedPrefix::alloc(pool, &a[m + 1..])?;
        let b_tail = match InlinedPrefix::alloc(pool, &b[m + 1..]) {
            Ok(n) => n,
            Err(e) => {
                free_all(pool, [a_tail]);
                return Err(e);
            }
        };
        let node4 = Node4::from_entries([(a[m], a_tail), (b[m], b_tail)]);
        match pool.alloc(node4) {
            Ok(s) => Repr::Node4(s).into(),
            Err(e) => {
                free_all(pool, [a_tail, b_tail]);
                return Err(e);
            }
        }
    };
    match Prefix::new_chain(pool, &a[..m], branch, false) {
        Ok(node) => Ok(node),
        Err(e) => {
            branch.free(pool);
            Err(e)
        }
    }
}

fn free_all<const N: usize>(pool: &mut ArenaPool, nodes: [Node; N]) {
    for mut node in nodes {
        node.free(pool);
    }
}

/// Inserts `key` into the nested subtree `node` at `depth`.
/// Returns the node replacing `node` and whether the key was inserted.
/// On error the subtree is left unchanged.
fn insert_nested(
    pool: &mut ArenaPool,
    node: Node,
    key: &RowKey,
    depth: usize,
) -> Result<(Node, bool), Error> {
    match node.repr() {
        Repr::PrefixInlined(s) => {
            let existing = InlinedPrefix::new(pool.get(s).bytes());
            if existing.bytes() == &key[depth..] {
                return Ok((node, false));
            }
            let new = two_rows(pool, depth, existing.bytes(), &key[depth..])?;
            pool.free(s);
            Ok((new, true))
        }
        Repr::Prefix(s) => {
            let segment = pool.get(s);
            let (count, child) = (segment.count(), segment.child);
            let m = segment.mismatch(&key[depth..]);
            if m == count {
                let (new_child, inserted) = insert_nested(pool, child, key, depth + count)?;
                if new_child != child {
                    pool.get_mut(s).child = new_child;
                }
                return Ok((node, inserted));
            }
            let mut tail = InlinedPrefix::alloc(pool, &key[depth + m + 1..])?;
            match Prefix::branch(pool, node, m, key[depth + m], tail) {
                Ok(new) => Ok((new, true)),
                Err(e) => {
                    tail.free(pool);
                    Err(e)
                }
            }
        }
        Repr::Node4(_) | Repr::Node16(_) | Repr::Node48(_) | Repr::Node256(_) => {
            let byte = key[depth];
            if let Some(child) = node.get_child(pool, byte) {
                let (new_child, inserted) = insert_nested(pool, child, key, depth + 1)?;
                if new_child != child {
                    node.replace_child(pool, byte, new_child);
                }
                return Ok((node, inserted));
            }
            let mut tail = InlinedPrefix::alloc(pool, &key[depth + 1..])?;
            let mut new = node;
            if let Err(e) = new.insert_child(pool, byte, tail) {
                tail.free(pool);
                return Err(e);
            }
            Ok((new, true))
        }
        Repr::Node7Leaf(_) | Repr::Node15Leaf(_) | Repr::Node256Leaf(_) => {
            debug_assert_eq!(depth, ROW_KEY_LEN - 1);
            let mut new = node;
            let inserted = new.insert_byte(pool, key[depth])?;
            Ok((new, inserted))
        }
        _ => Err(error_corrupted!("Unexpected {node:?} at depth {depth} of a gate")),
    }
}

/// Deletes `key` from the nested subtree `node` at `depth`.
/// Returns `None` if the key isn't present, otherwise the node replacing `node`,
/// which is empty once the subtree held no other key.
fn delete_nested(
    pool: &mut ArenaPool,
    node: Node,
    key: &RowKey,
    depth: usize,
) -> Result<Option<Node>, Error> {
    match node.repr() {
        Repr::PrefixInlined(s) => {
            if pool.get(s).bytes() != &key[depth..] {
                return Ok(None);
            }
            pool.free(s);
            Ok(Some(Node::EMPTY))
        }
        Repr::Prefix(s) => {
            let segment = pool.get(s);
            let (count, child) = (segment.count(), segment.child);
            if segment.mismatch(&key[depth..]) != count {
                return Ok(None);
            }
            let Some(new_child) = delete_nested(pool, child, key, depth + count)? else {
                return Ok(None);
            };
            if new_child.is_empty() {
                pool.free(s);
                return Ok(Some(Node::EMPTY));
            }
            pool.get_mut(s).child = new_child;
            compact(pool, node).map(Some)
        }
        Repr::Node4(_) | Repr::Node16(_) | Repr::Node48(_) | Repr::Node256(_) => {
            let byte = key[depth];
            let Some(child) = node.get_child(pool, byte) else {
                return Ok(None);
            };
            let Some(new_child) = delete_nested(pool, child, key, depth + 1)? else {
                return Ok(None);
            };
            let mut new = node;
            if new_child.is_empty() {
                new.delete_child(pool, byte)?;
            } else if new_child != child {
                new.replace_child(pool, byte, new_child);
            }
            compact(pool, new).map(Some)
        }
        Repr::Node7Leaf(_) | Repr::Node15Leaf(_) | Repr::Node256Leaf(_) => {
            let mut new = node;
            if !new.delete_byte(pool, key[depth])? {
                return Ok(None);
            }
            compact(pool, new).map(Some)
        }
        _ => Err(error_corrupted!("Unexpected {node:?} at depth {depth} of a gate")),
    }
}

/// Restores the canonical form of a nested node after one of its children changed.
fn compact(pool: &mut ArenaPool, node: Node) -> Result<Node, Error> {
    match node.repr() {
        Repr::Prefix(s) => {
            let (bytes, end, segments) = Prefix::chain(pool, node);
            if let Repr::PrefixInlined(tail) = end.repr() {
                let mut merged = bytes;
                merged.extend_from_slice(pool.get(tail).bytes());
                let new = InlinedPrefix::alloc(pool, &merged)?;
                for slot in segments {
                    pool.free(slot);
                }
                pool.free(tail);
                return Ok(new);
            }
            let segment = pool.get(s);
            if segment.count() < pool.prefix_count() && matches!(segment.child.repr(), Repr::Prefix(_))
            {
                return Prefix::normalize(pool, node);
            }
            Ok(node)
        }
        Repr::Node7Leaf(_) | Repr::Node15Leaf(_) | Repr::Node256Leaf(_) if node.count(pool) == 1 => {
            let Some(byte) = node.get_next_byte(pool, 0) else {
                unreachable!()
            };
            let new = InlinedPrefix::alloc(pool, &[byte])?;
            let mut old = node;
            old.free(pool);
            Ok(new)
        }
        _ => Ok(node),
    }
}

/// Applies `op` to the current format rebuild of the deprecated leaf `slot` at `leaf`.
/// `leaf` is only replaced, and the chain freed, if `op` succeeds.
fn migrated<R>(
    pool: &mut ArenaPool,
    leaf: &mut Node,
    slot: Slot<DeprecatedLeaf>,
    op: impl FnOnce(&mut ArenaPool, &mut Node) -> Result<R, Error>,
) -> Result<R, Error> {
    let mut new = DeprecatedLeaf::rebuild(pool, slot)?;
    let result = match pool.reserve_update(0) {
        Ok(()) => op(pool, &mut new),
        Err(e) => Err(e),
    };
    match result {
        Ok(r) => {
            DeprecatedLeaf::free_chain(pool, slot);
            trace!("Deprecated leaf {slot:?} migrated into {new:?}");
            *leaf = new;
            Ok(r)
        }
        Err(e) => {
            new.free(pool);
            Err(e)
        }
    }
}

/// Adds `row_id` to the row id set at the leaf position `leaf`.
/// Returns false if it was already present.
pub fn insert_row(pool: &mut ArenaPool, leaf: &mut Node, row_id: RowId) -> Result<bool, Error> {
    if leaf.is_gate() {
        let key = row_key(row_id);
        let (new, inserted) = insert_nested(pool, leaf.with_gate(false), &key, 0)?;
        *leaf = new.with_gate(true);
        return Ok(inserted);
    }
    match leaf.repr() {
        Repr::Empty => {
            *leaf = Node::leaf(row_id);
            Ok(true)
        }
        Repr::LeafInlined(existing) => {
            if existing == row_id {
                return Ok(false);
            }
            let gate = two_rows(pool, 0, &row_key(existing), &row_key(row_id))?;
            trace!("Inlined leaf {existing} turned into a gate {gate:?}");
            *leaf = gate.with_gate(true);
            Ok(true)
        }
        Repr::LeafDeprecated(s) => migrated(pool, leaf, s, |pool, new| insert_row(pool, new, row_id)),
        _ => Err(error_corrupted!("Unexpected {leaf:?} at a leaf position")),
    }
}

/// Removes `row_id` from the row id set at the leaf position `leaf`.
/// A gate left with a single row id turns back into an inlined leaf, an emptied set
/// leaves `leaf` empty. Returns false if the row id wasn't present.
pub fn delete_row(pool: &mut ArenaPool, leaf: &mut Node, row_id: RowId) -> Result<bool, Error> {
    if leaf.is_gate() {
        let key = row_key(row_id);
        let Some(new) = delete_nested(pool, leaf.with_gate(false), &key, 0)? else {
            return Ok(false);
        };
        *leaf = match new.repr() {
            Repr::Empty => Node::EMPTY,
            Repr::PrefixInlined(s) => {
                let last = row_id_from_key(pool.get(s).bytes());
                pool.free(s);
                trace!("Gate reduced to the inlined leaf {last}");
                Node::leaf(last)
            }
            _ => new.with_gate(true),
        };
        return Ok(true);
    }
    match leaf.repr() {
        Repr::Empty => Ok(false),
        Repr::LeafInlined(existing) => {
            if existing != row_id {
                return Ok(false);
            }
            leaf.clear();
            Ok(true)
        }
        Repr::LeafDeprecated(s) => {
            if !DeprecatedLeaf::contains(pool, s, row_id) {
                return Ok(false);
            }
            migrated(pool, leaf, s, |pool, new| delete_row(pool, new, row_id))
        }
        _ => Err(error_corrupted!("Unexpected {leaf:?} at a leaf position")),
    }
}

pub fn contains_row(pool: &ArenaPool, leaf: Node, row_id: RowId) -> bool {
    if !leaf.is_gate() {
        return match leaf.repr() {
            Repr::LeafInlined(existing) => existing == row_id,
            Repr::LeafDeprecated(s) => DeprecatedLeaf::contains(pool, s, row_id),
            _ => false,
        };
    }
    let key = row_key(row_id);
    let mut node = leaf.with_gate(false);
    let mut depth = 0;
    loop {
        match node.repr() {
            Repr::PrefixInlined(s) => return pool.get(s).bytes() == &key[depth..],
            Repr::Prefix(_) => match Prefix::traverse(pool, node, &key, &mut depth) {
                Some(next) => node = next,
                None => return false,
            },
            Repr::Node4(_) | Repr::Node16(_) | Repr::Node48(_) | Repr::Node256(_) => {
                match node.get_child(pool, key[depth]) {
                    Some(child) => {
                        node = child;
                        depth += 1;
                    }
                    None => return false,
                }
            }
            Repr::Node7Leaf(_) | Repr::Node15Leaf(_) | Repr::Node256Leaf(_) => {
                return depth == ROW_KEY_LEN - 1 && node.has_byte(pool, key[depth])
            }
            _ => return false,
        }
    }
}

/// Appends the row ids of the set at the leaf position `leaf` to `out`, in ascending order.
pub fn collect_rows(pool: &ArenaPool, leaf: Node, out: &mut Vec<RowId>) {
    if leaf.is_gate() {
        let mut path = ChainBytes::new();
        collect_nested(pool, leaf.with_gate(false), &mut path, out);
        return;
    }
    match leaf.repr() {
        Repr::LeafInlined(row_id) => out.push(row_id),
        Repr::LeafDeprecated(s) => {
            let start = out.len();
            DeprecatedLeaf::collect(pool, s, out);
            out[start..].sort_unstable();
        }
        _ => (),
    }
}

fn collect_nested(pool: &ArenaPool, node: Node, path: &mut ChainBytes, out: &mut Vec<RowId>) {
    let depth = path.len();
    match node.repr() {
        Repr::PrefixInlined(s) => {
            path.extend_from_slice(pool.get(s).bytes());
            out.push(row_id_from_key(path));
        }
        Repr::Prefix(s) => {
            let segment = pool.get(s);
            path.extend_from_slice(segment.bytes());
            collect_nested(pool, segment.child, path, out);
        }
        Repr::Node4(_) | Repr::Node16(_) | Repr::Node48(_) | Repr::Node256(_) => {
            let mut next = Some(0);
            while let Some((byte, child)) = next.and_then(|b| node.get_next_child(pool, b)) {
                path.push(byte);
                collect_nested(pool, child, path, out);
                path.truncate(depth);
                next = byte.checked_add(1);
            }
        }
        Repr::Node7Leaf(_) | Repr::Node15Leaf(_) | Repr::Node256Leaf(_) => {
            let mut next = Some(0);
            while let Some(byte) = next.and_then(|b| node.get_next_byte(pool, b)) {
                path.push(byte);
                out.push(row_id_from_key(path));
                path.truncate(depth);
                next = byte.checked_add(1);
            }
        }
        _ => (),
    }
    path.truncate(depth);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{options::ArtOptions, pool::AllocationCounts, tests::get_rng};
    use rand::prelude::*;
    use std::collections::BTreeSet;

    fn pool() -> ArenaPool {
        let mut opts = ArtOptions::default();
        opts.buffer_size = 4096;
        ArenaPool::new(&opts)
    }

    fn check(pool: &ArenaPool, leaf: Node, expected: &BTreeSet<RowId>) {
        let mut rows = Vec::new();
        collect_rows(pool, leaf, &mut rows);
        assert_eq!(rows, expected.iter().copied().collect::<Vec<_>>());
        for &row in expected {
            assert!(contains_row(pool, leaf, row));
        }
        let mut counts = AllocationCounts::default();
        leaf.verify_allocations(pool, &mut counts);
        assert_eq!(counts, pool.live_counts());
        match expected.len() {
            0 => assert!(leaf.is_empty()),
            1 => assert_eq!(leaf.ntype(), Some(NType::LeafInlined)),
            _ => {
                assert!(leaf.is_gate());
                leaf.verify_and_to_string(pool, true).unwrap();
            }
        }
    }

    #[test]
    fn test_two_rows() {
        let mut pool = pool();
        let mut leaf = Node::EMPTY;
        assert!(insert_row(&mut pool, &mut leaf, 1).unwrap());
        assert!(!insert_row(&mut pool, &mut leaf, 1).unwrap());
        assert_eq!(leaf, Node::leaf(1));
        assert!(insert_row(&mut pool, &mut leaf, 2).unwrap());
        assert_eq!(
            leaf.verify_and_to_string(&pool, false).unwrap(),
            "Gate [Prefix: |128-0-0-0-0-0-0-| Leaf Node7: [1-2-]]"
        );
        assert!(insert_row(&mut pool, &mut leaf, 1 << 20).unwrap());
        assert_eq!(
            leaf.verify_and_to_string(&pool, false).unwrap(),
            "Gate [Prefix: |128-0-0-0-0-| Node4: [(0, Prefix: |0-| Leaf Node7: [1-2-]), \
             (16, Inlined Prefix: |0-0-|)]]"
        );
        assert!(delete_row(&mut pool, &mut leaf, 1).unwrap());
        assert!(!delete_row(&mut pool, &mut leaf, 1).unwrap());
        assert_eq!(
            leaf.verify_and_to_string(&pool, false).unwrap(),
            "Gate [Prefix: |128-0-0-0-0-| Node4: [(0, Inlined Prefix: |0-2-|), \
             (16, Inlined Prefix: |0-0-|)]]"
        );
        assert!(delete_row(&mut pool, &mut leaf, 1 << 20).unwrap());
        assert_eq!(leaf, Node::leaf(2));
        assert_eq!(pool.live_counts(), [0; 10]);
        assert!(delete_row(&mut pool, &mut leaf, 2).unwrap());
        assert!(leaf.is_empty());
    }

    #[test]
    fn test_leaf_byte_tiers_in_gate() {
        let mut pool = pool();
        let mut leaf = Node::EMPTY;
        let mut expected = BTreeSet::new();
        for row in 0..300 {
            assert!(insert_row(&mut pool, &mut leaf, row).unwrap());
            expected.insert(row);
        }
        check(&pool, leaf, &expected);
        for row in (0..300).rev() {
            assert!(delete_row(&mut pool, &mut leaf, row).unwrap());
            expected.remove(&row);
            check(&pool, leaf, &expected);
        }
        assert_eq!(pool.live_counts(), [0; 10]);
    }

    #[test]
    fn test_randomized_rows() {
        let mut rng = get_rng();
        let mut pool = pool();
        let mut leaf = Node::EMPTY;
        let mut expected = BTreeSet::new();
        for _ in 0..2000 {
            let row = match rng.random_range(0..3) {
                0 => rng.random_range(-1000..1000),
                1 => rng.random::<i64>(),
                _ => rng.random_range(0..16i64) << rng.random_range(0..60u32),
            };
            if rng.random_bool(0.6) {
                assert_eq!(
                    insert_row(&mut pool, &mut leaf, row).unwrap(),
                    expected.insert(row)
                );
            } else {
                assert_eq!(
                    delete_row(&mut pool, &mut leaf, row).unwrap(),
                    expected.remove(&row)
                );
            }
            assert_eq!(contains_row(&pool, leaf, row), expected.contains(&row));
        }
        check(&pool, leaf, &expected);
        leaf.free(&mut pool);
        assert_eq!(pool.live_counts(), [0; 10]);
    }

    #[test]
    fn test_small_prefix_segments() {
        let mut opts = ArtOptions::default();
        opts.prefix_count = 2;
        let mut pool = ArenaPool::new(&opts);
        let mut leaf = Node::EMPTY;
        let mut expected = BTreeSet::new();
        for row in [7, 1 << 8, 1 << 30, 5, 1 << 31] {
            insert_row(&mut pool, &mut leaf, row).unwrap();
            expected.insert(row);
            check(&pool, leaf, &expected);
        }
        for row in [1 << 30, 7, 1 << 31, 5] {
            delete_row(&mut pool, &mut leaf, row).unwrap();
            expected.remove(&row);
            check(&pool, leaf, &expected);
        }
    }
}
