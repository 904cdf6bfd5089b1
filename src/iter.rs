use std::ops::{Bound, RangeBounds};

use smallvec::SmallVec;

use crate::{
    leaf,
    pool::ArenaPool,
    repr::{Node, Repr, RowId},
};

/// An inner node being iterated
#[derive(Debug)]
struct Frame {
    node: Node,
    /// Next byte to visit, `None` once all children were visited
    next: Option<u8>,
    /// Length of the key up to this node
    depth: usize,
}

/// Ascending iterator over the `(key, row id)` pairs of an [crate::Art].
///
/// Row ids of the same key are yielded in ascending order.
pub struct Iter<'a> {
    pool: &'a ArenaPool,
    stack: SmallVec<Frame, 16>,
    key: Vec<u8>,
    rows: Vec<RowId>,
    row_pos: usize,
    end: Bound<Vec<u8>>,
}

impl std::fmt::Debug for Iter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iter")
            .field("key", &crate::utils::EscapedBytes(&self.key))
            .field("stack", &self.stack.len())
            .field("end", &self.end)
            .finish()
    }
}

#[inline]
fn is_leaf_position(node: Node) -> bool {
    node.is_gate() || matches!(node.repr(), Repr::LeafInlined(_) | Repr::LeafDeprecated(_))
}

impl<'a> Iter<'a> {
    pub(crate) fn new<K: AsRef<[u8]>>(
        pool: &'a ArenaPool,
        root: Node,
        bounds: impl RangeBounds<K>,
    ) -> Self {
        let mut iter = Self {
            pool,
            stack: SmallVec::new(),
            key: Vec::new(),
            rows: Vec::new(),
            row_pos: 0,
            end: bounds.end_bound().map(|k| k.as_ref().to_vec()),
        };
        match bounds.start_bound() {
            Bound::Unbounded => iter.descend(root),
            Bound::Included(k) => iter.seek(root, k.as_ref(), true),
            Bound::Excluded(k) => iter.seek(root, k.as_ref(), false),
        }
        iter
    }

    fn past_end(&self) -> bool {
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(end) => self.key.as_slice() > end.as_slice(),
            Bound::Excluded(end) => self.key.as_slice() >= end.as_slice(),
        }
    }

    fn load_leaf(&mut self, node: Node) {
        if self.past_end() {
            self.stack.clear();
            return;
        }
        self.rows.clear();
        self.row_pos = 0;
        leaf::collect_rows(self.pool, node, &mut self.rows);
    }

    /// Walks down to the first leaf of `node`, pushing the inner nodes on the way.
    fn descend(&mut self, mut node: Node) {
        loop {
            if is_leaf_position(node) {
                self.load_leaf(node);
                return;
            }
            match node.repr() {
                Repr::Prefix(s) => {
                    let segment = self.pool.get(s);
                    self.key.extend_from_slice(segment.bytes());
                    node = segment.child;
                }
                Repr::Node4(_) | Repr::Node16(_) | Repr::Node48(_) | Repr::Node256(_) => {
                    self.stack.push(Frame {
                        node,
                        next: Some(0),
                        depth: self.key.len(),
                    });
                    return;
                }
                _ => return,
            }
        }
    }

    /// Positions the iterator at the first key greater than (or equal to if `inclusive`)
    /// `start`.
    fn seek(&mut self, root: Node, start: &[u8], inclusive: bool) {
        let mut node = root;
        loop {
            if node.is_empty() {
                return;
            }
            if is_leaf_position(node) {
                if self.key.as_slice() > start || (inclusive && self.key == start) {
                    self.load_leaf(node);
                }
                return;
            }
            let rest = &start[self.key.len().min(start.len())..];
            match node.repr() {
                Repr::Prefix(s) => {
                    let segment = self.pool.get(s);
                    let bytes = segment.bytes();
                    match bytes.cmp(&rest[..bytes.len().min(rest.len())]) {
                        std::cmp::Ordering::Less => return,
                        std::cmp::Ordering::Equal => {
                            self.key.extend_from_slice(bytes);
                            node = segment.child;
                        }
                        std::cmp::Ordering::Greater => {
                            // every key below is greater than `start`
                            self.key.extend_from_slice(bytes);
                            self.descend(segment.child);
                            return;
                        }
                    }
                }
                Repr::Node4(_) | Repr::Node16(_) | Repr::Node48(_) | Repr::Node256(_) => {
                    let Some(&byte) = rest.first() else {
                        self.descend(node);
                        return;
                    };
                    self.stack.push(Frame {
                        node,
                        next: byte.checked_add(1),
                        depth: self.key.len(),
                    });
                    let Some(child) = node.get_child(self.pool, byte) else {
                        return;
                    };
                    self.key.push(byte);
                    node = child;
                }
                _ => return,
            }
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = (Vec<u8>, RowId);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(&row_id) = self.rows.get(self.row_pos) {
                self.row_pos += 1;
                return Some((self.key.clone(), row_id));
            }
            let frame = self.stack.last_mut()?;
            self.key.truncate(frame.depth);
            match frame.next.and_then(|b| frame.node.get_next_child(self.pool, b)) {
                Some((byte, child)) => {
                    frame.next = byte.checked_add(1);
                    self.key.push(byte);
                    self.rows.clear();
                    self.row_pos = 0;
                    self.descend(child);
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}
