//! Inner nodes, mapping key bytes to child nodes.

use crate::{
    pool::ArenaNode,
    repr::{NType, Node, Repr, Slot},
};

/// Common contract of the inner node shapes.
///
/// Entries are unique bytes with non empty children, iterated in ascending byte order.
pub trait InnerNode: ArenaNode + Default + Clone {
    const NTYPE: NType;
    const CAPACITY: usize;

    fn wrap(slot: Slot<Self>) -> Repr;

    fn count(&self) -> usize;

    #[inline]
    fn is_full(&self) -> bool {
        self.count() == Self::CAPACITY
    }

    fn get_child(&self, byte: u8) -> Option<Node>;

    /// The first child with a byte greater than or equal to `byte`
    fn get_next_child(&self, byte: u8) -> Option<(u8, Node)>;

    /// Inserts a new entry. The node must not be full nor contain `byte`.
    fn insert(&mut self, byte: u8, child: Node);

    fn remove(&mut self, byte: u8) -> Option<Node>;

    /// Overwrites the child of an existing entry
    fn replace(&mut self, byte: u8, child: Node);

    /// Number of child positions, some of which may be empty
    fn positions(&self) -> usize;

    fn child_at(&mut self, pos: usize) -> &mut Node;

    fn entries(&self) -> impl Iterator<Item = (u8, Node)> + '_;

    fn from_entries(entries: impl IntoIterator<Item = (u8, Node)>) -> Self {
        let mut node = Self::default();
        for (byte, child) in entries {
            node.insert(byte, child);
        }
        node
    }
}

/// Inner node with up to `N` entries kept sorted by byte
#[derive(Debug, Clone)]
pub struct SortedNode<const N: usize> {
    count: u8,
    keys: [u8; N],
    children: [Node; N],
}

pub type Node4 = SortedNode<4>;
pub type Node16 = SortedNode<16>;

impl<const N: usize> Default for SortedNode<N> {
    fn default() -> Self {
        Self {
            count: 0,
            keys: [0; N],
            children: [Node::EMPTY; N],
        }
    }
}

impl<const N: usize> SortedNode<N> {
    #[inline]
    fn keys(&self) -> &[u8] {
        &self.keys[..self.count as usize]
    }

    #[inline]
    fn position(&self, byte: u8) -> Result<usize, usize> {
        self.keys().binary_search(&byte)
    }
}

macro_rules! sorted_node {
    ($n:literal, $ntype:ident) => {
        impl InnerNode for SortedNode<$n> {
            const NTYPE: NType = NType::$ntype;
            const CAPACITY: usize = $n;

            #[inline]
            fn wrap(slot: Slot<Self>) -> Repr {
                Repr::$ntype(slot)
            }

            #[inline]
            fn count(&self) -> usize {
                self.count as usize
            }

            fn get_child(&self, byte: u8) -> Option<Node> {
                self.position(byte).ok().map(|i| self.children[i])
            }

            fn get_next_child(&self, byte: u8) -> Option<(u8, Node)> {
                let i = self.position(byte).unwrap_or_else(|i| i);
                (i < self.count()).then(|| (self.keys[i], self.children[i]))
            }

            fn insert(&mut self, byte: u8, child: Node) {
                assert!(!self.is_full(), "Inserting into a full {:?}", Self::NTYPE);
                debug_assert!(!child.is_empty());
                let Err(i) = self.position(byte) else {
                    panic!("Byte {byte} already in {:?}", Self::NTYPE);
                };
                let count = self.count();
                self.keys.copy_within(i..count, i + 1);
                self.children.copy_within(i..count, i + 1);
                self.keys[i] = byte;
                self.children[i] = child;
                self.count += 1;
            }

            fn remove(&mut self, byte: u8) -> Option<Node> {
                let i = self.position(byte).ok()?;
                let child = self.children[i];
                let count = self.count();
                self.keys.copy_within(i + 1..count, i);
                self.children.copy_within(i + 1..count, i);
                self.count -= 1;
                self.children[count - 1] = Node::EMPTY;
                Some(child)
            }

            fn replace(&mut self, byte: u8, child: Node) {
                let Ok(i) = self.position(byte) else {
                    panic!("Byte {byte} not in {:?}", Self::NTYPE);
                };
                self.children[i] = child;
            }

            #[inline]
            fn positions(&self) -> usize {
                self.count()
            }

            #[inline]
            fn child_at(&mut self, pos: usize) -> &mut Node {
                &mut self.children[pos]
            }

            fn entries(&self) -> impl Iterator<Item = (u8, Node)> + '_ {
                self.keys()
                    .iter()
                    .copied()
                    .zip(self.children.iter().copied())
            }
        }
    };
}

sorted_node!(4, Node4);
sorted_node!(16, Node16);

const EMPTY_INDEX: u8 = u8::MAX;

/// Inner node indexing up to 48 children through a byte indexed table
#[derive(Debug, Clone)]
pub struct Node48 {
    count: u8,
    child_index: [u8; 256],
    children: [Node; 48],
}

impl Default for Node48 {
    fn default() -> Self {
        Self {
            count: 0,
            child_index: [EMPTY_INDEX; 256],
            children: [Node::EMPTY; 48],
        }
    }
}

impl Node48 {
    /// Checks that the index and the children agree
    pub fn is_consistent(&self) -> bool {
        let mut seen = [false; 48];
        let mut indexed = 0;
        for &i in &self.child_index {
            if i == EMPTY_INDEX {
                continue;
            }
            let Some(s) = seen.get_mut(i as usize) else {
                return false;
            };
            if *s || self.children[i as usize].is_empty() {
                return false;
            }
            *s = true;
            indexed += 1;
        }
        let populated = self.children.iter().filter(|c| !c.is_empty()).count();
        indexed == self.count as usize && populated == indexed
    }
}

impl InnerNode for Node48 {
    const NTYPE: NType = NType::Node48;
    const CAPACITY: usize = 48;

    #[inline]
    fn wrap(slot: Slot<Self>) -> Repr {
        Repr::Node48(slot)
    }

    #[inline]
    fn count(&self) -> usize {
        self.count as usize
    }

    #[inline]
    fn get_child(&self, byte: u8) -> Option<Node> {
        let i = self.child_index[byte as usize];
        (i != EMPTY_INDEX).then(|| self.children[i as usize])
    }

    fn get_next_child(&self, byte: u8) -> Option<(u8, Node)> {
        (byte..=u8::MAX).find_map(|b| Some((b, self.get_child(b)?)))
    }

    fn insert(&mut self, byte: u8, child: Node) {
        assert!(!self.is_full(), "Inserting into a full Node48");
        debug_assert!(!child.is_empty());
        assert_eq!(
            self.child_index[byte as usize], EMPTY_INDEX,
            "Byte {byte} already in Node48"
        );
        let Some(free) = self.children.iter().position(Node::is_empty) else {
            panic!("Node48 has no free child position");
        };
        self.children[free] = child;
        self.child_index[byte as usize] = free as u8;
        self.count += 1;
    }

    fn remove(&mut self, byte: u8) -> Option<Node> {
        let i = self.child_index[byte as usize];
        if i == EMPTY_INDEX {
            return None;
        }
        self.child_index[byte as usize] = EMPTY_INDEX;
        self.count -= 1;
        Some(std::mem::take(&mut self.children[i as usize]))
    }

    fn replace(&mut self, byte: u8, child: Node) {
        let i = self.child_index[byte as usize];
        assert_ne!(i, EMPTY_INDEX, "Byte {byte} not in Node48");
        self.children[i as usize] = child;
    }

    #[inline]
    fn positions(&self) -> usize {
        self.children.len()
    }

    #[inline]
    fn child_at(&mut self, pos: usize) -> &mut Node {
        &mut self.children[pos]
    }

    fn entries(&self) -> impl Iterator<Item = (u8, Node)> + '_ {
        (0..=u8::MAX).filter_map(|b| Some((b, self.get_child(b)?)))
    }
}

/// Inner node with a child position for every byte
#[derive(Debug, Clone)]
pub struct Node256 {
    count: u16,
    children: [Node; 256],
}

impl Default for Node256 {
    fn default() -> Self {
        Self {
            count: 0,
            children: [Node::EMPTY; 256],
        }
    }
}

impl InnerNode for Node256 {
    const NTYPE: NType = NType::Node256;
    const CAPACITY: usize = 256;

    #[inline]
    fn wrap(slot: Slot<Self>) -> Repr {
        Repr::Node256(slot)
    }

    #[inline]
    fn count(&self) -> usize {
        self.count as usize
    }

    #[inline]
    fn get_child(&self, byte: u8) -> Option<Node> {
        let child = self.children[byte as usize];
        (!child.is_empty()).then_some(child)
    }

    fn get_next_child(&self, byte: u8) -> Option<(u8, Node)> {
        self.children[byte as usize..]
            .iter()
            .position(|c| !c.is_empty())
            .map(|i| {
                let b = byte as usize + i;
                (b as u8, self.children[b])
            })
    }

    fn insert(&mut self, byte: u8, child: Node) {
        debug_assert!(!child.is_empty());
        assert!(
            self.children[byte as usize].is_empty(),
            "Byte {byte} already in Node256"
        );
        self.children[byte as usize] = child;
        self.count += 1;
    }

    fn remove(&mut self, byte: u8) -> Option<Node> {
        let child = std::mem::take(&mut self.children[byte as usize]);
        if child.is_empty() {
            return None;
        }
        self.count -= 1;
        Some(child)
    }

    fn replace(&mut self, byte: u8, child: Node) {
        assert!(
            !self.children[byte as usize].is_empty(),
            "Byte {byte} not in Node256"
        );
        self.children[byte as usize] = child;
    }

    #[inline]
    fn positions(&self) -> usize {
        self.children.len()
    }

    #[inline]
    fn child_at(&mut self, pos: usize) -> &mut Node {
        &mut self.children[pos]
    }

    fn entries(&self) -> impl Iterator<Item = (u8, Node)> + '_ {
        self.children
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_empty())
            .map(|(b, c)| (b as u8, *c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn check<T: InnerNode>(bytes: &[u8]) {
        let mut node = T::default();
        let mut expected = BTreeMap::new();
        for (i, &b) in bytes.iter().enumerate().take(T::CAPACITY) {
            if expected.contains_key(&b) {
                continue;
            }
            node.insert(b, Node::leaf(i as i64));
            expected.insert(b, Node::leaf(i as i64));
        }
        assert_eq!(node.count(), expected.len());
        assert_eq!(node.entries().collect::<BTreeMap<_, _>>(), expected);
        // entries come out ascending
        let bytes_out = node.entries().map(|(b, _)| b).collect::<Vec<_>>();
        assert!(bytes_out.windows(2).all(|w| w[0] < w[1]));
        // walking with get_next_child sees the same entries
        let mut walked = Vec::new();
        let mut cursor = 0u16;
        while cursor <= 255 {
            let Some((b, c)) = node.get_next_child(cursor as u8) else {
                break;
            };
            walked.push((b, c));
            cursor = b as u16 + 1;
        }
        assert_eq!(walked, node.entries().collect::<Vec<_>>());

        for (&b, &c) in expected.iter().step_by(2) {
            assert_eq!(node.remove(b), Some(c));
            assert_eq!(node.get_child(b), None);
        }
        assert_eq!(node.count(), expected.len() / 2);
        for (&b, &c) in expected.iter().skip(1).step_by(2) {
            assert_eq!(node.get_child(b), Some(c));
            node.replace(b, Node::leaf(-1));
        }
        assert!(node.entries().all(|(_, c)| c == Node::leaf(-1)));
    }

    proptest! {
        #[test]
        fn inner_nodes_ordered(bytes in prop::collection::vec(any::<u8>(), 0..300)) {
            check::<Node4>(&bytes);
            check::<Node16>(&bytes);
            check::<Node48>(&bytes);
            check::<Node256>(&bytes);
        }
    }

    #[test]
    fn test_node48_reuses_positions() {
        let mut node = Node48::default();
        for b in 0..48u8 {
            node.insert(b * 5, Node::leaf(b as i64));
        }
        assert!(node.is_full());
        assert!(node.is_consistent());
        node.remove(10);
        node.insert(11, Node::leaf(100));
        assert!(node.is_consistent());
        assert_eq!(node.get_child(11), Some(Node::leaf(100)));
        assert_eq!(node.get_next_child(6), Some((11, Node::leaf(100))));
        assert_eq!(node.get_next_child(236), None);
    }

    #[test]
    #[should_panic]
    fn test_full_node4() {
        let mut node = Node4::from_entries((0..4).map(|b| (b, Node::leaf(b as i64))));
        node.insert(9, Node::leaf(9));
    }
}
