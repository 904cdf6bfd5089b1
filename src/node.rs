//! Structural operations over node handles, dispatched on the node shape.

use std::fmt::Write;

use crate::{
    error::{error_corrupted, Error},
    inner::{InnerNode, Node16, Node256, Node4, Node48},
    key::ROW_KEY_LEN,
    leaf_bytes::{LeafBytes, Node15Leaf, Node256Leaf, Node7Leaf},
    legacy::DeprecatedLeaf,
    pool::{AllocationCounts, AllocatorSet, ArenaNode, ArenaPool},
    prefix::Prefix,
    repr::{NType, Node, Repr, Slot},
    utils::dash_joined,
};

macro_rules! dispatch_inner {
    ($repr:expr, $s:ident => $body:expr, $other:pat => $fallback:expr) => {
        match $repr {
            Repr::Node4($s) => $body,
            Repr::Node16($s) => $body,
            Repr::Node48($s) => $body,
            Repr::Node256($s) => $body,
            $other => $fallback,
        }
    };
}

macro_rules! dispatch_leaf_bytes {
    ($repr:expr, $s:ident => $body:expr, $other:pat => $fallback:expr) => {
        match $repr {
            Repr::Node7Leaf($s) => $body,
            Repr::Node15Leaf($s) => $body,
            Repr::Node256Leaf($s) => $body,
            $other => $fallback,
        }
    };
}

/// Copies the entries of an inner node into a node of another shape, except `skip`.
fn transition<A: InnerNode, B: InnerNode>(
    pool: &mut ArenaPool,
    slot: Slot<A>,
    skip: Option<u8>,
) -> Result<Slot<B>, Error> {
    let new = B::from_entries(pool.get(slot).entries().filter(|&(b, _)| Some(b) != skip));
    let new_slot = pool.alloc(new)?;
    pool.free(slot);
    trace!("{:?} {:?} turned into {:?}", A::NTYPE, slot, B::NTYPE);
    Ok(new_slot)
}

fn transition_bytes<A: LeafBytes, B: LeafBytes>(
    pool: &mut ArenaPool,
    slot: Slot<A>,
    skip: Option<u8>,
) -> Result<Slot<B>, Error> {
    let new = B::from_bytes(pool.get(slot).bytes().filter(|&b| Some(b) != skip));
    let new_slot = pool.alloc(new)?;
    pool.free(slot);
    trace!("{:?} {:?} turned into {:?}", A::NTYPE, slot, B::NTYPE);
    Ok(new_slot)
}

fn insert_or_grow<A: InnerNode, B: InnerNode>(
    pool: &mut ArenaPool,
    slot: Slot<A>,
    byte: u8,
    child: Node,
) -> Result<Repr, Error> {
    if !pool.get(slot).is_full() {
        pool.get_mut(slot).insert(byte, child);
        return Ok(A::wrap(slot));
    }
    let new = transition::<A, B>(pool, slot, None)?;
    pool.get_mut(new).insert(byte, child);
    Ok(B::wrap(new))
}

/// Removes `byte`, shrinking into `B` once the remaining entries fit it.
fn delete_or_shrink<A: InnerNode, B: InnerNode>(
    pool: &mut ArenaPool,
    slot: Slot<A>,
    byte: u8,
) -> Result<Repr, Error> {
    let node = pool.get(slot);
    assert!(
        node.get_child(byte).is_some(),
        "Byte {byte} not in {:?}",
        A::NTYPE
    );
    if node.count() - 1 > B::CAPACITY {
        pool.get_mut(slot).remove(byte);
        return Ok(A::wrap(slot));
    }
    Ok(B::wrap(transition::<A, B>(pool, slot, Some(byte))?))
}

fn insert_byte_or_grow<A: LeafBytes, B: LeafBytes>(
    pool: &mut ArenaPool,
    slot: Slot<A>,
    byte: u8,
) -> Result<(Repr, bool), Error> {
    let node = pool.get(slot);
    if node.contains(byte) {
        return Ok((A::wrap(slot), false));
    }
    if !node.is_full() {
        pool.get_mut(slot).insert(byte);
        return Ok((A::wrap(slot), true));
    }
    let new = transition_bytes::<A, B>(pool, slot, None)?;
    pool.get_mut(new).insert(byte);
    Ok((B::wrap(new), true))
}

fn delete_byte_or_shrink<A: LeafBytes, B: LeafBytes>(
    pool: &mut ArenaPool,
    slot: Slot<A>,
    byte: u8,
) -> Result<Repr, Error> {
    let node = pool.get(slot);
    debug_assert!(node.contains(byte));
    if node.count() - 1 > B::CAPACITY {
        pool.get_mut(slot).remove(byte);
        return Ok(A::wrap(slot));
    }
    Ok(B::wrap(transition_bytes::<A, B>(pool, slot, Some(byte))?))
}

fn relocate<T: ArenaNode>(
    pool: &mut ArenaPool,
    set: &AllocatorSet,
    slot: Slot<T>,
) -> Result<Slot<T>, Error> {
    if set.contains(T::IDX) && pool.needs_vacuum(slot) {
        pool.relocate(slot)
    } else {
        Ok(slot)
    }
}

fn vacuum_inner<T: InnerNode>(
    pool: &mut ArenaPool,
    set: &AllocatorSet,
    slot: Slot<T>,
) -> Result<Slot<T>, Error> {
    let slot = relocate(pool, set, slot)?;
    for pos in 0..pool.get(slot).positions() {
        let child = *pool.get_mut(slot).child_at(pos);
        if child.is_empty() {
            continue;
        }
        let child = child.vacuum(pool, set)?;
        *pool.get_mut(slot).child_at(pos) = child;
    }
    Ok(slot)
}

impl Node {
    /// Allocates a new empty inner or leaf byte node.
    pub fn new(pool: &mut ArenaPool, ntype: NType) -> Result<Node, Error> {
        let repr = match ntype {
            NType::Node4 => Repr::Node4(pool.alloc(Node4::default())?),
            NType::Node16 => Repr::Node16(pool.alloc(Node16::default())?),
            NType::Node48 => Repr::Node48(pool.alloc(Node48::default())?),
            NType::Node256 => Repr::Node256(pool.alloc(Node256::default())?),
            NType::Node7Leaf => Repr::Node7Leaf(pool.alloc(Node7Leaf::default())?),
            NType::Node15Leaf => Repr::Node15Leaf(pool.alloc(Node15Leaf::default())?),
            NType::Node256Leaf => Repr::Node256Leaf(pool.alloc(Node256Leaf::default())?),
            _ => panic!("Can't create an empty {ntype:?}"),
        };
        Ok(repr.into())
    }

    /// Frees the node and everything it owns, leaving the handle empty.
    pub fn free(&mut self, pool: &mut ArenaPool) {
        let mut node = std::mem::take(self);
        loop {
            match node.repr() {
                Repr::Empty | Repr::LeafInlined(_) => {}
                Repr::Prefix(s) => {
                    // chains are walked iteratively, they can be long
                    node = pool.free(s).child;
                    continue;
                }
                Repr::PrefixInlined(s) => {
                    pool.free(s);
                }
                Repr::LeafDeprecated(s) => DeprecatedLeaf::free_chain(pool, s),
                Repr::Node4(s) => pool.free(s).entries().for_each(|(_, mut c)| c.free(pool)),
                Repr::Node16(s) => pool.free(s).entries().for_each(|(_, mut c)| c.free(pool)),
                Repr::Node48(s) => pool.free(s).entries().for_each(|(_, mut c)| c.free(pool)),
                Repr::Node256(s) => pool.free(s).entries().for_each(|(_, mut c)| c.free(pool)),
                Repr::Node7Leaf(s) => {
                    pool.free(s);
                }
                Repr::Node15Leaf(s) => {
                    pool.free(s);
                }
                Repr::Node256Leaf(s) => {
                    pool.free(s);
                }
            }
            return;
        }
    }

    /// Number of entries of an inner or leaf byte node
    pub fn count(&self, pool: &ArenaPool) -> usize {
        dispatch_inner!(self.repr(), s => pool.get(s).count(), repr => {
            dispatch_leaf_bytes!(repr, s => pool.get(s).count(), _ => {
                panic!("{self:?} has no entries")
            })
        })
    }

    pub fn get_child(&self, pool: &ArenaPool, byte: u8) -> Option<Node> {
        dispatch_inner!(self.repr(), s => pool.get(s).get_child(byte), _ => {
            panic!("{self:?} has no children")
        })
    }

    /// The first child with a byte greater than or equal to `byte`, with its byte
    pub fn get_next_child(&self, pool: &ArenaPool, byte: u8) -> Option<(u8, Node)> {
        dispatch_inner!(self.repr(), s => pool.get(s).get_next_child(byte), _ => {
            panic!("{self:?} has no children")
        })
    }

    /// The first byte of a leaf byte node greater than or equal to `byte`
    pub fn get_next_byte(&self, pool: &ArenaPool, byte: u8) -> Option<u8> {
        dispatch_leaf_bytes!(self.repr(), s => pool.get(s).get_next_byte(byte), _ => {
            panic!("{self:?} isn't a leaf byte node")
        })
    }

    pub fn has_byte(&self, pool: &ArenaPool, byte: u8) -> bool {
        dispatch_leaf_bytes!(self.repr(), s => pool.get(s).contains(byte), _ => {
            panic!("{self:?} isn't a leaf byte node")
        })
    }

    /// Overwrites the child of an existing entry
    pub fn replace_child(&self, pool: &mut ArenaPool, byte: u8, child: Node) {
        debug_assert!(!child.is_empty());
        dispatch_inner!(self.repr(), s => pool.get_mut(s).replace(byte, child), _ => {
            panic!("{self:?} has no children")
        })
    }

    /// Inserts a new child, growing into the next larger shape if the node is full.
    pub fn insert_child(&mut self, pool: &mut ArenaPool, byte: u8, child: Node) -> Result<(), Error> {
        let repr = match self.repr() {
            Repr::Node4(s) => insert_or_grow::<Node4, Node16>(pool, s, byte, child)?,
            Repr::Node16(s) => insert_or_grow::<Node16, Node48>(pool, s, byte, child)?,
            Repr::Node48(s) => insert_or_grow::<Node48, Node256>(pool, s, byte, child)?,
            Repr::Node256(s) => {
                pool.get_mut(s).insert(byte, child);
                Repr::Node256(s)
            }
            _ => panic!("{self:?} has no children"),
        };
        *self = self.with_repr(repr);
        Ok(())
    }

    /// Deletes the child at `byte`, shrinking into the next smaller shape when possible.
    /// A [Node4] left with a single child collapses into a prefix leading to that child.
    pub fn delete_child(&mut self, pool: &mut ArenaPool, byte: u8) -> Result<(), Error> {
        let repr = match self.repr() {
            Repr::Node4(s) => {
                let remaining = {
                    let node = pool.get(s);
                    assert!(node.get_child(byte).is_some(), "Byte {byte} not in Node4");
                    let mut rest = node.entries().filter(|&(b, _)| b != byte);
                    (rest.next(), rest.next())
                };
                match remaining {
                    (None, _) => {
                        pool.free(s);
                        self.clear();
                        return Ok(());
                    }
                    (Some((b, child)), None) => {
                        let collapsed = Prefix::concat(pool, b, child, self.is_gate())?;
                        pool.free(s);
                        trace!("Node4 {s:?} collapsed into {collapsed:?}");
                        *self = collapsed;
                        return Ok(());
                    }
                    _ => {
                        pool.get_mut(s).remove(byte);
                        Repr::Node4(s)
                    }
                }
            }
            Repr::Node16(s) => delete_or_shrink::<Node16, Node4>(pool, s, byte)?,
            Repr::Node48(s) => delete_or_shrink::<Node48, Node16>(pool, s, byte)?,
            Repr::Node256(s) => delete_or_shrink::<Node256, Node48>(pool, s, byte)?,
            _ => panic!("{self:?} has no children"),
        };
        *self = self.with_repr(repr);
        Ok(())
    }

    /// Inserts a byte into a leaf byte node, growing it if needed.
    /// Returns false if the byte was already present.
    pub fn insert_byte(&mut self, pool: &mut ArenaPool, byte: u8) -> Result<bool, Error> {
        let (repr, inserted) = match self.repr() {
            Repr::Node7Leaf(s) => insert_byte_or_grow::<Node7Leaf, Node15Leaf>(pool, s, byte)?,
            Repr::Node15Leaf(s) => insert_byte_or_grow::<Node15Leaf, Node256Leaf>(pool, s, byte)?,
            Repr::Node256Leaf(s) => (Repr::Node256Leaf(s), pool.get_mut(s).insert(byte)),
            _ => panic!("{self:?} isn't a leaf byte node"),
        };
        *self = self.with_repr(repr);
        Ok(inserted)
    }

    /// Deletes a byte from a leaf byte node, shrinking it when possible.
    /// The node is freed once its last byte is deleted. Returns false if the byte wasn't present.
    pub fn delete_byte(&mut self, pool: &mut ArenaPool, byte: u8) -> Result<bool, Error> {
        if !self.has_byte(pool, byte) {
            return Ok(false);
        }
        if self.count(pool) == 1 {
            self.free(pool);
            return Ok(true);
        }
        let repr = match self.repr() {
            Repr::Node7Leaf(s) => {
                pool.get_mut(s).remove(byte);
                Repr::Node7Leaf(s)
            }
            Repr::Node15Leaf(s) => delete_byte_or_shrink::<Node15Leaf, Node7Leaf>(pool, s, byte)?,
            Repr::Node256Leaf(s) => delete_byte_or_shrink::<Node256Leaf, Node15Leaf>(pool, s, byte)?,
            _ => unreachable!(),
        };
        *self = self.with_repr(repr);
        Ok(true)
    }

    /// Relocates the nodes living in buffers being evacuated by a vacuum of the allocators in
    /// `set`. A node is moved before its children are visited. Returns the (possibly new)
    /// handle of the node, which the caller stores in place of the old one.
    pub fn vacuum(self, pool: &mut ArenaPool, set: &AllocatorSet) -> Result<Node, Error> {
        let repr = match self.repr() {
            Repr::Empty | Repr::LeafInlined(_) => return Ok(self),
            Repr::Prefix(s) => {
                let head = relocate(pool, set, s)?;
                let mut last = head;
                // relocated segments are linked from their predecessor right away
                while let Repr::Prefix(next) = pool.get(last).child.repr() {
                    let next = relocate(pool, set, next)?;
                    let child = pool.get(last).child;
                    pool.get_mut(last).child = child.with_repr(Repr::Prefix(next));
                    last = next;
                }
                let child = pool.get(last).child.vacuum(pool, set)?;
                pool.get_mut(last).child = child;
                Repr::Prefix(head)
            }
            Repr::PrefixInlined(s) => Repr::PrefixInlined(relocate(pool, set, s)?),
            Repr::LeafDeprecated(s) => Repr::LeafDeprecated(DeprecatedLeaf::vacuum(pool, set, s)?),
            Repr::Node4(s) => Repr::Node4(vacuum_inner(pool, set, s)?),
            Repr::Node16(s) => Repr::Node16(vacuum_inner(pool, set, s)?),
            Repr::Node48(s) => Repr::Node48(vacuum_inner(pool, set, s)?),
            Repr::Node256(s) => Repr::Node256(vacuum_inner(pool, set, s)?),
            Repr::Node7Leaf(s) => Repr::Node7Leaf(relocate(pool, set, s)?),
            Repr::Node15Leaf(s) => Repr::Node15Leaf(relocate(pool, set, s)?),
            Repr::Node256Leaf(s) => Repr::Node256Leaf(relocate(pool, set, s)?),
        };
        Ok(self.with_repr(repr))
    }

    /// Verifies the structure under the node, returning a textual dump of it unless
    /// `only_verify` is set.
    pub fn verify_and_to_string(&self, pool: &ArenaPool, only_verify: bool) -> Result<String, Error> {
        if self.is_empty() {
            return Ok(String::new());
        }
        let mut verifier = Verifier {
            pool,
            dump: !only_verify,
            out: String::new(),
        };
        verifier.visit(*self, Scope::Outer)?;
        Ok(verifier.out)
    }

    /// Adds the slots reachable from this node to `counts`, by allocator.
    pub fn verify_allocations(&self, pool: &ArenaPool, counts: &mut AllocationCounts) {
        fn count<T: ArenaNode>(counts: &mut AllocationCounts) {
            counts[T::IDX.index()] += 1;
        }
        fn inner<T: InnerNode>(pool: &ArenaPool, s: Slot<T>, counts: &mut AllocationCounts) {
            count::<T>(counts);
            for (_, child) in pool.get(s).entries() {
                child.verify_allocations(pool, counts);
            }
        }
        match self.repr() {
            Repr::Empty | Repr::LeafInlined(_) => (),
            Repr::Prefix(s) => {
                count::<Prefix>(counts);
                let mut child = pool.get(s).child;
                while let Repr::Prefix(next) = child.repr() {
                    count::<Prefix>(counts);
                    child = pool.get(next).child;
                }
                child.verify_allocations(pool, counts);
            }
            Repr::PrefixInlined(_) => count::<crate::prefix::InlinedPrefix>(counts),
            Repr::LeafDeprecated(s) => DeprecatedLeaf::count_chain(pool, s, counts),
            Repr::Node4(s) => inner(pool, s, counts),
            Repr::Node16(s) => inner(pool, s, counts),
            Repr::Node48(s) => inner(pool, s, counts),
            Repr::Node256(s) => inner(pool, s, counts),
            Repr::Node7Leaf(_) => count::<Node7Leaf>(counts),
            Repr::Node15Leaf(_) => count::<Node15Leaf>(counts),
            Repr::Node256Leaf(_) => count::<Node256Leaf>(counts),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Scope {
    /// The outer key path
    Outer,
    /// Inside a gate, at the given depth of the row id key
    Nested(usize),
}

struct Verifier<'a> {
    pool: &'a ArenaPool,
    dump: bool,
    out: String,
}

impl Verifier<'_> {
    fn write(&mut self, args: std::fmt::Arguments<'_>) {
        if self.dump {
            let _ = self.out.write_fmt(args);
        }
    }

    fn visit(&mut self, node: Node, scope: Scope) -> Result<(), Error> {
        if node.is_gate() {
            if scope != Scope::Outer {
                return Err(error_corrupted!("Gate {node:?} nested inside a gate"));
            }
            if matches!(
                node.repr(),
                Repr::Empty | Repr::LeafInlined(_) | Repr::LeafDeprecated(_) | Repr::PrefixInlined(_)
            ) {
                return Err(error_corrupted!("Invalid gate {node:?}"));
            }
            self.write(format_args!("Gate ["));
            self.visit(node.with_gate(false), Scope::Nested(0))?;
            self.write(format_args!("]"));
            return Ok(());
        }

        match node.repr() {
            Repr::Empty => Err(error_corrupted!("Empty child node")),
            Repr::LeafInlined(row_id) => {
                if let Scope::Nested(depth) = scope {
                    return Err(error_corrupted!("Inlined leaf at depth {depth} of a gate"));
                }
                self.write(format_args!("Inlined Leaf [row_id: {row_id}]"));
                Ok(())
            }
            Repr::LeafDeprecated(s) => {
                if scope != Scope::Outer {
                    return Err(error_corrupted!("Deprecated leaf inside a gate"));
                }
                let dump = DeprecatedLeaf::verify_chain(self.pool, s)?;
                self.write(format_args!("{dump}"));
                Ok(())
            }
            Repr::Prefix(s) => self.visit_prefix(s, scope),
            Repr::PrefixInlined(s) => {
                let bytes = self.pool.get(s).bytes();
                match scope {
                    Scope::Nested(depth) if depth > 0 && depth + bytes.len() == ROW_KEY_LEN => (),
                    _ => {
                        return Err(error_corrupted!(
                            "Inlined prefix of {} bytes in {scope:?}",
                            bytes.len()
                        ))
                    }
                }
                self.write(format_args!("Inlined Prefix: |{}|", dash_joined(bytes.iter().copied())));
                Ok(())
            }
            Repr::Node4(s) => self.visit_inner(s, scope, "Node4"),
            Repr::Node16(s) => self.visit_inner(s, scope, "Node16"),
            Repr::Node48(s) => {
                if !self.pool.get(s).is_consistent() {
                    return Err(error_corrupted!("Inconsistent Node48 {s:?}"));
                }
                self.visit_inner(s, scope, "Node48")
            }
            Repr::Node256(s) => self.visit_inner(s, scope, "Node256"),
            Repr::Node7Leaf(s) => self.visit_leaf_bytes(s, scope, "Leaf Node7"),
            Repr::Node15Leaf(s) => self.visit_leaf_bytes(s, scope, "Leaf Node15"),
            Repr::Node256Leaf(s) => self.visit_leaf_bytes(s, scope, "Leaf Node256"),
        }
    }

    /// Visits a prefix chain, segment by segment, and then the node it leads to.
    fn visit_prefix(&mut self, mut s: Slot<Prefix>, mut scope: Scope) -> Result<(), Error> {
        loop {
            let segment = self.pool.get(s);
            let (count, child) = (segment.count(), segment.child);
            if count == 0 || count > self.pool.prefix_count() {
                return Err(error_corrupted!("Prefix {s:?} holds {count} bytes"));
            }
            if child.is_empty() {
                return Err(error_corrupted!("Prefix {s:?} has no child"));
            }
            let continues = matches!(child.repr(), Repr::Prefix(_)) && !child.is_gate();
            if continues && count != self.pool.prefix_count() {
                return Err(error_corrupted!(
                    "Prefix {s:?} isn't full ({count} bytes) but has a continuation"
                ));
            }
            let child_scope = match scope {
                Scope::Outer => Scope::Outer,
                Scope::Nested(depth) => {
                    if depth + count >= ROW_KEY_LEN {
                        return Err(error_corrupted!(
                            "Prefix {s:?} reaches past the row id key at depth {depth}"
                        ));
                    }
                    if matches!(child.repr(), Repr::PrefixInlined(_)) {
                        return Err(error_corrupted!("Prefix {s:?} leads to a single row id"));
                    }
                    Scope::Nested(depth + count)
                }
            };
            self.write(format_args!(
                "Prefix: |{}| ",
                dash_joined(segment.bytes().iter().copied())
            ));
            match child.repr() {
                Repr::Prefix(next) if continues => {
                    s = next;
                    scope = child_scope;
                }
                _ => return self.visit(child, child_scope),
            }
        }
    }

    fn visit_inner<T: InnerNode>(&mut self, s: Slot<T>, scope: Scope, name: &str) -> Result<(), Error> {
        let node = self.pool.get(s);
        check_bounds(T::NTYPE, node.count())?;
        let child_scope = match scope {
            Scope::Outer => Scope::Outer,
            Scope::Nested(depth) if depth + 1 < ROW_KEY_LEN => Scope::Nested(depth + 1),
            Scope::Nested(depth) => {
                return Err(error_corrupted!("{name} {s:?} at depth {depth} of a gate"))
            }
        };
        let mut last = None;
        self.write(format_args!("{name}: ["));
        for (i, (byte, child)) in node.entries().enumerate() {
            if last.is_some_and(|last| last >= byte) {
                return Err(error_corrupted!("{name} {s:?} bytes out of order"));
            }
            last = Some(byte);
            if i != 0 {
                self.write(format_args!(", "));
            }
            self.write(format_args!("({byte}, "));
            self.visit(child, child_scope)?;
            self.write(format_args!(")"));
        }
        self.write(format_args!("]"));
        Ok(())
    }

    fn visit_leaf_bytes<T: LeafBytes>(
        &mut self,
        s: Slot<T>,
        scope: Scope,
        name: &str,
    ) -> Result<(), Error> {
        if scope != Scope::Nested(ROW_KEY_LEN - 1) {
            return Err(error_corrupted!("{name} {s:?} in {scope:?}"));
        }
        let node = self.pool.get(s);
        check_bounds(T::NTYPE, node.count())?;
        self.write(format_args!("{name}: [{}]", dash_joined(node.bytes())));
        Ok(())
    }
}

fn check_bounds(ntype: NType, count: usize) -> Result<(), Error> {
    let Some((min, max)) = ntype.bounds() else {
        return Ok(());
    };
    if count < min || count > max {
        return Err(error_corrupted!(
            "{ntype:?} holds {count} entries, outside of [{min}, {max}]"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{options::ArtOptions, pool::AllocatorIdx};

    fn pool() -> ArenaPool {
        let mut opts = ArtOptions::default();
        opts.buffer_size = 1024;
        ArenaPool::new(&opts)
    }

    fn assert_live(pool: &ArenaPool, node: &Node) {
        let mut counts = AllocationCounts::default();
        node.verify_allocations(pool, &mut counts);
        assert_eq!(counts, pool.live_counts());
    }

    #[test]
    fn test_inner_tiers() {
        let mut pool = pool();
        let mut node = Node::new(&mut pool, NType::Node4).unwrap();
        let expected = [
            (4, NType::Node4),
            (16, NType::Node16),
            (48, NType::Node48),
            (256, NType::Node256),
        ];
        let mut byte = 0u16;
        for (upto, ntype) in expected {
            while byte < upto {
                node.insert_child(&mut pool, byte as u8, Node::leaf(byte as i64)).unwrap();
                byte += 1;
                assert_eq!(node.ntype(), Some(ntype));
            }
        }
        assert_eq!(node.count(&pool), 256);
        assert_live(&pool, &node);
        node.verify_and_to_string(&pool, true).unwrap();

        let shrinks = [
            (49, NType::Node256),
            (17, NType::Node48),
            (5, NType::Node16),
            (2, NType::Node4),
        ];
        for (downto, ntype) in shrinks {
            while byte > downto {
                byte -= 1;
                node.delete_child(&mut pool, byte as u8).unwrap();
                if byte > downto {
                    assert_eq!(node.ntype(), Some(ntype), "{byte}");
                }
            }
        }
        assert_eq!(node.ntype(), Some(NType::Node4));
        assert_eq!(
            node.get_next_child(&pool, 0),
            Some((0, Node::leaf(0)))
        );
        assert_eq!(
            node.get_next_child(&pool, 1),
            Some((1, Node::leaf(1)))
        );
        assert_eq!(node.get_next_child(&pool, 2), None);
        assert_live(&pool, &node);

        // one child left collapses into a prefix
        node.delete_child(&mut pool, 1).unwrap();
        assert_eq!(node.ntype(), Some(NType::Prefix));
        assert_eq!(
            node.verify_and_to_string(&pool, false).unwrap(),
            "Prefix: |0-| Inlined Leaf [row_id: 0]"
        );
        node.free(&mut pool);
        assert!(node.is_empty());
        assert_eq!(pool.live_counts(), [0; 10]);
    }

    #[test]
    fn test_leaf_byte_tiers() {
        let mut pool = pool();
        let mut node = Node::new(&mut pool, NType::Node7Leaf).unwrap();
        for b in 0..=255u8 {
            assert!(node.insert_byte(&mut pool, b).unwrap());
            let expected = match b as usize + 1 {
                1..=7 => NType::Node7Leaf,
                8..=15 => NType::Node15Leaf,
                _ => NType::Node256Leaf,
            };
            assert_eq!(node.ntype(), Some(expected));
        }
        assert!(!node.insert_byte(&mut pool, 10).unwrap());
        for b in (0..=255u8).rev() {
            assert!(node.delete_byte(&mut pool, b).unwrap());
            let expected = match b as usize {
                0 => None,
                1..=7 => Some(NType::Node7Leaf),
                8..=15 => Some(NType::Node15Leaf),
                _ => Some(NType::Node256Leaf),
            };
            assert_eq!(node.ntype(), expected);
            if !node.is_empty() {
                assert_eq!(node.get_next_byte(&pool, 0), Some(0));
                assert!(!node.has_byte(&pool, b));
            }
        }
        assert_eq!(pool.live_counts(), [0; 10]);
    }

    #[test]
    fn test_collapse_keeps_gate() {
        let mut pool = pool();
        let mut node = Node::new(&mut pool, NType::Node4).unwrap();
        node.insert_child(&mut pool, 1, Node::leaf(1)).unwrap();
        node.insert_child(&mut pool, 2, Node::leaf(2)).unwrap();
        node.set_gate(true);
        node.delete_child(&mut pool, 2).unwrap();
        assert!(node.is_gate());
        assert_eq!(node.ntype(), Some(NType::Prefix));
        node.free(&mut pool);
        assert_eq!(pool.live_counts(), [0; 10]);
    }

    #[test]
    fn test_vacuum_relocates() {
        let mut opts = ArtOptions::default();
        opts.buffer_size = 4 * std::mem::size_of::<Option<Prefix>>();
        let mut pool = ArenaPool::new(&opts);
        let mut root = Node::new(&mut pool, NType::Node48).unwrap();
        let mut garbage = Vec::new();
        for b in 0..40u8 {
            garbage.push(Prefix::new_chain(&mut pool, &[b], Node::leaf(0), false).unwrap());
            let child = Prefix::new_chain(&mut pool, &[b, b], Node::leaf(b as i64), false).unwrap();
            root.insert_child(&mut pool, b, child).unwrap();
        }
        for mut g in garbage {
            g.free(&mut pool);
        }
        let before = root.verify_and_to_string(&pool, false).unwrap();
        let live = pool.live_counts();
        let set = pool.initialize_vacuum(0.1);
        assert!(set.contains(AllocatorIdx::Prefix));
        assert!(!set.contains(AllocatorIdx::Node48));
        root = root.vacuum(&mut pool, &set).unwrap();
        pool.finalize_vacuum(set).unwrap();
        assert_eq!(pool.live_counts(), live);
        assert_eq!(root.verify_and_to_string(&pool, false).unwrap(), before);
        assert_live(&pool, &root);
        pool.validate().unwrap();
        let prefixes = &pool.stats()[AllocatorIdx::Prefix.index()];
        assert_eq!(prefixes.buffers, 10);
    }

    #[test]
    fn test_verify_detects_corruption() {
        let mut pool = pool();
        // a partial segment with a continuation
        let tail = Prefix::new_chain(&mut pool, b"b", Node::leaf(1), false).unwrap();
        let head = Prefix::new_chain(&mut pool, b"a", tail, false).unwrap();
        assert!(matches!(
            head.verify_and_to_string(&pool, true),
            Err(Error::Corrupted(_))
        ));
        // leaf bytes outside of a gate
        let mut leaf = Node::new(&mut pool, NType::Node7Leaf).unwrap();
        leaf.insert_byte(&mut pool, 1).unwrap();
        assert!(leaf.verify_and_to_string(&pool, true).is_err());
        // gate inside a gate
        let mut inner = Node::new(&mut pool, NType::Node4).unwrap();
        inner.insert_child(&mut pool, 0, leaf.with_gate(true)).unwrap();
        assert!(inner.with_gate(true).verify_and_to_string(&pool, true).is_err());
    }
}
