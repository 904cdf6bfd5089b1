//! Path compression.
//!
//! Runs of key bytes without branching are stored as chains of [Prefix] segments.
//! A chain is every `Prefix` reachable from its head through non gate `Prefix` children,
//! and chains are kept dense: all segments but the last hold exactly `prefix_count` bytes.
//! A gate never continues a chain, so chains are never merged across gates.

use smallvec::SmallVec;

use crate::{
    error::Error,
    inner::{InnerNode, Node4},
    pool::ArenaPool,
    repr::{Node, Repr, Slot},
    utils::common_prefix_len,
};

/// Maximum number of bytes of a prefix segment
pub const PREFIX_SEGMENT_CAPACITY: usize = 15;

/// Byte count of a row id tail
pub const INLINED_PREFIX_CAPACITY: usize = 8;

pub(crate) type ChainBytes = SmallVec<u8, 32>;

#[derive(Debug, Clone)]
pub struct Prefix {
    data: [u8; PREFIX_SEGMENT_CAPACITY],
    count: u8,
    /// Successor, a continuation segment or the node the compressed path leads to
    pub child: Node,
}

impl Prefix {
    fn new(bytes: &[u8], child: Node) -> Self {
        debug_assert!(!bytes.is_empty() && bytes.len() <= PREFIX_SEGMENT_CAPACITY);
        let mut data = [0; PREFIX_SEGMENT_CAPACITY];
        data[..bytes.len()].copy_from_slice(bytes);
        Self {
            data,
            count: bytes.len() as u8,
            child,
        }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.count as usize]
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count as usize
    }

    /// Number of leading bytes of the segment matching `key`
    #[inline]
    pub fn mismatch(&self, key: &[u8]) -> usize {
        common_prefix_len(self.bytes(), key)
    }

    /// Creates a dense chain holding `bytes` followed by `child`.
    /// The head takes the `gate` flag. Returns `child` itself if `bytes` is empty.
    pub fn new_chain(
        pool: &mut ArenaPool,
        bytes: &[u8],
        child: Node,
        gate: bool,
    ) -> Result<Node, Error> {
        if bytes.is_empty() {
            return Ok(child.with_gate(gate || child.is_gate()));
        }
        let mut next = child;
        let mut created = SmallVec::<Slot<Prefix>, 4>::new();
        for chunk in bytes.chunks(pool.prefix_count()).rev() {
            match pool.alloc(Prefix::new(chunk, next)) {
                Ok(slot) => {
                    created.push(slot);
                    next = Repr::Prefix(slot).into();
                }
                Err(e) => {
                    for slot in created {
                        pool.free(slot);
                    }
                    return Err(e);
                }
            }
        }
        Ok(next.with_gate(gate))
    }

    /// Collects the bytes of the chain starting at `head`, returning them together with
    /// the node the chain leads to and the chain segments.
    pub(crate) fn chain(
        pool: &ArenaPool,
        head: Node,
    ) -> (ChainBytes, Node, SmallVec<Slot<Prefix>, 4>) {
        let mut bytes = ChainBytes::new();
        let mut segments = SmallVec::new();
        let mut node = head;
        while let Repr::Prefix(slot) = node.repr() {
            if node.is_gate() && !segments.is_empty() {
                break;
            }
            let segment = pool.get(slot);
            bytes.extend_from_slice(segment.bytes());
            segments.push(slot);
            node = segment.child;
        }
        (bytes, node, segments)
    }

    /// Builds the node replacing a [crate::inner::Node4] with a single remaining child:
    /// `byte` followed by `child`, absorbing the chain of `child` if it's a non gate prefix.
    pub fn concat(pool: &mut ArenaPool, byte: u8, child: Node, gate: bool) -> Result<Node, Error> {
        if !matches!(child.repr(), Repr::Prefix(_)) || child.is_gate() {
            return Self::new_chain(pool, &[byte], child, gate);
        }
        let (chain_bytes, end, segments) = Self::chain(pool, child);
        let mut bytes = ChainBytes::with_capacity(chain_bytes.len() + 1);
        bytes.push(byte);
        bytes.extend_from_slice(&chain_bytes);
        let new = Self::new_chain(pool, &bytes, end, gate)?;
        for slot in segments {
            pool.free(slot);
        }
        Ok(new)
    }

    /// Re-packs the chain starting at `head` so that it's dense again.
    pub fn normalize(pool: &mut ArenaPool, head: Node) -> Result<Node, Error> {
        let (bytes, end, segments) = Self::chain(pool, head);
        if segments.is_empty() {
            return Ok(head);
        }
        let new = Self::new_chain(pool, &bytes, end, head.is_gate())?;
        for slot in segments {
            pool.free(slot);
        }
        Ok(new)
    }

    /// Splits the segment `slot` after its first `m` bytes, where a new branch `byte -> new_child`
    /// diverges from the stored bytes. Returns the node replacing the segment: the first `m`
    /// bytes (if any) leading to a [crate::inner::Node4] that holds both the rest of the chain
    /// and the new branch.
    pub fn branch(
        pool: &mut ArenaPool,
        head: Node,
        m: usize,
        byte: u8,
        new_child: Node,
    ) -> Result<Node, Error> {
        let Repr::Prefix(slot) = head.repr() else {
            panic!("Branching off a non prefix node {head:?}");
        };
        let segment = pool.get(slot).clone();
        debug_assert!(m < segment.count());
        debug_assert_ne!(segment.bytes()[m], byte);

        // the rest of the segment is merged with its continuation to keep the chain dense
        let mut rest_bytes = ChainBytes::from_slice(&segment.bytes()[m + 1..]);
        let child = segment.child;
        let (rest_end, continuation) =
            if matches!(child.repr(), Repr::Prefix(_)) && !child.is_gate() {
                let (bytes, end, segments) = Self::chain(pool, child);
                rest_bytes.extend_from_slice(&bytes);
                (end, segments)
            } else {
                (child, SmallVec::new())
            };
        let rest = Self::new_chain(pool, &rest_bytes, rest_end, false)?;

        let mut node4 = Node4::default();
        node4.insert(segment.bytes()[m], rest);
        node4.insert(byte, new_child);
        let node4 = match pool.alloc(node4) {
            Ok(s) => Node::from(Repr::Node4(s)),
            Err(e) => {
                Self::free_new_chain(pool, rest, rest_end);
                return Err(e);
            }
        };
        let new_head = match Self::new_chain(pool, &segment.bytes()[..m], node4, head.is_gate()) {
            Ok(n) => n,
            Err(e) => {
                if let Repr::Node4(s) = node4.repr() {
                    pool.free(s);
                }
                Self::free_new_chain(pool, rest, rest_end);
                return Err(e);
            }
        };
        pool.free(slot);
        for s in continuation {
            pool.free(s);
        }
        Ok(new_head)
    }

    /// Frees the segments of a chain created by [Prefix::new_chain], but not its end.
    fn free_new_chain(pool: &mut ArenaPool, head: Node, end: Node) {
        let mut node = head;
        while node != end {
            let Repr::Prefix(slot) = node.repr() else {
                break;
            };
            node = pool.free(slot).child;
        }
    }

    /// Walks the chain starting at `node` matching `key[*depth..]`, advancing `depth`.
    /// Returns the node after the chain, or `None` if the key diverges from the chain.
    pub fn traverse(pool: &ArenaPool, mut node: Node, key: &[u8], depth: &mut usize) -> Option<Node> {
        let mut first = true;
        while let Repr::Prefix(slot) = node.repr() {
            if node.is_gate() && !first {
                break;
            }
            first = false;
            let segment = pool.get(slot);
            let rest = key.get(*depth..).unwrap_or_default();
            if segment.mismatch(rest) != segment.count() {
                return None;
            }
            *depth += segment.count();
            node = segment.child;
        }
        Some(node)
    }
}

/// The remaining bytes of a single row id key inside a gate
#[derive(Debug, Clone, Default)]
pub struct InlinedPrefix {
    data: [u8; INLINED_PREFIX_CAPACITY],
    count: u8,
}

impl InlinedPrefix {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(!bytes.is_empty() && bytes.len() <= INLINED_PREFIX_CAPACITY);
        let mut data = [0; INLINED_PREFIX_CAPACITY];
        data[..bytes.len()].copy_from_slice(bytes);
        Self {
            data,
            count: bytes.len() as u8,
        }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.count as usize]
    }

    pub fn alloc(pool: &mut ArenaPool, bytes: &[u8]) -> Result<Node, Error> {
        Ok(Repr::PrefixInlined(pool.alloc(Self::new(bytes))?).into())
    }
}
