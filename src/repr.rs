use std::{fmt, hash::Hash, marker::PhantomData};
use zerocopy::*;

use crate::{
    error::{error_validation, Error},
    freelist::SlotId,
    inner::{Node16, Node256, Node4, Node48},
    leaf_bytes::{Node15Leaf, Node256Leaf, Node7Leaf},
    legacy::DeprecatedLeaf,
    pool::AllocatorIdx,
    prefix::{InlinedPrefix, Prefix},
};

/// Identifier of an indexed row
pub type RowId = i64;

/// Typed reference to a slot of the allocator of `T`.
pub struct Slot<T> {
    id: SlotId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Slot<T> {
    #[inline]
    pub(crate) fn new(id: SlotId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn id(self) -> SlotId {
        self.id
    }
}

impl<T> Copy for Slot<T> {}

impl<T> Clone for Slot<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Slot<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Slot<T> {}

impl<T> Hash for Slot<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.id)
    }
}

/// Node shape discriminant, as stored in a [PackedNode]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NType {
    Prefix = 1,
    LeafDeprecated = 2,
    Node4 = 3,
    Node16 = 4,
    Node48 = 5,
    Node256 = 6,
    LeafInlined = 7,
    Node7Leaf = 8,
    Node15Leaf = 9,
    Node256Leaf = 10,
    PrefixInlined = 11,
}

impl NType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Prefix,
            2 => Self::LeafDeprecated,
            3 => Self::Node4,
            4 => Self::Node16,
            5 => Self::Node48,
            6 => Self::Node256,
            7 => Self::LeafInlined,
            8 => Self::Node7Leaf,
            9 => Self::Node15Leaf,
            10 => Self::Node256Leaf,
            11 => Self::PrefixInlined,
            _ => return None,
        })
    }

    /// Allocator of the shape, `None` for inline only shapes.
    pub fn allocator_idx(self) -> Option<AllocatorIdx> {
        Some(match self {
            Self::Prefix => AllocatorIdx::Prefix,
            Self::LeafDeprecated => AllocatorIdx::LeafDeprecated,
            Self::Node4 => AllocatorIdx::Node4,
            Self::Node16 => AllocatorIdx::Node16,
            Self::Node48 => AllocatorIdx::Node48,
            Self::Node256 => AllocatorIdx::Node256,
            Self::PrefixInlined => AllocatorIdx::PrefixInlined,
            Self::Node7Leaf => AllocatorIdx::Node7Leaf,
            Self::Node15Leaf => AllocatorIdx::Node15Leaf,
            Self::Node256Leaf => AllocatorIdx::Node256Leaf,
            Self::LeafInlined => return None,
        })
    }

    pub fn is_inner(self) -> bool {
        matches!(
            self,
            Self::Node4 | Self::Node16 | Self::Node48 | Self::Node256
        )
    }

    pub fn is_leaf_bytes(self) -> bool {
        matches!(self, Self::Node7Leaf | Self::Node15Leaf | Self::Node256Leaf)
    }

    /// Occupancy bounds of the inner and leaf byte shapes.
    pub fn bounds(self) -> Option<(usize, usize)> {
        Some(match self {
            Self::Node4 => (1, 4),
            Self::Node16 => (5, 16),
            Self::Node48 => (17, 48),
            Self::Node256 => (49, 256),
            Self::Node7Leaf => (1, 7),
            Self::Node15Leaf => (8, 15),
            Self::Node256Leaf => (16, 256),
            _ => return None,
        })
    }
}

/// Payload of a node handle. Out of line shapes carry a typed slot of their allocator.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Repr {
    #[default]
    Empty,
    Prefix(Slot<Prefix>),
    PrefixInlined(Slot<InlinedPrefix>),
    LeafInlined(RowId),
    LeafDeprecated(Slot<DeprecatedLeaf>),
    Node4(Slot<Node4>),
    Node16(Slot<Node16>),
    Node48(Slot<Node48>),
    Node256(Slot<Node256>),
    Node7Leaf(Slot<Node7Leaf>),
    Node15Leaf(Slot<Node15Leaf>),
    Node256Leaf(Slot<Node256Leaf>),
}

/// Node handle.
///
/// A copyable tagged value pointing into the [crate::pool::ArenaPool] of the tree that
/// created it. The `gate` flag marks the root of a nested row id set.
#[derive(Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    repr: Repr,
    gate: bool,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.gate {
            write!(f, "Gate({:?})", self.repr)
        } else {
            self.repr.fmt(f)
        }
    }
}

impl From<Repr> for Node {
    #[inline]
    fn from(repr: Repr) -> Self {
        Self { repr, gate: false }
    }
}

impl Node {
    pub const EMPTY: Node = Node {
        repr: Repr::Empty,
        gate: false,
    };

    #[inline]
    pub fn leaf(row_id: RowId) -> Self {
        Repr::LeafInlined(row_id).into()
    }

    #[inline]
    pub fn repr(&self) -> Repr {
        self.repr
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.repr == Repr::Empty
    }

    #[inline]
    pub fn is_gate(&self) -> bool {
        self.gate
    }

    #[inline]
    pub fn set_gate(&mut self, gate: bool) {
        debug_assert!(!gate || !self.is_empty());
        self.gate = gate;
    }

    #[inline]
    pub fn with_gate(mut self, gate: bool) -> Self {
        self.set_gate(gate);
        self
    }

    /// Same gate flag, different payload
    #[inline]
    pub(crate) fn with_repr(mut self, repr: Repr) -> Self {
        self.repr = repr;
        self
    }

    #[inline]
    pub fn clear(&mut self) {
        *self = Node::EMPTY;
    }

    pub fn ntype(&self) -> Option<NType> {
        Some(match self.repr {
            Repr::Empty => return None,
            Repr::Prefix(_) => NType::Prefix,
            Repr::PrefixInlined(_) => NType::PrefixInlined,
            Repr::LeafInlined(_) => NType::LeafInlined,
            Repr::LeafDeprecated(_) => NType::LeafDeprecated,
            Repr::Node4(_) => NType::Node4,
            Repr::Node16(_) => NType::Node16,
            Repr::Node48(_) => NType::Node48,
            Repr::Node256(_) => NType::Node256,
            Repr::Node7Leaf(_) => NType::Node7Leaf,
            Repr::Node15Leaf(_) => NType::Node15Leaf,
            Repr::Node256Leaf(_) => NType::Node256Leaf,
        })
    }

    fn slot_id(&self) -> Option<SlotId> {
        Some(match self.repr {
            Repr::Empty | Repr::LeafInlined(_) => return None,
            Repr::Prefix(s) => s.id(),
            Repr::PrefixInlined(s) => s.id(),
            Repr::LeafDeprecated(s) => s.id(),
            Repr::Node4(s) => s.id(),
            Repr::Node16(s) => s.id(),
            Repr::Node48(s) => s.id(),
            Repr::Node256(s) => s.id(),
            Repr::Node7Leaf(s) => s.id(),
            Repr::Node15Leaf(s) => s.id(),
            Repr::Node256Leaf(s) => s.id(),
        })
    }

    /// Encodes the handle into its 64 bit persisted form.
    pub fn pack(&self) -> Result<PackedNode, Error> {
        let Some(ntype) = self.ntype() else {
            return Ok(PackedNode::EMPTY);
        };
        let payload = match self.repr {
            Repr::LeafInlined(row_id) => u64::try_from(row_id)
                .ok()
                .filter(|&r| r <= PackedNode::PAYLOAD_MASK)
                .ok_or_else(|| error_validation!("Row id {row_id} can't be packed"))?,
            _ => self.slot_id().map_or(0, u64::from),
        };
        let mut flags = NodeFlags::from_bits_retain(ntype as u8);
        flags.set(NodeFlags::Gate, self.gate);
        Ok(PackedNode::from_raw(
            (flags.bits() as u64) << PackedNode::PAYLOAD_BITS | payload,
        ))
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct NodeFlags(u8);

bitflags::bitflags! {
    impl NodeFlags: u8 {
        /// Set if the node is the root of a nested row id set
        const Gate = 0b1000_0000;
        /// Bits of the [NType] discriminant
        const Type = 0b0111_1111;
    }
}

/// Persisted form of a [Node]: discriminant and gate flag in the top byte,
/// slot id or row id in the lower 56 bits. Stored little endian.
#[derive(Default, Copy, Clone, PartialEq, Eq, Hash, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(transparent)]
pub struct PackedNode(u64);

impl fmt::Debug for PackedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackedNode({:#018x})", self.raw())
    }
}

impl PackedNode {
    pub const EMPTY: PackedNode = PackedNode(0);
    const PAYLOAD_BITS: u32 = 56;
    const PAYLOAD_MASK: u64 = (1 << Self::PAYLOAD_BITS) - 1;

    #[inline]
    pub fn from_raw(v: u64) -> Self {
        Self(v.to_le())
    }

    #[inline]
    pub fn raw(self) -> u64 {
        u64::from_le(self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Self::read_from_bytes(bytes)
            .map_err(|_| error_validation!("Packed node must be 8 bytes, got {}", bytes.len()))
    }

    /// Decodes the handle, validating the discriminant and payload.
    pub fn unpack(self) -> Result<Node, Error> {
        let raw = self.raw();
        if raw == 0 {
            return Ok(Node::EMPTY);
        }
        let flags = NodeFlags::from_bits_retain((raw >> Self::PAYLOAD_BITS) as u8);
        let payload = raw & Self::PAYLOAD_MASK;
        let Some(ntype) = NType::from_u8((flags & NodeFlags::Type).bits()) else {
            return Err(error_validation!("Invalid node type in {self:?}"));
        };
        let slot = || {
            SlotId::try_from(payload)
                .map_err(|_| error_validation!("Slot id out of bounds in {self:?}"))
        };
        let repr = match ntype {
            NType::LeafInlined => Repr::LeafInlined(payload as RowId),
            NType::Prefix => Repr::Prefix(Slot::new(slot()?)),
            NType::PrefixInlined => Repr::PrefixInlined(Slot::new(slot()?)),
            NType::LeafDeprecated => Repr::LeafDeprecated(Slot::new(slot()?)),
            NType::Node4 => Repr::Node4(Slot::new(slot()?)),
            NType::Node16 => Repr::Node16(Slot::new(slot()?)),
            NType::Node48 => Repr::Node48(Slot::new(slot()?)),
            NType::Node256 => Repr::Node256(Slot::new(slot()?)),
            NType::Node7Leaf => Repr::Node7Leaf(Slot::new(slot()?)),
            NType::Node15Leaf => Repr::Node15Leaf(Slot::new(slot()?)),
            NType::Node256Leaf => Repr::Node256Leaf(Slot::new(slot()?)),
        };
        Ok(Node {
            repr,
            gate: flags.contains(NodeFlags::Gate),
        })
    }
}
