//! Leaf byte nodes: sets of bytes without children, holding the last byte of the row ids
//! stored under a gate.

use crate::{
    pool::ArenaNode,
    repr::{NType, Repr, Slot},
};

pub trait LeafBytes: ArenaNode + Default + Clone {
    const NTYPE: NType;
    const CAPACITY: usize;

    fn wrap(slot: Slot<Self>) -> Repr;

    fn count(&self) -> usize;

    #[inline]
    fn is_full(&self) -> bool {
        self.count() == Self::CAPACITY
    }

    fn contains(&self, byte: u8) -> bool;

    /// The first byte greater than or equal to `byte`
    fn get_next_byte(&self, byte: u8) -> Option<u8>;

    /// Returns false if the byte was already present. The node must not be full.
    fn insert(&mut self, byte: u8) -> bool;

    fn remove(&mut self, byte: u8) -> bool;

    fn bytes(&self) -> impl Iterator<Item = u8> + '_;

    fn from_bytes(bytes: impl IntoIterator<Item = u8>) -> Self {
        let mut node = Self::default();
        for b in bytes {
            node.insert(b);
        }
        node
    }
}

#[derive(Debug, Clone)]
pub struct SortedLeaf<const N: usize> {
    count: u8,
    keys: [u8; N],
}

pub type Node7Leaf = SortedLeaf<7>;
pub type Node15Leaf = SortedLeaf<15>;

impl<const N: usize> Default for SortedLeaf<N> {
    fn default() -> Self {
        Self {
            count: 0,
            keys: [0; N],
        }
    }
}

impl<const N: usize> SortedLeaf<N> {
    #[inline]
    fn keys(&self) -> &[u8] {
        &self.keys[..self.count as usize]
    }
}

macro_rules! sorted_leaf {
    ($n:literal, $ntype:ident) => {
        impl LeafBytes for SortedLeaf<$n> {
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

            #[inline]
            fn contains(&self, byte: u8) -> bool {
                self.keys().contains(&byte)
            }

            fn get_next_byte(&self, byte: u8) -> Option<u8> {
                let i = self.keys().partition_point(|&b| b < byte);
                self.keys().get(i).copied()
            }

            fn insert(&mut self, byte: u8) -> bool {
                let Err(i) = self.keys().binary_search(&byte) else {
                    return false;
                };
                assert!(!self.is_full(), "Inserting into a full {:?}", Self::NTYPE);
                let count = self.count();
                self.keys.copy_within(i..count, i + 1);
                self.keys[i] = byte;
                self.count += 1;
                true
            }

            fn remove(&mut self, byte: u8) -> bool {
                let Ok(i) = self.keys().binary_search(&byte) else {
                    return false;
                };
                let count = self.count();
                self.keys.copy_within(i + 1..count, i);
                self.count -= 1;
                true
            }

            fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
                self.keys().iter().copied()
            }
        }
    };
}

sorted_leaf!(7, Node7Leaf);
sorted_leaf!(15, Node15Leaf);

/// Leaf byte node holding any set of bytes as a bitmask
#[derive(Debug, Clone, Default)]
pub struct Node256Leaf {
    mask: [u64; 4],
}

impl LeafBytes for Node256Leaf {
    const NTYPE: NType = NType::Node256Leaf;
    const CAPACITY: usize = 256;

    #[inline]
    fn wrap(slot: Slot<Self>) -> Repr {
        Repr::Node256Leaf(slot)
    }

    #[inline]
    fn count(&self) -> usize {
        self.mask.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline]
    fn contains(&self, byte: u8) -> bool {
        self.mask[byte as usize / 64] & (1 << (byte % 64)) != 0
    }

    fn get_next_byte(&self, byte: u8) -> Option<u8> {
        let mut word = byte as usize / 64;
        let mut bits = self.mask[word] & (u64::MAX << (byte % 64));
        loop {
            if bits != 0 {
                return Some((word * 64 + bits.trailing_zeros() as usize) as u8);
            }
            word += 1;
            bits = *self.mask.get(word)?;
        }
    }

    fn insert(&mut self, byte: u8) -> bool {
        let present = self.contains(byte);
        self.mask[byte as usize / 64] |= 1 << (byte % 64);
        !present
    }

    fn remove(&mut self, byte: u8) -> bool {
        let present = self.contains(byte);
        self.mask[byte as usize / 64] &= !(1 << (byte % 64));
        present
    }

    fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(|&b| self.contains(b))
    }
}
