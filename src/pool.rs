use crate::{
    allocator::{AllocatorStats, SlabAllocator},
    error::Error,
    inner::{Node16, Node256, Node4, Node48},
    key::ROW_KEY_LEN,
    leaf_bytes::{Node15Leaf, Node256Leaf, Node7Leaf},
    legacy::DeprecatedLeaf,
    options::ArtOptions,
    prefix::{InlinedPrefix, Prefix},
    repr::Slot,
};

pub const ALLOCATOR_COUNT: usize = 10;

/// Index of the allocator of each arena backed node shape
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[repr(u8)]
pub enum AllocatorIdx {
    Prefix = 0,
    LeafDeprecated = 1,
    Node4 = 2,
    Node16 = 3,
    Node48 = 4,
    Node256 = 5,
    PrefixInlined = 6,
    Node7Leaf = 7,
    Node15Leaf = 8,
    Node256Leaf = 9,
}

impl AllocatorIdx {
    pub const ALL: [AllocatorIdx; ALLOCATOR_COUNT] = [
        Self::Prefix,
        Self::LeafDeprecated,
        Self::Node4,
        Self::Node16,
        Self::Node48,
        Self::Node256,
        Self::PrefixInlined,
        Self::Node7Leaf,
        Self::Node15Leaf,
        Self::Node256Leaf,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Live slot count per allocator, indexed by [AllocatorIdx::index]
pub type AllocationCounts = [usize; ALLOCATOR_COUNT];

/// Set of allocators, e.g. the ones flagged for a vacuum
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AllocatorSet(u16);

impl AllocatorSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self((1 << ALLOCATOR_COUNT) - 1)
    }

    #[inline]
    pub fn contains(&self, idx: AllocatorIdx) -> bool {
        self.0 & (1 << idx as u16) != 0
    }

    #[inline]
    pub fn insert(&mut self, idx: AllocatorIdx) {
        self.0 |= 1 << idx as u16;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = AllocatorIdx> + '_ {
        AllocatorIdx::ALL.into_iter().filter(|&i| self.contains(i))
    }
}

impl FromIterator<AllocatorIdx> for AllocatorSet {
    fn from_iter<I: IntoIterator<Item = AllocatorIdx>>(iter: I) -> Self {
        let mut set = Self::empty();
        for i in iter {
            set.insert(i);
        }
        set
    }
}

/// A node shape stored in its own [SlabAllocator] of the [ArenaPool].
pub trait ArenaNode: Sized {
    const IDX: AllocatorIdx;

    fn allocator(pool: &ArenaPool) -> &SlabAllocator<Self>;

    fn allocator_mut(pool: &mut ArenaPool) -> &mut SlabAllocator<Self>;
}

macro_rules! arena_nodes {
    ($($field:ident: $ty:ty => $idx:ident,)*) => {
        /// The allocators of all arena backed node shapes of a tree.
        #[derive(Debug)]
        pub struct ArenaPool {
            prefix_count: usize,
            $($field: SlabAllocator<$ty>,)*
        }

        impl ArenaPool {
            pub fn new(opts: &ArtOptions) -> Self {
                Self {
                    prefix_count: opts.prefix_count as usize,
                    $($field: SlabAllocator::new(
                        AllocatorIdx::$idx,
                        opts.buffer_size,
                        opts.max_buffers_per_allocator,
                    ),)*
                }
            }

            fn slabs(&self) -> [&dyn SlabOps; ALLOCATOR_COUNT] {
                let mut slabs = [$(&self.$field as &dyn SlabOps,)*];
                slabs.sort_by_key(|s| s.idx());
                slabs
            }

            fn slabs_mut(&mut self) -> [&mut dyn SlabOps; ALLOCATOR_COUNT] {
                let mut slabs = [$(&mut self.$field as &mut dyn SlabOps,)*];
                slabs.sort_by_key(|s| s.idx());
                slabs
            }
        }

        $(
            impl ArenaNode for $ty {
                const IDX: AllocatorIdx = AllocatorIdx::$idx;

                #[inline]
                fn allocator(pool: &ArenaPool) -> &SlabAllocator<Self> {
                    &pool.$field
                }

                #[inline]
                fn allocator_mut(pool: &mut ArenaPool) -> &mut SlabAllocator<Self> {
                    &mut pool.$field
                }
            }
        )*
    };
}

arena_nodes! {
    prefixes: Prefix => Prefix,
    deprecated_leaves: DeprecatedLeaf => LeafDeprecated,
    node4s: Node4 => Node4,
    node16s: Node16 => Node16,
    node48s: Node48 => Node48,
    node256s: Node256 => Node256,
    inlined_prefixes: InlinedPrefix => PrefixInlined,
    node7_leaves: Node7Leaf => Node7Leaf,
    node15_leaves: Node15Leaf => Node15Leaf,
    node256_leaves: Node256Leaf => Node256Leaf,
}

/// Type erased allocator operations, used for whole pool operations.
trait SlabOps {
    fn idx(&self) -> AllocatorIdx;
    fn live(&self) -> usize;
    fn memory_usage(&self) -> usize;
    fn stats(&self) -> AllocatorStats;
    fn reserve(&mut self, n: u32) -> Result<(), Error>;
    fn initialize_vacuum(&mut self, threshold: f64) -> bool;
    fn finalize_vacuum(&mut self) -> Result<(), Error>;
    fn clear(&mut self);
    fn validate(&self) -> Result<(), Error>;
}

impl<T> SlabOps for SlabAllocator<T> {
    fn idx(&self) -> AllocatorIdx {
        SlabAllocator::idx(self)
    }

    fn live(&self) -> usize {
        SlabAllocator::live(self)
    }

    fn memory_usage(&self) -> usize {
        SlabAllocator::memory_usage(self)
    }

    fn stats(&self) -> AllocatorStats {
        SlabAllocator::stats(self)
    }

    fn reserve(&mut self, n: u32) -> Result<(), Error> {
        SlabAllocator::reserve(self, n)
    }

    fn initialize_vacuum(&mut self, threshold: f64) -> bool {
        SlabAllocator::initialize_vacuum(self, threshold)
    }

    fn finalize_vacuum(&mut self) -> Result<(), Error> {
        SlabAllocator::finalize_vacuum(self)
    }

    fn clear(&mut self) {
        SlabAllocator::clear(self)
    }

    fn validate(&self) -> Result<(), Error> {
        SlabAllocator::validate(self)
    }
}

impl ArenaPool {
    /// Number of key bytes stored in each prefix segment
    #[inline]
    pub fn prefix_count(&self) -> usize {
        self.prefix_count
    }

    #[inline]
    pub fn get<T: ArenaNode>(&self, slot: Slot<T>) -> &T {
        T::allocator(self).get(slot)
    }

    #[inline]
    pub fn get_mut<T: ArenaNode>(&mut self, slot: Slot<T>) -> &mut T {
        T::allocator_mut(self).get_mut(slot)
    }

    #[inline]
    pub fn alloc<T: ArenaNode>(&mut self, value: T) -> Result<Slot<T>, Error> {
        T::allocator_mut(self).allocate(value)
    }

    #[inline]
    pub fn free<T: ArenaNode>(&mut self, slot: Slot<T>) -> T {
        T::allocator_mut(self).free(slot)
    }

    #[inline]
    pub fn needs_vacuum<T: ArenaNode>(&self, slot: Slot<T>) -> bool {
        T::allocator(self).needs_vacuum(slot)
    }

    #[inline]
    pub fn relocate<T: ArenaNode>(&mut self, slot: Slot<T>) -> Result<Slot<T>, Error> {
        T::allocator_mut(self).relocate(slot)
    }

    pub fn live_counts(&self) -> AllocationCounts {
        self.slabs().map(|s| s.live())
    }

    pub fn live(&self, idx: AllocatorIdx) -> usize {
        self.slabs()[idx.index()].live()
    }

    pub fn memory_usage(&self) -> usize {
        self.slabs().iter().map(|s| s.memory_usage()).sum()
    }

    pub fn stats(&self) -> Vec<AllocatorStats> {
        self.slabs().iter().map(|s| s.stats()).collect()
    }

    /// Makes sure `n` slots can be allocated from the allocator `idx` without failing.
    pub fn reserve(&mut self, idx: AllocatorIdx, n: u32) -> Result<(), Error> {
        self.slabs_mut()[idx.index()].reserve(n)
    }

    /// Reserves the slots needed by the worst case of a single insert or delete of a
    /// `key_len` bytes key, so that no allocation can fail once the tree is being modified.
    pub fn reserve_update(&mut self, key_len: usize) -> Result<(), Error> {
        let chain = (key_len + ROW_KEY_LEN).div_ceil(self.prefix_count);
        for idx in AllocatorIdx::ALL {
            let n = match idx {
                AllocatorIdx::Prefix => 2 * chain + 4,
                AllocatorIdx::PrefixInlined => 10,
                AllocatorIdx::LeafDeprecated => 0,
                _ => 2,
            };
            self.reserve(idx, n as u32)?;
        }
        Ok(())
    }

    /// Flags the allocators that are fragmented enough to be vacuumed.
    pub fn initialize_vacuum(&mut self, threshold: f64) -> AllocatorSet {
        self.slabs_mut()
            .into_iter()
            .filter_map(|s| s.initialize_vacuum(threshold).then(|| s.idx()))
            .collect()
    }

    pub fn finalize_vacuum(&mut self, set: AllocatorSet) -> Result<(), Error> {
        let mut slabs = self.slabs_mut();
        for idx in set.iter() {
            slabs[idx.index()].finalize_vacuum()?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        for s in self.slabs_mut() {
            s.clear();
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.slabs().iter().try_for_each(|s| s.validate())
    }
}
