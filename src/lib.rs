//! Adaptive radix tree (ART) for secondary indexes.
//!
//! Maps byte keys to sets of row ids. Nodes of each shape live in their own slab allocator
//! and reference each other through compact [Node] handles, which lets the tree be vacuumed
//! into fewer buffers and handed to a persistence layer as [PackedNode]s.

#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_more;

mod allocator;
mod art;
mod error;
mod freelist;
mod index;
mod inner;
mod iter;
mod key;
mod leaf;
mod leaf_bytes;
mod legacy;
mod node;
mod options;
mod pool;
mod prefix;
mod repr;
mod utils;

#[cfg(test)]
mod tests;

pub use allocator::AllocatorStats;
pub use art::Art;
pub use error::Error;
pub use index::ArtIndex;
pub use iter::Iter;
pub use key::{row_key, ArtKey, ROW_KEY_LEN};
pub use options::ArtOptions;
pub use pool::{AllocationCounts, AllocatorIdx, AllocatorSet, ArenaPool};
pub use repr::{NType, Node, PackedNode, RowId};

#[cfg(fuzzing)]
pub use freelist::Freelist;
