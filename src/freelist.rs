use crate::error::Error;
use smallvec::SmallVec;

pub type SlotId = u32;

// Allocators rarely have more than a handful of holes between vacuums
type RangeVec = SmallVec<Range, 8>;

/// Free slot ids of a slab allocator.
///
/// Ids are tracked as ranges so whole buffers can be added and removed cheaply.
/// Allocations always take the lowest free id, which keeps live slots packed
/// towards the first buffers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Freelist {
    /// Invariant: all ranges are non-empty, disjoint, non-adjacent and sorted ascending
    ranges: RangeVec,
    len: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[debug("Range({start}..{end})")]
struct Range {
    start: SlotId,
    /// Exclusive
    end: SlotId,
}

#[cfg(any(test, fuzzing))]
impl Range {
    #[inline]
    fn span(&self) -> u32 {
        self.end - self.start
    }
}

macro_rules! freelist_error {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::FreeList(Box::new(msg))
    }}
}

impl Freelist {
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
        self.len = 0;
    }

    /// Returns `span` slots starting at `start` to the freelist.
    /// Errors if any of the slots is already free.
    pub fn free(&mut self, start: SlotId, span: u32) -> Result<(), Error> {
        debug_assert!(span > 0);
        let Some(end) = start.checked_add(span) else {
            return Err(freelist_error!("Range overflow {start} + {span}"));
        };
        let pos = self.ranges.partition_point(|r| r.start < start);
        if let Some(prev) = pos.checked_sub(1).map(|p| self.ranges[p]) {
            if prev.end > start {
                return Err(freelist_error!(
                    "Freeing {start}..{end} overlaps with free range {prev:?}"
                ));
            }
        }
        if let Some(next) = self.ranges.get(pos) {
            if next.start < end {
                return Err(freelist_error!(
                    "Freeing {start}..{end} overlaps with free range {next:?}"
                ));
            }
        }

        let merge_prev = pos > 0 && self.ranges[pos - 1].end == start;
        let merge_next = self.ranges.get(pos).is_some_and(|n| n.start == end);
        match (merge_prev, merge_next) {
            (true, true) => {
                let next_end = self.ranges[pos].end;
                self.ranges[pos - 1].end = next_end;
                self.ranges.remove(pos);
            }
            (true, false) => self.ranges[pos - 1].end = end,
            (false, true) => self.ranges[pos].start = start,
            (false, false) => self.ranges.insert(pos, Range { start, end }),
        }
        self.len += span;
        #[cfg(any(test, fuzzing))]
        debug_assert!(self.validate());
        Ok(())
    }

    /// Takes the lowest free slot, if any.
    pub fn allocate(&mut self) -> Option<SlotId> {
        let first = self.ranges.first_mut()?;
        let id = first.start;
        first.start += 1;
        if first.start == first.end {
            self.ranges.remove(0);
        }
        self.len -= 1;
        Some(id)
    }

    /// Removes the free slots in `start..start + span` from the freelist.
    /// Returns how many slots were removed.
    pub fn remove(&mut self, start: SlotId, span: u32) -> u32 {
        let end = start.saturating_add(span);
        let first = self.ranges.partition_point(|r| r.end <= start);
        if self.ranges.get(first).is_none_or(|r| r.start >= end) {
            return 0;
        }
        let mut removed = 0;
        let mut kept = RangeVec::new();
        for (i, r) in self.ranges.iter().enumerate() {
            if i < first || r.start >= end {
                kept.push(*r);
                continue;
            }
            removed += r.end.min(end) - r.start.max(start);
            if r.start < start {
                kept.push(Range {
                    start: r.start,
                    end: start,
                });
            }
            if r.end > end {
                kept.push(Range { start: end, end: r.end });
            }
        }
        self.ranges = kept;
        self.len -= removed;
        #[cfg(any(test, fuzzing))]
        debug_assert!(self.validate());
        removed
    }

    #[cfg(any(test, fuzzing))]
    pub fn contains(&self, id: SlotId) -> bool {
        let pos = self.ranges.partition_point(|r| r.end <= id);
        self.ranges.get(pos).is_some_and(|r| r.start <= id)
    }

    #[cfg(any(test, fuzzing))]
    pub fn iter_spans(&self) -> impl DoubleEndedIterator<Item = (SlotId, u32)> + '_ {
        self.ranges.iter().map(|r| (r.start, r.span()))
    }

    #[cfg(any(test, fuzzing))]
    pub fn iter_slots(&self) -> impl DoubleEndedIterator<Item = SlotId> + '_ {
        self.ranges.iter().flat_map(|r| r.start..r.end)
    }

    #[cfg(any(test, fuzzing))]
    fn validate(&self) -> bool {
        let sorted = self
            .ranges
            .windows(2)
            .all(|w| w[0].end < w[1].start && w[0].start < w[0].end);
        let non_empty = self.ranges.iter().all(|r| r.start < r.end);
        let len = self.ranges.iter().map(Range::span).sum::<u32>();
        sorted && non_empty && len == self.len
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    impl Freelist {
        fn from_set(set: &BTreeSet<u32>) -> Self {
            let mut a = Freelist::default();
            for &slot in set {
                a.free(slot, 1).unwrap();
            }
            a
        }

        fn to_set(&self) -> BTreeSet<u32> {
            self.iter_slots().collect()
        }
    }

    proptest! {
        #[test]
        fn freelist_free_any_order(slots in prop::collection::btree_set(0u32..2_000, 0..500).prop_map(|s| s.into_iter().collect::<Vec<_>>()).prop_shuffle()) {
            let mut a = Freelist::default();
            for &s in &slots {
                a.free(s, 1).unwrap();
            }
            prop_assert!(a.validate());
            prop_assert_eq!(a.to_set(), slots.iter().copied().collect::<BTreeSet<_>>());
        }

        #[test]
        fn freelist_remove(set in prop::collection::btree_set(0u32..1_000, 0..500), start in 0u32..1_000, span in 0u32..300) {
            let mut a = Freelist::from_set(&set);
            let removed = a.remove(start, span);
            let expected = set.iter().filter(|&&s| s >= start && s < start + span).count() as u32;
            prop_assert_eq!(removed, expected);
            prop_assert!(a.validate());
            prop_assert_eq!(a.len() as usize, set.len() - expected as usize);
        }

        #[test]
        fn freelist_allocate_in_order(set in prop::collection::btree_set(0u32..1_000, 0..500)) {
            let mut a = Freelist::from_set(&set);
            let allocated = std::iter::from_fn(|| a.allocate()).collect::<Vec<_>>();
            prop_assert_eq!(allocated, set.into_iter().collect::<Vec<_>>());
        }
    }
}
