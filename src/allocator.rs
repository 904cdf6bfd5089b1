use std::mem::size_of;

use crate::{
    error::{error_corrupted, Error},
    freelist::{Freelist, SlotId},
    pool::AllocatorIdx,
    repr::Slot,
};

struct Buffer<T> {
    slots: Box<[Option<T>]>,
    live: u32,
}

impl<T> Buffer<T> {
    fn new(slots_per_buffer: u32) -> Self {
        Self {
            slots: (0..slots_per_buffer).map(|_| None).collect(),
            live: 0,
        }
    }
}

/// Fixed size slot allocator for one node shape.
///
/// Slots are carved from equally sized buffers and addressed by a dense id
/// (`buffer * slots_per_buffer + offset`). Freed slots are reused lowest id first.
/// Buffers are only returned by a vacuum, which evacuates the emptiest buffers
/// by relocating their live slots into the remaining ones.
pub struct SlabAllocator<T> {
    idx: AllocatorIdx,
    slots_per_buffer: u32,
    max_buffers: Option<u32>,
    buffers: Vec<Option<Buffer<T>>>,
    /// Free slots of the buffers that aren't being evacuated
    free: Freelist,
    live: usize,
    /// Sorted indexes of the buffers being evacuated by an ongoing vacuum
    evacuating: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AllocatorStats {
    pub idx: AllocatorIdx,
    pub live: usize,
    pub free: usize,
    pub buffers: usize,
    pub slots_per_buffer: u32,
    pub memory_usage: usize,
    pub fragmentation: f64,
}

impl<T> std::fmt::Debug for SlabAllocator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabAllocator")
            .field("idx", &self.idx)
            .field("live", &self.live)
            .field("buffers", &self.buffer_count())
            .field("free", &self.free.len())
            .field("evacuating", &self.evacuating)
            .finish()
    }
}

impl<T> SlabAllocator<T> {
    pub fn new(idx: AllocatorIdx, buffer_size: usize, max_buffers: Option<u32>) -> Self {
        let slots_per_buffer = (buffer_size / size_of::<Option<T>>().max(1)).clamp(1, 1 << 16);
        Self {
            idx,
            slots_per_buffer: slots_per_buffer as u32,
            max_buffers,
            buffers: Vec::new(),
            free: Freelist::default(),
            live: 0,
            evacuating: Vec::new(),
        }
    }

    #[inline]
    pub fn idx(&self) -> AllocatorIdx {
        self.idx
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    pub fn memory_usage(&self) -> usize {
        self.buffer_count() * self.slots_per_buffer as usize * size_of::<Option<T>>()
    }

    /// Share of the allocated slots that aren't live
    pub fn fragmentation(&self) -> f64 {
        let capacity = self.buffer_count() * self.slots_per_buffer as usize;
        if capacity == 0 {
            0.0
        } else {
            1.0 - self.live as f64 / capacity as f64
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            idx: self.idx,
            live: self.live,
            free: self.free.len() as usize,
            buffers: self.buffer_count(),
            slots_per_buffer: self.slots_per_buffer,
            memory_usage: self.memory_usage(),
            fragmentation: self.fragmentation(),
        }
    }

    #[inline]
    fn locate(&self, id: SlotId) -> (usize, usize) {
        (
            (id / self.slots_per_buffer) as usize,
            (id % self.slots_per_buffer) as usize,
        )
    }

    fn grow(&mut self) -> Result<(), Error> {
        fail::fail_point!("artidx::allocate", |_| Err(Error::OutOfMemory(self.idx)));
        if self
            .max_buffers
            .is_some_and(|max| self.buffer_count() >= max as usize)
        {
            return Err(Error::OutOfMemory(self.idx));
        }
        let buffer_idx = self
            .buffers
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.buffers.len());
        let Some(first_id) = u32::try_from(buffer_idx)
            .ok()
            .and_then(|b| b.checked_mul(self.slots_per_buffer))
            .filter(|first| first.checked_add(self.slots_per_buffer).is_some())
        else {
            return Err(Error::OutOfMemory(self.idx));
        };
        self.free.free(first_id, self.slots_per_buffer)?;
        let buffer = Some(Buffer::new(self.slots_per_buffer));
        if buffer_idx == self.buffers.len() {
            self.buffers.push(buffer);
        } else {
            self.buffers[buffer_idx] = buffer;
        }
        trace!("Allocator {:?} added buffer {buffer_idx}", self.idx);
        Ok(())
    }

    /// Makes sure at least `n` slots can be allocated without failing.
    pub fn reserve(&mut self, n: u32) -> Result<(), Error> {
        while self.free.len() < n {
            self.grow()?;
        }
        Ok(())
    }

    pub fn allocate(&mut self, value: T) -> Result<Slot<T>, Error> {
        if self.free.is_empty() {
            self.grow()?;
        }
        let Some(id) = self.free.allocate() else {
            return Err(Error::OutOfMemory(self.idx));
        };
        let (b, o) = self.locate(id);
        let Some(buffer) = self.buffers[b].as_mut() else {
            panic!("Allocator {:?} freelist points to released buffer {b}", self.idx);
        };
        debug_assert!(buffer.slots[o].is_none());
        buffer.slots[o] = Some(value);
        buffer.live += 1;
        self.live += 1;
        Ok(Slot::new(id))
    }

    /// Frees the slot returning its value. Freeing a slot twice panics.
    pub fn free(&mut self, slot: Slot<T>) -> T {
        let id = slot.id();
        let value = self.take(id);
        // slots of evacuating buffers must not be handed out again
        if self
            .evacuating
            .binary_search(&(id / self.slots_per_buffer))
            .is_err()
        {
            if let Err(e) = self.free.free(id, 1) {
                panic!("Allocator {:?} double free of slot {id}: {e}", self.idx);
            }
        }
        value
    }

    fn take(&mut self, id: SlotId) -> T {
        let (b, o) = self.locate(id);
        let idx = self.idx;
        let Some(buffer) = self.buffers.get_mut(b).and_then(Option::as_mut) else {
            panic!("Allocator {idx:?} slot {id} points to a released buffer");
        };
        let Some(value) = buffer.slots[o].take() else {
            panic!("Allocator {idx:?} slot {id} isn't allocated");
        };
        buffer.live -= 1;
        self.live -= 1;
        value
    }

    #[inline]
    pub fn get(&self, slot: Slot<T>) -> &T {
        let (b, o) = self.locate(slot.id());
        match self.buffers.get(b) {
            Some(Some(buffer)) => match &buffer.slots[o] {
                Some(value) => value,
                None => panic!("Allocator {:?} dangling slot {}", self.idx, slot.id()),
            },
            _ => panic!("Allocator {:?} slot {} out of bounds", self.idx, slot.id()),
        }
    }

    #[inline]
    pub fn get_mut(&mut self, slot: Slot<T>) -> &mut T {
        let (b, o) = self.locate(slot.id());
        let idx = self.idx;
        match self.buffers.get_mut(b) {
            Some(Some(buffer)) => match &mut buffer.slots[o] {
                Some(value) => value,
                None => panic!("Allocator {idx:?} dangling slot {}", slot.id()),
            },
            _ => panic!("Allocator {idx:?} slot {} out of bounds", slot.id()),
        }
    }

    /// Flags the emptiest buffers for evacuation if enough of them could be reclaimed.
    /// Returns whether this allocator needs a vacuum.
    pub fn initialize_vacuum(&mut self, threshold: f64) -> bool {
        debug_assert!(self.evacuating.is_empty());
        let total = self.buffer_count();
        if total == 0 {
            return false;
        }
        let needed = self.live.div_ceil(self.slots_per_buffer as usize);
        let excess = total - needed;
        if excess == 0 || (excess as f64 / total as f64) < threshold {
            return false;
        }

        let mut candidates = self
            .buffers
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (b.live, std::cmp::Reverse(i))))
            .collect::<Vec<_>>();
        candidates.sort_unstable();
        self.evacuating = candidates[..excess]
            .iter()
            .map(|&(_, std::cmp::Reverse(i))| i as u32)
            .collect();
        self.evacuating.sort_unstable();
        for &b in &self.evacuating {
            self.free
                .remove(b * self.slots_per_buffer, self.slots_per_buffer);
        }
        debug!(
            "Allocator {:?} evacuating {excess} of {total} buffers ({} live slots)",
            self.idx, self.live
        );
        true
    }

    #[cfg(test)]
    pub fn is_vacuuming(&self) -> bool {
        !self.evacuating.is_empty()
    }

    #[inline]
    pub fn needs_vacuum(&self, slot: Slot<T>) -> bool {
        let b = slot.id() / self.slots_per_buffer;
        self.evacuating.binary_search(&b).is_ok()
    }

    /// Moves the value of an evacuating slot into a slot of a kept buffer.
    ///
    /// The kept buffers have room for every live slot, so relocating never grows the allocator.
    /// Fails without moving anything if the kept buffers are full, which only allocating during
    /// a vacuum can cause.
    pub fn relocate(&mut self, slot: Slot<T>) -> Result<Slot<T>, Error> {
        debug_assert!(self.needs_vacuum(slot));
        if self.free.is_empty() {
            debug_assert!(false, "Allocator {:?} has no room to relocate {}", self.idx, slot.id());
            return Err(Error::OutOfMemory(self.idx));
        }
        let value = self.take(slot.id());
        let new_slot = self.allocate(value)?;
        trace!(
            "Allocator {:?} relocated slot {} to {}",
            self.idx,
            slot.id(),
            new_slot.id()
        );
        Ok(new_slot)
    }

    /// Releases the evacuated buffers.
    /// Buffers that still hold live slots (e.g. an interrupted vacuum) are kept.
    pub fn finalize_vacuum(&mut self) -> Result<(), Error> {
        let mut released = 0;
        for b in std::mem::take(&mut self.evacuating) {
            let spb = self.slots_per_buffer;
            let Some(buffer) = self.buffers[b as usize].as_ref() else {
                continue;
            };
            if buffer.live == 0 {
                self.buffers[b as usize] = None;
                released += 1;
                continue;
            }
            warn!(
                "Allocator {:?} buffer {b} still has {} live slots after vacuum",
                self.idx, buffer.live
            );
            let free_offsets = buffer
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_none())
                .map(|(o, _)| o as u32)
                .collect::<Vec<_>>();
            for o in free_offsets {
                self.free.free(b * spb + o, 1)?;
            }
        }
        while matches!(self.buffers.last(), Some(None)) {
            self.buffers.pop();
        }
        debug!(
            "Allocator {:?} released {released} buffers, {} left",
            self.idx,
            self.buffer_count()
        );
        Ok(())
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.free.clear();
        self.evacuating.clear();
        self.live = 0;
    }

    /// Checks the internal bookkeeping against the buffers contents.
    pub fn validate(&self) -> Result<(), Error> {
        let mut live = 0;
        let mut free = 0;
        for (b, buffer) in self.buffers.iter().enumerate() {
            let Some(buffer) = buffer else {
                continue;
            };
            let occupied = buffer.slots.iter().filter(|s| s.is_some()).count();
            if occupied != buffer.live as usize {
                return Err(error_corrupted!(
                    "Allocator {:?} buffer {b} has {occupied} values but counts {}",
                    self.idx,
                    buffer.live
                ));
            }
            live += occupied;
            if self.evacuating.binary_search(&(b as u32)).is_err() {
                free += self.slots_per_buffer as usize - occupied;
            }
        }
        if live != self.live || free != self.free.len() as usize {
            return Err(error_corrupted!(
                "Allocator {:?} counts {} live and {} free, found {live} live and {free} free",
                self.idx,
                self.live,
                self.free.len()
            ));
        }
        Ok(())
    }
}
