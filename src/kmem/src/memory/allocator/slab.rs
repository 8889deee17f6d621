//! Slab allocator for small objects
//!
//! One [`SlabAllocator`] serves one size class (`16 << class` bytes, 16..=512).
//! Each slab frame is a single buddy frame split into equal slots; the slot
//! bitmap and free counter live in the frame's [`Frame`] descriptor, never in
//! the frame itself.
//!
//! A slab keeps one *current* frame that allocations are served from, a list
//! of *partial* frames and a list of *full* frames. An exhausted current frame
//! is retired to the full list on the next allocation; a full frame that gets
//! a slot back moves to the partial list. Frames are never returned to the
//! buddy allocator.
//!
//! [`Frame`]: crate::memory::physical::Frame

use crate::config::{FRAME_SIZE, SLAB_OBJ_MIN_SIZE_EXP};
use crate::error::MemoryError;
use crate::memory::allocator::buddy::BuddyAllocator;
use crate::memory::physical::{FrameIndex, FrameList, FrameState, FrameTable, SlabList};
use crate::memory::PhysAddr;

/// Per-class usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabStats {
    pub unit_size: usize,
    /// Frames held by this slab (current + partial + full)
    pub frames: usize,
    /// Free slots across all held frames
    pub free_slots: usize,
    pub allocations: usize,
    pub frees: usize,
    /// Frames requested from the buddy allocator
    pub frame_requests: usize,
}

pub struct SlabAllocator {
    class: usize,
    unit_size: usize,
    slots_per_frame: usize,
    current: Option<FrameIndex>,
    partial: FrameList,
    full: FrameList,
    allocations: usize,
    frees: usize,
    frame_requests: usize,
}

impl SlabAllocator {
    /// Empty slab for size class `class`; no frame is taken until the first
    /// allocation
    pub const fn new(class: usize) -> Self {
        let unit_size = 1 << (class + SLAB_OBJ_MIN_SIZE_EXP);
        Self {
            class,
            unit_size,
            slots_per_frame: FRAME_SIZE / unit_size,
            current: None,
            partial: FrameList::new(),
            full: FrameList::new(),
            allocations: 0,
            frees: 0,
            frame_requests: 0,
        }
    }

    pub fn class(&self) -> usize {
        self.class
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn slots_per_frame(&self) -> usize {
        self.slots_per_frame
    }

    /// Hand out one slot; takes a frame from `buddy` when no held frame has room
    pub fn allocate(&mut self, buddy: &mut BuddyAllocator) -> Result<PhysAddr, MemoryError> {
        let class = self.class;
        let frames = buddy.frames_mut();

        if let Some(cur) = self.current {
            if frames[cur].free_slots == 0 {
                frames[cur].state = FrameState::Slab { class, list: SlabList::Full };
                self.full.push_front(frames, cur);
                self.current = None;
            }
        }

        let cur = match self.current {
            Some(cur) => cur,
            None => {
                let idx = match self.partial.pop_front(frames) {
                    Some(idx) => idx,
                    None => self.take_frame(buddy)?,
                };
                self.current = Some(idx);
                idx
            }
        };

        let frames = buddy.frames_mut();
        frames[cur].state = FrameState::Slab { class, list: SlabList::Current };
        let slot = frames[cur]
            .slots
            .first_free()
            .unwrap_or_else(|| crate::fatal!("slab {} frame {} has no free slot", class, cur));
        frames[cur].slots.set_used(slot);
        frames[cur].free_slots -= 1;
        self.allocations += 1;

        Ok(PhysAddr::new(
            frames.phys_addr(cur).as_usize() + slot * self.unit_size,
        ))
    }

    /// Return the slot at `pa`.
    ///
    /// Halts if `pa` is not the start of an allocated slot of this slab.
    pub fn free(&mut self, buddy: &mut BuddyAllocator, pa: PhysAddr) {
        let class = self.class;
        let frames = buddy.frames_mut();

        let Some(idx) = frames.index_of(pa) else {
            crate::fatal!("slab {}: free of {} outside the arena", class, pa);
        };
        let list = match frames[idx].state {
            FrameState::Slab { class: owner, list } if owner == class => list,
            state => crate::fatal!("slab {}: free of {} in a {:?} frame", class, pa, state),
        };

        let offset = FrameTable::frame_offset(pa);
        if offset % self.unit_size != 0 {
            crate::fatal!("slab {}: {} is not slot aligned", class, pa);
        }
        let slot = offset / self.unit_size;
        if frames[idx].slots.is_free(slot) {
            crate::fatal!("slab {}: double free of {}", class, pa);
        }

        frames[idx].slots.set_free(slot);
        frames[idx].free_slots += 1;
        self.frees += 1;

        if list == SlabList::Full {
            self.full.remove(frames, idx);
            frames[idx].state = FrameState::Slab { class, list: SlabList::Partial };
            self.partial.push_front(frames, idx);
        }
    }

    pub fn stats(&self, frames: &FrameTable) -> SlabStats {
        let held = self
            .current
            .into_iter()
            .chain(self.partial.iter(frames))
            .chain(self.full.iter(frames));
        let (count, free_slots) =
            held.fold((0, 0), |(count, free), idx| (count + 1, free + frames[idx].free_slots()));
        SlabStats {
            unit_size: self.unit_size,
            frames: count,
            free_slots,
            allocations: self.allocations,
            frees: self.frees,
            frame_requests: self.frame_requests,
        }
    }

    /// Every held frame is owned by this class, sits on the list its state
    /// names, and its counter agrees with its bitmap
    pub fn check_invariants(&self, frames: &FrameTable) -> bool {
        let consistent = |idx: FrameIndex, list: SlabList| {
            let frame = &frames[idx];
            frame.state == FrameState::Slab { class: self.class, list }
                && frame.order() == 0
                && frame.free_slots() == frame.slots.count_free()
                && frame.free_slots() <= self.slots_per_frame
        };

        if let Some(cur) = self.current {
            if !consistent(cur, SlabList::Current) {
                return false;
            }
        }
        self.partial
            .iter(frames)
            .all(|idx| consistent(idx, SlabList::Partial) && frames[idx].free_slots() > 0)
            && self
                .full
                .iter(frames)
                .all(|idx| consistent(idx, SlabList::Full) && frames[idx].free_slots() == 0)
    }

    fn take_frame(&mut self, buddy: &mut BuddyAllocator) -> Result<FrameIndex, MemoryError> {
        let block = buddy.allocate(FRAME_SIZE)?;
        self.frame_requests += 1;

        let idx = block.index();
        let frame = &mut buddy.frames_mut()[idx];
        frame.slots.fill(self.slots_per_frame);
        frame.free_slots = self.slots_per_frame as u16;
        log::debug!(
            "slab {}: took frame {} ({} slots of {} bytes)",
            self.class,
            idx,
            self.slots_per_frame,
            self.unit_size
        );
        Ok(idx)
    }
}
