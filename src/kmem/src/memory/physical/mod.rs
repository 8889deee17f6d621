//! Physical frame bookkeeping
//!
//! The [`FrameTable`] holds one [`Frame`] per 4 KiB frame of the managed arena.
//! Frames are linked into lists by index, so neither allocator ever writes into
//! the arena memory it hands out.

use core::ops::{Deref, DerefMut};

use crate::config::{ArenaConfig, FRAME_SHIFT, FRAME_SIZE, SLAB_MAX_SLOTS};
use crate::error::ConfigError;
use crate::memory::{KernelView, PhysAddr, VirtAddr};

/// Position of a frame in the frame table
pub type FrameIndex = usize;

/// Which slab list a slab frame currently sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabList {
    /// The frame allocations are served from
    Current,
    /// Has at least one free slot, not current
    Partial,
    /// No free slots
    Full,
}

/// Role of a frame.
///
/// Only the first frame of a block (its head) carries a meaningful state;
/// every other frame of the block is `Tail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Interior frame of a larger block
    Tail,
    /// Head of a free buddy block, linked on the free list of its order
    Free,
    /// Head of a block handed out by the buddy allocator
    Allocated,
    /// Carved out of the arena by `reserve`; never allocated or merged
    Reserved,
    /// Order-0 block owned by the slab of size class `class`
    Slab { class: usize, list: SlabList },
}

/// Free-slot bitmap of a slab frame; a set bit marks a free slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBitmap([u64; SLAB_MAX_SLOTS / 64]);

impl SlotBitmap {
    pub const EMPTY: Self = Self([0; SLAB_MAX_SLOTS / 64]);

    /// Mark slots `0..count` free and the rest used
    pub fn fill(&mut self, count: usize) {
        for (word_idx, word) in self.0.iter_mut().enumerate() {
            let lo = word_idx * 64;
            *word = if count >= lo + 64 {
                u64::MAX
            } else if count > lo {
                (1u64 << (count - lo)) - 1
            } else {
                0
            };
        }
    }

    /// Lowest-numbered free slot
    pub fn first_free(&self) -> Option<usize> {
        self.0
            .iter()
            .enumerate()
            .find(|(_, word)| **word != 0)
            .map(|(word_idx, word)| word_idx * 64 + word.trailing_zeros() as usize)
    }

    pub fn is_free(&self, slot: usize) -> bool {
        self.0[slot / 64] & (1 << (slot % 64)) != 0
    }

    pub fn set_free(&mut self, slot: usize) {
        self.0[slot / 64] |= 1 << (slot % 64);
    }

    pub fn set_used(&mut self, slot: usize) {
        self.0[slot / 64] &= !(1 << (slot % 64));
    }

    pub fn count_free(&self) -> usize {
        self.0.iter().map(|word| word.count_ones() as usize).sum()
    }
}

/// Descriptor of one physical frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub(crate) state: FrameState,
    /// Block order; meaningful on block heads only
    pub(crate) order: u8,
    pub(crate) prev: Option<FrameIndex>,
    pub(crate) next: Option<FrameIndex>,
    /// Free slots left; meaningful on slab frames only
    pub(crate) free_slots: u16,
    pub(crate) slots: SlotBitmap,
}

impl Frame {
    pub const EMPTY: Self = Self {
        state: FrameState::Tail,
        order: 0,
        prev: None,
        next: None,
        free_slots: 0,
        slots: SlotBitmap::EMPTY,
    };

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn order(&self) -> usize {
        self.order as usize
    }

    pub fn free_slots(&self) -> usize {
        self.free_slots as usize
    }

    /// Size class of the owning slab, if this is a slab frame
    pub fn slab_owner(&self) -> Option<usize> {
        match self.state {
            FrameState::Slab { class, .. } => Some(class),
            _ => None,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.prev.is_some() || self.next.is_some()
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Doubly-linked list of frames threaded through `Frame::prev`/`Frame::next`.
///
/// Insertion is at the head, so the most recently pushed frame is taken first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameList {
    head: Option<FrameIndex>,
    len: usize,
}

impl FrameList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub fn head(&self) -> Option<FrameIndex> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push_front(&mut self, frames: &mut [Frame], idx: FrameIndex) {
        frames[idx].prev = None;
        frames[idx].next = self.head;
        if let Some(old) = self.head {
            frames[old].prev = Some(idx);
        }
        self.head = Some(idx);
        self.len += 1;
    }

    /// Unlink `idx`, which must be on this list
    pub fn remove(&mut self, frames: &mut [Frame], idx: FrameIndex) {
        let prev = frames[idx].prev.take();
        let next = frames[idx].next.take();
        match prev {
            Some(p) => frames[p].next = next,
            None => {
                if self.head != Some(idx) {
                    crate::fatal!("frame {} is not on the list it is removed from", idx);
                }
                self.head = next;
            }
        }
        if let Some(n) = next {
            frames[n].prev = prev;
        }
        self.len -= 1;
    }

    pub fn pop_front(&mut self, frames: &mut [Frame]) -> Option<FrameIndex> {
        let idx = self.head?;
        self.remove(frames, idx);
        Some(idx)
    }

    pub fn iter<'a>(&self, frames: &'a [Frame]) -> FrameListIter<'a> {
        FrameListIter {
            frames,
            cursor: self.head,
        }
    }
}

pub struct FrameListIter<'a> {
    frames: &'a [Frame],
    cursor: Option<FrameIndex>,
}

impl Iterator for FrameListIter<'_> {
    type Item = FrameIndex;

    fn next(&mut self) -> Option<FrameIndex> {
        let idx = self.cursor?;
        self.cursor = self.frames[idx].next;
        Some(idx)
    }
}

/// One [`Frame`] per frame of the arena, plus the arena geometry.
pub struct FrameTable {
    frames: &'static mut [Frame],
    config: ArenaConfig,
}

impl FrameTable {
    /// Build a frame table over caller-provided storage.
    ///
    /// Only the first `config.total_frames()` entries of `frames` are used.
    ///
    /// # Safety
    /// Every frame of the arena must be backed by RAM and reachable at
    /// `arena_base + kernel_offset`; the mapper writes page tables through
    /// that view.
    pub unsafe fn new(
        frames: &'static mut [Frame],
        config: ArenaConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let needed = config.total_frames();
        if frames.len() < needed {
            return Err(ConfigError::FrameTableTooSmall {
                needed,
                provided: frames.len(),
            });
        }
        let frames = frames.split_at_mut(needed).0;
        frames.fill(Frame::EMPTY);
        Ok(Self { frames, config })
    }

    /// Build a frame table in a raw reservation (e.g. a linker-script region)
    ///
    /// # Safety
    /// `storage` must be valid for writes of `len` frames, suitably aligned,
    /// and never aliased afterwards. The arena contract of [`FrameTable::new`]
    /// applies as well.
    pub unsafe fn from_reservation(
        storage: *mut Frame,
        len: usize,
        config: ArenaConfig,
    ) -> Result<Self, ConfigError> {
        for i in 0..len {
            storage.add(i).write(Frame::EMPTY);
        }
        Self::new(core::slice::from_raw_parts_mut(storage, len), config)
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn max_exponent(&self) -> usize {
        self.config.max_exponent
    }

    pub fn kernel_view(&self) -> KernelView {
        KernelView::new(self.config.kernel_offset)
    }

    /// Physical address of frame `idx`
    pub fn phys_addr(&self, idx: FrameIndex) -> PhysAddr {
        PhysAddr::new(self.config.arena_base.as_usize() + (idx << FRAME_SHIFT))
    }

    /// Kernel-view address of frame `idx`
    pub fn kernel_addr(&self, idx: FrameIndex) -> VirtAddr {
        self.kernel_view().to_kernel(self.phys_addr(idx))
    }

    /// Index of the frame containing `pa`, or `None` outside the arena
    pub fn index_of(&self, pa: PhysAddr) -> Option<FrameIndex> {
        let offset = pa.as_usize().checked_sub(self.config.arena_base.as_usize())?;
        let idx = offset >> FRAME_SHIFT;
        (idx < self.frames.len()).then_some(idx)
    }

    /// Index of the frame whose kernel-view alias contains `va`
    pub fn index_of_kernel(&self, va: VirtAddr) -> Option<FrameIndex> {
        self.index_of(self.kernel_view().to_phys(va))
    }

    /// Offset of `pa` inside its frame
    pub fn frame_offset(pa: PhysAddr) -> usize {
        pa.as_usize() & (FRAME_SIZE - 1)
    }
}

impl Deref for FrameTable {
    type Target = [Frame];

    fn deref(&self) -> &[Frame] {
        self.frames
    }
}

impl DerefMut for FrameTable {
    fn deref_mut(&mut self) -> &mut [Frame] {
        self.frames
    }
}
