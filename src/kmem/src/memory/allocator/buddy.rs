//! Buddy allocator over the frame table
//!
//! The arena starts as a single free block of order `max_exponent`. Requests
//! are rounded up to a power-of-two number of frames; larger free blocks are
//! split in halves until the order fits, and freed blocks merge with their
//! buddy (`index ^ (1 << order)`) for as long as the buddy is free at the same
//! order.
//!
//! All bookkeeping lives in the [`FrameTable`]; the arena itself is never
//! touched.

use core::ops::Range;

use crate::config::{BUDDY_NUM_FREE_LISTS, FRAME_SIZE};
use crate::error::MemoryError;
use crate::memory::physical::{FrameIndex, FrameList, FrameState, FrameTable};
use crate::memory::PhysAddr;

/// A block handed out by [`BuddyAllocator::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBlock {
    index: FrameIndex,
    order: usize,
}

impl FrameBlock {
    pub const fn new(index: FrameIndex, order: usize) -> Self {
        Self { index, order }
    }

    /// Index of the head frame
    pub const fn index(&self) -> FrameIndex {
        self.index
    }

    pub const fn order(&self) -> usize {
        self.order
    }

    /// Number of frames in the block
    pub const fn frames(&self) -> usize {
        1 << self.order
    }
}

/// Counters and free-list occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyStats {
    pub free_blocks: [usize; BUDDY_NUM_FREE_LISTS],
    pub free_frames: usize,
    pub alloc_calls: usize,
    pub free_calls: usize,
    pub split_events: usize,
    pub coalesce_events: usize,
}

pub struct BuddyAllocator {
    frames: FrameTable,
    free_lists: [FrameList; BUDDY_NUM_FREE_LISTS],
    alloc_calls: usize,
    free_calls: usize,
    split_events: usize,
    coalesce_events: usize,
}

/// Smallest order whose block holds `frames` frames
fn order_for_frames(frames: usize) -> Option<usize> {
    frames
        .checked_next_power_of_two()
        .map(|n| n.trailing_zeros() as usize)
}

impl BuddyAllocator {
    /// Take over a frame table; the whole arena becomes one free block
    pub fn new(mut frames: FrameTable) -> Self {
        let max = frames.max_exponent();

        let mut free_lists: [FrameList; BUDDY_NUM_FREE_LISTS] =
            core::array::from_fn(|_| FrameList::new());
        frames[0].state = FrameState::Free;
        frames[0].order = max as u8;
        free_lists[max].push_front(&mut frames, 0);

        log::info!(
            "buddy: managing {} frames at {} (max order {})",
            frames.len(),
            frames.config().arena_base,
            max
        );

        Self {
            frames,
            free_lists,
            alloc_calls: 0,
            free_calls: 0,
            split_events: 0,
            coalesce_events: 0,
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameTable {
        &mut self.frames
    }

    pub fn max_exponent(&self) -> usize {
        self.frames.max_exponent()
    }

    /// Physical address of a block's head frame
    pub fn block_addr(&self, block: FrameBlock) -> PhysAddr {
        self.frames.phys_addr(block.index)
    }

    /// Number of free blocks on the list of `order`
    pub fn free_blocks(&self, order: usize) -> usize {
        self.free_lists.get(order).map_or(0, FrameList::len)
    }

    /// Allocate the smallest block holding at least `size` bytes.
    ///
    /// A zero-sized request gets one frame. On failure nothing is modified.
    pub fn allocate(&mut self, size: usize) -> Result<FrameBlock, MemoryError> {
        self.alloc_calls += 1;

        let frames = size.div_ceil(FRAME_SIZE).max(1);
        let max = self.max_exponent();
        let order = match order_for_frames(frames) {
            Some(order) if order <= max => order,
            _ => {
                log::warn!("buddy: request of {} bytes exceeds the arena", size);
                return Err(MemoryError::OutOfMemory);
            }
        };

        let Some(found) = (order..=max).find(|&m| !self.free_lists[m].is_empty()) else {
            log::warn!("buddy: out of memory for order {}", order);
            return Err(MemoryError::OutOfMemory);
        };

        let head = self.free_lists[found]
            .pop_front(&mut self.frames)
            .unwrap_or_else(|| crate::fatal!("free list {} emptied under us", found));
        let index = self.split_down(head, found, head, order);
        self.frames[index].state = FrameState::Allocated;

        log::trace!("buddy: allocated frame {} order {}", index, order);
        Ok(FrameBlock { index, order })
    }

    /// Return a block obtained from [`BuddyAllocator::allocate`].
    ///
    /// Halts if `block` is not currently allocated at exactly that order.
    pub fn free(&mut self, block: FrameBlock) {
        self.free_calls += 1;

        let FrameBlock { mut index, mut order } = block;
        let valid = index < self.frames.len()
            && self.frames[index].state == FrameState::Allocated
            && self.frames[index].order() == order;
        if !valid {
            crate::fatal!("invalid free of frame {} order {}", index, order);
        }

        let max = self.max_exponent();
        while order < max {
            let buddy = index ^ (1 << order);
            let frame = &self.frames[buddy];
            if frame.state != FrameState::Free || frame.order() != order {
                break;
            }
            self.free_lists[order].remove(&mut self.frames, buddy);
            self.frames[index.max(buddy)].state = FrameState::Tail;
            index = index.min(buddy);
            order += 1;
            self.coalesce_events += 1;
        }

        self.frames[index].state = FrameState::Free;
        self.frames[index].order = order as u8;
        self.free_lists[order].push_front(&mut self.frames, index);
        log::trace!("buddy: freed into frame {} order {}", index, order);
    }

    /// Take the frames covering `range` out of circulation.
    ///
    /// Frames already reserved are skipped. Returns the number of frames
    /// newly reserved. Reserving a frame that has been handed out halts.
    pub fn reserve(&mut self, range: Range<PhysAddr>) -> Result<usize, MemoryError> {
        if range.start >= range.end {
            return Ok(0);
        }
        let first = self
            .frames
            .index_of(range.start)
            .ok_or(MemoryError::OutOfRange)?;
        let last = self
            .frames
            .index_of(PhysAddr::new(range.end.as_usize() - 1))
            .ok_or(MemoryError::OutOfRange)?;

        let mut reserved = 0;
        for idx in first..=last {
            let (head, order) = self.containing_block(idx);
            let state = self.frames[head].state;
            match state {
                FrameState::Reserved => {}
                FrameState::Free => {
                    self.free_lists[order].remove(&mut self.frames, head);
                    let idx = self.split_down(head, order, idx, 0);
                    self.frames[idx].state = FrameState::Reserved;
                    reserved += 1;
                }
                state => crate::fatal!("reserving frame {} which is {:?}", idx, state),
            }
        }

        log::info!(
            "buddy: reserved {} frames in [{}, {})",
            reserved,
            range.start,
            range.end
        );
        Ok(reserved)
    }

    pub fn stats(&self) -> BuddyStats {
        let mut free_blocks = [0; BUDDY_NUM_FREE_LISTS];
        let mut free_frames = 0;
        for (order, list) in self.free_lists.iter().enumerate() {
            free_blocks[order] = list.len();
            free_frames += list.len() << order;
        }
        BuddyStats {
            free_blocks,
            free_frames,
            alloc_calls: self.alloc_calls,
            free_calls: self.free_calls,
            split_events: self.split_events,
            coalesce_events: self.coalesce_events,
        }
    }

    /// Every listed block is free, at its list's order, order aligned, and
    /// not mergeable with a free buddy.
    pub fn check_invariants(&self) -> bool {
        let max = self.max_exponent();
        for (order, list) in self.free_lists.iter().enumerate() {
            let mut seen = 0;
            for idx in list.iter(&self.frames) {
                let frame = &self.frames[idx];
                if frame.state != FrameState::Free || frame.order() != order {
                    return false;
                }
                if idx & ((1 << order) - 1) != 0 || idx + (1 << order) > self.frames.len() {
                    return false;
                }
                if order < max {
                    let buddy = &self.frames[idx ^ (1 << order)];
                    if buddy.state == FrameState::Free && buddy.order() == order {
                        return false;
                    }
                }
                seen += 1;
            }
            if seen != list.len() || (order > max && seen != 0) {
                return false;
            }
        }
        true
    }

    /// Log every non-empty free list
    pub fn dump(&self) {
        log::debug!("buddy: free lists ({} frames free)", self.stats().free_frames);
        for (order, list) in self.free_lists.iter().enumerate() {
            if list.is_empty() {
                continue;
            }
            log::debug!("  order {:2}: {} blocks", order, list.len());
            for idx in list.iter(&self.frames) {
                log::debug!("    frame {:6} at {}", idx, self.frames.phys_addr(idx));
            }
        }
    }

    /// Head index and order of the block that contains frame `idx`
    fn containing_block(&self, idx: FrameIndex) -> (FrameIndex, usize) {
        for order in 0..=self.max_exponent() {
            let head = idx & !((1 << order) - 1);
            let frame = &self.frames[head];
            if frame.state != FrameState::Tail && frame.order() >= order {
                return (head, frame.order());
            }
        }
        crate::fatal!("frame {} belongs to no block", idx)
    }

    /// Split the unlinked block `head`/`order` until the order-`target_order`
    /// block containing `target` is isolated; the other halves go back on
    /// the free lists. Returns the head of the isolated block.
    fn split_down(
        &mut self,
        mut head: FrameIndex,
        mut order: usize,
        target: FrameIndex,
        target_order: usize,
    ) -> FrameIndex {
        while order > target_order {
            order -= 1;
            let half = 1 << order;
            let (keep, spare) = if target >= head + half {
                (head + half, head)
            } else {
                (head, head + half)
            };
            self.frames[spare].state = FrameState::Free;
            self.frames[spare].order = order as u8;
            self.free_lists[order].push_front(&mut self.frames, spare);
            head = keep;
            self.split_events += 1;
        }
        self.frames[head].order = order as u8;
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestArena;

    #[test]
    fn test_order_for_frames() {
        assert_eq!(order_for_frames(1), Some(0));
        assert_eq!(order_for_frames(2), Some(1));
        assert_eq!(order_for_frames(3), Some(2));
        assert_eq!(order_for_frames(4), Some(2));
        assert_eq!(order_for_frames(5), Some(3));
        assert_eq!(order_for_frames(usize::MAX), None);
    }

    #[test]
    fn test_initial_state_is_one_block() {
        let arena = TestArena::new(4);
        let buddy = arena.buddy();
        assert_eq!(buddy.free_blocks(4), 1);
        assert_eq!(buddy.stats().free_frames, 16);
        assert!(buddy.check_invariants());
    }

    #[test]
    fn test_four_single_frames_then_free_restores_arena() {
        let arena = TestArena::new(4);
        let mut buddy = arena.buddy();

        let blocks: std::vec::Vec<_> = (0..4)
            .map(|_| buddy.allocate(FRAME_SIZE).unwrap())
            .collect();
        assert_eq!(buddy.free_blocks(4), 0);
        for block in &blocks {
            assert_eq!(block.order(), 0);
        }
        let mut indices: std::vec::Vec<_> = blocks.iter().map(|b| b.index()).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 4);
        assert!(buddy.check_invariants());

        for &i in &[2, 0, 3, 1] {
            buddy.free(blocks[i]);
            assert!(buddy.check_invariants());
        }
        assert_eq!(buddy.free_blocks(4), 1);
        assert_eq!(buddy.stats().free_frames, 16);
    }

    #[test]
    fn test_split_leaves_one_block_per_lower_order() {
        let arena = TestArena::new(4);
        let mut buddy = arena.buddy();

        let block = buddy.allocate(1).unwrap();
        assert_eq!(block, FrameBlock::new(0, 0));
        for order in 0..4 {
            assert_eq!(buddy.free_blocks(order), 1);
        }
        assert_eq!(buddy.stats().split_events, 4);
        assert_eq!(buddy.block_addr(block), arena.config().arena_base);
    }

    #[test]
    fn test_size_rounds_up_to_power_of_two_frames() {
        let arena = TestArena::new(4);
        let mut buddy = arena.buddy();

        assert_eq!(buddy.allocate(0).unwrap().order(), 0);
        assert_eq!(buddy.allocate(FRAME_SIZE + 1).unwrap().order(), 1);
        assert_eq!(buddy.allocate(3 * FRAME_SIZE).unwrap().order(), 2);
        assert!(buddy.check_invariants());
    }

    #[test]
    fn test_coalescing_round_trip() {
        let arena = TestArena::new(5);
        let mut buddy = arena.buddy();

        let a = buddy.allocate(2 * FRAME_SIZE).unwrap();
        let b = buddy.allocate(FRAME_SIZE).unwrap();
        let c = buddy.allocate(8 * FRAME_SIZE).unwrap();
        let d = buddy.allocate(FRAME_SIZE).unwrap();
        buddy.free(b);
        buddy.free(d);
        buddy.free(c);
        buddy.free(a);

        assert_eq!(buddy.free_blocks(5), 1);
        assert_eq!((0..5).map(|o| buddy.free_blocks(o)).sum::<usize>(), 0);
        assert!(buddy.stats().coalesce_events > 0);
        assert!(buddy.check_invariants());
    }

    #[test]
    fn test_out_of_memory_leaves_state_unchanged() {
        let arena = TestArena::new(4);
        let mut buddy = arena.buddy();

        assert_eq!(buddy.allocate(17 * FRAME_SIZE), Err(MemoryError::OutOfMemory));
        assert_eq!(buddy.allocate(usize::MAX), Err(MemoryError::OutOfMemory));
        assert_eq!(buddy.free_blocks(4), 1);

        let whole = buddy.allocate(16 * FRAME_SIZE).unwrap();
        assert_eq!(buddy.allocate(FRAME_SIZE), Err(MemoryError::OutOfMemory));
        buddy.free(whole);

        let blocks: std::vec::Vec<_> = (0..4)
            .map(|_| buddy.allocate(FRAME_SIZE).unwrap())
            .collect();
        assert_eq!(buddy.free_blocks(4), 0);
        for block in blocks {
            buddy.free(block);
        }
        assert_eq!(buddy.free_blocks(4), 1);
    }

    #[test]
    fn test_exhaust_every_frame() {
        let arena = TestArena::new(3);
        let mut buddy = arena.buddy();

        let blocks: std::vec::Vec<_> = (0..8)
            .map(|_| buddy.allocate(FRAME_SIZE).unwrap())
            .collect();
        assert_eq!(buddy.stats().free_frames, 0);
        assert!(buddy.allocate(FRAME_SIZE).is_err());
        for block in blocks.into_iter().rev() {
            buddy.free(block);
        }
        assert_eq!(buddy.free_blocks(3), 1);
    }

    #[test]
    #[should_panic(expected = "invalid free")]
    fn test_double_free_halts() {
        let arena = TestArena::new(3);
        let mut buddy = arena.buddy();
        let block = buddy.allocate(FRAME_SIZE).unwrap();
        buddy.free(block);
        buddy.free(block);
    }

    #[test]
    #[should_panic(expected = "invalid free")]
    fn test_free_with_wrong_order_halts() {
        let arena = TestArena::new(3);
        let mut buddy = arena.buddy();
        let block = buddy.allocate(2 * FRAME_SIZE).unwrap();
        buddy.free(FrameBlock::new(block.index(), 0));
    }

    #[test]
    fn test_reserve_carves_frames_out() {
        let arena = TestArena::new(4);
        let mut buddy = arena.buddy();
        let base = arena.config().arena_base.as_usize();

        let start = PhysAddr::new(base + 5 * FRAME_SIZE);
        let end = PhysAddr::new(base + 7 * FRAME_SIZE - 1);
        assert_eq!(buddy.reserve(start..end), Ok(2));
        assert_eq!(buddy.reserve(start..end), Ok(0));
        assert_eq!(buddy.stats().free_frames, 14);
        assert_eq!(buddy.frames()[5].state(), FrameState::Reserved);
        assert_eq!(buddy.frames()[6].state(), FrameState::Reserved);
        assert!(buddy.check_invariants());

        let blocks: std::vec::Vec<_> = (0..14)
            .map(|_| buddy.allocate(FRAME_SIZE).unwrap())
            .collect();
        assert!(blocks.iter().all(|b| b.index() != 5 && b.index() != 6));
        assert!(buddy.allocate(FRAME_SIZE).is_err());
    }

    #[test]
    fn test_reserve_outside_arena_is_rejected() {
        let arena = TestArena::new(2);
        let mut buddy = arena.buddy();
        let base = arena.config().arena_base.as_usize();
        let range = PhysAddr::new(base + 3 * FRAME_SIZE)..PhysAddr::new(base + 5 * FRAME_SIZE);
        assert_eq!(buddy.reserve(range), Err(MemoryError::OutOfRange));
        assert_eq!(buddy.free_blocks(2), 1);
    }
}
