//! Page arenas and per-page buddy bookkeeping.
//!
//! A [`PageMemory`] is one fixed-size heap arena, created on the UI thread
//! and shared via `Arc` with the render-side allocator (which owns the
//! allocation state) and the UI-side page mirror (which resolves blocks that
//! are in transit between the threads). A [`Page`] pairs the arena with the
//! per-level bitsets that track which buddy blocks inside it are used.
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬─────────┬─────────┐
//! │  Slot 0 │  Slot 1 │  Slot 2 │   ...   │ Slot N  │
//! └─────────┴─────────┴─────────┴─────────┴─────────┘
//! level 0:  one bit per slot
//! level 1:  one bit per pair of slots
//! ...
//! level top: one bit for the whole page
//! ```

use super::LevelBitset;
use std::ptr::NonNull;
use std::sync::Arc;

/// A fixed-size, heap-backed byte arena for one allocator page.
///
/// The arena is never resized. Which thread may touch which byte ranges is
/// governed by the ownership protocol: the render thread writes through
/// blocks it holds, and the UI thread reads only blocks whose ownership has
/// been transferred to it via a queue payload.
pub struct PageMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the arena is plain bytes; exclusive access to any byte range is
// guaranteed by the block-ownership protocol, not by the type.
unsafe impl Send for PageMemory {}
unsafe impl Sync for PageMemory {}

impl PageMemory {
    /// Allocate a zero-initialized arena of `len` bytes.
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "page size must be greater than 0");
        let data = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(data) as *mut u8;
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(ptr) };
        Self { ptr, len }
    }

    /// Size of the arena in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the arena has zero length (never, by construction).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the arena as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no mutable access exists to the bytes being
    /// read, i.e. it must hold ownership of the blocks it inspects.
    #[inline]
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: caller guarantees no concurrent mutable access.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get the arena as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to the range it mutates.
    /// This returns a mutable reference from `&self` because the arena is
    /// shared via `Arc` while individual blocks are exclusively owned.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: caller guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PageMemory {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: ptr/len came from Box::into_raw of a boxed slice.
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// One installed allocation arena plus its buddy bookkeeping.
///
/// Level 0 is the finest granularity (one slot); the top level covers the
/// whole page with a single block. A bit set at any level means that block
/// is not available: it is either allocated outright, covered by a coarser
/// allocation, or closed off because something finer inside its span is
/// allocated.
pub struct Page {
    memory: Arc<PageMemory>,
    /// Bitsets indexed by level, finest first.
    levels: Box<[LevelBitset]>,
}

impl Page {
    /// Wrap an arena in fresh (fully free) bookkeeping.
    ///
    /// `num_levels` is the allocator's level count; the arena must hold
    /// `2^(num_levels-1)` slots.
    pub fn new(memory: Arc<PageMemory>, num_levels: u32) -> Self {
        let num_slots = 1usize << (num_levels - 1);
        let levels: Vec<LevelBitset> = (0..num_levels)
            .map(|level| LevelBitset::new(num_slots >> level))
            .collect();
        Self {
            memory,
            levels: levels.into_boxed_slice(),
        }
    }

    /// The backing arena.
    #[inline]
    pub fn memory(&self) -> &Arc<PageMemory> {
        &self.memory
    }

    /// Number of free blocks at `level`.
    #[inline]
    pub fn free_count(&self, level: u32) -> usize {
        self.levels[level as usize].free_count()
    }

    /// Whether the page has no live allocations at all.
    #[inline]
    pub fn is_unused(&self) -> bool {
        // The top-level block is free only when nothing in the page is used.
        let top = self.levels.len() - 1;
        self.levels[top].free_count() == 1
    }

    /// Try to acquire a block at `level`, returning its index.
    ///
    /// On success the block's bit, its entire sub-tree, and any still-free
    /// ancestors are all marked used, so no level continues to report
    /// availability through the allocated span.
    pub fn try_acquire(&mut self, level: u32) -> Option<usize> {
        if self.levels[level as usize].free_count() == 0 {
            return None;
        }
        let idx = self.levels[level as usize].find_free()?;
        self.acquire_at(level, idx);
        Some(idx)
    }

    /// Mark the block at (`level`, `idx`) and everything it shadows used.
    fn acquire_at(&mut self, level: u32, idx: usize) {
        self.levels[level as usize].mark_used(idx);

        // The allocation preempts every finer block inside its span.
        for finer in 0..level {
            let shift = (level - finer) as usize;
            let base = idx << shift;
            let bits = &mut self.levels[finer as usize];
            for i in base..base + (1 << shift) {
                bits.mark_used(i);
            }
        }

        // Close off coarser ancestors. An already-closed ancestor implies
        // all of its own ancestors are closed too, so the walk stops there.
        let mut l = level + 1;
        let mut i = idx >> 1;
        while (l as usize) < self.levels.len() {
            if !self.levels[l as usize].mark_used_if_free(i) {
                break;
            }
            l += 1;
            i >>= 1;
        }
    }

    /// Free the block at (`level`, `idx`), coalescing with its buddy.
    ///
    /// The block's bit and its sub-tree are cleared, then the merge walks
    /// upward one level at a time: while the buddy at the current level is
    /// free and a coarser level exists, the parent is reopened.
    pub fn release_at(&mut self, level: u32, idx: usize) {
        self.levels[level as usize].mark_free(idx);

        for finer in 0..level {
            let shift = (level - finer) as usize;
            let base = idx << shift;
            let bits = &mut self.levels[finer as usize];
            for i in base..base + (1 << shift) {
                bits.mark_free(i);
            }
        }

        let mut l = level;
        let mut i = idx;
        while ((l + 1) as usize) < self.levels.len() {
            if self.levels[l as usize].is_used(i ^ 1) {
                break;
            }
            self.levels[(l + 1) as usize].mark_free(i >> 1);
            l += 1;
            i >>= 1;
        }
    }

    /// Reset every level to fully free.
    pub fn reset(&mut self) {
        for bits in self.levels.iter_mut() {
            bits.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(num_levels: u32, slot_size: usize) -> Page {
        let page_size = slot_size << (num_levels - 1);
        Page::new(Arc::new(PageMemory::new(page_size)), num_levels)
    }

    #[test]
    fn test_page_memory_zeroed() {
        let mem = PageMemory::new(256);
        assert_eq!(mem.len(), 256);
        // SAFETY: sole owner, no writers.
        let bytes = unsafe { mem.as_slice() };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_page_memory_read_write() {
        let mem = PageMemory::new(64);
        // SAFETY: sole owner.
        unsafe { mem.as_mut_slice()[..5].copy_from_slice(b"hello") };
        // SAFETY: write above is complete, no other writers.
        assert_eq!(unsafe { &mem.as_slice()[..5] }, b"hello");
    }

    #[test]
    fn test_acquire_closes_ancestors_and_subtree() {
        // 4 levels -> 8 slots.
        let mut p = page(4, 64);
        assert_eq!(p.free_count(0), 8);
        assert_eq!(p.free_count(3), 1);

        let idx = p.try_acquire(0).unwrap();
        assert_eq!(idx, 0);
        // Ancestors of slot 0 are closed at every coarser level.
        assert_eq!(p.free_count(1), 3);
        assert_eq!(p.free_count(2), 1);
        assert_eq!(p.free_count(3), 0);

        // A level-1 allocation must not land inside the closed span.
        let idx1 = p.try_acquire(1).unwrap();
        assert_eq!(idx1, 1);
    }

    #[test]
    fn test_coarse_acquire_preempts_fine_blocks() {
        let mut p = page(4, 64);
        // Take the whole page.
        let top = p.try_acquire(3).unwrap();
        assert_eq!(top, 0);
        for level in 0..3 {
            assert_eq!(p.free_count(level), 0, "level {} still free", level);
        }
        assert!(p.try_acquire(0).is_none());
        assert!(!p.is_unused());

        p.release_at(3, 0);
        assert!(p.is_unused());
        assert_eq!(p.free_count(0), 8);
    }

    #[test]
    fn test_buddy_coalescing_counts() {
        let mut p = page(4, 64);
        let a = p.try_acquire(0).unwrap();
        let b = p.try_acquire(0).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(p.free_count(1), 3);

        // Freeing one of the pair does not reopen the parent.
        p.release_at(0, a);
        assert_eq!(p.free_count(1), 3);
        assert_eq!(p.free_count(0), 7);

        // Freeing both buddies reopens the parent (and, transitively, the
        // whole page here): count_free(1) gains the merged parent.
        p.release_at(0, b);
        assert_eq!(p.free_count(0), 8);
        assert_eq!(p.free_count(1), 4);
        assert!(p.is_unused());
    }

    #[test]
    fn test_merge_stops_at_used_sibling() {
        let mut p = page(4, 64);
        let _hold = p.try_acquire(1).unwrap(); // idx 0, covers slots 0-1
        let a = p.try_acquire(1).unwrap(); // idx 1, covers slots 2-3
        p.release_at(1, a);
        // Parent at level 2 stays closed while its other child is used.
        assert_eq!(p.free_count(2), 1);
        assert_eq!(p.free_count(3), 0);
    }

    #[test]
    fn test_single_level_page() {
        let mut p = page(1, 64);
        assert_eq!(p.try_acquire(0), Some(0));
        assert!(p.try_acquire(0).is_none());
        p.release_at(0, 0);
        assert!(p.is_unused());
    }
}
