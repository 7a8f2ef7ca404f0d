//! Page-based buddy allocator.
//!
//! The allocator subdivides fixed-size pages into power-of-two spans of
//! slots. Level 0 is one slot; level L covers `slot_size * 2^L` bytes; the
//! top level covers a whole page, which is also the largest supported
//! allocation. The allocator never grows its own memory: new pages are
//! prepared elsewhere (on the UI thread) and installed with [`push_page`].
//!
//! Allocation failure is an expected outcome, not an error; callers defer
//! the work and request growth.
//!
//! [`push_page`]: BuddyAllocator::push_page

use super::{Page, PageMemory};
use std::sync::Arc;

/// Opaque handle to an allocated block: page index, level, byte offset.
///
/// A `Block` is stored value-wise by callers and resolved to bytes through
/// the allocator (or the UI-side page mirror) rather than carrying a raw
/// address. At every instant a block is owned by exactly one place: the
/// allocator's in-use bitset, a queue payload in transit, the handoff
/// mailbox, or the UI-side tracking maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    page: u32,
    level: u32,
    offset: u32,
}

impl Block {
    /// Sentinel for "no block"; freeing it is a no-op.
    pub const EMPTY: Block = Block {
        page: u32::MAX,
        level: u32::MAX,
        offset: u32::MAX,
    };

    pub(crate) fn new(page: u32, level: u32, offset: u32) -> Self {
        Self {
            page,
            level,
            offset,
        }
    }

    /// Index of the page this block lives in.
    #[inline]
    pub fn page_index(&self) -> usize {
        self.page as usize
    }

    /// Buddy level of this block.
    #[inline]
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Byte offset within the page.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    /// Whether this is the empty sentinel.
    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Block::EMPTY
    }

    pub(crate) fn raw_parts(&self) -> (u32, u32, u32) {
        (self.page, self.level, self.offset)
    }
}

/// Buddy allocator over a set of installed pages.
///
/// Single-threaded by design: the render thread owns it exclusively and the
/// protocol layers move memory in and out. `levels` and `slot_size` are
/// fixed at construction and determine the page size
/// (`slot_size * 2^(levels-1)`), which is the maximum single allocation.
pub struct BuddyAllocator {
    levels: u32,
    slot_size: usize,
    pages: Vec<Page>,
    bytes_allocated: usize,
}

impl BuddyAllocator {
    /// Create an empty allocator with the given geometry.
    ///
    /// `levels` must be in `1..=24` and `slot_size` nonzero; both are
    /// validated by the orchestrator's config before reaching here.
    pub fn new(levels: u32, slot_size: usize) -> Self {
        debug_assert!(levels >= 1 && levels <= 24, "unreasonable level count");
        debug_assert!(slot_size > 0, "slot size must be nonzero");
        Self {
            levels,
            slot_size,
            pages: Vec::new(),
            bytes_allocated: 0,
        }
    }

    /// Number of buddy levels.
    #[inline]
    pub fn levels(&self) -> u32 {
        self.levels
    }

    /// Smallest allocation granularity in bytes.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Size of one page, the maximum single allocation.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.slot_size << (self.levels - 1)
    }

    /// Span in bytes of a block at `level`.
    #[inline]
    pub fn level_bytes(&self, level: u32) -> usize {
        self.slot_size << level
    }

    /// Number of installed pages.
    #[inline]
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Bytes currently held by live blocks (at block granularity).
    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Total bytes across all installed pages.
    #[inline]
    pub fn bytes_reserved(&self) -> usize {
        self.pages.len() * self.page_size()
    }

    /// Number of free blocks at `level` summed over all pages.
    pub fn count_free(&self, level: u32) -> usize {
        self.pages.iter().map(|p| p.free_count(level)).sum()
    }

    /// The minimal level whose span can hold `size` bytes.
    #[inline]
    pub fn level_for_size(&self, size: usize) -> u32 {
        let slots = size.max(self.slot_size).div_ceil(self.slot_size);
        slots.next_power_of_two().trailing_zeros()
    }

    /// Try to allocate a block of at least `size` bytes.
    ///
    /// Returns `None` if no free block of the required level exists in any
    /// installed page. Sizes above one page are unsupported; this is a
    /// caller bug (debug-asserted), distinct from ordinary exhaustion, and
    /// also yields `None` in release builds.
    pub fn try_allocate(&mut self, size: usize) -> Option<Block> {
        debug_assert!(
            size <= self.page_size(),
            "allocation of {size} bytes exceeds page size {}",
            self.page_size()
        );
        if size > self.page_size() {
            return None;
        }

        let level = self.level_for_size(size);
        for (page_idx, page) in self.pages.iter_mut().enumerate() {
            if let Some(idx) = page.try_acquire(level) {
                self.bytes_allocated += self.slot_size << level;
                let offset = idx * (self.slot_size << level);
                return Some(Block::new(page_idx as u32, level, offset as u32));
            }
        }
        None
    }

    /// Free a previously allocated block, coalescing buddies where possible.
    ///
    /// Freeing [`Block::EMPTY`] is a no-op.
    pub fn free(&mut self, block: Block) {
        if block.is_empty() {
            return;
        }
        debug_assert!(block.page_index() < self.pages.len(), "stale page index");
        debug_assert!(block.level() < self.levels, "block level out of range");
        let span = self.slot_size << block.level();
        debug_assert!(block.offset() % span == 0, "misaligned block offset");

        let idx = block.offset() / span;
        self.pages[block.page_index()].release_at(block.level(), idx);
        self.bytes_allocated -= span;
    }

    /// Install an additional page arena.
    ///
    /// Called only by the render thread, with memory prepared by the UI
    /// thread. The arena must already be sized to [`page_size`].
    ///
    /// [`page_size`]: BuddyAllocator::page_size
    pub fn push_page(&mut self, memory: Arc<PageMemory>) {
        debug_assert_eq!(memory.len(), self.page_size(), "page arena has wrong size");
        self.pages.push(Page::new(memory, self.levels));
    }

    /// Resolve a block to its full span of bytes.
    pub fn block_bytes(&self, block: Block) -> &[u8] {
        let span = self.level_bytes(block.level());
        let page = &self.pages[block.page_index()];
        // SAFETY: the caller holds the block, so per the ownership protocol
        // nothing else reads or writes this range.
        let bytes = unsafe { page.memory().as_slice() };
        &bytes[block.offset()..block.offset() + span]
    }

    /// Resolve a block to its full span of bytes, mutably.
    pub fn block_bytes_mut(&mut self, block: Block) -> &mut [u8] {
        let span = self.level_bytes(block.level());
        let page = &self.pages[block.page_index()];
        // SAFETY: as for `block_bytes`, plus `&mut self` keeps the
        // allocator itself from being used while the slice is live.
        let bytes = unsafe { page.memory().as_mut_slice() };
        &mut bytes[block.offset()..block.offset() + span]
    }

    /// Mark every page fully free and zero the allocation counter.
    pub fn clear(&mut self) {
        for page in &mut self.pages {
            page.reset();
        }
        self.bytes_allocated = 0;
    }

    /// Drop fully-empty pages from the tail of the page list.
    ///
    /// Only trailing pages are removed so that page indices embedded in
    /// live blocks stay valid.
    pub fn shrink_to_fit(&mut self) {
        while self.pages.last().is_some_and(|p| p.is_unused()) {
            self.pages.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4 levels, 64-byte slots: 8 slots, 512-byte pages.
    fn allocator_with_pages(n: usize) -> BuddyAllocator {
        let mut alloc = BuddyAllocator::new(4, 64);
        for _ in 0..n {
            alloc.push_page(Arc::new(PageMemory::new(alloc.page_size())));
        }
        alloc
    }

    #[test]
    fn test_geometry() {
        let alloc = allocator_with_pages(0);
        assert_eq!(alloc.page_size(), 512);
        assert_eq!(alloc.num_pages(), 0);
        assert_eq!(alloc.bytes_reserved(), 0);
    }

    #[test]
    fn test_level_for_size_is_minimal() {
        let alloc = allocator_with_pages(0);
        assert_eq!(alloc.level_for_size(0), 0);
        assert_eq!(alloc.level_for_size(1), 0);
        assert_eq!(alloc.level_for_size(64), 0);
        assert_eq!(alloc.level_for_size(65), 1);
        assert_eq!(alloc.level_for_size(128), 1);
        assert_eq!(alloc.level_for_size(129), 2);
        assert_eq!(alloc.level_for_size(512), 3);
    }

    #[test]
    fn test_allocate_without_pages_fails() {
        let mut alloc = allocator_with_pages(0);
        assert!(alloc.try_allocate(64).is_none());
    }

    #[test]
    fn test_allocate_free_roundtrip() {
        let mut alloc = allocator_with_pages(1);
        let block = alloc.try_allocate(100).unwrap();
        assert_eq!(block.level(), 1);
        assert_eq!(alloc.bytes_allocated(), 128);

        alloc.free(block);
        assert_eq!(alloc.bytes_allocated(), 0);
        assert!(alloc.pages[0].is_unused());
    }

    #[test]
    fn test_free_empty_block_is_noop() {
        let mut alloc = allocator_with_pages(1);
        alloc.free(Block::EMPTY);
        assert_eq!(alloc.bytes_allocated(), 0);
    }

    #[test]
    fn test_live_blocks_never_overlap() {
        let mut alloc = allocator_with_pages(1);
        let mut live = Vec::new();
        // Mixed sizes until exhaustion.
        for size in [64, 128, 64, 256, 64, 64, 128] {
            if let Some(b) = alloc.try_allocate(size) {
                live.push((b, alloc.level_bytes(b.level())));
            }
        }
        for (i, (a, a_span)) in live.iter().enumerate() {
            for (b, b_span) in live.iter().skip(i + 1) {
                if a.page_index() != b.page_index() {
                    continue;
                }
                let a_end = a.offset() + a_span;
                let b_end = b.offset() + b_span;
                assert!(
                    a_end <= b.offset() || b_end <= a.offset(),
                    "blocks overlap: {:?} and {:?}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_all_freed_returns_to_empty() {
        let mut alloc = allocator_with_pages(2);
        let mut blocks = Vec::new();
        loop {
            match alloc.try_allocate(64) {
                Some(b) => blocks.push(b),
                None => break,
            }
        }
        assert_eq!(blocks.len(), 16);
        assert_eq!(alloc.bytes_allocated(), 1024);

        for b in blocks {
            alloc.free(b);
        }
        assert_eq!(alloc.bytes_allocated(), 0);
        assert!(alloc.pages.iter().all(|p| p.is_unused()));
    }

    #[test]
    fn test_coalescing_adjusts_free_counts() {
        let mut alloc = allocator_with_pages(2);
        assert_eq!(alloc.count_free(0), 16);
        assert_eq!(alloc.count_free(1), 8);

        let a = alloc.try_allocate(64).unwrap();
        let b = alloc.try_allocate(64).unwrap();
        let before = alloc.count_free(1);
        alloc.free(a);
        let mid = alloc.count_free(0);
        alloc.free(b);
        // Freeing both buddies of a level-0 pair gains exactly one parent
        // and the two level-0 blocks.
        assert_eq!(alloc.count_free(1), before + 1);
        assert_eq!(alloc.count_free(0), mid + 1);
        assert_eq!(alloc.count_free(0), 16);
    }

    #[test]
    fn test_allocation_skips_full_pages() {
        let mut alloc = allocator_with_pages(2);
        // Fill page 0 completely.
        let whole = alloc.try_allocate(512).unwrap();
        assert_eq!(whole.page_index(), 0);
        // Next allocation must land in page 1.
        let b = alloc.try_allocate(64).unwrap();
        assert_eq!(b.page_index(), 1);
    }

    #[test]
    fn test_block_bytes_roundtrip() {
        let mut alloc = allocator_with_pages(1);
        let block = alloc.try_allocate(64).unwrap();
        alloc.block_bytes_mut(block)[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&alloc.block_bytes(block)[..4], &[1, 2, 3, 4]);
        assert_eq!(alloc.block_bytes(block).len(), 64);
        alloc.free(block);
    }

    #[test]
    fn test_clear() {
        let mut alloc = allocator_with_pages(1);
        let _ = alloc.try_allocate(512).unwrap();
        alloc.clear();
        assert_eq!(alloc.bytes_allocated(), 0);
        assert!(alloc.try_allocate(512).is_some());
    }

    #[test]
    fn test_shrink_to_fit_drops_only_trailing_empty_pages() {
        let mut alloc = allocator_with_pages(3);
        // Keep a block live in page 1; pages 0 and 2 stay empty.
        let whole = alloc.try_allocate(512).unwrap();
        alloc.free(whole);
        let held = alloc.try_allocate(512).unwrap(); // page 0
        alloc.free(held);
        let b = {
            // Occupy page 1 by filling page 0 first.
            let fill = alloc.try_allocate(512).unwrap();
            let b = alloc.try_allocate(64).unwrap();
            alloc.free(fill);
            b
        };
        assert_eq!(b.page_index(), 1);

        alloc.shrink_to_fit();
        // Page 2 dropped; pages 0 and 1 retained (page 1 is live, page 0
        // precedes it).
        assert_eq!(alloc.num_pages(), 2);
        alloc.free(b);
        alloc.shrink_to_fit();
        assert_eq!(alloc.num_pages(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "exceeds page size")]
    fn test_oversized_allocation_asserts() {
        let mut alloc = allocator_with_pages(1);
        let _ = alloc.try_allocate(513);
    }
}
