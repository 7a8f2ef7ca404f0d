//! Per-level block bitset for buddy bookkeeping.

/// A bitset tracking block occupancy at one buddy level.
///
/// Each bit represents one block: 0 = free, 1 = used (either allocated
/// directly or closed off by an allocation elsewhere in its span). Blocks
/// are packed into 64-bit words so a full word can be skipped with a single
/// comparison, and the first free block in a word is located with a
/// find-first-zero-bit scan.
///
/// The bitset is owned by exactly one thread (the render thread, via its
/// page), so no atomics are needed; cross-thread visibility is provided by
/// the queues and the handoff mailbox that move blocks between roles.
///
/// A running free count is maintained so the allocator can skip levels (and
/// whole pages) that have nothing available without touching the words.
pub struct LevelBitset {
    /// Packed occupancy words, 64 blocks per word.
    words: Box<[u64]>,
    /// Total number of blocks at this level.
    num_blocks: usize,
    /// Number of zero bits, kept in lockstep with `words`.
    free: usize,
}

impl LevelBitset {
    /// Create a bitset with all `num_blocks` blocks free.
    pub fn new(num_blocks: usize) -> Self {
        let num_words = num_blocks.div_ceil(64).max(1);
        Self {
            words: vec![0u64; num_words].into_boxed_slice(),
            num_blocks,
            free: num_blocks,
        }
    }

    /// Number of free blocks at this level.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Total number of blocks at this level.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.num_blocks
    }

    /// Whether the given block is currently marked used.
    #[inline]
    pub fn is_used(&self, idx: usize) -> bool {
        debug_assert!(idx < self.num_blocks, "block index out of bounds");
        self.words[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    /// Find the index of the first free block, if any.
    ///
    /// Scans word by word, skipping fully-used words, and uses a
    /// find-first-zero-bit primitive within the first candidate word.
    pub fn find_free(&self) -> Option<usize> {
        if self.free == 0 {
            return None;
        }
        for (word_idx, &word) in self.words.iter().enumerate() {
            if word == u64::MAX {
                continue;
            }
            let bit_idx = (!word).trailing_zeros() as usize;
            let idx = word_idx * 64 + bit_idx;
            if idx < self.num_blocks {
                return Some(idx);
            }
            // Only padding bits left in the last word.
            return None;
        }
        None
    }

    /// Mark a block used.
    ///
    /// Double-acquire of a block that is already used is a caller bug,
    /// checked in debug builds only.
    #[inline]
    pub fn mark_used(&mut self, idx: usize) {
        debug_assert!(idx < self.num_blocks, "block index out of bounds");
        debug_assert!(!self.is_used(idx), "double acquire of block {idx}");
        self.words[idx / 64] |= 1u64 << (idx % 64);
        self.free -= 1;
    }

    /// Mark a block used if it is currently free.
    ///
    /// Returns true if the bit changed. Used when closing off ancestor
    /// levels, where an already-closed ancestor is expected and terminates
    /// the walk.
    #[inline]
    pub fn mark_used_if_free(&mut self, idx: usize) -> bool {
        debug_assert!(idx < self.num_blocks, "block index out of bounds");
        if self.is_used(idx) {
            return false;
        }
        self.words[idx / 64] |= 1u64 << (idx % 64);
        self.free -= 1;
        true
    }

    /// Mark a block free.
    ///
    /// Freeing a block that is already free is a caller bug, checked in
    /// debug builds only.
    #[inline]
    pub fn mark_free(&mut self, idx: usize) {
        debug_assert!(idx < self.num_blocks, "block index out of bounds");
        debug_assert!(self.is_used(idx), "double free of block {idx}");
        self.words[idx / 64] &= !(1u64 << (idx % 64));
        self.free += 1;
    }

    /// Reset all blocks to free.
    pub fn reset(&mut self) {
        self.words.fill(0);
        self.free = self.num_blocks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_basic() {
        let mut bits = LevelBitset::new(10);
        assert_eq!(bits.capacity(), 10);
        assert_eq!(bits.free_count(), 10);

        assert_eq!(bits.find_free(), Some(0));
        bits.mark_used(0);
        bits.mark_used(1);
        assert_eq!(bits.free_count(), 8);
        assert_eq!(bits.find_free(), Some(2));

        bits.mark_free(0);
        assert_eq!(bits.free_count(), 9);
        assert_eq!(bits.find_free(), Some(0));
    }

    #[test]
    fn test_bitset_exhaustion() {
        let mut bits = LevelBitset::new(3);
        for i in 0..3 {
            let idx = bits.find_free().unwrap();
            assert_eq!(idx, i);
            bits.mark_used(idx);
        }
        assert_eq!(bits.free_count(), 0);
        assert_eq!(bits.find_free(), None);
    }

    #[test]
    fn test_bitset_spans_words() {
        // More than one word, not a multiple of 64.
        let mut bits = LevelBitset::new(100);
        for i in 0..100 {
            assert_eq!(bits.find_free(), Some(i), "failed at block {}", i);
            bits.mark_used(i);
        }
        assert_eq!(bits.find_free(), None);
        assert_eq!(bits.free_count(), 0);

        bits.mark_free(77);
        assert_eq!(bits.find_free(), Some(77));
    }

    #[test]
    fn test_bitset_mark_used_if_free() {
        let mut bits = LevelBitset::new(4);
        assert!(bits.mark_used_if_free(2));
        assert!(!bits.mark_used_if_free(2));
        assert_eq!(bits.free_count(), 3);
    }

    #[test]
    fn test_bitset_reset() {
        let mut bits = LevelBitset::new(65);
        bits.mark_used(0);
        bits.mark_used(64);
        bits.reset();
        assert_eq!(bits.free_count(), 65);
        assert!(!bits.is_used(64));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn test_bitset_double_free_asserts() {
        let mut bits = LevelBitset::new(4);
        bits.mark_free(1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double acquire")]
    fn test_bitset_double_acquire_asserts() {
        let mut bits = LevelBitset::new(4);
        bits.mark_used(1);
        bits.mark_used(1);
    }
}
