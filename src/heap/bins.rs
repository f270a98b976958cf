//! Bin directory: 128 circular free lists plus the fast-bin cache.
//!
//! Bin 0 is unused, bin 1 holds unsorted chunks awaiting classification.
//! Small bins (2..=63) are exact size classes spaced 16 bytes apart; large
//! bins (64..) cover ascending size ranges with staged spacing and keep
//! their members sorted by ascending size so a forward scan finds the best
//! fit. A two-word bitmap tracks which bins are plausibly non-empty; bits
//! are set eagerly and cleared lazily when a scan finds a bin drained.

use crate::heap::chunk::Chunk;

pub(crate) const NBINS: usize = 128;
pub(crate) const UNSORTED_BIN: usize = 1;

/// Chunk sizes below this go to exact-size small bins.
pub(crate) const SMALL_SIZE_LIMIT: usize = 1024;

/// Fast bins cover chunk sizes 32..=96, one class per 16 bytes.
pub(crate) const NFASTBINS: usize = 5;

/// Hard upper bound on the payload size eligible for fast binning.
pub(crate) const MAX_FAST_PAYLOAD_LIMIT: usize = 80;
pub(crate) const DEFAULT_MAX_FAST_PAYLOAD: usize = 64;

const MAP_WORDS: usize = NBINS / 64;

#[inline]
pub(crate) fn small_bin_index(size: usize) -> usize {
    size >> 4
}

/// Bin index for a chunk size. Small sizes map to exact classes; large
/// sizes use staged spacing (64 B steps, then 512 B, 4 KiB, 32 KiB, 256 KiB).
/// Monotone: a larger size never maps to a smaller bin.
pub(crate) fn bin_index(size: usize) -> usize {
    if size < SMALL_SIZE_LIMIT {
        return small_bin_index(size);
    }
    if (size >> 6) <= 48 {
        48 + (size >> 6)
    } else if (size >> 9) <= 20 {
        91 + (size >> 9)
    } else if (size >> 12) <= 10 {
        110 + (size >> 12)
    } else if (size >> 15) <= 4 {
        119 + (size >> 15)
    } else if (size >> 18) <= 2 {
        124 + (size >> 18)
    } else {
        NBINS - 1
    }
}

#[inline]
pub(crate) fn is_small_index(index: usize) -> bool {
    index < small_bin_index(SMALL_SIZE_LIMIT)
}

#[inline]
pub(crate) fn fast_bin_index(chunk_size: usize) -> usize {
    (chunk_size >> 4) - 2
}

/// The free-list directory of one heap. Sentinels live in a boxed array so
/// their addresses stay put regardless of where the owning state moves.
pub(crate) struct BinDirectory {
    bins: Box<[Chunk; NBINS]>,
    map: [u64; MAP_WORDS],
    fast: [*mut Chunk; NFASTBINS],
}

impl BinDirectory {
    pub(crate) fn new() -> Self {
        let mut bins = Box::new([Chunk::SENTINEL; NBINS]);
        for bin in bins.iter_mut() {
            let me: *mut Chunk = bin;
            bin.prev = me;
            bin.next = me;
        }
        Self {
            bins,
            map: [0; MAP_WORDS],
            fast: [std::ptr::null_mut(); NFASTBINS],
        }
    }

    #[inline]
    pub(crate) fn bin_at(&mut self, index: usize) -> *mut Chunk {
        &mut self.bins[index]
    }

    #[inline]
    pub(crate) fn bin_is_empty(&self, index: usize) -> bool {
        let sentinel: *const Chunk = &self.bins[index];
        self.bins[index].next.cast_const() == sentinel
    }

    #[inline]
    pub(crate) fn mark(&mut self, index: usize) {
        self.map[index / 64] |= 1 << (index % 64);
    }

    #[inline]
    pub(crate) fn clear_mark(&mut self, index: usize) {
        self.map[index / 64] &= !(1 << (index % 64));
    }

    #[inline]
    pub(crate) fn is_marked(&self, index: usize) -> bool {
        self.map[index / 64] & (1 << (index % 64)) != 0
    }

    /// First bin index >= `from` whose bitmap bit is set. The bit promises
    /// nothing: it may be stale-set (the scan clears those), never
    /// stale-clear.
    pub(crate) fn next_marked(&self, from: usize) -> Option<usize> {
        if from >= NBINS {
            return None;
        }
        let mut word = from / 64;
        let mut bits = self.map[word] & (!0u64 << (from % 64));
        loop {
            if bits != 0 {
                return Some(word * 64 + bits.trailing_zeros() as usize);
            }
            word += 1;
            if word >= MAP_WORDS {
                return None;
            }
            bits = self.map[word];
        }
    }

    /// File a free chunk into the unsorted bin (head insertion).
    ///
    /// # Safety
    /// `chunk` must be a live free chunk not on any list.
    pub(crate) unsafe fn insert_unsorted(&mut self, chunk: *mut Chunk) {
        let anchor = self.bin_at(UNSORTED_BIN);
        unsafe { Chunk::link_after(anchor, chunk) };
        self.mark(UNSORTED_BIN);
    }

    /// File a free chunk of known size into its proper small or large bin.
    ///
    /// # Safety
    /// `chunk` must be a live free chunk not on any list, with `size`
    /// matching its header.
    pub(crate) unsafe fn insert_sized(&mut self, chunk: *mut Chunk, size: usize) {
        let index = bin_index(size);
        let anchor = self.bin_at(index);
        unsafe {
            if is_small_index(index) {
                // exact class; order within the bin is irrelevant
                Chunk::link_after(anchor, chunk);
            } else {
                // keep large bins sorted ascending
                let mut node = (*anchor).next;
                while node != anchor && Chunk::size(node) < size {
                    node = (*node).next;
                }
                Chunk::link_after((*node).prev, chunk);
            }
        }
        self.mark(index);
    }

    #[inline]
    pub(crate) fn fast_head(&self, index: usize) -> *mut Chunk {
        self.fast[index]
    }

    pub(crate) fn has_fast_chunks(&self) -> bool {
        self.fast.iter().any(|head| !head.is_null())
    }

    /// Push onto a fast bin (LIFO, singly linked through `next`).
    ///
    /// # Safety
    /// `chunk` must be a live chunk not on any list.
    pub(crate) unsafe fn push_fast(&mut self, index: usize, chunk: *mut Chunk) {
        unsafe {
            (*chunk).next = self.fast[index];
            Chunk::set_fast(chunk);
        }
        self.fast[index] = chunk;
    }

    pub(crate) unsafe fn pop_fast(&mut self, index: usize) -> Option<*mut Chunk> {
        let head = self.fast[index];
        if head.is_null() {
            return None;
        }
        unsafe {
            self.fast[index] = (*head).next;
            Chunk::clear_fast(head);
        }
        Some(head)
    }

    /// Detach an entire fast-bin list for consolidation. Entries keep their
    /// `FAST_BIN` flag; the caller clears it as it walks.
    pub(crate) fn take_fast_list(&mut self, index: usize) -> *mut Chunk {
        std::mem::replace(&mut self.fast[index], std::ptr::null_mut())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::chunk::{ALIGNMENT, MIN_CHUNK_SIZE, PREV_IN_USE};

    #[test]
    fn test_small_bins_are_exact_classes() {
        let mut size = MIN_CHUNK_SIZE;
        let mut expect = 2;
        while size < SMALL_SIZE_LIMIT {
            assert_eq!(bin_index(size), expect, "size {size}");
            assert!(is_small_index(bin_index(size)));
            size += ALIGNMENT;
            expect += 1;
        }
    }

    #[test]
    fn test_bin_index_monotone() {
        let mut prev = 0;
        let mut size = MIN_CHUNK_SIZE;
        while size < 4 * 1024 * 1024 {
            let index = bin_index(size);
            assert!(index >= prev, "index regressed at size {size}");
            assert!(index < NBINS);
            prev = index;
            size += ALIGNMENT;
        }
    }

    #[test]
    fn test_large_bin_boundaries() {
        assert_eq!(bin_index(SMALL_SIZE_LIMIT), 64);
        assert!(!is_small_index(bin_index(SMALL_SIZE_LIMIT)));
        assert_eq!(bin_index(1024 * 1024), NBINS - 1);
    }

    #[test]
    fn test_fast_bin_index_range() {
        assert_eq!(fast_bin_index(MIN_CHUNK_SIZE), 0);
        let max_fast_chunk = crate::heap::chunk::align_up(
            MAX_FAST_PAYLOAD_LIMIT + crate::heap::chunk::WORD,
            ALIGNMENT,
        );
        assert_eq!(fast_bin_index(max_fast_chunk), NFASTBINS - 1);
    }

    #[test]
    fn test_bitmap_scan() {
        let mut dir = BinDirectory::new();
        assert_eq!(dir.next_marked(0), None);

        dir.mark(1);
        dir.mark(63);
        dir.mark(100);
        assert_eq!(dir.next_marked(0), Some(1));
        assert_eq!(dir.next_marked(2), Some(63));
        assert_eq!(dir.next_marked(64), Some(100));
        assert_eq!(dir.next_marked(101), None);

        dir.clear_mark(63);
        assert_eq!(dir.next_marked(2), Some(100));
    }

    #[repr(align(16))]
    struct Arena([u8; 4096]);

    fn chunk_in(arena: &mut Box<Arena>, offset: usize, size: usize) -> *mut Chunk {
        let c = unsafe { arena.0.as_mut_ptr().add(offset).cast::<Chunk>() };
        unsafe { Chunk::set_head(c, size | PREV_IN_USE) };
        c
    }

    #[test]
    fn test_large_bin_sorted_insert() {
        let mut arena = Box::new(Arena([0; 4096]));
        let mut dir = BinDirectory::new();

        let big = chunk_in(&mut arena, 0, 1056);
        let small = chunk_in(&mut arena, 1056, 1024);
        let mid = chunk_in(&mut arena, 2112, 1040);

        unsafe {
            dir.insert_sized(big, 1056);
            dir.insert_sized(small, 1024);
            dir.insert_sized(mid, 1040);
        }

        // 1024, 1040 and 1056 share a large bin; expect ascending order.
        let index = bin_index(1024);
        assert_eq!(index, bin_index(1056));
        let anchor = dir.bin_at(index);
        unsafe {
            assert_eq!((*anchor).next, small);
            assert_eq!((*small).next, mid);
            assert_eq!((*mid).next, big);
            assert_eq!((*big).next, anchor);
        }
        assert!(dir.is_marked(index));
    }

    #[test]
    fn test_fast_bin_lifo() {
        let mut arena = Box::new(Arena([0; 4096]));
        let mut dir = BinDirectory::new();
        assert!(!dir.has_fast_chunks());

        let a = chunk_in(&mut arena, 0, 48);
        let b = chunk_in(&mut arena, 48, 48);
        let index = fast_bin_index(48);
        unsafe {
            dir.push_fast(index, a);
            dir.push_fast(index, b);
            assert!(Chunk::is_fast(a));
            assert!(dir.has_fast_chunks());

            assert_eq!(dir.pop_fast(index), Some(b));
            assert!(!Chunk::is_fast(b), "pop must clear the fast flag");
            assert_eq!(dir.pop_fast(index), Some(a));
            assert_eq!(dir.pop_fast(index), None);
        }
        assert!(!dir.has_fast_chunks());
    }

    #[test]
    fn test_take_fast_list_detaches() {
        let mut arena = Box::new(Arena([0; 4096]));
        let mut dir = BinDirectory::new();

        let a = chunk_in(&mut arena, 0, 32);
        let index = fast_bin_index(32);
        unsafe { dir.push_fast(index, a) };

        let head = dir.take_fast_list(index);
        assert_eq!(head, a);
        assert!(dir.fast_head(index).is_null());
        assert!(!dir.has_fast_chunks());
    }
}
