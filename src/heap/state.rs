//! Single-threaded heap engine.
//!
//! `HeapState` owns everything behind the facade lock: the bin directory,
//! the current top chunk, the circular list of core blocks and the circular
//! list of direct mappings. All routines here assume the caller already
//! holds the owning allocator's lock (or that no other thread can reach the
//! state) and return sentinel values rather than unwinding.

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::heap::bins::{
    BinDirectory, NFASTBINS, SMALL_SIZE_LIMIT, UNSORTED_BIN, bin_index, fast_bin_index,
    is_small_index, small_bin_index,
};
use crate::heap::chunk::{
    ALIGN_MASK, ALIGNMENT, Chunk, FENCE_SIZE, INTERNAL, MIN_CHUNK_SIZE, MMAPPED, PREV_IN_USE,
    WORD, align_up,
};
use crate::heap::general::HeapConfig;
use crate::heap::hooks::{CallbackSet, HookEvent, MallocFailureFn};
use crate::heap::stats;
use crate::heap::validate::ValidationLevel;
use crate::heap::vm::CoreSource;

pub(crate) const DEFAULT_NEW_CORE_SIZE: usize = 256 * 1024;
pub(crate) const DEFAULT_MMAP_THRESHOLD: usize = 128 * 1024;
pub(crate) const DEFAULT_MAX_MMAP_COUNT: usize = 65536;
pub(crate) const DEFAULT_CONSOLIDATE_THRESHOLD: usize = 64 * 1024;
pub(crate) const DEFAULT_MAX_FAILURE_RETRIES: usize = 256;

/// Invoked instead of the provider when a donated core block is released.
pub type CoreReleaseFn = fn(base: *mut u8, size: usize, context: *mut c_void);

const CORE_HEADER_SIZE: usize = align_up(size_of::<CoreBlock>(), ALIGNMENT);
const MMAP_HEADER_SIZE: usize = align_up(size_of::<MMapRecord>(), ALIGNMENT);

/// Smallest buffer `install_core` accepts: header plus room for a top chunk
/// worth carving (four minimum chunks) plus the tail fenceposts.
const MIN_CORE_AREA: usize = 4 * MIN_CHUNK_SIZE + 2 * FENCE_SIZE;

/// Header embedded at the start of every core region, linked into a
/// circular list anchored at an out-of-line sentinel.
#[repr(C)]
pub(crate) struct CoreBlock {
    prev: *mut CoreBlock,
    next: *mut CoreBlock,
    /// Extent base as granted by the provider (or donated by the caller).
    base: *mut u8,
    total_size: usize,
    /// Bytes reserved by the provider; equals `total_size` on providers
    /// without a separate reserve/commit split.
    reserved_size: usize,
    /// Carved chunk area, ending in a double fencepost.
    pub(crate) area: *mut u8,
    pub(crate) area_size: usize,
    /// Extent came from `request_mapping` (core-exhaustion fallback).
    pub(crate) mapped: bool,
    should_free: bool,
    /// Counted in the crate-wide core gauge (provider extents only).
    counted: bool,
    release: Option<CoreReleaseFn>,
    release_context: *mut c_void,
}

impl CoreBlock {
    const ANCHOR: CoreBlock = CoreBlock {
        prev: std::ptr::null_mut(),
        next: std::ptr::null_mut(),
        base: std::ptr::null_mut(),
        total_size: 0,
        reserved_size: 0,
        area: std::ptr::null_mut(),
        area_size: 0,
        mapped: false,
        should_free: false,
        counted: false,
        release: None,
        release_context: std::ptr::null_mut(),
    };

    /// First chunk of the carved area.
    pub(crate) fn first_chunk(&self) -> *mut Chunk {
        self.area.cast::<Chunk>()
    }

    /// Address of the leading fencepost terminating the carved area.
    pub(crate) fn fence(&self) -> *mut Chunk {
        // Safety: area/area_size describe one contiguous region.
        unsafe { self.area.add(self.area_size - 2 * FENCE_SIZE).cast::<Chunk>() }
    }
}

/// Header embedded at the base of every direct mapping.
#[repr(C)]
pub(crate) struct MMapRecord {
    prev: *mut MMapRecord,
    next: *mut MMapRecord,
    base: *mut u8,
    pub(crate) map_size: usize,
    pub(crate) chunk: *mut Chunk,
}

impl MMapRecord {
    const ANCHOR: MMapRecord = MMapRecord {
        prev: std::ptr::null_mut(),
        next: std::ptr::null_mut(),
        base: std::ptr::null_mut(),
        map_size: 0,
        chunk: std::ptr::null_mut(),
    };
}

pub(crate) struct HeapState {
    pub(crate) source: Box<dyn CoreSource>,
    pub(crate) bins: BinDirectory,
    /// Bump-allocation frontier of the most recent core region; null until
    /// the first core arrives or after the top was consumed whole.
    pub(crate) top: *mut Chunk,
    /// Remainder of the most recent split, preferred for the next small
    /// request while it sits in the unsorted bin.
    pub(crate) last_remainder: *mut Chunk,
    /// Sentinels boxed for address stability.
    core_anchor: Box<CoreBlock>,
    mmap_anchor: Box<MMapRecord>,
    pub(crate) mmap_count: usize,
    pub(crate) mmap_total: usize,
    /// Cumulative non-fast freed bytes since the last consolidation.
    free_volume: usize,

    // Policy knobs, adjusted through the facade's set_option.
    pub(crate) new_core_size: usize,
    pub(crate) mmap_threshold: usize,
    pub(crate) max_mmap_count: usize,
    pub(crate) max_fast_payload: usize,
    pub(crate) consolidate_threshold: usize,
    pub(crate) max_failure_retries: usize,

    pub(crate) failure: Option<(MallocFailureFn, *mut c_void)>,
    pub(crate) callbacks: CallbackSet,

    pub(crate) auto_level: ValidationLevel,
    pub(crate) auto_frequency: usize,
    pub(crate) event_counter: usize,
}

impl HeapState {
    pub(crate) fn new(source: Box<dyn CoreSource>, config: &HeapConfig) -> Self {
        let mut state = Self {
            source,
            bins: BinDirectory::new(),
            top: std::ptr::null_mut(),
            last_remainder: std::ptr::null_mut(),
            core_anchor: Box::new(CoreBlock::ANCHOR),
            mmap_anchor: Box::new(MMapRecord::ANCHOR),
            mmap_count: 0,
            mmap_total: 0,
            free_volume: 0,
            new_core_size: config.new_core_size,
            mmap_threshold: config.mmap_threshold,
            max_mmap_count: config.max_mmap_count,
            max_fast_payload: config.max_fast_payload,
            consolidate_threshold: config.consolidate_threshold,
            max_failure_retries: config.max_failure_retries,
            failure: None,
            callbacks: CallbackSet::default(),
            auto_level: ValidationLevel::None,
            auto_frequency: 0,
            event_counter: 0,
        };
        let core: *mut CoreBlock = &mut *state.core_anchor;
        state.core_anchor.prev = core;
        state.core_anchor.next = core;
        let mmap: *mut MMapRecord = &mut *state.mmap_anchor;
        state.mmap_anchor.prev = mmap;
        state.mmap_anchor.next = mmap;
        state
    }

    /// Largest chunk size eligible for the fast bins under the current cap.
    #[inline]
    pub(crate) fn max_fast_chunk_size(&self) -> usize {
        if self.max_fast_payload == 0 {
            0
        } else {
            align_up(self.max_fast_payload + WORD, ALIGNMENT)
        }
    }

    pub(crate) fn core_blocks(&self) -> Vec<*mut CoreBlock> {
        let anchor: *const CoreBlock = &*self.core_anchor;
        let mut blocks = Vec::new();
        // Safety: list nodes are live headers linked by install_core.
        unsafe {
            let mut node = (*anchor).next;
            while node.cast_const() != anchor {
                blocks.push(node);
                node = (*node).next;
            }
        }
        blocks
    }

    pub(crate) fn mmap_records(&self) -> Vec<*mut MMapRecord> {
        let anchor: *const MMapRecord = &*self.mmap_anchor;
        let mut records = Vec::new();
        // Safety: list nodes are live headers linked by mmap_malloc.
        unsafe {
            let mut node = (*anchor).next;
            while node.cast_const() != anchor {
                records.push(node);
                node = (*node).next;
            }
        }
        records
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate one chunk of exactly-or-more `chunk_size` bytes, marked
    /// in-use. `allow_mmap` is cleared by callers that must be able to split
    /// the result (aligned and batched allocations).
    ///
    /// # Safety
    /// `chunk_size` must come from `request_to_chunk_size`.
    pub(crate) unsafe fn malloc_chunk(
        &mut self,
        chunk_size: usize,
        allow_mmap: bool,
    ) -> Option<*mut Chunk> {
        unsafe {
            // 1. Fast-bin hit: LIFO pop, no coalescing, chunk stays marked
            // in-use in its successor's boundary tag.
            if chunk_size <= self.max_fast_chunk_size() {
                let index = fast_bin_index(chunk_size);
                if index < NFASTBINS
                    && let Some(chunk) = self.bins.pop_fast(index)
                {
                    return Some(chunk);
                }
            }

            // 2. Exact small-bin hit.
            if chunk_size < SMALL_SIZE_LIMIT {
                let index = small_bin_index(chunk_size);
                if self.bins.is_marked(index) {
                    if self.bins.bin_is_empty(index) {
                        self.bins.clear_mark(index);
                    } else {
                        let anchor = self.bins.bin_at(index);
                        let victim = (*anchor).prev;
                        Chunk::unlink(victim);
                        Chunk::set_in_use(victim);
                        return Some(victim);
                    }
                }
            }

            // 3. Drain the unsorted bin: exact matches are returned on the
            // spot, everything else is filed into its proper bin so step 4
            // sees a sorted view.
            if let Some(victim) = self.drain_unsorted(chunk_size) {
                return Some(victim);
            }

            // 4. Best-fit search over the sorted bins.
            if let Some(victim) = self.binned_malloc(chunk_size) {
                return Some(victim);
            }

            // 5. Oversized requests route to a dedicated mapping.
            if allow_mmap
                && chunk_size >= self.mmap_threshold
                && self.mmap_count < self.max_mmap_count
                && let Some(victim) = self.mmap_malloc(chunk_size)
            {
                return Some(victim);
            }

            // 6. Extend the frontier; grow the arena when it is exhausted.
            if let Some(victim) = self.allocate_from_top(chunk_size) {
                return Some(victim);
            }
            if self.add_core_internal(chunk_size)
                && let Some(victim) = self.allocate_from_top(chunk_size)
            {
                return Some(victim);
            }

            // 7. Core is gone entirely; a mapping is the last resort even
            // below the threshold.
            if allow_mmap && self.mmap_count < self.max_mmap_count {
                return self.mmap_malloc(chunk_size);
            }
            None
        }
    }

    /// Unsorted-bin drain (see bins.rs): returns an exact match when one
    /// turns up, otherwise files each chunk into its sized bin.
    unsafe fn drain_unsorted(&mut self, chunk_size: usize) -> Option<*mut Chunk> {
        unsafe {
            let anchor = self.bins.bin_at(UNSORTED_BIN);
            loop {
                let victim = (*anchor).prev;
                if victim == anchor {
                    return None;
                }
                Chunk::unlink(victim);
                let size = Chunk::size(victim);

                // Last-remainder reuse: a lone remainder serving a stream of
                // similar small requests is split repeatedly instead of
                // bouncing through the bins.
                if chunk_size < SMALL_SIZE_LIMIT
                    && victim == self.last_remainder
                    && (*anchor).prev == anchor
                    && size >= chunk_size + MIN_CHUNK_SIZE
                {
                    let rest = Chunk::at_offset(victim, chunk_size.cast_signed());
                    Chunk::set_head(rest, (size - chunk_size) | PREV_IN_USE);
                    Chunk::write_free_tag(rest);
                    self.last_remainder = rest;
                    self.bins.insert_unsorted(rest);
                    Chunk::set_size(victim, chunk_size);
                    Chunk::set_in_use(victim);
                    return Some(victim);
                }
                if victim == self.last_remainder {
                    self.last_remainder = std::ptr::null_mut();
                }
                if size == chunk_size {
                    Chunk::set_in_use(victim);
                    return Some(victim);
                }
                self.bins.insert_sized(victim, size);
            }
        }
    }

    unsafe fn binned_malloc(&mut self, chunk_size: usize) -> Option<*mut Chunk> {
        unsafe {
            let mut from = bin_index(chunk_size);
            while let Some(index) = self.bins.next_marked(from) {
                if self.bins.bin_is_empty(index) {
                    self.bins.clear_mark(index);
                    from = index + 1;
                    continue;
                }
                let anchor = self.bins.bin_at(index);
                let victim = if is_small_index(index) {
                    (*anchor).prev
                } else {
                    // Large bins are sorted ascending: the first fit is the
                    // best fit. The bin holding the request's own class may
                    // contain only smaller chunks.
                    let mut node = (*anchor).next;
                    while node != anchor && Chunk::size(node) < chunk_size {
                        node = (*node).next;
                    }
                    if node == anchor {
                        from = index + 1;
                        continue;
                    }
                    node
                };
                Chunk::unlink(victim);
                let size = Chunk::size(victim);
                if size - chunk_size >= MIN_CHUNK_SIZE {
                    let rest = Chunk::at_offset(victim, chunk_size.cast_signed());
                    Chunk::set_head(rest, (size - chunk_size) | PREV_IN_USE);
                    Chunk::write_free_tag(rest);
                    self.last_remainder = rest;
                    self.bins.insert_unsorted(rest);
                    Chunk::set_size(victim, chunk_size);
                }
                Chunk::set_in_use(victim);
                return Some(victim);
            }
            None
        }
    }

    /// Carve `chunk_size` off the top chunk, consuming it whole when the
    /// leftover would be too small to stand alone.
    unsafe fn allocate_from_top(&mut self, chunk_size: usize) -> Option<*mut Chunk> {
        if self.top.is_null() {
            return None;
        }
        unsafe {
            let victim = self.top;
            let top_size = Chunk::size(victim);
            if top_size >= chunk_size + MIN_CHUNK_SIZE {
                let rest = Chunk::at_offset(victim, chunk_size.cast_signed());
                Chunk::set_head(rest, (top_size - chunk_size) | PREV_IN_USE);
                self.top = rest;
                Chunk::set_size(victim, chunk_size);
                Some(victim)
            } else if top_size >= chunk_size {
                // Whole-top grab; the fencepost behind it already carries
                // PREV_IN_USE.
                self.top = std::ptr::null_mut();
                Some(victim)
            } else {
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Free & coalescing
    // -----------------------------------------------------------------------

    /// File a chunk previously returned by `malloc_chunk`.
    ///
    /// # Safety
    /// `chunk` must be a live in-use chunk owned by this heap, freed at most
    /// once.
    pub(crate) unsafe fn free_chunk(&mut self, chunk: *mut Chunk) {
        unsafe {
            if Chunk::is_mmapped(chunk) {
                self.mmap_free(chunk);
                return;
            }
            let size = Chunk::size(chunk);
            if self.max_fast_payload > 0 && size <= self.max_fast_chunk_size() {
                // Deferred coalescing: boundary tags keep reading "in use"
                // until the fast bins are flushed.
                self.bins.push_fast(fast_bin_index(size), chunk);
                return;
            }
            if let Some(merged) = self.coalesce(chunk) {
                Chunk::write_free_tag(merged);
                self.bins.insert_unsorted(merged);
            }
            self.free_volume += size;
            if self.free_volume >= self.consolidate_threshold {
                self.free_volume = 0;
                self.clear_fast_bins();
            }
        }
    }

    /// Merge `chunk` with free physical neighbors. Returns the merged chunk
    /// with its head set, or `None` when it was absorbed into the top chunk.
    /// The caller files the result; the boundary tag is not yet written.
    unsafe fn coalesce(&mut self, chunk: *mut Chunk) -> Option<*mut Chunk> {
        unsafe {
            let mut merged = chunk;
            let mut size = Chunk::size(chunk);
            let next = Chunk::at_offset(chunk, size.cast_signed());

            if !Chunk::prev_in_use(chunk) {
                let prev = Chunk::prev_by_address(chunk);
                Chunk::unlink(prev);
                if prev == self.last_remainder {
                    self.last_remainder = std::ptr::null_mut();
                }
                size += Chunk::size(prev);
                merged = prev;
            }

            if next == self.top {
                Chunk::set_head(merged, (size + Chunk::size(next)) | PREV_IN_USE);
                self.top = merged;
                return None;
            }

            // Fenceposts and fast-binned chunks both read as in-use here,
            // which is exactly what keeps this merge safe.
            if !Chunk::in_use(next) {
                Chunk::unlink(next);
                if next == self.last_remainder {
                    self.last_remainder = std::ptr::null_mut();
                }
                size += Chunk::size(next);
            }
            Chunk::set_head(merged, size | PREV_IN_USE);
            Some(merged)
        }
    }

    /// Flush every fast bin: entries lose their `FAST_BIN` flag, coalesce
    /// with neighbors and land in the unsorted bin.
    pub(crate) unsafe fn clear_fast_bins(&mut self) {
        unsafe {
            for index in 0..NFASTBINS {
                let mut node = self.bins.take_fast_list(index);
                while !node.is_null() {
                    let after = (*node).next;
                    Chunk::clear_fast(node);
                    if let Some(merged) = self.coalesce(node) {
                        Chunk::write_free_tag(merged);
                        self.bins.insert_unsorted(merged);
                    }
                    node = after;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Realloc
    // -----------------------------------------------------------------------

    /// In-place resize. Returns the chunk (same address) on success; `None`
    /// means the caller must allocate-copy-free.
    ///
    /// # Safety
    /// `chunk` must be a live in-use chunk owned by this heap; `new_size`
    /// must come from `request_to_chunk_size`.
    pub(crate) unsafe fn realloc_chunk(
        &mut self,
        chunk: *mut Chunk,
        new_size: usize,
    ) -> Option<*mut Chunk> {
        unsafe {
            let old_size = Chunk::size(chunk);
            if Chunk::is_mmapped(chunk) {
                // The mapping backs exactly this chunk; shrinking keeps it.
                return (old_size >= new_size).then_some(chunk);
            }

            if old_size >= new_size {
                if old_size - new_size >= MIN_CHUNK_SIZE {
                    let rest = Chunk::at_offset(chunk, new_size.cast_signed());
                    Chunk::set_head(rest, (old_size - new_size) | PREV_IN_USE);
                    Chunk::set_size(chunk, new_size);
                    // rest reads as in-use until free_chunk files it.
                    self.free_chunk(rest);
                }
                return Some(chunk);
            }

            let next = Chunk::at_offset(chunk, old_size.cast_signed());
            if next == self.top {
                let total = old_size + Chunk::size(next);
                if total >= new_size + MIN_CHUNK_SIZE {
                    let rest = Chunk::at_offset(chunk, new_size.cast_signed());
                    Chunk::set_head(rest, (total - new_size) | PREV_IN_USE);
                    self.top = rest;
                    Chunk::set_size(chunk, new_size);
                    return Some(chunk);
                }
            } else if !Chunk::in_use(next) {
                let total = old_size + Chunk::size(next);
                if total >= new_size {
                    Chunk::unlink(next);
                    if next == self.last_remainder {
                        self.last_remainder = std::ptr::null_mut();
                    }
                    Chunk::set_size(chunk, total);
                    Chunk::set_in_use(chunk);
                    if total - new_size >= MIN_CHUNK_SIZE {
                        let rest = Chunk::at_offset(chunk, new_size.cast_signed());
                        Chunk::set_head(rest, (total - new_size) | PREV_IN_USE);
                        Chunk::set_size(chunk, new_size);
                        self.free_chunk(rest);
                    }
                    return Some(chunk);
                }
            }
            None
        }
    }

    // -----------------------------------------------------------------------
    // Aligned & batched allocation
    // -----------------------------------------------------------------------

    /// Allocate so that `data + offset` is `align`-aligned. `align` is a
    /// power of two >= ALIGNMENT; `offset` is ALIGNMENT-aligned (the facade
    /// validates both).
    ///
    /// # Safety
    /// `chunk_size` must come from `request_to_chunk_size`.
    pub(crate) unsafe fn malloc_aligned_chunk(
        &mut self,
        chunk_size: usize,
        align: usize,
        offset: usize,
    ) -> Option<*mut Chunk> {
        unsafe {
            // Over-allocate: slack for sliding to the alignment boundary
            // plus a viable lead chunk. Mappings are excluded because the
            // lead split below needs real boundary tags.
            let padded = chunk_size.checked_add(align + MIN_CHUNK_SIZE)?;
            let raw = self.malloc_chunk(padded, false)?;
            let mem = Chunk::to_mem(raw) as usize;
            if (mem + offset).is_multiple_of(align) {
                self.trim_tail(raw, chunk_size);
                return Some(raw);
            }

            let mut target = align_up(mem + offset, align) - offset;
            if target - mem < MIN_CHUNK_SIZE {
                // Lead too thin to stand as its own chunk; slide one more
                // alignment step (covered by the padding above).
                target += align;
            }
            let aligned = Chunk::from_mem(target as *mut u8);
            let lead = aligned as usize - raw as usize;
            let raw_size = Chunk::size(raw);
            debug_assert!(lead + chunk_size <= raw_size);

            Chunk::set_size(raw, lead);
            Chunk::set_head(aligned, (raw_size - lead) | PREV_IN_USE);
            // The lead chunk reads as in-use (aligned carries PREV_IN_USE)
            // until free_chunk files it.
            self.free_chunk(raw);
            self.trim_tail(aligned, chunk_size);
            Some(aligned)
        }
    }

    /// Split the tail off an in-use chunk when it is large enough to stand
    /// alone, and file it.
    unsafe fn trim_tail(&mut self, chunk: *mut Chunk, want: usize) {
        unsafe {
            let size = Chunk::size(chunk);
            if size - want >= MIN_CHUNK_SIZE {
                let rest = Chunk::at_offset(chunk, want.cast_signed());
                Chunk::set_head(rest, (size - want) | PREV_IN_USE);
                Chunk::set_size(chunk, want);
                self.free_chunk(rest);
            }
        }
    }

    /// One contiguous parent allocation partitioned into `chunk_sizes.len()`
    /// real in-use chunks, each with its own boundary tags. Sub-pointers are
    /// therefore independently freeable. `out` receives the data pointers.
    ///
    /// # Safety
    /// Every entry of `chunk_sizes` must come from `request_to_chunk_size`;
    /// `out.len() == chunk_sizes.len()`.
    pub(crate) unsafe fn malloc_multiple_chunks(
        &mut self,
        chunk_sizes: &[usize],
        out: &mut [*mut u8],
    ) -> bool {
        debug_assert_eq!(chunk_sizes.len(), out.len());
        let mut total: usize = 0;
        for &size in chunk_sizes {
            let Some(sum) = total.checked_add(size) else {
                return false;
            };
            total = sum;
        }
        if chunk_sizes.is_empty() {
            return true;
        }
        unsafe {
            // No mapping: the partition below needs ordinary chunks.
            let Some(parent) = self.malloc_chunk(total, false) else {
                return false;
            };
            let parent_size = Chunk::size(parent);
            let mut at = parent;
            let mut remaining = parent_size;
            let last = chunk_sizes.len() - 1;
            for (i, &size) in chunk_sizes.iter().enumerate() {
                // Any slack the parent carried goes to the final sub-chunk.
                let this = if i == last { remaining } else { size };
                if i == 0 {
                    Chunk::set_size(at, this);
                } else {
                    Chunk::set_head(at, this | PREV_IN_USE);
                }
                out[i] = Chunk::to_mem(at);
                at = Chunk::at_offset(at, this.cast_signed());
                remaining -= this;
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Core growth
    // -----------------------------------------------------------------------

    /// Install `new_top` as the allocation frontier. A non-trivial previous
    /// top is filed into the unsorted bin when `free_previous` is set.
    unsafe fn set_new_top_chunk(&mut self, new_top: *mut Chunk, free_previous: bool) {
        let old = self.top;
        self.top = new_top;
        if old.is_null() || !free_previous {
            return;
        }
        unsafe {
            if Chunk::size(old) < MIN_CHUNK_SIZE {
                // Too small to file; its fencepost keeps it pinned in-use.
                return;
            }
            Chunk::write_free_tag(old);
            self.bins.insert_unsorted(old);
        }
    }

    /// Carve a raw extent into a core region: header, one top-chunk-to-be,
    /// and a double fencepost at the tail.
    unsafe fn install_core(
        &mut self,
        base: *mut u8,
        total: usize,
        mapped: bool,
        should_free: bool,
        counted: bool,
        release: Option<CoreReleaseFn>,
        release_context: *mut c_void,
    ) -> bool {
        let start = align_up(base as usize, ALIGNMENT);
        let end = (base as usize + total) & !ALIGN_MASK;
        if end < start + CORE_HEADER_SIZE + MIN_CORE_AREA {
            return false;
        }
        unsafe {
            let block = start as *mut CoreBlock;
            let area = (start + CORE_HEADER_SIZE) as *mut u8;
            let area_size = end - (area as usize);
            block.write(CoreBlock {
                prev: std::ptr::null_mut(),
                next: std::ptr::null_mut(),
                base,
                total_size: total,
                reserved_size: total,
                area,
                area_size,
                mapped,
                should_free,
                counted,
                release,
                release_context,
            });

            // Link after the anchor.
            let anchor: *mut CoreBlock = &mut *self.core_anchor;
            let first = (*anchor).next;
            (*block).prev = anchor;
            (*block).next = first;
            (*first).prev = block;
            (*anchor).next = block;

            let top = Self::make_chunk_from_core(area, area_size);
            self.set_new_top_chunk(top, true);

            if counted {
                stats::TOTAL_CORE_BYTES.add(total);
            }
            self.callbacks.emit_event(
                HookEvent::CoreAcquired,
                0,
                total,
                std::ptr::null_mut(),
                base,
            );
        }
        true
    }

    /// Write the top chunk and tail fenceposts into a fresh chunk area.
    unsafe fn make_chunk_from_core(area: *mut u8, area_size: usize) -> *mut Chunk {
        debug_assert!((area as usize).is_multiple_of(ALIGNMENT));
        debug_assert!(area_size.is_multiple_of(ALIGNMENT));
        unsafe {
            let top = area.cast::<Chunk>();
            let top_size = area_size - 2 * FENCE_SIZE;
            Chunk::set_head(top, top_size | PREV_IN_USE);
            let fence = Chunk::at_offset(top, top_size.cast_signed());
            Chunk::set_head(fence, FENCE_SIZE | PREV_IN_USE | INTERNAL);
            (*fence).prior_size = 0;
            let fence2 = Chunk::at_offset(fence, FENCE_SIZE.cast_signed());
            Chunk::set_head(fence2, FENCE_SIZE | PREV_IN_USE | INTERNAL);
            (*fence2).prior_size = 0;
            top
        }
    }

    /// Grow the arena by at least `min_chunk` bytes of carvable space.
    /// Provider refusals shrink the request by quarters down to the minimum
    /// viable size; a mapping is the final fallback.
    pub(crate) unsafe fn add_core_internal(&mut self, min_chunk: usize) -> bool {
        let page = self.source.page_size();
        let overhead = CORE_HEADER_SIZE + 2 * FENCE_SIZE + ALIGNMENT;
        let Some(need) = min_chunk.checked_add(overhead) else {
            return false;
        };
        let floor = align_up(need, page);
        let mut attempt = floor.max(align_up(self.new_core_size, page));
        loop {
            match self.source.request_core(attempt) {
                Ok((ptr, granted)) => {
                    // Safety: fresh extent of `granted` bytes.
                    return unsafe {
                        self.install_core(
                            ptr.as_ptr(),
                            granted,
                            false,
                            true,
                            true,
                            None,
                            std::ptr::null_mut(),
                        )
                    };
                }
                Err(_) => {
                    if attempt <= floor {
                        break;
                    }
                    let next = align_up(attempt / 4 * 3, page).max(floor);
                    // Page rounding pins small candidates in place; jump to
                    // the floor for one last try instead of repeating them.
                    attempt = if next < attempt { next } else { floor };
                }
            }
        }
        match self.source.request_mapping(floor) {
            Ok((ptr, granted)) => {
                // Safety: fresh extent of `granted` bytes.
                unsafe {
                    self.install_core(
                        ptr.as_ptr(),
                        granted,
                        true,
                        true,
                        true,
                        None,
                        std::ptr::null_mut(),
                    )
                }
            }
            Err(_) => false,
        }
    }

    /// Donate a caller-owned buffer as a core region. Rejected when too
    /// small to be useful.
    ///
    /// # Safety
    /// The buffer must stay valid and unused by the caller until the heap
    /// releases it (via `release` or shutdown).
    pub(crate) unsafe fn add_core_buffer(
        &mut self,
        base: NonNull<u8>,
        size: usize,
        release: Option<CoreReleaseFn>,
        release_context: *mut c_void,
    ) -> bool {
        // Safety: forwarded contract.
        unsafe {
            self.install_core(
                base.as_ptr(),
                size,
                false,
                release.is_some(),
                false,
                release,
                release_context,
            )
        }
    }

    /// Request one provider extent of `size` bytes and install it.
    pub(crate) unsafe fn add_core_alloc(&mut self, size: usize) -> bool {
        let page = self.source.page_size();
        let size = align_up(size.max(CORE_HEADER_SIZE + MIN_CORE_AREA), page);
        match self.source.request_core(size) {
            Ok((ptr, granted)) => {
                // Safety: fresh extent of `granted` bytes.
                unsafe {
                    self.install_core(
                        ptr.as_ptr(),
                        granted,
                        false,
                        true,
                        true,
                        None,
                        std::ptr::null_mut(),
                    )
                }
            }
            Err(_) => false,
        }
    }

    /// Release wholly-unused core regions back to the provider.
    pub(crate) unsafe fn trim_core(&mut self) {
        unsafe {
            self.clear_fast_bins();
            for block in self.core_blocks() {
                let chunk = (*block).first_chunk();
                let full_size = (*block).area_size - 2 * FENCE_SIZE;
                if Chunk::size(chunk) != full_size {
                    continue;
                }
                if chunk == self.top {
                    self.top = std::ptr::null_mut();
                } else if !Chunk::in_use(chunk) {
                    Chunk::unlink(chunk);
                    if chunk == self.last_remainder {
                        self.last_remainder = std::ptr::null_mut();
                    }
                } else {
                    continue;
                }
                self.release_block(block);
            }
        }
    }

    unsafe fn release_block(&mut self, block: *mut CoreBlock) {
        unsafe {
            let prev = (*block).prev;
            let next = (*block).next;
            (*prev).next = next;
            (*next).prev = prev;

            let base = (*block).base;
            let total = (*block).total_size;
            let mapped = (*block).mapped;
            let counted = (*block).counted;
            let release = (*block).release;
            let context = (*block).release_context;
            let should_free = (*block).should_free;

            if counted {
                stats::TOTAL_CORE_BYTES.sub(total);
            }
            self.callbacks.emit_event(
                HookEvent::CoreReleased,
                0,
                total,
                base,
                std::ptr::null_mut(),
            );

            // The header lives inside the extent; nothing may touch `block`
            // past this point.
            if let Some(release) = release {
                release(base, total, context);
            } else if should_free
                && let Some(base) = NonNull::new(base)
            {
                let result = if mapped {
                    self.source.release_mapping(base, total)
                } else {
                    self.source.release_core(base, total)
                };
                if let Err(err) = result {
                    self.callbacks
                        .report_violation(&format!("core release failed: {err}"));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Direct mappings
    // -----------------------------------------------------------------------

    unsafe fn mmap_malloc(&mut self, chunk_size: usize) -> Option<*mut Chunk> {
        // Record header, alignment slack, the chunk body and a tail fence.
        let want = MMAP_HEADER_SIZE + ALIGNMENT + chunk_size + FENCE_SIZE;
        let (base, granted) = self.source.request_mapping(want).ok()?;
        unsafe {
            let base = base.as_ptr();
            let chunk_at = align_up(base as usize + MMAP_HEADER_SIZE, ALIGNMENT);
            let offset = chunk_at - base as usize;
            let body = (base as usize + granted - FENCE_SIZE - chunk_at) & !ALIGN_MASK;
            debug_assert!(body >= chunk_size);

            let chunk = chunk_at as *mut Chunk;
            // prior_size doubles as the offset back to the mapping base;
            // PREV_IN_USE never applies to mapped chunks.
            (*chunk).prior_size = offset;
            Chunk::set_head(chunk, body | MMAPPED | PREV_IN_USE);
            let fence = Chunk::at_offset(chunk, body.cast_signed());
            Chunk::set_head(fence, FENCE_SIZE | PREV_IN_USE | INTERNAL | MMAPPED);
            (*fence).prior_size = 0;

            let record = base.cast::<MMapRecord>();
            record.write(MMapRecord {
                prev: std::ptr::null_mut(),
                next: std::ptr::null_mut(),
                base,
                map_size: granted,
                chunk,
            });
            let anchor: *mut MMapRecord = &mut *self.mmap_anchor;
            let first = (*anchor).next;
            (*record).prev = anchor;
            (*record).next = first;
            (*first).prev = record;
            (*anchor).next = record;

            self.mmap_count += 1;
            self.mmap_total += granted;
            stats::TOTAL_MAPPED_BYTES.add(granted);
            stats::TOTAL_MAPPED_COUNT.add(1);
            self.callbacks.emit_event(
                HookEvent::MappingAcquired,
                0,
                granted,
                std::ptr::null_mut(),
                base,
            );
            Some(chunk)
        }
    }

    unsafe fn mmap_free(&mut self, chunk: *mut Chunk) {
        unsafe {
            let base = chunk.cast::<u8>().sub((*chunk).prior_size);
            let record = base.cast::<MMapRecord>();
            debug_assert_eq!((*record).chunk, chunk);

            let prev = (*record).prev;
            let next = (*record).next;
            (*prev).next = next;
            (*next).prev = prev;

            let map_size = (*record).map_size;
            self.mmap_count -= 1;
            self.mmap_total -= map_size;
            stats::TOTAL_MAPPED_BYTES.sub(map_size);
            stats::TOTAL_MAPPED_COUNT.sub(1);
            self.callbacks.emit_event(
                HookEvent::MappingReleased,
                0,
                map_size,
                base,
                std::ptr::null_mut(),
            );

            if let Some(base) = NonNull::new(base)
                && let Err(err) = self.source.release_mapping(base, map_size)
            {
                self.callbacks
                    .report_violation(&format!("mapping release failed: {err}"));
            }
        }
    }
}

impl Drop for HeapState {
    fn drop(&mut self) {
        // Safety: dropping with exclusive access; every pointer released
        // below was installed by this state and is never touched again.
        unsafe {
            self.clear_fast_bins();
            for record in self.mmap_records() {
                self.mmap_free((*record).chunk);
            }
            for block in self.core_blocks() {
                self.release_block(block);
            }
        }
    }
}
