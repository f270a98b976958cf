//! Heap validation and reporting.
//!
//! Validation is a read-only traversal over the core regions, the bin
//! directory and the mapping list. Strictness is staged: `Basic` checks
//! chunk-local invariants while walking each region, `Detail` additionally
//! cross-checks free-list membership against the walk, `Full` also audits
//! every list's structure. Violations go to the assertion callback; the
//! allocator never panics on one.

use std::ffi::c_void;

use fixedbitset::FixedBitSet;

use crate::heap::bins::{NBINS, NFASTBINS, UNSORTED_BIN, bin_index, is_small_index};
use crate::heap::chunk::{ALIGNMENT, Chunk, FENCE_SIZE, MIN_CHUNK_SIZE};
use crate::heap::state::HeapState;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationLevel {
    #[default]
    None,
    /// Chunk-local invariants along every core region.
    Basic,
    /// Basic plus free-list membership cross-checks.
    Detail,
    /// Detail plus structural audits of every bin and the mapping list.
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    Allocated,
    Free,
    /// Freed into a fast bin; boundary tags still read in-use.
    FastBin,
    Top,
    Fence,
    Mapped,
}

impl ChunkKind {
    fn label(self) -> &'static str {
        match self {
            ChunkKind::Allocated => "allocated",
            ChunkKind::Free => "free",
            ChunkKind::FastBin => "fastbin",
            ChunkKind::Top => "top",
            ChunkKind::Fence => "fence",
            ChunkKind::Mapped => "mapped",
        }
    }
}

/// One traversed chunk, as handed to snapshots and report visitors.
#[derive(Clone, Copy, Debug)]
pub struct ChunkInfo {
    /// Chunk header address.
    pub address: *mut u8,
    /// User data pointer.
    pub data: *mut u8,
    pub chunk_size: usize,
    pub usable_size: usize,
    pub kind: ChunkKind,
}

/// Report visitor; return `false` to stop the traversal.
pub type ReportFn = fn(info: &ChunkInfo, context: *mut c_void) -> bool;

unsafe fn classify(chunk: *mut Chunk, top: *mut Chunk) -> ChunkKind {
    unsafe {
        if Chunk::is_mmapped(chunk) {
            ChunkKind::Mapped
        } else if Chunk::is_internal(chunk) {
            ChunkKind::Fence
        } else if chunk == top {
            ChunkKind::Top
        } else if Chunk::is_fast(chunk) {
            ChunkKind::FastBin
        } else if Chunk::in_use(chunk) {
            ChunkKind::Allocated
        } else {
            ChunkKind::Free
        }
    }
}

unsafe fn info_for(chunk: *mut Chunk, kind: ChunkKind) -> ChunkInfo {
    unsafe {
        let size = Chunk::size(chunk);
        ChunkInfo {
            address: chunk.cast::<u8>(),
            data: Chunk::to_mem(chunk),
            chunk_size: size,
            usable_size: if kind == ChunkKind::Fence { 0 } else { Chunk::usable_size(chunk) },
            kind,
        }
    }
}

/// Visit every chunk of every core region (fenceposts included), then every
/// mapped chunk. Stops early when `visit` returns `false`.
///
/// # Safety
/// The heap must be quiescent (caller holds the facade lock).
pub(crate) unsafe fn walk_chunks(state: &HeapState, visit: &mut dyn FnMut(&ChunkInfo) -> bool) {
    unsafe {
        for block in state.core_blocks() {
            let fence = (*block).fence();
            let mut chunk = (*block).first_chunk();
            while chunk < fence {
                let size = Chunk::size(chunk);
                if size < MIN_CHUNK_SIZE || !size.is_multiple_of(ALIGNMENT) {
                    // Corrupt header; walking further would be unsound.
                    break;
                }
                let kind = classify(chunk, state.top);
                if !visit(&info_for(chunk, kind)) {
                    return;
                }
                chunk = Chunk::at_offset(chunk, size.cast_signed());
            }
            let mut fence_chunk = fence;
            for _ in 0..2 {
                if !visit(&info_for(fence_chunk, ChunkKind::Fence)) {
                    return;
                }
                fence_chunk = Chunk::at_offset(fence_chunk, FENCE_SIZE.cast_signed());
            }
        }
        for record in state.mmap_records() {
            if !visit(&info_for((*record).chunk, ChunkKind::Mapped)) {
                return;
            }
        }
    }
}

/// Validate the heap at the given level; violations are reported through the
/// assertion callback. Returns `true` when the heap is clean.
///
/// # Safety
/// The heap must be quiescent (caller holds the facade lock).
pub(crate) unsafe fn validate(state: &mut HeapState, level: ValidationLevel) -> bool {
    if level == ValidationLevel::None {
        return true;
    }
    let mut violations: Vec<String> = Vec::new();
    let blocks = state.core_blocks();

    // Per-region map of free-chunk slots, filled by the Basic walk and
    // consumed by the Detail membership check.
    let mut free_maps: Vec<FixedBitSet> = Vec::with_capacity(blocks.len());
    let mut fast_walked: Vec<usize> = Vec::new();
    let mut free_walked = 0usize;

    // Safety: quiescent heap, forwarded from the caller.
    unsafe {
        for &block in &blocks {
            let area = (*block).area as usize;
            let mut map = FixedBitSet::with_capacity((*block).area_size / ALIGNMENT + 1);
            scan_region(
                state.top,
                block,
                &mut violations,
                &mut map,
                &mut fast_walked,
                &mut free_walked,
            );
            debug_assert!(area.is_multiple_of(ALIGNMENT));
            free_maps.push(map);
        }

        if level >= ValidationLevel::Detail {
            check_membership(
                state,
                &blocks,
                &free_maps,
                &mut fast_walked,
                free_walked,
                &mut violations,
            );
        }
        if level >= ValidationLevel::Full {
            check_lists(state, &mut violations);
        }
    }

    let clean = violations.is_empty();
    for violation in &violations {
        state.callbacks.report_violation(violation);
    }
    clean
}

unsafe fn scan_region(
    top: *mut Chunk,
    block: *mut crate::heap::state::CoreBlock,
    violations: &mut Vec<String>,
    free_map: &mut FixedBitSet,
    fast_walked: &mut Vec<usize>,
    free_walked: &mut usize,
) {
    unsafe {
        let area = (*block).area as usize;
        let fence = (*block).fence();
        let first = (*block).first_chunk();
        let mut chunk = first;
        let mut prev_free = false;
        let mut prev_size = 0usize;

        while chunk < fence {
            let size = Chunk::size(chunk);
            if size < MIN_CHUNK_SIZE || !size.is_multiple_of(ALIGNMENT) {
                violations.push(format!("chunk {chunk:p}: bad size {size}"));
                return;
            }
            if chunk as usize + size > fence as usize {
                violations.push(format!("chunk {chunk:p}: size {size} overruns region"));
                return;
            }
            let next = Chunk::at_offset(chunk, size.cast_signed());
            let is_fast = Chunk::is_fast(chunk);
            let free = chunk != top && !is_fast && !Chunk::prev_in_use(next);

            if chunk == first && !Chunk::prev_in_use(chunk) {
                violations.push(format!(
                    "chunk {chunk:p}: region's first chunk lost PREV_IN_USE"
                ));
            }
            if prev_free {
                if Chunk::prev_in_use(chunk) {
                    violations.push(format!(
                        "chunk {chunk:p}: PREV_IN_USE set but predecessor is free"
                    ));
                } else if (*chunk).prior_size != prev_size {
                    violations.push(format!(
                        "chunk {chunk:p}: prior_size {} disagrees with predecessor size {}",
                        (*chunk).prior_size,
                        prev_size
                    ));
                }
                if free {
                    // Coalescing invariant: merges happen at free time.
                    violations.push(format!("chunk {chunk:p}: adjacent free chunks"));
                }
            } else if chunk != first && !Chunk::prev_in_use(chunk) {
                violations.push(format!(
                    "chunk {chunk:p}: PREV_IN_USE clear but predecessor is in use"
                ));
            }

            if free {
                free_map.insert((chunk as usize - area) / ALIGNMENT);
                *free_walked += 1;
            }
            if is_fast {
                fast_walked.push(chunk as usize);
            }
            prev_free = free;
            prev_size = size;
            chunk = next;
        }

        for _ in 0..2 {
            if !Chunk::is_internal(chunk) || Chunk::size(chunk) != FENCE_SIZE {
                violations.push(format!("chunk {chunk:p}: damaged fencepost"));
            }
            chunk = Chunk::at_offset(chunk, FENCE_SIZE.cast_signed());
        }
    }
}

unsafe fn check_membership(
    state: &mut HeapState,
    blocks: &[*mut crate::heap::state::CoreBlock],
    free_maps: &[FixedBitSet],
    fast_walked: &mut Vec<usize>,
    free_walked: usize,
    violations: &mut Vec<String>,
) {
    unsafe {
        let mut bin_members = 0usize;
        for index in 1..NBINS {
            let anchor = state.bins.bin_at(index);
            let mut node = (*anchor).next;
            while node != anchor {
                bin_members += 1;
                if Chunk::is_fast(node) {
                    violations.push(format!("chunk {node:p}: FAST_BIN flag inside bin {index}"));
                }
                let size = Chunk::size(node);
                if index != UNSORTED_BIN && bin_index(size) != index {
                    violations.push(format!(
                        "chunk {node:p}: size {size} filed in bin {index}, belongs in {}",
                        bin_index(size)
                    ));
                }
                let mut located = false;
                for (block, map) in blocks.iter().zip(free_maps) {
                    let area = (**block).area as usize;
                    if (node as usize) >= area && (node as usize) < area + (**block).area_size {
                        located = map.contains((node as usize - area) / ALIGNMENT);
                        break;
                    }
                }
                if !located {
                    violations.push(format!(
                        "chunk {node:p}: on bin {index} but not free in any region"
                    ));
                }
                node = (*node).next;
            }
        }
        if bin_members != free_walked {
            violations.push(format!(
                "free-list membership mismatch: {bin_members} binned, {free_walked} walked"
            ));
        }

        let mut fast_listed: Vec<usize> = Vec::new();
        for index in 0..NFASTBINS {
            let mut node = state.bins.fast_head(index);
            while !node.is_null() {
                if !Chunk::is_fast(node) {
                    violations.push(format!(
                        "chunk {node:p}: on fast bin {index} without FAST_BIN flag"
                    ));
                }
                fast_listed.push(node as usize);
                node = (*node).next;
            }
        }
        fast_listed.sort_unstable();
        fast_walked.sort_unstable();
        if fast_listed != *fast_walked {
            violations.push(format!(
                "fast-bin membership mismatch: {} listed, {} walked",
                fast_listed.len(),
                fast_walked.len()
            ));
        }
    }
}

unsafe fn check_lists(state: &mut HeapState, violations: &mut Vec<String>) {
    unsafe {
        for index in 1..NBINS {
            if !state.bins.bin_is_empty(index) && !state.bins.is_marked(index) {
                // Bits may be stale-set, never stale-clear.
                violations.push(format!("bin {index}: non-empty but unmarked in the bitmap"));
            }
            let anchor = state.bins.bin_at(index);
            let mut node = (*anchor).next;
            let mut prev_size = 0usize;
            while node != anchor {
                if (*(*node).next).prev != node || (*(*node).prev).next != node {
                    violations.push(format!("chunk {node:p}: broken links in bin {index}"));
                    break;
                }
                if index != UNSORTED_BIN && !is_small_index(index) {
                    let size = Chunk::size(node);
                    if size < prev_size {
                        violations.push(format!("bin {index}: not sorted ascending"));
                    }
                    prev_size = size;
                }
                node = (*node).next;
            }
        }

        let records = state.mmap_records();
        if records.len() != state.mmap_count {
            violations.push(format!(
                "mapping count mismatch: {} records, {} counted",
                records.len(),
                state.mmap_count
            ));
        }
        for record in records {
            let chunk = (*record).chunk;
            if !Chunk::is_mmapped(chunk) {
                violations.push(format!("chunk {chunk:p}: on mapping list without MMAPPED flag"));
            } else if Chunk::size(chunk) > (*record).map_size {
                violations.push(format!("chunk {chunk:p}: larger than its mapping"));
            }
        }
    }
}

/// Bump the auto-validation event counter; runs a validation pass when the
/// configured frequency is reached.
///
/// # Safety
/// The heap must be quiescent (caller holds the facade lock).
pub(crate) unsafe fn auto_tick(state: &mut HeapState) {
    if state.auto_frequency == 0 {
        return;
    }
    state.event_counter += 1;
    if state.event_counter >= state.auto_frequency {
        state.event_counter = 0;
        let level = state.auto_level;
        // Safety: forwarded contract.
        unsafe { validate(state, level) };
    }
}

/// Owned records for every current chunk.
///
/// # Safety
/// The heap must be quiescent (caller holds the facade lock).
pub(crate) unsafe fn snapshot(state: &HeapState) -> Vec<ChunkInfo> {
    let mut records = Vec::new();
    // Safety: forwarded contract.
    unsafe {
        walk_chunks(state, &mut |info| {
            records.push(*info);
            true
        });
    }
    records
}

/// Drive a caller visitor over the current chunks without mutating anything.
///
/// # Safety
/// The heap must be quiescent (caller holds the facade lock).
pub(crate) unsafe fn report(state: &HeapState, visitor: ReportFn, context: *mut c_void) {
    // Safety: forwarded contract.
    unsafe { walk_chunks(state, &mut |info| visitor(info, context)) };
}

fn format_record(state: &HeapState, info: &ChunkInfo) -> String {
    let field = state.callbacks.field_delimiter as char;
    let record = state.callbacks.record_delimiter as char;
    format!(
        "{}{field}{:p}{field}{}{field}{}{record}",
        info.kind.label(),
        info.data,
        info.chunk_size,
        info.usable_size,
    )
}

/// Emit one record per live allocation through the trace callback.
///
/// # Safety
/// The heap must be quiescent (caller holds the facade lock).
pub(crate) unsafe fn trace_allocated(state: &HeapState) {
    // Safety: forwarded contract.
    unsafe {
        walk_chunks(state, &mut |info| {
            if matches!(info.kind, ChunkKind::Allocated | ChunkKind::Mapped) {
                state.callbacks.trace(&format_record(state, info));
            }
            true
        });
    }
}

/// Emit one record describing the chunk that owns `ptr`.
///
/// # Safety
/// `ptr` must be a live pointer returned by this heap; caller holds the lock.
pub(crate) unsafe fn describe_chunk(state: &HeapState, ptr: *mut u8) {
    // Safety: forwarded contract.
    unsafe {
        let chunk = Chunk::from_mem(ptr);
        let info = info_for(chunk, classify(chunk, state.top));
        state.callbacks.trace(&format_record(state, &info));
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::chunk::request_to_chunk_size;
    use crate::heap::general::HeapConfig;
    use crate::heap::vm::RecordingCoreSource;

    fn recorder(text: &str, context: *mut c_void) {
        // Safety: context points at the test's Vec.
        let lines = unsafe { &mut *context.cast::<Vec<String>>() };
        lines.push(text.to_owned());
    }

    fn test_state() -> HeapState {
        let (source, _log) = RecordingCoreSource::new();
        HeapState::new(Box::new(source), &HeapConfig::default())
    }

    unsafe fn malloc(state: &mut HeapState, bytes: usize) -> *mut Chunk {
        let size = request_to_chunk_size(bytes).unwrap();
        // Safety: size came from request_to_chunk_size.
        unsafe { state.malloc_chunk(size, true).expect("allocation failed") }
    }

    #[test]
    fn test_level_ordering() {
        assert!(ValidationLevel::None < ValidationLevel::Basic);
        assert!(ValidationLevel::Basic < ValidationLevel::Detail);
        assert!(ValidationLevel::Detail < ValidationLevel::Full);
        assert_eq!(ValidationLevel::default(), ValidationLevel::None);
    }

    #[test]
    fn test_clean_heap_validates_at_every_level() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut state = test_state();
        let mut reports: Vec<String> = Vec::new();
        state.callbacks.assertion = Some((recorder, (&raw mut reports).cast()));
        // Safety: single-threaded test.
        unsafe {
            let a = malloc(&mut state, 100);
            let b = malloc(&mut state, 5000);
            let c = malloc(&mut state, 16);
            let _mapped = malloc(&mut state, 200_000);
            state.free_chunk(b);
            state.free_chunk(c);

            for level in [
                ValidationLevel::Basic,
                ValidationLevel::Detail,
                ValidationLevel::Full,
            ] {
                assert!(validate(&mut state, level), "level {level:?}: {reports:?}");
            }
            state.free_chunk(a);
        }
        assert!(reports.is_empty());
    }

    #[test]
    fn test_corrupted_header_is_reported_not_panicked() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut state = test_state();
        let mut reports: Vec<String> = Vec::new();
        state.callbacks.assertion = Some((recorder, (&raw mut reports).cast()));
        // Safety: single-threaded test; the corruption is confined to one
        // header the test never frees.
        unsafe {
            let chunk = malloc(&mut state, 100);
            let saved = (*chunk).head;
            (*chunk).head = 7; // unaligned, undersized

            assert!(!validate(&mut state, ValidationLevel::Basic));
            assert!(!reports.is_empty());
            assert!(reports[0].contains("bad size"));

            (*chunk).head = saved;
            assert!(validate(&mut state, ValidationLevel::Full));
        }
    }

    #[test]
    fn test_fast_bin_chunks_are_not_flagged_adjacent() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut state = test_state();
        let mut reports: Vec<String> = Vec::new();
        state.callbacks.assertion = Some((recorder, (&raw mut reports).cast()));
        // Safety: single-threaded test.
        unsafe {
            let a = malloc(&mut state, 16);
            let b = malloc(&mut state, 16);
            let _hold = malloc(&mut state, 16);
            state.free_chunk(a);
            state.free_chunk(b);

            // Deferred coalescing: the pair reads as in-use, not as two
            // adjacent free chunks.
            assert!(validate(&mut state, ValidationLevel::Full), "{reports:?}");

            state.clear_fast_bins();
            assert!(validate(&mut state, ValidationLevel::Full), "{reports:?}");
        }
        assert!(reports.is_empty());
    }

    #[test]
    fn test_detail_catches_stolen_free_chunk() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut state = test_state();
        let mut reports: Vec<String> = Vec::new();
        state.callbacks.assertion = Some((recorder, (&raw mut reports).cast()));
        // Safety: single-threaded test; the stolen chunk is re-filed before
        // the state drops.
        unsafe {
            let a = malloc(&mut state, 2000);
            let _hold = malloc(&mut state, 64);
            state.free_chunk(a);

            // Pull the chunk off its list behind the heap's back: the walk
            // still sees a free chunk, the bins do not.
            Chunk::unlink(a);
            assert!(!validate(&mut state, ValidationLevel::Detail));
            assert!(
                reports.iter().any(|r| r.contains("membership mismatch")),
                "{reports:?}"
            );
            state.bins.insert_unsorted(a);
        }
    }

    #[test]
    fn test_snapshot_accounts_for_every_chunk() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut state = test_state();
        // Safety: single-threaded test.
        unsafe {
            let a = malloc(&mut state, 100);
            let b = malloc(&mut state, 3000);
            let _hold = malloc(&mut state, 100);
            let _mapped = malloc(&mut state, 200_000);
            state.free_chunk(b);

            let records = snapshot(&state);
            let count = |kind: ChunkKind| records.iter().filter(|r| r.kind == kind).count();
            assert_eq!(count(ChunkKind::Fence), 2);
            assert_eq!(count(ChunkKind::Mapped), 1);
            assert_eq!(count(ChunkKind::Top), 1);
            assert_eq!(count(ChunkKind::Free), 1);
            assert!(count(ChunkKind::Allocated) >= 1);
            assert!(
                records
                    .iter()
                    .any(|r| r.data == Chunk::to_mem(a) && r.kind == ChunkKind::Allocated)
            );
        }
    }

    #[test]
    fn test_trace_uses_configured_delimiters() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut state = test_state();
        let mut lines: Vec<String> = Vec::new();
        state.callbacks.trace = Some((recorder, (&raw mut lines).cast()));
        state.callbacks.field_delimiter = b',';
        state.callbacks.record_delimiter = b';';
        // Safety: single-threaded test.
        unsafe {
            let a = malloc(&mut state, 100);
            trace_allocated(&state);
            assert_eq!(lines.len(), 1);
            assert!(lines[0].starts_with("allocated,"));
            assert!(lines[0].ends_with(';'));

            lines.clear();
            describe_chunk(&state, Chunk::to_mem(a));
            assert_eq!(lines.len(), 1);
            assert!(lines[0].contains(&format!("{}", Chunk::size(a))));
        }
    }

    #[test]
    fn test_auto_tick_frequency() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let mut state = test_state();
        let mut reports: Vec<String> = Vec::new();
        state.callbacks.assertion = Some((recorder, (&raw mut reports).cast()));
        state.auto_level = ValidationLevel::Basic;
        state.auto_frequency = 3;
        // Safety: single-threaded test; corruption confined as above.
        unsafe {
            let chunk = malloc(&mut state, 100);
            let saved = (*chunk).head;
            (*chunk).head = 7;

            auto_tick(&mut state);
            auto_tick(&mut state);
            assert!(reports.is_empty(), "below frequency, no pass runs");
            auto_tick(&mut state);
            assert!(!reports.is_empty(), "third event triggers validation");

            (*chunk).head = saved;
        }
    }
}
