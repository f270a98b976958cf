//! `GeneralAllocator`: the public facade.
//!
//! Every public operation runs as one critical section under a recursive
//! lock; the actual work happens in `state.rs`. The lock is recursive
//! because the malloc-failure callback (and aligned-allocation trims) call
//! back into the allocator while it is already held.

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::heap::bins::{DEFAULT_MAX_FAST_PAYLOAD, MAX_FAST_PAYLOAD_LIMIT};
use crate::heap::chunk::{ALIGNMENT, Chunk, request_to_chunk_size};
use crate::heap::hooks::{AssertionFn, HookEvent, HookFn, MallocFailureFn, TraceFn};
use crate::heap::state::{
    CoreReleaseFn, DEFAULT_CONSOLIDATE_THRESHOLD, DEFAULT_MAX_FAILURE_RETRIES,
    DEFAULT_MAX_MMAP_COUNT, DEFAULT_MMAP_THRESHOLD, DEFAULT_NEW_CORE_SIZE, HeapState,
};
use crate::heap::validate::{self, ChunkInfo, ReportFn, ValidationLevel};
use crate::heap::vm::{CoreSource, HeapError, PlatformCoreSource};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{cell, hint, thread};

/// `malloc_with_flags`: zero the returned payload (the calloc path).
pub const FLAG_ZEROED: u32 = 1;

/// Initialization-time configuration. Runtime-adjustable knobs can also be
/// changed later through [`GeneralAllocator::set_option`].
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Serialize public operations behind the recursive lock. When false
    /// the allocator is single-threaded-only and the caller synchronizes.
    pub thread_safe: bool,
    /// Provider request size for a fresh core region.
    pub new_core_size: usize,
    /// Chunk sizes at or above this route to a dedicated mapping.
    pub mmap_threshold: usize,
    /// Policy cap on concurrent dedicated mappings.
    pub max_mmap_count: usize,
    /// Largest payload eligible for the fast bins (0 disables them; hard
    /// ceiling 80).
    pub max_fast_payload: usize,
    /// Cumulative freed bytes that trigger a fast-bin flush.
    pub consolidate_threshold: usize,
    /// Bound on malloc-failure callback retries per request.
    pub max_failure_retries: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            thread_safe: true,
            new_core_size: DEFAULT_NEW_CORE_SIZE,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            max_mmap_count: DEFAULT_MAX_MMAP_COUNT,
            max_fast_payload: DEFAULT_MAX_FAST_PAYLOAD,
            consolidate_threshold: DEFAULT_CONSOLIDATE_THRESHOLD,
            max_failure_retries: DEFAULT_MAX_FAILURE_RETRIES,
        }
    }
}

/// Runtime policy knobs; each takes effect on subsequent calls only.
#[derive(Clone, Copy, Debug)]
pub enum HeapOption {
    NewCoreSize(usize),
    MmapThreshold(usize),
    MaxMmapCount(usize),
    /// Clamped to the hard ceiling of 80 bytes.
    MaxFastBinPayload(usize),
    ConsolidateThreshold(usize),
    MaxFailureRetries(usize),
    TraceFieldDelimiter(u8),
    TraceRecordDelimiter(u8),
}

// ---------------------------------------------------------------------------
// Recursive lock
// ---------------------------------------------------------------------------

/// Identifies the current thread by the address of a thread-local slot.
fn thread_token() -> usize {
    crate::sync::thread_local! {
        static TOKEN: u8 = 0;
    }
    TOKEN.with(|slot| std::ptr::from_ref(slot) as usize)
}

/// Spin-acquired recursive lock. `depth` is only written by the owning
/// thread while it holds the lock, so `Relaxed` suffices there; ownership
/// handoff synchronizes through `owner`.
pub(crate) struct RecursiveLock {
    enabled: bool,
    owner: AtomicUsize,
    depth: AtomicUsize,
}

impl RecursiveLock {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            owner: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    pub(crate) fn acquire(&self) {
        if !self.enabled {
            return;
        }
        let token = thread_token();
        if self.owner.load(Ordering::Relaxed) == token {
            self.depth.store(self.depth.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
            return;
        }
        while self
            .owner
            .compare_exchange(0, token, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
            thread::yield_now();
        }
        self.depth.store(1, Ordering::Relaxed);
    }

    pub(crate) fn release(&self) {
        if !self.enabled {
            return;
        }
        debug_assert_eq!(self.owner.load(Ordering::Relaxed), thread_token());
        let depth = self.depth.load(Ordering::Relaxed);
        if depth > 1 {
            self.depth.store(depth - 1, Ordering::Relaxed);
        } else {
            self.depth.store(0, Ordering::Relaxed);
            self.owner.store(0, Ordering::Release);
        }
    }

    pub(crate) fn hold_count(&self) -> usize {
        if self.enabled && self.owner.load(Ordering::Relaxed) == thread_token() {
            self.depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// General-purpose heap allocator: binned free lists, fast-bin caching,
/// core-region growth and mapping-backed large allocations.
///
/// Instances are independent; nothing here is process-global. Allocation
/// failures surface as `None`, never as panics.
pub struct GeneralAllocator {
    state: cell::UnsafeCell<HeapState>,
    lock: RecursiveLock,
}

// Safety: all access to `state` funnels through the recursive lock (or,
// with `thread_safe: false`, the caller promises external serialization).
unsafe impl Send for GeneralAllocator {}
// Safety: as above.
unsafe impl Sync for GeneralAllocator {}

/// Lock scope; released on drop. Re-entry by the same thread nests.
struct Locked<'a> {
    heap: &'a GeneralAllocator,
}

impl Locked<'_> {
    /// # Note
    /// The returned borrow must not be held across a call that may re-enter
    /// the allocator (the malloc-failure callback); callers re-derive it
    /// after any such call.
    #[allow(clippy::mut_from_ref)]
    fn state(&self) -> &mut HeapState {
        // Safety: the recursive lock serializes access; see struct docs.
        crate::sync::unsafe_cell_get_mut!(self.heap.state)
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        self.heap.lock.release();
    }
}

impl Default for GeneralAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl GeneralAllocator {
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        Self::with_source(Box::new(PlatformCoreSource), config)
    }

    /// Compose with an explicit core provider (platform selection, test
    /// stubs, donation-only providers).
    pub fn with_source(source: Box<dyn CoreSource>, mut config: HeapConfig) -> Self {
        config.max_fast_payload = config.max_fast_payload.min(MAX_FAST_PAYLOAD_LIMIT);
        Self {
            lock: RecursiveLock::new(config.thread_safe),
            state: cell::UnsafeCell::new(HeapState::new(source, &config)),
        }
    }

    fn lock(&self) -> Locked<'_> {
        self.lock.acquire();
        Locked { heap: self }
    }

    /// Lock nesting depth held by the calling thread.
    pub fn hold_count(&self) -> usize {
        self.lock.hold_count()
    }

    // -- allocation ---------------------------------------------------------

    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.malloc_with_flags(size, 0)
    }

    pub fn malloc_with_flags(&self, size: usize, flags: u32) -> Option<NonNull<u8>> {
        let chunk_size = request_to_chunk_size(size)?;
        let locked = self.lock();
        locked.state().callbacks.emit_event(
            HookEvent::MallocBegin,
            size,
            chunk_size,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        );
        let chunk = self.malloc_locked(&locked, size, chunk_size, true);
        let state = locked.state();
        let result = match chunk {
            // Safety: freshly allocated in-use chunk.
            Some(chunk) => unsafe {
                let mem = Chunk::to_mem(chunk);
                if flags & FLAG_ZEROED != 0 {
                    std::ptr::write_bytes(mem, 0, size);
                }
                state.callbacks.emit_event(
                    HookEvent::MallocEnd,
                    size,
                    Chunk::size(chunk),
                    std::ptr::null_mut(),
                    mem,
                );
                NonNull::new(mem)
            },
            None => {
                state.callbacks.emit_event(
                    HookEvent::MallocEnd,
                    size,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                );
                None
            }
        };
        // Safety: lock held.
        unsafe { validate::auto_tick(state) };
        result
    }

    /// Allocation with the failure-callback retry loop. The same request is
    /// retried each round, bounded by `max_failure_retries`.
    fn malloc_locked(
        &self,
        locked: &Locked<'_>,
        requested: usize,
        chunk_size: usize,
        allow_mmap: bool,
    ) -> Option<*mut Chunk> {
        // Safety: lock held; chunk_size from request_to_chunk_size.
        if let Some(chunk) = unsafe { locked.state().malloc_chunk(chunk_size, allow_mmap) } {
            return Some(chunk);
        }
        let mut retries = 0;
        loop {
            let (failure, limit) = {
                let state = locked.state();
                (state.failure, state.max_failure_retries)
            };
            let (callback, context) = failure?;
            if retries >= limit {
                return None;
            }
            retries += 1;
            // The callback may free memory through `self`; the state borrow
            // is not live across this call.
            if !callback(self, requested, context) {
                return None;
            }
            // Safety: as above.
            if let Some(chunk) = unsafe { locked.state().malloc_chunk(chunk_size, allow_mmap) } {
                return Some(chunk);
            }
        }
    }

    /// Zero-filled allocation of `count * element_size` bytes; fails on
    /// multiplication overflow rather than under-allocating.
    pub fn calloc(&self, count: usize, element_size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(element_size)?;
        self.malloc_with_flags(total, FLAG_ZEROED)
    }

    /// # Safety
    /// `ptr` must be null or a pointer returned by this allocator, not yet
    /// freed. Double frees and foreign pointers are undefined behavior,
    /// caught only by heap validation when enabled.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let locked = self.lock();
        let state = locked.state();
        // Safety: forwarded contract; lock held.
        unsafe {
            let chunk = Chunk::from_mem(ptr);
            let size = Chunk::size(chunk);
            state
                .callbacks
                .emit_event(HookEvent::FreeBegin, 0, size, ptr, std::ptr::null_mut());
            state.free_chunk(chunk);
            state
                .callbacks
                .emit_event(HookEvent::FreeEnd, 0, size, ptr, std::ptr::null_mut());
            validate::auto_tick(state);
        }
    }

    /// In-place resize when possible, allocate-copy-free otherwise.
    /// `realloc(null, n)` is `malloc(n)`; `realloc(p, 0)` frees and returns
    /// `None`. A shrink never moves the block.
    ///
    /// # Safety
    /// `ptr` must be null or a live pointer returned by this allocator. On
    /// success the old pointer must no longer be used (it may have moved).
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.malloc(new_size);
        }
        if new_size == 0 {
            // Safety: forwarded contract.
            unsafe { self.free(ptr) };
            return None;
        }
        let chunk_size = request_to_chunk_size(new_size)?;
        let locked = self.lock();
        // Safety: forwarded contract; lock held.
        unsafe {
            let chunk = Chunk::from_mem(ptr);
            let state = locked.state();
            state.callbacks.emit_event(
                HookEvent::ReallocBegin,
                new_size,
                Chunk::size(chunk),
                ptr,
                std::ptr::null_mut(),
            );
            if let Some(same) = state.realloc_chunk(chunk, chunk_size) {
                let mem = Chunk::to_mem(same);
                state.callbacks.emit_event(
                    HookEvent::ReallocEnd,
                    new_size,
                    Chunk::size(same),
                    ptr,
                    mem,
                );
                validate::auto_tick(state);
                return NonNull::new(mem);
            }

            let old_usable = Chunk::usable_size(chunk);
            let fresh = self.malloc_locked(&locked, new_size, chunk_size, true);
            let state = locked.state();
            let result = match fresh {
                Some(fresh) => {
                    let mem = Chunk::to_mem(fresh);
                    std::ptr::copy_nonoverlapping(ptr, mem, old_usable.min(new_size));
                    state.free_chunk(chunk);
                    state.callbacks.emit_event(
                        HookEvent::ReallocEnd,
                        new_size,
                        Chunk::size(fresh),
                        ptr,
                        mem,
                    );
                    NonNull::new(mem)
                }
                None => {
                    state.callbacks.emit_event(
                        HookEvent::ReallocEnd,
                        new_size,
                        0,
                        ptr,
                        std::ptr::null_mut(),
                    );
                    None
                }
            };
            validate::auto_tick(state);
            result
        }
    }

    /// Memory whose address plus `offset` is `align`-aligned. `align` must
    /// be a power of two and `offset` a multiple of the minimum alignment.
    pub fn malloc_aligned(
        &self,
        size: usize,
        align: usize,
        offset: usize,
        flags: u32,
    ) -> Option<NonNull<u8>> {
        if align == 0 || !align.is_power_of_two() || !offset.is_multiple_of(ALIGNMENT) {
            return None;
        }
        if align <= ALIGNMENT {
            // The minimum alignment already satisfies the constraint.
            return self.malloc_with_flags(size, flags);
        }
        let chunk_size = request_to_chunk_size(size)?;
        let locked = self.lock();
        locked.state().callbacks.emit_event(
            HookEvent::MallocBegin,
            size,
            chunk_size,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        );
        // Safety: lock held; chunk_size from request_to_chunk_size.
        unsafe {
            let state = locked.state();
            let result = match state.malloc_aligned_chunk(chunk_size, align, offset) {
                Some(chunk) => {
                    let mem = Chunk::to_mem(chunk);
                    if flags & FLAG_ZEROED != 0 {
                        std::ptr::write_bytes(mem, 0, size);
                    }
                    state.callbacks.emit_event(
                        HookEvent::MallocEnd,
                        size,
                        Chunk::size(chunk),
                        std::ptr::null_mut(),
                        mem,
                    );
                    NonNull::new(mem)
                }
                None => {
                    state.callbacks.emit_event(
                        HookEvent::MallocEnd,
                        size,
                        0,
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                    );
                    None
                }
            };
            validate::auto_tick(state);
            result
        }
    }

    /// Allocate one contiguous block partitioned into `sizes.len()`
    /// sub-allocations, each independently freeable. All-or-nothing: on
    /// failure `results` is all null and nothing stays allocated.
    pub fn malloc_multiple(&self, sizes: &[usize], results: &mut [*mut u8], flags: u32) -> bool {
        if sizes.len() != results.len() {
            return false;
        }
        results.fill(std::ptr::null_mut());
        let mut chunk_sizes = Vec::with_capacity(sizes.len());
        for &size in sizes {
            match request_to_chunk_size(size) {
                Some(chunk_size) => chunk_sizes.push(chunk_size),
                None => return false,
            }
        }
        let requested: usize = sizes.iter().fold(0, |sum, &s| sum.saturating_add(s));
        let batch: usize = chunk_sizes.iter().sum();
        let locked = self.lock();
        locked.state().callbacks.emit_event(
            HookEvent::MallocBegin,
            requested,
            batch,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        );
        // Safety: lock held; every entry came from request_to_chunk_size.
        let ok = unsafe { locked.state().malloc_multiple_chunks(&chunk_sizes, results) };
        if !ok {
            results.fill(std::ptr::null_mut());
            locked.state().callbacks.emit_event(
                HookEvent::MallocEnd,
                requested,
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            );
            // Safety: lock held.
            unsafe { validate::auto_tick(locked.state()) };
            return false;
        }
        if flags & FLAG_ZEROED != 0 {
            for (&ptr, &size) in results.iter().zip(sizes) {
                // Safety: freshly allocated payload of at least `size` bytes.
                unsafe { std::ptr::write_bytes(ptr, 0, size) };
            }
        }
        locked.state().callbacks.emit_event(
            HookEvent::MallocEnd,
            requested,
            batch,
            std::ptr::null_mut(),
            results.first().copied().unwrap_or(std::ptr::null_mut()),
        );
        // Safety: lock held.
        unsafe { validate::auto_tick(locked.state()) };
        true
    }

    /// Payload capacity of a live allocation (>= the requested size).
    ///
    /// # Safety
    /// `ptr` must be a live pointer returned by this allocator.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        let _locked = self.lock();
        // Safety: forwarded contract.
        unsafe { Chunk::usable_size(Chunk::from_mem(ptr)) }
    }

    // -- core management ----------------------------------------------------

    /// Request one provider extent of at least `size` bytes and add it to
    /// the arena.
    pub fn add_core(&self, size: usize) -> bool {
        let locked = self.lock();
        // Safety: lock held.
        unsafe { locked.state().add_core_alloc(size) }
    }

    /// Donate a caller-owned buffer to the arena. Rejected (returning
    /// false) when the buffer is too small to carve.
    ///
    /// # Safety
    /// The buffer must remain valid and otherwise untouched until the heap
    /// hands it back through `release` or is dropped.
    pub unsafe fn donate_core(
        &self,
        base: NonNull<u8>,
        size: usize,
        release: Option<CoreReleaseFn>,
        context: *mut c_void,
    ) -> bool {
        let locked = self.lock();
        // Safety: forwarded contract; lock held.
        unsafe { locked.state().add_core_buffer(base, size, release, context) }
    }

    /// Return wholly-unused core regions to the provider.
    pub fn trim_core(&self) {
        let locked = self.lock();
        // Safety: lock held.
        unsafe { locked.state().trim_core() }
    }

    /// Flush the fast bins, making their chunks eligible for coalescing.
    pub fn clear_cache(&self) {
        let locked = self.lock();
        // Safety: lock held.
        unsafe { locked.state().clear_fast_bins() }
    }

    // -- configuration ------------------------------------------------------

    pub fn set_option(&self, option: HeapOption) {
        let locked = self.lock();
        let state = locked.state();
        match option {
            HeapOption::NewCoreSize(value) => state.new_core_size = value,
            HeapOption::MmapThreshold(value) => state.mmap_threshold = value,
            HeapOption::MaxMmapCount(value) => state.max_mmap_count = value,
            HeapOption::MaxFastBinPayload(value) => {
                state.max_fast_payload = value.min(MAX_FAST_PAYLOAD_LIMIT);
            }
            HeapOption::ConsolidateThreshold(value) => state.consolidate_threshold = value,
            HeapOption::MaxFailureRetries(value) => state.max_failure_retries = value,
            HeapOption::TraceFieldDelimiter(byte) => state.callbacks.field_delimiter = byte,
            HeapOption::TraceRecordDelimiter(byte) => state.callbacks.record_delimiter = byte,
        }
    }

    pub fn set_malloc_failure_function(
        &self,
        callback: Option<MallocFailureFn>,
        context: *mut c_void,
    ) {
        let locked = self.lock();
        locked.state().failure = callback.map(|f| (f, context));
    }

    pub fn set_hook_function(&self, callback: Option<HookFn>, context: *mut c_void) {
        let locked = self.lock();
        locked.state().callbacks.hook = callback.map(|f| (f, context));
    }

    pub fn set_trace_function(&self, callback: Option<TraceFn>, context: *mut c_void) {
        let locked = self.lock();
        locked.state().callbacks.trace = callback.map(|f| (f, context));
    }

    pub fn set_assertion_failure_function(
        &self,
        callback: Option<AssertionFn>,
        context: *mut c_void,
    ) {
        let locked = self.lock();
        locked.state().callbacks.assertion = callback.map(|f| (f, context));
    }

    // -- validation & reporting ---------------------------------------------

    /// Walk the heap at the given strictness; violations are reported
    /// through the assertion callback. Returns `true` when clean.
    pub fn validate_heap(&self, level: ValidationLevel) -> bool {
        let locked = self.lock();
        // Safety: lock held.
        unsafe { validate::validate(locked.state(), level) }
    }

    /// Run a validation pass at `level` every `frequency` alloc/free
    /// events; `frequency` 0 disables.
    pub fn set_auto_heap_validation(&self, level: ValidationLevel, frequency: usize) {
        let locked = self.lock();
        let state = locked.state();
        state.auto_level = level;
        state.auto_frequency = frequency;
        state.event_counter = 0;
    }

    /// Emit one trace record per live allocation.
    pub fn trace_allocated_memory(&self) {
        let locked = self.lock();
        // Safety: lock held.
        unsafe { validate::trace_allocated(locked.state()) }
    }

    /// Emit one trace record describing the allocation owning `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live pointer returned by this allocator.
    pub unsafe fn describe_chunk(&self, ptr: *mut u8) {
        let locked = self.lock();
        // Safety: forwarded contract; lock held.
        unsafe { validate::describe_chunk(locked.state(), ptr) }
    }

    /// Owned records for every current chunk (fenceposts included).
    pub fn take_snapshot(&self) -> Vec<ChunkInfo> {
        let locked = self.lock();
        // Safety: lock held.
        unsafe { validate::snapshot(locked.state()) }
    }

    /// Drive `visitor` over every current chunk without mutating the heap.
    pub fn report_heap(&self, visitor: ReportFn, context: *mut c_void) {
        let locked = self.lock();
        // Safety: lock held.
        unsafe { validate::report(locked.state(), visitor, context) }
    }

    /// Live dedicated-mapping count.
    pub fn mmap_count(&self) -> usize {
        let locked = self.lock();
        locked.state().mmap_count
    }
}

// ---------------------------------------------------------------------------
// Process-wide convenience instance
// ---------------------------------------------------------------------------

/// Core provider for the global heap: serves core blocks from mappings so
/// the instance never touches the process heap. Required for use as the
/// `#[global_allocator]`, where a process-heap-backed provider would
/// recurse.
struct MappingBackedSource(PlatformCoreSource);

impl CoreSource for MappingBackedSource {
    fn request_core(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapError> {
        self.0.request_mapping(size)
    }

    unsafe fn release_core(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), HeapError> {
        // Safety: forwarded contract; core extents are mappings here.
        unsafe { self.0.release_mapping(ptr, size) }
    }

    fn request_mapping(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapError> {
        self.0.request_mapping(size)
    }

    unsafe fn release_mapping(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), HeapError> {
        // Safety: forwarded contract.
        unsafe { self.0.release_mapping(ptr, size) }
    }

    fn page_size(&self) -> usize {
        self.0.page_size()
    }
}

crate::sync::static_atomic! {
    static GLOBAL_HEAP: crate::sync::OnceLock<GeneralAllocator> = crate::sync::OnceLock::new();
}

/// Handle to the process-wide heap instance.
pub struct GlobalHeap;

impl GlobalHeap {
    /// Initialize the global heap.
    ///
    /// # Errors
    /// Returns `HeapError::InitializationFailed` when already initialized.
    pub fn init() -> Result<(), HeapError> {
        Self::init_with_config(HeapConfig::default())
    }

    /// # Errors
    /// Returns `HeapError::InitializationFailed` when already initialized.
    pub fn init_with_config(config: HeapConfig) -> Result<(), HeapError> {
        GLOBAL_HEAP
            .set(GeneralAllocator::with_source(
                Box::new(MappingBackedSource(PlatformCoreSource)),
                config,
            ))
            .map_err(|_| HeapError::InitializationFailed("already initialized".to_string()))
    }

    /// # Panics
    /// Panics when [`init`](Self::init) has not run.
    pub fn get() -> &'static GeneralAllocator {
        GLOBAL_HEAP.get().expect("GlobalHeap not initialized")
    }

    pub fn malloc(size: usize) -> Option<NonNull<u8>> {
        Self::get().malloc(size)
    }

    pub fn calloc(count: usize, element_size: usize) -> Option<NonNull<u8>> {
        Self::get().calloc(count, element_size)
    }

    /// # Safety
    /// Same contract as [`GeneralAllocator::free`].
    pub unsafe fn free(ptr: *mut u8) {
        // Safety: forwarded contract.
        unsafe { Self::get().free(ptr) }
    }

    /// # Safety
    /// Same contract as [`GeneralAllocator::realloc`].
    pub unsafe fn realloc(ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        // Safety: forwarded contract.
        unsafe { Self::get().realloc(ptr, new_size) }
    }
}

/// `std::alloc::GlobalAlloc` adapter over [`GlobalHeap`].
pub struct GlobalHeapAlloc;

// Safety: implementation follows the GlobalAlloc contract; the backing
// provider never re-enters the process heap.
unsafe impl std::alloc::GlobalAlloc for GlobalHeapAlloc {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        let heap = GlobalHeap::get();
        let result = if layout.align() <= ALIGNMENT {
            heap.malloc(layout.size())
        } else {
            heap.malloc_aligned(layout.size(), layout.align(), 0, 0)
        };
        result.map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: std::alloc::Layout) {
        if !ptr.is_null() {
            // Safety: ptr came from `alloc` above.
            unsafe { GlobalHeap::free(ptr) };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::chunk::{MIN_CHUNK_SIZE, WORD};
    use crate::heap::vm::RecordingCoreSource;
    use crate::sync::Arc;
    use crate::sync::thread;

    fn test_heap() -> GeneralAllocator {
        let (source, _log) = RecordingCoreSource::new();
        GeneralAllocator::with_source(Box::new(source), HeapConfig::default())
    }

    #[test]
    fn test_malloc_free_basic() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();

        let a = heap.malloc(16).unwrap();
        let b = heap.malloc(32).unwrap();
        assert_ne!(a, b);
        // Safety: test code.
        unsafe {
            a.as_ptr().write(0xAA);
            b.as_ptr().write(0xBB);
            assert_eq!(a.as_ptr().read(), 0xAA);
            heap.free(a.as_ptr());
            heap.free(b.as_ptr());
        }
    }

    #[test]
    fn test_free_null_is_noop() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        // Safety: null is explicitly allowed.
        unsafe { heap.free(std::ptr::null_mut()) };
    }

    #[test]
    fn test_zero_size_gets_minimum_payload() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        let ptr = heap.malloc(0).unwrap();
        // Safety: test code.
        unsafe {
            assert!(heap.usable_size(ptr.as_ptr()) >= MIN_CHUNK_SIZE - WORD);
            heap.free(ptr.as_ptr());
        }
    }

    #[test]
    fn test_huge_request_fails_without_panic() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        assert!(heap.malloc(usize::MAX).is_none());
    }

    #[test]
    fn test_alignment_guarantee() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        for size in [1usize, 7, 16, 100, 1000, 5000] {
            let ptr = heap.malloc(size).unwrap();
            assert!((ptr.as_ptr() as usize).is_multiple_of(ALIGNMENT));
            // Safety: test code.
            unsafe { heap.free(ptr.as_ptr()) };
        }
    }

    #[test]
    fn test_small_round_trip_reuses_address() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        let first = heap.malloc(16).unwrap();
        // Safety: test code.
        unsafe { heap.free(first.as_ptr()) };
        let second = heap.malloc(16).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_calloc_zero_fills() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();

        // Dirty a block, free it, then calloc the same size.
        let dirty = heap.malloc(48).unwrap();
        // Safety: test code.
        unsafe {
            std::ptr::write_bytes(dirty.as_ptr(), 0xFF, 48);
            heap.free(dirty.as_ptr());

            let clean = heap.calloc(6, 8).unwrap();
            assert_eq!(clean, dirty, "fast-bin reuse hands back the dirty block");
            for i in 0..48 {
                assert_eq!(clean.as_ptr().add(i).read(), 0, "byte {i}");
            }
            heap.free(clean.as_ptr());
        }
    }

    #[test]
    fn test_calloc_overflow_fails() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        assert!(heap.calloc(usize::MAX, 2).is_none());
    }

    #[test]
    fn test_realloc_null_and_zero() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        // Safety: test code.
        unsafe {
            let ptr = heap.realloc(std::ptr::null_mut(), 100).unwrap();
            assert!(heap.usable_size(ptr.as_ptr()) >= 100);
            assert!(heap.realloc(ptr.as_ptr(), 0).is_none());
        }
    }

    #[test]
    fn test_realloc_shrink_keeps_address() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        // Safety: test code.
        unsafe {
            let ptr = heap.malloc(1000).unwrap();
            std::ptr::write_bytes(ptr.as_ptr(), 0x42, 100);
            let shrunk = heap.realloc(ptr.as_ptr(), 100).unwrap();
            assert_eq!(shrunk, ptr, "shrink must never move the block");
            assert!(heap.usable_size(shrunk.as_ptr()) >= 100);
            assert_eq!(shrunk.as_ptr().read(), 0x42);
            heap.free(shrunk.as_ptr());
        }
    }

    #[test]
    fn test_realloc_preserves_contents_across_move() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        // Safety: test code.
        unsafe {
            let ptr = heap.malloc(64).unwrap();
            for i in 0..64u8 {
                ptr.as_ptr().add(i as usize).write(i);
            }
            // Block the in-place growth path.
            let _wall = heap.malloc(64).unwrap();
            let grown = heap.realloc(ptr.as_ptr(), 100_000).unwrap();
            for i in 0..64u8 {
                assert_eq!(grown.as_ptr().add(i as usize).read(), i);
            }
            heap.free(grown.as_ptr());
        }
    }

    #[test]
    fn test_malloc_aligned_contract() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        assert!(heap.malloc_aligned(64, 3, 0, 0).is_none(), "non-power-of-two");
        assert!(heap.malloc_aligned(64, 64, 7, 0).is_none(), "misaligned offset");

        for (align, offset) in [(16usize, 0usize), (64, 0), (256, 16), (4096, 64)] {
            let ptr = heap.malloc_aligned(100, align, offset, 0).unwrap();
            assert!(
                (ptr.as_ptr() as usize + offset).is_multiple_of(align),
                "align {align} offset {offset}"
            );
            // Safety: test code.
            unsafe { heap.free(ptr.as_ptr()) };
        }
    }

    #[test]
    fn test_malloc_multiple_all_or_nothing() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        let sizes = [10usize, 20, 30];
        let mut results = [std::ptr::null_mut::<u8>(); 3];
        assert!(heap.malloc_multiple(&sizes, &mut results, 0));
        for (&ptr, &size) in results.iter().zip(&sizes) {
            assert!(!ptr.is_null());
            // Safety: test code.
            unsafe {
                assert!(heap.usable_size(ptr) >= size);
                std::ptr::write_bytes(ptr, 0x77, size);
            }
        }
        // Sub-blocks free independently.
        // Safety: test code.
        unsafe {
            heap.free(results[0]);
            assert_eq!(results[1].read(), 0x77);
            heap.free(results[2]);
            heap.free(results[1]);
        }

        // Oversized batch entry fails the whole batch.
        let mut results = [std::ptr::null_mut::<u8>(); 2];
        assert!(!heap.malloc_multiple(&[16, usize::MAX], &mut results, 0));
        assert!(results.iter().all(|p| p.is_null()));
    }

    #[test]
    fn test_failure_callback_frees_and_retries() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let (source, log) = RecordingCoreSource::new();
        let heap = GeneralAllocator::with_source(Box::new(source), HeapConfig::default());

        // Stash a block, cut the provider off, then eat the rest of the
        // arena so the next request genuinely fails.
        let stash = heap.malloc(4096).unwrap();
        {
            let mut log = log.lock().unwrap();
            log.fail_core = true;
            log.fail_mapping = true;
        }
        let mut held = Vec::new();
        while let Some(ptr) = heap.malloc(4096) {
            held.push(ptr);
            assert!(held.len() < 100_000, "exhaustion must terminate");
        }

        fn release_stash(heap: &GeneralAllocator, _requested: usize, context: *mut c_void) -> bool {
            // Safety: context points at the test's stash slot.
            let slot = unsafe { &mut *context.cast::<*mut u8>() };
            if slot.is_null() {
                return false;
            }
            assert!(heap.hold_count() >= 1, "callback runs under the lock");
            // Safety: the slot holds a live pointer from this heap.
            unsafe { heap.free(*slot) };
            *slot = std::ptr::null_mut();
            true
        }

        let mut slot: *mut u8 = stash.as_ptr();
        heap.set_malloc_failure_function(Some(release_stash), (&raw mut slot).cast());

        // Provider is dead and the top cannot cover this; only the callback
        // freeing the stash makes it succeed.
        let ptr = heap.malloc(4096);
        assert!(ptr.is_some(), "retry after callback freed memory");
        assert!(slot.is_null(), "callback ran exactly once");
    }

    #[test]
    fn test_failure_retries_are_bounded() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let (source, log) = RecordingCoreSource::new();
        let heap = GeneralAllocator::with_source(Box::new(source), HeapConfig::default());
        {
            let mut log = log.lock().unwrap();
            log.fail_core = true;
            log.fail_mapping = true;
        }
        heap.set_option(HeapOption::MaxFailureRetries(5));

        fn stubborn(_heap: &GeneralAllocator, _requested: usize, context: *mut c_void) -> bool {
            // Safety: context points at the test's counter.
            unsafe { *context.cast::<usize>() += 1 };
            true
        }
        let mut calls = 0usize;
        heap.set_malloc_failure_function(Some(stubborn), (&raw mut calls).cast());

        assert!(heap.malloc(64).is_none());
        assert_eq!(calls, 5, "retry loop must stop at the configured bound");
    }

    #[test]
    fn test_options_take_effect() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        heap.set_option(HeapOption::MaxFastBinPayload(4096));
        // Clamped to the hard ceiling: a 100-byte block must not fast-bin.
        let ptr = heap.malloc(100).unwrap();
        // Safety: test code.
        unsafe { heap.free(ptr.as_ptr()) };
        assert!(heap.validate_heap(ValidationLevel::Full));

        heap.set_option(HeapOption::MmapThreshold(1 << 20));
        let big = heap.malloc(200_000).unwrap();
        assert_eq!(heap.mmap_count(), 0, "below the raised threshold");
        // Safety: test code.
        unsafe { heap.free(big.as_ptr()) };
    }

    #[test]
    fn test_mmap_threshold_routing() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        let big = heap.malloc(200_000).unwrap();
        assert_eq!(heap.mmap_count(), 1);
        // Safety: test code.
        unsafe { heap.free(big.as_ptr()) };
        assert_eq!(heap.mmap_count(), 0);
    }

    #[test]
    fn test_hook_event_stream() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();

        fn record(info: &crate::heap::hooks::HookInfo, context: *mut c_void) {
            // Safety: context points at the test's Vec.
            let events = unsafe { &mut *context.cast::<Vec<HookEvent>>() };
            events.push(info.event);
        }
        let mut events: Vec<HookEvent> = Vec::new();
        heap.set_hook_function(Some(record), (&raw mut events).cast());

        let ptr = heap.malloc(64).unwrap();
        // Safety: test code.
        unsafe { heap.free(ptr.as_ptr()) };
        heap.set_hook_function(None, std::ptr::null_mut());

        assert_eq!(events[0], HookEvent::MallocBegin);
        assert!(events.contains(&HookEvent::CoreAcquired), "first malloc grows core");
        assert!(events.contains(&HookEvent::MallocEnd));
        assert_eq!(events[events.len() - 2], HookEvent::FreeBegin);
        assert_eq!(events[events.len() - 1], HookEvent::FreeEnd);
    }

    #[test]
    fn test_hook_events_cover_aligned_and_batch() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();

        fn record(info: &crate::heap::hooks::HookInfo, context: *mut c_void) {
            // Safety: context points at the test's Vec.
            let events = unsafe { &mut *context.cast::<Vec<HookEvent>>() };
            events.push(info.event);
        }
        let mut events: Vec<HookEvent> = Vec::new();
        heap.set_hook_function(Some(record), (&raw mut events).cast());

        let count_pairs = |events: &Vec<HookEvent>| {
            (
                events.iter().filter(|&&e| e == HookEvent::MallocBegin).count(),
                events.iter().filter(|&&e| e == HookEvent::MallocEnd).count(),
            )
        };

        let aligned = heap.malloc_aligned(100, 256, 0, 0).unwrap();
        assert_eq!(count_pairs(&events), (1, 1), "aligned path brackets itself");

        let sizes = [32usize, 64];
        let mut results = [std::ptr::null_mut::<u8>(); 2];
        assert!(heap.malloc_multiple(&sizes, &mut results, 0));
        assert_eq!(count_pairs(&events), (2, 2), "batch path brackets itself");

        heap.set_hook_function(None, std::ptr::null_mut());
        // Safety: test code.
        unsafe {
            heap.free(aligned.as_ptr());
            heap.free(results[0]);
            heap.free(results[1]);
        }
    }

    #[test]
    fn test_auto_validation_runs_under_lock() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = test_heap();
        heap.set_auto_heap_validation(ValidationLevel::Full, 1);
        // Every operation now validates; a clean workload stays silent.
        let ptr = heap.malloc(500).unwrap();
        // Safety: test code.
        unsafe {
            let grown = heap.realloc(ptr.as_ptr(), 2000).unwrap();
            heap.free(grown.as_ptr());
        }
        assert!(heap.validate_heap(ValidationLevel::Full));
    }

    #[test]
    fn test_single_threaded_mode() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let (source, _log) = RecordingCoreSource::new();
        let heap = GeneralAllocator::with_source(
            Box::new(source),
            HeapConfig {
                thread_safe: false,
                ..HeapConfig::default()
            },
        );
        let ptr = heap.malloc(64).unwrap();
        assert_eq!(heap.hold_count(), 0, "lock disabled, no depth tracked");
        // Safety: test code.
        unsafe { heap.free(ptr.as_ptr()) };
    }

    #[test]
    fn test_concurrent_malloc_free() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let heap = Arc::new(GeneralAllocator::new());
        let mut handles = vec![];

        for t in 0..8usize {
            let heap = heap.clone();
            handles.push(thread::spawn(move || {
                let sizes = [16usize, 48, 200, 1000, 5000];
                let mut live: Vec<(NonNull<u8>, u8)> = Vec::new();
                for i in 0..200 {
                    let size = sizes[i % sizes.len()];
                    let ptr = heap.malloc(size).unwrap();
                    let tag = (t * 31 + i) as u8;
                    // Safety: test code.
                    unsafe { ptr.as_ptr().write(tag) };
                    live.push((ptr, tag));
                    if live.len() > 16 {
                        let (victim, tag) = live.remove(0);
                        // Safety: test code.
                        unsafe {
                            assert_eq!(victim.as_ptr().read(), tag, "corruption detected");
                            heap.free(victim.as_ptr());
                        }
                    }
                }
                for (ptr, tag) in live {
                    // Safety: test code.
                    unsafe {
                        assert_eq!(ptr.as_ptr().read(), tag);
                        heap.free(ptr.as_ptr());
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(heap.validate_heap(ValidationLevel::Full));
    }

    #[test]
    fn test_global_heap() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        // May already be initialized by a parallel-run sibling test.
        drop(GlobalHeap::init());
        assert!(GlobalHeap::init().is_err(), "second init must fail");

        let ptr = GlobalHeap::malloc(128).unwrap();
        // Safety: test code.
        unsafe {
            ptr.as_ptr().write(0xDD);
            GlobalHeap::free(ptr.as_ptr());
        }

        // GlobalAlloc adapter path.
        let layout = std::alloc::Layout::from_size_align(64, 32).unwrap();
        // Safety: alloc/dealloc with matching layout.
        unsafe {
            let raw = std::alloc::GlobalAlloc::alloc(&GlobalHeapAlloc, layout);
            assert!(!raw.is_null());
            assert!((raw as usize).is_multiple_of(32));
            std::alloc::GlobalAlloc::dealloc(&GlobalHeapAlloc, raw, layout);
        }
    }
}
