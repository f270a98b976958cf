#[cfg(not(target_pointer_width = "64"))]
compile_error!("genalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod heap;

// allocator facade
pub use heap::general::{
    FLAG_ZEROED, GeneralAllocator, GlobalHeap, GlobalHeapAlloc, HeapConfig, HeapOption,
};

// callbacks
pub use heap::hooks::{
    AssertionFn, HookEvent, HookFn, HookInfo, MallocFailureFn, TraceFn,
};

// validation / reporting
pub use heap::validate::{ChunkInfo, ChunkKind, ReportFn, ValidationLevel};

// core provider
pub use heap::state::CoreReleaseFn;
pub use heap::vm::{CoreSource, HeapError, PlatformCoreSource};
