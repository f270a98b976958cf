//! Callback surfaces.
//!
//! All callbacks are plain `fn` pointers paired with a caller-supplied raw
//! context, invoked synchronously while the heap lock is held. The lock is
//! recursive, so a malloc-failure callback may call back into the allocator
//! (to trim or free); hook/trace/assertion callbacks must not.

use std::ffi::c_void;

use crate::heap::general::GeneralAllocator;

/// Allocation lifecycle event, delivered to the hook callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    MallocBegin,
    MallocEnd,
    FreeBegin,
    FreeEnd,
    ReallocBegin,
    ReallocEnd,
    CoreAcquired,
    CoreReleased,
    MappingAcquired,
    MappingReleased,
}

/// One hook record. Fields not meaningful for the event are zero/null
/// (e.g. `result` on a `*Begin` event).
#[derive(Clone, Copy, Debug)]
pub struct HookInfo {
    pub event: HookEvent,
    /// User-requested byte count, when the event has one.
    pub requested: usize,
    /// Chunk or extent size involved.
    pub size: usize,
    /// Incoming pointer (free/realloc source).
    pub input: *mut u8,
    /// Outgoing pointer (malloc/realloc result, extent base).
    pub result: *mut u8,
}

pub type HookFn = fn(info: &HookInfo, context: *mut c_void);

/// Receives report lines from `trace_allocated_memory`/`describe_chunk`.
pub type TraceFn = fn(text: &str, context: *mut c_void);

/// Receives heap-validation failure descriptions. The allocator itself
/// never panics on a validation failure.
pub type AssertionFn = fn(description: &str, context: *mut c_void);

/// Invoked when an allocation cannot be satisfied. Return `true` to have the
/// allocator retry the same request (bounded by the configured retry limit);
/// the callback may free memory or adjust options through `heap` first.
pub type MallocFailureFn =
    fn(heap: &GeneralAllocator, requested: usize, context: *mut c_void) -> bool;

/// Installed hook/trace/assertion callbacks plus report formatting state.
pub(crate) struct CallbackSet {
    pub(crate) hook: Option<(HookFn, *mut c_void)>,
    pub(crate) trace: Option<(TraceFn, *mut c_void)>,
    pub(crate) assertion: Option<(AssertionFn, *mut c_void)>,
    /// Separates fields within one report record.
    pub(crate) field_delimiter: u8,
    /// Terminates one report record.
    pub(crate) record_delimiter: u8,
}

impl Default for CallbackSet {
    fn default() -> Self {
        Self {
            hook: None,
            trace: None,
            assertion: None,
            field_delimiter: b'\t',
            record_delimiter: b'\n',
        }
    }
}

impl CallbackSet {
    #[inline]
    pub(crate) fn emit(&self, info: &HookInfo) {
        if let Some((hook, context)) = self.hook {
            hook(info, context);
        }
    }

    #[inline]
    pub(crate) fn emit_event(
        &self,
        event: HookEvent,
        requested: usize,
        size: usize,
        input: *mut u8,
        result: *mut u8,
    ) {
        if self.hook.is_some() {
            self.emit(&HookInfo {
                event,
                requested,
                size,
                input,
                result,
            });
        }
    }

    #[inline]
    pub(crate) fn trace(&self, text: &str) {
        if let Some((trace, context)) = self.trace {
            trace(text, context);
        }
    }

    #[inline]
    pub(crate) fn report_violation(&self, description: &str) {
        if let Some((assertion, context)) = self.assertion {
            assertion(description, context);
        }
    }
}
