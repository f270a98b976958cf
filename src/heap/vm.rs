use std::fmt;
use std::ptr::NonNull;

use crate::heap::chunk::ALIGNMENT;

#[derive(Debug)]
pub enum HeapError {
    /// The provider could not supply a core block.
    CoreFailed(std::io::Error),
    /// The provider could not supply a direct mapping.
    MappingFailed(std::io::Error),
    /// Returning memory to the provider failed.
    ReleaseFailed(std::io::Error),
    InitializationFailed(String),
    InvalidConfig(String),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::CoreFailed(e) => write!(f, "core acquisition failed: {e}"),
            HeapError::MappingFailed(e) => write!(f, "mapping acquisition failed: {e}"),
            HeapError::ReleaseFailed(e) => write!(f, "memory release failed: {e}"),
            HeapError::InitializationFailed(msg) => write!(f, "heap initialization failed: {msg}"),
            HeapError::InvalidConfig(msg) => write!(f, "invalid heap configuration: {msg}"),
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HeapError::CoreFailed(e)
            | HeapError::MappingFailed(e)
            | HeapError::ReleaseFailed(e) => Some(e),
            HeapError::InitializationFailed(_) | HeapError::InvalidConfig(_) => None,
        }
    }
}

/// Upstream memory provider for a heap.
///
/// `request_core` supplies sbrk-style blocks the heap carves into chunks;
/// `request_mapping` supplies page-granular regions for oversized
/// allocations, released wholesale on free. Both return the base pointer and
/// the byte count actually granted (which may exceed the request).
///
/// Called only under the owning heap's lock; implementations need `Send`
/// but not `Sync`.
pub trait CoreSource: Send {
    fn request_core(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapError>;

    /// # Safety
    /// `ptr`/`size` must be exactly one extent previously granted by
    /// `request_core`, with no live references into it.
    unsafe fn release_core(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), HeapError>;

    fn request_mapping(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapError>;

    /// # Safety
    /// `ptr`/`size` must be exactly one extent previously granted by
    /// `request_mapping`, with no live references into it.
    unsafe fn release_mapping(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), HeapError>;

    /// Mapping request granularity.
    fn page_size(&self) -> usize;
}

/// Default provider: process heap for core blocks, OS pages for mappings.
#[derive(Default)]
pub struct PlatformCoreSource;

#[cfg(not(any(loom, miri)))]
mod platform_core {
    use super::{ALIGNMENT, HeapError, NonNull};
    use std::io;

    /// Core blocks come from the process heap (malloc-equivalent): the heap
    /// treats them as opaque extents and never assumes page alignment.
    pub(super) fn alloc_core(size: usize) -> Result<(NonNull<u8>, usize), HeapError> {
        let layout = std::alloc::Layout::from_size_align(size, ALIGNMENT)
            .map_err(|e| HeapError::CoreFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size (callers never request 0).
        let ptr = unsafe { std::alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(p) => Ok((p, size)),
            None => Err(HeapError::CoreFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "process heap allocation returned null",
            ))),
        }
    }

    /// # Safety
    /// `ptr`/`size` must come from `alloc_core`.
    pub(super) unsafe fn free_core(ptr: NonNull<u8>, size: usize) -> Result<(), HeapError> {
        let layout = std::alloc::Layout::from_size_align(size, ALIGNMENT)
            .map_err(|e| HeapError::ReleaseFailed(io::Error::other(e)))?;
        // Safety: allocated with the same layout in alloc_core.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }
}

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{CoreSource, HeapError, NonNull, PlatformCoreSource, platform_core};
    use std::io;

    impl CoreSource for PlatformCoreSource {
        fn request_core(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapError> {
            platform_core::alloc_core(size)
        }

        unsafe fn release_core(
            &mut self,
            ptr: NonNull<u8>,
            size: usize,
        ) -> Result<(), HeapError> {
            // Safety: forwarded contract.
            unsafe { platform_core::free_core(ptr, size) }
        }

        fn request_mapping(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapError> {
            let size = crate::heap::chunk::align_up(size, self.page_size());
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(HeapError::MappingFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok((p, size)),
                None => Err(HeapError::MappingFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn release_mapping(
            &mut self,
            ptr: NonNull<u8>,
            size: usize,
        ) -> Result<(), HeapError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(HeapError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size(&self) -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // SAFETY/PORTABILITY: this crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
mod windows {
    use super::{CoreSource, HeapError, NonNull, PlatformCoreSource, platform_core};
    use std::io;

    const MEM_COMMIT: u32 = 0x1000;
    const MEM_RESERVE: u32 = 0x2000;
    const MEM_RELEASE: u32 = 0x8000;
    const PAGE_READWRITE: u32 = 0x04;

    #[repr(C)]
    struct SystemInfo {
        processor_arch: u32,
        page_size: u32,
        min_app_addr: *mut core::ffi::c_void,
        max_app_addr: *mut core::ffi::c_void,
        active_processor_mask: usize,
        number_of_processors: u32,
        processor_type: u32,
        allocation_granularity: u32,
        processor_level: u16,
        processor_revision: u16,
    }

    unsafe extern "system" {
        fn VirtualAlloc(
            addr: *mut core::ffi::c_void,
            size: usize,
            alloc_type: u32,
            protect: u32,
        ) -> *mut core::ffi::c_void;
        fn VirtualFree(addr: *mut core::ffi::c_void, size: usize, free_type: u32) -> i32;
        fn GetSystemInfo(info: *mut SystemInfo);
    }

    impl CoreSource for PlatformCoreSource {
        fn request_core(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapError> {
            platform_core::alloc_core(size)
        }

        unsafe fn release_core(
            &mut self,
            ptr: NonNull<u8>,
            size: usize,
        ) -> Result<(), HeapError> {
            // Safety: forwarded contract.
            unsafe { platform_core::free_core(ptr, size) }
        }

        fn request_mapping(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapError> {
            let size = crate::heap::chunk::align_up(size, self.page_size());
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok((p, size)),
                None => Err(HeapError::MappingFailed(io::Error::last_os_error())),
            }
        }

        unsafe fn release_mapping(
            &mut self,
            ptr: NonNull<u8>,
            _size: usize,
        ) -> Result<(), HeapError> {
            // MEM_RELEASE requires size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<core::ffi::c_void>(), 0, MEM_RELEASE) }
                == 0
            {
                return Err(HeapError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size(&self) -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            // Safety: FFI call to GetSystemInfo.
            *CACHED.get_or_init(|| unsafe {
                let mut info = std::mem::MaybeUninit::<SystemInfo>::zeroed();
                GetSystemInfo(info.as_mut_ptr());
                info.assume_init().page_size as usize
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed provider (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back both extent
// kinds with plain heap allocations. Sufficient for testing the heap's
// carving and synchronization logic; real page behaviour is covered by the
// platform implementation in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl CoreSource for PlatformCoreSource {
    fn request_core(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapError> {
        mock_alloc(size, ALIGNMENT).map_err(HeapError::CoreFailed)
    }

    unsafe fn release_core(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), HeapError> {
        // Safety: allocated by mock_alloc with the same size/alignment.
        unsafe { mock_free(ptr, size, ALIGNMENT) };
        Ok(())
    }

    fn request_mapping(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapError> {
        let size = crate::heap::chunk::align_up(size, self.page_size());
        mock_alloc(size, 4096)
            .map(|(p, _)| (p, size))
            .map_err(HeapError::MappingFailed)
    }

    unsafe fn release_mapping(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), HeapError> {
        // Safety: allocated by mock_alloc with the same size/alignment.
        unsafe { mock_free(ptr, size, 4096) };
        Ok(())
    }

    fn page_size(&self) -> usize {
        4096
    }
}

#[cfg(any(loom, miri, test))]
fn mock_alloc(size: usize, align: usize) -> Result<(NonNull<u8>, usize), std::io::Error> {
    let layout = std::alloc::Layout::from_size_align(size, align)
        .map_err(std::io::Error::other)?;
    // Safety: layout has non-zero size.
    let ptr = unsafe { std::alloc::alloc(layout) };
    NonNull::new(ptr)
        .map(|p| (p, size))
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::OutOfMemory, "alloc returned null"))
}

/// # Safety
/// `ptr` must come from `mock_alloc` with the same `size`/`align`.
#[cfg(any(loom, miri, test))]
unsafe fn mock_free(ptr: NonNull<u8>, size: usize, align: usize) {
    let layout = std::alloc::Layout::from_size_align(size, align)
        .unwrap_or_else(|_| unreachable!("layout validated at allocation time"));
    // Safety: upheld by caller.
    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
}

// ---------------------------------------------------------------------------
// Recording provider for tests: heap-backed extents plus a shared log of
// every request/release, with switchable failure injection.
// ---------------------------------------------------------------------------
#[cfg(all(test, not(loom)))]
pub(crate) use recording::{RecordingCoreSource, SourceLog};

#[cfg(all(test, not(loom)))]
mod recording {
    use super::{CoreSource, HeapError, NonNull, mock_alloc, mock_free};
    use crate::heap::chunk::ALIGNMENT;
    use crate::sync::{Arc, Mutex};

    #[derive(Default)]
    pub(crate) struct SourceLog {
        pub(crate) core_requests: Vec<usize>,
        pub(crate) core_releases: Vec<usize>,
        pub(crate) mapping_requests: Vec<usize>,
        pub(crate) mapping_releases: Vec<usize>,
        pub(crate) fail_core: bool,
        pub(crate) fail_mapping: bool,
        /// Core requests above this many bytes are refused (shrink-retry
        /// exercises), counted in `refused_core_requests`.
        pub(crate) core_budget: Option<usize>,
        pub(crate) refused_core_requests: usize,
    }

    pub(crate) struct RecordingCoreSource {
        log: Arc<Mutex<SourceLog>>,
    }

    impl RecordingCoreSource {
        pub(crate) fn new() -> (Self, Arc<Mutex<SourceLog>>) {
            let log = Arc::new(Mutex::new(SourceLog::default()));
            (Self { log: log.clone() }, log)
        }

        fn log(&self) -> std::sync::MutexGuard<'_, SourceLog> {
            self.log
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    impl CoreSource for RecordingCoreSource {
        fn request_core(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapError> {
            let mut log = self.log();
            if log.fail_core {
                return Err(HeapError::CoreFailed(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "core failure injected",
                )));
            }
            if let Some(budget) = log.core_budget
                && size > budget
            {
                log.refused_core_requests += 1;
                return Err(HeapError::CoreFailed(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "core budget exceeded",
                )));
            }
            log.core_requests.push(size);
            mock_alloc(size, ALIGNMENT).map_err(HeapError::CoreFailed)
        }

        unsafe fn release_core(
            &mut self,
            ptr: NonNull<u8>,
            size: usize,
        ) -> Result<(), HeapError> {
            self.log().core_releases.push(size);
            // Safety: forwarded contract.
            unsafe { mock_free(ptr, size, ALIGNMENT) };
            Ok(())
        }

        fn request_mapping(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapError> {
            let size = crate::heap::chunk::align_up(size, self.page_size());
            let mut log = self.log();
            if log.fail_mapping {
                return Err(HeapError::MappingFailed(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "mapping failure injected",
                )));
            }
            log.mapping_requests.push(size);
            mock_alloc(size, 4096)
                .map(|(p, _)| (p, size))
                .map_err(HeapError::MappingFailed)
        }

        unsafe fn release_mapping(
            &mut self,
            ptr: NonNull<u8>,
            size: usize,
        ) -> Result<(), HeapError> {
            self.log().mapping_releases.push(size);
            // Safety: forwarded contract.
            unsafe { mock_free(ptr, size, 4096) };
            Ok(())
        }

        fn page_size(&self) -> usize {
            4096
        }
    }
}
