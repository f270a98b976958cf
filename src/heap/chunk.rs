//! Chunk boundary tags.
//!
//! Every block of heap memory is fronted by a `Chunk` header. The first two
//! words (`prior_size`, `head`) are always present; the two list pointers
//! only exist while the chunk is free and overlap user data while it is in
//! use. An in-use chunk's payload additionally extends into the successor's
//! `prior_size` word, so a chunk of size `n` carries `n - WORD` usable bytes.
//!
//! Everything here is an unchecked primitive. Callers (`state.rs`) are
//! responsible for upholding the layout invariants; `validate.rs` exists to
//! detect the cases where they did not.

pub(crate) const WORD: usize = size_of::<usize>();
pub(crate) const ALIGNMENT: usize = 2 * WORD;
pub(crate) const ALIGN_MASK: usize = ALIGNMENT - 1;

/// Smallest legal chunk: header words plus the two free-list pointers.
pub(crate) const MIN_CHUNK_SIZE: usize = 2 * ALIGNMENT;

/// A fencepost is a header-only pseudo chunk (`prior_size` + `head`).
pub(crate) const FENCE_SIZE: usize = ALIGNMENT;

// Flag bits carried in `head` alongside the size.
pub(crate) const PREV_IN_USE: usize = 0b001;
pub(crate) const MMAPPED: usize = 0b010;
pub(crate) const INTERNAL: usize = 0b100;
pub(crate) const FAST_BIN: usize = 1 << (usize::BITS - 1);

pub(crate) const FLAG_MASK: usize = PREV_IN_USE | MMAPPED | INTERNAL | FAST_BIN;
pub(crate) const SIZE_MASK: usize = !FLAG_MASK;

/// Requests above this are refused outright (also guards `head` against
/// colliding with `FAST_BIN`).
pub(crate) const MAX_REQUEST: usize = (isize::MAX as usize) >> 1;

/// Heap chunk header. `prior_size` is only written (and only meaningful)
/// while the preceding chunk is free; `prev`/`next` only while this chunk
/// sits on a doubly linked bin list.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct Chunk {
    pub(crate) prior_size: usize,
    pub(crate) head: usize,
    pub(crate) prev: *mut Chunk,
    pub(crate) next: *mut Chunk,
}

impl Chunk {
    /// Detached list node with empty header, used for bin sentinels.
    pub(crate) const SENTINEL: Chunk = Chunk {
        prior_size: 0,
        head: 0,
        prev: std::ptr::null_mut(),
        next: std::ptr::null_mut(),
    };

    #[inline]
    pub(crate) unsafe fn size(me: *mut Chunk) -> usize {
        unsafe { (*me).head & SIZE_MASK }
    }

    /// Replace the size, keeping all flag bits.
    #[inline]
    pub(crate) unsafe fn set_size(me: *mut Chunk, size: usize) {
        debug_assert_eq!(size & FLAG_MASK, 0);
        unsafe { (*me).head = size | ((*me).head & FLAG_MASK) };
    }

    #[inline]
    pub(crate) unsafe fn set_head(me: *mut Chunk, size_and_flags: usize) {
        unsafe { (*me).head = size_and_flags };
    }

    #[inline]
    pub(crate) unsafe fn prev_in_use(me: *mut Chunk) -> bool {
        unsafe { (*me).head & PREV_IN_USE != 0 }
    }

    #[inline]
    pub(crate) unsafe fn set_prev_in_use(me: *mut Chunk) {
        unsafe { (*me).head |= PREV_IN_USE };
    }

    #[inline]
    pub(crate) unsafe fn clear_prev_in_use(me: *mut Chunk) {
        unsafe { (*me).head &= !PREV_IN_USE };
    }

    #[inline]
    pub(crate) unsafe fn is_mmapped(me: *mut Chunk) -> bool {
        unsafe { (*me).head & MMAPPED != 0 }
    }

    #[inline]
    pub(crate) unsafe fn is_internal(me: *mut Chunk) -> bool {
        unsafe { (*me).head & INTERNAL != 0 }
    }

    #[inline]
    pub(crate) unsafe fn is_fast(me: *mut Chunk) -> bool {
        unsafe { (*me).head & FAST_BIN != 0 }
    }

    #[inline]
    pub(crate) unsafe fn set_fast(me: *mut Chunk) {
        unsafe { (*me).head |= FAST_BIN };
    }

    #[inline]
    pub(crate) unsafe fn clear_fast(me: *mut Chunk) {
        unsafe { (*me).head &= !FAST_BIN };
    }

    #[inline]
    pub(crate) unsafe fn at_offset(me: *mut Chunk, offset: isize) -> *mut Chunk {
        unsafe { me.cast::<u8>().offset(offset).cast::<Chunk>() }
    }

    /// Successor by address. Not meaningful for mmapped chunks or fenceposts.
    #[inline]
    pub(crate) unsafe fn next_by_address(me: *mut Chunk) -> *mut Chunk {
        unsafe { Chunk::at_offset(me, Chunk::size(me).cast_signed()) }
    }

    /// Predecessor by address. Only legal while `!prev_in_use`, which is the
    /// only time `prior_size` holds a valid length.
    #[inline]
    pub(crate) unsafe fn prev_by_address(me: *mut Chunk) -> *mut Chunk {
        debug_assert!(unsafe { !Chunk::prev_in_use(me) });
        unsafe { Chunk::at_offset(me, -(*me).prior_size.cast_signed()) }
    }

    /// In-use test via the successor's `PREV_IN_USE` bit. Fenceposts answer
    /// in-use without touching their (nonexistent) successor.
    #[inline]
    pub(crate) unsafe fn in_use(me: *mut Chunk) -> bool {
        unsafe {
            if Chunk::is_internal(me) || Chunk::is_mmapped(me) {
                return true;
            }
            Chunk::prev_in_use(Chunk::next_by_address(me))
        }
    }

    /// Mark in-use by setting the successor's `PREV_IN_USE` bit.
    #[inline]
    pub(crate) unsafe fn set_in_use(me: *mut Chunk) {
        unsafe { Chunk::set_prev_in_use(Chunk::next_by_address(me)) };
    }

    /// Record this chunk as free in the boundary tag of the successor:
    /// clear its `PREV_IN_USE` and write the back-pointer length.
    #[inline]
    pub(crate) unsafe fn write_free_tag(me: *mut Chunk) {
        unsafe {
            let next = Chunk::next_by_address(me);
            (*next).prior_size = Chunk::size(me);
            Chunk::clear_prev_in_use(next);
        }
    }

    #[inline]
    pub(crate) unsafe fn to_mem(me: *mut Chunk) -> *mut u8 {
        unsafe { me.cast::<u8>().add(2 * WORD) }
    }

    #[inline]
    pub(crate) unsafe fn from_mem(mem: *mut u8) -> *mut Chunk {
        unsafe { mem.sub(2 * WORD).cast::<Chunk>() }
    }

    /// Payload capacity: the chunk body minus the `head` word, plus the
    /// successor's overlapped `prior_size` word.
    #[inline]
    pub(crate) unsafe fn usable_size(me: *mut Chunk) -> usize {
        unsafe { Chunk::size(me) - WORD }
    }

    /// Insert `me` right after `anchor` on a circular doubly linked list.
    #[inline]
    pub(crate) unsafe fn link_after(anchor: *mut Chunk, me: *mut Chunk) {
        unsafe {
            let after = (*anchor).next;
            (*me).prev = anchor;
            (*me).next = after;
            (*after).prev = me;
            (*anchor).next = me;
        }
    }

    /// Splice `me` out of its circular list. The node's own pointers are
    /// left dangling.
    #[inline]
    pub(crate) unsafe fn unlink(me: *mut Chunk) {
        unsafe {
            let prev = (*me).prev;
            let next = (*me).next;
            debug_assert_eq!((*prev).next, me, "free list corrupted (prev link)");
            debug_assert_eq!((*next).prev, me, "free list corrupted (next link)");
            (*prev).next = next;
            (*next).prev = prev;
        }
    }
}

#[inline]
pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Convert a user request into an aligned chunk size, or `None` when the
/// request is out of range. Zero-byte requests get the minimum chunk.
#[inline]
pub(crate) fn request_to_chunk_size(request: usize) -> Option<usize> {
    if request > MAX_REQUEST {
        return None;
    }
    Some(align_up(request + WORD, ALIGNMENT).max(MIN_CHUNK_SIZE))
}
