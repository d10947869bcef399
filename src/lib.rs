//! Slab allocator drop-in replacement for malloc().
//!
//! A zone is reserved for each chunk size and carved into an array of
//! chunks, with per-thread magazine caches in front of the slab so the
//! fast path takes no lock at all. Oversized allocations map directly
//! from the page provider and recycle through a small cache.
//!
//! The C-shaped entry points ([`malloc`], [`free`], [`realloc`], ...) carry
//! the usual libc contracts; [`Magalloc`] wraps them for use as a Rust
//! global allocator:
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: magalloc::Magalloc = magalloc::Magalloc;
//! ```
#![no_std]

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{copy_nonoverlapping, null_mut, write_bytes};

use errno::{set_errno, Errno};

mod big;
mod init;
mod internal;
mod magazine;
mod options;
mod os;
mod slab;
mod sync;
mod types;
mod zone;

pub use crate::os::{set_page_provider, set_trace_hook, MmapProvider, PageProvider, TraceFn};
pub use crate::types::{MAX_SLAB_PAGEALIGN, PAGE_SIZE, ZONE_LIMIT, ZONE_SIZE};

#[doc(hidden)]
pub use crate::magazine::depot_magazine_counts;

use crate::os::SignalGuard;
use crate::types::MIN_CHUNK_SIZE;

/// Allocate `size` bytes. For `size == 0` a distinct, real pointer comes
/// back (callers free and realloc those too). Null with errno ENOMEM on
/// failure.
pub unsafe fn malloc(size: usize) -> *mut u8 {
    init::ensure_init();
    let _sig = SignalGuard::new();
    let ptr = slab::slab_alloc(size, 0);
    if ptr.is_null() {
        set_errno(Errno(libc::ENOMEM));
    } else {
        os::trace(null_mut(), size, ptr);
    }
    ptr
}

/// Allocate zeroed memory for `number` elements of `size` bytes, failing
/// with ENOMEM when the multiplication overflows.
pub unsafe fn calloc(number: usize, size: usize) -> *mut u8 {
    if internal::mul_overflow(number, size) {
        set_errno(Errno(libc::ENOMEM));
        return null_mut();
    }

    init::ensure_init();
    let _sig = SignalGuard::new();
    let ptr = slab::slab_alloc(number * size, types::AF_ZERO);
    if ptr.is_null() {
        set_errno(Errno(libc::ENOMEM));
    } else {
        os::trace(null_mut(), number * size, ptr);
    }
    ptr
}

/// Resize an allocation, reusing the passed pointer where the zone
/// chunking (or the oversized block in hand) permits. On failure the old
/// block is untouched and null comes back with errno ENOMEM.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    init::ensure_init();
    let _sig = SignalGuard::new();
    let ret = slab::slab_realloc(ptr, size);
    if ret.is_null() {
        set_errno(Errno(libc::ENOMEM));
    } else {
        os::trace(ptr, size, ret);
    }
    ret
}

/// Free an allocation; null is a no-op. A pointer the allocator never
/// handed out trips the corruption panic rather than silent reuse.
pub unsafe fn free(ptr: *mut u8) {
    os::trace(ptr, 0, null_mut());
    let _sig = SignalGuard::new();
    slab::slab_free(ptr, null_mut());
}

/// Allocate `size` bytes aligned to `alignment`, a power of two. Errno
/// carries EINVAL/ENOMEM on the null return.
pub unsafe fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    init::ensure_init();
    let _sig = SignalGuard::new();
    let mut ptr = null_mut();
    let rc = slab::slab_memalign(&mut ptr, alignment, size);
    if rc != 0 {
        set_errno(Errno(rc));
    }
    ptr
}

/// POSIX-shaped aligned allocation: `alignment` must additionally be at
/// least pointer sized. Returns 0 or an error code, errno untouched.
pub unsafe fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> i32 {
    if alignment < size_of::<*mut u8>() {
        *memptr = null_mut();
        return libc::EINVAL;
    }

    init::ensure_init();
    let _sig = SignalGuard::new();
    slab::slab_memalign(&mut *memptr, alignment, size)
}

/// Bytes usable in the allocation containing `ptr` (possibly more than
/// requested). 0 for null.
pub unsafe fn malloc_usable_size(ptr: *const u8) -> usize {
    slab::slab_usable_size(ptr)
}

/// Handle for installing the allocator with `#[global_allocator]`.
pub struct Magalloc;

unsafe impl GlobalAlloc for Magalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MIN_CHUNK_SIZE {
            malloc(layout.size())
        } else {
            aligned_alloc(layout.align(), layout.size())
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MIN_CHUNK_SIZE {
            calloc(layout.size(), 1)
        } else {
            let ptr = aligned_alloc(layout.align(), layout.size());
            if !ptr.is_null() {
                write_bytes(ptr, 0, layout.size());
            }
            ptr
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= MIN_CHUNK_SIZE {
            return realloc(ptr, new_size);
        }
        // realloc does not preserve above-minimum alignment; move by hand
        let nptr = aligned_alloc(layout.align(), new_size);
        if !nptr.is_null() {
            let old = layout.size();
            copy_nonoverlapping(ptr, nptr, if new_size > old { old } else { new_size });
            free(ptr);
        }
        nptr
    }
}
