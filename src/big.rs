//! Oversized allocations: anything at or past the zone limit maps straight
//! from the page provider and is tracked by a record on a pointer-hashed
//! chain. Freed blocks under 1MB park in a small recycle cache (a linear
//! scan serves it, so it stays small) and may be handed back significantly
//! larger than requested; the surplus is only trimmed once the global
//! excess crosses BIGCACHE_EXCESS, because the trim walk is expensive.

use crate::internal::mpanic;
use crate::os;
use crate::slab;
use crate::sync::SpinLock;
use crate::types::*;

use core::mem::size_of;
use core::ptr::{copy_nonoverlapping, null_mut, write_bytes};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

#[allow(clippy::declare_interior_mutable_const)]
const NULL_BIG: AtomicPtr<Big> = AtomicPtr::new(null_mut());
static BIG_TABLE: [AtomicPtr<Big>; BIGHSIZE] = [NULL_BIG; BIGHSIZE];

#[allow(clippy::declare_interior_mutable_const)]
const STRIPE_INIT: SpinLock = SpinLock::new();
static BIG_LOCKS: [SpinLock; BIGXSIZE] = [STRIPE_INIT; BIGXSIZE];

#[allow(clippy::declare_interior_mutable_const)]
const NULL_SLOT: AtomicPtr<Big> = AtomicPtr::new(null_mut());
static BIGCACHE_PTRS: [AtomicPtr<Big>; BIGCACHE] = [NULL_SLOT; BIGCACHE];

#[allow(clippy::declare_interior_mutable_const)]
const ZERO_SIZE: AtomicUsize = AtomicUsize::new(0);
static BIGCACHE_SIZES: [AtomicUsize; BIGCACHE] = [ZERO_SIZE; BIGCACHE];

static BIGCACHE_INDEX: AtomicU32 = AtomicU32::new(0);

// bytes held beyond what callers asked for, across all records; deltas can
// be negative, which works out in two's complement
static EXCESS_ALLOC: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn excess_add(delta: usize) {
    EXCESS_ALLOC.fetch_add(delta, Ordering::Relaxed);
}

/* -----------------------------------------------------------
  Hashing and stripe locking
----------------------------------------------------------- */

#[inline]
fn big_hash(ptr: *const u8) -> usize {
    let a = ptr as usize;
    (a >> PAGE_SHIFT) ^ (a >> (PAGE_SHIFT + BIGHSHIFT))
}

/// Lock the chain covering `ptr` and return its head.
#[inline]
fn chain_lock(ptr: *const u8) -> &'static AtomicPtr<Big> {
    let hv = big_hash(ptr);
    BIG_LOCKS[hv & BIGXMASK].lock();
    &BIG_TABLE[hv & BIGHMASK]
}

/// Like `chain_lock`, but when the chain is empty do not bother locking.
#[inline]
fn chain_check_and_lock(ptr: *const u8) -> Option<&'static AtomicPtr<Big>> {
    let hv = big_hash(ptr);
    let head = &BIG_TABLE[hv & BIGHMASK];
    if head.load(Ordering::Relaxed).is_null() {
        return None;
    }
    BIG_LOCKS[hv & BIGXMASK].lock();
    Some(head)
}

#[inline]
fn chain_unlock(ptr: *const u8) {
    BIG_LOCKS[big_hash(ptr) & BIGXMASK].unlock();
}

unsafe fn chain_insert(big: *mut Big) {
    let head = chain_lock((*big).base);
    if (*big).active < (*big).bytes {
        excess_add((*big).bytes - (*big).active);
    }
    (*big).next = head.load(Ordering::Relaxed);
    head.store(big, Ordering::Relaxed);
    chain_unlock((*big).base);
}

/* -----------------------------------------------------------
  Bigcache

  Slot sizes are best-effort hints (stale reads are fine);
  the pointers themselves move only by atomic swap, so a
  block can never be claimed twice.
----------------------------------------------------------- */

/// Claim a cached block of at least `bytes`. The hinted size may have been
/// stale, so the caller re-checks the record and may throw it back.
unsafe fn bigcache_find_alloc(bytes: usize) -> *mut Big {
    for i in 0..BIGCACHE {
        if bytes <= BIGCACHE_SIZES[i].load(Ordering::Relaxed) {
            BIGCACHE_SIZES[i].store(0, Ordering::Relaxed);
            return BIGCACHE_PTRS[i].swap(null_mut(), Ordering::AcqRel);
        }
    }
    null_mut()
}

/// Park a freed block, preferring to displace a smaller one. Whatever
/// comes back (the displaced block, or the original if no slot took it)
/// must really be freed by the caller; null means the block was absorbed.
unsafe fn bigcache_find_free(mut big: *mut Big) -> *mut Big {
    let b = BIGCACHE_INDEX.fetch_add(1, Ordering::Relaxed).wrapping_add(1) as usize;
    for i in 0..BIGCACHE {
        let j = (b + i) & BIGCACHE_MASK;
        if BIGCACHE_SIZES[j].load(Ordering::Relaxed) < (*big).bytes {
            BIGCACHE_SIZES[j].store((*big).bytes, Ordering::Relaxed);
            big = BIGCACHE_PTRS[j].swap(big, Ordering::AcqRel);
            break;
        }
    }
    big
}

/* -----------------------------------------------------------
  Excess trimming
----------------------------------------------------------- */

/// Called opportunistically after operations that may have grown the
/// excess. Walks every chain and unmaps the tail of any record holding
/// more than its caller asked for.
pub(crate) unsafe fn handle_excess_big() {
    if EXCESS_ALLOC.load(Ordering::Relaxed) <= BIGCACHE_EXCESS {
        return;
    }

    for i in 0..BIGHSIZE {
        if BIG_TABLE[i].load(Ordering::Relaxed).is_null() {
            continue;
        }
        BIG_LOCKS[i & BIGXMASK].lock();
        let mut big = BIG_TABLE[i].load(Ordering::Relaxed);
        while !big.is_null() {
            if (*big).active < (*big).bytes {
                if (*big).active & PAGE_MASK != 0 || (*big).bytes & PAGE_MASK != 0 {
                    BIG_LOCKS[i & BIGXMASK].unlock();
                    mpanic!("big allocation record not page aligned");
                }
                os::provider().unmap(
                    (*big).base.add((*big).active),
                    (*big).bytes - (*big).active,
                );
                excess_add((*big).active.wrapping_sub((*big).bytes));
                (*big).bytes = (*big).active;
            }
            big = (*big).next;
        }
        BIG_LOCKS[i & BIGXMASK].unlock();
    }
}

/* -----------------------------------------------------------
  Allocate / free
----------------------------------------------------------- */

/// The oversized arm of the allocator. `size` is the raw request; it gets
/// page-rounded here, plus one extra page of cache coloring for requests
/// that land on 8KB multiples.
pub(crate) unsafe fn big_alloc(size: usize, flags: u32) -> *mut u8 {
    let mut size = size.wrapping_add(PAGE_MASK) & !PAGE_MASK;
    // rounding overflowed: the request was (size_t)[-PAGE_MASK..-1]
    if size == 0 {
        return null_mut();
    }

    if size & (PAGE_SIZE * 2 - 1) == 0 {
        size += PAGE_SIZE;
    }

    // reuse a cached block when one is large enough; a stale size hint
    // gives us a short block, which goes straight back to the free path
    let mut big = null_mut();
    if size <= BIGCACHE_LIMIT {
        big = bigcache_find_alloc(size);
        if !big.is_null() && (*big).bytes < size {
            big_release(big);
            big = null_mut();
        }
    }

    let chunk;
    if !big.is_null() {
        chunk = (*big).base;
        if flags & AF_ZERO != 0 {
            write_bytes(chunk, 0, size);
        }
    } else {
        chunk = os::os_mem_alloc(size, PAGE_SIZE);
        if chunk.is_null() {
            return null_mut();
        }
        big = slab::slab_alloc(size_of::<Big>(), 0) as *mut Big;
        if big.is_null() {
            os::os_mem_free(chunk, size);
            return null_mut();
        }
        (*big).base = chunk;
        (*big).bytes = size;
    }
    (*big).active = size;

    chain_insert(big);
    handle_excess_big();

    chunk
}

/// Tail of a free: try to park the block in the bigcache, then release
/// whatever the cache did not absorb (the displaced block, or this one).
/// The record must already be unlinked.
pub(crate) unsafe fn big_release(mut big: *mut Big) {
    if (*big).bytes <= BIGCACHE_LIMIT {
        big = bigcache_find_free(big);
        if big.is_null() {
            return;
        }
    }
    let ptr = (*big).base;
    let bytes = (*big).bytes;
    slab::slab_free(big as *mut u8, null_mut());
    os::os_mem_free(ptr, bytes);
}

/// Free `ptr` if it is a tracked oversized allocation. False means the
/// pointer is not big and the slab owns it.
pub(crate) unsafe fn big_free(ptr: *mut u8) -> bool {
    let head = match chain_check_and_lock(ptr) {
        Some(h) => h,
        None => return false,
    };

    let mut prev: *mut Big = null_mut();
    let mut cur = head.load(Ordering::Relaxed);
    while !cur.is_null() {
        if (*cur).base == ptr {
            if prev.is_null() {
                head.store((*cur).next, Ordering::Relaxed);
            } else {
                (*prev).next = (*cur).next;
            }
            excess_add((*cur).active.wrapping_sub((*cur).bytes));
            chain_unlock(ptr);
            big_release(cur);
            return true;
        }
        prev = cur;
        cur = (*cur).next;
    }
    chain_unlock(ptr);
    handle_excess_big();
    false
}

/* -----------------------------------------------------------
  Realloc
----------------------------------------------------------- */

/// Oversized realloc. None means `ptr` is not a tracked big allocation and
/// the slab should handle the request; Some(null) is a failed reallocation
/// with the old block left intact.
pub(crate) unsafe fn big_realloc(ptr: *mut u8, size: usize) -> Option<*mut u8> {
    let head = chain_check_and_lock(ptr)?;

    let mut prev: *mut Big = null_mut();
    let mut cur = head.load(Ordering::Relaxed);
    while !cur.is_null() {
        if (*cur).base == ptr {
            let size = size.wrapping_add(PAGE_MASK) & !PAGE_MASK;
            let bigbytes = (*cur).bytes;

            // Already fits: absorb incremental growth and shrinkage within
            // [half, whole] of what we hold, only adjusting the excess.
            if size >= bigbytes >> 1 && size <= bigbytes {
                if (*cur).active != size {
                    excess_add((*cur).active.wrapping_sub(size));
                }
                (*cur).active = size;
                chain_unlock(ptr);
                return Some(ptr);
            }

            // Scale the target so a caller growing step by step does not
            // come back for every step.
            let grown = (size + (size >> 3)).wrapping_add(PAGE_MASK) & !PAGE_MASK;

            // Try to extend the mapping in place before giving up on the
            // address; the probe must not disturb caller-visible errno.
            if grown > bigbytes {
                let saved = errno::errno();
                let addr = os::provider().map_fixed_if_vacant(ptr.add(bigbytes), grown - bigbytes);
                errno::set_errno(saved);
                if !addr.is_null() {
                    excess_add(
                        (*cur)
                            .active
                            .wrapping_sub((*cur).bytes)
                            .wrapping_add(grown - size),
                    );
                    (*cur).bytes = grown;
                    (*cur).active = size;
                    chain_unlock(ptr);
                    return Some(ptr);
                }
            }

            // Move. The record stays intact but unlinked until the new
            // allocation is in hand, so failure leaves the old block live.
            if prev.is_null() {
                head.store((*cur).next, Ordering::Relaxed);
            } else {
                (*prev).next = (*cur).next;
            }
            chain_unlock(ptr);

            let nptr = slab::slab_alloc(size, 0);
            if nptr.is_null() {
                let head = chain_lock(ptr);
                (*cur).next = head.load(Ordering::Relaxed);
                head.store(cur, Ordering::Relaxed);
                chain_unlock(ptr);
                return Some(null_mut());
            }
            copy_nonoverlapping(ptr, nptr, if size > bigbytes { bigbytes } else { size });
            excess_add((*cur).active.wrapping_sub((*cur).bytes));
            slab::slab_free(ptr, cur);
            return Some(nptr);
        }
        prev = cur;
        cur = (*cur).next;
    }
    chain_unlock(ptr);
    handle_excess_big();
    None
}

/// Usable size when `ptr` lands anywhere inside a tracked block.
pub(crate) unsafe fn big_usable_size(ptr: *const u8) -> Option<usize> {
    let head = chain_check_and_lock(ptr)?;

    let mut cur = head.load(Ordering::Relaxed);
    while !cur.is_null() {
        let base = (*cur).base as usize;
        let p = ptr as usize;
        if p >= base && p < base + (*cur).bytes {
            let n = base + (*cur).bytes - p;
            chain_unlock(ptr);
            return Some(n);
        }
        cur = (*cur).next;
    }
    chain_unlock(ptr);
    handle_excess_big();
    None
}

/* -----------------------------------------------------------
  Aligned oversized allocations
----------------------------------------------------------- */

/// The big arm of aligned allocation: page-or-larger alignment, size
/// rounded to pages. Page-aligned requests may claim a bigcache block.
pub(crate) unsafe fn big_memalign(memptr: &mut *mut u8, alignment: usize, size: usize) -> i32 {
    *memptr = null_mut();
    let alignment = if alignment < PAGE_SIZE { PAGE_SIZE } else { alignment };
    let size = if size < alignment { alignment } else { size };
    let size = (size + PAGE_MASK) & !PAGE_MASK;

    if alignment == PAGE_SIZE && size <= BIGCACHE_LIMIT {
        let mut big = bigcache_find_alloc(size);
        if !big.is_null() && (*big).bytes < size {
            big_release(big);
            big = null_mut();
        }
        if !big.is_null() {
            *memptr = (*big).base;
            (*big).active = size;
            chain_insert(big);
            handle_excess_big();
            return 0;
        }
    }

    let p = os::os_mem_alloc(size, alignment);
    if p.is_null() {
        return libc::ENOMEM;
    }
    let big = slab::slab_alloc(size_of::<Big>(), 0) as *mut Big;
    if big.is_null() {
        os::os_mem_free(p, size);
        return libc::ENOMEM;
    }
    (*big).base = p;
    (*big).active = size;
    (*big).bytes = size; // no excess
    chain_insert(big);

    *memptr = p;
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_page_granular() {
        let p = 0x7f00_dead_0000usize as *const u8;
        assert_eq!(big_hash(p), big_hash(p));
        // pointers within one page share a chain
        assert_eq!(
            big_hash(p) & BIGHMASK,
            big_hash((p as usize + PAGE_SIZE - 1) as *const u8) & BIGHMASK
        );
    }

    #[test]
    fn stripe_index_stays_in_range() {
        for a in (0usize..1 << 30).step_by(1 << 21) {
            let hv = big_hash(a as *const u8);
            assert!((hv & BIGXMASK) < BIGXSIZE);
            assert!((hv & BIGHMASK) < BIGHSIZE);
        }
    }
}
