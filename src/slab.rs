//! Slab core. A zone is reserved per chunk size and the chunks laid out in
//! an array within it; allocation and deallocation are nearly instantaneous
//! and overhead is bounded. The free chunks of a zone are tracked on
//! per-page lists so reuse stays local, with a monotonic cursor serving
//! memory that has never been touched (the backing pages fault in only as
//! the cursor advances).
//!
//! ```text
//! Alloc size    Chunking    Zone indices
//! 0-15          8           0-1
//! 16-127        16          3-10
//! 128-255       16          15-22
//! 256-511       32          23-30
//! 512-1023      64          31-38
//! 1024-2047     128         39-46
//! 2048-4095     256         47-54
//! 4096-8191     512         55-62
//! 8192-16383    1024        63-71
//! ```
//!
//! Requests >= ZONE_LIMIT, and exact page multiples above two pages, go to
//! the big allocator instead.

use crate::big;
use crate::internal::{align_up, is_pow2, mpanic, zone_of};
use crate::magazine;
use crate::options;
use crate::sync::SpinLock;
use crate::types::*;
use crate::zone;

use core::mem::size_of;
use core::ptr::{copy_nonoverlapping, null_mut, write_bytes};
use core::sync::atomic::{AtomicPtr, Ordering};

pub(crate) static SLAB_LOCK: SpinLock = SpinLock::new();

#[allow(clippy::declare_interior_mutable_const)]
const NULL_ZONE: AtomicPtr<Zone> = AtomicPtr::new(null_mut());

// one list of zones with free chunks per size class
static ZONE_LISTS: [AtomicPtr<Zone>; NZONES] = [NULL_ZONE; NZONES];

/// Zone index for an allocation request, with the size rounded up to the
/// class chunking. Total on [1, ZONE_LIMIT); anything larger is a caller
/// bug and panics.
pub(crate) fn classify(size: usize) -> (usize, usize, usize) {
    let n = size;

    // Two 8-byte zones cover 0-15; 16-byte alignment from there up to 255
    // keeps SIMD-happy without the caller asking for it. Zone indices 2
    // and 11-14 fall out unused.
    if n < 16 {
        let r = (n + 7) & !7;
        return (r / 8 - 1, r, 8);
    }
    if n < 128 {
        let r = (n + 15) & !15;
        return (r / 16 + 2, r, 16);
    }
    if n < 256 {
        let r = (n + 15) & !15;
        return (r / 16 + 7, r, 16);
    }
    if n < 8192 {
        if n < 512 {
            let r = (n + 31) & !31;
            return (r / 32 + 15, r, 32);
        }
        if n < 1024 {
            let r = (n + 63) & !63;
            return (r / 64 + 23, r, 64);
        }
        if n < 2048 {
            let r = (n + 127) & !127;
            return (r / 128 + 31, r, 128);
        }
        if n < 4096 {
            let r = (n + 255) & !255;
            return (r / 256 + 39, r, 256);
        }
        let r = (n + 511) & !511;
        return (r / 512 + 47, r, 512);
    }
    if n < 16384 {
        let r = (n + 1023) & !1023;
        return (r / 1024 + 55, r, 1024);
    }
    mpanic!("unexpected byte count {}", n);
}

/* -----------------------------------------------------------
  Allocation
----------------------------------------------------------- */

/// Allocate via the slab, or hand off to the big allocator when the size
/// calls for it. Null on out-of-memory.
pub(crate) unsafe fn slab_alloc(mut size: usize, mut flags: u32) -> *mut u8 {
    // Degenerate size == 0 requests get a real, distinct pointer so the
    // result can be freed and reallocated.
    if size == 0 {
        size = 1;
    }

    flags |= options::malloc_flags();

    // One and two page-sized chunks stay in the slab even when they are
    // exact page multiples; everything bigger that is page-shaped, and
    // everything at or above the zone limit, is the big allocator's.
    if size >= ZONE_LIMIT || (size & PAGE_MASK) == 0 && size > MAX_SLAB_PAGEALIGN {
        return big::big_alloc(size, flags);
    }

    let (zi, rounded, chunking) = classify(size);
    size = rounded;

    let obj = magazine::thread_mag_alloc(zi, flags);
    if !obj.is_null() {
        if flags & AF_ZERO != 0 {
            write_bytes(obj, 0, size);
        }
        return obj;
    }

    // Magazine miss: allocate out of an existing global zone, or set up a
    // new one if the class list is empty.
    loop {
        let z;
        if ZONE_LISTS[zi].load(Ordering::Relaxed).is_null() {
            let nz = zone::zone_alloc();
            if nz.is_null() {
                return null_mut();
            }

            // Align chunk storage past the header: power-of-2 chunk sizes
            // self-align (aligned_alloc leans on this up to two pages),
            // everything else aligns to the class chunking.
            let off = if is_pow2(size) {
                align_up(size_of::<Zone>(), size)
            } else {
                align_up(size_of::<Zone>(), chunking)
            };
            (*nz).magic = ZONE_MAGIC;
            (*nz).zone_index = zi as u32;
            (*nz).n_max = ((ZONE_SIZE - off) / size) as u32;
            (*nz).n_free = (*nz).n_max;
            (*nz).base = (nz as *mut u8).add(off);
            (*nz).u_index = 0;
            (*nz).u_end_index = 0;
            (*nz).chunk_size = size as u32;
            (*nz).first_free_pg = ZONE_PAGE_COUNT as u32;
            if (*nz).flags & ZF_UNZEROED == 0 {
                flags &= !AF_ZERO; // fresh mapping, already zero
            }

            SLAB_LOCK.lock();
            (*nz).next = ZONE_LISTS[zi].load(Ordering::Relaxed);
            ZONE_LISTS[zi].store(nz, Ordering::Relaxed);
            z = nz;
        } else {
            SLAB_LOCK.lock();
            z = ZONE_LISTS[zi].load(Ordering::Relaxed);
            if z.is_null() {
                SLAB_LOCK.unlock();
                continue;
            }
        }

        if (*z).n_free == 0 {
            SLAB_LOCK.unlock();
            mpanic!("zone on class list with no free chunks");
        }

        // Batch up to CACHE_CHUNKS extra chunks into the caller's loaded
        // magazine while we hold the lock anyway, leaving at least one
        // chunk for ourselves.
        let mp = magazine::thread_loaded_mag(zi);
        let mut count = 0usize;
        if !mp.is_null() {
            count = ((*mp).capacity - (*mp).rounds) as usize;
            if count >= (*z).n_free as usize {
                count = (*z).n_free as usize - 1;
            }
            if count > CACHE_CHUNKS {
                count = CACHE_CHUNKS;
            }
        }

        let chunk;
        'found: loop {
            // Per-page free lists first: this localizes reuse into earlier
            // pages without sorting anything.
            while (*z).first_free_pg < ZONE_PAGE_COUNT as u32 {
                let pg = (*z).first_free_pg as usize;
                let c = (*z).page_free[pg];
                if !c.is_null() {
                    if c as usize & ZONE_MASK == 0 {
                        SLAB_LOCK.unlock();
                        mpanic!("corrupt malloc zone");
                    }
                    (*z).page_free[pg] = (*c).next;
                    (*z).n_free = (*z).n_free.wrapping_sub(1);
                    if count == 0 {
                        chunk = c as *mut u8;
                        break 'found;
                    }
                    (*mp).objects[(*mp).rounds as usize] = c as *mut u8;
                    (*mp).rounds += 1;
                    count -= 1;
                    continue;
                }
                (*z).first_free_pg += 1;
            }

            // No chunks on the lists but n_free says memory remains, so it
            // must be in the never-touched area behind the cursor. If that
            // bookkeeping disagrees the zone is corrupt and continuing
            // would fabricate memory.
            loop {
                let c = (*z).base.add((*z).u_index as usize * size);
                (*z).n_free = (*z).n_free.wrapping_sub(1);
                (*z).u_index += 1;
                if (*z).u_index == (*z).n_max {
                    (*z).u_index = 0;
                }
                if (*z).u_index == (*z).u_end_index && (*z).n_free != 0 {
                    SLAB_LOCK.unlock();
                    mpanic!("corrupted zone");
                }
                if count == 0 {
                    if (*z).flags & ZF_UNZEROED == 0 {
                        flags &= !AF_ZERO; // cursor memory is demand-zero
                    }
                    chunk = c;
                    break 'found;
                }
                (*mp).objects[(*mp).rounds as usize] = c;
                (*mp).rounds += 1;
                count -= 1;
            }
        }

        // an emptied zone leaves the class list until frees return
        if (*z).n_free == 0 {
            ZONE_LISTS[zi].store((*z).next, Ordering::Relaxed);
            (*z).next = null_mut();
        }
        SLAB_LOCK.unlock();

        if flags & AF_ZERO != 0 {
            write_bytes(chunk, 0, size);
        }
        return chunk;
    }
}

/* -----------------------------------------------------------
  Free
----------------------------------------------------------- */

/// Release memory. `fast_big` carries a bigalloc record that the caller
/// already unlinked (the realloc path); the hash lookup is skipped then.
pub(crate) unsafe fn slab_free(ptr: *mut u8, fast_big: *mut Big) {
    if !fast_big.is_null() {
        big::big_release(fast_big);
        return;
    }

    if ptr.is_null() {
        return;
    }

    if big::big_free(ptr) {
        return;
    }

    // zone case: the header is recoverable because zones are self-aligned
    let z = zone_of(ptr);
    if (*z).magic != ZONE_MAGIC {
        mpanic!("free: bad pointer or corrupt zone ({:p})", ptr);
    }

    let size = (*z).chunk_size as usize;
    let zi = (*z).zone_index as usize;

    if options::zero_enabled() {
        write_bytes(ptr, 0, size);
    }

    if magazine::thread_mag_free(zi, ptr) {
        return;
    }

    let pgno = (ptr as usize - z as usize) >> PAGE_SHIFT;
    let chunk = ptr as *mut Chunk;

    SLAB_LOCK.lock();

    (*chunk).next = (*z).page_free[pgno];
    (*z).page_free[pgno] = chunk;
    if (*z).first_free_pg > pgno as u32 {
        (*z).first_free_pg = pgno as u32;
    }

    // first free chunk puts the zone back on its class list
    (*z).n_free += 1;
    if (*z).n_free == 1 {
        (*z).next = ZONE_LISTS[zi].load(Ordering::Relaxed);
        ZONE_LISTS[zi].store(z, Ordering::Relaxed);
    }

    // a wholly free zone goes back to the zone allocator
    if (*z).n_free == (*z).n_max {
        let head = ZONE_LISTS[zi].load(Ordering::Relaxed);
        if head == z {
            ZONE_LISTS[zi].store((*z).next, Ordering::Relaxed);
        } else {
            let mut cur = head;
            while !cur.is_null() && (*cur).next != z {
                cur = (*cur).next;
            }
            if cur.is_null() {
                SLAB_LOCK.unlock();
                mpanic!("free zone not on its class list");
            }
            (*cur).next = (*z).next;
        }
        (*z).magic = 0;
        (*z).next = null_mut();
        SLAB_LOCK.unlock();
        zone::zone_free(z);
    } else {
        SLAB_LOCK.unlock();
    }
}

/* -----------------------------------------------------------
  Realloc / usable size
----------------------------------------------------------- */

/// Reuses the passed pointer when the new size stays within the chunking
/// of its zone; otherwise allocate-copy-free.
pub(crate) unsafe fn slab_realloc(ptr: *mut u8, mut size: usize) -> *mut u8 {
    if ptr.is_null() {
        return slab_alloc(size, 0);
    }

    if size == 0 {
        size = 1;
    }

    if let Some(result) = big::big_realloc(ptr, size) {
        return result;
    }

    // The zone fields read here are stable without the lock for as long as
    // the caller owns the allocation.
    let z = zone_of(ptr);
    if (*z).magic != ZONE_MAGIC {
        mpanic!("realloc: bad pointer or corrupt zone ({:p})", ptr);
    }

    if size < ZONE_LIMIT {
        let (_zi, rounded, _chunking) = classify(size);
        size = rounded;
        if (*z).chunk_size as usize == size {
            return ptr;
        }
    }

    let nptr = slab_alloc(size, 0);
    if nptr.is_null() {
        return null_mut();
    }
    let old = (*z).chunk_size as usize;
    copy_nonoverlapping(ptr, nptr, if size > old { old } else { size });
    slab_free(ptr, null_mut());
    nptr
}

/// Usable bytes in the allocation containing `ptr`: the tail of the chunk
/// for slab pointers, the tail of the tracked block for big ones.
pub(crate) unsafe fn slab_usable_size(ptr: *const u8) -> usize {
    if ptr.is_null() {
        return 0;
    }

    if let Some(n) = big::big_usable_size(ptr) {
        return n;
    }

    let z = zone_of(ptr);
    if (*z).magic != ZONE_MAGIC {
        mpanic!("usable_size: bad pointer or corrupt zone ({:p})", ptr);
    }

    let cs = (*z).chunk_size as usize;
    cs - (ptr as usize - (*z).base as usize) % cs
}

/* -----------------------------------------------------------
  Aligned allocation

  The zone mechanism guarantees same-size alignment for any
  power-of-2 chunk up to two pages, so most requests resolve
  to a plain slab allocation from a suitable class; the rest
  go through page-aligned big allocations.
----------------------------------------------------------- */

pub(crate) unsafe fn slab_memalign(
    memptr: &mut *mut u8,
    alignment: usize,
    mut size: usize,
) -> i32 {
    if !is_pow2(alignment) {
        *memptr = null_mut();
        return libc::EINVAL;
    }

    // Round size up to the alignment to improve the odds of it being a
    // power of two; overflow here means the request was absurd.
    if size <= alignment {
        size = alignment;
    } else {
        size = size.wrapping_add(alignment - 1) & !(alignment - 1);
    }
    if size == 0 {
        return libc::ENOMEM;
    }

    if size <= MAX_SLAB_PAGEALIGN && size < ZONE_LIMIT && is_pow2(size) {
        *memptr = slab_alloc(size, 0);
        return if memptr.is_null() { libc::ENOMEM } else { 0 };
    }

    if size < PAGE_SIZE {
        // a class whose chunking reaches the alignment is a direct fit;
        // otherwise fall back to the next power-of-2 >= size, which
        // self-aligns
        let (_zi, rounded, chunking) = classify(size);
        if chunking >= alignment {
            *memptr = slab_alloc(rounded, 0);
        } else {
            let mut n = alignment;
            while n < size {
                n <<= 1;
            }
            *memptr = slab_alloc(n, 0);
        }
        return if memptr.is_null() { libc::ENOMEM } else { 0 };
    }

    big::big_memalign(memptr, alignment, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rounds_up_within_class_granularity() {
        for &(size, zi, rounded, chunking) in &[
            (1usize, 0usize, 8usize, 8usize),
            (8, 0, 8, 8),
            (9, 1, 16, 8),
            (15, 1, 16, 8),
            (16, 3, 16, 16),
            (17, 4, 32, 16),
            (127, 10, 128, 16),
            (128, 15, 128, 16),
            (240, 22, 240, 16),
            (255, 23, 256, 16),
            (256, 23, 256, 32),
            (511, 31, 512, 32),
            (512, 31, 512, 64),
            (1023, 39, 1024, 64),
            (1024, 39, 1024, 128),
            (2048, 47, 2048, 256),
            (4096, 55, 4096, 512),
            (8192, 63, 8192, 1024),
            (16383, 71, 16384, 1024),
        ] {
            assert_eq!(classify(size), (zi, rounded, chunking), "size {}", size);
        }
    }

    #[test]
    fn classify_is_total_and_monotonic_below_the_zone_limit() {
        let mut prev_zi = 0;
        for size in 1..ZONE_LIMIT {
            let (zi, rounded, chunking) = classify(size);
            assert!(zi < NZONES);
            assert!(rounded >= size);
            assert!(rounded % chunking == 0);
            assert!(zi >= prev_zi);
            prev_zi = zi;
        }
    }

    #[test]
    fn reserved_indices_never_appear() {
        for size in 1..ZONE_LIMIT {
            let (zi, _, _) = classify(size);
            assert!(zi != 2 && !(11..=14).contains(&zi), "size {} -> {}", size, zi);
        }
    }
}
