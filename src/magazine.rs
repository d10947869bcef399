//! Per-thread magazine cache in front of the slab core.
//!
//! Each thread owns, per size class, a pair of magazines: the loaded one
//! serves allocations and frees directly; the previous one is kept either
//! completely full or completely empty so a single swap can absorb a burst
//! in either direction. A per-class depot holds lists of full and empty
//! magazines migrating between threads. The design is in the spirit of
//! 'libumem' (Bonwick & Adams, USENIX 2001).

use crate::init;
use crate::internal::mpanic;
use crate::os::SignalGuard;
use crate::slab;
use crate::sync::SpinLock;
use crate::types::*;

use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

impl Magazine {
    #[inline]
    pub(crate) const fn new(capacity: u32) -> Magazine {
        Magazine {
            next: null_mut(),
            capacity,
            rounds: 0,
            objects: [null_mut(); M_MAX_ROUNDS],
        }
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.rounds == self.capacity
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.rounds == 0
    }

    /// Pop a round, or null if the magazine is empty.
    #[inline]
    pub(crate) fn pop(&mut self) -> *mut u8 {
        if self.rounds == 0 {
            return null_mut();
        }
        self.rounds -= 1;
        self.objects[self.rounds as usize]
    }

    /// Push a round; false if there is no room.
    #[inline]
    pub(crate) fn push(&mut self, obj: *mut u8) -> bool {
        if self.rounds == self.capacity {
            return false;
        }
        self.objects[self.rounds as usize] = obj;
        self.rounds += 1;
        true
    }
}

/// We want large magazines for small allocations and small ones near the
/// zone limit.
#[inline]
pub(crate) fn zone_capacity(zi: usize) -> u32 {
    ((NZONES - zi) * (M_MAX_ROUNDS - M_MIN_ROUNDS) / NZONES + M_MIN_ROUNDS) as u32
}

// ------------------------------------------------------
// Depots: one per size class, all under one lock
// ------------------------------------------------------

pub(crate) static DEPOT_LOCK: SpinLock = SpinLock::new();

#[allow(clippy::declare_interior_mutable_const)]
const DEPOT_INIT: Depot = Depot {
    full: AtomicPtr::new(null_mut()),
    empty: AtomicPtr::new(null_mut()),
};
static DEPOTS: [Depot; NZONES] = [DEPOT_INIT; NZONES];

// list manipulation happens under the depot lock; the heads are atomics
// only so the lock-free emptiness peek in the alloc path is well defined
unsafe fn list_push(head: &AtomicPtr<Magazine>, m: *mut Magazine) {
    (*m).next = head.load(Ordering::Relaxed);
    head.store(m, Ordering::Relaxed);
}

unsafe fn list_pop(head: &AtomicPtr<Magazine>) -> *mut Magazine {
    let m = head.load(Ordering::Relaxed);
    if !m.is_null() {
        head.store((*m).next, Ordering::Relaxed);
        (*m).next = null_mut();
    }
    m
}

/* -----------------------------------------------------------
  Per-thread state

  The block is slab-allocated on a thread's first encounter
  with the magazine layer and registered with a pthread key so
  thread exit drains it. While the block is being built (or
  torn down) `init < 1` and the layer reports miss/no-room.
----------------------------------------------------------- */

static THREAD_MAGS_KEY: crate::internal::RacyCell<libc::pthread_key_t> =
    crate::internal::RacyCell::new(0);

// 0 = not created, 1 = creating, 2 = ready
static KEY_STATE: AtomicU32 = AtomicU32::new(0);

fn ensure_key() -> libc::pthread_key_t {
    loop {
        match KEY_STATE.compare_exchange(0, 1, Ordering::Acquire, Ordering::Acquire) {
            Ok(_) => unsafe {
                if libc::pthread_key_create(THREAD_MAGS_KEY.get(), Some(thread_mags_destructor))
                    != 0
                {
                    libc::abort();
                }
                KEY_STATE.store(2, Ordering::Release);
                return *THREAD_MAGS_KEY.get();
            },
            Err(2) => return unsafe { *THREAD_MAGS_KEY.get() },
            Err(_) => core::hint::spin_loop(),
        }
    }
}

unsafe fn thread_mags_lookup() -> *mut ThrMags {
    libc::pthread_getspecific(ensure_key()) as *mut ThrMags
}

/// Existing per-thread state, or a freshly registered block. Returns null
/// when state cannot be used: creation failed, or we are inside a magazine
/// allocation (`AF_MAGS`) with no state yet.
unsafe fn thread_mags(flags: u32) -> *mut ThrMags {
    let tp = thread_mags_lookup();
    if !tp.is_null() {
        return tp;
    }
    if flags & AF_MAGS != 0 {
        return null_mut();
    }
    // register first: a second thread must switch the locks on before it
    // touches any shared structure, and the state allocation below does
    init::thread_registered();
    let tp = slab::slab_alloc(size_of::<ThrMags>(), AF_ZERO | AF_MAGS) as *mut ThrMags;
    if tp.is_null() {
        return null_mut();
    }
    (*tp).init = -1;
    if libc::pthread_setspecific(*THREAD_MAGS_KEY.get(), tp as *mut libc::c_void) != 0 {
        slab::slab_free(tp as *mut u8, null_mut());
        return null_mut();
    }
    (*tp).init = 1;
    tp
}

#[inline]
unsafe fn swap_mags(pair: &mut MagazinePair) {
    let tmp = pair.loaded;
    pair.loaded = pair.prev;
    pair.prev = tmp;
}

/// Keep the staging slot populated so depot cycling never has to allocate
/// while holding a lock. A signal handler may have staged a magazine while
/// ours was being allocated; the loser frees its duplicate (that free goes
/// through a slab whose staging slot is now occupied, so it cannot recurse
/// here again).
unsafe fn stage_newmag(tp: *mut ThrMags) -> bool {
    if !(*tp).newmag.is_null() {
        return true;
    }
    let m = slab::slab_alloc(size_of::<Magazine>(), AF_ZERO | AF_MAGS) as *mut Magazine;
    if !(*tp).newmag.is_null() {
        if !m.is_null() {
            slab::slab_free(m as *mut u8, null_mut());
        }
    } else {
        (*tp).newmag = m;
    }
    !(*tp).newmag.is_null()
}

/// Fast-path allocation. Null signals a miss; the caller falls through to
/// the slab core, which will refill the loaded magazine.
pub(crate) unsafe fn thread_mag_alloc(zi: usize, flags: u32) -> *mut u8 {
    let tp = thread_mags(flags);
    if tp.is_null() || (*tp).init < 1 {
        return null_mut();
    }

    loop {
        if flags & AF_MAGS == 0 && !stage_newmag(tp) {
            return null_mut();
        }

        // loaded magazine has rounds: pop and return
        let mp = (*tp).mags[zi].loaded;
        if !mp.is_null() {
            let obj = (*mp).pop();
            if !obj.is_null() {
                return obj;
            }
        }

        // the prev magazine is completely empty or completely full; if
        // full, swap and retry
        let mp = (*tp).mags[zi].prev;
        if !mp.is_null() && (*mp).is_full() {
            swap_mags(&mut (*tp).mags[zi]);
            continue;
        }

        // If the depot has no full magazines, make sure loaded is at least
        // an installed (empty) magazine and report the miss, letting the
        // slab core batch chunks directly into it.
        let d = &DEPOTS[zi];
        if d.full.load(Ordering::Relaxed).is_null() {
            // unlocked test is safe
            if (*tp).mags[zi].loaded.is_null() && !(*tp).newmag.is_null() {
                let m = (*tp).newmag;
                (*tp).newmag = null_mut();
                (*m).capacity = zone_capacity(zi);
                (*m).rounds = 0;
                (*m).next = null_mut();
                (*tp).mags[zi].loaded = m;
            }
            return null_mut();
        }

        // cycle: depot(full) -> loaded -> prev -> depot(empty); if we race
        // and the full list emptied, just retry
        DEPOT_LOCK.lock();
        let m = list_pop(&d.full);
        if !m.is_null() {
            let prev = (*tp).mags[zi].prev;
            if !prev.is_null() {
                list_push(&d.empty, prev);
            }
            (*tp).mags[zi].prev = (*tp).mags[zi].loaded;
            (*tp).mags[zi].loaded = m;
            if (*m).is_empty() {
                DEPOT_LOCK.unlock();
                mpanic!("empty magazine on depot full list");
            }
        }
        DEPOT_LOCK.unlock();
    }
}

/// Fast-path free. False signals no room; the caller falls through to the
/// slab core.
pub(crate) unsafe fn thread_mag_free(zi: usize, ptr: *mut u8) -> bool {
    let tp = thread_mags(0);
    if tp.is_null() || (*tp).init < 1 {
        return false;
    }

    loop {
        if !stage_newmag(tp) {
            return false;
        }

        // room in the loaded magazine: push and succeed
        let mp = (*tp).mags[zi].loaded;
        if !mp.is_null() && (*mp).push(ptr) {
            return true;
        }

        // if prev is empty, swap (prev becomes the full one) and retry
        let mp = (*tp).mags[zi].prev;
        if !mp.is_null() && (*mp).is_empty() {
            swap_mags(&mut (*tp).mags[zi]);
            continue;
        }

        // cycle: depot(empty) -> loaded -> prev -> depot(full), installing
        // the staged magazine when the depot has no empties
        let d = &DEPOTS[zi];
        DEPOT_LOCK.lock();
        let prev = (*tp).mags[zi].prev;
        if !prev.is_null() {
            list_push(&d.full, prev);
        }
        (*tp).mags[zi].prev = (*tp).mags[zi].loaded;
        let m = list_pop(&d.empty);
        if !m.is_null() {
            (*tp).mags[zi].loaded = m;
            DEPOT_LOCK.unlock();
            if (*m).is_full() {
                mpanic!("full magazine on depot empty list");
            }
        } else {
            let m = (*tp).newmag;
            (*tp).newmag = null_mut();
            (*m).capacity = zone_capacity(zi);
            (*m).rounds = 0;
            (*m).next = null_mut();
            (*tp).mags[zi].loaded = m;
            DEPOT_LOCK.unlock();
        }
    }
}

/// Loaded magazine of the calling thread for a class, if usable. The slab
/// core batches extra chunks into it under the slab lock.
pub(crate) unsafe fn thread_loaded_mag(zi: usize) -> *mut Magazine {
    let tp = thread_mags_lookup();
    if tp.is_null() || (*tp).init < 1 {
        return null_mut();
    }
    (*tp).mags[zi].loaded
}

/* -----------------------------------------------------------
  Thread teardown
----------------------------------------------------------- */

unsafe fn drain(m: *mut Magazine) {
    loop {
        let obj = (*m).pop();
        if obj.is_null() {
            break;
        }
        slab::slab_free(obj, null_mut());
    }
}

/// Reclaim everything a dying thread holds. User-level destructors running
/// after this one may allocate again; that recreates fresh state which a
/// later destructor pass reaps, bounded by the platform's destructor
/// iteration limit.
unsafe extern "C" fn thread_mags_destructor(arg: *mut libc::c_void) {
    let tp = arg as *mut ThrMags;
    if tp.is_null() {
        return;
    }

    // no magazine traffic while we tear down; keep the block visible so
    // frees issued below bypass the layer instead of re-creating state
    (*tp).init = -1;
    let key = *THREAD_MAGS_KEY.get();
    libc::pthread_setspecific(key, arg);

    let _sig = SignalGuard::new();
    for zi in 0..NZONES {
        let m = (*tp).mags[zi].loaded;
        (*tp).mags[zi].loaded = null_mut();
        if !m.is_null() {
            drain(m);
            slab::slab_free(m as *mut u8, null_mut());
        }

        let m = (*tp).mags[zi].prev;
        (*tp).mags[zi].prev = null_mut();
        if !m.is_null() {
            drain(m);
            slab::slab_free(m as *mut u8, null_mut());
        }
    }
    let m = (*tp).newmag;
    (*tp).newmag = null_mut();
    if !m.is_null() {
        slab::slab_free(m as *mut u8, null_mut());
    }

    // the state block frees itself last, while still visible with
    // init == -1, then the key slot is cleared for good
    slab::slab_free(tp as *mut u8, null_mut());
    libc::pthread_setspecific(key, null_mut());
}

/// Full/empty magazine counts for one depot. Test instrumentation.
#[doc(hidden)]
pub fn depot_magazine_counts(zi: usize) -> (usize, usize) {
    assert!(zi < NZONES);
    let d = &DEPOTS[zi];
    DEPOT_LOCK.lock();
    let mut counts = (0usize, 0usize);
    unsafe {
        let mut m = d.full.load(Ordering::Relaxed);
        while !m.is_null() {
            counts.0 += 1;
            m = (*m).next;
        }
        let mut m = d.empty.load(Ordering::Relaxed);
        while !m.is_null() {
            counts.1 += 1;
            m = (*m).next;
        }
    }
    DEPOT_LOCK.unlock();
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_curve_endpoints() {
        assert_eq!(zone_capacity(0), M_MAX_ROUNDS as u32);
        assert!(zone_capacity(NZONES - 1) >= M_MIN_ROUNDS as u32);
        for zi in 1..NZONES {
            assert!(zone_capacity(zi) <= zone_capacity(zi - 1));
            assert!(zone_capacity(zi) >= M_MIN_ROUNDS as u32);
            assert!(zone_capacity(zi) <= M_MAX_ROUNDS as u32);
        }
    }

    #[test]
    fn magazine_push_pop_lifo() {
        let mut m = Magazine::new(4);
        assert!(m.is_empty());
        assert!(m.pop().is_null());
        for i in 1..=4usize {
            assert!(m.push(i as *mut u8));
        }
        assert!(m.is_full());
        assert!(!m.push(5 as *mut u8));
        for i in (1..=4usize).rev() {
            assert_eq!(m.pop(), i as *mut u8);
        }
        assert!(m.is_empty());
    }
}
