use crate::internal::{align_up, RacyCell};
use crate::options;

use core::mem::MaybeUninit;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};

use libc::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use log::warn;

/* -----------------------------------------------------------
  Page provider

  The only real abstraction in the allocator: everything that
  touches the address space goes through this object so tests
  can interpose. The production provider is anonymous mmap.
----------------------------------------------------------- */

pub trait PageProvider: Sync {
    /// Map `size` bytes of zero-filled memory aligned to `align` (a power
    /// of two up to the zone size). `hint` is advisory. Null on failure.
    fn map(&self, hint: *mut u8, size: usize, align: usize) -> *mut u8;

    /// Map exactly at `addr` if and only if the range is vacant. Null when
    /// the range is occupied or the mapping fails.
    fn map_fixed_if_vacant(&self, addr: *mut u8, size: usize) -> *mut u8;

    fn unmap(&self, ptr: *mut u8, size: usize);

    /// Advisory only; the pages stay mapped but may be reclaimed.
    fn advise_dont_need(&self, ptr: *mut u8, size: usize);
}

pub struct MmapProvider {
    // probable next free address; self-resets so a bad guess cannot
    // poison the hint forever
    addr_hint: AtomicPtr<u8>,
    reset_hint: AtomicI32,
}

impl MmapProvider {
    pub const fn new() -> MmapProvider {
        MmapProvider {
            addr_hint: AtomicPtr::new(null_mut()),
            reset_hint: AtomicI32::new(16),
        }
    }
}

unsafe fn raw_map(addr: *mut u8, size: usize) -> *mut u8 {
    let p = libc::mmap(
        addr as *mut libc::c_void,
        size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        -1,
        0,
    );
    if p == libc::MAP_FAILED {
        null_mut()
    } else {
        p as *mut u8
    }
}

impl PageProvider for MmapProvider {
    fn map(&self, hint: *mut u8, size: usize, align: usize) -> *mut u8 {
        if self.reset_hint.fetch_sub(1, Ordering::Relaxed) <= 1 {
            self.addr_hint.store(null_mut(), Ordering::Relaxed);
            self.reset_hint.store(16, Ordering::Relaxed);
        }
        let try_hint = if hint.is_null() {
            self.addr_hint.load(Ordering::Relaxed)
        } else {
            hint
        };

        unsafe {
            // hinted attempt; on most kernels this is already aligned for
            // page-granular requests
            let save = raw_map(try_hint, size);
            if !save.is_null() {
                if save as usize & (align - 1) == 0 {
                    return save;
                }
                let aligned = align_up(save as usize, align) as *mut u8;
                self.addr_hint.store(aligned, Ordering::Relaxed);
                libc::munmap(save as *mut libc::c_void, size);

                let save = raw_map(aligned, size);
                if !save.is_null() {
                    if save as usize & (align - 1) == 0 {
                        return save;
                    }
                    libc::munmap(save as *mut libc::c_void, size);
                }
            }

            // worst case: overmap by the alignment and trim head and tail
            let save = raw_map(null_mut(), size + align);
            if save.is_null() {
                return null_mut();
            }
            let addr = align_up(save as usize, align) as *mut u8;
            let lead = addr as usize - save as usize;
            if lead > 0 {
                libc::munmap(save as *mut libc::c_void, lead);
            }
            if align - lead > 0 {
                libc::munmap(addr.add(size) as *mut libc::c_void, align - lead);
            }
            self.addr_hint.store(addr.add(size), Ordering::Relaxed);
            addr
        }
    }

    fn map_fixed_if_vacant(&self, addr: *mut u8, size: usize) -> *mut u8 {
        unsafe {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            let p = {
                let p = libc::mmap(
                    addr as *mut libc::c_void,
                    size,
                    PROT_READ | PROT_WRITE,
                    MAP_PRIVATE | MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                    -1,
                    0,
                );
                if p == libc::MAP_FAILED {
                    null_mut()
                } else {
                    p as *mut u8
                }
            };
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            let p = raw_map(addr, size);

            // older kernels demote the fixed request to a hint
            if !p.is_null() && p != addr {
                libc::munmap(p as *mut libc::c_void, size);
                return null_mut();
            }
            p
        }
    }

    fn unmap(&self, ptr: *mut u8, size: usize) {
        unsafe {
            if libc::munmap(ptr as *mut libc::c_void, size) == -1 {
                warn!(
                    "munmap failed: {}, addr {:p}, size {}",
                    errno::errno(),
                    ptr,
                    size
                );
            }
        }
    }

    fn advise_dont_need(&self, ptr: *mut u8, size: usize) {
        unsafe {
            if libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_DONTNEED) != 0 {
                warn!(
                    "madvise error: start: {:p}, size: {:08x}, errno: {}",
                    ptr,
                    size,
                    errno::errno().0
                );
            }
        }
    }
}

static MMAP_PROVIDER: MmapProvider = MmapProvider::new();
static PROVIDER: RacyCell<&'static dyn PageProvider> = RacyCell::new(&MMAP_PROVIDER);

/// Install a different page provider. Must happen before the allocator
/// hands out its first pointer; mappings do not migrate between providers.
pub unsafe fn set_page_provider(p: &'static dyn PageProvider) {
    *PROVIDER.get() = p;
}

#[inline]
pub(crate) fn provider() -> &'static dyn PageProvider {
    unsafe { *PROVIDER.get() }
}

#[inline]
pub(crate) fn os_mem_alloc(size: usize, align: usize) -> *mut u8 {
    provider().map(null_mut(), size, align)
}

#[inline]
pub(crate) fn os_mem_free(ptr: *mut u8, size: usize) {
    provider().unmap(ptr, size);
}

/* -----------------------------------------------------------
  Signal blocking

  Every public entry point holds one of these for its full
  extent so a signal handler can never observe the allocator
  mid-mutation on its own thread. Guards nest: an inner guard
  restores the all-blocked mask of the outer one.
----------------------------------------------------------- */

pub struct SignalGuard {
    saved: libc::sigset_t,
}

impl SignalGuard {
    #[inline]
    pub fn new() -> SignalGuard {
        unsafe {
            let mut all = MaybeUninit::<libc::sigset_t>::zeroed();
            libc::sigfillset(all.as_mut_ptr());
            let mut saved = MaybeUninit::<libc::sigset_t>::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, all.as_ptr(), saved.as_mut_ptr());
            SignalGuard {
                saved: saved.assume_init(),
            }
        }
    }
}

impl Drop for SignalGuard {
    #[inline]
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.saved, null_mut());
        }
    }
}

/* -----------------------------------------------------------
  Trace hook: one record per public call while the 'U' option
  is on. The sink must not allocate.
----------------------------------------------------------- */

pub type TraceFn = fn(old: *mut u8, size: usize, result: *mut u8);

static TRACE_HOOK: AtomicUsize = AtomicUsize::new(0);

pub fn set_trace_hook(hook: TraceFn) {
    TRACE_HOOK.store(hook as usize, Ordering::Relaxed);
}

#[inline]
pub(crate) fn trace(old: *mut u8, size: usize, result: *mut u8) {
    if !options::utrace_enabled() {
        return;
    }
    let raw = TRACE_HOOK.load(Ordering::Relaxed);
    if raw != 0 {
        let hook: TraceFn = unsafe { core::mem::transmute(raw) };
        hook(old, size, result);
    }
}
