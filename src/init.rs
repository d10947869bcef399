//! Process and thread lifecycle. The process-wide state initializes
//! exactly once, from a constructor on platforms that run them and
//! otherwise from the first public entry; there is no teardown (the OS
//! reclaims everything at exit).

use crate::magazine;
use crate::options;
use crate::os;
use crate::sync;
use crate::zone;

use core::ptr::null_mut;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

// 0 = new, 1 = initializing, 2 = done
static INIT_STATE: AtomicU8 = AtomicU8::new(0);

#[inline]
pub(crate) fn ensure_init() {
    if INIT_STATE.load(Ordering::Acquire) == 2 {
        return;
    }
    init_slow();
}

#[cold]
fn init_slow() {
    loop {
        match INIT_STATE.compare_exchange(0, 1, Ordering::Acquire, Ordering::Acquire) {
            Ok(_) => {
                malloc_init();
                INIT_STATE.store(2, Ordering::Release);
                return;
            }
            Err(2) => return,
            Err(_) => core::hint::spin_loop(),
        }
    }
}

fn malloc_init() {
    options::parse_env();
    unsafe {
        libc::pthread_atfork(Some(fork_prepare), Some(fork_parent), Some(fork_child));
    }
    // init sentinel record
    os::trace(usize::max_value() as *mut u8, 0, null_mut());
}

/* -----------------------------------------------------------
  Fork

  Only the zone-magazine and depot locks need quiescing: the
  child inherits every table and per-thread magazine as-is.
  Acquire order here is the documented lock order; release is
  the reverse.
----------------------------------------------------------- */

unsafe extern "C" fn fork_prepare() {
    zone::lock();
    magazine::DEPOT_LOCK.lock();
}

unsafe extern "C" fn fork_parent() {
    magazine::DEPOT_LOCK.unlock();
    zone::unlock();
}

unsafe extern "C" fn fork_child() {
    magazine::DEPOT_LOCK.unlock();
    zone::unlock();
}

/* -----------------------------------------------------------
  Thread registration
----------------------------------------------------------- */

static THREAD_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Called when a thread sets up its magazine state. The second
/// registration switches every lock from no-op to real.
pub(crate) fn thread_registered() {
    if THREAD_COUNT.fetch_add(1, Ordering::SeqCst) >= 1 {
        sync::set_threaded();
    }
}

/* -----------------------------------------------------------
  Run init before main where the platform supports it
----------------------------------------------------------- */

extern "C" fn init_ctor() {
    ensure_init();
}

#[cfg_attr(
    any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ),
    link_section = ".init_array"
)]
#[cfg_attr(target_vendor = "apple", link_section = "__DATA,__mod_init_func")]
#[used]
static INIT_CTOR: extern "C" fn() = init_ctor;
