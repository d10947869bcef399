//! Spin locks for the four lock populations (slab, depot, zone magazine,
//! bigalloc stripes). While the process is single-threaded every lock
//! degenerates to a no-op so the common case pays no atomic cost.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

static THREADED: AtomicBool = AtomicBool::new(false);

// Where libc tracks it, prefer its view: the flag is cleared inside
// pthread_create before the new thread can run, so no thread is ever
// mid-section with elided locks when concurrency begins.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[inline]
fn os_is_threaded() -> bool {
    extern "C" {
        static __libc_single_threaded: libc::c_char;
    }
    unsafe { __libc_single_threaded == 0 }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
#[inline]
fn os_is_threaded() -> bool {
    false
}

#[inline]
pub fn is_threaded() -> bool {
    THREADED.load(Ordering::Relaxed) || os_is_threaded()
}

// Latched when a second thread registers magazine state, for platforms
// with no libc hint. Never unset; a post-fork child stays in threaded
// mode, which is merely conservative.
pub fn set_threaded() {
    THREADED.store(true, Ordering::SeqCst);
}

pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> SpinLock {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if !is_threaded() {
            return;
        }
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        if !is_threaded() {
            return;
        }
        self.locked.store(false, Ordering::Release);
    }
}
