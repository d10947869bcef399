//! Runtime tuning. The value of the environment variable MALLOC_OPTIONS is
//! a character string of single-letter toggles, parsed once at library init
//! and ignored for set-uid/set-gid processes:
//!
//!   'U' / 'u'  emit / do not emit a trace record for every public call
//!   'Z' / 'z'  zero / do not zero every returned allocation
//!   'H' / 'h'  pass / do not pass the dont-need hint when a zone is retired

use crate::types::AF_ZERO;

use core::sync::atomic::{AtomicBool, Ordering};

static OPT_UTRACE: AtomicBool = AtomicBool::new(false);
static OPT_MADVISE: AtomicBool = AtomicBool::new(false);
static OPT_ZERO: AtomicBool = AtomicBool::new(false);

fn issetugid() -> bool {
    unsafe { libc::geteuid() != libc::getuid() || libc::getegid() != libc::getgid() }
}

pub(crate) fn parse_env() {
    if issetugid() {
        return;
    }
    unsafe {
        let p = libc::getenv(b"MALLOC_OPTIONS\0".as_ptr() as *const libc::c_char);
        if p.is_null() {
            return;
        }
        let mut p = p as *const u8;
        while *p != 0 {
            apply(*p);
            p = p.add(1);
        }
    }
}

fn apply(c: u8) {
    match c {
        b'u' => OPT_UTRACE.store(false, Ordering::Relaxed),
        b'U' => OPT_UTRACE.store(true, Ordering::Relaxed),
        b'h' => OPT_MADVISE.store(false, Ordering::Relaxed),
        b'H' => OPT_MADVISE.store(true, Ordering::Relaxed),
        b'z' => OPT_ZERO.store(false, Ordering::Relaxed),
        b'Z' => OPT_ZERO.store(true, Ordering::Relaxed),
        _ => {}
    }
}

#[inline]
pub(crate) fn utrace_enabled() -> bool {
    OPT_UTRACE.load(Ordering::Relaxed)
}

#[inline]
pub(crate) fn madvise_enabled() -> bool {
    OPT_MADVISE.load(Ordering::Relaxed)
}

#[inline]
pub(crate) fn zero_enabled() -> bool {
    OPT_ZERO.load(Ordering::Relaxed)
}

/// Flags folded into every allocation request.
#[inline]
pub(crate) fn malloc_flags() -> u32 {
    if zero_enabled() {
        AF_ZERO
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_toggle_and_unknown_letters_are_ignored() {
        for &c in b"XZQU?" {
            apply(c);
        }
        assert!(zero_enabled());
        assert!(utrace_enabled());
        assert!(!madvise_enabled());
        for &c in b"zuH" {
            apply(c);
        }
        assert!(!zero_enabled());
        assert!(!utrace_enabled());
        assert!(madvise_enabled());
        apply(b'h');
        assert!(!madvise_enabled());
    }
}
