//! Zone allocator: hands out and reclaims the self-aligned 64KB zones the
//! slab carves up. A single global magazine of free zones absorbs churn so
//! a workload oscillating around an empty-zone boundary does not translate
//! into page-provider traffic.

use crate::internal::{mpanic, RacyCell};
use crate::options;
use crate::os;
use crate::sync::SpinLock;
use crate::types::*;

use core::mem::size_of;
use core::ptr::{null_mut, write_bytes};

static ZONE_MAG_LOCK: SpinLock = SpinLock::new();
static ZONE_MAGAZINE: RacyCell<Magazine> = RacyCell::new(Magazine::new(M_ZONE_INIT_ROUNDS as u32));

pub(crate) fn lock() {
    ZONE_MAG_LOCK.lock();
}

pub(crate) fn unlock() {
    ZONE_MAG_LOCK.unlock();
}

/// A zone ready for carving: recycled from the magazine (marked unzeroed,
/// its header freshly cleared) or mapped new from the page provider (whole
/// zone known zero). Null on provider failure.
pub(crate) unsafe fn zone_alloc() -> *mut Zone {
    ZONE_MAG_LOCK.lock();
    let z = (*ZONE_MAGAZINE.get()).pop() as *mut Zone;
    if z.is_null() {
        ZONE_MAG_LOCK.unlock();
        os::os_mem_alloc(ZONE_SIZE, ZONE_SIZE) as *mut Zone
    } else {
        (*z).flags |= ZF_UNZEROED;
        ZONE_MAG_LOCK.unlock();
        z
    }
}

/// Retire a wholly free zone. When the magazine is already full, release a
/// hysteresis batch plus the newcomer to the page provider so boundary
/// oscillation does not thrash.
pub(crate) unsafe fn zone_free(z: *mut Zone) {
    ZONE_MAG_LOCK.lock();

    write_bytes(z as *mut u8, 0, size_of::<Zone>());

    if options::madvise_enabled() {
        os::provider().advise_dont_need(z as *mut u8, ZONE_SIZE);
    }

    if (*ZONE_MAGAZINE.get()).push(z as *mut u8) {
        ZONE_MAG_LOCK.unlock();
        return;
    }

    let mut excess: [*mut u8; M_ZONE_HYSTERESIS] = [null_mut(); M_ZONE_HYSTERESIS];
    for slot in excess.iter_mut() {
        *slot = (*ZONE_MAGAZINE.get()).pop();
        if slot.is_null() {
            ZONE_MAG_LOCK.unlock();
            mpanic!("zone magazine underflow");
        }
    }
    ZONE_MAG_LOCK.unlock();

    for e in excess.iter() {
        os::os_mem_free(*e, ZONE_SIZE);
    }
    os::os_mem_free(z as *mut u8, ZONE_SIZE);
}
