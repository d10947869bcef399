use core::sync::atomic::AtomicPtr;

// ------------------------------------------------------
// Main tuning parameters
// ------------------------------------------------------

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub const PAGE_SHIFT: usize = 14;
#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
pub const PAGE_SHIFT: usize = 12;

pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

pub const ZONE_SHIFT: usize = 16;                   // 64kb zones
pub const ZONE_SIZE: usize = 1 << ZONE_SHIFT;
pub const ZONE_MASK: usize = ZONE_SIZE - 1;
pub const ZONE_PAGE_COUNT: usize = ZONE_SIZE / PAGE_SIZE;

// max slab-managed allocation; anything >= this goes to the big allocator,
// as do exact page multiples above MAX_SLAB_PAGEALIGN
pub const ZONE_LIMIT: usize = 16 * 1024;
pub const MAX_SLAB_PAGEALIGN: usize = 2 * PAGE_SIZE;

pub const NZONES: usize = 72;
pub const MIN_CHUNK_SIZE: usize = 8;

// magic number stored in every live zone header
pub const ZONE_MAGIC: u32 = 0x6d61_675a;

// ------------------------------------------------------
// Magazine tuning; sized so the struct is roughly 4KB
// ------------------------------------------------------

pub const M_MAX_ROUNDS: usize = 509;
pub const M_MIN_ROUNDS: usize = 16;
pub const M_ZONE_INIT_ROUNDS: usize = 64;
pub const M_ZONE_HYSTERESIS: usize = 32;

// chunks opportunistically pulled into the loaded magazine per slab miss
pub const CACHE_CHUNKS: usize = 32;

// ------------------------------------------------------
// Big allocations. The stripe count must not exceed the
// hash size; a linear scan serves the 16-slot cache so
// keep it small.
// ------------------------------------------------------

pub const BIGHSHIFT: usize = 10;
pub const BIGHSIZE: usize = 1 << BIGHSHIFT;
pub const BIGHMASK: usize = BIGHSIZE - 1;
pub const BIGXSIZE: usize = BIGHSIZE / 16;
pub const BIGXMASK: usize = BIGXSIZE - 1;

pub const BIGCACHE: usize = 16;
pub const BIGCACHE_MASK: usize = BIGCACHE - 1;
pub const BIGCACHE_LIMIT: usize = 1024 * 1024;      // size limit for caching
pub const BIGCACHE_EXCESS: usize = 16 * 1024 * 1024; // garbage collect point

// ------------------------------------------------------
// Allocation flags
// ------------------------------------------------------

pub const AF_ZERO: u32 = 0x0001; // zero the returned memory
pub const AF_MAGS: u32 = 0x0004; // allocating magazine state; inhibit reentry

// zone flags
pub const ZF_UNZEROED: u32 = 0x0001; // recycled zone, contents are dirty

// ------------------------------------------------------
// Core structures
// ------------------------------------------------------

/// Free chunk link, written into the chunk itself.
#[repr(C)]
pub struct Chunk {
    pub next: *mut Chunk,
}

/// In-band zone header, placed at the start of every 64KB zone. The zone
/// is self-aligned so any chunk pointer recovers it by masking.
#[repr(C)]
pub struct Zone {
    pub magic: u32,          // sanity check, cleared when the zone is retired
    pub flags: u32,
    pub n_free: u32,         // free chunks, counting untouched cursor space
    pub n_max: u32,          // total chunks carved from this zone
    pub next: *mut Zone,     // per-class list link while n_free > 0
    pub base: *mut u8,       // first chunk (header-padded, chunk-aligned)
    pub u_index: u32,        // never-touched allocation cursor
    pub u_end_index: u32,    // cursor termination sentinel
    pub chunk_size: u32,
    pub zone_index: u32,
    pub first_free_pg: u32,  // lowest page with a non-empty free list
    pub page_free: [*mut Chunk; ZONE_PAGE_COUNT],
}

/// Fixed-capacity LIFO of free object pointers. Lives on a depot list or in
/// a per-thread slot; `next` threads the depot lists.
#[repr(C)]
pub struct Magazine {
    pub next: *mut Magazine,
    pub capacity: u32,       // max rounds in this magazine
    pub rounds: u32,         // current number of free rounds
    pub objects: [*mut u8; M_MAX_ROUNDS],
}

/// The loaded magazine serves immediate allocations; the previous magazine
/// is either completely full or completely empty and is swapped at need.
#[repr(C)]
pub struct MagazinePair {
    pub loaded: *mut Magazine,
    pub prev: *mut Magazine,
}

/// Per-class global pool of full and empty magazines. A single process-wide
/// lock covers every depot.
pub struct Depot {
    pub full: AtomicPtr<Magazine>,
    pub empty: AtomicPtr<Magazine>,
}

/// Per-thread magazine state, slab-allocated on first use. While `init < 1`
/// the magazine layer is bypassed entirely.
#[repr(C)]
pub struct ThrMags {
    pub mags: [MagazinePair; NZONES],
    pub newmag: *mut Magazine, // staged spare, defeats allocation reentrancy
    pub init: i32,
}

/// Record for one oversized allocation, hashed by base pointer. `active` is
/// what the caller asked for, `bytes` what we actually hold; the difference
/// is charged to the global excess counter.
#[repr(C)]
pub struct Big {
    pub next: *mut Big,
    pub base: *mut u8,
    pub active: usize,
    pub bytes: usize,
}
