//! API contract tests: pointer guarantees, boundary cases, and the realloc
//! behaviors callers depend on. Everything here drives the C-shaped entry
//! points directly.

use magalloc::{
    aligned_alloc, calloc, free, malloc, malloc_usable_size, posix_memalign, realloc,
    MAX_SLAB_PAGEALIGN, PAGE_SIZE,
};

#[test]
fn usable_size_covers_the_request() {
    unsafe {
        for &size in &[
            1usize, 7, 8, 15, 16, 17, 63, 100, 127, 128, 255, 256, 1000, 1024, 4095, 4096, 8191,
            8192, 16383, 16384, 100_000, 1 << 21,
        ] {
            let p = malloc(size);
            assert!(!p.is_null(), "malloc({}) failed", size);
            assert!(
                malloc_usable_size(p) >= size,
                "usable_size({}) = {} < {}",
                size,
                malloc_usable_size(p),
                size
            );
            // touch first and last byte
            *p = 0xa5;
            *p.add(size.saturating_sub(1)) = 0x5a;
            free(p);
        }
    }
}

#[test]
fn power_of_two_sizes_self_align() {
    unsafe {
        let mut size = 8usize;
        while size <= MAX_SLAB_PAGEALIGN {
            let p = malloc(size);
            assert!(!p.is_null());
            assert_eq!(p as usize % size, 0, "malloc({}) not self-aligned", size);
            free(p);
            size <<= 1;
        }
    }
}

#[test]
fn small_allocations_align_to_their_chunking() {
    unsafe {
        let p = malloc(17);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);
        free(p);

        let p = malloc(5);
        assert!(!p.is_null());
        assert_eq!(p as usize % 8, 0);
        free(p);
    }
}

#[test]
fn page_multiples_are_page_aligned() {
    unsafe {
        // two pages stay in the slab but are still self-aligned
        let p1 = malloc(2 * PAGE_SIZE);
        let p2 = malloc(2 * PAGE_SIZE);
        assert!(!p1.is_null() && !p2.is_null());
        assert_ne!(p1, p2);
        assert_eq!(p1 as usize % PAGE_SIZE, 0);
        assert_eq!(p2 as usize % PAGE_SIZE, 0);
        free(p1);
        free(p2);

        // three pages escape to the big allocator
        let p = malloc(3 * PAGE_SIZE);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        assert!(malloc_usable_size(p) >= 3 * PAGE_SIZE);
        free(p);
    }
}

#[test]
fn eight_kb_multiples_get_cache_coloring() {
    unsafe {
        // 16KB is past the zone limit and an 8KB multiple: one page of
        // coloring slack is part of the deal
        let p = malloc(16384);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        assert!(malloc_usable_size(p) >= 16384 + PAGE_SIZE);
        free(p);
    }
}

#[test]
fn zero_size_allocations_are_real() {
    unsafe {
        let p = malloc(0);
        let q = malloc(0);
        assert!(!p.is_null());
        assert!(!q.is_null());
        assert_ne!(p, q);
        assert!(malloc_usable_size(p) >= 1);
        let p = realloc(p, 64);
        assert!(!p.is_null());
        free(p);
        free(q);

        let r = realloc(std::ptr::null_mut(), 0);
        assert!(!r.is_null());
        free(r);
    }
}

#[test]
fn free_null_is_a_noop() {
    unsafe {
        free(std::ptr::null_mut());
        assert_eq!(malloc_usable_size(std::ptr::null()), 0);
    }
}

#[test]
fn calloc_zeroes_and_checks_overflow() {
    unsafe {
        assert!(calloc(usize::max_value() / 2, 3).is_null());
        assert!(calloc(usize::max_value(), 2).is_null());

        // dirty a chunk, free it, and demand zeroed memory of the same
        // class: recycled chunks must be re-zeroed
        let p = malloc(256);
        assert!(!p.is_null());
        std::ptr::write_bytes(p, 0xff, 256);
        free(p);

        let p = calloc(16, 16);
        assert!(!p.is_null());
        for i in 0..256 {
            assert_eq!(*p.add(i), 0, "calloc byte {} not zero", i);
        }
        free(p);

        // oversized calloc, potentially served from the bigcache
        for _ in 0..2 {
            let p = calloc(1024, 64);
            assert!(!p.is_null());
            for i in 0..64 * 1024 {
                assert_eq!(*p.add(i), 0);
            }
            std::ptr::write_bytes(p, 0xee, 64 * 1024);
            free(p);
        }
    }
}

#[test]
fn realloc_preserves_contents_across_classes() {
    unsafe {
        let sizes = [17usize, 64, 200, 1000, 5000, 20_000, 300_000, 50];
        let mut p = malloc(sizes[0]);
        assert!(!p.is_null());
        for i in 0..sizes[0] {
            *p.add(i) = (i % 251) as u8;
        }
        let mut live = sizes[0];
        for &size in &sizes[1..] {
            p = realloc(p, size);
            assert!(!p.is_null(), "realloc to {} failed", size);
            let check = live.min(size).min(sizes[0]);
            for i in 0..check {
                assert_eq!(*p.add(i), (i % 251) as u8, "byte {} lost at size {}", i, size);
            }
            live = size;
        }
        free(p);
    }
}

#[test]
fn realloc_within_chunking_returns_the_same_pointer() {
    unsafe {
        let p = malloc(33); // 48-byte class
        assert!(!p.is_null());
        let q = realloc(p, 48);
        assert_eq!(p, q);
        let q = realloc(p, 36);
        assert_eq!(p, q);
        free(q);
    }
}

#[test]
fn incremental_big_realloc_mostly_stays_put() {
    unsafe {
        const BASE: usize = 100 * 1024;
        let mut p = malloc(BASE);
        assert!(!p.is_null());
        for i in 0..BASE {
            *p.add(i) = (i % 239) as u8;
        }

        let mut same = 0;
        let iterations = 99;
        for i in 1..=iterations {
            let q = realloc(p, BASE + i * 4096);
            assert!(!q.is_null());
            if q == p {
                same += 1;
            }
            p = q;
        }
        assert!(
            same * 2 >= iterations,
            "only {}/{} reallocs stayed in place",
            same,
            iterations
        );
        for i in 0..BASE {
            assert_eq!(*p.add(i), (i % 239) as u8, "byte {} lost", i);
        }
        free(p);
    }
}

#[test]
fn aligned_alloc_small_power_of_two() {
    unsafe {
        let p = aligned_alloc(1024, 700);
        assert!(!p.is_null());
        assert_eq!(p as usize % 1024, 0);
        assert!(malloc_usable_size(p) >= 1024);
        free(p);
    }
}

#[test]
fn aligned_alloc_page_and_beyond() {
    unsafe {
        for &(align, size) in &[
            (PAGE_SIZE, 3 * PAGE_SIZE),
            (4 * PAGE_SIZE, 4 * PAGE_SIZE),
            (65536usize, 100_000usize),
        ] {
            let p = aligned_alloc(align, size);
            assert!(!p.is_null(), "aligned_alloc({}, {}) failed", align, size);
            assert_eq!(p as usize % align, 0);
            assert!(malloc_usable_size(p) >= size);
            std::ptr::write_bytes(p, 0x42, size);
            free(p);
        }
    }
}

#[test]
fn aligned_alloc_rejects_bad_alignment() {
    unsafe {
        assert!(aligned_alloc(3, 64).is_null());
        assert!(aligned_alloc(0, 64).is_null());
        assert!(aligned_alloc(24, 100).is_null());
    }
}

#[test]
fn posix_memalign_contract() {
    unsafe {
        let mut p: *mut u8 = std::ptr::null_mut();

        // alignment below pointer size is invalid
        assert_eq!(posix_memalign(&mut p, 4, 100), libc::EINVAL);
        assert!(p.is_null());

        // non power of two is invalid
        assert_eq!(posix_memalign(&mut p, 48, 100), libc::EINVAL);

        assert_eq!(posix_memalign(&mut p, 64, 100), 0);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        free(p);

        assert_eq!(posix_memalign(&mut p, PAGE_SIZE, PAGE_SIZE * 5), 0);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        free(p);
    }
}

#[test]
fn live_allocations_never_overlap() {
    unsafe {
        let sizes = [
            1usize, 8, 17, 32, 100, 128, 500, 1024, 4000, 8192, 16384, 40_000, 17, 17, 17, 256,
        ];
        let mut live: Vec<(usize, usize)> = Vec::new();
        for &size in &sizes {
            let p = malloc(size);
            assert!(!p.is_null());
            let span = malloc_usable_size(p);
            live.push((p as usize, span));
        }
        for (i, &(a, alen)) in live.iter().enumerate() {
            for &(b, blen) in &live[i + 1..] {
                assert!(
                    a + alen <= b || b + blen <= a,
                    "ranges {:#x}+{} and {:#x}+{} overlap",
                    a,
                    alen,
                    b,
                    blen
                );
            }
        }
        for &(p, _) in &live {
            free(p as *mut u8);
        }
    }
}

#[test]
fn alloc_free_round_trips_leave_the_allocator_consistent() {
    unsafe {
        // drive the same classes repeatedly; magazine recycling must keep
        // handing back valid, disjoint-from-nothing memory
        for round in 0..50 {
            let p = malloc(48);
            let q = malloc(48);
            assert!(!p.is_null() && !q.is_null());
            assert_ne!(p, q);
            std::ptr::write_bytes(p, round as u8, 48);
            std::ptr::write_bytes(q, !round as u8, 48);
            assert_eq!(*p, round as u8);
            assert_eq!(*q, !round as u8);
            free(q);
            free(p);
        }
    }
}
