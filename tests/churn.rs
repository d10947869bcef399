//! Small-object churn under real parallelism: many threads hammering one
//! size class, plus allocations migrating between threads through the
//! depot. Failure modes here are deadlock and corruption panics.

use std::thread;

#[test]
fn parallel_small_object_churn() {
    let threads: Vec<_> = (0..64)
        .map(|t| {
            thread::spawn(move || unsafe {
                for i in 0..10_000u32 {
                    let p = magalloc::malloc(17);
                    assert!(!p.is_null());
                    *p = (t ^ i as usize) as u8;
                    assert_eq!(*p, (t ^ i as usize) as u8);
                    magalloc::free(p);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    // the allocator still works afterwards
    unsafe {
        let p = magalloc::malloc(17);
        assert!(!p.is_null());
        magalloc::free(p);
    }
}

#[test]
fn allocations_migrate_between_threads() {
    let producer = thread::spawn(|| unsafe {
        let mut ptrs = Vec::with_capacity(2000);
        for i in 0..2000usize {
            let p = magalloc::malloc(96);
            assert!(!p.is_null());
            std::ptr::write_bytes(p, (i % 256) as u8, 96);
            ptrs.push(p as usize);
        }
        ptrs
    });
    let ptrs = producer.join().unwrap();

    let consumer = thread::spawn(move || unsafe {
        for (i, &p) in ptrs.iter().enumerate() {
            let p = p as *mut u8;
            assert_eq!(*p, (i % 256) as u8);
            magalloc::free(p);
        }
    });
    consumer.join().unwrap();
}

#[test]
fn mixed_size_stress() {
    let threads: Vec<_> = (0..8)
        .map(|t| {
            thread::spawn(move || unsafe {
                let sizes = [9usize, 33, 120, 260, 1030, 4099, 9000, 20_000, 70_000];
                let mut held: Vec<(usize, usize)> = Vec::new();
                for round in 0..500 {
                    let size = sizes[(t + round) % sizes.len()];
                    let p = magalloc::malloc(size);
                    assert!(!p.is_null());
                    *p = round as u8;
                    held.push((p as usize, round));
                    if held.len() > 16 {
                        let (old, tag) = held.remove(0);
                        assert_eq!(*(old as *mut u8), tag as u8);
                        magalloc::free(old as *mut u8);
                    }
                }
                for (p, tag) in held {
                    assert_eq!(*(p as *mut u8), tag as u8);
                    magalloc::free(p as *mut u8);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
}
