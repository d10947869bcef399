//! The whole test binary runs on the allocator: every Vec, String, and
//! thread spawn below goes through the GlobalAlloc implementation.

use std::collections::HashMap;
use std::thread;

#[global_allocator]
static GLOBAL: magalloc::Magalloc = magalloc::Magalloc;

#[test]
fn collections_survive_on_the_allocator() {
    let mut v: Vec<u64> = Vec::new();
    for i in 0..100_000u64 {
        v.push(i);
    }
    assert_eq!(v.len(), 100_000);
    assert_eq!(v[77_777], 77_777);

    let mut m: HashMap<String, usize> = HashMap::new();
    for i in 0..5_000usize {
        m.insert(format!("key-{}", i), i);
    }
    assert_eq!(m["key-4999"], 4999);
    drop(m);

    v.shrink_to_fit();
    v.clear();
    v.shrink_to_fit();
}

#[test]
fn threads_share_the_allocator() {
    let handles: Vec<_> = (0..8)
        .map(|t| {
            thread::spawn(move || {
                let mut acc = String::new();
                for i in 0..2_000 {
                    acc.push_str(&format!("{}:{};", t, i));
                }
                acc.len()
            })
        })
        .collect();
    for h in handles {
        assert!(h.join().unwrap() > 0);
    }
}

#[test]
fn boxed_values_round_trip() {
    let b = Box::new([0xa5u8; 3000]);
    assert_eq!(b[2999], 0xa5);
    let v = vec![b.clone(), b.clone(), b];
    for b in &v {
        assert_eq!(b[0], 0xa5);
    }
}
