//! Stress harness: one writer hammers a tree with random range stores,
//! erases and allocations while N readers do point lookups and scans.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use clap::{value_parser, Arg, Command};
use crossbeam_utils::thread::scope;
use rand::prelude::*;

use maple_tree::{MapleTree, TreeFlags};

cfg_if::cfg_if! {
    if #[cfg(all(not(feature = "sanitize"), target_os = "linux"))] {
        #[global_allocator]
        static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;
    }
}

// Stored values carry their generation in the upper bits; the low bit
// keeps them clear of the tree's reserved patterns.
fn value(gen: u64) -> usize {
    ((gen as usize) << 12) | 1
}

fn main() {
    let matches = Command::new("stress")
        .about("Hammer one maple tree with a writer and N readers")
        .arg(
            Arg::new("readers")
                .short('r')
                .long("readers")
                .value_parser(value_parser!(usize))
                .default_value("4"),
        )
        .arg(
            Arg::new("seconds")
                .short('t')
                .long("seconds")
                .value_parser(value_parser!(u64))
                .default_value("5"),
        )
        .arg(
            Arg::new("key-range")
                .short('k')
                .long("key-range")
                .value_parser(value_parser!(usize))
                .default_value("65536"),
        )
        .get_matches();

    let readers: usize = *matches.get_one("readers").unwrap();
    let seconds: u64 = *matches.get_one("seconds").unwrap();
    let key_range: usize = *matches.get_one("key-range").unwrap();

    let tree = MapleTree::with_flags(TreeFlags::IN_RCU | TreeFlags::ALLOC);
    let stop = AtomicBool::new(false);
    let reads = AtomicU64::new(0);
    let writes = AtomicU64::new(0);

    println!("stress: {readers} readers, {seconds}s, keys < {key_range}");
    let started = Instant::now();

    scope(|s| {
        for _ in 0..readers {
            s.spawn(|_| {
                let mut rng = rand::thread_rng();
                let mut local = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let key = rng.gen_range(0..key_range);
                    if let Some(v) = tree.load(key) {
                        assert_eq!(v & 0x1, 1, "reader saw a torn value: {v:#x}");
                    }
                    local += 1;
                    if local % 1024 == 0 {
                        for (first, last, v) in tree.range(key, key.saturating_add(256)) {
                            assert!(first <= last);
                            assert_eq!(v & 0x1, 1);
                        }
                    }
                }
                reads.fetch_add(local, Ordering::Relaxed);
            });
        }

        s.spawn(|_| {
            let mut rng = rand::thread_rng();
            let mut gen = 0u64;
            while !stop.load(Ordering::Relaxed) {
                gen += 1;
                let first = rng.gen_range(0..key_range);
                let last = first + rng.gen_range(0..64);
                match rng.gen_range(0..10) {
                    0..=5 => tree.store_range(first, last, value(gen)).unwrap(),
                    6..=7 => {
                        tree.erase(first);
                    }
                    8 => tree.store_range(first, last, 0).unwrap(),
                    _ => {
                        let _ = tree.alloc_range(16, 0, key_range, value(gen));
                    }
                }
                writes.fetch_add(1, Ordering::Relaxed);
            }
        });

        std::thread::sleep(Duration::from_secs(seconds));
        stop.store(true, Ordering::Relaxed);
    })
    .unwrap();

    let elapsed = started.elapsed().as_secs_f64();
    let reads = reads.load(Ordering::Relaxed);
    let writes = writes.load(Ordering::Relaxed);
    println!(
        "done: {:.0} reads/s, {:.0} writes/s, height {}",
        reads as f64 / elapsed,
        writes as f64 / elapsed,
        tree.height(),
    );
}
