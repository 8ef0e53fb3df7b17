//! End-to-end behavior of the public API.

use maple_tree::{Error, MapleTree, TreeFlags};
use rand::prelude::*;

fn v(n: usize) -> usize {
    0x10000 + n
}

#[test]
fn point_store_and_miss() {
    let tree = MapleTree::new();
    tree.store_range(0, 0, v(0xa)).unwrap();
    assert_eq!(tree.load(0), Some(v(0xa)));
    assert_eq!(tree.load(1), None);
}

#[test]
fn overlapping_store_truncates_the_older_range() {
    let tree = MapleTree::new();
    tree.store_range(10, 20, v(0xa)).unwrap();
    tree.store_range(15, 25, v(0xb)).unwrap();
    assert_eq!(tree.load(9), None);
    for i in 10..=14 {
        assert_eq!(tree.load(i), Some(v(0xa)), "index {i}");
    }
    for i in 15..=25 {
        assert_eq!(tree.load(i), Some(v(0xb)), "index {i}");
    }
    assert_eq!(tree.load(26), None);
}

#[test]
fn filling_a_leaf_then_splitting_in_the_middle() {
    let tree = MapleTree::new();
    // One leaf holds 16 slots; fill it with 1-wide ranges.
    for i in 0..16usize {
        tree.store(i * 2, v(i)).unwrap();
    }
    let before = tree.height();
    tree.store(15, v(0x99)).unwrap();
    assert!(tree.height() >= before.max(2));
    assert_eq!(tree.load(15), Some(v(0x99)));
    for i in 0..16usize {
        assert_eq!(tree.load(i * 2), Some(v(i)));
    }
    // Iteration still sees everything exactly once, in order.
    let ranges: Vec<_> = tree.iter().collect();
    assert_eq!(ranges.len(), 17);
    assert!(ranges.windows(2).all(|w| w[0].1 < w[1].0));
}

#[test]
fn allocation_scenario() {
    let tree = MapleTree::with_flags(TreeFlags::ALLOC);
    tree.store_range(0, 9, v(1)).unwrap();
    tree.store_range(20, 29, v(2)).unwrap();
    tree.store_range(50, 59, v(3)).unwrap();

    // First fit lands in [10, 19].
    assert_eq!(tree.alloc_range(10, 0, 100, v(4)), Ok(10));
    // Highest fit: the largest start x with [x, x+9] free and x+9 <= 100.
    assert_eq!(tree.alloc_range_rev(10, 0, 100, v(5)), Ok(91));
    // Free space left in the window: [30, 49] and [60, 90].
    assert_eq!(tree.alloc_range(32, 0, 100, v(6)), Err(Error::NoFit));
    assert_eq!(tree.alloc_range(30, 0, 100, v(6)), Ok(60));
    assert_eq!(tree.alloc_range(20, 0, 100, v(7)), Ok(30));
}

#[test]
fn spanning_store_across_leaves() {
    let tree = MapleTree::new();
    tree.store_range(0, 99, v(0xa)).unwrap();
    tree.store_range(100, 199, v(0xb)).unwrap();
    tree.store_range(200, 299, v(0xc)).unwrap();
    // Push the tree to multiple leaves so the next store really spans.
    for i in 0..64usize {
        tree.store_range(1000 + i * 10, 1000 + i * 10 + 5, v(i)).unwrap();
    }
    assert!(tree.height() >= 2);

    tree.store_range(50, 250, v(0xd)).unwrap();
    for i in 0..=49 {
        assert_eq!(tree.load(i), Some(v(0xa)), "index {i}");
    }
    for i in 50..=250 {
        assert_eq!(tree.load(i), Some(v(0xd)), "index {i}");
    }
    for i in 251..=299 {
        assert_eq!(tree.load(i), Some(v(0xc)), "index {i}");
    }
    assert_eq!(tree.load(300), None);
    for i in 0..64usize {
        assert_eq!(tree.load(1000 + i * 10), Some(v(i)));
    }
}

#[test]
fn spanning_erase_collapses() {
    let tree = MapleTree::new();
    for i in 0..300usize {
        tree.store(i * 3, v(i)).unwrap();
    }
    tree.store_range(100, 700, 0).unwrap();
    for i in 0..300usize {
        let key = i * 3;
        let want = if (100..=700).contains(&key) { None } else { Some(v(i)) };
        assert_eq!(tree.load(key), want, "index {key}");
    }
}

#[test]
fn erase_round_trip_preserves_neighbors() {
    let tree = MapleTree::new();
    tree.store_range(0, 9, v(1)).unwrap();
    tree.store_range(10, 19, v(2)).unwrap();
    tree.store_range(20, 29, v(3)).unwrap();
    assert_eq!(tree.erase(15), Some(v(2)));
    assert_eq!(tree.load(5), Some(v(1)));
    assert_eq!(tree.load(15), None);
    assert_eq!(tree.load(25), Some(v(3)));

    // Storing the range back restores the original picture.
    tree.store_range(10, 19, v(2)).unwrap();
    for (i, want) in [(5, v(1)), (15, v(2)), (25, v(3))] {
        assert_eq!(tree.load(i), Some(want));
    }
}

#[test]
fn insert_respects_existing_ranges() {
    let tree = MapleTree::new();
    tree.insert_range(100, 199, v(1)).unwrap();
    assert_eq!(tree.insert_range(150, 160, v(2)), Err(Error::Occupied));
    assert_eq!(tree.insert(199, v(2)), Err(Error::Occupied));
    tree.insert_range(200, 299, v(3)).unwrap();
    assert_eq!(tree.load(250), Some(v(3)));
}

#[test]
fn keyspace_top_is_not_special() {
    let tree = MapleTree::new();
    tree.store_range(usize::MAX - 5, usize::MAX, v(1)).unwrap();
    assert_eq!(tree.load(usize::MAX), Some(v(1)));
    tree.store_range(0, usize::MAX - 6, v(2)).unwrap();
    assert_eq!(tree.load(0), Some(v(2)));
    assert_eq!(tree.load(usize::MAX - 6), Some(v(2)));
    assert_eq!(tree.load(usize::MAX - 5), Some(v(1)));
}

#[test]
fn randomized_against_model() {
    let mut rng = StdRng::seed_from_u64(0x6d7472);
    for round in 0..4 {
        let flags = if round % 2 == 0 {
            TreeFlags::empty()
        } else {
            TreeFlags::ALLOC | TreeFlags::IN_RCU
        };
        let tree = MapleTree::with_flags(flags);
        let span = 4096usize;
        let mut model = vec![0usize; span + 256];
        for op in 0..1500usize {
            let first = rng.gen_range(0..span);
            let last = first + rng.gen_range(0..64);
            match rng.gen_range(0..10) {
                0..=6 => {
                    // Unique per store, so equal-value ranges can never
                    // sit side by side and confuse the erase model.
                    let val = v(op + 1);
                    tree.store_range(first, last, val).unwrap();
                    for slot in &mut model[first..=last] {
                        *slot = val;
                    }
                }
                7..=8 => {
                    tree.store_range(first, last, 0).unwrap();
                    for slot in &mut model[first..=last] {
                        *slot = 0;
                    }
                }
                _ => {
                    // Erase whatever range contains `first`.
                    let had = tree.erase(first);
                    assert_eq!(had, Some(model[first]).filter(|m| *m != 0));
                    if let Some(val) = had {
                        let mut lo = first;
                        while lo > 0 && model[lo - 1] == val {
                            lo -= 1;
                        }
                        let mut hi = first;
                        while hi + 1 < model.len() && model[hi + 1] == val {
                            hi += 1;
                        }
                        for slot in &mut model[lo..=hi] {
                            *slot = 0;
                        }
                    }
                }
            }
        }
        for (i, want) in model.iter().enumerate() {
            assert_eq!(tree.load(i).unwrap_or(0), *want, "round {round} index {i}");
        }
        // Iteration agrees with the model, in ascending disjoint ranges.
        let mut covered = 0usize;
        for (first, last, val) in tree.iter() {
            assert!(first >= covered);
            assert!(first <= last);
            for i in first..=last.min(model.len() - 1) {
                assert_eq!(model[i], val, "iter range [{first}, {last}]");
            }
            covered = last.saturating_add(1);
        }
    }
}

#[test]
fn alloc_fills_fragmented_space() {
    let tree = MapleTree::with_flags(TreeFlags::ALLOC);
    // Claim [0, 1023] in 16-wide chunks, then punch every other one out.
    let mut starts = Vec::new();
    for _ in 0..64 {
        starts.push(tree.alloc_range(16, 0, 1023, v(7)).unwrap());
    }
    assert_eq!(starts.first(), Some(&0));
    assert_eq!(starts.last(), Some(&(63 * 16)));
    assert_eq!(tree.alloc_range(16, 0, 1023, v(7)), Err(Error::NoFit));

    for s in starts.iter().step_by(2) {
        assert_eq!(tree.erase(*s), Some(v(7)));
    }
    // The holes are exactly 16 wide again and refill lowest-first.
    assert_eq!(tree.alloc_range(16, 0, 1023, v(8)), Ok(0));
    assert_eq!(tree.alloc_range(16, 0, 1023, v(8)), Ok(32));
    assert_eq!(tree.alloc_range_rev(16, 0, 1023, v(8)), Ok(62 * 16));
    assert_eq!(tree.alloc_range(17, 0, 1023, v(8)), Err(Error::NoFit));
}

#[test]
fn large_tree_deep_structure() {
    let tree = MapleTree::with_flags(TreeFlags::ALLOC);
    let n = 20_000usize;
    for i in 0..n {
        tree.store_range(i * 16, i * 16 + 7, v(i % 4096)).unwrap();
    }
    assert!(tree.height() >= 3);
    for i in (0..n).step_by(97) {
        assert_eq!(tree.load(i * 16 + 3), Some(v(i % 4096)));
        assert_eq!(tree.load(i * 16 + 8), None);
    }
    assert_eq!(tree.iter().count(), n);
    // Gap search still works at depth.
    assert_eq!(tree.alloc_range(8, 0, usize::MAX - 1, v(1)), Ok(8));
}
