//! In-order iteration.
//!
//! Within a node the walker advances slot by slot; when a node is
//! exhausted it ascends, steps to the parent's next slot and descends
//! along the left spine.  Every inter-node move re-checks the dead
//! marker and restarts from the root if a writer replaced the subtree in
//! the meantime, so iteration stays safe against concurrent stores.

use crossbeam_epoch::Guard;

use crate::cursor::Cursor;
use crate::node::{root_is_node, safe_root, NONE, ROOT, START};
use crate::MapleTree;

impl<'t> Cursor<'t> {
    /// First live slot at or after `offset` with pivot within `limit`;
    /// descends one level for internal nodes.  Returns the slot's pivot,
    /// or the node's max with the cursor set to `NONE`.
    fn first_node(&mut self, limit: usize) -> usize {
        let count = self.node_type().slots();
        let leaf = self.enode().is_leaf();
        let mut slot = self.offset;
        let mut min = self.min;
        while slot < count {
            let pivot = self.safe_pivot(slot);
            if pivot > limit {
                break;
            }
            let mn = self.slot_word(slot);
            if mn == 0 {
                min = pivot.wrapping_add(1);
                slot += 1;
                continue;
            }
            if !leaf {
                self.max = pivot;
                self.min = min;
                self.node = mn;
            }
            self.offset = slot;
            return pivot;
        }
        self.node = NONE;
        self.max
    }

    /// Pivot of the lowest entry reachable from the current node.
    fn first_entry(&mut self, limit: usize) -> usize {
        loop {
            let pivot = self.first_node(limit);
            if self.is_none() {
                return pivot;
            }
            if self.enode().is_leaf() {
                self.offset = 0;
                self.first_node(limit);
                if self.is_none() {
                    return limit;
                }
                return self.safe_pivot(self.offset);
            }
            self.offset = 0;
        }
    }

    /// Advance to the next live slot of the current node, bounded by
    /// `max`.  On success the cursor's `last` is the entry's pivot and
    /// `range_start` its lower bound.
    fn next_nentry(&mut self, max: usize, range_start: &mut usize) -> bool {
        let count = self.node_type().slots();
        let mut slot = self.offset;
        let mut r_start = self.lower_bound(slot);
        while slot < count {
            let pivot = self.safe_pivot(slot);
            if pivot > self.max {
                // Concurrent replacement; let the caller retry.
                break;
            }
            if slot != 0 && pivot == 0 {
                break;
            }
            if r_start > max || r_start > self.max {
                break;
            }
            let entry = self.slot_word(slot);
            if entry != 0 {
                self.last = pivot;
                *range_start = r_start;
                self.offset = slot;
                return true;
            }
            if pivot >= max {
                break;
            }
            r_start = pivot.wrapping_add(1);
            slot += 1;
        }
        *range_start = r_start;
        false
    }

    /// Step back to the previous live slot with pivot at or above
    /// `limit`.  On success `max` receives the entry's pivot.
    fn prev_nentry(&mut self, limit: usize, max: &mut usize) -> bool {
        let mut slot = self.offset;
        if slot == 0 {
            return false;
        }
        slot -= 1;
        loop {
            let pivot = self.safe_pivot(slot);
            let stale = slot != 0 && pivot == 0;
            if !stale {
                if pivot < limit {
                    return false;
                }
                if self.slot_word(slot) != 0 {
                    *max = pivot;
                    self.offset = slot;
                    return true;
                }
            }
            if slot == 0 {
                return false;
            }
            slot -= 1;
        }
    }

    /// Move to the next node at the same level holding data at or below
    /// `max`.  Restarts from the root when a dead node is observed.
    pub(crate) fn next_node(&mut self, max: usize) -> usize {
        'restart: loop {
            let mut level = 0usize;
            loop {
                if self.is_none() {
                    return self.max;
                }
                if self.on_root_node() {
                    self.node = NONE;
                    return self.max;
                }
                let mut slot = self.offset;
                let start_piv = self.safe_pivot(slot);
                level += 1;
                self.ascend();
                if self.dead_node(start_piv) {
                    continue 'restart;
                }
                let mut count = self.node_type().slots();
                let mut prev_piv = self.safe_pivot(slot);
                slot += 1;
                while slot < count {
                    let pivot = self.safe_pivot(slot);
                    if prev_piv > max {
                        self.node = NONE;
                        return self.max;
                    }
                    if slot != 0 && pivot == 0 {
                        break;
                    }
                    let mn = self.slot_word(slot);
                    if mn == 0 {
                        prev_piv = pivot;
                        slot += 1;
                        continue;
                    }
                    self.min = prev_piv.wrapping_add(1);
                    self.max = pivot;
                    if level == 1 {
                        self.offset = slot;
                        self.node = mn;
                        if self.dead_node(start_piv) {
                            continue 'restart;
                        }
                        return pivot;
                    }
                    level -= 1;
                    self.node = mn;
                    slot = 0;
                    count = self.node_type().slots();
                }
                if self.on_root_node() {
                    self.node = NONE;
                    return self.max;
                }
                self.offset = unsafe { self.enode().deref() }.parent_slot();
            }
        }
    }

    /// Move to the previous node at the same level holding data at or
    /// above `limit`.
    pub(crate) fn prev_node(&mut self, limit: usize) {
        let start_piv = self.safe_pivot(self.offset);
        'restart: loop {
            let mut level = 0usize;
            loop {
                if self.is_none() || self.on_root_node() {
                    self.node = NONE;
                    return;
                }
                let mut slot = unsafe { self.enode().deref() }.parent_slot();
                self.ascend();
                level += 1;
                if self.dead_node(start_piv) {
                    continue 'restart;
                }
                if slot == 0 {
                    if self.on_root_node() {
                        self.node = NONE;
                        return;
                    }
                    continue;
                }
                slot -= 1;
                'scan: loop {
                    let pivot = self.safe_pivot(slot);
                    let min = self.lower_bound(slot);
                    let stale = slot != 0 && pivot == 0;
                    if !stale {
                        if pivot < limit {
                            self.node = NONE;
                            return;
                        }
                        let mn = self.slot_word(slot);
                        if mn != 0 {
                            self.max = pivot;
                            self.min = min;
                            if level == 1 {
                                self.offset = slot;
                                self.node = mn;
                                if self.dead_node(start_piv) {
                                    continue 'restart;
                                }
                                return;
                            }
                            level -= 1;
                            self.node = mn;
                            let end = self.data_end();
                            slot = end;
                            continue 'scan;
                        }
                    }
                    if slot == 0 {
                        break 'scan;
                    }
                    slot -= 1;
                }
                if self.on_root_node() {
                    self.node = NONE;
                    return;
                }
            }
        }
    }

    /// The slow path of forward iteration: advance across nodes until an
    /// entry at or below `limit` turns up.  Returns the raw slot word
    /// (zero when the walk is exhausted).
    fn next_after(&mut self, limit: usize, range_start: &mut usize) -> usize {
        let index = self.index;
        self.offset += 1;
        'retry: loop {
            *range_start = self.last.wrapping_add(1);
            while !self.is_none() {
                let last_node = self.node;
                let slot = self.offset;
                let mut advance = slot > self.node_type().slots();
                if !advance {
                    if !self.enode().is_leaf() || slot == 0 {
                        *range_start = self.first_entry(limit);
                        if self.is_none() {
                            self.node = last_node;
                            advance = true;
                        }
                    }
                    if !advance {
                        if self.next_nentry(limit, range_start) {
                            break;
                        }
                        if *range_start > limit {
                            return 0;
                        }
                        advance = true;
                    }
                }
                if advance {
                    self.offset = unsafe { self.enode().deref() }.parent_slot();
                    self.next_node(limit);
                    self.offset = 0;
                }
            }
            if self.is_none() {
                return 0;
            }
            let entry = self.slot_word(self.offset);
            if self.dead_node(index) {
                continue 'retry;
            }
            return entry;
        }
    }

    /// Find the next entry; on first use, the entry containing `index`
    /// itself qualifies.
    pub(crate) fn next_inner(
        &mut self,
        limit: usize,
        range_start: &mut usize,
        guard: &Guard,
    ) -> usize {
        if !self.searchable() {
            return 0;
        }
        if self.is_start() {
            *range_start = 0;
            self.start();
            let mut range_max = 0;
            let entry = self.range_load(guard, range_start, &mut range_max);
            self.last = range_max;
            if let Some(entry) = entry {
                return entry;
            }
            if !self.searchable() {
                return 0;
            }
        }
        self.next_after(limit, range_start)
    }

    pub(crate) fn search_cont(&self, index: usize, max: usize, entry: usize) -> bool {
        if self.is_start() {
            return true;
        }
        if index >= max {
            return false;
        }
        if !self.searchable() || self.is_err() {
            return false;
        }
        entry == 0
    }

    /// From `START`, the first entry at or after `index`; afterwards the
    /// first entry after the last one returned.  Bounded by `max`
    /// (inclusive).  The entry's range is left in `[index(), last()]`.
    pub fn find(&mut self, max: usize, guard: &Guard) -> Option<usize> {
        let mut index = self.min;
        let mut entry = 0;
        while self.search_cont(index, max, entry) {
            entry = self.next_inner(max, &mut index, guard);
        }
        if entry == 0 {
            return None;
        }
        self.index = index;
        Some(entry)
    }

    /// The next stored entry after the current position, up to `max`.
    pub fn next(&mut self, max: usize, guard: &Guard) -> Option<usize> {
        let mut range_start = 0;
        let entry = self.next_inner(max, &mut range_start, guard);
        if entry == 0 {
            return None;
        }
        self.index = range_start;
        Some(entry)
    }

    /// The entry with the highest range at or above `limit`, walking the
    /// right spine.
    fn last_entry(&mut self, limit: usize) -> Option<usize> {
        if self.is_none() {
            return None;
        }
        if self.is_ptr() {
            self.index = 0;
            self.last = 0;
            return Some(safe_root(self.tree.root_word())).filter(|e| *e != 0);
        }
        loop {
            if self.enode().is_leaf() {
                self.offset = self.data_end() + 1;
                let mut max = self.max;
                if self.prev_nentry(limit, &mut max) {
                    self.last = max;
                    self.index = self.lower_bound(self.offset);
                    return Some(self.slot_word(self.offset)).filter(|e| *e != 0);
                }
                self.prev_node(limit);
                if self.is_none() {
                    return None;
                }
            } else {
                self.offset = self.data_end();
                self.descend();
            }
        }
    }

    fn prev_inner(&mut self, limit: usize) -> usize {
        let mut max = self.max;
        while !self.is_none() {
            if self.prev_nentry(limit, &mut max) {
                break;
            }
            self.prev_node(limit);
            if self.is_none() {
                break;
            }
            self.offset = self.node_type().slots();
        }
        if self.is_none() {
            self.index = 0;
            return 0;
        }
        self.last = max;
        self.index = self.lower_bound(self.offset);
        self.slot_word(self.offset)
    }

    /// The previous stored entry, down to `min`.
    pub fn prev(&mut self, min: usize, guard: &Guard) -> Option<usize> {
        let _ = guard;
        if self.index == 0 {
            return None;
        }
        if self.is_none() {
            self.node = START;
        }
        if !self.searchable() && !self.is_start() {
            return None;
        }
        if self.is_start() {
            self.start();
            if self.is_none() && min == 0 {
                // A single-entry root is invisible to walks seeded past
                // index 0, but it is still the previous entry.
                let root = self.tree.root_word();
                if root != 0 && !root_is_node(root) {
                    self.node = ROOT;
                    self.offset = crate::node::NODE_SLOTS;
                    self.index = 0;
                    self.last = 0;
                    return Some(root);
                }
            }
            return self.last_entry(min);
        }
        loop {
            let entry = self.prev_inner(min);
            if entry != 0 {
                return Some(entry);
            }
            if !self.searchable() {
                return None;
            }
        }
    }
}

/// Iterator over `(first, last, value)` of each stored range, ascending.
/// Holds an epoch pin for its whole lifetime; for long scans prefer
/// resuming with [`Cursor::pause`].
pub struct Iter<'t> {
    mas: Cursor<'t>,
    guard: Guard,
    max: usize,
}

impl<'t> Iter<'t> {
    pub(crate) fn new(tree: &'t MapleTree, first: usize, max: usize) -> Iter<'t> {
        Iter {
            mas: Cursor::new(tree, first, first),
            guard: crossbeam_epoch::pin(),
            max,
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = (usize, usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.mas.find(self.max, &self.guard)?;
        Some((self.mas.index(), self.mas.last(), entry))
    }
}

#[cfg(test)]
mod tests {
    use crate::MapleTree;
    use crossbeam_epoch as epoch;

    fn v(n: usize) -> usize {
        0x10000 + n
    }

    #[test]
    fn iterates_in_order() {
        let tree = MapleTree::new();
        for i in 0..50usize {
            tree.store_range(i * 10, i * 10 + 4, v(i)).unwrap();
        }
        let got: Vec<_> = tree.iter().collect();
        assert_eq!(got.len(), 50);
        for (i, (first, last, val)) in got.iter().enumerate() {
            assert_eq!(*first, i * 10);
            assert_eq!(*last, i * 10 + 4);
            assert_eq!(*val, v(i));
        }
    }

    #[test]
    fn range_iteration_window() {
        let tree = MapleTree::new();
        for i in 0..100usize {
            tree.store(i * 5, v(i)).unwrap();
        }
        let got: Vec<_> = tree.range(100, 200).collect();
        assert_eq!(got.first().map(|e| e.0), Some(100));
        assert!(got.iter().all(|e| e.0 >= 100 && e.1 <= 200));
        assert_eq!(got.len(), 21); // 100, 105, ..., 200
    }

    #[test]
    fn find_skips_gaps() {
        let tree = MapleTree::new();
        tree.store_range(10, 19, v(1)).unwrap();
        tree.store_range(40, 49, v(2)).unwrap();

        let guard = epoch::pin();
        let mut mas = crate::Cursor::new(&tree, 0, 0);
        assert_eq!(mas.find(usize::MAX, &guard), Some(v(1)));
        assert_eq!((mas.index(), mas.last()), (10, 19));
        assert_eq!(mas.find(usize::MAX, &guard), Some(v(2)));
        assert_eq!((mas.index(), mas.last()), (40, 49));
        assert_eq!(mas.find(usize::MAX, &guard), None);
    }

    #[test]
    fn prev_walks_backwards() {
        let tree = MapleTree::new();
        for i in 1..=20usize {
            tree.store_range(i * 100, i * 100 + 9, v(i)).unwrap();
        }
        let guard = epoch::pin();
        let mut mas = crate::Cursor::new(&tree, usize::MAX, usize::MAX);
        let mut seen = Vec::new();
        while let Some(entry) = mas.prev(0, &guard) {
            seen.push((mas.index(), entry));
        }
        assert_eq!(seen.len(), 20);
        assert_eq!(seen[0], (2000, v(20)));
        assert_eq!(seen[19], (100, v(1)));
    }

    #[test]
    fn pause_and_resume() {
        let tree = MapleTree::new();
        for i in 0..30usize {
            tree.store(i * 2, v(i)).unwrap();
        }
        let mut collected = Vec::new();
        let mut mas = crate::Cursor::new(&tree, 0, 0);
        {
            let guard = epoch::pin();
            for _ in 0..10 {
                let e = mas.find(usize::MAX, &guard).unwrap();
                collected.push(e);
            }
            mas.pause();
        }
        // The pin is dropped; resume from where we left off.
        let guard = epoch::pin();
        while let Some(e) = mas.find(usize::MAX, &guard) {
            collected.push(e);
        }
        assert_eq!(collected, (0..30).map(v).collect::<Vec<_>>());
    }

    #[test]
    fn singleton_root_iteration() {
        let tree = MapleTree::new();
        tree.store(0, v(9)).unwrap();
        let got: Vec<_> = tree.iter().collect();
        assert_eq!(got, vec![(0, 0, v(9))]);

        let guard = epoch::pin();
        let mut mas = crate::Cursor::new(&tree, 5, 5);
        assert_eq!(mas.prev(0, &guard), Some(v(9)));
        assert_eq!(mas.index(), 0);
    }
}
