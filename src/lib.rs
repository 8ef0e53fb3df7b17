//! An RCU-safe adaptive range tree.
//!
//! `MapleTree` maps inclusive ranges of `usize` keys to opaque `usize`
//! values.  One node carries many contiguous ranges, so lookups touch
//! very few cache lines; structural changes are copy-on-modify and are
//! published with a single pointer store, which lets any number of
//! readers run concurrently with the single writer the tree admits at a
//! time.  Replaced nodes are reclaimed through [`crossbeam_epoch`] after
//! a grace period.
//!
//! Values are machine words: `0` is the absent value, and a small
//! sentinel pattern (words with the low two bits `10` below 4096) is
//! reserved for internal use.  Callers typically store pointers or
//! shifted integers.
//!
//! ```
//! use maple_tree::MapleTree;
//!
//! let tree = MapleTree::new();
//! tree.store_range(10, 19, 0x1000).unwrap();
//! assert_eq!(tree.load(15), Some(0x1000));
//! assert_eq!(tree.load(20), None);
//! ```
//!
//! Trees created with [`TreeFlags::ALLOC`] additionally track the
//! largest absent sub-range under every internal slot, which makes
//! first-fit and last-fit range allocation cheap:
//!
//! ```
//! use maple_tree::{MapleTree, TreeFlags};
//!
//! let tree = MapleTree::with_flags(TreeFlags::ALLOC);
//! tree.store_range(0, 9, 0x1000).unwrap();
//! let at = tree.alloc_range(10, 0, 100, 0x2000).unwrap();
//! assert_eq!(at, 10);
//! ```
//!
//! Concurrent readers require [`TreeFlags::IN_RCU`]; without it the
//! writer may rewrite nodes in place and readers must be externally
//! excluded.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use crossbeam_epoch as epoch;
use parking_lot::Mutex;

mod bignode;
mod cache;
mod cursor;
mod error;
mod gap;
mod iter;
mod node;
mod spanning;
mod store;

pub use cursor::Cursor;
pub use error::{Error, Result};
pub use iter::Iter;

use node::{mk_root, root_is_node, safe_root, ENode};

bitflags! {
    /// Tree construction options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TreeFlags: usize {
        /// Track gaps for [`MapleTree::alloc_range`] and friends.
        const ALLOC = 0x1;
        /// Keep every published node immutable so readers may run
        /// concurrently with the writer.
        const IN_RCU = 0x2;
    }
}

const HEIGHT_OFFSET: u32 = 2;
const HEIGHT_MASK: usize = 0x3c;

/// An ordered map from ranges of `usize` keys to opaque word values.
///
/// All operations take `&self`: writers serialize on an internal mutex,
/// readers pin an epoch and never block.
pub struct MapleTree {
    root: AtomicUsize,
    flags: AtomicUsize,
    lock: Mutex<()>,
}

unsafe impl Send for MapleTree {}
unsafe impl Sync for MapleTree {}

impl MapleTree {
    /// An empty tree with default options.
    pub fn new() -> MapleTree {
        MapleTree::with_flags(TreeFlags::empty())
    }

    /// An empty tree with the given options.
    pub fn with_flags(flags: TreeFlags) -> MapleTree {
        MapleTree {
            root: AtomicUsize::new(0),
            flags: AtomicUsize::new(flags.bits()),
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn is_alloc(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & TreeFlags::ALLOC.bits() != 0
    }

    pub(crate) fn in_rcu(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & TreeFlags::IN_RCU.bits() != 0
    }

    /// Switch reader-visible mode on or off.  Turning it off re-enables
    /// in-place node reuse and is only safe once concurrent readers are
    /// excluded by other means.
    pub fn set_rcu(&self, enabled: bool) {
        let _lock = self.lock.lock();
        let mut flags = self.flags.load(Ordering::Relaxed);
        if enabled {
            flags |= TreeFlags::IN_RCU.bits();
        } else {
            flags &= !TreeFlags::IN_RCU.bits();
        }
        self.flags.store(flags, Ordering::Relaxed);
    }

    /// Depth of every leaf; 0 for an empty or single-entry tree.
    pub fn height(&self) -> usize {
        (self.flags.load(Ordering::Relaxed) & HEIGHT_MASK) >> HEIGHT_OFFSET
    }

    pub(crate) fn set_height(&self, depth: usize) {
        let mut flags = self.flags.load(Ordering::Relaxed);
        flags &= !HEIGHT_MASK;
        flags |= (depth << HEIGHT_OFFSET) & HEIGHT_MASK;
        self.flags.store(flags, Ordering::Relaxed);
    }

    pub(crate) fn root_word(&self) -> usize {
        self.root.load(Ordering::Acquire)
    }

    pub(crate) fn publish_root(&self, word: usize) {
        self.root.store(word, Ordering::Release);
    }

    pub(crate) fn addr(&self) -> usize {
        self as *const MapleTree as usize
    }

    /// True when the tree holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.root_word() == 0
    }

    /// The value stored at `index`, if any.
    pub fn load(&self, index: usize) -> Option<usize> {
        let guard = epoch::pin();
        let mut mas = Cursor::new(self, index, index);
        mas.load(&guard)
    }

    /// Replace `[first, last]` with `value`.  Storing `0` erases the
    /// range, coalescing it with absent neighbors.
    pub fn store_range(&self, first: usize, last: usize, value: usize) -> Result<()> {
        if first > last || node::is_reserved(value) {
            return Err(Error::InvalidArgument);
        }
        let guard = epoch::pin();
        let mut mas = Cursor::new(self, first, last);
        loop {
            {
                let _lock = self.lock.lock();
                store::store_entry(&mut mas, value, true, &guard);
            }
            if mas.recover_nomem() {
                mas.set_range(first, last);
                continue;
            }
            break;
        }
        match mas.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Replace the single index `index` with `value`.
    pub fn store(&self, index: usize, value: usize) -> Result<()> {
        self.store_range(index, index, value)
    }

    /// Store `value` over `[first, last]` only if the whole range is
    /// absent.
    pub fn insert_range(&self, first: usize, last: usize, value: usize) -> Result<()> {
        if first > last || node::is_reserved(value) {
            return Err(Error::InvalidArgument);
        }
        let guard = epoch::pin();
        let mut mas = Cursor::new(self, first, last);
        loop {
            {
                let _lock = self.lock.lock();
                store::store_entry(&mut mas, value, false, &guard);
            }
            if mas.recover_nomem() {
                mas.set_range(first, last);
                continue;
            }
            break;
        }
        match mas.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Insert at a single index.
    pub fn insert(&self, index: usize, value: usize) -> Result<()> {
        self.insert_range(index, index, value)
    }

    /// Erase the entire range containing `index` and return its value.
    /// The vacated range merges with absent neighbors.
    pub fn erase(&self, index: usize) -> Option<usize> {
        let guard = epoch::pin();
        let mut mas = Cursor::new(self, index, index);
        let mut prior = None;
        loop {
            let lock = self.lock.lock();
            mas.set_range(index, index);
            let (mut rmin, mut rmax) = (0, 0);
            prior = mas.range_load(&guard, &mut rmin, &mut rmax);
            if mas.is_none() {
                drop(lock);
                break;
            }
            mas.set_range(rmin, rmax);
            store::store_entry(&mut mas, 0, true, &guard);
            drop(lock);
            if mas.recover_nomem() {
                continue;
            }
            break;
        }
        prior
    }

    /// Place `value` over the lowest absent range of `size` indices
    /// whose endpoints lie within `[min, max]`; returns its start.
    pub fn alloc_range(&self, size: usize, min: usize, max: usize, value: usize) -> Result<usize> {
        self.alloc_impl(size, min, max, value, true)
    }

    /// As [`alloc_range`](MapleTree::alloc_range), but the highest fit.
    pub fn alloc_range_rev(
        &self,
        size: usize,
        min: usize,
        max: usize,
        value: usize,
    ) -> Result<usize> {
        self.alloc_impl(size, min, max, value, false)
    }

    fn alloc_impl(
        &self,
        size: usize,
        min: usize,
        max: usize,
        value: usize,
        fwd: bool,
    ) -> Result<usize> {
        if !self.is_alloc() {
            return Err(Error::InvalidArgument);
        }
        if size == 0 || min > max || node::is_reserved(value) {
            return Err(Error::InvalidArgument);
        }
        let guard = epoch::pin();
        let mut mas = Cursor::new(self, min, max);
        loop {
            let lock = self.lock.lock();
            mas.set_range(min, max);
            if let Err(err) = gap::empty_area(&mut mas, min, max, size, fwd) {
                drop(lock);
                mas.release_reserve();
                return Err(err);
            }
            let index = mas.index();
            let last = mas.last();
            mas.set_range(index, last);
            store::store_entry(&mut mas, value, false, &guard);
            drop(lock);
            if mas.recover_nomem() {
                continue;
            }
            return match mas.error() {
                Some(err) => Err(err),
                None => Ok(index),
            };
        }
    }

    /// Find the lowest absent range of `size` indices within
    /// `[min, max]` without storing anything.
    pub fn empty_area(&self, size: usize, min: usize, max: usize) -> Result<usize> {
        self.empty_area_impl(size, min, max, true)
    }

    /// The highest such range.
    pub fn empty_area_rev(&self, size: usize, min: usize, max: usize) -> Result<usize> {
        self.empty_area_impl(size, min, max, false)
    }

    fn empty_area_impl(&self, size: usize, min: usize, max: usize, fwd: bool) -> Result<usize> {
        if !self.is_alloc() || size == 0 || min > max {
            return Err(Error::InvalidArgument);
        }
        let _lock = self.lock.lock();
        let mut mas = Cursor::new(self, min, max);
        gap::empty_area(&mut mas, min, max, size, fwd)?;
        Ok(mas.index())
    }

    /// First entry with a range intersecting `[*index, max]`.  On
    /// success `*index` moves just past the entry so repeated calls
    /// enumerate the tree.
    pub fn find(&self, index: &mut usize, max: usize) -> Option<usize> {
        let guard = epoch::pin();
        let mut mas = Cursor::new(self, *index, *index);
        let (mut range_start, mut range_end) = (0, 0);
        let mut entry = mas
            .range_load(&guard, &mut range_start, &mut range_end)
            .unwrap_or(0);
        mas.last = range_end;
        while mas.search_cont(range_start, max, entry) {
            entry = mas.next_inner(max, &mut range_start, &guard);
        }
        if entry == 0 {
            return None;
        }
        *index = mas.last().wrapping_add(1);
        Some(entry)
    }

    /// Iterate every stored range in ascending order as
    /// `(first, last, value)`.
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self, 0, usize::MAX)
    }

    /// Iterate the ranges intersecting `[first, max]`.
    pub fn range(&self, first: usize, max: usize) -> Iter<'_> {
        Iter::new(self, first, max)
    }

    /// Drop every entry.  The old nodes are torn down after the current
    /// readers' grace period.
    pub fn clear(&self) {
        let guard = epoch::pin();
        let _lock = self.lock.lock();
        let root = self.root_word();
        self.publish_root(0);
        self.set_height(0);
        if root_is_node(root) {
            let enode = ENode::from_word(safe_root(root));
            unsafe { enode.deref() }.set_dead();
            let word = enode.word();
            unsafe {
                guard.defer_unchecked(move || store::destroy_subtree(word));
            }
        }
    }
}

impl Default for MapleTree {
    fn default() -> MapleTree {
        MapleTree::new()
    }
}

impl Drop for MapleTree {
    fn drop(&mut self) {
        let root = *self.root.get_mut();
        if root_is_node(root) {
            store::destroy_subtree(safe_root(root));
        }
    }
}

impl Clone for MapleTree {
    /// A structural copy sharing no nodes with the original.  The
    /// source's writer lock is held for the duration, so the copy is a
    /// consistent snapshot.
    fn clone(&self) -> MapleTree {
        let new = MapleTree::new();
        let _lock = self.lock.lock();
        new.flags
            .store(self.flags.load(Ordering::Relaxed), Ordering::Relaxed);
        let root = self.root_word();
        if !root_is_node(root) {
            new.publish_root(root);
            return new;
        }
        let copied = copy_subtree(safe_root(root));
        unsafe { copied.deref() }.set_parent_root(new.addr());
        new.publish_root(mk_root(copied));
        new
    }
}

fn copy_subtree(word: usize) -> ENode {
    let src = ENode::from_word(word);
    let ty = src.ty();
    let node = cache::alloc_blocking();
    let dst = ENode::new(node.as_ptr(), ty);
    unsafe { dst.deref() }.copy_words_from(unsafe { src.deref() });
    if !ty.is_leaf() {
        for slot in 0..ty.slots() {
            let child = unsafe { dst.deref() }.slot(ty, slot);
            if child == 0 {
                break;
            }
            let copied = copy_subtree(child);
            unsafe { dst.deref() }.set_slot(ty, slot, copied.word());
            unsafe { copied.deref() }.set_parent(dst, slot);
        }
    }
    dst
}

impl fmt::Debug for MapleTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapleTree")
            .field("alloc", &self.is_alloc())
            .field("in_rcu", &self.in_rcu())
            .field("height", &self.height())
            .field("empty", &self.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(n: usize) -> usize {
        0x10000 + n
    }

    #[test]
    fn reserved_values_rejected() {
        let tree = MapleTree::new();
        assert_eq!(tree.store(0, 2), Err(Error::InvalidArgument));
        assert_eq!(tree.store(0, 4094), Err(Error::InvalidArgument));
        assert_eq!(tree.insert(0, 6), Err(Error::InvalidArgument));
        // Same bit pattern above the sentinel span is fine.
        tree.store(0, 4098).unwrap();
        assert_eq!(tree.load(0), Some(4098));
    }

    #[test]
    fn inverted_range_rejected() {
        let tree = MapleTree::new();
        assert_eq!(tree.store_range(5, 4, v(1)), Err(Error::InvalidArgument));
        assert_eq!(tree.insert_range(5, 4, v(1)), Err(Error::InvalidArgument));
    }

    #[test]
    fn root_value_fast_path() {
        let tree = MapleTree::new();
        tree.store(0, v(1)).unwrap();
        // A single value at [0, 0] lives in the root word: no nodes.
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.load(0), Some(v(1)));
        assert_eq!(tree.load(1), None);

        // Expanding past index 0 builds a real leaf.
        tree.store(5, v(2)).unwrap();
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.load(0), Some(v(1)));
        assert_eq!(tree.load(5), Some(v(2)));
        assert_eq!(tree.load(3), None);
    }

    #[test]
    fn erase_returns_prior_value() {
        let tree = MapleTree::new();
        tree.store_range(10, 30, v(1)).unwrap();
        assert_eq!(tree.erase(20), Some(v(1)));
        assert_eq!(tree.load(10), None);
        assert_eq!(tree.load(30), None);
        assert_eq!(tree.erase(20), None);
    }

    #[test]
    fn erase_root_value() {
        let tree = MapleTree::new();
        tree.store(0, v(1)).unwrap();
        assert_eq!(tree.erase(0), Some(v(1)));
        assert!(tree.is_empty());
        assert_eq!(tree.erase(7), None);
    }

    #[test]
    fn alloc_range_first_and_last_fit() {
        let tree = MapleTree::with_flags(TreeFlags::ALLOC);
        tree.store_range(0, 9, v(1)).unwrap();
        tree.store_range(20, 29, v(2)).unwrap();
        tree.store_range(50, 59, v(3)).unwrap();

        assert_eq!(tree.alloc_range(10, 0, 100, v(4)), Ok(10));
        assert_eq!(tree.load(10), Some(v(4)));
        assert_eq!(tree.load(19), Some(v(4)));

        assert_eq!(tree.alloc_range_rev(10, 0, 100, v(5)), Ok(91));
        assert_eq!(tree.load(91), Some(v(5)));
        assert_eq!(tree.load(100), Some(v(5)));
    }

    #[test]
    fn alloc_range_no_fit() {
        let tree = MapleTree::with_flags(TreeFlags::ALLOC);
        tree.store_range(0, 99, v(1)).unwrap();
        assert_eq!(tree.alloc_range(5, 0, 99, v(2)), Err(Error::NoFit));
        // A window narrower than the request can never fit.
        assert_eq!(tree.alloc_range(50, 200, 220, v(2)), Err(Error::NoFit));
    }

    #[test]
    fn alloc_requires_alloc_mode() {
        let tree = MapleTree::new();
        assert_eq!(
            tree.alloc_range(1, 0, 10, v(1)),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn empty_area_reports_without_storing() {
        let tree = MapleTree::with_flags(TreeFlags::ALLOC);
        tree.store_range(0, 9, v(1)).unwrap();
        assert_eq!(tree.empty_area(5, 0, 100), Ok(10));
        assert_eq!(tree.empty_area_rev(5, 0, 100), Ok(96));
        assert_eq!(tree.load(10), None);
    }

    #[test]
    fn find_enumerates() {
        let tree = MapleTree::new();
        tree.store_range(5, 9, v(1)).unwrap();
        tree.store_range(30, 39, v(2)).unwrap();
        let mut index = 0;
        assert_eq!(tree.find(&mut index, usize::MAX), Some(v(1)));
        assert_eq!(index, 10);
        assert_eq!(tree.find(&mut index, usize::MAX), Some(v(2)));
        assert_eq!(index, 40);
        assert_eq!(tree.find(&mut index, usize::MAX), None);
    }

    #[test]
    fn clone_is_deep() {
        let tree = MapleTree::new();
        for i in 0..100usize {
            tree.store_range(i * 10, i * 10 + 3, v(i)).unwrap();
        }
        let copy = tree.clone();
        tree.store_range(0, 5000, 0).unwrap();
        let got: Vec<_> = copy.iter().collect();
        assert_eq!(got.len(), 100);
        for (i, (first, last, value)) in got.into_iter().enumerate() {
            assert_eq!((first, last, value), (i * 10, i * 10 + 3, v(i)));
        }
    }

    #[test]
    fn clear_empties_the_tree() {
        let tree = MapleTree::new();
        for i in 0..200usize {
            tree.store(i * 7, v(i)).unwrap();
        }
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.load(7), None);
        assert_eq!(tree.iter().count(), 0);
        // The tree is still usable.
        tree.store(3, v(3)).unwrap();
        assert_eq!(tree.load(3), Some(v(3)));
    }

    #[test]
    fn non_rcu_tree_reuses_nodes_in_place() {
        let tree = MapleTree::new();
        for i in 0..40usize {
            tree.store(i, v(i)).unwrap();
        }
        for i in 0..40usize {
            tree.store(i, v(i + 100)).unwrap();
            assert_eq!(tree.load(i), Some(v(i + 100)));
        }
    }

    #[test]
    fn rcu_tree_behaves_identically() {
        let tree = MapleTree::with_flags(TreeFlags::IN_RCU);
        for i in 0..40usize {
            tree.store(i * 2, v(i)).unwrap();
        }
        for i in 0..40usize {
            assert_eq!(tree.load(i * 2), Some(v(i)));
            assert_eq!(tree.load(i * 2 + 1), None);
        }
        tree.set_rcu(false);
        tree.store(0, v(99)).unwrap();
        assert_eq!(tree.load(0), Some(v(99)));
    }
}
