//! The walker: a reusable cursor over one tree.
//!
//! A cursor tracks the target range `[index, last]`, the node it stands
//! on, the implied `[min, max]` bounds of that node, and the slot offset
//! of the last descent step.  Write operations additionally park their
//! pre-allocated node reserve and descent statistics here.
//!
//! The node field doubles as a small state machine.  Special words mark
//! a cursor that has not descended yet (`START`), one that found the
//! single-entry root (`ROOT`), one that found nothing (`NONE`), and one
//! whose last operation failed (an encoded error).  Any mutation or retry
//! resets the cursor to `START`.

use std::ptr::NonNull;

use crossbeam_epoch::Guard;

use crate::cache;
use crate::error::Error;
use crate::node::{
    err_of, mk_err, root_is_node, safe_root, ENode, Node, NodeType, NODE_SLOTS, NONE, ROOT, START,
};
use crate::MapleTree;

pub struct Cursor<'t> {
    pub(crate) tree: &'t MapleTree,
    pub(crate) index: usize,
    pub(crate) last: usize,
    pub(crate) node: usize,
    pub(crate) min: usize,
    pub(crate) max: usize,
    pub(crate) offset: usize,
    pub(crate) depth: usize,
    /// Run length of full (positive) or almost-empty (negative) internal
    /// nodes seen on the way down during a write walk.
    pub(crate) full_cnt: i32,
    /// The node at which the current write was found to span slots.
    pub(crate) span_node: usize,
    alloc: Vec<NonNull<Node>>,
    alloc_req: usize,
}

impl<'t> Cursor<'t> {
    /// A cursor positioned over `[first, last]`, not yet descended.
    pub fn new(tree: &'t MapleTree, first: usize, last: usize) -> Cursor<'t> {
        Cursor {
            tree,
            index: first,
            last,
            node: START,
            min: 0,
            max: usize::MAX,
            offset: 0,
            depth: 0,
            full_cnt: 0,
            span_node: 0,
            alloc: Vec::new(),
            alloc_req: 0,
        }
    }

    /// Start of the range of the entry last returned.
    pub fn index(&self) -> usize {
        self.index
    }

    /// End of the range of the entry last returned.
    pub fn last(&self) -> usize {
        self.last
    }

    /// Forget the walk state; the next operation starts from the root.
    pub fn reset(&mut self) {
        self.node = START;
    }

    /// Re-aim the cursor at a different range and reset it.
    pub fn set_range(&mut self, first: usize, last: usize) {
        self.index = first;
        self.last = last;
        self.node = START;
    }

    /// Park an iteration so the pin protecting it can be dropped.  The
    /// next `find` re-enters at `last + 1`.
    pub fn pause(&mut self) {
        if self.last == usize::MAX {
            self.node = NONE;
            return;
        }
        self.reset();
        self.last += 1;
        self.index = self.last;
    }

    // --- state machine ---

    pub(crate) fn is_start(&self) -> bool {
        self.node == START
    }

    pub(crate) fn is_none(&self) -> bool {
        self.node == NONE
    }

    /// The entry lives directly in the root word.
    pub(crate) fn is_ptr(&self) -> bool {
        self.node == ROOT
    }

    pub(crate) fn is_err(&self) -> bool {
        err_of(self.node).is_some()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        err_of(self.node)
    }

    pub(crate) fn set_err(&mut self, err: Error) {
        self.node = mk_err(err);
    }

    pub(crate) fn searchable(&self) -> bool {
        !self.is_none() && !self.is_ptr()
    }

    pub(crate) fn enode(&self) -> ENode {
        ENode::from_word(self.node)
    }

    pub(crate) fn node_type(&self) -> NodeType {
        self.enode().ty()
    }

    pub(crate) fn on_root_node(&self) -> bool {
        unsafe { self.enode().deref() }.is_root()
    }

    // --- node access through the cursor ---

    pub(crate) fn slot_word(&self, slot: usize) -> usize {
        let enode = self.enode();
        unsafe { enode.deref() }.slot(enode.ty(), slot)
    }

    pub(crate) fn gap_at(&self, slot: usize) -> usize {
        let enode = self.enode();
        unsafe { enode.deref() }.gap(enode.ty(), slot)
    }

    pub(crate) fn set_node_slot(&self, slot: usize, val: usize) {
        let enode = self.enode();
        unsafe { enode.deref() }.set_slot(enode.ty(), slot, val);
    }

    pub(crate) fn set_node_pivot(&self, slot: usize, val: usize) {
        let enode = self.enode();
        unsafe { enode.deref() }.set_pivot(enode.ty(), slot, val);
    }

    pub(crate) fn safe_pivot_typed(&self, slot: usize, ty: NodeType) -> usize {
        if slot >= ty.pivots() {
            return self.max;
        }
        unsafe { self.enode().deref() }.pivot(ty, slot)
    }

    /// The pivot bounding `slot`, substituting the node's own upper bound
    /// for the final slot.
    pub(crate) fn safe_pivot(&self, slot: usize) -> usize {
        self.safe_pivot_typed(slot, self.node_type())
    }

    pub(crate) fn lower_bound(&self, slot: usize) -> usize {
        if slot == 0 {
            return self.min;
        }
        self.safe_pivot(slot - 1).wrapping_add(1)
    }

    /// Index of the last live slot.
    pub(crate) fn data_end(&self) -> usize {
        self.data_end_typed(self.node_type()).0
    }

    /// Index of the last live slot plus the final pivot of the data.
    pub(crate) fn data_end_typed(&self, ty: NodeType) -> (usize, usize) {
        let mut piv = self.min;
        let mut prev = self.min;
        let mut slot = 0;
        while slot < ty.slots() {
            piv = self.safe_pivot_typed(slot, ty);
            if piv >= self.max {
                break;
            }
            if piv == 0 && slot > 0 {
                piv = prev;
                slot -= 1;
                break;
            }
            prev = piv;
            slot += 1;
        }
        (slot, piv)
    }

    // --- movement ---

    /// Seed the walk.  Returns the entry when the tree holds a single
    /// root-word value and the cursor starts at index 0.
    pub(crate) fn start(&mut self) -> Option<usize> {
        if self.is_err() {
            return None;
        }
        if self.is_start() {
            self.node = NONE;
            self.min = 0;
            self.max = usize::MAX;
            self.offset = 0;
            let root = self.tree.root_word();
            if root == 0 {
                return None;
            }
            if !root_is_node(root) {
                // Single entry tree.
                if self.index > 0 {
                    return None;
                }
                self.node = ROOT;
                self.offset = NODE_SLOTS;
                return Some(root);
            }
            self.node = safe_root(root);
        }
        None
    }

    /// Step into the slot recorded in `offset`.
    pub(crate) fn descend(&mut self) {
        let slot = self.offset;
        if slot > 0 {
            self.min = self.safe_pivot(slot - 1).wrapping_add(1);
        }
        self.max = self.safe_pivot(slot);
        self.node = self.slot_word(slot);
    }

    /// The parent of `enode`, reconstructed from the packed parent word.
    pub(crate) fn parent_enode(&self, enode: ENode) -> ENode {
        let n = unsafe { enode.deref() };
        let word = n.parent_word();
        let shift = if word & 0x2 == 0 { 2 } else { 3 };
        let family = word & ((1 << shift) - 1) & !0x1;
        debug_assert_eq!(family, 0x6, "unexpected parent family bits");
        let ty = if self.tree.is_alloc() {
            NodeType::ARange64
        } else {
            NodeType::Range64
        };
        ENode::new(n.parent_node(), ty)
    }

    /// Move to the parent, recomputing the implied `[min, max]`.  The
    /// bounds of a node on the edge of its parent come from the nearest
    /// ancestor in which it is not on the edge.
    pub(crate) fn ascend(&mut self) {
        let cur = self.enode();
        if unsafe { cur.deref() }.is_root() {
            self.min = 0;
            self.max = usize::MAX;
            return;
        }
        let parent = self.parent_enode(cur);
        if unsafe { parent.deref() }.is_root() {
            self.min = 0;
            self.max = usize::MAX;
            self.node = parent.word();
            return;
        }
        let mut min = None;
        let mut max = None;
        let mut climb = parent;
        loop {
            let climb_node = unsafe { climb.deref() };
            if climb_node.is_root() {
                break;
            }
            let slot = climb_node.parent_slot();
            let above = self.parent_enode(climb);
            let above_node = unsafe { above.deref() };
            if min.is_none() && slot > 0 {
                min = Some(above_node.pivot(above.ty(), slot - 1).wrapping_add(1));
            }
            if max.is_none() && slot < above.ty().pivots() {
                max = Some(above_node.pivot(above.ty(), slot));
            }
            if min.is_some() && max.is_some() {
                break;
            }
            debug_assert!(climb.word() != above.word(), "ascent made no progress");
            climb = above;
        }
        self.min = min.unwrap_or(0);
        self.max = max.unwrap_or(usize::MAX);
        self.node = parent.word();
    }

    /// Find the slot covering `index` in the current node; sets the slot
    /// range through the out-parameters.  Fails when the node's pivot
    /// structure no longer covers the index (a concurrent writer replaced
    /// this subtree).
    pub(crate) fn node_walk(
        &mut self,
        ty: NodeType,
        range_min: &mut usize,
        range_max: &mut usize,
    ) -> bool {
        match ty {
            NodeType::Dense => {
                *range_min = self.index;
                *range_max = self.index;
                self.offset = self.index - self.min;
                true
            }
            _ => {
                let mut min = self.min;
                let mut pivot;
                let mut i = self.offset;
                loop {
                    if i >= ty.slots() {
                        pivot = self.max;
                        break;
                    }
                    pivot = self.safe_pivot_typed(i, ty);
                    if pivot == 0 && i > 0 {
                        if self.max < self.index {
                            self.offset = NODE_SLOTS;
                            return false;
                        }
                        pivot = self.max;
                        break;
                    }
                    if self.index <= pivot {
                        break;
                    }
                    min = pivot.wrapping_add(1);
                    i += 1;
                }
                *range_min = min;
                *range_max = pivot;
                self.offset = i;
                true
            }
        }
    }

    /// Descend from the current node to the leaf containing `index`.
    pub(crate) fn walk_descend(&mut self, range_min: &mut usize, range_max: &mut usize) -> bool {
        loop {
            self.depth += 1;
            let ty = self.node_type();
            if !self.node_walk(ty, range_min, range_max) {
                return false;
            }
            if ty.is_leaf() {
                return true;
            }
            let next = self.slot_word(self.offset);
            self.max = *range_max;
            self.min = *range_min;
            if next == 0 {
                return false;
            }
            self.node = next;
            self.offset = 0;
        }
    }

    /// Full walk from wherever the cursor stands (seeding if needed).
    pub(crate) fn range_walk(&mut self, range_min: &mut usize, range_max: &mut usize) -> bool {
        if self.start().is_some() {
            return true;
        }
        if self.is_none() {
            self.offset = NODE_SLOTS;
            return false;
        }
        if self.is_ptr() {
            *range_min = 0;
            *range_max = 0;
            return true;
        }
        self.offset = 0;
        self.walk_descend(range_min, range_max)
    }

    /// If the current node was unpublished underneath us, restart from
    /// the root and re-walk to `index`.  Returns whether a restart
    /// happened.
    pub(crate) fn dead_node(&mut self, index: usize) -> bool {
        if !self.searchable() || self.is_start() || self.is_err() {
            return false;
        }
        if !unsafe { self.enode().deref() }.is_dead() {
            return false;
        }
        self.index = index;
        self.node = START;
        let (mut rmin, mut rmax) = (0, 0);
        self.range_walk(&mut rmin, &mut rmax);
        true
    }

    /// Locate `index` and return its entry; `range_min`/`range_max`
    /// receive the containing range (stored or absent).
    pub(crate) fn range_load(
        &mut self,
        guard: &Guard,
        range_min: &mut usize,
        range_max: &mut usize,
    ) -> Option<usize> {
        let _ = guard;
        loop {
            if self.range_walk(range_min, range_max) {
                if self.is_ptr() && self.last == 0 {
                    return Some(safe_root(self.tree.root_word())).filter(|e| *e != 0);
                }
                let slot = self.offset;
                if slot >= NODE_SLOTS {
                    return None;
                }
                let entry = self.slot_word(slot);
                if unsafe { self.enode().deref() }.is_dead() {
                    self.node = START;
                    continue;
                }
                return Some(entry).filter(|e| *e != 0);
            }
            return None;
        }
    }

    /// Point lookup of `index`.
    pub fn load(&mut self, guard: &Guard) -> Option<usize> {
        let (mut rmin, mut rmax) = (0, 0);
        self.range_load(guard, &mut rmin, &mut rmax)
    }

    // --- siblings ---

    pub(crate) fn prev_sibling(&mut self) -> bool {
        if self.on_root_node() {
            return false;
        }
        let p_slot = unsafe { self.enode().deref() }.parent_slot();
        if p_slot == 0 {
            return false;
        }
        self.ascend();
        self.offset = p_slot - 1;
        self.descend();
        true
    }

    pub(crate) fn next_sibling(&mut self) -> bool {
        if self.on_root_node() {
            return false;
        }
        let p_slot = unsafe { self.enode().deref() }.parent_slot();
        let mut parent = self.snapshot();
        parent.ascend();
        if parent.data_end() == p_slot {
            return false;
        }
        self.ascend();
        self.offset = p_slot + 1;
        self.descend();
        true
    }

    // --- duplication ---

    /// A cheap copy of the walk state.  The allocation reserve stays with
    /// the original; depth and descent statistics start fresh.
    pub(crate) fn snapshot(&self) -> Cursor<'t> {
        Cursor {
            tree: self.tree,
            index: self.index,
            last: self.last,
            node: self.node,
            min: self.min,
            max: self.max,
            offset: self.offset,
            depth: 0,
            full_cnt: 0,
            span_node: 0,
            alloc: Vec::new(),
            alloc_req: 0,
        }
    }

    pub(crate) fn copy_state_from(&mut self, src: &Cursor<'t>) {
        self.index = src.index;
        self.last = src.last;
        self.node = src.node;
        self.max = src.max;
        self.min = src.min;
        self.offset = src.offset;
    }

    // --- write reserve ---

    /// Top the reserve up to `count` nodes without blocking.  On failure
    /// the cursor carries `NoMemory` and remembers the shortfall for the
    /// blocking retry.
    pub(crate) fn node_request(&mut self, count: usize) {
        while self.alloc.len() < count {
            match cache::alloc(false) {
                Some(n) => self.alloc.push(n),
                None => {
                    self.alloc_req = count - self.alloc.len();
                    self.set_err(Error::NoMemory);
                    return;
                }
            }
        }
    }

    pub(crate) fn next_alloc(&mut self) -> NonNull<Node> {
        self.alloc.pop().expect("write reserve underflow")
    }

    pub(crate) fn release_reserve(&mut self) {
        for n in self.alloc.drain(..) {
            cache::release(n.as_ptr() as usize);
        }
    }

    /// After a failed attempt: if the failure was memory exhaustion,
    /// refill the reserve in a blocking context (the caller has dropped
    /// the writer lock) and reset for a retry.  Otherwise return the
    /// untouched reserve to the cache.
    pub(crate) fn recover_nomem(&mut self) -> bool {
        if self.node != mk_err(Error::NoMemory) {
            self.release_reserve();
            return false;
        }
        let req = self.alloc_req.max(1);
        for _ in 0..req {
            if let Some(n) = cache::alloc(true) {
                self.alloc.push(n);
            }
        }
        self.alloc_req = 0;
        self.node = START;
        true
    }

    // --- descent statistics ---

    pub(crate) fn cnt_full(&mut self) {
        if self.full_cnt < 0 {
            self.full_cnt = 1;
        } else {
            self.full_cnt += 1;
        }
    }

    pub(crate) fn cnt_empty(&mut self) {
        if self.full_cnt > 0 {
            self.full_cnt = -1;
        } else {
            self.full_cnt -= 1;
        }
    }

    pub(crate) fn cnt_positive(&self) -> usize {
        self.full_cnt.unsigned_abs() as usize
    }

    pub(crate) fn set_height(&self) {
        self.tree.set_height(self.depth);
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        self.release_reserve();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    #[test]
    fn empty_tree_walk() {
        let tree = MapleTree::new();
        let guard = epoch::pin();
        let mut mas = Cursor::new(&tree, 5, 5);
        assert_eq!(mas.load(&guard), None);
        assert!(mas.is_none());
    }

    #[test]
    fn start_transitions() {
        let tree = MapleTree::new();
        let mut mas = Cursor::new(&tree, 0, 0);
        assert!(mas.is_start());
        assert_eq!(mas.start(), None);
        assert!(mas.is_none());

        // A singleton tree parks the cursor on the root sentinel.
        tree.store(0, 0x1001).unwrap();
        let mut mas = Cursor::new(&tree, 0, 0);
        let entry = mas.start();
        assert_eq!(entry, Some(0x1001));
        assert!(mas.is_ptr());

        // Positive indices miss the single-entry root.
        let mut mas = Cursor::new(&tree, 3, 3);
        assert_eq!(mas.start(), None);
        assert!(mas.is_none());
    }

    #[test]
    fn pause_advances_past_last() {
        let tree = MapleTree::new();
        let mut mas = Cursor::new(&tree, 0, 0);
        mas.last = 41;
        mas.pause();
        assert!(mas.is_start());
        assert_eq!(mas.index, 42);
        assert_eq!(mas.last, 42);

        mas.last = usize::MAX;
        mas.pause();
        assert!(mas.is_none());
    }
}
