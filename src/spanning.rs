//! Spanning writes: stores whose range crosses node boundaries.
//!
//! The replacement subtree is built bottom-up.  Two walkers descend to
//! the leaves containing the two ends of the range; their merged
//! contents, with the new entry in the middle, are staged and chopped
//! into one, two or three nodes per level.  Each level's replacements
//! become the child set staged at the next level up, together with the
//! untouched siblings on either flank.  When a level cannot produce a
//! sufficient node it borrows from a sibling, or from a cousin reached
//! by ascending and re-descending.  The finished subtree is spliced into
//! the tree with a single pointer store.

use crossbeam_epoch::Guard;

use crate::bignode::{big_to_node, node_to_big, store_to_big, BigNode};
use crate::cursor::Cursor;
use crate::node::{ENode, Topiary, NONE};
use crate::store::{
    append_entry, extend_null_pair, new_node, publish_replace, set_split_parent,
};

/// The bookkeeping for one multi-level rebuild: the original left and
/// right walkers, the replacement walkers for this level, and the lists
/// of displaced nodes.
pub(crate) struct SubtreeState<'b, 't> {
    pub(crate) orig_l: Cursor<'t>,
    pub(crate) orig_r: Cursor<'t>,
    pub(crate) l: Cursor<'t>,
    pub(crate) m: Cursor<'t>,
    pub(crate) r: Cursor<'t>,
    pub(crate) free: Topiary,
    pub(crate) destroy: Topiary,
    pub(crate) bn: &'b mut BigNode,
}

impl<'b, 't> SubtreeState<'b, 't> {
    pub(crate) fn new(mas: &Cursor<'t>, bn: &'b mut BigNode) -> SubtreeState<'b, 't> {
        let fresh = |node| {
            let mut c = Cursor::new(mas.tree, mas.index, mas.last);
            c.node = node;
            c
        };
        SubtreeState {
            orig_l: fresh(crate::node::START),
            orig_r: fresh(crate::node::START),
            l: fresh(NONE),
            m: fresh(NONE),
            r: fresh(NONE),
            free: Topiary::new(),
            destroy: Topiary::new(),
            bn,
        }
    }

    /// Queue the subtrees wholly consumed by the write for recursive
    /// teardown: the children strictly between the two walkers.
    fn topiary(&mut self) {
        let l_index = self.orig_l.index;
        self.orig_l.index = self.orig_l.last;
        let (mut rmin, mut rmax) = (0, 0);
        let ty = self.orig_l.node_type();
        self.orig_l.node_walk(ty, &mut rmin, &mut rmax);
        self.orig_l.index = l_index;

        let l_slot = self.orig_l.offset;
        let r_slot = self.orig_r.offset;
        if self.orig_l.node == self.orig_r.node {
            // Leaf slots are values, not subtrees; nothing to tear down.
            if self.orig_l.enode().is_leaf() {
                return;
            }
            for slot in l_slot + 1..r_slot {
                self.destroy.add(self.orig_l.slot_word(slot));
            }
            return;
        }

        if self.orig_r.enode().is_leaf() {
            return;
        }

        let end = self.orig_l.data_end();
        for slot in l_slot + 1..=end {
            self.destroy.add(self.orig_l.slot_word(slot));
        }
        for slot in 0..r_slot {
            self.destroy.add(self.orig_r.slot_word(slot));
        }
    }

    /// Fold the next sibling of the right walker into the staged data.
    fn rebalance_next(&mut self, old_r: usize) {
        let b_end = self.bn.b_end;
        let end = self.orig_r.data_end();
        node_to_big(&self.orig_r, 0, end, self.bn, b_end);
        self.free.add(old_r);
        self.orig_r.last = self.orig_r.max;
        if old_r == self.orig_l.node {
            self.orig_l.node = self.orig_r.node;
        }
    }

    /// Fold the previous sibling of the left walker into the staged data.
    fn rebalance_prev(&mut self, old_l: usize) {
        let end = self.orig_l.data_end();
        let b_end = self.bn.b_end;
        self.bn.shift_right(end + 1);
        node_to_big(&self.orig_l, 0, end, self.bn, 0);
        self.free.add(old_l);
        if self.orig_r.node == old_l {
            self.orig_r.node = self.orig_l.node;
        }
        self.l.min = self.orig_l.min;
        self.orig_l.index = self.orig_l.min;
        self.bn.b_end = end + 1 + b_end;
        self.l.offset += end + 1;
    }

    /// Borrow from a node with the same parent: the previous sibling
    /// first, then the next.
    fn sibling_rebalance(&mut self) -> bool {
        let old_r = self.orig_r.node;
        let old_l = self.orig_l.node;
        if self.orig_l.prev_sibling() {
            self.rebalance_prev(old_l);
            return true;
        }
        if self.orig_r.next_sibling() {
            self.rebalance_next(old_r);
            return true;
        }
        false
    }

    /// Borrow across parents: walk to the node at the same level via
    /// ascent and re-descent.  Failing both directions means the staged
    /// data is everything left at this level and will become the root.
    fn cousin_rebalance_right(&mut self) -> bool {
        let old_l = self.orig_l.node;
        let old_r = self.orig_r.node;
        let mut tmp = self.orig_r.snapshot();

        self.orig_r.offset = unsafe { self.orig_r.enode().deref() }.parent_slot();
        self.orig_r.next_node(usize::MAX);
        if !self.orig_r.is_none() {
            self.rebalance_next(old_r);
            return true;
        }

        self.orig_r.copy_state_from(&self.orig_l);
        self.r.copy_state_from(&self.l);
        self.orig_l.prev_node(0);
        if self.orig_l.is_none() {
            // Everything that remains is in the staging buffer; it will
            // become a new root.
            self.orig_l.copy_state_from(&self.orig_r);
            self.orig_r.copy_state_from(&tmp);
            return false;
        }

        self.orig_l.offset = 0;
        self.rebalance_prev(old_l);
        true
    }

    /// Move both original walkers one level up, retiring the nodes they
    /// leave behind and re-aiming their offsets at the edges of the new
    /// subtree.
    fn ascend_free(&mut self) {
        let left = self.orig_l.node;
        let right = self.orig_r.node;
        self.orig_l.ascend();
        self.orig_r.ascend();
        self.free.add(left);
        if left != right {
            self.free.add(right);
        }

        let (mut rmin, mut rmax) = (0, 0);
        self.orig_r.offset = 0;
        self.orig_r.index = self.r.max;
        if self.orig_r.last < self.orig_r.index {
            self.orig_r.last = self.orig_r.index;
        }
        let ty = self.orig_r.node_type();
        if !self.orig_r.node_walk(ty, &mut rmin, &mut rmax) {
            // The node does not reach the value; consume it whole.
            self.orig_r.offset = self.orig_r.data_end() + 1;
        }

        self.orig_l.offset = 0;
        self.orig_l.index = self.l.min;
        let ty = self.orig_l.node_type();
        self.orig_l.node_walk(ty, &mut rmin, &mut rmax);
    }

    /// Copy the untouched left flank of the original parent in front of
    /// the staged data.
    fn combine_cp_left(&mut self) {
        let l_slot = self.orig_l.offset;
        if l_slot == 0 {
            return;
        }
        node_to_big(&self.orig_l, 0, l_slot - 1, self.bn, 0);
    }

    /// Copy the untouched right flank of the original parent behind the
    /// staged data.
    fn combine_cp_right(&mut self) {
        if self.bn.pivot[self.bn.b_end - 1] >= self.orig_r.max {
            return;
        }
        let from = self.orig_r.offset + 1;
        let to = self.orig_r.data_end();
        let at = self.bn.b_end;
        if from <= to {
            node_to_big(&self.orig_r, from, to, self.bn, at);
        }
        self.orig_r.last = self.orig_r.max;
    }

    /// Enough staged data for at least one sufficient node?
    fn sufficient(&self) -> bool {
        self.bn.b_end > self.orig_l.node_type().min_slots()
    }

    fn overflow(&self) -> bool {
        self.bn.b_end >= self.orig_l.node_type().slots()
    }

    fn setup_bnode_for_split(&mut self) {
        self.bn.b_end -= 1;
        self.bn.min = self.orig_l.min;
        self.bn.ty = self.orig_l.node_type();
    }

    /// Distribute the staged data over one, two or three fresh nodes.
    fn to_nodes(
        &mut self,
        mas: &mut Cursor<'t>,
    ) -> (ENode, Option<ENode>, Option<ENode>, usize, usize) {
        let slot_cnt = self.bn.ty.slots();
        let left = new_node(mas, self.bn.ty);
        let mut middle = None;
        let mut right = None;
        let mut mid_split = 0;
        let split;
        if self.bn.b_end < slot_cnt {
            split = self.bn.b_end;
        } else {
            let (s, m) = self.bn.calc_split();
            split = s;
            mid_split = m;
            right = Some(new_node(mas, self.bn.ty));
        }
        if mid_split > 0 {
            middle = Some(new_node(mas, self.bn.ty));
        }
        (left, middle, right, split, mid_split)
    }

    /// Reparent the previous level's replacements to whichever of this
    /// level's nodes now covers them, walking the running slot across
    /// the split (and the rare middle split).
    fn set_split_parents(
        &mut self,
        left: ENode,
        middle: Option<ENode>,
        right: Option<ENode>,
        mut split: usize,
        mid_split: usize,
    ) {
        if self.l.is_none() {
            return;
        }
        let mut l = left;
        let mut r = if middle.is_some() { middle } else { right };
        let mut slot = self.l.offset;

        mid_split_check(&mut l, &mut r, right, slot, &mut split, mid_split);
        set_split_parent(&mut self.l, l, r, &mut slot, split);
        mid_split_check(&mut l, &mut r, right, slot, &mut split, mid_split);
        set_split_parent(&mut self.m, l, r, &mut slot, split);
        mid_split_check(&mut l, &mut r, right, slot, &mut split, mid_split);
        set_split_parent(&mut self.r, l, r, &mut slot, split);
    }

    /// Fill the replacement walkers from the staged data.
    fn cp_to_nodes(
        &mut self,
        left: ENode,
        middle: Option<ENode>,
        right: Option<ENode>,
        mut split: usize,
        mid_split: usize,
    ) {
        self.l.node = left.word();
        self.m.node = middle.map(ENode::word).unwrap_or(NONE);
        self.r.node = right.map(ENode::word).unwrap_or(NONE);

        self.l.min = self.orig_l.min;
        self.l.max = self.bn.pivot[split];
        big_to_node(self.bn, 0, split, &mut self.l);
        self.r.max = self.l.max;

        if middle.is_some() {
            big_to_node(self.bn, 1 + split, mid_split, &mut self.m);
            self.m.min = self.bn.pivot[split].wrapping_add(1);
            self.m.max = self.bn.pivot[mid_split];
            split = mid_split;
        }

        if right.is_some() {
            let b_end = self.bn.b_end;
            big_to_node(self.bn, 1 + split, b_end, &mut self.r);
            self.r.min = self.bn.pivot[split].wrapping_add(1);
            self.r.max = self.bn.pivot[b_end];
        }
    }

    /// The staged data is the whole tree.  Retire everything the
    /// original walkers have not yet consumed on the way to the old
    /// root.
    fn new_root(&mut self, mas: &Cursor<'t>) {
        unsafe { ENode::from_word(self.l.node).deref() }.set_parent_root(self.l.tree.addr());
        if !self.free.contains(self.orig_l.node) && !self.orig_l.on_root_node() {
            loop {
                self.ascend_free();
                self.topiary();
                if self.orig_l.on_root_node() {
                    break;
                }
            }
        }
        if self.orig_l.node != mas.node && self.l.depth > mas.tree.height() {
            self.free.add(mas.node);
        }
    }
}

/// Check whether the running slot passed the middle split and shift the
/// target pair accordingly.
fn mid_split_check(
    l: &mut ENode,
    r: &mut Option<ENode>,
    right: Option<ENode>,
    slot: usize,
    split: &mut usize,
    mid_split: usize,
) {
    if *r == right {
        return;
    }
    if slot < mid_split {
        return;
    }
    *l = r.expect("middle node must exist past the mid split");
    *r = right;
    *split = mid_split;
}

fn root_limits(mas: &Cursor<'_>) -> bool {
    mas.min == 0 && mas.max == usize::MAX
}

/// Rebuild the levels spanned by `[orig_l, orig_r]` from the staged
/// buffer upward for at most `count` levels (extended while sibling or
/// cousin rebalancing keeps feeding data in), then splice the finished
/// subtree and retire everything it replaced.
pub(crate) fn spanning_rebalance<'t>(
    mas: &mut Cursor<'t>,
    orig_l: Cursor<'t>,
    orig_r: Cursor<'t>,
    bn: &mut BigNode,
    mut count: usize,
    guard: &Guard,
) -> usize {
    let mut mast = SubtreeState::new(mas, bn);
    mast.orig_l = orig_l;
    mast.orig_r = orig_r;
    debug_assert_eq!(mast.orig_l.depth, mast.orig_r.depth);
    mast.orig_l.depth = 0;

    let mut left = None;
    let mut middle = None;
    let mut right = None;
    let mut grew_root = false;

    mast.topiary();
    while count > 0 {
        count -= 1;
        mast.setup_bnode_for_split();
        let (l, m, r, split, mid_split) = mast.to_nodes(mas);
        mast.set_split_parents(l, m, r, split, mid_split);
        mast.cp_to_nodes(l, m, r, split, mid_split);
        left = Some(l);
        middle = m;
        right = r;

        // The next level's staging starts from scratch with these
        // replacements as its children.
        let child_ty = l.ty();
        mast.bn.reset(child_ty);
        mast.orig_l.depth += 1;

        if root_limits(&mast.l) {
            grew_root = true;
            break;
        }

        mast.ascend_free();
        mast.combine_cp_left();
        mast.l.offset = mast.bn.b_end;
        let alloc_tree = mas.tree.is_alloc();
        append_entry(mast.bn, &mast.l, alloc_tree);
        append_entry(mast.bn, &mast.m, alloc_tree);
        append_entry(mast.bn, &mast.r, alloc_tree);
        mast.combine_cp_right();
        mast.topiary();
        mast.orig_l.last = mast.orig_l.max;

        if mast.sufficient() {
            continue;
        }
        if mast.overflow() {
            continue;
        }

        // The remaining data may become a new, shorter root.
        if root_limits(&mast.orig_l) {
            break;
        }

        if !mast.sibling_rebalance() && !mast.cousin_rebalance_right() {
            break;
        }

        // Rebalancing pulled in more data; it needs another pass.
        if count == 0 {
            count = 1;
        }
    }

    if !grew_root {
        // One node holds the final level.
        let ty = mast.orig_l.node_type();
        let ancestor = new_node(mas, ty);
        mast.l.node = ancestor.word();
        mast.orig_l.depth += 1;
        let slots = mast.bn.ty.slots();
        big_to_node(mast.bn, 0, slots - 1, &mut mast.l);
        let mut slot = 0;
        if let Some(left) = left {
            unsafe { left.deref() }.set_parent(ancestor, slot);
        }
        if let Some(middle) = middle {
            slot += 1;
            unsafe { middle.deref() }.set_parent(ancestor, slot);
        }
        if let Some(right) = right {
            slot += 1;
            unsafe { right.deref() }.set_parent(ancestor, slot);
        }
    }

    if root_limits(&mast.l) {
        mast.new_root(mas);
    } else {
        let l = ENode::from_word(mast.l.node);
        let orig = mast.orig_l.enode();
        unsafe { l.deref() }.set_parent_word(unsafe { orig.deref() }.parent_word());
    }

    if !mast.free.contains(mast.orig_l.node) {
        mast.free.add(mast.orig_l.node);
    }

    mast.orig_l.copy_state_from(&mast.l);
    mas.depth = mast.orig_l.depth;
    mas.copy_state_from(&mast.orig_l);
    publish_replace(mas, &mut mast.free, Some(&mut mast.destroy), guard);
    mast.bn.b_end
}

/// A store whose range escapes the node that contains its start.  Build
/// the post-image of every spanned level and splice it in.
pub(crate) fn spanning_store(mas: &mut Cursor<'_>, entry: usize, guard: &Guard) -> usize {
    // Leaf splits propagate up; rebalancing may add two nodes per level
    // on each side plus a new root.
    let node_cnt = if mas.full_cnt > 0 {
        mas.full_cnt as usize
    } else {
        mas.cnt_positive()
    };
    mas.node_request(node_cnt + 1 + mas.tree.height() * 2);
    if mas.is_err() {
        return 0;
    }

    let (mut rmin, mut rmax) = (0, 0);

    // Right walker descends to the leaf just past the end of the range.
    let mut r_mas = mas.snapshot();
    if r_mas.last != usize::MAX {
        r_mas.last += 1;
    }
    r_mas.index = r_mas.last;
    r_mas.offset = 0;
    r_mas.walk_descend(&mut rmin, &mut rmax);
    r_mas.last = mas.last;
    r_mas.index = mas.last;

    // Left walker descends to the leaf holding the start.
    let mut l_mas = mas.snapshot();
    l_mas.offset = 0;
    l_mas.walk_descend(&mut rmin, &mut rmax);

    debug_assert_eq!(l_mas.depth, r_mas.depth);

    if entry == 0 {
        extend_null_pair(&mut l_mas, &mut r_mas);
        mas.index = l_mas.index;
        mas.last = r_mas.last;
        l_mas.last = r_mas.last;
        r_mas.index = r_mas.last;
        mas.offset = l_mas.offset;
    }

    let mut bn = BigNode::new(mas.node_type());
    bn.b_end = store_to_big(&l_mas, &mut bn, entry);
    let r_off = r_mas.offset;
    let r_end = r_mas.data_end();
    let at = bn.b_end + 1;
    if r_off <= r_end {
        node_to_big(&r_mas, r_off, r_end, &mut bn, at);
    } else {
        bn.b_end = at;
    }

    // Stop spanning searches by searching for just the start.
    l_mas.index = mas.index;
    l_mas.last = mas.index;

    let count = mas.cnt_positive() + mas.tree.height().saturating_sub(mas.depth) + 1;
    spanning_rebalance(mas, l_mas, r_mas, &mut bn, count, guard)
}
