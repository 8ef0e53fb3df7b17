//! The write pipeline.
//!
//! A store walks to the leaf owning `index`, stages the post-image of
//! that leaf in a [`BigNode`], and commits it through one of five paths:
//! append in place, rewrite in place (non-RCU trees only), replace the
//! node, split upward, or rebalance with a sibling.  Writes whose range
//! crosses leaves are handed to the spanning machinery instead.
//!
//! Readers are never locked out.  Every committed path ends in a single
//! release-ordered pointer store that swaps the new node (or subtree)
//! into the parent, after which the replaced nodes are marked dead and
//! handed to the epoch layer for reclamation after the grace period.

use crossbeam_epoch::Guard;

use crate::bignode::{big_to_node, node_to_big, store_to_big, BigNode};
use crate::cache;
use crate::cursor::Cursor;
use crate::error::Error;
use crate::gap;
use crate::node::{mk_root, root_is_node, safe_root, ENode, NodeType, Topiary};
use crate::spanning::{self, SubtreeState};

/// Store `entry` over `[mas.index, mas.last]`.  Returns the prior
/// contents of the slot that contained `index`, when the write went
/// through a leaf.  Errors ride the cursor.
pub(crate) fn store_entry(
    mas: &mut Cursor<'_>,
    entry: usize,
    overwrite: bool,
    guard: &Guard,
) -> Option<usize> {
    let started = mas.start();
    if started.is_some() || mas.is_none() || mas.is_ptr() {
        let handled = store_root(mas, entry, overwrite);
        if mas.is_err() || handled {
            return None;
        }
    }

    let (mut r_min, mut r_max) = (0, 0);
    if !wr_walk(mas, &mut r_min, &mut r_max, entry) && mas.span_node == 0 {
        return None;
    }

    if mas.span_node != 0 {
        // A spanning write always overwrites at least a boundary.
        if !overwrite {
            mas.set_err(Error::Occupied);
            return None;
        }
        spanning::spanning_store(mas, entry, guard);
        return None;
    }

    // At the leaf that needs to change.
    let slot_cnt = mas.node_type().slots();
    let content = mas.slot_word(mas.offset);
    if !overwrite && (mas.last > r_max || content != 0) {
        mas.set_err(Error::Occupied);
        return Some(content).filter(|c| *c != 0);
    }

    if entry == 0 {
        extend_null_single(mas);
    }

    let mut b = BigNode::new(mas.node_type());
    b.b_end = store_to_big(mas, &mut b, entry);
    b.min = mas.min;

    let end = mas.data_end();
    if b.can_append(mas, slot_cnt, end) {
        // Overwrite the tail in place, highest slot first so a racing
        // reader sees the value before the pivot that exposes it.
        let stop = end.saturating_sub(1);
        for s in (stop..=b.b_end).rev() {
            mas.set_node_slot(s, b.slot[s]);
            if s < slot_cnt - 1 {
                mas.set_node_pivot(s, b.pivot[s]);
            }
        }
        gap::update_gap(mas);
        return Some(content).filter(|c| *c != 0);
    }

    if b.b_end >= slot_cnt && end < slot_cnt {
        mas.cnt_full();
    } else if b.b_end < mas.node_type().min_slots() {
        mas.cnt_empty();
    }

    commit_big(mas, &mut b, end, guard);
    Some(content).filter(|c| *c != 0)
}

/// Walk for a write.  Classifies each internal node on the way down as
/// full, almost-empty or comfortable, and detects ranges that span the
/// current node.
fn wr_walk(mas: &mut Cursor<'_>, range_min: &mut usize, range_max: &mut usize, entry: usize) -> bool {
    mas.span_node = 0;
    mas.full_cnt = 0;
    mas.depth = 0;

    loop {
        let ty = mas.node_type();
        mas.depth += 1;

        let end = mas.data_end();
        if !mas.node_walk(ty, range_min, range_max) {
            return false;
        }

        if is_span_wr(mas, *range_max, entry) {
            return ty.is_leaf();
        }

        if ty.is_leaf() {
            return true;
        }

        if end <= ty.min_slots() {
            mas.cnt_empty();
        } else if end >= ty.slots() - 1 {
            mas.cnt_full();
        } else {
            mas.full_cnt = 0;
        }

        let next = mas.slot_word(mas.offset);
        mas.max = *range_max;
        mas.min = *range_min;
        if next == 0 {
            return false;
        }
        mas.node = next;
        mas.offset = 0;
    }
}

/// Does the write escape the slot found at this level?  Absent stores
/// that merely touch the end of a slot also span, so adjacent absent
/// ranges can coalesce across nodes.
fn is_span_wr(mas: &mut Cursor<'_>, piv: usize, entry: usize) -> bool {
    if mas.span_node != 0 {
        return true;
    }
    if piv > mas.last {
        return false;
    }
    // Writing up to the top of the keyspace is not spanning as long as
    // the range fits in the node.
    if mas.last == usize::MAX && mas.min <= mas.index && mas.last == mas.max {
        return false;
    }
    if !mas.node_type().is_leaf() {
        if entry != 0 && piv == mas.last {
            return false;
        }
    } else {
        if mas.last < mas.max {
            return false;
        }
        if entry != 0 && mas.last == mas.max {
            return false;
        }
    }
    mas.span_node = mas.node;
    true
}

/// Grow an absent store over the absent slots on either side of it so
/// consecutive absent ranges stay coalesced.  Single-node form.
pub(crate) fn extend_null_single(mas: &mut Cursor<'_>) {
    let l_slot = mas.offset;
    let r_slot = l_slot;
    let content = mas.slot_word(l_slot);
    let range_max = mas.safe_pivot(r_slot);
    let range_min = mas.lower_bound(l_slot);

    if content == 0 {
        mas.index = range_min;
    }
    if mas.index == range_min && l_slot > 0 && mas.slot_word(l_slot - 1) == 0 {
        mas.index = if l_slot > 1 {
            mas.safe_pivot(l_slot - 2).wrapping_add(1)
        } else {
            mas.min
        };
        mas.offset = l_slot - 1;
    }

    if mas.slot_word(r_slot) == 0 && mas.last < range_max {
        mas.last = range_max;
    }
    if mas.last == range_max
        && mas.last < mas.max
        && r_slot + 1 < mas.node_type().slots()
        && mas.slot_word(r_slot + 1) == 0
    {
        mas.last = mas.safe_pivot(r_slot + 1);
    }
    // A zero pivot past the data means the extension ran onto the
    // implied tail: it reaches the node's bound.
    if r_slot > 0 && mas.last == 0 {
        mas.last = mas.max;
    }
}

/// Two-node form used by spanning writes: the left cursor's start and
/// the right cursor's end both grow over their absent neighbors, and the
/// right cursor's offset is pushed past the slots the extension ate.
pub(crate) fn extend_null_pair(l_mas: &mut Cursor<'_>, r_mas: &mut Cursor<'_>) {
    let l_slot = l_mas.offset;
    let r_slot = r_mas.offset;
    let mut cp_r_slot = r_slot;
    let content = l_mas.slot_word(l_slot);
    let range_max = r_mas.safe_pivot(r_slot);
    let range_min = l_mas.lower_bound(l_slot);

    if content == 0 {
        l_mas.index = range_min;
    }
    if l_mas.index == range_min && l_slot > 0 && l_mas.slot_word(l_slot - 1) == 0 {
        l_mas.index = if l_slot > 1 {
            l_mas.safe_pivot(l_slot - 2).wrapping_add(1)
        } else {
            l_mas.min
        };
        l_mas.offset = l_slot - 1;
    }

    // The right walker parks past the slot array when the range runs to
    // the end of its node; there is nothing to extend over then.
    let r_slots = r_mas.node_type().slots();
    if r_slot < r_slots && r_mas.slot_word(r_slot) == 0 {
        if r_mas.last < range_max {
            r_mas.last = range_max;
        }
        cp_r_slot += 1;
    }
    if r_mas.last == range_max
        && r_mas.last < r_mas.max
        && r_slot + 1 < r_slots
        && r_mas.slot_word(r_slot + 1) == 0
    {
        r_mas.last = r_mas.safe_pivot(r_slot + 1);
        cp_r_slot += 1;
    }
    if r_slot > 0 && r_mas.last == 0 {
        r_mas.last = r_mas.max;
    }
    r_mas.offset = cp_r_slot;
}

/// Stores that hit an empty tree or the single-entry root.  Returns
/// whether the store was completed here.
fn store_root(mas: &mut Cursor<'_>, entry: usize, overwrite: bool) -> bool {
    let root = mas.tree.root_word();
    if root_is_node(root) {
        return false;
    }

    if root != 0 && mas.last == 0 && !overwrite {
        mas.set_err(Error::Occupied);
        return false;
    }

    if mas.last != 0 || entry & 0x3 == 0x2 {
        root_expand(mas, entry);
    } else {
        // A plain value at [0, 0] lives directly in the root word.
        mas.tree.publish_root(entry);
    }
    true
}

/// Expand the root word into a one-leaf tree holding the old root value
/// (if any) and the new entry.
pub(crate) fn root_expand(mas: &mut Cursor<'_>, entry: usize) {
    let root = mas.tree.root_word();
    let contents = if root_is_node(root) { 0 } else { root };

    mas.node_request(1);
    if mas.is_err() {
        return;
    }

    let ty = NodeType::Leaf64;
    let enode = ENode::new(mas.next_alloc().as_ptr(), ty);
    let node = unsafe { enode.deref() };
    node.set_parent_root(mas.tree.addr());
    mas.node = enode.word();

    let mut slot = 0;
    if contents != 0 {
        node.set_slot(ty, slot, contents);
        slot += 1;
    }
    if mas.index == 0 && slot != 0 {
        // Overwriting the old root value in place.
        slot -= 1;
    } else if mas.index > 1 {
        // Leave an absent slot covering [old end + 1, index - 1].
        node.set_pivot(ty, slot, mas.index - 1);
        slot += 1;
    }
    node.set_slot(ty, slot, entry);
    node.set_pivot(ty, slot, mas.last);

    mas.tree.publish_root(mk_root(enode));
    mas.depth = 1;
    mas.set_height();
}

/// Commit a staged post-image that did not qualify for the append path.
pub(crate) fn commit_big(
    mas: &mut Cursor<'_>,
    b: &mut BigNode,
    end: usize,
    guard: &Guard,
) -> usize {
    let ty = mas.node_type();

    if b.b_end < ty.min_slots() && !mas.on_root_node() && mas.tree.height() > 1 {
        return rebalance(mas, b, guard);
    }

    if b.b_end >= ty.slots() {
        if mas.is_err() {
            return 0;
        }
        return split(mas, b, guard);
    }

    if reuse_node(mas, b, end) {
        gap::update_gap(mas);
        return 2;
    }

    mas.node_request(1);
    if mas.is_err() {
        return 0;
    }
    let new = ENode::new(mas.next_alloc().as_ptr(), ty);
    unsafe { new.deref() }.set_parent_word(unsafe { mas.enode().deref() }.parent_word());
    mas.node = new.word();
    big_to_node(b, 0, b.b_end, mas);
    replace_node(mas, false, guard);
    gap::update_gap(mas);
    2
}

/// Rewrite the current node in place.  Legal only when no reader can be
/// inside it, which the tree's RCU mode rules out.
fn reuse_node(mas: &mut Cursor<'_>, b: &BigNode, end: usize) -> bool {
    if mas.tree.in_rcu() {
        return false;
    }
    big_to_node(b, 0, b.b_end, mas);
    if end > b.b_end {
        let ty = mas.node_type();
        for i in (b.b_end + 1)..ty.slots() {
            mas.set_node_slot(i, 0);
            if i < ty.pivots() {
                mas.set_node_pivot(i, 0);
            }
        }
    }
    true
}

/// Swap the cursor's (new) node into the place the old one occupies, by
/// root word or parent slot.  With `advanced` the caller owns adoption
/// and reclamation of the old node; otherwise both happen here.
pub(crate) fn replace_node(mas: &mut Cursor<'_>, advanced: bool, guard: &Guard) {
    let enode = mas.enode();
    let node = unsafe { enode.deref() };

    let prev;
    let mut parent = None;
    if node.is_root() {
        prev = safe_root(mas.tree.root_word());
    } else {
        let p = mas.parent_enode(enode);
        let slot = node.parent_slot();
        prev = unsafe { p.deref() }.slot(p.ty(), slot);
        parent = Some((p, slot));
    }

    if ENode::from_word(prev).addr() == enode.addr() {
        return;
    }

    if !advanced && !enode.is_leaf() {
        adopt_children(enode);
    }

    if node.is_root() {
        node.set_parent_root(mas.tree.addr());
        mas.tree.publish_root(mk_root(enode));
        mas.set_height();
    } else {
        let (p, slot) = parent.unwrap();
        unsafe { p.deref() }.set_slot(p.ty(), slot, enode.word());
    }

    if !advanced {
        let old = ENode::from_word(prev);
        unsafe { old.deref() }.set_dead();
        defer_release(old, guard);
    }
}

/// Point the children of `parent` back at it with their slot encoded.
/// Split and merge re-home subtrees whose children still name the old
/// parent; this pass restores the back-references before any reader can
/// need them for ascent.
pub(crate) fn adopt_children(parent: ENode) {
    let ty = parent.ty();
    let node = unsafe { parent.deref() };
    for slot in 0..ty.slots() {
        if slot != 0 && slot < ty.slots() - 1 && node.pivot(ty, slot) == 0 {
            break;
        }
        let child = node.slot(ty, slot);
        if child != 0 {
            unsafe { ENode::from_word(child).deref() }.set_parent(parent, slot);
        }
    }
}

/// Walk a freshly published subtree and adopt every child whose parent
/// back-reference is stale.  The frontier is at most three nodes wide:
/// only the nodes along the left spine, the right spine and the middle
/// replacement can contain children that need fixing.
pub(crate) fn descend_adopt(mas: &Cursor<'_>) {
    let mut list = [mas.snapshot(), mas.snapshot(), mas.snapshot()];
    let mut next = [mas.snapshot(), mas.snapshot(), mas.snapshot()];
    for state in list.iter_mut() {
        state.offset = 0;
    }
    for state in next.iter_mut() {
        state.offset = 0;
        state.node = crate::node::NONE;
    }
    next[0].copy_state_from(&list[0]);

    while !list[0].is_none() && !ENode::from_word(list[0].node).is_leaf() {
        let mut n = 0;
        for i in 0..3 {
            if list[i].is_none() {
                continue;
            }
            if i > 0 && list[i - 1].node == list[i].node {
                continue;
            }
            while n < 3 {
                if !new_child(&mut list[i], &mut next[n]) {
                    break;
                }
                n += 1;
            }
            adopt_children(ENode::from_word(list[i].node));
        }
        while n < 3 {
            next[n].node = crate::node::NONE;
            n += 1;
        }
        for i in 0..3 {
            next[i].offset = 0;
            list[i].copy_state_from(&next[i]);
        }
    }
}

/// Find the next child of `mas`'s node (from the current offset on)
/// whose parent back-reference already names this node, and descend
/// `child` into it.  Those children are the new nodes whose own children
/// may still need adoption.
fn new_child<'t>(mas: &mut Cursor<'t>, child: &mut Cursor<'t>) -> bool {
    let end = mas.node_type().slots();
    for slot in mas.offset..end {
        let entry = mas.slot_word(slot);
        if entry == 0 {
            break;
        }
        let entry_node = ENode::from_word(entry);
        if unsafe { entry_node.deref() }.parent_node() as usize == mas.enode().addr() {
            mas.offset = slot;
            child.copy_state_from(mas);
            mas.offset = slot + 1;
            child.descend();
            return true;
        }
    }
    false
}

/// Publish a prepared replacement and reap everything it displaced:
/// splice with a release store, adopt stale children, then mark the
/// displaced nodes dead and hand them to the epoch layer.
pub(crate) fn publish_replace(
    mas: &mut Cursor<'_>,
    free: &mut Topiary,
    destroy: Option<&mut Topiary>,
    guard: &Guard,
) {
    replace_node(mas, true, guard);

    if !mas.enode().is_leaf() {
        descend_adopt(mas);
    }

    reap(free, guard);
    if let Some(destroy) = destroy {
        reap_recursive(destroy, guard);
    }

    if mas.enode().is_leaf() {
        return;
    }
    gap::update_gap(mas);
}

/// Mark every listed node dead and schedule its block for reuse after
/// the grace period.
pub(crate) fn reap(topiary: &mut Topiary, guard: &Guard) {
    for enode in topiary.drain() {
        unsafe { enode.deref() }.set_dead();
        defer_release(enode, guard);
    }
}

/// Like [`reap`], but each listed node roots a subtree that dies whole.
pub(crate) fn reap_recursive(topiary: &mut Topiary, guard: &Guard) {
    for enode in topiary.drain() {
        unsafe { enode.deref() }.set_dead();
        let word = enode.word();
        unsafe {
            guard.defer_unchecked(move || destroy_subtree(word));
        }
    }
}

fn defer_release(enode: ENode, guard: &Guard) {
    let addr = enode.addr();
    unsafe {
        guard.defer_unchecked(move || cache::release(addr));
    }
}

/// Free a subtree into the node cache.  Called either after a grace
/// period or from owned teardown, so nothing can be reading it.
pub(crate) fn destroy_subtree(word: usize) {
    let enode = ENode::from_word(word);
    let ty = enode.ty();
    if !ty.is_leaf() {
        let node = unsafe { enode.deref() };
        for slot in 0..ty.slots() {
            let child = node.slot(ty, slot);
            if child == 0 {
                break;
            }
            destroy_subtree(child);
        }
    }
    cache::release(enode.addr());
}

// --- split ---

/// Split the staged image upward until every level fits, then publish.
fn split(mas: &mut Cursor<'_>, b: &mut BigNode, guard: &Guard) -> usize {
    mas.node_request(1 + mas.cnt_positive() * 2);
    if mas.is_err() {
        return 0;
    }

    let mut mast = SubtreeState::new(mas, b);
    mas.depth = mas.tree.height();

    let full_cnt = mas.full_cnt.max(0) as usize;
    let mut height = 0;
    while height <= full_cnt {
        height += 1;
        if split_final_node(&mut mast, mas, height) {
            break;
        }

        mast.l.copy_state_from(mas);
        mast.r.copy_state_from(mas);
        mast.l.node = new_node(mas, mast.bn.ty).word();
        mast.r.node = new_node(mas, mast.bn.ty).word();

        if push_data(mas, height, &mut mast, true) {
            break;
        }
        if push_data(mas, height, &mut mast, false) {
            break;
        }

        let (split, _mid) = mast.bn.calc_split();
        debug_assert_eq!(_mid, 0, "single-leaf staging cannot need a middle node");
        split_data(&mut mast, mas, split);
        // split_data trims r's max to the last copied pivot; the right
        // node keeps the original upper bound.
        mast.r.max = mas.max;
        split_fill_bnode(&mut mast, mas, 1);
        mast.orig_l.copy_state_from(&mast.l);
        mast.orig_r.copy_state_from(&mast.r);
    }

    mast.free.add(mas.node);
    mas.node = mast.l.node;
    publish_replace(mas, &mut mast.free, None, guard);
    1
}

pub(crate) fn new_node(mas: &mut Cursor<'_>, ty: NodeType) -> ENode {
    ENode::new(mas.next_alloc().as_ptr(), ty)
}

/// One node suffices at this level: build the final ancestor, reparent
/// the split pair under it, and stop climbing.
fn split_final_node_inner(mast: &mut SubtreeState<'_, '_>, mas: &mut Cursor<'_>, height: usize) -> bool {
    if mas.on_root_node() {
        mast.bn.ty = if mas.tree.is_alloc() {
            NodeType::ARange64
        } else {
            NodeType::Range64
        };
        mas.depth = height;
    }
    let ancestor = new_node(mas, mast.bn.ty);
    unsafe {
        ENode::from_word(mast.l.node)
            .deref()
            .set_parent(ancestor, mast.l.offset);
        ENode::from_word(mast.r.node)
            .deref()
            .set_parent(ancestor, mast.r.offset);
        ancestor
            .deref()
            .set_parent_word(mas.enode().deref().parent_word());
    }
    mast.l.node = ancestor.word();
    let bn = &*mast.bn;
    big_to_node(bn, 0, bn.ty.slots() - 1, &mut mast.l);
    true
}

fn split_final_node(mast: &mut SubtreeState<'_, '_>, mas: &mut Cursor<'_>, height: usize) -> bool {
    if height <= mas.full_cnt.max(0) as usize {
        return false;
    }
    split_final_node_inner(mast, mas, height)
}

/// Stage the parent's post-image: its untouched slots around the split
/// child, with the left and right replacements in the child's place.
/// Ascends `mas` to the parent.  `skip` is how many original child slots
/// the replacements consume.
fn split_fill_bnode(mast: &mut SubtreeState<'_, '_>, mas: &mut Cursor<'_>, skip: usize) {
    let mut cp = true;
    let old = mas.node;

    mast.bn.reset(mast.bn.ty);
    if mas.on_root_node() {
        cp = false;
    } else {
        mas.ascend();
        mast.free.add(old);
        mas.offset = unsafe { mas.enode().deref() }.parent_slot();
    }

    mast.bn.min = mas.min;
    if cp && mast.l.offset > 0 {
        node_to_big(mas, 0, mast.l.offset - 1, mast.bn, 0);
    }

    let split = mast.bn.b_end;
    append_entry(mast.bn, &mast.l, mas.tree.is_alloc());
    mast.r.offset = mast.bn.b_end;
    append_entry(mast.bn, &mast.r, mas.tree.is_alloc());
    if cp {
        node_to_big(
            mas,
            split + skip,
            mas.node_type().slots() - 1,
            mast.bn,
            mast.bn.b_end,
        );
    }
    mast.bn.b_end -= 1;
    mast.bn.ty = mas.node_type();
}

/// Append a replacement node (tracked by `state`) to the staging buffer
/// with its upper bound as the pivot and its recomputed gap.
pub(crate) fn append_entry(b: &mut BigNode, state: &Cursor<'_>, alloc_tree: bool) {
    if state.is_none() || state.node == 0 {
        return;
    }
    b.slot[b.b_end] = state.node;
    if alloc_tree {
        b.gap[b.b_end] = gap::find_gap(state);
    }
    b.pivot[b.b_end] = state.max;
    b.b_end += 1;
}

/// Distribute the staged image across the left and right replacements
/// and fix the split parents of the original cursors.
pub(crate) fn split_data(mast: &mut SubtreeState<'_, '_>, mas: &mut Cursor<'_>, split: usize) {
    big_to_node(mast.bn, 0, split, &mut mast.l);
    let r = ENode::from_word(mast.r.node);
    unsafe { r.deref() }.set_pivot(r.ty(), 0, mast.r.max);
    let r_end = mast.bn.b_end;
    big_to_node(mast.bn, split + 1, r_end, &mut mast.r);
    mast.l.offset = unsafe { mas.enode().deref() }.parent_slot();
    mast.l.max = mast.bn.pivot[split];
    mast.r.min = mast.l.max.wrapping_add(1);

    if !mas.enode().is_leaf() {
        let mut p_slot = mast.orig_l.offset;
        let l = ENode::from_word(mast.l.node);
        let r = ENode::from_word(mast.r.node);
        set_split_parent(&mut mast.orig_l, l, Some(r), &mut p_slot, split);
        set_split_parent(&mut mast.orig_r, l, Some(r), &mut p_slot, split);
    }
}

/// Reparent `state`'s node to whichever side of the split it landed on.
pub(crate) fn set_split_parent(
    state: &mut Cursor<'_>,
    left: ENode,
    right: Option<ENode>,
    slot: &mut usize,
    split: usize,
) {
    if state.is_none() {
        return;
    }
    if *slot <= split {
        unsafe { ENode::from_word(state.node).deref() }.set_parent(left, *slot);
    } else if let Some(right) = right {
        unsafe { ENode::from_word(state.node).deref() }.set_parent(right, *slot - split - 1);
    }
    *slot += 1;
}

/// Instead of splitting, try to push the overflow into a sibling with
/// slack.  When it fits, the sibling and the original are rebuilt as a
/// pair and the shared parent absorbs the change, ending the climb.
fn push_data<'t>(
    mas: &mut Cursor<'t>,
    height: usize,
    mast: &mut SubtreeState<'_, 't>,
    left: bool,
) -> bool {
    let mut tmp = mast.l.snapshot();
    tmp.copy_state_from(&mast.l);
    tmp.node = mas.node;

    if left && !tmp.prev_sibling() {
        return false;
    }
    if !left && !tmp.next_sibling() {
        return false;
    }

    let end = tmp.data_end();
    let slot_total = mast.bn.b_end + end;
    let mut space = 2 * mas.node_type().slots() - 1;
    // One under the limit so a later store cannot force a triple split.
    if mast.bn.ty.is_leaf() {
        space -= 1;
    }
    if mas.max == usize::MAX {
        space -= 1;
    }
    if slot_total >= space {
        return false;
    }

    mast.bn.b_end += 1;
    if left {
        mast.bn.shift_right(end + 1);
        node_to_big(&tmp, 0, end, mast.bn, 0);
        mast.bn.b_end = slot_total + 1;
    } else {
        node_to_big(&tmp, 0, end, mast.bn, mast.bn.b_end);
    }

    let mut split = mast.bn.ty.slots() - 1;
    if left {
        mast.free.add(mas.node);
        mas.copy_state_from(&tmp);
        tmp.node = mast.l.node;
        mast.l.copy_state_from(&tmp);
    } else {
        mast.free.add(tmp.node);
        tmp.node = mast.r.node;
        mast.r.copy_state_from(&tmp);
        split = slot_total - split;
    }
    split = mast.bn.no_null_split(split, mast.bn.ty.slots());
    if left {
        mast.orig_l.offset += end + 1;
    }

    split_data(mast, mas, split);
    split_fill_bnode(mast, mas, 2);
    split_final_node_inner(mast, mas, height + 1);
    true
}

// --- rebalance ---

/// A deficient post-image: pull data across from a sibling (previous
/// first, then next) and rebuild the pair; the spanning machinery
/// carries the change upward until every level is sufficient.
fn rebalance(mas: &mut Cursor<'_>, b: &mut BigNode, guard: &Guard) -> usize {
    let empty_cnt = mas.cnt_positive();
    mas.node_request(1 + empty_cnt * 2);
    if mas.is_err() {
        return 0;
    }

    b.b_end += 1;
    let b_end = b.b_end;

    let mut l_mas = mas.snapshot();
    let mut r_mas = mas.snapshot();

    if l_mas.prev_sibling() {
        let shift = l_mas.data_end() + 1;
        b.shift_right(shift);
        node_to_big(&l_mas, 0, shift - 1, b, 0);
        b.b_end = shift + b_end;
        l_mas.index = l_mas.min;
        l_mas.last = l_mas.min;
    } else if r_mas.next_sibling() {
        let end = r_mas.data_end();
        node_to_big(&r_mas, 0, end, b, b_end);
        r_mas.index = r_mas.max;
        r_mas.last = r_mas.max;
    }
    // With no sibling at all this is the root's only child and the
    // staged data already holds the whole level.

    spanning::spanning_rebalance(mas, l_mas, r_mas, b, empty_cnt, guard)
}

#[cfg(test)]
mod tests {
    use crate::{MapleTree, TreeFlags};

    fn v(n: usize) -> usize {
        0x10000 + n
    }

    #[test]
    fn single_store_and_load() {
        let tree = MapleTree::new();
        tree.store_range(0, 0, v(1)).unwrap();
        assert_eq!(tree.load(0), Some(v(1)));
        assert_eq!(tree.load(1), None);
    }

    #[test]
    fn overlapping_ranges_truncate() {
        let tree = MapleTree::new();
        tree.store_range(10, 20, v(1)).unwrap();
        tree.store_range(15, 25, v(2)).unwrap();
        assert_eq!(tree.load(9), None);
        for i in 10..15 {
            assert_eq!(tree.load(i), Some(v(1)), "index {i}");
        }
        for i in 15..=25 {
            assert_eq!(tree.load(i), Some(v(2)), "index {i}");
        }
        assert_eq!(tree.load(26), None);
    }

    #[test]
    fn range_store_covers_every_index() {
        let tree = MapleTree::new();
        tree.store_range(5, 500, v(7)).unwrap();
        for i in [5, 6, 100, 499, 500] {
            assert_eq!(tree.load(i), Some(v(7)));
        }
        assert_eq!(tree.load(4), None);
        assert_eq!(tree.load(501), None);
    }

    #[test]
    fn leaf_split_keeps_all_entries() {
        let tree = MapleTree::new();
        // Fill well past one leaf's worth of singleton ranges.
        for i in 0..100usize {
            tree.store_range(i * 10, i * 10 + 5, v(i)).unwrap();
        }
        assert!(tree.height() >= 2);
        for i in 0..100usize {
            assert_eq!(tree.load(i * 10), Some(v(i)), "start of range {i}");
            assert_eq!(tree.load(i * 10 + 5), Some(v(i)), "end of range {i}");
            assert_eq!(tree.load(i * 10 + 6), None, "gap after range {i}");
        }
    }

    #[test]
    fn middle_insert_splits() {
        let tree = MapleTree::new();
        for i in 0..16usize {
            tree.store_range(i * 2, i * 2, v(i)).unwrap();
        }
        // One more in the middle forces a split of the full leaf.
        tree.store_range(15, 15, v(99)).unwrap();
        assert_eq!(tree.load(15), Some(v(99)));
        for i in 0..16usize {
            assert_eq!(tree.load(i * 2), Some(v(i)));
        }
    }

    #[test]
    fn store_null_erases_and_coalesces() {
        let tree = MapleTree::new();
        tree.store_range(0, 9, v(1)).unwrap();
        tree.store_range(10, 19, v(2)).unwrap();
        tree.store_range(20, 29, v(3)).unwrap();
        tree.store_range(10, 19, 0).unwrap();
        assert_eq!(tree.load(9), Some(v(1)));
        assert_eq!(tree.load(10), None);
        assert_eq!(tree.load(19), None);
        assert_eq!(tree.load(20), Some(v(3)));
    }

    #[test]
    fn insert_refuses_occupied() {
        let tree = MapleTree::new();
        tree.insert_range(10, 20, v(1)).unwrap();
        assert_eq!(
            tree.insert_range(15, 16, v(2)),
            Err(crate::Error::Occupied)
        );
        assert_eq!(tree.load(15), Some(v(1)));
        tree.insert_range(21, 30, v(3)).unwrap();
        assert_eq!(tree.load(21), Some(v(3)));
    }

    #[test]
    fn descending_fill() {
        let tree = MapleTree::new();
        for i in (0..200usize).rev() {
            tree.store(i * 3, v(i)).unwrap();
        }
        for i in 0..200usize {
            assert_eq!(tree.load(i * 3), Some(v(i)), "index {}", i * 3);
            assert_eq!(tree.load(i * 3 + 1), None);
        }
    }

    #[test]
    fn random_overwrites_match_model() {
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(0x6d61706c65);
        let tree = MapleTree::new();
        let mut model = vec![0usize; 2048];
        for _ in 0..600 {
            let first = rng.gen_range(0..2000);
            let last = first + rng.gen_range(0..40);
            let val = if rng.gen_bool(0.2) { 0 } else { v(rng.gen_range(1..1000)) };
            tree.store_range(first, last, val).unwrap();
            for slot in model.iter_mut().take(last + 1).skip(first) {
                *slot = val;
            }
        }
        for (i, want) in model.iter().enumerate() {
            let got = tree.load(i).unwrap_or(0);
            assert_eq!(got, *want, "index {i}");
        }
    }

    #[test]
    fn alloc_tree_random_store() {
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(0xa11c);
        let tree = MapleTree::with_flags(TreeFlags::ALLOC);
        let mut model = vec![0usize; 1024];
        for _ in 0..400 {
            let first = rng.gen_range(0..1000);
            let last = first + rng.gen_range(0..24);
            let val = if rng.gen_bool(0.3) { 0 } else { v(rng.gen_range(1..1000)) };
            tree.store_range(first, last, val).unwrap();
            for slot in model.iter_mut().take(last + 1).skip(first) {
                *slot = val;
            }
        }
        for (i, want) in model.iter().enumerate() {
            let got = tree.load(i).unwrap_or(0);
            assert_eq!(got, *want, "index {i}");
        }
    }

    #[test]
    fn store_at_keyspace_top() {
        let tree = MapleTree::new();
        tree.store_range(usize::MAX - 10, usize::MAX, v(1)).unwrap();
        assert_eq!(tree.load(usize::MAX), Some(v(1)));
        assert_eq!(tree.load(usize::MAX - 10), Some(v(1)));
        assert_eq!(tree.load(usize::MAX - 11), None);
    }

    #[test]
    fn rebalance_steals_from_previous_sibling_first() {
        use crate::cursor::Cursor;

        let tree = MapleTree::new();
        for i in 0..200usize {
            tree.store(i, v(i)).unwrap();
        }
        assert!(tree.height() >= 2);

        // Find a leaf with same-parent siblings on both sides.
        let mut picked = None;
        let mut idx = 0usize;
        while idx < 200 {
            let mut mas = Cursor::new(&tree, idx, idx);
            let (mut rmin, mut rmax) = (0, 0);
            assert!(mas.range_walk(&mut rmin, &mut rmax));
            let p_slot = unsafe { mas.enode().deref() }.parent_slot();
            let mut parent = mas.snapshot();
            parent.ascend();
            if p_slot >= 1 && p_slot < parent.data_end() {
                picked = Some((mas.min, mas.max));
                break;
            }
            if mas.max >= 199 {
                break;
            }
            idx = mas.max + 1;
        }
        let (first, last) = picked.expect("no leaf with two siblings");

        // Collapsing the whole leaf to one entry leaves it deficient,
        // with slack available on both sides.
        tree.store_range(first, last, v(999)).unwrap();

        // The previous sibling donates: the rebuilt leaf starts before
        // the old boundary and still ends exactly at it.
        let mut mas = Cursor::new(&tree, last, last);
        let (mut rmin, mut rmax) = (0, 0);
        assert!(mas.range_walk(&mut rmin, &mut rmax));
        assert!(mas.min < first, "previous sibling should have donated");
        assert_eq!(mas.max, last, "next sibling must be untouched");

        assert_eq!(tree.load(last), Some(v(999)));
        for i in 0..200usize {
            if !(first..=last).contains(&i) {
                assert_eq!(tree.load(i), Some(v(i)), "index {i}");
            }
        }
    }

    #[test]
    fn nomem_retries_with_blocking_refill() {
        let _hold = crate::cache::budget_lock();
        crate::cache::set_budget(Some(0));
        let tree = MapleTree::new();
        // Every node now comes from the blocking path of the retry loop.
        for i in 0..64usize {
            tree.store(i * 2, v(i)).unwrap();
        }
        crate::cache::set_budget(None);
        for i in 0..64usize {
            assert_eq!(tree.load(i * 2), Some(v(i)));
        }
    }
}
