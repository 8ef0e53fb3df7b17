//! Gap tracking and gap-aware search (allocation-mode trees).
//!
//! Every internal slot of an allocation tree carries the size of the
//! largest absent sub-range inside its subtree.  Writes that change a
//! node's best gap push the new value upward, stopping at the first
//! ancestor whose own maximum does not change.  The forward and reverse
//! area searches exploit the index to skip whole subtrees that cannot
//! hold a fit.

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::node::{NodeType, NODE_SLOTS};

/// Largest absent sub-range in the cursor's leaf.
pub(crate) fn leaf_max_gap(mas: &Cursor<'_>) -> usize {
    let ty = mas.node_type();
    if ty == NodeType::Dense {
        let mut max_gap = 0;
        let mut gap = 0;
        for i in 0..ty.slots() {
            if mas.slot_word(i) != 0 {
                max_gap = max_gap.max(gap);
                gap = 0;
            } else {
                gap += 1;
            }
        }
        return max_gap.max(gap);
    }

    let mut max_gap = 0;
    let mut pstart = mas.min;
    for i in 0..ty.slots() {
        let mut pend = mas.safe_pivot(i);
        if pend == 0 && i > 0 {
            pend = mas.max;
        }
        let gap = pend.wrapping_sub(pstart).wrapping_add(1);
        if mas.slot_word(i) == 0 && gap > max_gap {
            max_gap = gap;
        }
        if pend >= mas.max {
            break;
        }
        pstart = pend + 1;
    }
    max_gap
}

/// Largest gap recorded in an internal node's slots.
fn node_max_gap(mas: &Cursor<'_>) -> usize {
    let ty = mas.node_type();
    let mut max_gap = 0;
    for i in 0..ty.slots() {
        let gap = mas.gap_at(i);
        if gap > max_gap {
            max_gap = gap;
        }
    }
    max_gap
}

pub(crate) fn find_gap(mas: &Cursor<'_>) -> usize {
    if mas.enode().is_leaf() {
        leaf_max_gap(mas)
    } else {
        node_max_gap(mas)
    }
}

/// Push a changed slot gap upward.  Each ancestor re-derives its own
/// maximum; the climb stops as soon as that maximum is unchanged.
fn parent_gap(mas: &Cursor<'_>, mut slot: usize, mut new: usize) {
    let mut gaps = mas.snapshot();
    loop {
        gaps.ascend();
        let old_max = node_max_gap(&gaps);
        let enode = gaps.enode();
        unsafe { enode.deref() }.set_gap(enode.ty(), slot, new);
        new = node_max_gap(&gaps);
        if new == old_max {
            return;
        }
        if gaps.on_root_node() {
            return;
        }
        slot = unsafe { gaps.enode().deref() }.parent_slot();
    }
}

/// Recompute the cursor's node's best gap and propagate it if the
/// parent's record is stale.
pub(crate) fn update_gap(mas: &Cursor<'_>) {
    if !mas.tree.is_alloc() {
        return;
    }
    if mas.on_root_node() {
        return;
    }
    let max_gap = find_gap(mas);
    let node = unsafe { mas.enode().deref() };
    let pslot = node.parent_slot();
    let parent = mas.parent_enode(mas.enode());
    let p_gap = unsafe { parent.deref() }.gap(parent.ty(), pslot);
    if p_gap != max_gap {
        parent_gap(mas, pslot, max_gap);
    }
}

// --- forward search ---

/// One step of the lowest-fit walk: scan the current node left to
/// right, descending into the first subtree whose recorded gap can hold
/// `size`.  At a leaf, an absent slot fits if its overlap with the
/// search window is at least `size` wide.
fn awalk_step(mas: &mut Cursor<'_>, size: usize) -> bool {
    let ty = mas.node_type();
    if ty == NodeType::Dense {
        mas.offset = mas.index - mas.min;
        return true;
    }

    let pivot_cnt = ty.pivots();
    let mut slot = if ty == NodeType::Leaf64 { 0 } else { mas.offset };
    let mut min = mas.lower_bound(slot);
    let mut gap = 0usize;
    let mut found = false;
    let mut descended = false;

    while slot <= pivot_cnt {
        let mut pivot = mas.safe_pivot_typed(slot, ty);
        let mut tail = false;
        if slot > 0 && pivot == 0 {
            // Data ended early; in a leaf the remainder up to the node's
            // bound is one implied absent slot.
            if !ty.is_leaf() || min.wrapping_sub(1) >= mas.max {
                break;
            }
            pivot = mas.max;
            tail = true;
        }
        if mas.index <= pivot {
            if ty.is_leaf() {
                gap = 0;
                if mas.slot_word(slot) == 0 {
                    gap = pivot
                        .min(mas.last)
                        .wrapping_sub(mas.index.max(min))
                        .wrapping_add(1);
                }
            } else {
                gap = mas.gap_at(slot);
            }
        }
        if gap >= size {
            if ty.is_leaf() {
                found = true;
                break;
            }
            if mas.index <= pivot {
                mas.node = mas.slot_word(slot);
                mas.min = min;
                mas.max = pivot;
                slot = 0;
                descended = true;
                break;
            }
        }
        if tail {
            break;
        }
        min = pivot.wrapping_add(1);
        if mas.last < min {
            mas.set_err(Error::NoFit);
            return true;
        }
        slot += 1;
    }

    if !descended && mas.on_root_node() {
        if !found {
            mas.set_err(Error::NoFit);
        }
        found = true;
    }
    mas.offset = slot;
    found
}

/// Skip the subtree the cursor is stuck in and resume with the next
/// slot of the nearest ancestor that still has one.
fn skip_node(mas: &mut Cursor<'_>) -> bool {
    let mut slot;
    loop {
        if mas.on_root_node() {
            slot = mas.offset;
            if slot > mas.node_type().slots() - 1 {
                mas.set_err(Error::NoFit);
                return false;
            }
        } else {
            slot = unsafe { mas.enode().deref() }.parent_slot();
            mas.ascend();
        }
        if slot <= mas.node_type().slots() - 1 {
            break;
        }
    }
    slot += 1;
    mas.offset = slot;
    mas.min = mas.safe_pivot(slot - 1).wrapping_add(1);
    if slot < mas.node_type().pivots() {
        mas.max = mas.safe_pivot(slot);
    }
    true
}

/// Lowest-fit walk from the root.  Ends with the cursor on the leaf
/// slot holding the fit, or carrying `NoFit`.
pub(crate) fn awalk(mas: &mut Cursor<'_>, size: usize) {
    mas.start();
    if mas.is_none() || mas.is_ptr() {
        return;
    }
    let mut last = 0usize;
    while !mas.is_err() && !awalk_step(mas, size) {
        if last == mas.node {
            if !skip_node(mas) {
                return;
            }
        } else {
            last = mas.node;
        }
    }
}

// --- reverse search ---

/// One step of the highest-fit walk: scan right to left.
fn rev_awalk_step(mas: &mut Cursor<'_>, size: usize) -> bool {
    let ty = mas.node_type();
    if ty == NodeType::Dense {
        mas.offset = mas.index - mas.min;
        return true;
    }

    let mut slot = mas.offset;
    let mut max = mas.safe_pivot_typed(slot, ty);
    if slot > 0 && max == 0 {
        // Starting on the implied trailing absent slot.
        max = mas.max;
    }
    let mut found = false;
    let mut hit = false;

    let mut min;
    loop {
        min = mas.lower_bound(slot);
        let mut skip = false;

        if mas.last < min {
            // The window ends below this slot.
            skip = true;
        } else if mas.index > max {
            // The window starts above this slot; nothing lower can fit.
            mas.set_err(Error::NoFit);
            return false;
        } else if ty.is_leaf() {
            if mas.slot_word(slot) != 0 {
                skip = true;
            } else {
                let usable = max
                    .min(mas.last)
                    .wrapping_sub(min.max(mas.index))
                    .wrapping_add(1);
                if usable < size {
                    skip = true;
                } else {
                    mas.min = min;
                    mas.max = max;
                    found = true;
                    hit = true;
                }
            }
        } else {
            let gap = mas.gap_at(slot);
            if size > mas.last.wrapping_sub(min).wrapping_add(1) || size > gap {
                skip = true;
            } else {
                hit = true;
            }
        }

        if hit {
            break;
        }
        debug_assert!(skip);
        if slot == 0 {
            // Nothing in this node; hand back to the caller to rewind.
            if mas.on_root_node() {
                mas.set_err(Error::NoFit);
            }
            mas.offset = slot;
            return false;
        }
        max = min.wrapping_sub(1);
        slot -= 1;
    }

    if !ty.is_leaf() {
        // Descend into the candidate subtree, starting at its last slot.
        let next = mas.slot_word(slot);
        mas.min = min;
        mas.max = max;
        if next == 0 {
            if mas.on_root_node() {
                mas.set_err(Error::NoFit);
            }
            mas.offset = slot;
            return false;
        }
        mas.node = next;
        slot = rev_start_slot(mas);
    }

    mas.offset = slot;
    found
}

/// The slot a reverse scan starts from: the last live slot, or the
/// implied absent slot after it when the data ends short of the bound.
fn rev_start_slot(mas: &Cursor<'_>) -> usize {
    let ty = mas.node_type();
    let (end, last_piv) = mas.data_end_typed(ty);
    if ty.is_leaf() && last_piv < mas.max && end + 1 < ty.slots() {
        end + 1
    } else {
        end
    }
}

/// Back out of an exhausted subtree during the reverse walk.
fn rewind_node(mas: &mut Cursor<'_>) -> bool {
    let mut slot;
    loop {
        if mas.on_root_node() {
            slot = mas.offset;
            if slot == 0 {
                mas.set_err(Error::NoFit);
                return false;
            }
        } else {
            slot = unsafe { mas.enode().deref() }.parent_slot();
            mas.ascend();
        }
        if slot != 0 {
            break;
        }
    }
    mas.offset = slot - 1;
    true
}

/// Highest-fit walk from the root.
pub(crate) fn rev_awalk(mas: &mut Cursor<'_>, size: usize) {
    mas.start();
    if mas.is_none() {
        mas.offset = NODE_SLOTS;
        return;
    }
    if mas.is_ptr() || mas.is_err() {
        return;
    }
    mas.offset = rev_start_slot(mas);

    let mut last = 0usize;
    while !mas.is_err() && !rev_awalk_step(mas, size) {
        if last == mas.node {
            if !rewind_node(mas) {
                return;
            }
        } else {
            last = mas.node;
        }
    }
}

/// Turn a forward hit into the allocated range `[index, index+size-1]`.
fn set_fwd_index(mas: &mut Cursor<'_>, size: usize) {
    let slot = mas.offset;
    let min = if slot > 0 {
        mas.safe_pivot(slot - 1).wrapping_add(1)
    } else {
        mas.min
    };
    mas.min = min;
    mas.max = mas.safe_pivot(slot);
    if mas.index < min {
        mas.index = min;
    }
    mas.last = mas.index + size - 1;
}

/// Turn a reverse hit into the allocated range, trimmed to the window.
fn set_rev_index(mas: &mut Cursor<'_>, size: usize) {
    let gap_max = mas.max.min(mas.last);
    mas.last = gap_max;
    mas.index = gap_max - (size - 1);
}

/// An empty or single-entry tree: the fit is computed directly.
fn empty_or_single(
    mas: &mut Cursor<'_>,
    min: usize,
    max: usize,
    size: usize,
    fwd: bool,
) -> Result<()> {
    let mut start = 0usize;
    if !mas.is_none() {
        // The root value occupies [0, 0].
        start = 1;
    }
    if start < min {
        start = min;
    }
    if max.wrapping_sub(start).wrapping_add(1) < size || start > max {
        return Err(Error::NoFit);
    }
    if fwd {
        mas.index = start;
        mas.last = start + size - 1;
    } else {
        mas.last = max;
        mas.index = max - (size - 1);
        if mas.index < start {
            return Err(Error::NoFit);
        }
    }
    Ok(())
}

/// Find an absent range of `size` indices whose endpoints both lie in
/// `[min, max]`: the lowest such range going forward, the highest in
/// reverse.  On success the cursor's `[index, last]` is the range.
pub(crate) fn empty_area(
    mas: &mut Cursor<'_>,
    min: usize,
    max: usize,
    size: usize,
    fwd: bool,
) -> Result<()> {
    mas.start();
    if mas.is_none() || mas.is_ptr() {
        return empty_or_single(mas, min, max, size, fwd);
    }

    mas.index = min;
    mas.last = max;
    if fwd {
        awalk(mas, size);
    } else {
        rev_awalk(mas, size);
    }

    if let Some(err) = mas.error() {
        return Err(err);
    }
    if mas.offset >= NODE_SLOTS {
        return Err(Error::NoFit);
    }
    if fwd {
        set_fwd_index(mas, size);
    } else {
        set_rev_index(mas, size);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MapleTree, TreeFlags};

    #[test]
    fn leaf_gap_spans_between_ranges() {
        let tree = MapleTree::with_flags(TreeFlags::ALLOC);
        tree.store_range(0, 9, 0x1001).unwrap();
        tree.store_range(20, 29, 0x1005).unwrap();
        tree.store_range(50, 59, 0x1009).unwrap();

        let mut mas = Cursor::new(&tree, 25, 25);
        let (mut rmin, mut rmax) = (0, 0);
        assert!(mas.range_walk(&mut rmin, &mut rmax));
        // Gaps are [10,19], [30,49] and [60, MAX]; the open tail wins.
        assert_eq!(leaf_max_gap(&mas), usize::MAX - 60 + 1);
    }

    #[test]
    fn empty_area_on_empty_tree() {
        let tree = MapleTree::with_flags(TreeFlags::ALLOC);
        let mut mas = Cursor::new(&tree, 0, 0);
        empty_area(&mut mas, 5, 100, 10, true).unwrap();
        assert_eq!(mas.index, 5);
        assert_eq!(mas.last, 14);

        let mut mas = Cursor::new(&tree, 0, 0);
        empty_area(&mut mas, 5, 100, 10, false).unwrap();
        assert_eq!(mas.index, 91);
        assert_eq!(mas.last, 100);

        let mut mas = Cursor::new(&tree, 0, 0);
        assert_eq!(empty_area(&mut mas, 5, 9, 10, true), Err(Error::NoFit));
    }
}
