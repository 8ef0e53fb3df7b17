//! The staging buffer for writes.
//!
//! A write never edits a published node in place (outside the append fast
//! path).  Instead the post-image is assembled here, in a buffer wide
//! enough to hold two full nodes plus the inserted entry, and then
//! chopped into one, two or, rarely, three replacement nodes.  The buffer
//! lives on the writer's stack; it is never heap-allocated.

use crate::cursor::Cursor;
use crate::node::{NodeType, RANGE64_SLOTS};

pub(crate) const BIG_SLOTS: usize = RANGE64_SLOTS * 2 + 2;

pub(crate) struct BigNode {
    pub(crate) slot: [usize; BIG_SLOTS],
    pub(crate) pivot: [usize; BIG_SLOTS - 1],
    pub(crate) gap: [usize; BIG_SLOTS],
    /// Fill mark.  The copy helpers leave the count of staged entries
    /// here; the store and split paths work with the index of the last
    /// staged entry instead, exactly one less.
    pub(crate) b_end: usize,
    pub(crate) min: usize,
    pub(crate) ty: NodeType,
}

impl BigNode {
    pub(crate) fn new(ty: NodeType) -> BigNode {
        BigNode {
            slot: [0; BIG_SLOTS],
            pivot: [0; BIG_SLOTS - 1],
            gap: [0; BIG_SLOTS],
            b_end: 0,
            min: 0,
            ty,
        }
    }

    pub(crate) fn reset(&mut self, ty: NodeType) {
        *self = BigNode::new(ty);
    }

    /// Make room at the front for a left sibling's contents.
    pub(crate) fn shift_right(&mut self, shift: usize) {
        let n = self.b_end;
        self.pivot.copy_within(0..n, shift);
        self.slot.copy_within(0..n, shift);
        self.gap.copy_within(0..n, shift);
    }

    /// Would splitting at `split` still leave a side overflowing?  If so
    /// the buffer must be chopped into three nodes instead of two.
    fn middle_node(&self, split: usize, slot_cnt: usize) -> bool {
        if self.b_end >= 2 * slot_cnt {
            return true;
        }
        self.slot[split] == 0 && self.b_end >= 2 * slot_cnt - 1
    }

    /// Nudge a split off an absent slot.  Prefer moving right when the
    /// right side stays sufficient, otherwise move left.
    pub(crate) fn no_null_split(&self, split: usize, slot_cnt: usize) -> usize {
        if self.slot[split] != 0 {
            return split;
        }
        if split < slot_cnt - 1 && self.b_end - split > self.ty.min_slots() {
            split + 1
        } else {
            split - 1
        }
    }

    /// Choose the split point(s) for an overflowing buffer.  Returns
    /// `(split, mid_split)`; `mid_split` is zero unless a third node is
    /// required.  For leaves the left side is kept at least a full node
    /// wide in keyspace, not just in population, unless that would starve
    /// the right side.
    pub(crate) fn calc_split(&self) -> (usize, usize) {
        let slot_cnt = self.ty.slots();
        let mut split = self.b_end / 2;
        let mut mid_split = 0;

        if self.middle_node(split, slot_cnt) {
            split = self.b_end / 3;
            mid_split = split * 2;
        } else {
            while self.pivot[split].wrapping_sub(self.min) < slot_cnt - 1
                && split < slot_cnt - 1
                && self.b_end - split > self.ty.min_slots() - 1
            {
                split += 1;
            }
        }

        split = self.no_null_split(split, slot_cnt);
        if mid_split == 0 {
            return (split, 0);
        }
        (split, self.no_null_split(mid_split, slot_cnt))
    }

    /// May the staged image be committed by overwriting the tail of the
    /// current node in place?  Only when the staged data strictly extends
    /// the node: the insert is the last staged entry (or second last with
    /// a trailing absent slot).
    pub(crate) fn can_append(&self, mas: &Cursor<'_>, slot_cnt: usize, end: usize) -> bool {
        if self.b_end >= slot_cnt {
            return false;
        }
        if self.b_end <= end {
            return false;
        }
        if mas.last == 0 {
            return false;
        }
        if self.pivot[self.b_end] == mas.last {
            return true;
        }
        self.pivot[self.b_end - 1] == mas.last && self.slot[self.b_end] == 0
    }
}

/// Copy slots `[from, to]` of the cursor's node into the buffer starting
/// at `at`.  Leaves the staged count in `b_end`.
pub(crate) fn node_to_big(mas: &Cursor<'_>, from: usize, to: usize, b: &mut BigNode, at: usize) {
    let ty = mas.node_type();
    let carry_gaps = !ty.is_leaf() && mas.tree.is_alloc();
    let mut i = from;
    let mut j = at;
    while i <= to {
        b.slot[j] = mas.slot_word(i);
        if carry_gaps {
            b.gap[j] = mas.gap_at(i);
        }
        if i < ty.pivots() {
            b.pivot[j] = mas.safe_pivot(i);
        } else {
            b.pivot[j] = mas.max;
            j += 1;
            break;
        }
        if (j > 0 && b.pivot[j] == 0) || mas.max == b.pivot[j] {
            // End of the node's data.
            j += 1;
            break;
        }
        i += 1;
        j += 1;
    }
    b.b_end = j;
}

/// Copy buffer entries `[from, to]` into the cursor's node.  The
/// cursor's `max` tracks the last pivot written, which the split paths
/// rely on.
pub(crate) fn big_to_node(b: &BigNode, from: usize, to: usize, mas: &mut Cursor<'_>) {
    let ty = mas.node_type();
    let carry_gaps = !ty.is_leaf() && mas.tree.is_alloc();
    let node = self_node(mas);
    let mut j = 0;
    for i in from..=to {
        if j > 0 && b.pivot[i] == 0 {
            break;
        }
        mas.max = b.pivot[i];
        node.set_slot(ty, j, b.slot[i]);
        if j < ty.pivots() {
            node.set_pivot(ty, j, b.pivot[i]);
        }
        if carry_gaps {
            node.set_gap(ty, j, b.gap[i]);
        }
        j += 1;
    }
}

fn self_node<'a>(mas: &Cursor<'_>) -> &'a crate::node::Node {
    unsafe { mas.enode().deref() }
}

/// Stage the store of `entry` over `[mas.index, mas.last]` merged with
/// the contents of the cursor's leaf.  Emits up to three slots in place
/// of the overlapped ones: a prefix fragment, the entry, and a suffix
/// fragment.  Returns the index of the last staged entry.
pub(crate) fn store_to_big(mas: &Cursor<'_>, b: &mut BigNode, entry: usize) -> usize {
    let slot = mas.offset;
    let end = mas.data_end();
    let contents = mas.slot_word(slot);
    let mut b_end = 0;
    // May wrap below zero; compared only after wrapping back.
    let mut piv = mas.min.wrapping_sub(1);

    // Everything before the insertion point survives unchanged.
    if slot != 0 {
        node_to_big(mas, 0, slot - 1, b, 0);
        b_end = b.b_end;
        piv = b.pivot[b_end - 1];
    }

    // Prefix fragment of the overlapped slot.
    if piv.wrapping_add(1) < mas.index {
        b.slot[b_end] = contents;
        b.pivot[b_end] = mas.index - 1;
        b_end += 1;
    }

    // The entry itself.
    b.slot[b_end] = entry;
    b.pivot[b_end] = mas.last;

    // Suffix fragment of the trailing overlapped slot.
    piv = mas.safe_pivot(slot);
    if piv > mas.last {
        b_end += 1;
        b.slot[b_end] = contents;
        b.pivot[b_end] = piv;
    } else {
        piv = mas.last;
    }

    if piv >= mas.max {
        // The store ran to the end of the node.
        return b_end;
    }

    // Skip over the slots the store swallowed whole.
    let mut slot = slot;
    loop {
        slot += 1;
        piv = mas.safe_pivot(slot);
        if piv > mas.last || slot > end {
            break;
        }
    }

    if piv > mas.last {
        if slot > end {
            b_end += 1;
            b.slot[b_end] = 0;
            b.pivot[b_end] = piv;
        } else {
            b_end += 1;
            node_to_big(mas, slot, end + 1, b, b_end);
            b_end = b.b_end - 1;
        }
    }

    b_end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(ty: NodeType, fill: &[(usize, usize)]) -> BigNode {
        let mut b = BigNode::new(ty);
        for (i, (piv, val)) in fill.iter().enumerate() {
            b.pivot[i] = *piv;
            b.slot[i] = *val;
        }
        b.b_end = fill.len();
        b
    }

    #[test]
    fn split_avoids_absent_slot() {
        // 17 staged entries with an absent slot right at the midpoint.
        let fill: Vec<(usize, usize)> = (0..17)
            .map(|i| (i * 10 + 9, if i == 8 { 0 } else { 0x1001 + i }))
            .collect();
        let mut b = staged(NodeType::Leaf64, &fill);
        b.b_end = 16; // index of last staged entry
        let (split, mid) = b.calc_split();
        assert_eq!(mid, 0);
        assert_ne!(split, 8, "split may not land on an absent slot");
        assert!(b.slot[split] != 0);
        // Both sides must stay legal.
        assert!(split + 1 > NodeType::Leaf64.min_slots());
        assert!(b.b_end - split > NodeType::Leaf64.min_slots() - 1);
    }

    #[test]
    fn wide_buffer_needs_middle_node() {
        let fill: Vec<(usize, usize)> = (0..32).map(|i| (i * 2 + 1, 0x2001 + i)).collect();
        let mut b = staged(NodeType::Leaf64, &fill);
        b.b_end = 32;
        let (split, mid) = b.calc_split();
        assert!(mid > 0);
        assert!(split < mid);
        assert!(mid <= b.b_end);
    }

    #[test]
    fn shift_right_moves_staged_data() {
        let mut b = staged(NodeType::Leaf64, &[(9, 0x11), (19, 0x21)]);
        b.b_end = 2;
        b.shift_right(3);
        assert_eq!(b.pivot[3], 9);
        assert_eq!(b.slot[4], 0x21);
    }
}
