//! Node blocks and the encoded references between them.
//!
//! A node is one 256-byte, 128-byte-aligned block: a tagged parent word
//! followed by 31 data words.  The node's variant decides how the data
//! words are carved into pivots, slots and (for allocation trees) gaps.
//! References between nodes are whole machine words carrying the target
//! address plus the variant tag in the low bits, so a reader can recover
//! the layout of a node from nothing but the pointer it just loaded.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Error;

/// Data words per node; also the slot count of a dense node.
pub(crate) const NODE_SLOTS: usize = 31;
/// Slot count of the 64-bit range variants (leaf and internal).
pub(crate) const RANGE64_SLOTS: usize = 16;
pub(crate) const RANGE64_PIVOTS: usize = RANGE64_SLOTS - 1;
/// Slot count of the allocation-range variant (gap-carrying internal).
pub(crate) const ARANGE64_SLOTS: usize = 10;
pub(crate) const ARANGE64_PIVOTS: usize = ARANGE64_SLOTS - 1;

pub(crate) const NODE_ALIGN: usize = 128;
const ADDR_MASK: usize = !(NODE_ALIGN - 1);

const TYPE_SHIFT: u32 = 3;
const TYPE_MASK: usize = 0xf;
/// Set on every encoded node pointer.
const NODE_BIT: usize = 0x4;
/// Set on the tree's root word when it holds a node rather than a value.
const ROOT_BIT: usize = 0x2;

/// Parent-word bit 0: the "parent" is the tree handle itself.
const PARENT_ROOT: usize = 0x1;
const PARENT_TYPE_MASK: usize = 0x7f;

/// Node layout discriminator, recoverable from an encoded pointer.
///
/// The numeric values leave room for the narrower historical variants so
/// the tag stays compatible with the parent-word family encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum NodeType {
    /// One value per index, pivots implied by position.  Leaf only;
    /// reserved, no write path currently materializes one.
    Dense = 0,
    /// Leaf with 64-bit pivots.
    Leaf64 = 9,
    /// Internal with 64-bit pivots.
    Range64 = 12,
    /// Internal with 64-bit pivots plus per-slot gap metadata.
    ARange64 = 13,
}

impl NodeType {
    pub(crate) fn from_bits(bits: usize) -> NodeType {
        match bits {
            0 => NodeType::Dense,
            9 => NodeType::Leaf64,
            12 => NodeType::Range64,
            13 => NodeType::ARange64,
            _ => unreachable!("unknown node type bits {bits}"),
        }
    }

    pub(crate) fn is_leaf(self) -> bool {
        matches!(self, NodeType::Dense | NodeType::Leaf64)
    }

    pub(crate) fn slots(self) -> usize {
        match self {
            NodeType::Dense => NODE_SLOTS,
            NodeType::Leaf64 | NodeType::Range64 => RANGE64_SLOTS,
            NodeType::ARange64 => ARANGE64_SLOTS,
        }
    }

    pub(crate) fn pivots(self) -> usize {
        match self {
            NodeType::Dense => 0,
            NodeType::Leaf64 | NodeType::Range64 => RANGE64_PIVOTS,
            NodeType::ARange64 => ARANGE64_PIVOTS,
        }
    }

    /// Minimum live slots for a non-root node.  The 64-bit range variants
    /// run two under half so a 3-into-2 merge always stays legal; the
    /// allocation variant runs one under half.
    pub(crate) fn min_slots(self) -> usize {
        match self {
            NodeType::Dense => NODE_SLOTS / 2,
            NodeType::Leaf64 | NodeType::Range64 => RANGE64_SLOTS / 2 - 2,
            NodeType::ARange64 => ARANGE64_SLOTS / 2 - 1,
        }
    }

    /// Base of the slot words inside the data-word array.
    fn slot_base(self) -> usize {
        match self {
            NodeType::Dense => 0,
            NodeType::Leaf64 | NodeType::Range64 => RANGE64_PIVOTS,
            NodeType::ARange64 => ARANGE64_PIVOTS,
        }
    }

    /// Base of the gap words; allocation variant only.
    fn gap_base(self) -> usize {
        debug_assert_eq!(self, NodeType::ARange64);
        ARANGE64_PIVOTS + ARANGE64_SLOTS
    }
}

/// One tree node.  Contents are immutable once visible to readers except
/// for the append-on-end path and the parent word, which doubles as the
/// dead marker: a node whose parent word names its own address has been
/// unpublished and any reader standing on it must restart from the root.
#[repr(C, align(128))]
pub(crate) struct Node {
    parent: AtomicUsize,
    words: [AtomicUsize; NODE_SLOTS],
}

impl Node {
    pub(crate) fn pivot(&self, ty: NodeType, i: usize) -> usize {
        debug_assert!(i < ty.pivots());
        self.words[i].load(Ordering::Relaxed)
    }

    pub(crate) fn set_pivot(&self, ty: NodeType, i: usize, val: usize) {
        debug_assert!(i < ty.pivots());
        self.words[i].store(val, Ordering::Relaxed)
    }

    pub(crate) fn slot(&self, ty: NodeType, i: usize) -> usize {
        debug_assert!(i < ty.slots());
        self.words[ty.slot_base() + i].load(Ordering::Acquire)
    }

    /// Publication-ordered slot store: everything written to the stored
    /// node before this call is visible to a reader that loads the slot.
    pub(crate) fn set_slot(&self, ty: NodeType, i: usize, val: usize) {
        debug_assert!(i < ty.slots());
        self.words[ty.slot_base() + i].store(val, Ordering::Release)
    }

    pub(crate) fn gap(&self, ty: NodeType, i: usize) -> usize {
        match ty {
            NodeType::ARange64 => self.words[ty.gap_base() + i].load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub(crate) fn set_gap(&self, ty: NodeType, i: usize, val: usize) {
        if ty == NodeType::ARange64 {
            self.words[ty.gap_base() + i].store(val, Ordering::Relaxed);
        }
    }

    pub(crate) fn addr(&self) -> usize {
        self as *const Node as usize
    }

    pub(crate) fn is_root(&self) -> bool {
        self.parent.load(Ordering::Relaxed) & PARENT_ROOT != 0
    }

    /// Make this node the root: its parent word names the tree handle.
    pub(crate) fn set_parent_root(&self, tree_addr: usize) {
        self.parent.store(tree_addr | PARENT_ROOT, Ordering::Relaxed);
    }

    /// Record the parent and the slot this node occupies inside it.
    ///
    /// Bit 0 is the root marker, bits 1-2 encode the parent's variant
    /// family, and the slot lands in bits 3-6 for the 64-bit families
    /// (bits 2-6 were reserved for the narrower 16-bit family).  The
    /// packing is load-bearing: ascent recovers the parent's variant and
    /// this node's slot from a single word.
    pub(crate) fn set_parent(&self, parent: ENode, slot: usize) {
        let (family, shift) = match parent.ty() {
            NodeType::Range64 | NodeType::ARange64 => (0x6, 3),
            ty => unreachable!("{ty:?} node cannot be a parent"),
        };
        let val = parent.addr() | (slot << shift) | family;
        self.parent.store(val, Ordering::Relaxed);
    }

    pub(crate) fn parent_word(&self) -> usize {
        self.parent.load(Ordering::Relaxed)
    }

    pub(crate) fn parent_slot(&self) -> usize {
        let val = self.parent.load(Ordering::Relaxed);
        if val & PARENT_ROOT != 0 {
            return 0;
        }
        let shift = if val & 0x2 == 0 { 2 } else { 3 };
        (val & 0x7c) >> shift
    }

    pub(crate) fn parent_node(&self) -> *mut Node {
        (self.parent.load(Ordering::Relaxed) & !PARENT_TYPE_MASK) as *mut Node
    }

    pub(crate) fn set_parent_word(&self, word: usize) {
        self.parent.store(word, Ordering::Relaxed);
    }

    /// Unpublish marker.  Ordered after the store that made the
    /// replacement reachable: a reader that observes the marker with its
    /// paired `Acquire` load is guaranteed to find the new subtree when
    /// it restarts from the root.
    pub(crate) fn set_dead(&self) {
        self.parent.store(self.addr(), Ordering::Release);
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.parent.load(Ordering::Acquire) == self.addr()
    }

    /// Reset to the freshly-allocated state for cache reuse.
    pub(crate) fn wipe(&self) {
        self.parent.store(0, Ordering::Relaxed);
        for w in &self.words {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Duplicate another node's data words (not its parent word).
    pub(crate) fn copy_words_from(&self, src: &Node) {
        for (dst, src) in self.words.iter().zip(src.words.iter()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }
}

/// An encoded node pointer: address plus variant tag in the low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ENode(usize);

impl ENode {
    pub(crate) fn new(node: *const Node, ty: NodeType) -> ENode {
        let addr = node as usize;
        debug_assert_eq!(addr & !ADDR_MASK, 0);
        ENode(addr | ((ty as usize) << TYPE_SHIFT) | NODE_BIT)
    }

    pub(crate) fn from_word(word: usize) -> ENode {
        debug_assert!(word & ADDR_MASK != 0, "sentinel is not a node: {word:#x}");
        ENode(word)
    }

    pub(crate) fn word(self) -> usize {
        self.0
    }

    pub(crate) fn ty(self) -> NodeType {
        NodeType::from_bits((self.0 >> TYPE_SHIFT) & TYPE_MASK)
    }

    pub(crate) fn is_leaf(self) -> bool {
        self.ty().is_leaf()
    }

    pub(crate) fn addr(self) -> usize {
        self.0 & ADDR_MASK
    }

    pub(crate) fn as_ptr(self) -> *mut Node {
        self.addr() as *mut Node
    }

    /// # Safety
    ///
    /// The node must still be protected: either the caller holds the
    /// writer lock, or it loaded this pointer inside an epoch guard.
    pub(crate) unsafe fn deref<'a>(self) -> &'a Node {
        &*self.as_ptr()
    }
}

/// Tag an encoded node for storage in the tree's root word.
pub(crate) fn mk_root(enode: ENode) -> usize {
    enode.word() | ROOT_BIT
}

/// Strip the root tag.
pub(crate) fn safe_root(word: usize) -> usize {
    word & !ROOT_BIT
}

/// Does the root word hold a node (as opposed to a direct value)?
pub(crate) fn root_is_node(word: usize) -> bool {
    word & 0x3 == ROOT_BIT && word > 4096
}

/// Values with the bottom two bits `10` below 4096 are reserved for
/// internal sentinels and may never be stored by callers.
pub(crate) fn is_reserved(entry: usize) -> bool {
    entry & 0x3 == 0x2 && entry < 4096
}

/// Walker sentinel: the tree has not been searched yet.
pub(crate) const START: usize = 0x1;
/// Walker sentinel: the entry lives directly in the root word.
pub(crate) const ROOT: usize = 0x5;
/// Walker sentinel: the search found no node.
pub(crate) const NONE: usize = 0x9;

pub(crate) fn mk_err(err: Error) -> usize {
    (err.code() << 2) | 0x2
}

pub(crate) fn err_of(word: usize) -> Option<Error> {
    if word & 0x3 == 0x2 && word < 4096 {
        Some(Error::from_code(word >> 2))
    } else {
        None
    }
}

/// The ordered list of nodes a write unpublished.  Nothing in the list is
/// marked dead or reclaimed until the replacement subtree has been
/// published; `reap` then marks each node and hands it to the epoch
/// layer.  Keeping the list off to the side (rather than threading it
/// through the dead nodes themselves) leaves every unpublished node fully
/// intact for readers that are still standing on it.
pub(crate) struct Topiary {
    nodes: Vec<ENode>,
}

impl Topiary {
    pub(crate) fn new() -> Topiary {
        Topiary { nodes: Vec::new() }
    }

    pub(crate) fn add(&mut self, word: usize) {
        let enode = ENode::from_word(word);
        if !self.contains(word) {
            self.nodes.push(enode);
        }
    }

    pub(crate) fn contains(&self, word: usize) -> bool {
        let addr = word & ADDR_MASK;
        self.nodes.iter().any(|n| n.addr() == addr)
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = ENode> + '_ {
        self.nodes.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache;

    #[test]
    fn layout() {
        assert_eq!(std::mem::size_of::<Node>(), 256);
        assert_eq!(std::mem::align_of::<Node>(), 128);
    }

    #[test]
    fn constants() {
        assert_eq!(NodeType::Leaf64.slots(), 16);
        assert_eq!(NodeType::Leaf64.pivots(), 15);
        assert_eq!(NodeType::Leaf64.min_slots(), 6);
        assert_eq!(NodeType::ARange64.slots(), 10);
        assert_eq!(NodeType::ARange64.pivots(), 9);
        assert_eq!(NodeType::ARange64.min_slots(), 4);
        assert_eq!(NodeType::Dense.pivots(), 0);
        assert!(NodeType::Dense.is_leaf());
        assert!(!NodeType::ARange64.is_leaf());
    }

    #[test]
    fn encode_roundtrip() {
        let node = cache::alloc(true).unwrap();
        for ty in [NodeType::Leaf64, NodeType::Range64, NodeType::ARange64] {
            let enode = ENode::new(node.as_ptr(), ty);
            assert_eq!(enode.ty(), ty);
            assert_eq!(enode.as_ptr(), node.as_ptr());
            let root = mk_root(enode);
            assert!(root_is_node(root));
            assert_eq!(safe_root(root), enode.word());
        }
        cache::release(node.as_ptr() as usize);
    }

    #[test]
    fn parent_roundtrip() {
        let parent = cache::alloc(true).unwrap();
        let child = cache::alloc(true).unwrap();
        let p_enode = ENode::new(parent.as_ptr(), NodeType::Range64);
        let c = unsafe { child.as_ref() };
        for slot in 0..RANGE64_SLOTS {
            c.set_parent(p_enode, slot);
            assert_eq!(c.parent_slot(), slot);
            assert_eq!(c.parent_node(), parent.as_ptr());
            assert!(!c.is_root());
            assert!(!c.is_dead());
        }
        c.set_dead();
        assert!(c.is_dead());
        cache::release(parent.as_ptr() as usize);
        cache::release(child.as_ptr() as usize);
    }

    #[test]
    fn reserved_values() {
        assert!(is_reserved(2));
        assert!(is_reserved(6));
        assert!(is_reserved(4094));
        assert!(!is_reserved(0));
        assert!(!is_reserved(1));
        assert!(!is_reserved(4));
        assert!(!is_reserved(4098));
    }

    #[test]
    fn sentinels_are_reserved_patterns() {
        assert!(err_of(mk_err(Error::NoMemory)) == Some(Error::NoMemory));
        assert!(err_of(mk_err(Error::Occupied)) == Some(Error::Occupied));
        assert!(err_of(START).is_none());
        assert!(err_of(ROOT).is_none());
        assert!(err_of(NONE).is_none());
    }
}
