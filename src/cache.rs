//! Process-wide node cache.
//!
//! All trees draw their 256-byte node blocks from one pool.  Returned
//! blocks are held on a free list and recycled, which keeps the hot write
//! paths off the global allocator; the list is capped so an erase-heavy
//! burst does not pin memory forever.
//!
//! The pool also carries the crate's out-of-memory test hook: a countdown
//! of permitted non-blocking allocations.  When armed, non-blocking
//! requests beyond the budget fail exactly like exhausted reclaim would,
//! which is what drives a writer into its blocking retry loop.

use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::node::Node;

const FREE_LIST_CAP: usize = 256;
const UNLIMITED: usize = usize::MAX;

static FREE: Mutex<Vec<usize>> = Mutex::new(Vec::new());
static BUDGET: AtomicUsize = AtomicUsize::new(UNLIMITED);

/// Hand out one zeroed node.  Non-blocking requests honor the armed
/// budget; blocking requests always succeed.
pub(crate) fn alloc(blocking: bool) -> Option<NonNull<Node>> {
    if !blocking {
        let mut budget = BUDGET.load(Ordering::Relaxed);
        loop {
            if budget == UNLIMITED {
                break;
            }
            if budget == 0 {
                return None;
            }
            match BUDGET.compare_exchange_weak(
                budget,
                budget - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => budget = cur,
            }
        }
    }

    if let Some(addr) = FREE.lock().pop() {
        let node = addr as *mut Node;
        unsafe { (*node).wipe() };
        return NonNull::new(node);
    }
    // A zeroed block is a valid empty node.
    let node: Box<Node> = unsafe { Box::new(mem::zeroed()) };
    NonNull::new(Box::into_raw(node))
}

/// Blocking hand-out; never fails.
pub(crate) fn alloc_blocking() -> NonNull<Node> {
    alloc(true).expect("blocking node allocation cannot fail")
}

/// Return one node to the pool.  Safe to call from a deferred epoch
/// callback: by then no reader can hold a pointer into the block.
pub(crate) fn release(addr: usize) {
    let node = addr as *mut Node;
    debug_assert!(!node.is_null());
    let mut free = FREE.lock();
    if free.len() < FREE_LIST_CAP {
        free.push(addr);
    } else {
        drop(free);
        unsafe { drop(Box::from_raw(node)) };
    }
}

/// Arm (or with `None`, disarm) the non-blocking allocation budget.
/// Tests that touch the budget must hold [`budget_lock`], since the
/// budget is process-global.
#[cfg(test)]
pub(crate) fn set_budget(limit: Option<usize>) {
    BUDGET.store(limit.unwrap_or(UNLIMITED), Ordering::Relaxed);
}

#[cfg(test)]
pub(crate) fn budget_lock() -> parking_lot::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_blocks() {
        let a = alloc(true).unwrap();
        let addr = a.as_ptr() as usize;
        unsafe { a.as_ref() }.set_dead();
        release(addr);
        // The next hand-out may reuse the block, and if it does it must
        // come back wiped.
        let b = alloc(true).unwrap();
        assert!(!unsafe { b.as_ref() }.is_dead());
        release(b.as_ptr() as usize);
    }

    #[test]
    fn budget_gates_nonblocking_only() {
        let _hold = budget_lock();
        set_budget(Some(0));
        assert!(alloc(false).is_none());
        let b = alloc(true);
        assert!(b.is_some());
        set_budget(None);
        release(b.unwrap().as_ptr() as usize);
    }
}
