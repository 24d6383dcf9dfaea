//! A striped, lock-free free list layered over a [`DynamicIndexTable`].
//!
//! Pushing is a classic Treiber-stack CAS loop (any number of
//! concurrent pushers). Popping is serialized behind a single mutex —
//! only the thread holding `cursor_lock` may ever pop `first_free`, so
//! ABA is impossible for the popper — spec.md's own design note
//! accepts this as the price of a simple, provably-correct
//! implementation, and it matches the grounding example's
//! ("natatorium" pool) choice of the same tradeoff. When the local
//! stack runs dry a list either claims a fresh leaf-sized stripe from
//! a parent list (if one was given), or bumps its own allocation
//! cursor to materialize fresh slots from the table, then falls back
//! to stealing from a sibling stripe via
//! `Allocator::steal_freelist_element`.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::rwlock::FastRwLock;
use crate::table::{Allocator, DynamicIndexTable, FreeLink, Index, OwnerTag};

/// One stripe of a table's free elements.
pub struct SlotFreeList<'t, A: Allocator> {
    table: &'t DynamicIndexTable<A>,
    owner: OwnerTag,
    /// Treiber-stack head of locally-freed elements. Padded: CAS'd by
    /// every push, so it must not share a cache line with `next_alloc`
    /// below.
    first_free: crossbeam_utils::CachePadded<AtomicPtr<A::Elem>>,
    /// Guards popping `first_free` and bumping/rebasing `next_alloc`.
    /// Used purely as a mutex — this list's own correctness does not
    /// depend on reader fairness, but reusing `FastRwLock` here keeps
    /// the crate's locking primitive uniform instead of introducing a
    /// second one.
    cursor_lock: FastRwLock<()>,
    /// Next never-yet-allocated index this stripe will claim from the
    /// table. Protected by `cursor_lock`.
    next_alloc: crossbeam_utils::CachePadded<AtomicU64>,
    /// Highest index this stripe may claim before it must rebase onto
    /// a fresh stripe (exclusive). `u64::MAX` means "unbounded" — grow
    /// the table on demand. Protected by `cursor_lock`.
    alloc_limit: AtomicU64,
    /// A parent list this stripe rebases onto (via `alloc_range`) once
    /// it runs past `alloc_limit`, instead of growing its own counter
    /// unboundedly. Parent relationships are at most one level deep:
    /// a list that is itself somebody's parent never has one of its
    /// own.
    parent: Option<&'t SlotFreeList<'t, A>>,
}

unsafe impl<A: Allocator + Sync> Sync for SlotFreeList<'_, A> {}
unsafe impl<A: Allocator + Send> Send for SlotFreeList<'_, A> {}

impl<'t, A: Allocator> SlotFreeList<'t, A> {
    /// A stripe that claims indices `[first_index, ..)` from `table`,
    /// unbounded above.
    pub fn new(table: &'t DynamicIndexTable<A>, owner: OwnerTag, first_index: Index) -> Self {
        Self::build(table, owner, first_index, u64::MAX, None)
    }

    /// A stripe bounded to `[first_index, limit)` — a fixed,
    /// construction-time cap, useful when the caller itself already
    /// knows the disjoint ranges it wants to hand out (e.g. tests).
    /// For siblings that should arbitrate disjoint ranges among
    /// themselves at run time, use [`with_parent`](Self::with_parent)
    /// instead.
    pub fn with_limit(
        table: &'t DynamicIndexTable<A>,
        owner: OwnerTag,
        first_index: Index,
        limit: u64,
    ) -> Self {
        Self::build(table, owner, first_index, limit, None)
    }

    /// A child stripe with no stripe of its own: every time its local
    /// stack and counter run dry, it claims a fresh, disjoint
    /// leaf-sized block from `parent` via `parent.alloc_range`. Any
    /// number of sibling children may share one `parent`.
    ///
    /// `parent` must not itself have a parent — panics (debug builds)
    /// otherwise, per spec's "at most one level deep" rule.
    pub fn with_parent(
        table: &'t DynamicIndexTable<A>,
        owner: OwnerTag,
        parent: &'t SlotFreeList<'t, A>,
    ) -> Self {
        debug_assert!(
            parent.parent.is_none(),
            "SlotFreeList::with_parent: parent lists cannot themselves have a parent"
        );
        Self::build(table, owner, 0, 0, Some(parent))
    }

    fn build(
        table: &'t DynamicIndexTable<A>,
        owner: OwnerTag,
        first_index: Index,
        limit: u64,
        parent: Option<&'t SlotFreeList<'t, A>>,
    ) -> Self {
        let list = Self {
            table,
            owner,
            first_free: crossbeam_utils::CachePadded::new(AtomicPtr::new(core::ptr::null_mut())),
            cursor_lock: FastRwLock::new(()),
            next_alloc: crossbeam_utils::CachePadded::new(AtomicU64::new(first_index)),
            alloc_limit: AtomicU64::new(limit),
            parent,
        };
        table.allocator().register_freelist(&list);
        list
    }

    /// Push `elem` back onto the stripe. Any number of threads may
    /// call this concurrently (CAS loop, no lock held) — only popping
    /// needs `cursor_lock`. Alias for [`push_front`](Self::push_front).
    pub fn free_entry(&self, elem: NonNull<A::Elem>) {
        self.push_front(elem);
    }

    /// Push `elem` onto the stripe's free stack. Requires
    /// `elem.next_free()` to be null on entry — a non-null value means
    /// `elem` is still linked somewhere and this is a double free.
    /// Checked in debug builds (`debug-locks` feature).
    pub fn push_front(&self, elem: NonNull<A::Elem>) {
        #[cfg(feature = "debug-locks")]
        {
            let linked = unsafe { elem.as_ref().next_free().load(Ordering::Relaxed) };
            if !linked.is_null() {
                crate::error::FatalError::InvariantViolation(
                    "SlotFreeList::push_front: slot already linked into a free list (double free)",
                )
                .fail();
            }
        }
        loop {
            let head = self.first_free.load(Ordering::Relaxed);
            unsafe { elem.as_ref().next_free().store(head, Ordering::Relaxed) };
            if self
                .first_free
                .compare_exchange_weak(head, elem.as_ptr(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop one element directly off this stripe's free stack, without
    /// touching the allocation cursor or stealing from siblings. Takes
    /// `cursor_lock`, so only one thread can be mid-pop at a time —
    /// that single-popper discipline is what makes the pop ABA-safe.
    pub fn pop_front(&self) -> Option<NonNull<A::Elem>> {
        let _guard = self.cursor_lock.wrlock();
        self.pop_front_locked()
    }

    /// Pop assuming `cursor_lock` is already held by the caller.
    fn pop_front_locked(&self) -> Option<NonNull<A::Elem>> {
        loop {
            let head = self.first_free.load(Ordering::Acquire);
            let head = NonNull::new(head)?;
            let next = unsafe { head.as_ref().next_free().load(Ordering::Relaxed) };
            if self
                .first_free
                .compare_exchange_weak(head.as_ptr(), next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // Detach fully: a later push of this same element must
                // not see a stale `next_free` and look double-freed.
                unsafe {
                    head.as_ref()
                        .next_free()
                        .store(core::ptr::null_mut(), Ordering::Relaxed)
                };
                return Some(head);
            }
        }
    }

    /// Allocate one element. Repeats until a slot is produced:
    /// 1. Take `cursor_lock`.
    /// 2. Try to pop the local stack while holding it.
    /// 3. If empty and a parent exists, claim a fresh leaf-sized
    ///    stripe from it; otherwise fall back to our own bound.
    /// 4. Save the index to materialize, bump the cursor past it,
    ///    release the lock.
    /// 5. Resolve that index in the table (outside the lock).
    /// 6. If this call materialized the leaf, detach the first
    ///    element and bulk-push the remainder.
    /// 7. Otherwise try stealing from a sibling.
    /// 8. If nothing worked, retake the lock and retry from 1.
    pub fn alloc_entry(&self) -> Option<NonNull<A::Elem>> {
        let leaf_span = 1u64 << A::LEAF_BITS;
        loop {
            let guard = self.cursor_lock.wrlock();

            if let Some(elem) = self.pop_front_locked() {
                return Some(elem);
            }

            if self.next_alloc.load(Ordering::Relaxed) >= self.alloc_limit.load(Ordering::Relaxed)
            {
                match self.parent {
                    Some(parent) => {
                        let (first, last) = parent.alloc_range(leaf_span);
                        self.next_alloc.store(first, Ordering::Relaxed);
                        self.alloc_limit.store(last + 1, Ordering::Relaxed);
                    }
                    None => {
                        // No parent to rebase onto and our own bound is
                        // fixed: this exhaustion is permanent, not a
                        // transient race, so retrying forever would
                        // just hang. One steal attempt, then give up.
                        drop(guard);
                        return self.table.allocator().steal_freelist_element(self);
                    }
                }
            }

            let to_lookup = self.next_alloc.load(Ordering::Relaxed);
            self.next_alloc.store(to_lookup + leaf_span, Ordering::Relaxed);
            drop(guard);

            let (_ptr, head, tail) = self.table.lookup_entry(to_lookup, self.owner);
            let (head, tail) = match (head, tail) {
                (Some(head), Some(tail)) => (head, tail),
                _ => {
                    if let Some(stolen) = self.table.allocator().steal_freelist_element(self) {
                        return Some(stolen);
                    }
                    continue;
                }
            };

            let rest = unsafe { head.as_ref().next_free().load(Ordering::Relaxed) };
            unsafe {
                head.as_ref()
                    .next_free()
                    .store(core::ptr::null_mut(), Ordering::Relaxed)
            };
            if let Some(rest) = NonNull::new(rest) {
                self.push_chain(rest, tail);
            }
            return Some(head);
        }
    }

    /// Push an entire existing chain `[head..=tail]` onto the stack in
    /// one CAS (tail's `next_free` is spliced to the current head).
    fn push_chain(&self, head: NonNull<A::Elem>, tail: NonNull<A::Elem>) {
        loop {
            let old_head = self.first_free.load(Ordering::Relaxed);
            unsafe { tail.as_ref().next_free().store(old_head, Ordering::Relaxed) };
            if self
                .first_free
                .compare_exchange_weak(
                    old_head,
                    head.as_ptr(),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Reserve `requested` contiguous fresh indices, rounded up to a
    /// multiple of this stripe's leaf size, in one cursor bump.
    /// Returns the first and last index claimed. The range is not
    /// pushed onto any free list — it's the caller's job to resolve
    /// (and, for a leaf-sized block, materialize) those indices
    /// itself, typically via `table.lookup_entry`.
    pub fn alloc_range(&self, requested: u64) -> (Index, Index) {
        assert!(requested > 0);
        let leaf_span = 1u64 << A::LEAF_BITS;
        let count = requested
            .checked_add(leaf_span - 1)
            .unwrap_or_else(|| crate::error::FatalError::StripeExhaustion.fail())
            / leaf_span
            * leaf_span;

        let _guard = self.cursor_lock.wrlock();
        let first = self.next_alloc.load(Ordering::Relaxed);
        let last = first
            .checked_add(count - 1)
            .unwrap_or_else(|| crate::error::FatalError::StripeExhaustion.fail());
        if last >= self.alloc_limit.load(Ordering::Relaxed) {
            crate::error::FatalError::StripeExhaustion.fail();
        }
        self.next_alloc.store(last + 1, Ordering::Relaxed);
        (first, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    struct TestElem {
        next_free: AtomicPtr<TestElem>,
        id: AtomicU64,
    }

    impl FreeLink for TestElem {
        fn next_free(&self) -> &AtomicPtr<Self> {
            &self.next_free
        }
    }

    struct TestAllocator;

    impl Allocator for TestAllocator {
        const LEAF_BITS: u32 = 3;
        const INNER_BITS: u32 = 2;
        type Elem = TestElem;

        fn new_leaf_elements(
            &self,
            first: Index,
            last: Index,
            _owner: OwnerTag,
        ) -> (
            Box<[Self::Elem]>,
            Option<NonNull<Self::Elem>>,
            Option<NonNull<Self::Elem>>,
        ) {
            let count = (last - first + 1) as usize;
            let slots: Vec<TestElem> = (0..count)
                .map(|i| TestElem {
                    next_free: AtomicPtr::new(core::ptr::null_mut()),
                    id: AtomicU64::new(first + i as u64),
                })
                .collect();
            let boxed = slots.into_boxed_slice();
            for i in 0..count - 1 {
                let next_ptr = &boxed[i + 1] as *const TestElem as *mut TestElem;
                boxed[i].next_free.store(next_ptr, Ordering::Relaxed);
            }
            let head = NonNull::new(&boxed[0] as *const TestElem as *mut TestElem);
            let tail = NonNull::new(&boxed[count - 1] as *const TestElem as *mut TestElem);
            (boxed, head, tail)
        }
    }

    #[test]
    fn alloc_then_free_reuses_slot() {
        let table = DynamicIndexTable::new(TestAllocator);
        let list = SlotFreeList::new(&table, 0, 0);

        let a = list.alloc_entry().unwrap();
        let b = list.alloc_entry().unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());

        list.free_entry(a);
        let c = list.alloc_entry().unwrap();
        assert_eq!(a.as_ptr(), c.as_ptr());
    }

    #[test]
    fn push_front_and_pop_front_are_named_per_spec() {
        let table = DynamicIndexTable::new(TestAllocator);
        let list = SlotFreeList::new(&table, 0, 0);

        let a = list.alloc_entry().unwrap();
        list.push_front(a);
        // LIFO: `a` is the most recently pushed, so it pops first even
        // though the rest of its leaf's chain is still on the stack.
        let b = list.pop_front().unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn alloc_range_rounds_up_to_leaf_multiples() {
        let table = DynamicIndexTable::new(TestAllocator);
        let list = SlotFreeList::new(&table, 0, 0);
        // leaf span is 1 << LEAF_BITS == 8; a request for 4 rounds up to 8.
        let (first, last) = list.alloc_range(4);
        assert_eq!((first, last), (0, 7));
        let (first2, last2) = list.alloc_range(8);
        assert_eq!((first2, last2), (8, 15));
    }

    #[test]
    fn bounded_stripe_with_no_room_returns_none() {
        let table = DynamicIndexTable::new(TestAllocator);
        let list = SlotFreeList::with_limit(&table, 0, 0, 0);
        // No room to materialize anything, no parent, no sibling to
        // steal from.
        assert!(list.alloc_entry().is_none());
    }

    #[test]
    fn parent_child_stripes_claim_disjoint_leaf_blocks() {
        let table = DynamicIndexTable::new(TestAllocator);
        let parent = SlotFreeList::new(&table, 0, 0);
        let child_a = SlotFreeList::with_parent(&table, 1, &parent);
        let child_b = SlotFreeList::with_parent(&table, 2, &parent);

        let mut seen = alloc::collections::BTreeSet::new();
        for _ in 0..20 {
            let a = child_a.alloc_entry().unwrap();
            let b = child_b.alloc_entry().unwrap();
            assert!(seen.insert(a.as_ptr() as usize));
            assert!(seen.insert(b.as_ptr() as usize));
        }
    }

    #[cfg(feature = "std")]
    #[test]
    fn concurrent_alloc_yields_unique_pointers() {
        use alloc::sync::Arc;
        use std::collections::HashSet;
        use std::sync::Mutex;
        use std::thread;

        let table = Arc::new(DynamicIndexTable::new(TestAllocator));
        let seen = Arc::new(Mutex::new(HashSet::new()));

        // SlotFreeList borrows the table, so scope the threads to the
        // table's lifetime via std::thread::scope.
        thread::scope(|scope| {
            let list = Arc::new(SlotFreeList::new(&table, 0, 0));
            let mut handles = Vec::new();
            for _ in 0..8 {
                let list = list.clone();
                let seen = seen.clone();
                handles.push(scope.spawn(move || {
                    for _ in 0..50 {
                        let ptr = list.alloc_entry().unwrap();
                        assert!(seen.lock().unwrap().insert(ptr.as_ptr() as usize));
                    }
                }));
            }
            for h in handles {
                h.join().unwrap();
            }
        });
    }
}

/// Model-checks the push/pop CAS shape used by `push_front`/
/// `pop_front` in isolation, under `loom`'s exhaustive interleaving
/// search. Run with `RUSTFLAGS="--cfg loom" cargo test --release
/// --test <name> -- --test-threads=1`; not part of the normal test
/// run since loom's own harness replaces the default one.
#[cfg(loom)]
mod loom_tests {
    use loom::sync::atomic::{AtomicPtr, Ordering};
    use loom::sync::Arc;
    use loom::thread;

    struct Node {
        next: AtomicPtr<Node>,
        value: usize,
    }

    fn push(head: &AtomicPtr<Node>, node: *mut Node) {
        loop {
            let current = head.load(Ordering::Relaxed);
            unsafe { (*node).next.store(current, Ordering::Relaxed) };
            if head
                .compare_exchange_weak(current, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn pop(head: &AtomicPtr<Node>) -> Option<*mut Node> {
        loop {
            let current = head.load(Ordering::Acquire);
            if current.is_null() {
                return None;
            }
            let next = unsafe { (*current).next.load(Ordering::Relaxed) };
            if head
                .compare_exchange_weak(current, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(current);
            }
        }
    }

    #[test]
    fn concurrent_push_pop_never_loses_or_duplicates_a_node() {
        loom::model(|| {
            let head = Arc::new(AtomicPtr::new(core::ptr::null_mut()));
            let a = Box::into_raw(Box::new(Node {
                next: AtomicPtr::new(core::ptr::null_mut()),
                value: 1,
            }));
            let b = Box::into_raw(Box::new(Node {
                next: AtomicPtr::new(core::ptr::null_mut()),
                value: 2,
            }));
            push(&head, a);

            let head2 = head.clone();
            let pusher = thread::spawn(move || push(&head2, b));

            let popped_first = pop(&head);
            pusher.join().unwrap();
            let popped_second = pop(&head);

            let mut values: Vec<usize> = [popped_first, popped_second]
                .into_iter()
                .flatten()
                .map(|p| unsafe { (*p).value })
                .collect();
            values.sort_unstable();
            assert_eq!(values, vec![1, 2]);

            unsafe {
                drop(Box::from_raw(a));
                drop(Box::from_raw(b));
            }
        });
    }
}
