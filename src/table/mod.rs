//! A lock-free, grow-only sparse array keyed by `u64` index.
//!
//! Elements are addressed through a radix tree of fixed fan-out
//! (`LEAF_BITS` at the bottom, `INNER_BITS` per inner level). Once an
//! element's slot has been materialized its address never changes for
//! the lifetime of the table — callers may cache raw pointers across
//! calls. Growth (adding tree height) and fill (installing a missing
//! child) are both append-only: nothing already installed is ever
//! replaced or removed before the table itself drops.

mod node;

use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use node::{level_needed, range_for, root_range, Node, RootWord};

use crate::free_list::SlotFreeList;
use crate::rwlock::FastRwLock;

/// A table position. Valid range is bounded by the table's current
/// height; see [`DynamicIndexTable::max_entries`].
pub type Index = u64;

/// An opaque caller-supplied tag threaded through to
/// [`Allocator::new_leaf_elements`] — typically identifies which
/// subsystem or shard is requesting the slot.
pub type OwnerTag = u64;

/// Requirement on the element type stored in table leaves: every
/// element carries an intrusive link used to chain it onto a free
/// list without a second allocation.
pub trait FreeLink: Sized {
    fn next_free(&self) -> &AtomicPtr<Self>;
}

/// Policy object controlling how a [`DynamicIndexTable`] is shaped and
/// populated. `LEAF_BITS`/`INNER_BITS` are fixed per allocator type,
/// standing in for what would otherwise be const-generic array
/// lengths on the table itself.
pub trait Allocator: Sized {
    /// log2 of the number of elements per leaf.
    const LEAF_BITS: u32;
    /// log2 of the fan-out of an inner node.
    const INNER_BITS: u32;

    type Elem: FreeLink;

    /// Construct `1 << LEAF_BITS` elements covering `[first, last]`,
    /// chained into a singly-linked free chain via `next_free`.
    /// Returns the slots plus the head/tail of that chain (`None` if
    /// the allocator chooses to leave them off every free list, e.g.
    /// a leaf that is pre-reserved).
    fn new_leaf_elements(
        &self,
        first: Index,
        last: Index,
        owner: OwnerTag,
    ) -> (
        Box<[Self::Elem]>,
        Option<NonNull<Self::Elem>>,
        Option<NonNull<Self::Elem>>,
    );

    /// Register a newly constructed free list as a sibling stripe other
    /// lists may steal from when they run dry. A no-op for allocators
    /// that don't support stealing.
    fn register_freelist(&self, _list: &SlotFreeList<Self>) {}

    /// Attempt to steal one element from a sibling stripe other than
    /// `list`. Returns `None` if stealing is unsupported or every
    /// sibling is also empty.
    fn steal_freelist_element(&self, _list: &SlotFreeList<Self>) -> Option<NonNull<Self::Elem>> {
        None
    }
}

/// A lock-free sparse array of `A::Elem`, indexed by `Index` and
/// grown on demand.
pub struct DynamicIndexTable<A: Allocator> {
    allocator: A,
    /// Read on every lookup; padded so readers never share a cache
    /// line with the far-colder teardown list below.
    root: crossbeam_utils::CachePadded<RootWord<A>>,
    /// Guards root-height growth. Used purely as a mutex.
    grow_lock: FastRwLock<()>,
    /// Head of the intrusive teardown list — every node ever
    /// installed, in reverse allocation order. Walked linearly (never
    /// recursed) in `Drop`.
    first_alloced_node: AtomicPtr<Node<A>>,
}

unsafe impl<A: Allocator + Send> Send for DynamicIndexTable<A> {}
unsafe impl<A: Allocator + Sync> Sync for DynamicIndexTable<A> {}

impl<A: Allocator> DynamicIndexTable<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            root: crossbeam_utils::CachePadded::new(RootWord::new()),
            grow_lock: FastRwLock::new(()),
            first_alloced_node: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Total addressable capacity given the table's current height.
    /// Monotone non-decreasing across the table's lifetime.
    pub fn max_entries(&self) -> u64 {
        let (root_ptr, height) = self.root.load(Ordering::Acquire);
        if root_ptr.is_null() {
            return 0;
        }
        let bits = A::LEAF_BITS + height as u32 * A::INNER_BITS;
        if bits >= 64 {
            u64::MAX
        } else {
            1u64 << bits
        }
    }

    /// Lock-free membership check: `true` only if the slot at `index`
    /// has already been materialized by a prior `lookup_entry`.
    pub fn has_entry(&self, index: Index) -> bool {
        let needed = level_needed::<A>(index);
        let (root_ptr, height) = self.root.load(Ordering::Acquire);
        if root_ptr.is_null() || (height as u32) < needed {
            return false;
        }
        let mut node = unsafe { &*root_ptr };
        let mut level = height as u32;
        while level > 0 {
            let inner = node.as_inner();
            let shift = A::LEAF_BITS + (level - 1) * A::INNER_BITS;
            let child_idx = child_index::<A>(index, shift);
            let child_ptr = inner.children[child_idx].load(Ordering::Acquire);
            if child_ptr.is_null() {
                return false;
            }
            node = unsafe { &*child_ptr };
            level -= 1;
        }
        true
    }

    /// Resolve `index` to its backing element, growing and filling the
    /// tree as needed. Returns a raw pointer to the (now permanently
    /// stable) element, plus the head/tail of a newly constructed
    /// free chain if this call is what materialized the leaf (`None`
    /// if the leaf already existed).
    pub fn lookup_entry(
        &self,
        index: Index,
        owner: OwnerTag,
    ) -> (
        *mut A::Elem,
        Option<NonNull<A::Elem>>,
        Option<NonNull<A::Elem>>,
    ) {
        let needed = level_needed::<A>(index);
        let root_leaf_chain = self.ensure_height(needed, index, owner);

        let (root_ptr, height) = self.root.load(Ordering::Acquire);
        debug_assert!(!root_ptr.is_null());
        debug_assert!(height as u32 >= needed);

        let mut node_ptr = root_ptr;
        let mut level = height as u32;
        let mut head = None;
        let mut tail = None;

        if level == 0 {
            head = root_leaf_chain.map(|(h, _)| h);
            tail = root_leaf_chain.map(|(_, t)| t);
        }

        while level > 0 {
            let inner = unsafe { &*node_ptr }.as_inner();
            let shift = A::LEAF_BITS + (level - 1) * A::INNER_BITS;
            let child_idx = child_index::<A>(index, shift);
            let mut child_ptr = inner.children[child_idx].load(Ordering::Acquire);

            if child_ptr.is_null() {
                let _install_guard = inner.install_lock.wrlock();
                child_ptr = inner.children[child_idx].load(Ordering::Relaxed);
                if child_ptr.is_null() {
                    let child_level = level - 1;
                    let new_ptr = if child_level == 0 {
                        let (first, last) = range_for::<A>(index, 0);
                        let (slots, h, t) = self.allocator.new_leaf_elements(first, last, owner);
                        tracing::trace!(first, last, child_idx, "materializing leaf");
                        head = h;
                        tail = t;
                        Box::into_raw(Node::new_leaf(first, last, slots))
                    } else {
                        let (first, last) = range_for::<A>(index, child_level);
                        tracing::trace!(level = child_level, first, last, "materializing inner node");
                        Box::into_raw(Node::new_inner(child_level, first, last))
                    };
                    self.push_teardown(new_ptr);
                    inner.children[child_idx].store(new_ptr, Ordering::Release);
                    child_ptr = new_ptr;
                }
            }

            node_ptr = child_ptr;
            level -= 1;
        }

        let leaf = unsafe { &*node_ptr }.as_leaf();
        let slot_idx = (index & ((1u64 << A::LEAF_BITS) - 1)) as usize;
        let elem_ptr = &leaf.slots[slot_idx] as *const A::Elem as *mut A::Elem;
        (elem_ptr, head, tail)
    }

    /// Grow the root until its height covers `needed`. If the table
    /// was previously empty and `needed == 0`, the root itself is
    /// materialized directly as a leaf (there is no parent inner node
    /// to hold an install lock for it), and the resulting free chain
    /// is returned so the caller doesn't lose it.
    fn ensure_height(
        &self,
        needed: u32,
        index: Index,
        owner: OwnerTag,
    ) -> Option<(NonNull<A::Elem>, NonNull<A::Elem>)> {
        {
            let (root_ptr, height) = self.root.load(Ordering::Acquire);
            if !root_ptr.is_null() && height as u32 >= needed {
                return None;
            }
        }

        let _guard = self.grow_lock.wrlock();
        let (mut root_ptr, mut height) = self.root.load(Ordering::Acquire);

        if root_ptr.is_null() {
            if needed == 0 {
                let (first, last) = range_for::<A>(index, 0);
                let (slots, h, t) = self.allocator.new_leaf_elements(first, last, owner);
                tracing::trace!(first, last, "materializing leaf (root)");
                let leaf_ptr = Box::into_raw(Node::new_leaf(first, last, slots));
                self.push_teardown(leaf_ptr);
                self.root.store(leaf_ptr, 0, Ordering::Release);
                return match (h, t) {
                    (Some(h), Some(t)) => Some((h, t)),
                    _ => None,
                };
            }

            let (first, last) = range_for::<A>(index, needed);
            tracing::debug!(height = needed, first, last, "creating initial root");
            let root_node = Box::into_raw(Node::new_inner(needed, first, last));
            self.push_teardown(root_node);
            self.root.store(root_node, needed as u8, Ordering::Release);
            return None;
        }

        while (height as u32) < needed {
            let (first, last) = root_range::<A>(height as u32 + 1);
            let new_root = Box::into_raw(Node::new_inner(height as u32 + 1, first, last));
            unsafe { &*new_root }.as_inner().children[0].store(root_ptr, Ordering::Relaxed);
            self.push_teardown(new_root);
            height += 1;
            tracing::debug!(new_height = height, "growing table root");
            self.root.store(new_root, height, Ordering::Release);
            root_ptr = new_root;
        }
        None
    }

    fn push_teardown(&self, node_ptr: *mut Node<A>) {
        let header = unsafe { &*node_ptr }.header();
        loop {
            let head = self.first_alloced_node.load(Ordering::Relaxed);
            header.next_alloced.store(head, Ordering::Relaxed);
            if self
                .first_alloced_node
                .compare_exchange_weak(head, node_ptr, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }
}

#[inline]
fn child_index<A: Allocator>(index: Index, shift: u32) -> usize {
    let mask = (1u64 << A::INNER_BITS) - 1;
    ((index >> shift) & mask) as usize
}

impl<A: Allocator> Drop for DynamicIndexTable<A> {
    fn drop(&mut self) {
        let mut current = *self.first_alloced_node.get_mut();
        while !current.is_null() {
            let node = unsafe { Box::from_raw(current) };
            let next = node.header().next_alloced.load(Ordering::Relaxed);
            drop(node);
            current = next;
        }
    }
}
