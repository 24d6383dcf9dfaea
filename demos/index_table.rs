//! A minimal object table: each slot holds a generation counter plus a
//! refcount, the way a runtime might back handle-based object
//! identities with stable, cacheable addresses.

use objtable::{Allocator, DynamicIndexTable, FreeLink, Index, OwnerTag};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64};

struct ObjectSlot {
    next_free: AtomicPtr<ObjectSlot>,
    generation: AtomicU32,
    refcount: AtomicU32,
    owner: AtomicU64,
}

impl FreeLink for ObjectSlot {
    fn next_free(&self) -> &AtomicPtr<Self> {
        &self.next_free
    }
}

struct ObjectAllocator;

impl Allocator for ObjectAllocator {
    // 64 objects per leaf, fan-out 16 per inner node.
    const LEAF_BITS: u32 = 6;
    const INNER_BITS: u32 = 4;
    type Elem = ObjectSlot;

    fn new_leaf_elements(
        &self,
        first: Index,
        last: Index,
        owner: OwnerTag,
    ) -> (
        Box<[Self::Elem]>,
        Option<NonNull<Self::Elem>>,
        Option<NonNull<Self::Elem>>,
    ) {
        let count = (last - first + 1) as usize;
        let slots: Vec<ObjectSlot> = (0..count)
            .map(|_| ObjectSlot {
                next_free: AtomicPtr::new(std::ptr::null_mut()),
                generation: AtomicU32::new(0),
                refcount: AtomicU32::new(0),
                owner: AtomicU64::new(owner),
            })
            .collect();
        let boxed = slots.into_boxed_slice();
        for i in 0..count.saturating_sub(1) {
            let next = &boxed[i + 1] as *const ObjectSlot as *mut ObjectSlot;
            boxed[i].next_free.store(next, std::sync::atomic::Ordering::Relaxed);
        }
        let head = NonNull::new(&boxed[0] as *const ObjectSlot as *mut ObjectSlot);
        let tail = NonNull::new(&boxed[count - 1] as *const ObjectSlot as *mut ObjectSlot);
        (boxed, head, tail)
    }
}

fn main() {
    let table = DynamicIndexTable::new(ObjectAllocator);
    assert_eq!(table.max_entries(), 0);

    let owner = 7;
    let (slot, _head, _tail) = table.lookup_entry(1000, owner);
    unsafe {
        (*slot).generation.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    assert!(table.has_entry(1000));
    assert!(!table.has_entry(1001));
    println!("table now addresses up to {} entries", table.max_entries());

    // Looking the same index up again returns the same stable address.
    let (slot2, _, _) = table.lookup_entry(1000, owner);
    assert_eq!(slot, slot2);
    unsafe {
        assert_eq!((*slot2).generation.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
