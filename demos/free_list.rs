//! Allocating and recycling table slots through a `SlotFreeList`.

use objtable::{Allocator, DynamicIndexTable, FreeLink, Index, OwnerTag, SlotFreeList};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

struct Handle {
    next_free: AtomicPtr<Handle>,
    tag: AtomicU64,
}

impl FreeLink for Handle {
    fn next_free(&self) -> &AtomicPtr<Self> {
        &self.next_free
    }
}

struct HandleAllocator;

impl Allocator for HandleAllocator {
    const LEAF_BITS: u32 = 4;
    const INNER_BITS: u32 = 4;
    type Elem = Handle;

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
        let slots: Vec<Handle> = (0..count)
            .map(|i| Handle {
                next_free: AtomicPtr::new(std::ptr::null_mut()),
                tag: AtomicU64::new(first + i as u64),
            })
            .collect();
        let boxed = slots.into_boxed_slice();
        for i in 0..count.saturating_sub(1) {
            let next = &boxed[i + 1] as *const Handle as *mut Handle;
            boxed[i].next_free.store(next, Ordering::Relaxed);
        }
        let head = NonNull::new(&boxed[0] as *const Handle as *mut Handle);
        let tail = NonNull::new(&boxed[count - 1] as *const Handle as *mut Handle);
        (boxed, head, tail)
    }
}

fn main() {
    let table = DynamicIndexTable::new(HandleAllocator);
    let list = SlotFreeList::new(&table, 0, 0);

    let a = list.alloc_entry().expect("fresh slot");
    let b = list.alloc_entry().expect("fresh slot");
    println!(
        "allocated tags {} and {}",
        unsafe { a.as_ref().tag.load(Ordering::Relaxed) },
        unsafe { b.as_ref().tag.load(Ordering::Relaxed) },
    );

    list.free_entry(a);
    let c = list.alloc_entry().expect("recycled slot");
    assert_eq!(a.as_ptr(), c.as_ptr());
    println!("recycled slot reused for tag {}", unsafe {
        c.as_ref().tag.load(Ordering::Relaxed)
    });
}
