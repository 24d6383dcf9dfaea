//! Cross-module concurrency scenarios: many threads racing to
//! materialize and recycle slots in a shared table.

use objtable::{Allocator, DynamicIndexTable, FreeLink, Index, OwnerTag, SlotFreeList};
use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

struct Entry {
    next_free: AtomicPtr<Entry>,
    touches: AtomicU64,
}

impl FreeLink for Entry {
    fn next_free(&self) -> &AtomicPtr<Self> {
        &self.next_free
    }
}

struct EntryAllocator;

impl Allocator for EntryAllocator {
    const LEAF_BITS: u32 = 5;
    const INNER_BITS: u32 = 3;
    type Elem = Entry;

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
        let slots: Vec<Entry> = (0..count)
            .map(|_| Entry {
                next_free: AtomicPtr::new(std::ptr::null_mut()),
                touches: AtomicU64::new(0),
            })
            .collect();
        let boxed = slots.into_boxed_slice();
        for i in 0..count.saturating_sub(1) {
            let next = &boxed[i + 1] as *const Entry as *mut Entry;
            boxed[i].next_free.store(next, Ordering::Relaxed);
        }
        let head = NonNull::new(&boxed[0] as *const Entry as *mut Entry);
        let tail = NonNull::new(&boxed[count - 1] as *const Entry as *mut Entry);
        (boxed, head, tail)
    }
}

#[test]
fn concurrent_lookups_across_threads_agree_on_addresses() {
    let table = Arc::new(DynamicIndexTable::new(EntryAllocator));
    const THREADS: usize = 16;
    const INDICES: u64 = 200;

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let table = table.clone();
            thread::spawn(move || {
                let mut ptrs = Vec::with_capacity(INDICES as usize);
                for i in 0..INDICES {
                    let (ptr, _, _) = table.lookup_entry(i, 0);
                    unsafe { (*ptr).touches.fetch_add(1, Ordering::Relaxed) };
                    ptrs.push(ptr as usize);
                }
                ptrs
            })
        })
        .collect();

    let results: Vec<Vec<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for i in 0..INDICES as usize {
        let addr = results[0][i];
        for row in &results {
            assert_eq!(row[i], addr, "index {i} resolved to different addresses");
        }
    }

    for i in 0..INDICES {
        let (ptr, _, _) = table.lookup_entry(i, 0);
        unsafe {
            assert_eq!((*ptr).touches.load(Ordering::Relaxed), THREADS as u64);
        }
    }
}

#[test]
fn free_list_churn_never_hands_out_a_live_pointer_twice() {
    let table = Arc::new(DynamicIndexTable::new(EntryAllocator));
    let list = Arc::new(SlotFreeList::new(&table, 0, 0));
    let live = Arc::new(Mutex::new(HashSet::new()));

    thread::scope(|scope| {
        for _ in 0..8 {
            let list = list.clone();
            let live = live.clone();
            scope.spawn(move || {
                for _ in 0..500 {
                    let elem = list.alloc_entry().expect("allocator never exhausts");
                    let addr = elem.as_ptr() as usize;
                    assert!(
                        live.lock().unwrap().insert(addr),
                        "address {addr:#x} handed out while still live"
                    );
                    thread::yield_now();
                    assert!(live.lock().unwrap().remove(&addr));
                    list.free_entry(elem);
                }
            });
        }
    });
}

#[test]
fn parent_and_children_claim_disjoint_ranges_concurrently() {
    let table = Arc::new(DynamicIndexTable::new(EntryAllocator));
    let parent = Arc::new(SlotFreeList::new(&table, 0, 0));
    const CHILDREN: usize = 6;
    const PER_CHILD: usize = 200;

    let all: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));

    thread::scope(|scope| {
        for owner in 0..CHILDREN {
            let table = table.clone();
            let parent = parent.clone();
            let all = all.clone();
            scope.spawn(move || {
                let child = SlotFreeList::with_parent(&table, owner as u64 + 1, &parent);
                for _ in 0..PER_CHILD {
                    let elem = child.alloc_entry().expect("parent never runs out");
                    assert!(
                        all.lock().unwrap().insert(elem.as_ptr() as usize),
                        "address {:#x} handed out to two children",
                        elem.as_ptr() as usize
                    );
                }
            });
        }
    });

    assert_eq!(all.lock().unwrap().len(), CHILDREN * PER_CHILD);
}
