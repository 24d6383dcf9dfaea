//! Lock-free object tables for runtime systems: a grow-only sparse
//! array keyed by a dense `u64` index, a striped free list layered on
//! top, and the fair reader/writer lock both of them use internally.
//!
//! Three pieces, meant to be used together or separately:
//!
//! - [`rwlock::FastRwLock`] — a single-atomic-word fair rwlock with a
//!   CAS fast path and a FIFO-queued slow path.
//! - [`table::DynamicIndexTable`] — a radix-tree-indexed sparse array
//!   whose element addresses are stable for the table's lifetime once
//!   materialized.
//! - [`free_list::SlotFreeList`] — a striped, mostly-lock-free
//!   allocator layered over a table.
//!
//! Build without the default `std` feature for `no_std` targets that
//! provide a global allocator; thread parking and the `debug-locks`
//! reentrancy tracker require `std`.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

#[macro_use]
extern crate static_assertions;

pub mod error;
pub mod free_list;
pub mod rwlock;
pub mod table;

pub use error::FatalError;
pub use free_list::SlotFreeList;
pub use rwlock::{FastRwLock, ReadGuard, ReadLockOutcome, RwLockMode, WriteGuard, WriteLockOutcome};
pub use table::{Allocator, DynamicIndexTable, FreeLink, Index, OwnerTag};
