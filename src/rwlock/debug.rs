//! Thread-local re-entrancy / mixed-hold detector.
//!
//! Enabled by the `debug-locks` feature. Tracks, per thread, which
//! `FastRwLock` instances (identified by address) the thread currently
//! holds and in which mode. Mirrors the spirit of the teacher's
//! compile-time `static_assertions` checks, but at runtime, since
//! re-entrancy is a property of a *call sequence*, not a type layout.

use std::cell::RefCell;
use std::vec::Vec;

thread_local! {
    static HELD: RefCell<Vec<(usize, bool)>> = const { RefCell::new(Vec::new()) };
}

/// Record that this thread is about to hold `addr` for writing.
///
/// Panics if the thread already holds `addr` in any mode (re-entrant
/// write lock, or mixed read/write hold).
pub(crate) fn record_write_acquire(addr: usize) {
    HELD.with(|held| {
        let held = held.borrow();
        if held.iter().any(|(a, _)| *a == addr) {
            crate::error::FatalError::InvariantViolation(
                "FastRwLock: thread re-acquired a write lock it already holds \
                 (or mixed read/write on the same lock)",
            )
            .fail();
        }
    });
    HELD.with(|held| held.borrow_mut().push((addr, true)));
}

/// Record that this thread is about to hold `addr` for reading.
///
/// Panics if the thread already holds `addr` for writing.
pub(crate) fn record_read_acquire(addr: usize) {
    HELD.with(|held| {
        let held = held.borrow();
        if held.iter().any(|(a, is_write)| *a == addr && *is_write) {
            crate::error::FatalError::InvariantViolation(
                "FastRwLock: thread mixed read/write on the same lock",
            )
            .fail();
        }
    });
    HELD.with(|held| held.borrow_mut().push((addr, false)));
}

/// Record release of one hold on `addr` in the given mode.
pub(crate) fn record_release(addr: usize, is_write: bool) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held
            .iter()
            .rposition(|(a, w)| *a == addr && *w == is_write)
        {
            held.remove(pos);
        }
    });
}
