//! A fair reader/writer lock with a contention-free fast path.
//!
//! Enspired by, and generalizing, the teacher's
//! [qrwlock](https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git/tree/include/asm-generic/qrwlock.h)-style
//! design: a single atomic state word, a compare-and-swap fast path for
//! the uncontended case, and a FIFO ticket-mutex-guarded slow path for
//! everything else.
//!
//! State word bit layout (low to high):
//!
//! ```text
//! bit 0      WRITER              an exclusive writer holds the lock
//! bit 1      WRITER_WAITING      a writer is queued
//! bit 2      SLEEPER             at least one waiter is parked
//! bit 3      BASE_RSRV_WAITING   external base-reservation pending
//! bits 4..   READER_COUNT        number of active readers
//! ```

#[cfg(feature = "debug-locks")]
mod debug;

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use spin::mutex::TicketMutex;
use spin::relax::Spin;
use spin::RelaxStrategy;

#[cfg(feature = "std")]
use alloc::collections::VecDeque;
#[cfg(feature = "std")]
use alloc::sync::Arc;

const WRITER: u32 = 1 << 0;
const WRITER_WAITING: u32 = 1 << 1;
const SLEEPER: u32 = 1 << 2;
const BASE_RSRV_WAITING: u32 = 1 << 3;
const READER_SHIFT: u32 = 4;
const READER_UNIT: u32 = 1 << READER_SHIFT;
const READER_MASK: u32 = !0u32 << READER_SHIFT;

/// Bits a reader's fast path must see clear (besides its own count) to
/// proceed without falling to the slow path.
const READER_GATE: u32 = WRITER | WRITER_WAITING | BASE_RSRV_WAITING;

/// A reader may spin this many times under [`RwLockMode::Spin`] before
/// parking.
const SPIN_LIMIT: u32 = 1000;

/// Governs the behavior of a lock's slow path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RwLockMode {
    /// Spin a bounded number of times, then park.
    Spin,
    /// Park immediately without spinning.
    Wait,
    /// Never park; spin until the lock is acquired.
    AlwaysSpin,
}

/// The outcome of a mode-aware write-lock attempt.
pub enum WriteLockOutcome<'a, T> {
    /// The lock was acquired without blocking the caller.
    Acquired(WriteGuard<'a, T>),
    /// The lock is contended; the caller may block on the handle, or
    /// drop it to cancel the attempt.
    Pending(WriteWaitHandle<'a, T>),
}

/// The outcome of a mode-aware read-lock attempt.
pub enum ReadLockOutcome<'a, T> {
    /// The lock was acquired without blocking the caller.
    Acquired(ReadGuard<'a, T>),
    /// The lock is contended; the caller may block on the handle, or
    /// drop it to cancel the attempt.
    Pending(ReadWaitHandle<'a, T>),
}

/// A reader/writer synchronization word plus the data it guards.
pub struct FastRwLock<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
    /// FIFO queue serializing slow-path entrants (teacher's `wq`).
    wq: TicketMutex<()>,
    #[cfg(feature = "std")]
    sleepers: spin::Mutex<VecDeque<Arc<Parker>>>,
}

unsafe impl<T: Send> Sync for FastRwLock<T> {}
unsafe impl<T: Send> Send for FastRwLock<T> {}

impl<T> FastRwLock<T> {
    /// Create a new lock wrapping `data`, initially unheld.
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(data),
            wq: TicketMutex::new(()),
            #[cfg(feature = "std")]
            sleepers: spin::Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Raw state word, for tests and diagnostics.
    pub fn raw_state(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }

    pub fn is_write_locked(&self) -> bool {
        self.raw_state() & WRITER != 0
    }

    pub fn reader_count(&self) -> u32 {
        (self.raw_state() & READER_MASK) >> READER_SHIFT
    }

    /// Force all new acquirers onto the slow path until
    /// [`clear_base_reservation`](Self::clear_base_reservation) is
    /// called. The caller is responsible for draining readers first
    /// (see spec design note (b)); this lock does not enforce that.
    pub fn set_base_reservation(&self) {
        self.state.fetch_or(BASE_RSRV_WAITING, Ordering::AcqRel);
    }

    /// Clear a previously-set base reservation and wake any sleepers.
    pub fn clear_base_reservation(&self) {
        self.state.fetch_and(!BASE_RSRV_WAITING, Ordering::AcqRel);
        self.wake_sleepers();
    }

    #[inline]
    fn write_try_lock_fast(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn read_try_lock_fast(&self) -> bool {
        let prior = self.state.fetch_add(READER_UNIT, Ordering::Acquire);
        if prior & READER_GATE == 0 {
            true
        } else {
            self.state.fetch_sub(READER_UNIT, Ordering::Relaxed);
            false
        }
    }

    /// Try to acquire exclusive access without blocking.
    pub fn trywrlock(&self) -> Option<WriteGuard<'_, T>> {
        if self.write_try_lock_fast() {
            Some(self.write_guard())
        } else {
            None
        }
    }

    /// Try to acquire shared access without blocking.
    pub fn tryrdlock(&self) -> Option<ReadGuard<'_, T>> {
        if self.read_try_lock_fast() {
            Some(self.read_guard())
        } else {
            None
        }
    }

    /// Acquire exclusive access, spinning forever if contended.
    pub fn wrlock(&self) -> WriteGuard<'_, T> {
        match self.wrlock_mode(RwLockMode::AlwaysSpin) {
            WriteLockOutcome::Acquired(g) => g,
            WriteLockOutcome::Pending(_) => unreachable!("AlwaysSpin never yields Pending"),
        }
    }

    /// Acquire shared access, spinning forever if contended.
    pub fn rdlock(&self) -> ReadGuard<'_, T> {
        match self.rdlock_mode(RwLockMode::AlwaysSpin) {
            ReadLockOutcome::Acquired(g) => g,
            ReadLockOutcome::Pending(_) => unreachable!("AlwaysSpin never yields Pending"),
        }
    }

    /// Attempt to acquire exclusive access under the given mode.
    pub fn wrlock_mode(&self, mode: RwLockMode) -> WriteLockOutcome<'_, T> {
        if self.write_try_lock_fast() {
            return WriteLockOutcome::Acquired(self.write_guard());
        }
        match mode {
            RwLockMode::AlwaysSpin => WriteLockOutcome::Acquired(self.wrlock_block(mode)),
            RwLockMode::Spin | RwLockMode::Wait => {
                WriteLockOutcome::Pending(WriteWaitHandle { lock: self, mode })
            }
        }
    }

    /// Attempt to acquire shared access under the given mode.
    pub fn rdlock_mode(&self, mode: RwLockMode) -> ReadLockOutcome<'_, T> {
        if self.read_try_lock_fast() {
            return ReadLockOutcome::Acquired(self.read_guard());
        }
        match mode {
            RwLockMode::AlwaysSpin => ReadLockOutcome::Acquired(self.rdlock_block(mode)),
            RwLockMode::Spin | RwLockMode::Wait => {
                ReadLockOutcome::Pending(ReadWaitHandle { lock: self, mode })
            }
        }
    }

    /// The slow path for writers: FIFO-queued behind `wq`, bounces new
    /// readers onto their own slow path via `WRITER_WAITING`.
    fn wrlock_block(&self, mode: RwLockMode) -> WriteGuard<'_, T> {
        let _ticket = self.wq.lock();

        if self.write_try_lock_fast() {
            return self.write_guard();
        }

        self.state.fetch_or(WRITER_WAITING, Ordering::Relaxed);

        let mut spins = 0u32;
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & (WRITER | READER_MASK) == 0 {
                let target = (state & !WRITER_WAITING) | WRITER;
                if self
                    .state
                    .compare_exchange(state, target, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return self.write_guard();
                }
                continue;
            }
            self.backoff(mode, &mut spins, true);
        }
    }

    /// The slow path for readers: registers intent (bumping the count)
    /// under `wq` for FIFO fairness with queued writers, then releases
    /// `wq` and waits independently of other readers.
    fn rdlock_block(&self, mode: RwLockMode) -> ReadGuard<'_, T> {
        {
            let _ticket = self.wq.lock();
            self.state.fetch_add(READER_UNIT, Ordering::Relaxed);
        }

        let mut spins = 0u32;
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & (WRITER | BASE_RSRV_WAITING) == 0 {
                return self.read_guard();
            }
            self.backoff(mode, &mut spins, false);
        }
    }

    fn backoff(&self, mode: RwLockMode, spins: &mut u32, is_write: bool) {
        match mode {
            RwLockMode::AlwaysSpin => Spin::relax(),
            RwLockMode::Spin => {
                if *spins < SPIN_LIMIT {
                    *spins += 1;
                    Spin::relax();
                } else {
                    self.park_self(is_write);
                }
            }
            RwLockMode::Wait => self.park_self(is_write),
        }
    }

    #[cfg(feature = "std")]
    fn park_self(&self, is_write: bool) {
        let parker = Parker::new();
        // Register before setting SLEEPER: a release that observes
        // SLEEPER set can only run after this push is visible.
        self.sleepers.lock().push_back(parker.clone());
        self.state.fetch_or(SLEEPER, Ordering::AcqRel);

        // A release may have landed between our last state check and
        // registering as a sleeper. Re-check the condition we're
        // actually waiting on before committing to `park()`, or the
        // wakeup that already happened is lost and we sleep forever.
        let state = self.state.load(Ordering::Acquire);
        let still_blocked = if is_write {
            state & (WRITER | READER_MASK) != 0
        } else {
            state & (WRITER | BASE_RSRV_WAITING) != 0
        };
        if still_blocked {
            parker.wait();
        } else {
            self.wake_sleepers();
        }
    }

    #[cfg(not(feature = "std"))]
    fn park_self(&self, _is_write: bool) {
        // No OS thread to park; degrade to spinning.
        Spin::relax();
    }

    #[cfg(feature = "std")]
    fn wake_sleepers(&self) {
        let woken: VecDeque<Arc<Parker>> =
            core::mem::take(&mut *self.sleepers.lock());
        for parker in woken {
            parker.wake();
        }
    }

    #[cfg(not(feature = "std"))]
    fn wake_sleepers(&self) {}

    fn unlock_write(&self) {
        let state = self.state.load(Ordering::Relaxed);
        if state & (READER_MASK | SLEEPER | BASE_RSRV_WAITING) == 0 {
            if self
                .state
                .compare_exchange(state, state & !WRITER, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
        self.unlock_slow(true);
    }

    fn unlock_read(&self) {
        let state = self.state.load(Ordering::Relaxed);
        if state & (WRITER | BASE_RSRV_WAITING) == 0 && (state & READER_MASK) != 0 {
            if self
                .state
                .compare_exchange(
                    state,
                    state - READER_UNIT,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
        self.unlock_slow(false);
    }

    fn unlock_slow(&self, is_write: bool) {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            let released = if is_write {
                state & !WRITER
            } else {
                state - READER_UNIT
            };
            let target = released & !SLEEPER;
            match self.state.compare_exchange_weak(
                state,
                target,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(prev) => {
                    if prev & SLEEPER != 0 {
                        self.wake_sleepers();
                    }
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    fn write_guard(&self) -> WriteGuard<'_, T> {
        #[cfg(feature = "debug-locks")]
        debug::record_write_acquire(self.addr());
        WriteGuard { lock: self }
    }

    fn read_guard(&self) -> ReadGuard<'_, T> {
        #[cfg(feature = "debug-locks")]
        debug::record_read_acquire(self.addr());
        ReadGuard { lock: self }
    }
}

#[cfg(feature = "std")]
struct Parker {
    thread: std::thread::Thread,
    ready: core::sync::atomic::AtomicBool,
}

#[cfg(feature = "std")]
impl Parker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            thread: std::thread::current(),
            ready: core::sync::atomic::AtomicBool::new(false),
        })
    }

    fn wait(&self) {
        while !self.ready.load(Ordering::Acquire) {
            std::thread::park();
        }
    }

    fn wake(&self) {
        self.ready.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

/// A handle to a pending exclusive-lock attempt. Blocking happens only
/// when [`wait`](Self::wait) is called; dropping the handle cancels
/// the attempt (the lock's contended-entrant bookkeeping is re-derived
/// from the state word, not from handle bookkeeping, so cancellation
/// needs no special-case cleanup).
pub struct WriteWaitHandle<'a, T> {
    lock: &'a FastRwLock<T>,
    mode: RwLockMode,
}

impl<'a, T> WriteWaitHandle<'a, T> {
    /// Block (spinning or parking, per the original mode) until the
    /// lock is acquired.
    pub fn wait(self) -> WriteGuard<'a, T> {
        self.lock.wrlock_block(self.mode)
    }
}

/// A handle to a pending shared-lock attempt. See [`WriteWaitHandle`].
pub struct ReadWaitHandle<'a, T> {
    lock: &'a FastRwLock<T>,
    mode: RwLockMode,
}

impl<'a, T> ReadWaitHandle<'a, T> {
    /// Block (spinning or parking, per the original mode) until the
    /// lock is acquired.
    pub fn wait(self) -> ReadGuard<'a, T> {
        self.lock.rdlock_block(self.mode)
    }
}

/// RAII guard providing shared access to the protected data.
pub struct ReadGuard<'a, T> {
    lock: &'a FastRwLock<T>,
}

/// RAII guard providing exclusive access to the protected data.
pub struct WriteGuard<'a, T> {
    lock: &'a FastRwLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(feature = "debug-locks")]
        debug::record_release(self.lock.addr(), false);
        self.lock.unlock_read();
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(feature = "debug-locks")]
        debug::record_release(self.lock.addr(), true);
        self.lock.unlock_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_threaded_write_then_unlock() {
        let lock = FastRwLock::new(());
        let locked = lock.wrlock();
        assert!(lock.tryrdlock().is_none());
        assert!(lock.trywrlock().is_none());
        drop(locked);
        assert_eq!(lock.raw_state(), 0);
    }

    #[test]
    fn single_threaded_multi_reader() {
        let lock = FastRwLock::new(());
        let r1 = lock.rdlock();
        let r2 = lock.rdlock();
        let r3 = lock.rdlock();
        assert!(lock.trywrlock().is_none());
        drop(r1);
        drop(r2);
        drop(r3);
        assert_eq!(lock.raw_state(), 0);
    }

    #[test]
    fn trywrlock_fails_while_read_held() {
        let lock = FastRwLock::new(0);
        let _r = lock.rdlock();
        assert!(lock.trywrlock().is_none());
    }

    #[test]
    fn base_reservation_blocks_fast_path() {
        let lock = FastRwLock::new(0);
        lock.set_base_reservation();
        assert!(lock.tryrdlock().is_none());
        assert!(lock.trywrlock().is_none());
        lock.clear_base_reservation();
        assert!(lock.tryrdlock().is_some());
    }

    #[cfg(feature = "std")]
    #[test]
    fn multi_threaded_readers_and_writers() {
        use std::sync::Arc;
        use std::thread;

        const READERS: usize = 8;
        const WRITERS: usize = 2;
        const WRITE_MARK: u64 = 1 << 40;

        let lock = Arc::new(FastRwLock::new(0u64));

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let guard = lock.rdlock();
                        assert_eq!(*guard & WRITE_MARK, 0);
                        thread::yield_now();
                        drop(guard);
                    }
                })
            })
            .collect();

        let writers: Vec<_> = (0..WRITERS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let mut guard = lock.wrlock();
                        assert_eq!(*guard & WRITE_MARK, 0);
                        *guard |= WRITE_MARK;
                        thread::yield_now();
                        *guard &= !WRITE_MARK;
                        drop(guard);
                    }
                })
            })
            .collect();

        for t in readers {
            t.join().unwrap();
        }
        for t in writers {
            t.join().unwrap();
        }
        assert_eq!(lock.raw_state(), 0);
    }
}
