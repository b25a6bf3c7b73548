/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Sleep-based mutex and counting semaphore, built over
//! [`crate::waitqueue::WaitQueue`] and [`crate::scheduler::Scheduler`] the
//! way §5 describes ("Mutexes and semaphores are sleep-based, built over
//! waitqueues and an atomic counter/owner"). Everything above the spinlock
//! level in this crate — channel ring insertion/removal (§4.E), the
//! monitor's triggered-items count (§4.F) — is built from the [`Semaphore`]
//! here; [`Mutex`] backs the channel peer mutex and the monitor mutex.
//!
//! Below this level, `machine::sync::{SpinLock, IrqSafeSpinLock}` remain the
//! right tool for state an interrupt handler also touches (run queues, the
//! futex table). A sleep-based lock must never be taken from interrupt
//! context.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicIsize, Ordering},
};

use alloc::sync::Arc;

use crate::{
    error::Status,
    scheduler::{Thread, TimeoutType, WakeCause, SCHEDULER},
    waitqueue::WaitQueue,
};
use core::time::Duration;

/// How a blocking acquire behaves when it cannot proceed immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// Fail immediately with [`Status::WouldBlock`].
    NonBlocking,
    /// Block until the resource is available.
    Blocking,
    /// Block until available, or return [`Status::Signaled`] if the calling
    /// thread is interrupted first.
    Interruptible,
}

/// A counting semaphore: `down` before consuming a slot, `up` after
/// producing one. §4.E calls these the channel ring's "insertion" and
/// "removal" semaphores; §4.F calls one the monitor's "triggered-items"
/// semaphore.
pub struct Semaphore {
    count: AtomicIsize,
    waitq: WaitQueue,
}

impl Semaphore {
    /// Create a semaphore with `initial` slots already available.
    pub const fn new(initial: isize) -> Self {
        Self { count: AtomicIsize::new(initial), waitq: WaitQueue::new() }
    }

    /// Current count, for diagnostics only (racy the instant it's read).
    pub fn count(&self) -> isize {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn try_down(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// `down`: consume one slot, per `mode`.
    pub fn down(&self, thread: &Arc<Thread>, mode: BlockMode) -> Result<(), Status> {
        loop {
            if self.try_down() {
                return Ok(());
            }
            match mode {
                BlockMode::NonBlocking => return Err(Status::WouldBlock),
                BlockMode::Blocking | BlockMode::Interruptible => {
                    let interruptible = mode == BlockMode::Interruptible;
                    match SCHEDULER.wait_locked_checked(thread, &self.waitq, interruptible) {
                        WakeCause::Signaled => return Err(Status::Signaled),
                        WakeCause::Woken | WakeCause::TimedOut => continue,
                    }
                }
            }
        }
    }

    /// `down` with a timeout. Returns [`Status::TimedOut`] if the deadline
    /// elapses with no slot available; a wake racing the timeout resolves to
    /// the wake (§5 "A timed wait that races with a wake resolves to the
    /// wake, not timeout").
    pub fn down_timeout(
        &self,
        thread: &Arc<Thread>,
        timeout: Duration,
        timeout_type: TimeoutType,
        interruptible: bool,
    ) -> Result<(), Status> {
        if self.try_down() {
            return Ok(());
        }
        match SCHEDULER.wait_timeout_locked(thread, &self.waitq, timeout, timeout_type, interruptible) {
            WakeCause::Signaled => Err(Status::Signaled),
            WakeCause::TimedOut => {
                if self.try_down() {
                    Ok(())
                } else {
                    Err(Status::TimedOut)
                }
            }
            WakeCause::Woken => {
                if self.try_down() {
                    Ok(())
                } else {
                    // Woken for some other reason (e.g. a prior waiter raced
                    // us to the freed slot); caller retries.
                    self.down_timeout(thread, Duration::ZERO, TimeoutType::Relative, interruptible)
                }
            }
        }
    }

    /// `up`: produce one slot and wake one waiter.
    pub fn up(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
        self.waitq.wake_many(1);
    }

    /// The waitqueue backing this semaphore, for callers that need to block
    /// on it alongside an external condition `try_down` alone can't see
    /// (e.g. a channel half closing).
    pub(crate) fn waitq(&self) -> &WaitQueue {
        &self.waitq
    }

    /// Wake every waiter without producing a slot, so a blocked `down` can
    /// re-check external state (e.g. a peer's `closed_receive` flag) that
    /// changed without the count itself changing.
    pub(crate) fn wake_waiters(&self) {
        self.waitq.wake_all();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

/// A sleep-based mutual-exclusion lock: `flock_mutex_t`. Unlike
/// `machine::sync::SpinLock`, a blocked acquirer is descheduled rather than
/// spinning, so this must never be taken from interrupt context or while
/// holding a spinlock.
pub struct Mutex<T: ?Sized> {
    locked: AtomicBool,
    waitq: WaitQueue,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create an unlocked mutex.
    pub const fn new(data: T) -> Self {
        Self { locked: AtomicBool::new(false), waitq: WaitQueue::new(), data: UnsafeCell::new(data) }
    }
}

impl<T: ?Sized> Mutex<T> {
    fn try_acquire(&self) -> bool {
        self.locked.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok()
    }

    /// Acquire the lock, blocking the calling thread if necessary.
    pub fn lock(&self, thread: &Arc<Thread>) -> MutexGuard<'_, T> {
        while !self.try_acquire() {
            SCHEDULER.wait_locked(thread, &self.waitq);
        }
        MutexGuard { lock: self }
    }

    /// Try to acquire without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.try_acquire().then_some(MutexGuard { lock: self })
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
        self.waitq.wake_many(1);
    }
}

/// RAII guard for [`Mutex`].
pub struct MutexGuard<'a, T: ?Sized> {
    lock: &'a Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration as StdDuration};

    #[test]
    fn semaphore_down_blocks_until_up_from_another_os_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            thread::sleep(StdDuration::from_millis(20));
            sem2.up();
        });
        let t = Thread::new();
        assert!(sem.down(&t, BlockMode::Blocking).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn semaphore_nonblocking_fails_fast_when_empty() {
        let sem = Semaphore::new(0);
        let t = Thread::new();
        assert_eq!(sem.down(&t, BlockMode::NonBlocking), Err(Status::WouldBlock));
    }

    #[test]
    fn semaphore_down_timeout_races_a_concurrent_up() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            thread::sleep(StdDuration::from_millis(10));
            sem2.up();
        });
        let t = Thread::new();
        let result = sem.down_timeout(&t, Duration::from_millis(500), TimeoutType::Relative, false);
        assert!(result.is_ok(), "a wake racing a long timeout must resolve to the wake");
        handle.join().unwrap();
    }

    #[test]
    fn mutex_excludes_concurrent_os_threads() {
        let mutex = Arc::new(Mutex::new(0u32));
        let mutex2 = mutex.clone();
        let t1 = Thread::new();
        let t2 = Thread::new();
        let handle = thread::spawn(move || {
            for _ in 0..1000 {
                *mutex2.lock(&t2) += 1;
            }
        });
        for _ in 0..1000 {
            *mutex.lock(&t1) += 1;
        }
        handle.join().unwrap();
        assert_eq!(*mutex.lock(&t1), 2000);
    }
}
