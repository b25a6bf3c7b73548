/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! The spinlock family `locks.h` / `locks.spin.h` describe: a plain
//! test-and-test-and-set spinlock (`flock_spin_t`) and an interrupt-safe
//! variant that additionally masks local interrupts for the duration of the
//! critical section (`flock_spin_intsafe_t`), so a lock held by a thread can
//! never be contended by an interrupt handler on the same core.
//!
//! Everything in `kernel` that needs mutual exclusion below the level of a
//! waitqueue (run queue locks, futex bucket locks, channel queue locks) is
//! built on one of these two types.

use core::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::interrupts::InterruptGuard;

/// Shared interface for the two spinlock flavors below, mirroring the way
/// the teacher's `interface::Mutex` decouples callers from the concrete lock
/// type.
pub mod interface {
    /// Any object implementing this trait guarantees exclusive access to the
    /// data wrapped within the lock for the duration of the provided
    /// closure.
    pub trait Mutex {
        /// The type of the data that is wrapped by this lock.
        type Data;

        /// Locks and grants the closure temporary mutable access to the
        /// wrapped data.
        fn lock<R>(&self, f: impl FnOnce(&mut Self::Data) -> R) -> R;
    }
}

/// A plain test-and-test-and-set spinlock. Does not mask interrupts; must
/// never be held across a call that can be preempted by an interrupt handler
/// running on the same core and trying to take the same lock (use
/// [`IrqSafeSpinLock`] there instead).
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create an instance, initially unlocked.
    pub const fn new(data: T) -> Self {
        Self { locked: AtomicBool::new(false), data: UnsafeCell::new(data) }
    }
}

impl<T: ?Sized> SpinLock<T> {
    fn acquire(&self) {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Acquire the lock, returning a guard that releases it on drop.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard { lock: self }
    }

    /// Try to acquire without spinning. `None` if already held.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then(|| SpinLockGuard { lock: self })
    }
}

impl<T: ?Sized> interface::Mutex for SpinLock<T> {
    type Data = T;

    fn lock<R>(&self, f: impl FnOnce(&mut Self::Data) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }
}

/// RAII guard for [`SpinLock`].
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// A spinlock that additionally disables local interrupts for the duration
/// the lock is held, the `flock_spin_intsafe_t` counterpart. Use this for any
/// data an interrupt handler (e.g. the timer tick, an IPI handler) can also
/// touch — run queues, the futex table, per-CPU scheduler state.
pub struct IrqSafeSpinLock<T: ?Sized> {
    inner: SpinLock<T>,
}

impl<T> IrqSafeSpinLock<T> {
    /// Create an instance, initially unlocked.
    pub const fn new(data: T) -> Self {
        Self { inner: SpinLock::new(data) }
    }
}

impl<T: ?Sized> IrqSafeSpinLock<T> {
    /// Mask interrupts, then acquire the spinlock. Interrupts are restored to
    /// whatever state they were in when the guard drops.
    pub fn lock(&self) -> IrqSafeSpinLockGuard<'_, T> {
        let irq_guard = InterruptGuard::disable();
        self.inner.acquire();
        IrqSafeSpinLockGuard { lock: &self.inner, _irq_guard: irq_guard }
    }
}

impl<T: ?Sized> interface::Mutex for IrqSafeSpinLock<T> {
    type Data = T;

    fn lock<R>(&self, f: impl FnOnce(&mut Self::Data) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }
}

/// RAII guard for [`IrqSafeSpinLock`]. Releasing it both unlocks the
/// spinlock and, if no other [`InterruptGuard`] is outstanding, unmasks
/// interrupts.
pub struct IrqSafeSpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    _irq_guard: InterruptGuard,
}

impl<T: ?Sized> Deref for IrqSafeSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for IrqSafeSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for IrqSafeSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
        // `_irq_guard` drops after this, restoring the prior interrupt mask.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinlock_mutates_through_guard() {
        let lock = SpinLock::new(0u32);
        *lock.lock() += 1;
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn spinlock_try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn irq_safe_spinlock_mutates_through_guard() {
        let lock = IrqSafeSpinLock::new(vec![1, 2, 3]);
        lock.lock().push(4);
        assert_eq!(*lock.lock(), vec![1, 2, 3, 4]);
    }
}
