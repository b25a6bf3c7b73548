/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! `fwaitq`/`fwaitq_waiter` (`kernel-include/ferro/core/waitq.h`): a FIFO
//! list of wakeup callbacks, the generic hook point every other subsystem
//! (threads blocking in the scheduler, the futex table, channel readability,
//! monitor edges) registers against instead of polling.
//!
//! The original is an intrusive doubly-linked list of caller-owned nodes
//! carrying a raw function pointer and an opaque `void*` context. Re-expressed
//! per the "waitqueue callback ergonomics" design note as a closure-shaped
//! trait object (`Box<dyn FnOnce() + Send>`) owned by the queue itself (a
//! growable `Vec` guarded by an interrupt-safe spinlock) instead of an
//! intrusive pointer list; waiters are referenced by the [`WaiterId`] handed
//! back from [`WaitQueue::wait`].
//!
//! > `fwaitq_wait` is deliberately the low-level primitive: putting a
//! > *thread* to sleep on a waitq is [`crate::scheduler::Scheduler::wait`],
//! > layered on top, not this.

use alloc::{boxed::Box, vec::Vec};

use machine::sync::IrqSafeSpinLock;

/// A wakeup callback. Consumed (called at most once) with no waitqueue lock
/// held, so it may itself call back into any waitqueue.
pub type Wakeup = Box<dyn FnOnce() + Send>;

/// Handle to a registered waiter, needed to target [`WaitQueue::wake_specific`]
/// or [`WaitQueue::unwait`] at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterId(u64);

struct Waiter {
    id: WaiterId,
    wakeup: Wakeup,
}

struct State {
    waiters: Vec<Waiter>,
    next_id: u64,
}

/// A FIFO list of wakeup callbacks.
pub struct WaitQueue {
    state: IrqSafeSpinLock<State>,
}

impl WaitQueue {
    /// Create an empty waitqueue.
    pub const fn new() -> Self {
        Self { state: IrqSafeSpinLock::new(State { waiters: Vec::new(), next_id: 0 }) }
    }

    /// Register a waiter at the tail of the queue.
    ///
    /// This is the wrong call to make to put a *thread* to sleep — missing
    /// the wakeup between registering and actually descheduling is a real
    /// race; `Scheduler::wait` closes it by registering and checking the
    /// condition under the same lock.
    pub fn wait(&self, wakeup: impl FnOnce() + Send + 'static) -> WaiterId {
        let mut state = self.state.lock();
        let id = WaiterId(state.next_id);
        state.next_id += 1;
        state.waiters.push(Waiter { id, wakeup: Box::new(wakeup) });
        id
    }

    /// Wake up to `count` waiters, oldest first, removing them from the
    /// queue before invoking their callbacks.
    pub fn wake_many(&self, count: usize) {
        let woken: Vec<Waiter> = {
            let mut state = self.state.lock();
            let n = count.min(state.waiters.len());
            state.waiters.drain(0..n).collect()
        };
        for waiter in woken {
            (waiter.wakeup)();
        }
    }

    /// Wake every waiter currently registered.
    pub fn wake_all(&self) {
        self.wake_many(usize::MAX);
    }

    /// Wake one specific waiter, identified by the id returned from
    /// [`WaitQueue::wait`]. No-op if it already fired or was unwaited.
    pub fn wake_specific(&self, id: WaiterId) {
        let waiter = {
            let mut state = self.state.lock();
            state.waiters.iter().position(|w| w.id == id).map(|idx| state.waiters.remove(idx))
        };
        if let Some(waiter) = waiter {
            (waiter.wakeup)();
        }
    }

    /// Remove a waiter from the queue without invoking its callback —
    /// the caller gave up waiting through some other path (e.g. a timeout
    /// fired first).
    pub fn unwait(&self, id: WaiterId) {
        let mut state = self.state.lock();
        if let Some(idx) = state.waiters.iter().position(|w| w.id == id) {
            state.waiters.remove(idx);
        }
    }

    /// Number of waiters currently registered.
    pub fn len(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Whether the queue has no registered waiters.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use alloc::sync::Arc;

    #[test]
    fn wakes_in_fifo_order() {
        let order = Arc::new(IrqSafeSpinLock::new(Vec::new()));
        let wq = WaitQueue::new();
        let o1 = order.clone();
        wq.wait(move || o1.lock().push(1));
        let o2 = order.clone();
        wq.wait(move || o2.lock().push(2));
        wq.wake_many(1);
        assert_eq!(*order.lock(), alloc::vec![1]);
        wq.wake_many(1);
        assert_eq!(*order.lock(), alloc::vec![1, 2]);
        assert!(wq.is_empty());
    }

    #[test]
    fn wake_specific_targets_one_waiter_regardless_of_order() {
        let wq = WaitQueue::new();
        let first = wq.wait(|| {});
        let _second = wq.wait(|| {});
        wq.wake_specific(first);
        assert_eq!(wq.len(), 1);
    }

    #[test]
    fn unwait_drops_silently() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        FIRED.store(0, Ordering::SeqCst);
        let wq = WaitQueue::new();
        let id = wq.wait(|| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        });
        wq.unwait(id);
        wq.wake_all();
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
    }
}
