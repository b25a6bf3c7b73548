/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! `frefcount_t` (`kernel-include/ferro/core/refcount.h`): the retain/release
//! idiom every kernel object (threads, channels, mappings, futex entries,
//! monitor items) shares.
//!
//! Retain is a relaxed CAS loop that refuses to resurrect a count that has
//! already reached zero. Release is an acquire-release CAS loop so that the
//! thread observing the transition to zero has acquire-ordered visibility of
//! every write the other retainers did before releasing.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Status;

/// An atomic reference count with an explicit "already dead" terminal state,
/// instead of silently wrapping or panicking on underflow.
#[derive(Debug)]
pub struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    /// Create a new count, initially held once (by the caller constructing
    /// the object).
    pub const fn new() -> Self {
        Self { count: AtomicUsize::new(1) }
    }

    /// Current count, for diagnostics only — never branch kernel logic on
    /// this value without holding the lock that serializes it, since it can
    /// change concurrently.
    pub fn load(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Add one reference. Fails with [`Status::PermanentOutage`] if the
    /// count had already reached zero (the object is being, or has been,
    /// torn down) — the caller must treat the object as gone and must not
    /// dereference it further.
    pub fn retain(&self) -> Result<(), Status> {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(Status::PermanentOutage);
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Drop one reference. Returns [`Status::PermanentOutage`] when this
    /// call took the count to zero — the caller owns the teardown. Returns
    /// [`Status::AlreadyInProgress`] if the count was already zero (a
    /// double-release bug upstream; callers should treat this as fatal).
    pub fn release(&self) -> Result<(), Status> {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(Status::AlreadyInProgress);
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) if current == 1 => {
                    core::sync::atomic::fence(Ordering::Acquire);
                    return Err(Status::PermanentOutage);
                }
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_owner_release_reports_permanent_outage() {
        let rc = RefCount::new();
        assert_eq!(rc.release(), Err(Status::PermanentOutage));
    }

    #[test]
    fn retain_then_release_twice_drains_to_zero() {
        let rc = RefCount::new();
        rc.retain().unwrap();
        assert_eq!(rc.load(), 2);
        assert_eq!(rc.release(), Ok(()));
        assert_eq!(rc.release(), Err(Status::PermanentOutage));
    }

    #[test]
    fn retain_after_death_fails() {
        let rc = RefCount::new();
        assert_eq!(rc.release(), Err(Status::PermanentOutage));
        assert_eq!(rc.retain(), Err(Status::PermanentOutage));
    }

    #[test]
    fn double_release_after_death_reports_already_in_progress() {
        let rc = RefCount::new();
        assert_eq!(rc.release(), Err(Status::PermanentOutage));
        assert_eq!(rc.release(), Err(Status::AlreadyInProgress));
    }
}
