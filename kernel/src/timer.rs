/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Timers, `kernel-include/ferro/core/timers.h`'s `ftimers_oneshot_blocking`/
//! `ftimers_cancel`/`ftimers_timestamp_read`. `spec.md` leans on timeouts
//! throughout (futex wait, channel receive, monitor poll) without specifying
//! the primitive itself; this is that primitive.
//!
//! The timer list is a sorted array under a single lock, woken by whatever
//! periodic tick or one-shot deadline interrupt the bootstrap stage arms —
//! out of scope here, so [`Timers::tick`] is exposed for that external
//! driver to call.

use alloc::vec::Vec;
use core::time::Duration;

use machine::sync::IrqSafeSpinLock;

use crate::error::Status;

/// Opaque identifier for an armed one-shot timer, needed to [`Timers::cancel`] it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

struct Entry {
    id: TimerId,
    deadline: Duration,
    callback: fn(usize),
    context: usize,
}

struct State {
    entries: Vec<Entry>,
    next_id: u64,
    now: Duration,
}

/// The global timer queue.
pub struct Timers {
    state: IrqSafeSpinLock<State>,
}

impl Timers {
    /// Create an empty timer queue. The monotonic clock starts at zero;
    /// [`Timers::tick`] is expected to be driven forward from there.
    pub const fn new() -> Self {
        Self {
            state: IrqSafeSpinLock::new(State { entries: Vec::new(), next_id: 0, now: Duration::ZERO }),
        }
    }

    /// The current monotonic timestamp, as of the last [`Timers::tick`].
    pub fn timestamp_read(&self) -> Duration {
        self.state.lock().now
    }

    /// Arm a one-shot timer that invokes `callback(context)` no earlier than
    /// `delay` from now. Returns the id needed to [`Timers::cancel`] it
    /// before it fires.
    pub fn oneshot(&self, delay: Duration, callback: fn(usize), context: usize) -> TimerId {
        let mut state = self.state.lock();
        let deadline = state.now + delay;
        let id = TimerId(state.next_id);
        state.next_id += 1;
        let entry = Entry { id, deadline, callback, context };
        let pos = state.entries.partition_point(|e| e.deadline <= deadline);
        state.entries.insert(pos, entry);
        id
    }

    /// Cancel a previously armed timer. Returns [`Status::NoSuchResource`]
    /// if it already fired or was already cancelled — this is a normal,
    /// racy outcome callers must handle, not a bug.
    pub fn cancel(&self, id: TimerId) -> Result<(), Status> {
        let mut state = self.state.lock();
        match state.entries.iter().position(|e| e.id == id) {
            Some(idx) => {
                state.entries.remove(idx);
                Ok(())
            }
            None => Err(Status::NoSuchResource),
        }
    }

    /// Advance the monotonic clock to `now` and fire every timer whose
    /// deadline has passed. Called by the (out-of-scope) tick/deadline
    /// interrupt handler.
    pub fn tick(&self, now: Duration) {
        let mut fired = Vec::new();
        {
            let mut state = self.state.lock();
            state.now = now;
            while let Some(entry) = state.entries.first() {
                if entry.deadline > now {
                    break;
                }
                fired.push(state.entries.remove(0));
            }
        }
        for entry in fired {
            (entry.callback)(entry.context);
        }
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel-wide timer queue, driving `futex_wait`/`channel_receive`/
/// `monitor_poll` timeouts and scheduler suspend-with-timeout (§4.B–§4.F).
pub static MONOTONIC: Timers = Timers::new();

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn bump(_ctx: usize) {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn fires_in_deadline_order() {
        FIRED.store(0, Ordering::SeqCst);
        let timers = Timers::new();
        timers.oneshot(Duration::from_millis(10), bump, 0);
        timers.oneshot(Duration::from_millis(5), bump, 0);
        timers.tick(Duration::from_millis(6));
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        timers.tick(Duration::from_millis(11));
        assert_eq!(FIRED.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_before_fire_prevents_callback() {
        FIRED.store(0, Ordering::SeqCst);
        let timers = Timers::new();
        let id = timers.oneshot(Duration::from_millis(10), bump, 0);
        timers.cancel(id).unwrap();
        timers.tick(Duration::from_millis(20));
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_fire_reports_no_such_resource() {
        let timers = Timers::new();
        let id = timers.oneshot(Duration::from_millis(1), bump, 0);
        timers.tick(Duration::from_millis(2));
        assert_eq!(timers.cancel(id), Err(Status::NoSuchResource));
    }
}
