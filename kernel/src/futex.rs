/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Futex table, `futex_t` (§4.C): a per-address-space wait set keyed by
//! `(physical_address, channel)`. Mappings of the same physical page in
//! different processes share the same entry, since the key is the resolved
//! physical address, not the user virtual address.

use alloc::{collections::BTreeMap, sync::Arc};
use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use machine::{address::PhysAddr, sync::IrqSafeSpinLock};

use crate::{
    error::Status,
    refcount::RefCount,
    scheduler::{Thread, TimeoutType, WakeCause, SCHEDULER},
    waitqueue::WaitQueue,
};

/// Key identifying one futex wait set: a resolved physical word plus a
/// "channel" selector (distinct futexes can alias the same word, e.g. for
/// different userland locking protocols sharing one page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FutexKey {
    pub address: PhysAddr,
    pub channel: u64,
}

/// One entry in the table: a waitqueue plus the refcount gating its
/// lifetime. Entries are destroyed only with the table mutex held (§4.C).
pub struct FutexEntry {
    waitq: WaitQueue,
    refcount: RefCount,
}

impl FutexEntry {
    fn new() -> Arc<Self> {
        Arc::new(Self { waitq: WaitQueue::new(), refcount: RefCount::new() })
    }
}

/// Anything able to resolve a user virtual address to the physical address
/// backing it, and to read the 8-byte word stored there. Supplied by the VM
/// subsystem (§4.D); kept as a trait here so the futex table doesn't depend
/// on a concrete `AddressSpace` type.
pub trait AddressResolver {
    /// Resolve `user_va` to the physical address currently mapped there.
    /// [`Status::BadAddress`] if unmapped.
    fn resolve(&self, user_va: usize) -> Result<PhysAddr, Status>;

    /// Load the 8-byte word at `user_va` with relaxed ordering. The futex
    /// waitqueue spinlock taken around this load (on both the wait and wake
    /// sides) is the only synchronization this word gets — see SPEC_FULL's
    /// Open Question resolution #1.
    fn load_relaxed(&self, user_va: usize) -> u64;
}

/// Per-address-space futex table.
pub struct FutexTable {
    entries: IrqSafeSpinLock<BTreeMap<FutexKey, Arc<FutexEntry>>>,
}

impl FutexTable {
    /// Create an empty table.
    pub const fn new() -> Self {
        Self { entries: IrqSafeSpinLock::new(BTreeMap::new()) }
    }

    fn get_or_create(&self, key: FutexKey) -> Arc<FutexEntry> {
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.refcount.retain().is_ok() => entry.clone(),
            _ => {
                let entry = FutexEntry::new();
                entries.insert(key, entry.clone());
                entry
            }
        }
    }

    fn get_existing(&self, key: FutexKey) -> Option<Arc<FutexEntry>> {
        let entries = self.entries.lock();
        entries.get(&key).filter(|entry| entry.refcount.retain().is_ok()).cloned()
    }

    /// Release one reference to `key`'s entry, unlinking it from the table
    /// if the count reaches zero. Retried under the table lock if another
    /// thread raced to re-acquire the entry in between (§4.C).
    fn release(&self, key: FutexKey) {
        loop {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get(&key) else { return };
            match entry.refcount.release() {
                Ok(()) => return,
                Err(Status::PermanentOutage) => {
                    // Dropped to zero: remove, unless someone else resurrected
                    // it between our release and taking the table lock.
                    if entry.refcount.load() == 0 {
                        entries.remove(&key);
                    }
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    /// `futex_wait(addr, channel, expected, timeout, timeout_type)` (§4.C
    /// step-by-step protocol).
    pub fn wait(
        &self,
        resolver: &dyn AddressResolver,
        thread: &Arc<Thread>,
        user_va: usize,
        channel: u64,
        expected: u64,
        timeout: Option<(Duration, TimeoutType)>,
        interruptible: bool,
    ) -> Result<(), Status> {
        let phys = resolver.resolve(user_va)?;
        let key = FutexKey { address: phys, channel };
        let entry = self.get_or_create(key);

        // The waitq's own spinlock is taken (via `wait`'s internal lock) as
        // the barrier pairing the relaxed word load here with the relaxed
        // store a waker does before calling `wake` (§5).
        let observed = resolver.load_relaxed(user_va);
        if observed != expected {
            self.release(key);
            return Err(Status::ShouldRestart);
        }

        let cause = match timeout {
            None => SCHEDULER.wait_locked_checked(thread, &entry.waitq, interruptible),
            Some((duration, timeout_type)) => {
                SCHEDULER.wait_timeout_locked(thread, &entry.waitq, duration, timeout_type, interruptible)
            }
        };
        self.release(key);
        match cause {
            WakeCause::Woken => Ok(()),
            WakeCause::TimedOut => Err(Status::TimedOut),
            WakeCause::Signaled => Err(Status::Signaled),
        }
    }

    /// `futex_wake(addr, channel, count)`. A no-op (not an error) if no
    /// entry exists — the common, correct fast path when nobody is waiting.
    pub fn wake(&self, resolver: &dyn AddressResolver, user_va: usize, channel: u64, count: usize) -> Result<(), Status> {
        let phys = resolver.resolve(user_va)?;
        let key = FutexKey { address: phys, channel };
        if let Some(entry) = self.get_existing(key) {
            entry.waitq.wake_many(count);
            self.release(key);
        }
        Ok(())
    }
}

impl Default for FutexTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread death-futex registration (`futex_associate`, §4.C): when the
/// registered thread dies, the kernel writes `value` to `address` and wakes
/// every waiter on the futex keyed by `(address, channel)`.
#[derive(Debug, Clone, Copy)]
pub struct DeathFutex {
    pub address: PhysAddr,
    pub channel: u64,
    pub value: u64,
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(0);

/// Run the death-futex protocol for a dying thread: write `registration`'s
/// value to its address (via `writer`) and wake every waiter, using
/// `usize::MAX`-equivalent semantics (wake everyone).
pub fn run_death_futex(
    table: &FutexTable,
    registration: &DeathFutex,
    writer: impl FnOnce(PhysAddr, u64),
) {
    let _generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
    writer(registration.address, registration.value);
    let key = FutexKey { address: registration.address, channel: registration.channel };
    if let Some(entry) = table.get_existing(key) {
        entry.waitq.wake_all();
        table.release(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::BTreeMap as StdMap, sync::Mutex as StdMutex, thread, time::Duration as StdDuration};

    struct FakeMemory {
        words: StdMutex<StdMap<usize, (PhysAddr, u64)>>,
    }

    impl FakeMemory {
        fn new() -> Self {
            Self { words: StdMutex::new(StdMap::new()) }
        }

        fn install(&self, va: usize, phys: PhysAddr, value: u64) {
            self.words.lock().unwrap().insert(va, (phys, value));
        }

        fn store(&self, va: usize, value: u64) {
            let mut words = self.words.lock().unwrap();
            let entry = words.get_mut(&va).expect("address installed");
            entry.1 = value;
        }
    }

    impl AddressResolver for FakeMemory {
        fn resolve(&self, user_va: usize) -> Result<PhysAddr, Status> {
            self.words.lock().unwrap().get(&user_va).map(|(phys, _)| *phys).ok_or(Status::BadAddress)
        }

        fn load_relaxed(&self, user_va: usize) -> u64 {
            self.words.lock().unwrap().get(&user_va).map(|(_, v)| *v).unwrap_or(0)
        }
    }

    #[test]
    fn stale_value_short_circuits_without_blocking() {
        let mem = FakeMemory::new();
        mem.install(0x1000, PhysAddr::new(0x5000), 5);
        let table = FutexTable::new();
        let t = Thread::new();
        let result = table.wait(&mem, &t, 0x1000, 0, 0, None, false);
        assert_eq!(result, Err(Status::ShouldRestart));
    }

    #[test]
    fn wake_wakes_a_matching_waiter() {
        let mem = Arc::new(FakeMemory::new());
        mem.install(0x2000, PhysAddr::new(0x6000), 0);
        let table = Arc::new(FutexTable::new());

        let mem2 = mem.clone();
        let table2 = table.clone();
        let handle = thread::spawn(move || {
            thread::sleep(StdDuration::from_millis(20));
            mem2.store(0x2000, 1);
            table2.wake(mem2.as_ref(), 0x2000, 0, 1).unwrap();
        });

        let t = Thread::new();
        let result = table.wait(mem.as_ref(), &t, 0x2000, 0, 0, None, false);
        assert_eq!(result, Ok(()));
        handle.join().unwrap();
    }

    #[test]
    fn wake_with_no_waiters_is_a_noop() {
        let mem = FakeMemory::new();
        mem.install(0x3000, PhysAddr::new(0x7000), 0);
        let table = FutexTable::new();
        assert_eq!(table.wake(&mem, 0x3000, 0, 1), Ok(()));
    }

    #[test]
    fn wait_on_unmapped_address_is_bad_address() {
        let mem = FakeMemory::new();
        let table = FutexTable::new();
        let t = Thread::new();
        assert_eq!(table.wait(&mem, &t, 0xdead, 0, 0, None, false), Err(Status::BadAddress));
    }

    #[test]
    fn death_futex_writes_value_and_wakes_waiters() {
        let mem = Arc::new(FakeMemory::new());
        mem.install(0x4000, PhysAddr::new(0x8000), 0);
        let table = Arc::new(FutexTable::new());

        let mem2 = mem.clone();
        let table2 = table.clone();
        let handle = thread::spawn(move || {
            thread::sleep(StdDuration::from_millis(20));
            let registration = DeathFutex { address: PhysAddr::new(0x8000), channel: 0, value: 0xDEAD_BEEF };
            run_death_futex(&table2, &registration, |_phys, value| mem2.store(0x4000, value));
        });

        let t = Thread::new();
        let result = table.wait(mem.as_ref(), &t, 0x4000, 0, 0, None, false);
        assert_eq!(result, Ok(()));
        assert_eq!(mem.load_relaxed(0x4000), 0xDEAD_BEEF);
        handle.join().unwrap();
    }
}
