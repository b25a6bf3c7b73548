/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Processes and the process registry, `original_source/kernel/src/
//! userspace/process-registry.c`'s `fprocreg_*` given a typed Rust shape,
//! not described by `spec.md` but required for `process_current`/
//! `process_id` (§6.2) and the thread lifecycle to mean anything
//! (`SPEC_FULL.md`'s supplemented features).
//!
//! A process owns the handle table (§6.2's syscalls all operate on handles
//! scoped to the calling process) and the address space its threads run in;
//! it is retained by the registry for as long as it is registered, and by
//! every thread that belongs to it.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use machine::{address::VirtAddr, sync::IrqSafeSpinLock};

use crate::{
    error::Status,
    handle::HandleTable,
    scheduler::Thread,
    sync::Mutex,
    vm::{AddressSpace, FrameAllocator},
    waitqueue::WaitQueue,
};

/// Sentinel the registry never hands out, mirroring `FPROC_ID_INVALID`.
pub const INVALID_ID: u64 = 0;

/// A userspace process: one address space, one handle table, and the set of
/// threads running inside it (tracked only by refcount here — the thread
/// list itself is `kernel::scheduler`'s concern).
pub struct Process {
    id: AtomicU64,
    pub handles: HandleTable,
    pub address_space: Arc<AddressSpace>,
    /// The physical-frame allocator this process's page syscalls draw from.
    /// An out-of-scope external collaborator (§1) the bootstrap stage hands
    /// every process at creation; tests use a throwaway bump allocator.
    pub frame_allocator: Arc<dyn FrameAllocator + Send + Sync>,
    /// Fires once, when the process is torn down, so the registry's death
    /// waiter and any `futex_associate`-style death futex can observe it.
    pub death_wait: WaitQueue,
}

impl Process {
    /// `fproc_t` construction. Not yet registered: `id()` reads
    /// [`INVALID_ID`] until [`ProcessRegistry::register`] assigns one.
    pub fn new(address_space: Arc<AddressSpace>, frame_allocator: Arc<dyn FrameAllocator + Send + Sync>) -> Arc<Self> {
        Arc::new(Self {
            id: AtomicU64::new(INVALID_ID),
            handles: HandleTable::new(),
            address_space,
            frame_allocator,
            death_wait: WaitQueue::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// `fproc_t` for a throwaway address space and frame allocator, the
    /// shape most unit tests want.
    #[cfg(test)]
    pub fn new_for_test() -> Arc<Self> {
        use crate::vm::mapping::test_support::BumpFrameAllocator;
        Self::new(
            AddressSpace::new(VirtAddr::new(0x1000_0000), 1024),
            Arc::new(BumpFrameAllocator::new(0x8000_0000)),
        )
    }

    /// Marks the process as dead: wakes every `death_wait` waiter (the
    /// registry's auto-unregister hook among them) and any futex registered
    /// via `futex_associate`'s "write on death" mode consumes this the same
    /// way.
    pub fn mark_dead(&self) {
        self.death_wait.wake_all();
    }
}

struct Entry {
    process: Arc<Process>,
}

/// `fprocreg_*`: the process-id namespace every running process is
/// registered in. One instance exists per system; [`global`] reaches it.
pub struct ProcessRegistry {
    entries: Mutex<alloc::collections::BTreeMap<u64, Entry>>,
    next_id: IrqSafeSpinLock<u64>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self { entries: Mutex::new(alloc::collections::BTreeMap::new()), next_id: IrqSafeSpinLock::new(1) }
    }

    /// `fprocreg_register(process)`: assign the next id and publish the
    /// process under it.
    pub fn register(&self, process: Arc<Process>, thread: &Arc<Thread>) -> Result<u64, Status> {
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id = next_id.wrapping_add(1);
        if *next_id == INVALID_ID {
            *next_id = 1;
        }
        drop(next_id);

        process.id.store(id, Ordering::Release);
        let mut entries = self.entries.lock(thread);
        assert!(!entries.contains_key(&id), "process with next_id value already in registry");
        entries.insert(id, Entry { process });
        Ok(id)
    }

    /// `fprocreg_unregister(id)`.
    pub fn unregister(&self, id: u64, thread: &Arc<Thread>) -> Result<Arc<Process>, Status> {
        self.entries.lock(thread).remove(&id).map(|entry| entry.process).ok_or(Status::NoSuchResource)
    }

    /// `fprocreg_lookup(id, retain)`. Retaining is implicit: the returned
    /// `Arc` is always a fresh reference.
    pub fn lookup(&self, id: u64, thread: &Arc<Thread>) -> Result<Arc<Process>, Status> {
        self.entries.lock(thread).get(&id).map(|entry| entry.process.clone()).ok_or(Status::NoSuchResource)
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: IrqSafeSpinLock<Option<Arc<ProcessRegistry>>> = IrqSafeSpinLock::new(None);

/// The system-wide process registry, created lazily on first use.
pub fn global() -> Arc<ProcessRegistry> {
    let mut slot = GLOBAL.lock();
    if let Some(registry) = slot.as_ref() {
        return registry.clone();
    }
    let registry = Arc::new(ProcessRegistry::new());
    *slot = Some(registry.clone());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_a_nonzero_id() {
        let registry = ProcessRegistry::new();
        let t = Thread::new();
        let process = Process::new_for_test();
        let id = registry.register(process.clone(), &t).unwrap();
        assert_ne!(id, INVALID_ID);
        assert_eq!(process.id(), id);
    }

    #[test]
    fn lookup_after_register_finds_the_process() {
        let registry = ProcessRegistry::new();
        let t = Thread::new();
        let process = Process::new_for_test();
        let id = registry.register(process.clone(), &t).unwrap();
        let found = registry.lookup(id, &t).unwrap();
        assert!(Arc::ptr_eq(&found, &process));
    }

    #[test]
    fn unregister_then_lookup_reports_no_such_resource() {
        let registry = ProcessRegistry::new();
        let t = Thread::new();
        let process = Process::new_for_test();
        let id = registry.register(process, &t).unwrap();
        registry.unregister(id, &t).unwrap();
        assert_eq!(registry.lookup(id, &t).err(), Some(Status::NoSuchResource));
    }

    #[test]
    fn unregister_unknown_id_reports_no_such_resource() {
        let registry = ProcessRegistry::new();
        let t = Thread::new();
        assert_eq!(registry.unregister(42, &t).err(), Some(Status::NoSuchResource));
    }

    #[test]
    fn global_registry_is_a_singleton() {
        let a = global();
        let b = global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
