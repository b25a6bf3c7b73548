/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Per-CPU storage, `kernel-include/ferro/core/per-cpu.h` and `cpu.h`'s
//! `fper_cpu_register`/`fper_cpu_lookup` given a typed, statically-sized Rust
//! shape instead of a registration table of raw pointers.
//!
//! The scheduler keeps one run queue per CPU (§4.B), the futex table shards
//! its buckets, and TLB shootdown (§4.D) needs to know which core it is
//! running on; all three go through [`PerCpu`] / [`current_cpu_id`] rather
//! than touching a raw per-arch register directly.

use core::cell::UnsafeCell;

/// Upper bound on the number of logical CPUs this build supports. Chosen
/// generously; `kernel::config` reports the real count discovered at boot
/// through `Arch::cpu_count`.
pub const MAX_CPUS: usize = 256;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "x86_64", not(test)))] {
        /// Read this core's id out of the `GS`-relative per-CPU block the
        /// bootstrap stage installs before handing control to the core
        /// (outside this crate's scope — see `machine::arch::x86_64_backend`).
        #[inline(always)]
        pub fn current_cpu_id() -> usize {
            let id: u64;
            unsafe {
                core::arch::asm!("mov {0}, gs:[0]", out(reg) id, options(nomem, nostack, pure));
            }
            id as usize
        }
    } else if #[cfg(all(feature = "aarch64", not(test)))] {
        /// Read this core's id out of `TPIDR_EL1`, which the bootstrap stage
        /// sets to the core's index before entering the scheduler.
        #[inline(always)]
        pub fn current_cpu_id() -> usize {
            let id: u64;
            unsafe {
                core::arch::asm!("mrs {0}, tpidr_el1", out(reg) id, options(nomem, nostack, pure));
            }
            id as usize
        }
    } else {
        /// Single-core stand-in used for host tests.
        #[inline(always)]
        pub fn current_cpu_id() -> usize {
            0
        }
    }
}

/// Run `f` on every other online CPU via an inter-processor interrupt and
/// wait for all of them to complete it. The real shootdown IPI is installed
/// by the bootstrap stage; on the single-core test body there is nothing
/// else to run it on.
pub fn broadcast_ipi(f: fn()) {
    cfg_if::cfg_if! {
        if #[cfg(not(test))] {
            unsafe { BROADCAST_HANDLER.map(|handler| handler(f)) };
        } else {
            let _ = f;
        }
    }
}

#[cfg(not(test))]
static mut BROADCAST_HANDLER: Option<fn(fn())> = None;

/// Installed once by the bootstrap stage once secondary cores are up and an
/// IPI vector exists to drive them.
#[cfg(not(test))]
pub fn set_broadcast_handler(handler: fn(fn())) {
    unsafe {
        BROADCAST_HANDLER = Some(handler);
    }
}

/// One instance of `T` per CPU, indexed by [`current_cpu_id`].
///
/// `T` must be `Sync`-free by construction: each core only ever reaches its
/// own slot, so `PerCpu` itself provides the `Sync` bound without requiring
/// one from `T`.
pub struct PerCpu<T> {
    slots: UnsafeCell<[T; MAX_CPUS]>,
}

unsafe impl<T> Sync for PerCpu<T> {}

impl<T: Copy> PerCpu<T> {
    /// Create an instance with every slot initialized to `init`.
    pub const fn new(init: T) -> Self {
        Self { slots: UnsafeCell::new([init; MAX_CPUS]) }
    }
}

impl<T> PerCpu<T> {
    /// Access the calling core's slot.
    ///
    /// # Safety
    /// The caller must not call this reentrantly in a way that would create
    /// two live `&mut` references to the same slot (e.g. from within an
    /// interrupt handler that preempted another access on the same core
    /// without masking interrupts first).
    #[allow(clippy::mut_from_ref)]
    pub fn get(&self) -> &mut T {
        let id = current_cpu_id();
        assert!(id < MAX_CPUS, "cpu id {id} exceeds MAX_CPUS");
        unsafe { &mut (*self.slots.get())[id] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_cpu_id_is_zero_on_stub() {
        assert_eq!(current_cpu_id(), 0);
    }

    #[test]
    fn percpu_slot_is_mutable_and_isolated_by_cpu() {
        let cell = PerCpu::new(0u32);
        *cell.get() += 1;
        assert_eq!(*cell.get(), 1);
    }
}
