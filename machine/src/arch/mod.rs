/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! The arch contract.
//!
//! `kernel` never calls a raw `cli`/`sti` or TLB-invalidation instruction
//! itself; it goes through [`Arch`]. Two bodies are provided, selected by the
//! `x86_64`/`aarch64` feature, both thin: they carry only the instructions
//! the core's correctness depends on (§4.D "TLB consistency", the
//! interrupt-disable primitive §5 is built on), not general CPU bring-up.

use crate::address::VirtAddr;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "x86_64", not(test)))] {
        mod x86_64_backend;
        pub use x86_64_backend::X86_64 as Current;
    } else if #[cfg(all(feature = "aarch64", not(test)))] {
        mod aarch64_backend;
        pub use aarch64_backend::AArch64 as Current;
    } else {
        pub use stub::Stub as Current;
    }
}

/// Raw (non-nesting) interrupt control and TLB maintenance the CPU provides.
///
/// Nesting is layered on top by [`crate::interrupts::InterruptGuard`]; an
/// `Arch` impl only has to reflect the hardware's single on/off bit.
pub trait Arch {
    /// Disable interrupts on the calling core, returning whether they were
    /// enabled beforehand (so the caller can restore the prior state).
    fn disable_interrupts() -> bool;

    /// Restore the calling core's interrupt-enabled state to `was_enabled`.
    fn restore_interrupts(was_enabled: bool);

    /// Whether interrupts are currently enabled on the calling core.
    fn interrupts_enabled() -> bool;

    /// Invalidate any cached translation for `address` in the active
    /// address space, on this core only.
    fn invalidate_tlb_for_address(address: VirtAddr);

    /// Invalidate cached translations for `[address, address + len)` in the
    /// active address space, on this core only.
    fn invalidate_tlb_for_range(address: VirtAddr, len: usize);

    /// Invalidate every cached translation for the active address space on
    /// this core (used when a mapping operation touches more pages than it's
    /// worth invalidating individually).
    fn invalidate_tlb_for_active_space();

    /// Number of logical CPUs known to the machine.
    fn cpu_count() -> usize;

    /// The index of the CPU executing the call, in `0..cpu_count()`.
    fn current_cpu_id() -> usize;

    /// Run `f` on every other online CPU and wait for all of them to
    /// complete it before returning — the TLB-shootdown IPI primitive
    /// `invalidate_tlb_for_range` relies on to keep other cores' TLBs
    /// coherent after an unmap.
    fn broadcast_work(f: fn());

    /// Build the initial saved context for a brand new thread: when first
    /// switched to, it must resume as if `entry(arg)` had just been called
    /// with `stack_top` as its stack.
    fn new_context(entry: extern "C" fn(usize) -> !, arg: usize, stack_top: VirtAddr) -> Context;

    /// Save the calling thread's machine state into `*prev`, then load and
    /// resume `*next`. Returns once some other core switches back into
    /// `*prev`.
    ///
    /// # Safety
    /// `prev` and `next` must be valid, non-aliasing, and `next` must have
    /// been produced by [`Arch::new_context`] or by a prior `switch_context`
    /// save.
    unsafe fn switch_context(prev: *mut Context, next: *const Context);
}

/// Opaque saved machine state for one thread (general-purpose registers,
/// stack pointer, program counter; SIMD/FP state where the ABI requires it
/// be preserved across a switch). Only [`Arch`] impls construct or interpret
/// the contents.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct Context {
    /// Opaque register save area, sized generously for either backend's ABI.
    pub(crate) bytes: [u8; 512],
}

impl Context {
    /// An all-zero context. Never valid to switch into directly; callers
    /// build a real one with [`Arch::new_context`].
    pub const fn zeroed() -> Self {
        Self { bytes: [0; 512] }
    }
}

mod stub;

#[cfg(test)]
pub use stub::Stub as TestArch;
