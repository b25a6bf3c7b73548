/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! A single-core, host-testable `Arch` body. Selected whenever neither
//! `x86_64` nor `aarch64` is enabled (in particular, under `cargo test`),
//! so the pure logic in `kernel` can be exercised without real hardware.

use core::sync::atomic::{AtomicBool, Ordering};

use super::{Arch, Context};
use crate::address::VirtAddr;

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Single-core stand-in `Arch` implementation.
pub struct Stub;

impl Arch for Stub {
    fn disable_interrupts() -> bool {
        INTERRUPTS_ENABLED.swap(false, Ordering::AcqRel)
    }

    fn restore_interrupts(was_enabled: bool) {
        INTERRUPTS_ENABLED.store(was_enabled, Ordering::Release);
    }

    fn interrupts_enabled() -> bool {
        INTERRUPTS_ENABLED.load(Ordering::Acquire)
    }

    fn invalidate_tlb_for_address(_address: VirtAddr) {}

    fn invalidate_tlb_for_range(_address: VirtAddr, _len: usize) {}

    fn invalidate_tlb_for_active_space() {}

    fn cpu_count() -> usize {
        1
    }

    fn current_cpu_id() -> usize {
        0
    }

    fn broadcast_work(_f: fn()) {}

    fn new_context(_entry: extern "C" fn(usize) -> !, _arg: usize, _stack_top: VirtAddr) -> Context {
        // Host tests exercise scheduler bookkeeping, not real stack
        // transfer; nothing reads these bytes on this backend.
        Context::zeroed()
    }

    unsafe fn switch_context(_prev: *mut Context, _next: *const Context) {}
}
