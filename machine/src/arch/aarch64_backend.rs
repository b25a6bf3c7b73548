/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! aarch64 `Arch` body: DAIF masking via `cortex-a`'s register wrappers and
//! `tlbi`/`dsb`/`isb` for TLB maintenance. GIC/exception-vector programming
//! is out of scope here.

use core::{
    arch::{asm, global_asm},
    sync::atomic::{AtomicUsize, Ordering},
};

use cortex_a::registers::DAIF;
use tock_registers::interfaces::{Readable, Writeable};

use super::{Arch, Context};
use crate::address::VirtAddr;

/// `Context::bytes` holds only the saved stack pointer; the AAPCS64
/// callee-saved registers (x19-x28, fp, lr) live on the thread's own stack,
/// in the layout `ferro_switch_context`/`ferro_thread_trampoline` below
/// agree on — mirroring the x86_64 backend's convention.
impl Context {
    fn sp(&self) -> u64 {
        u64::from_ne_bytes(self.bytes[0..8].try_into().unwrap())
    }

    fn from_sp(sp: u64) -> Self {
        let mut context = Context::zeroed();
        context.bytes[0..8].copy_from_slice(&sp.to_ne_bytes());
        context
    }
}

extern "C" fn trampoline_shim(entry: extern "C" fn(usize) -> !, arg: usize) -> ! {
    entry(arg)
}

extern "C" {
    /// Save x19-x28, fp and lr plus the current `sp` to `*prev_sp`, then load
    /// `sp` from `*next_sp` and restore those registers before returning —
    /// into whichever context `next_sp` belongs to.
    fn ferro_switch_context(prev_sp: *mut u64, next_sp: *const u64);
}

global_asm!(
    ".global ferro_switch_context",
    "ferro_switch_context:",
    "stp x19, x20, [sp, #-96]!",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp fp, lr, [sp, #80]",
    "mov x2, sp",
    "str x2, [x0]",
    "ldr x2, [x1]",
    "mov sp, x2",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp fp, lr, [sp, #80]",
    "ldp x19, x20, [sp], #96",
    "ret",
    ".global ferro_thread_trampoline",
    "ferro_thread_trampoline:",
    "ldp x0, x1, [sp], #16",
    "bl {trampoline_shim}",
    "brk #0",
    trampoline_shim = sym trampoline_shim,
);

extern "C" {
    fn ferro_thread_trampoline();
}

static ONLINE_CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Called once by the bootstrap stage after it has brought up secondary
/// cores, so [`Arch::cpu_count`] reports the real topology.
pub fn set_cpu_count(count: usize) {
    ONLINE_CPU_COUNT.store(count, Ordering::Release);
}

const DAIF_IRQ_BIT: u64 = 1 << 7;

/// The aarch64 arch body.
pub struct AArch64;

impl Arch for AArch64 {
    fn disable_interrupts() -> bool {
        let prior = DAIF.get();
        unsafe {
            asm!("msr daifset, #2", options(nomem, nostack));
        }
        prior & DAIF_IRQ_BIT == 0
    }

    fn restore_interrupts(was_enabled: bool) {
        if was_enabled {
            unsafe {
                asm!("msr daifclr, #2", options(nomem, nostack));
            }
        }
    }

    fn interrupts_enabled() -> bool {
        DAIF.get() & DAIF_IRQ_BIT == 0
    }

    fn invalidate_tlb_for_address(address: VirtAddr) {
        let page_number = address.as_usize() >> 12;
        unsafe {
            asm!(
                "dsb ishst",
                "tlbi vae1is, {0}",
                "dsb ish",
                "isb",
                in(reg) page_number,
                options(nostack),
            );
        }
    }

    fn invalidate_tlb_for_range(address: VirtAddr, len: usize) {
        let start = address.align_down_page().as_usize();
        let end = (address + len).align_up_page().as_usize();
        let mut page = start;
        while page < end {
            Self::invalidate_tlb_for_address(VirtAddr::new(page));
            page += crate::address::PAGE_SIZE;
        }
    }

    fn invalidate_tlb_for_active_space() {
        unsafe {
            asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb", options(nostack));
        }
    }

    fn cpu_count() -> usize {
        ONLINE_CPU_COUNT.load(Ordering::Acquire)
    }

    fn current_cpu_id() -> usize {
        crate::percpu::current_cpu_id()
    }

    fn broadcast_work(f: fn()) {
        crate::percpu::broadcast_ipi(f);
    }

    fn new_context(entry: extern "C" fn(usize) -> !, arg: usize, stack_top: VirtAddr) -> Context {
        // `ferro_switch_context` restores 10 callee-saved GPRs (x19-x28)
        // plus fp/lr from a 96-byte frame before returning via `lr`; build
        // that frame with `lr` pointing at the trampoline, followed by
        // `[entry, arg]` for the trampoline's own two-register pop.
        unsafe {
            let top = stack_top.as_usize() as *mut u64;
            let frame = top.sub(14); // 96 bytes of saved regs + 16 bytes of (entry, arg)
            for i in 0..10 {
                frame.add(i).write(0);
            }
            frame.add(10).write(0); // fp
            frame.add(11).write(ferro_thread_trampoline as usize as u64); // lr
            frame.add(12).write(entry as usize as u64);
            frame.add(13).write(arg as u64);
            Context::from_sp(frame as u64)
        }
    }

    unsafe fn switch_context(prev: *mut Context, next: *const Context) {
        let mut prev_sp = (*prev).sp();
        ferro_switch_context(&mut prev_sp, &(*next).sp());
        *prev = Context::from_sp(prev_sp);
    }
}
