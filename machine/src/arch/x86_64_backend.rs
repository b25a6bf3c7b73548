/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! x86_64 `Arch` body: `cli`/`sti`/`pushf`, `invlpg`, and the per-CPU count
//! read from the boot data table (§6.4) — no APIC/IDT programming lives
//! here, that belongs to the bootstrap stage this crate doesn't implement.

use core::{
    arch::{asm, global_asm},
    sync::atomic::{AtomicUsize, Ordering},
};

use x86_64::instructions::interrupts;

use super::{Arch, Context};
use crate::address::VirtAddr;

/// `Context::bytes` holds nothing but the saved stack pointer; the rest of
/// the machine state (callee-saved registers, the resume address) lives on
/// the thread's own stack, in the layout `ferro_switch_context`/
/// `ferro_thread_trampoline` below agree on.
impl Context {
    fn rsp(&self) -> u64 {
        u64::from_ne_bytes(self.bytes[0..8].try_into().unwrap())
    }

    fn from_rsp(rsp: u64) -> Self {
        let mut context = Context::zeroed();
        context.bytes[0..8].copy_from_slice(&rsp.to_ne_bytes());
        context
    }
}

extern "C" fn trampoline_shim(entry: extern "C" fn(usize) -> !, arg: usize) -> ! {
    entry(arg)
}

extern "C" {
    /// Save the six callee-saved GPRs and the current `rsp` to `*prev_rsp`,
    /// then load `rsp` from `*next_rsp` and pop back into those six
    /// registers before returning — into whichever context `next_rsp`
    /// belongs to.
    fn ferro_switch_context(prev_rsp: *mut u64, next_rsp: *const u64);
}

global_asm!(
    ".global ferro_switch_context",
    "ferro_switch_context:",
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "ret",
    ".global ferro_thread_trampoline",
    "ferro_thread_trampoline:",
    "pop rdi",
    "pop rsi",
    "call {trampoline_shim}",
    "ud2",
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

/// The x86_64 arch body.
pub struct X86_64;

impl Arch for X86_64 {
    fn disable_interrupts() -> bool {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        was_enabled
    }

    fn restore_interrupts(was_enabled: bool) {
        if was_enabled {
            interrupts::enable();
        }
    }

    fn interrupts_enabled() -> bool {
        interrupts::are_enabled()
    }

    fn invalidate_tlb_for_address(address: VirtAddr) {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(address.as_usize() as u64));
    }

    fn invalidate_tlb_for_range(address: VirtAddr, len: usize) {
        let start = address.align_down_page().as_usize();
        let end = (address + len).align_up_page().as_usize();
        let mut page = start;
        while page < end {
            x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(page as u64));
            page += crate::address::PAGE_SIZE;
        }
    }

    fn invalidate_tlb_for_active_space() {
        x86_64::instructions::tlb::flush_all();
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
        // Lay out `[entry, arg]` at the top of the stack so
        // `ferro_thread_trampoline`'s two pops recover them, then point the
        // saved `rsp` at that trampoline so the first `ferro_switch_context`
        // into this thread lands there instead of at a real caller.
        unsafe {
            let mut sp = stack_top.as_usize() as *mut u64;
            sp = sp.sub(1);
            sp.write(arg as u64);
            sp = sp.sub(1);
            sp.write(entry as usize as u64);
            sp = sp.sub(1);
            sp.write(ferro_thread_trampoline as usize as u64);
            // `ferro_switch_context`'s epilogue pops six callee-saved
            // registers before `ret`; reserve (zeroed) space for them below
            // the trampoline address so the first switch-in doesn't read
            // past the allocated stack.
            for _ in 0..6 {
                sp = sp.sub(1);
                sp.write(0);
            }
            Context::from_rsp(sp as u64)
        }
    }

    unsafe fn switch_context(prev: *mut Context, next: *const Context) {
        let mut prev_rsp = (*prev).rsp();
        ferro_switch_context(&mut prev_rsp, &(*next).rsp());
        *prev = Context::from_rsp(prev_rsp);
    }
}
