/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! The kernel heap backing every `alloc::{Vec, BTreeMap, Arc, Box}` in this
//! crate. Built the same way the teacher built its DMA pool — a
//! `buddy_alloc::BuddyAlloc` over a fixed region, guarded by a spinlock and
//! lazily carved up on first touch — generalized here from a DMA-only pool
//! into the crate-wide `#[global_allocator]`.

use core::alloc::{GlobalAlloc, Layout};

use buddy_alloc::{BuddyAlloc, BuddyAllocParam};
use once_cell::unsync::Lazy;

use machine::sync::SpinLock;

/// Bounds of the backing region, in the kernel's own address space. A real
/// bootstrap stage relocates these from the boot memory map (§6.4); fixed
/// here because that handoff is out of this crate's scope.
const HEAP_START: usize = 0x0040_0000;
const HEAP_END: usize = 0x0140_0000;
const LEAF_SIZE: usize = 64;

struct KernelHeap {
    inner: SpinLock<Lazy<BuddyAlloc<'static>>>,
}

// `Lazy<BuddyAlloc>` is not `Sync` on its own; every access to `inner` goes
// through the spinlock, which serializes it the same way the teacher's
// `sync::NullLock` forced `Sync` on its own DMA allocator.
unsafe impl Sync for KernelHeap {}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner.lock().malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.lock().free(ptr, layout.size());
    }
}

#[cfg_attr(not(test), global_allocator)]
static KERNEL_HEAP: KernelHeap = KernelHeap {
    inner: SpinLock::new(Lazy::new(|| unsafe {
        BuddyAlloc::new(BuddyAllocParam::new(HEAP_START as *const u8, HEAP_END - HEAP_START, LEAF_SIZE))
    })),
};
