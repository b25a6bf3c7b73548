/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! The Ferro core: the in-kernel IPC and concurrency fabric sitting above
//! `machine`'s arch abstraction. Threads block on waitqueues (§4.A), the
//! scheduler and futex table build sleep primitives over them (§4.B/§4.C),
//! the virtual memory module resolves page faults and TLB shootdown (§4.D),
//! channels move messages and attachments between threads (§4.E), and the
//! event monitor lets a thread wait on many of those at once (§4.F).
//!
//! UEFI bootstrap, the physical frame allocator, and real paging-table bit
//! layout are external collaborators this crate only reaches through a
//! trait boundary (`machine::arch::Arch`, `vm::FrameAllocator`) — none of
//! that bring-up code lives here.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), feature(custom_test_frameworks))]
#![cfg_attr(not(test), test_runner(crate::tests::test_runner))]
#![cfg_attr(not(test), reexport_test_harness_main = "test_main")]
#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::enum_variant_names)]
#![allow(clippy::nonstandard_macro_braces)] // https://github.com/shepmaster/snafu/issues/296

extern crate alloc;

pub mod channel;
pub mod config;
pub mod error;
pub mod futex;
pub mod handle;
pub mod heap;
pub mod klog;
pub mod monitor;
pub mod process;
pub mod refcount;
pub mod scheduler;
pub mod sync;
pub mod syscall;
pub mod timer;
pub mod vm;
pub mod waitqueue;

#[cfg(not(test))]
pub mod tests;

/// Version string, reported through the boot console.
pub fn version() -> &'static str {
    concat!(env!("CARGO_PKG_NAME"), " version ", env!("CARGO_PKG_VERSION"))
}
