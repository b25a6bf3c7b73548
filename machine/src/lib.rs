/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Architecture abstraction layer.
//!
//! `machine` carries nothing that belongs to a particular kernel subsystem.
//! It gives the `kernel` crate three things: typed addresses, the
//! sleep/spin synchronization primitives everything else is built from, and
//! the arch contract (`arch::Arch`) that §4.D and §5 of the core spec
//! require from the CPU/MMU — TLB invalidation, per-CPU storage, and the
//! outstanding-interrupt-disable counter.
//!
//! Real CPU bring-up (paging bit layout, IDT/GIC programming, timer
//! calibration) is out of scope here; only the contract the core calls
//! through is implemented, with thin per-arch bodies.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), feature(custom_test_frameworks))]
#![cfg_attr(not(test), test_runner(crate::tests::test_runner))]
#![cfg_attr(not(test), reexport_test_harness_main = "test_main")]
#![allow(clippy::upper_case_acronyms)]

pub mod address;
pub mod arch;
pub mod interrupts;
pub mod mm;
pub mod percpu;
pub mod sync;

#[cfg(not(test))]
pub mod tests;

/// Version string, reported through the boot console.
pub fn version() -> &'static str {
    concat!(env!("CARGO_PKG_NAME"), " version ", env!("CARGO_PKG_VERSION"))
}
