/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Virtual memory: page mappings, address spaces, and the on-demand/
//! prebound fault path (§4.D). Channel `mapping` attachments (§4.E) are
//! references into this module's [`mapping::Mapping`].
//!
//! The physical-frame allocator is an out-of-scope external collaborator
//! (§1); this module consumes it only through [`FrameAllocator`], the same
//! way the source takes a `pmm` allocation callback. Real paging-table bit
//! layout and the TLB-shootdown instructions are likewise external,
//! consumed only through `machine::arch::Arch`.

pub mod address_space;
pub mod mapping;

pub use address_space::{AddressSpace, FaultOutcome};
pub use mapping::{Mapping, MappingFlags, MappingKind, SharedMemory};

use machine::address::PhysAddr;

use crate::error::Status;

/// The physical-frame allocator contract this module consumes (§1). A real
/// implementation hands out frames from the boot memory map (§6.4); unit
/// tests supply a simple bump allocator (see `address_space::tests`).
pub trait FrameAllocator: Sync {
    /// Allocate `count` contiguous physical frames.
    fn allocate(&self, count: usize) -> Result<PhysAddr, Status>;

    /// Return `count` physical frames starting at `base` to the allocator.
    fn free(&self, base: PhysAddr, count: usize);
}
