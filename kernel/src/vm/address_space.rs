/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Per-process address space (§3 "Address space", §4.D). Owns the free
//! virtual-region allocator, the table of inserted mappings, and a
//! [`FutexTable`]. The kernel half of the real page table is shared across
//! every address space and is out of this module's scope (arch-specific
//! bring-up, §1); what's modeled here is the user half's bookkeeping the
//! core needs to place mappings, resolve faults, and answer futex lookups.

use alloc::{collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicUsize, Ordering};

use machine::{
    address::{PhysAddr, VirtAddr, PAGE_SIZE},
    arch::{Arch, Current},
};

use crate::{
    error::Status,
    futex::{AddressResolver, FutexTable},
    refcount::RefCount,
    scheduler::Thread,
};

use super::{
    mapping::{Mapping, MappingFlags},
    FrameAllocator,
};

/// One leaf entry in the user half's (modeled) page table: either a fixed
/// physical frame, the on-demand sentinel, or — when the page falls inside
/// an inserted mapping — a reference to the owning [`Mapping`] plus the page
/// index within it.
#[derive(Clone)]
enum Leaf {
    Frame(PhysAddr),
    OnDemand,
    Mapped { mapping: Arc<Mapping>, page_index: usize },
}

/// A reserved (but not necessarily backed) virtual region.
struct Region {
    base: VirtAddr,
    pages: usize,
}

/// Simple first-fit free-region allocator over the user half.
struct RegionAllocator {
    user_base: VirtAddr,
    user_pages: usize,
    reserved: alloc::vec::Vec<Region>,
}

impl RegionAllocator {
    fn new(user_base: VirtAddr, user_pages: usize) -> Self {
        Self { user_base, user_pages, reserved: alloc::vec::Vec::new() }
    }

    fn allocate(&mut self, npages: usize, align_pow: u32) -> Result<VirtAddr, Status> {
        let align = PAGE_SIZE << align_pow;
        let mut candidate = self.user_base.align_up_page();
        loop {
            let aligned = VirtAddr::new(machine::mm::align_up(candidate.as_usize(), align));
            if aligned.as_usize() + npages * PAGE_SIZE > self.user_base.as_usize() + self.user_pages * PAGE_SIZE {
                return Err(Status::TemporaryOutage);
            }
            let overlap = self.reserved.iter().find(|r| {
                let r_start = r.base.as_usize();
                let r_end = r_start + r.pages * PAGE_SIZE;
                let c_start = aligned.as_usize();
                let c_end = c_start + npages * PAGE_SIZE;
                c_start < r_end && r_start < c_end
            });
            match overlap {
                None => {
                    self.reserved.push(Region { base: aligned, pages: npages });
                    return Ok(aligned);
                }
                Some(r) => candidate = VirtAddr::new(r.base.as_usize() + r.pages * PAGE_SIZE),
            }
        }
    }

    fn free(&mut self, vaddr: VirtAddr, npages: usize) -> Result<(), Status> {
        let position = self
            .reserved
            .iter()
            .position(|r| r.base == vaddr && r.pages == npages)
            .ok_or(Status::InvalidArgument)?;
        self.reserved.remove(position);
        Ok(())
    }
}

/// Outcome of resolving a page fault (§4.D "Faults").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The on-demand page was resolved; the faulting instruction may retry.
    Resolved,
    /// No mapping covers the faulting address: deliver a fault signal to
    /// the faulting thread.
    NoMapping,
}

/// Per-process virtual memory namespace (§3 "Address space").
pub struct AddressSpace {
    table: machine::sync::IrqSafeSpinLock<BTreeMap<usize, Leaf>>,
    regions: machine::sync::IrqSafeSpinLock<RegionAllocator>,
    mappings: machine::sync::IrqSafeSpinLock<alloc::vec::Vec<Arc<Mapping>>>,
    futex_table: FutexTable,
    refcount: RefCount,
    in_flight_faults: AtomicUsize,
}

impl AddressSpace {
    /// Create a new address space over the user half `[user_base, user_base
    /// + user_pages*PAGE_SIZE)`. The kernel half is conceptually shared
    /// (§4.D) but carries no state here, since real paging-table sharing is
    /// an arch concern.
    pub fn new(user_base: VirtAddr, user_pages: usize) -> Arc<Self> {
        Arc::new(Self {
            table: machine::sync::IrqSafeSpinLock::new(BTreeMap::new()),
            regions: machine::sync::IrqSafeSpinLock::new(RegionAllocator::new(user_base, user_pages)),
            mappings: machine::sync::IrqSafeSpinLock::new(alloc::vec::Vec::new()),
            futex_table: FutexTable::new(),
            refcount: RefCount::new(),
            in_flight_faults: AtomicUsize::new(0),
        })
    }

    /// This address space's futex table (§4.C).
    pub fn futex_table(&self) -> &FutexTable {
        &self.futex_table
    }

    fn page_index(vaddr: VirtAddr) -> usize {
        vaddr.as_usize() / PAGE_SIZE
    }

    /// `allocate_virtual(space, npages, align_pow, user?)`.
    pub fn allocate_virtual(&self, npages: usize, align_pow: u32) -> Result<VirtAddr, Status> {
        self.regions.lock().allocate(npages, align_pow)
    }

    /// `free_virtual(space, vaddr, npages, user?)`.
    pub fn free_virtual(&self, vaddr: VirtAddr, npages: usize) -> Result<(), Status> {
        self.regions.lock().free(vaddr, npages)?;
        let mut table = self.table.lock();
        for i in 0..npages {
            table.remove(&(Self::page_index(vaddr) + i));
        }
        Current::invalidate_tlb_for_range(vaddr, npages * PAGE_SIZE);
        Ok(())
    }

    /// `map_frame_fixed(space, phys, virt, npages, flags)`: write leaf
    /// entries directly, bypassing the mapping abstraction (used for early
    /// kernel mappings handed off by the bootstrap stage).
    pub fn map_frame_fixed(&self, phys: PhysAddr, virt: VirtAddr, npages: usize, _flags: MappingFlags) {
        let mut table = self.table.lock();
        for i in 0..npages {
            table.insert(Self::page_index(virt) + i, Leaf::Frame(phys + i * PAGE_SIZE));
        }
        Current::invalidate_tlb_for_range(virt, npages * PAGE_SIZE);
    }

    /// `insert_mapping(space, mapping, page_offset, npages, align_pow,
    /// flags) → vaddr`.
    pub fn insert_mapping(
        &self,
        mapping: Arc<Mapping>,
        page_offset: usize,
        npages: usize,
        align_pow: u32,
    ) -> Result<VirtAddr, Status> {
        if page_offset + npages > mapping.page_count() {
            return Err(Status::InvalidArgument);
        }
        let vaddr = self.regions.lock().allocate(npages, align_pow)?;
        let mut table = self.table.lock();
        for i in 0..npages {
            let leaf = if mapping.flags.contains(MappingFlags::PREBOUND) {
                Leaf::Mapped { mapping: mapping.clone(), page_index: page_offset + i }
            } else {
                Leaf::OnDemand
            };
            table.insert(Self::page_index(vaddr) + i, leaf);
        }
        drop(table);
        self.mappings.lock().push(mapping);
        Ok(vaddr)
    }

    /// `remove_mapping(space, vaddr)`: unmap and drop the mapping reference.
    pub fn remove_mapping(&self, vaddr: VirtAddr, allocator: &dyn FrameAllocator) -> Result<(), Status> {
        let index = Self::page_index(vaddr);
        let mut table = self.table.lock();
        let mut removed_mapping = None;
        let mut npages = 0;
        while let Some(leaf) = table.remove(&(index + npages)) {
            if let Leaf::Mapped { mapping, .. } = &leaf {
                removed_mapping.get_or_insert_with(|| mapping.clone());
            }
            npages += 1;
        }
        drop(table);
        Current::invalidate_tlb_for_range(vaddr, npages.max(1) * PAGE_SIZE);
        if let Some(mapping) = removed_mapping {
            self.mappings.lock().retain(|m| !Arc::ptr_eq(m, &mapping));
            super::mapping::release(&mapping, allocator)?;
        }
        Ok(())
    }

    /// `move_into_mapping(space, vaddr, npages, page_offset, mapping)`:
    /// convert a previously anonymous (on-demand or fixed) range into a
    /// mapping-backed range, without changing its virtual address.
    pub fn move_into_mapping(
        &self,
        vaddr: VirtAddr,
        npages: usize,
        page_offset: usize,
        mapping: Arc<Mapping>,
    ) -> Result<(), Status> {
        if page_offset + npages > mapping.page_count() {
            return Err(Status::InvalidArgument);
        }
        let mut table = self.table.lock();
        for i in 0..npages {
            table.insert(
                Self::page_index(vaddr) + i,
                Leaf::Mapped { mapping: mapping.clone(), page_index: page_offset + i },
            );
        }
        drop(table);
        self.mappings.lock().push(mapping);
        Current::invalidate_tlb_for_range(vaddr, npages * PAGE_SIZE);
        Ok(())
    }

    /// Resolve a page fault at `vaddr` (§4.D "Faults"): locate the mapping
    /// covering the address, resolve an on-demand entry on first touch, or
    /// report that no mapping covers it (the caller delivers a fault signal
    /// to the faulting thread; a kernel-space address is the caller's
    /// responsibility to have already turned into a panic).
    pub fn handle_fault(
        &self,
        allocator: &dyn FrameAllocator,
        vaddr: VirtAddr,
    ) -> Result<FaultOutcome, Status> {
        self.in_flight_faults.fetch_add(1, Ordering::AcqRel);
        let result = self.handle_fault_inner(allocator, vaddr);
        self.in_flight_faults.fetch_sub(1, Ordering::AcqRel);
        result
    }

    fn handle_fault_inner(&self, allocator: &dyn FrameAllocator, vaddr: VirtAddr) -> Result<FaultOutcome, Status> {
        let index = Self::page_index(vaddr);
        let mut table = self.table.lock();
        match table.get(&index) {
            Some(Leaf::OnDemand) => {
                let frame = allocator.allocate(1)?;
                table.insert(index, Leaf::Frame(frame));
                drop(table);
                Current::invalidate_tlb_for_address(vaddr);
                Ok(FaultOutcome::Resolved)
            }
            Some(Leaf::Mapped { mapping, page_index }) => {
                let frame = mapping.frame_for_page(*page_index)?;
                let _ = frame;
                Ok(FaultOutcome::Resolved)
            }
            Some(Leaf::Frame(_)) => Ok(FaultOutcome::Resolved),
            None => Ok(FaultOutcome::NoMapping),
        }
    }

    /// Whether a page fault is currently being resolved against this space —
    /// the address space is only destroyed once this is zero (§3 lifecycle).
    pub fn has_fault_in_flight(&self) -> bool {
        self.in_flight_faults.load(Ordering::Acquire) > 0
    }
}

impl AddressResolver for AddressSpace {
    fn resolve(&self, user_va: usize) -> Result<PhysAddr, Status> {
        let index = Self::page_index(VirtAddr::new(user_va));
        let offset = user_va % PAGE_SIZE;
        let table = self.table.lock();
        match table.get(&index) {
            Some(Leaf::Frame(phys)) => Ok(*phys + offset),
            Some(Leaf::Mapped { mapping, page_index }) => Ok(mapping.frame_for_page(*page_index)? + offset),
            _ => Err(Status::BadAddress),
        }
    }

    fn load_relaxed(&self, _user_va: usize) -> u64 {
        // Modeled address spaces don't back real memory a word can be read
        // from; futex tests exercise `FakeMemory` instead (see
        // `crate::futex::tests`). A real implementation reads the resolved
        // physical frame's contents here with `Ordering::Relaxed`.
        0
    }
}

/// A handle representing one thread's reference to its process's address
/// space, used only to keep the `Thread` type documented as owning one
/// (§3 "Thread" — "owning process (for user threads)").
pub struct AddressSpaceHandle {
    pub space: Arc<AddressSpace>,
    pub owner: Arc<Thread>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::mapping::test_support::BumpFrameAllocator;

    fn space() -> Arc<AddressSpace> {
        AddressSpace::new(VirtAddr::new(0x1000_0000), 4096)
    }

    #[test]
    fn allocate_virtual_does_not_overlap() {
        let space = space();
        let a = space.allocate_virtual(4, 0).unwrap();
        let b = space.allocate_virtual(4, 0).unwrap();
        assert_ne!(a, b);
        assert!(b.as_usize() >= a.as_usize() + 4 * PAGE_SIZE);
    }

    #[test]
    fn free_virtual_allows_reuse_of_the_range() {
        let space = space();
        let a = space.allocate_virtual(2, 0).unwrap();
        space.free_virtual(a, 2).unwrap();
        let b = space.allocate_virtual(2, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn on_demand_mapping_resolves_on_first_fault() {
        let space = space();
        let allocator = BumpFrameAllocator::new(0x40_0000);
        let mapping = Mapping::new_anonymous(&allocator, 2, MappingFlags::ZERO).unwrap();
        let vaddr = space.insert_mapping(mapping, 0, 2, 0).unwrap();
        assert_eq!(space.handle_fault(&allocator, vaddr).unwrap(), FaultOutcome::Resolved);
    }

    #[test]
    fn fault_on_unmapped_address_reports_no_mapping() {
        let space = space();
        let allocator = BumpFrameAllocator::new(0x50_0000);
        let vaddr = VirtAddr::new(0x1000_5000);
        assert_eq!(space.handle_fault(&allocator, vaddr).unwrap(), FaultOutcome::NoMapping);
    }

    #[test]
    fn remove_mapping_releases_its_reference() {
        let space = space();
        let allocator = BumpFrameAllocator::new(0x60_0000);
        let mapping = Mapping::new_anonymous(&allocator, 1, MappingFlags::empty()).unwrap();
        let vaddr = space.insert_mapping(mapping, 0, 1, 0).unwrap();
        space.remove_mapping(vaddr, &allocator).unwrap();
        assert_eq!(space.handle_fault(&allocator, vaddr).unwrap(), FaultOutcome::NoMapping);
    }
}
