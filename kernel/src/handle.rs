/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Opaque handle table, `libsys/objects.private.h`'s `sys_object`/
//! `sys_object_class` given a Rust shape: every syscall in §6.2 that
//! creates a kernel object (`channel_create_pair`, `server_create`,
//! `monitor_create`, `page_allocate_shared`, ...) hands userspace back a
//! `u64` handle instead of a raw pointer, and every syscall that consumes
//! one (`channel_send`, `server_accept`, `monitor_poll`, ...) looks it back
//! up here first.
//!
//! `sys_object_class` hand-rolls retain/release/destroy function pointers
//! per object kind in C; an [`Arc`] already does that bookkeeping, so this
//! table only owns one clone of the object's `Arc` per live handle and hands
//! out further clones on lookup.

use alloc::{collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicU64, Ordering};

use machine::sync::IrqSafeSpinLock;

use crate::{
    channel::{ChannelHalf, ChannelServer},
    error::Status,
    monitor::Monitor,
    vm::{AddressSpace, Mapping, SharedMemory},
};

/// A kernel object reachable through a handle, wrapping whichever concrete
/// type a given syscall group produces.
#[derive(Clone)]
pub enum Object {
    Channel(Arc<ChannelHalf>),
    Server(Arc<ChannelServer>),
    Monitor(Arc<Monitor>),
    Mapping(Arc<Mapping>),
    SharedMemory(Arc<SharedMemory>),
    AddressSpace(Arc<AddressSpace>),
}

impl Object {
    pub fn as_channel(&self) -> Result<Arc<ChannelHalf>, Status> {
        match self {
            Object::Channel(c) => Ok(c.clone()),
            _ => Err(Status::InvalidArgument),
        }
    }

    pub fn as_server(&self) -> Result<Arc<ChannelServer>, Status> {
        match self {
            Object::Server(s) => Ok(s.clone()),
            _ => Err(Status::InvalidArgument),
        }
    }

    pub fn as_monitor(&self) -> Result<Arc<Monitor>, Status> {
        match self {
            Object::Monitor(m) => Ok(m.clone()),
            _ => Err(Status::InvalidArgument),
        }
    }

    pub fn as_mapping(&self) -> Result<Arc<Mapping>, Status> {
        match self {
            Object::Mapping(m) => Ok(m.clone()),
            _ => Err(Status::InvalidArgument),
        }
    }

    pub fn as_shared_memory(&self) -> Result<Arc<SharedMemory>, Status> {
        match self {
            Object::SharedMemory(s) => Ok(s.clone()),
            _ => Err(Status::InvalidArgument),
        }
    }
}

/// Per-process table mapping handle numbers to objects. One of these lives
/// in every [`crate::process::Process`].
pub struct HandleTable {
    objects: IrqSafeSpinLock<BTreeMap<u64, Object>>,
    next: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self { objects: IrqSafeSpinLock::new(BTreeMap::new()), next: AtomicU64::new(1) }
    }

    /// Insert a freshly-created object and return the handle naming it.
    pub fn insert(&self, object: Object) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.objects.lock().insert(handle, object);
        handle
    }

    /// Look up a handle without consuming it, the shape every syscall that
    /// merely uses an object (rather than closing it) wants.
    pub fn get(&self, handle: u64) -> Result<Object, Status> {
        self.objects.lock().get(&handle).cloned().ok_or(Status::NoSuchResource)
    }

    /// Remove and return the object a handle names, for syscalls that close
    /// a handle (`channel_close`, `page_close_shared`, ...).
    pub fn remove(&self, handle: u64) -> Result<Object, Status> {
        self.objects.lock().remove(&handle).ok_or(Status::NoSuchResource)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHalf as Half;

    #[test]
    fn insert_then_get_round_trips_the_object() {
        let table = HandleTable::new();
        let (a, _b) = Half::new_pair(4);
        let handle = table.insert(Object::Channel(a));
        assert!(table.get(handle).unwrap().as_channel().is_ok());
    }

    #[test]
    fn get_on_unknown_handle_is_no_such_resource() {
        let table = HandleTable::new();
        assert_eq!(table.get(9999).err(), Some(Status::NoSuchResource));
    }

    #[test]
    fn remove_consumes_the_handle() {
        let table = HandleTable::new();
        let (a, _b) = Half::new_pair(4);
        let handle = table.insert(Object::Channel(a));
        assert!(table.remove(handle).is_ok());
        assert_eq!(table.get(handle).err(), Some(Status::NoSuchResource));
    }

    #[test]
    fn wrong_accessor_reports_invalid_argument() {
        let table = HandleTable::new();
        let server = ChannelServer::new();
        let handle = table.insert(Object::Server(server));
        assert_eq!(table.get(handle).unwrap().as_channel().err(), Some(Status::InvalidArgument));
    }
}
