/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! Syscall dispatch (§6.1/§6.2), `original_source/kernel/kernel-include/
//! ferro/userspace/syscalls.h`'s `fsyscall_table`/`fsyscall_table_handler`
//! given a typed Rust shape.
//!
//! The real ABI (syscall number in a register, up to 6 integer arguments,
//! `rcx`/`r11`-style clobber rules, no floating point) is an arch/trampoline
//! concern external to this crate (§1); what lives here is the table lookup
//! and per-syscall bodies `fsyscall_table_handler` dispatches to once the
//! trampoline has already moved arguments into normal Rust call position.
//! Handler 0 is reserved for lookup errors, exactly as `syscalls.h`
//! documents, and is never present in [`Table`]'s handler list.

use alloc::sync::Arc;
use core::time::Duration;

use crate::{
    channel::{ChannelHalf, ChannelServer},
    error::Status,
    futex::DeathFutex,
    handle::{HandleTable, Object},
    monitor::{self, Monitor},
    process::Process,
    scheduler::{Thread, TimeoutType, SCHEDULER},
    sync::BlockMode,
    vm::{Mapping, MappingFlags, SharedMemory},
};
use machine::address::VirtAddr;

/// A syscall's raw arguments, already moved into register-independent
/// position by the trampoline. Unused trailing slots are zero.
pub type Args = [u64; 6];

/// Every syscall returns a single `u64` result value alongside the
/// `ferr_t`-equivalent [`Status`] — never a pair, never a float, matching
/// the ABI note in `syscalls.h`.
pub type HandlerResult = Result<u64, Status>;

type Handler = fn(&Arc<Process>, &Arc<Thread>, Args) -> HandlerResult;

/// Syscall numbers start at 1; 0 is reserved for lookup errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Number {
    ThreadSuspend = 1,
    ThreadYield = 2,
    ThreadKill = 3,
    ProcessId = 4,
    PageAllocate = 5,
    PageAllocateShared = 6,
    PageMapShared = 7,
    PageCloseShared = 8,
    FutexWait = 9,
    FutexWake = 10,
    ChannelCreatePair = 11,
    ChannelSend = 12,
    ChannelReceive = 13,
    ChannelClose = 14,
    ServerCreate = 15,
    ServerAccept = 16,
    MonitorCreate = 17,
    MonitorItemCreateChannel = 18,
    MonitorPoll = 19,
    FutexAssociate = 20,
    PageFree = 21,
    PageBindShared = 22,
}

impl Number {
    fn from_u64(value: u64) -> Option<Self> {
        use Number::*;
        Some(match value {
            1 => ThreadSuspend,
            2 => ThreadYield,
            3 => ThreadKill,
            4 => ProcessId,
            5 => PageAllocate,
            6 => PageAllocateShared,
            7 => PageMapShared,
            8 => PageCloseShared,
            9 => FutexWait,
            10 => FutexWake,
            11 => ChannelCreatePair,
            12 => ChannelSend,
            13 => ChannelReceive,
            14 => ChannelClose,
            15 => ServerCreate,
            16 => ServerAccept,
            17 => MonitorCreate,
            18 => MonitorItemCreateChannel,
            19 => MonitorPoll,
            20 => FutexAssociate,
            21 => PageFree,
            22 => PageBindShared,
            _ => return None,
        })
    }

    fn handler(self) -> Handler {
        use Number::*;
        match self {
            ThreadSuspend => thread_suspend,
            ThreadYield => thread_yield,
            ThreadKill => thread_kill,
            ProcessId => process_id,
            PageAllocate => page_allocate,
            PageAllocateShared => page_allocate_shared,
            PageMapShared => page_map_shared,
            PageCloseShared => page_close_shared,
            FutexWait => futex_wait,
            FutexWake => futex_wake,
            ChannelCreatePair => channel_create_pair,
            ChannelSend => channel_send,
            ChannelReceive => channel_receive,
            ChannelClose => channel_close,
            ServerCreate => server_create,
            ServerAccept => server_accept,
            MonitorCreate => monitor_create,
            MonitorItemCreateChannel => monitor_item_create_channel,
            MonitorPoll => monitor_poll,
            FutexAssociate => futex_associate,
            PageFree => page_free,
            PageBindShared => page_bind_shared,
        }
    }
}

/// `fsyscall_table_handler`: look a syscall number up and dispatch to its
/// handler. A number that isn't in [`Number`] is the "lookup error" case
/// `syscalls.h` reserves entry 0 for.
pub fn dispatch(number: u64, process: &Arc<Process>, thread: &Arc<Thread>, args: Args) -> HandlerResult {
    match Number::from_u64(number) {
        Some(number) => number.handler()(process, thread, args),
        None => Err(Status::NoSuchResource),
    }
}

fn thread_suspend(_process: &Arc<Process>, thread: &Arc<Thread>, _args: Args) -> HandlerResult {
    SCHEDULER.suspend(thread, false)?;
    Ok(0)
}

fn thread_yield(_process: &Arc<Process>, thread: &Arc<Thread>, _args: Args) -> HandlerResult {
    // No separate run-queue rotation exists to call into (§4.B's run queue
    // is FIFO already); yielding is equivalent to suspending and
    // immediately becoming runnable again, left to the scheduler loop.
    let _ = thread;
    Ok(0)
}

fn thread_kill(_process: &Arc<Process>, thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let handle = args[0];
    let target = process_thread_lookup(thread, handle)?;
    SCHEDULER.kill(&target);
    Ok(0)
}

// Threads aren't currently handed out through the process handle table (no
// syscall here creates one directly); `thread_kill`/friends resolve the
// special handle `0` to the calling thread itself until `thread_create`'s
// stack/trampoline plumbing (external, §1) exists to mint new ones.
fn process_thread_lookup(thread: &Arc<Thread>, handle: u64) -> Result<Arc<Thread>, Status> {
    if handle == 0 {
        Ok(thread.clone())
    } else {
        Err(Status::NoSuchResource)
    }
}

fn process_id(process: &Arc<Process>, _thread: &Arc<Thread>, _args: Args) -> HandlerResult {
    Ok(process.id())
}

fn page_allocate(process: &Arc<Process>, _thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let count = args[0] as usize;
    let flags = MappingFlags::from_bits_truncate(args[1] as u32);
    let mapping = Mapping::new_anonymous(&*process.frame_allocator, count, flags)?;
    Ok(process.handles.insert(Object::Mapping(mapping)))
}

fn page_allocate_shared(process: &Arc<Process>, _thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let count = args[0] as usize;
    let descriptor = SharedMemory::allocate(&*process.frame_allocator, count)?;
    Ok(process.handles.insert(Object::SharedMemory(descriptor)))
}

fn page_map_shared(process: &Arc<Process>, _thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let shared_handle = args[0];
    let page_offset = args[1] as usize;
    let count = args[2] as usize;
    let flags = MappingFlags::from_bits_truncate(args[3] as u32);
    let descriptor = process.handles.get(shared_handle)?.as_shared_memory()?;
    let mapping = Mapping::new_bound(descriptor, page_offset, count, flags)?;
    Ok(process.handles.insert(Object::Mapping(mapping)))
}

fn page_close_shared(process: &Arc<Process>, _thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let handle = args[0];
    process.handles.remove(handle)?;
    Ok(0)
}

fn page_free(process: &Arc<Process>, _thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let vaddr = VirtAddr::new(args[0] as usize);
    let npages = args[1] as usize;
    process.address_space.free_virtual(vaddr, npages)?;
    Ok(0)
}

fn page_bind_shared(process: &Arc<Process>, _thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let target_handle = args[0];
    let source_handle = args[1];
    let count = args[2] as usize;
    let source_offset = args[3] as usize;
    let flags = MappingFlags::from_bits_truncate(args[4] as u32);
    let target = process.handles.get(target_handle)?.as_mapping()?;
    let source = process.handles.get(source_handle)?.as_mapping()?;
    target.bind_indirect(count, source, source_offset, flags)?;
    Ok(0)
}

fn futex_wait(process: &Arc<Process>, thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let user_va = args[0] as usize;
    let channel = args[1];
    let expected = args[2];
    let timeout_ns = args[3];
    let timeout_type = args[4];
    let timeout = match timeout_ns {
        0 => None,
        ns => Some((
            Duration::from_nanos(ns),
            if timeout_type == 0 { TimeoutType::Relative } else { TimeoutType::AbsoluteMonotonic },
        )),
    };
    process
        .address_space
        .futex_table()
        .wait(&*process.address_space, thread, user_va, channel, expected, timeout, false)?;
    Ok(0)
}

fn futex_wake(process: &Arc<Process>, _thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let user_va = args[0] as usize;
    let channel = args[1];
    let count = args[2] as usize;
    process.address_space.futex_table().wake(&*process.address_space, user_va, channel, count)?;
    Ok(0)
}

fn futex_associate(process: &Arc<Process>, thread: &Arc<Thread>, args: Args) -> HandlerResult {
    use crate::futex::AddressResolver;

    let user_va = args[0] as usize;
    let channel = args[1];
    let value = args[2];
    let address = process.address_space.resolve(user_va)?;
    thread.set_death_futex(process.address_space.clone(), DeathFutex { address, channel, value });
    Ok(0)
}

fn channel_create_pair(process: &Arc<Process>, _thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let capacity = if args[0] == 0 { 32 } else { args[0] as usize };
    let (a, b) = ChannelHalf::new_pair(capacity);
    let first = process.handles.insert(Object::Channel(a));
    let second = process.handles.insert(Object::Channel(b));
    // Two handles don't fit in one `u64` result; pack them the way a real
    // ABI would pass a second out-parameter, here returned as
    // `first | (second << 32)` since handle ids here never exceed 32 bits.
    Ok(first | (second << 32))
}

// `channel_send`/`channel_receive` here move a single body byte in an
// argument register rather than a full `channel::wire` message: the real
// ABI passes the wire-format buffer by userspace pointer (§6.3) and decodes
// it with `wire::decode` after a copy-in the trampoline/address-space layer
// performs, but this crate's `AddressSpace` doesn't back real memory a copy
// could read from (see its `load_relaxed` note). The `wire` module is
// exercised directly against byte buffers in its own tests instead.

fn channel_send(process: &Arc<Process>, thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let handle = args[0];
    let mode = block_mode(args[1]);
    let byte = args[2] as u8;
    let half = process.handles.get(handle)?.as_channel()?;
    let message = crate::channel::Message::new(alloc::vec![byte], alloc::vec::Vec::new());
    half.send(thread, mode, message, false)?;
    Ok(0)
}

fn channel_receive(process: &Arc<Process>, thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let handle = args[0];
    let mode = block_mode(args[1]);
    let half = process.handles.get(handle)?.as_channel()?;
    let message = half.receive(thread, mode)?;
    Ok(message.body.first().copied().unwrap_or(0) as u64)
}

fn channel_close(process: &Arc<Process>, thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let handle = args[0];
    let half = process.handles.remove(handle)?.as_channel()?;
    half.close(thread)?;
    Ok(0)
}

fn server_create(process: &Arc<Process>, _thread: &Arc<Thread>, _args: Args) -> HandlerResult {
    let server = ChannelServer::new();
    Ok(process.handles.insert(Object::Server(server)))
}

fn server_accept(process: &Arc<Process>, thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let handle = args[0];
    let mode = block_mode(args[1]);
    let server = process.handles.get(handle)?.as_server()?;
    let half = server.accept(thread, mode)?;
    Ok(process.handles.insert(Object::Channel(half)))
}

fn monitor_create(process: &Arc<Process>, _thread: &Arc<Thread>, _args: Args) -> HandlerResult {
    let monitor = Monitor::new();
    Ok(process.handles.insert(Object::Monitor(monitor)))
}

fn monitor_item_create_channel(process: &Arc<Process>, thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let monitor_handle = args[0];
    let channel_handle = args[1];
    let flags = monitor::ItemFlags::from_bits_truncate(args[2] as u32);
    let monitored_events = args[3];
    let ctx = args[4];
    let monitor = process.handles.get(monitor_handle)?.as_monitor()?;
    let channel = process.handles.get(channel_handle)?.as_channel()?;
    let item = monitor.add_item(thread, monitor::Target::Channel(channel), flags, monitored_events, ctx);
    Ok(item.id())
}

fn monitor_poll(process: &Arc<Process>, thread: &Arc<Thread>, args: Args) -> HandlerResult {
    let monitor_handle = args[0];
    let max = args[1] as usize;
    let monitor = process.handles.get(monitor_handle)?.as_monitor()?;
    let ready = monitor.poll(thread, max)?;
    Ok(ready.len() as u64)
}

fn block_mode(raw: u64) -> BlockMode {
    match raw {
        0 => BlockMode::NonBlocking,
        1 => BlockMode::Blocking,
        _ => BlockMode::Interruptible,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;

    fn test_process() -> (Arc<Process>, Arc<Thread>) {
        (Process::new_for_test(), Thread::new())
    }

    #[test]
    fn unknown_syscall_number_is_no_such_resource() {
        let (process, thread) = test_process();
        assert_eq!(dispatch(0, &process, &thread, [0; 6]).err(), Some(Status::NoSuchResource));
        assert_eq!(dispatch(9999, &process, &thread, [0; 6]).err(), Some(Status::NoSuchResource));
    }

    #[test]
    fn process_id_reports_the_registered_id() {
        let (process, thread) = test_process();
        let registry = crate::process::global();
        let id = registry.register(process.clone(), &thread).unwrap();
        assert_eq!(dispatch(Number::ProcessId as u64, &process, &thread, [0; 6]).unwrap(), id);
    }

    #[test]
    fn channel_round_trip_through_syscalls() {
        let (process, thread) = test_process();
        let packed = dispatch(Number::ChannelCreatePair as u64, &process, &thread, [32, 0, 0, 0, 0, 0]).unwrap();
        let first = packed & 0xffff_ffff;
        let second = packed >> 32;

        let mut args = [0u64; 6];
        args[0] = first;
        args[1] = 1; // blocking
        args[2] = 42;
        dispatch(Number::ChannelSend as u64, &process, &thread, args).unwrap();

        let mut recv_args = [0u64; 6];
        recv_args[0] = second;
        recv_args[1] = 1;
        let received = dispatch(Number::ChannelReceive as u64, &process, &thread, recv_args).unwrap();
        assert_eq!(received, 42);
    }

    #[test]
    fn server_accept_without_a_pending_connection_would_block() {
        let (process, thread) = test_process();
        let server_handle = dispatch(Number::ServerCreate as u64, &process, &thread, [0; 6]).unwrap();
        let mut args = [0u64; 6];
        args[0] = server_handle;
        args[1] = 0; // non-blocking
        assert_eq!(dispatch(Number::ServerAccept as u64, &process, &thread, args).err(), Some(Status::WouldBlock));
    }

    #[test]
    fn monitor_poll_reports_an_item_triggered_by_channel_close() {
        let (process, thread) = test_process();
        let monitor_handle = dispatch(Number::MonitorCreate as u64, &process, &thread, [0; 6]).unwrap();
        let packed = dispatch(Number::ChannelCreatePair as u64, &process, &thread, [32, 0, 0, 0, 0, 0]).unwrap();
        let first = packed & 0xffff_ffff;

        let mut item_args = [0u64; 6];
        item_args[0] = monitor_handle;
        item_args[1] = first;
        item_args[2] = monitor::ItemFlags::ENABLED.bits() as u64;
        item_args[3] = monitor::events::CHANNEL_CLOSE;
        dispatch(Number::MonitorItemCreateChannel as u64, &process, &thread, item_args).unwrap();

        let mut close_args = [0u64; 6];
        close_args[0] = first;
        dispatch(Number::ChannelClose as u64, &process, &thread, close_args).unwrap();

        let mut poll_args = [0u64; 6];
        poll_args[0] = monitor_handle;
        poll_args[1] = 4;
        let ready_count = dispatch(Number::MonitorPoll as u64, &process, &thread, poll_args).unwrap();
        assert_eq!(ready_count, 1);
    }

    #[test]
    fn page_allocate_then_free_releases_the_region() {
        let (process, thread) = test_process();
        let handle = dispatch(Number::PageAllocate as u64, &process, &thread, [2, 0, 0, 0, 0, 0]).unwrap();
        let mapping = process.handles.get(handle).unwrap().as_mapping().unwrap();
        let vaddr = process.address_space.insert_mapping(mapping, 0, 2, 0).unwrap();

        let mut free_args = [0u64; 6];
        free_args[0] = vaddr.as_usize() as u64;
        free_args[1] = 2;
        assert_eq!(dispatch(Number::PageFree as u64, &process, &thread, free_args), Ok(0));
    }

    #[test]
    fn page_bind_shared_redirects_target_to_source_frames() {
        let (process, thread) = test_process();
        let source_handle = dispatch(Number::PageAllocate as u64, &process, &thread, [2, 0, 0, 0, 0, 0]).unwrap();
        let target_handle = dispatch(Number::PageAllocate as u64, &process, &thread, [2, 0, 0, 0, 0, 0]).unwrap();

        let mut bind_args = [0u64; 6];
        bind_args[0] = target_handle;
        bind_args[1] = source_handle;
        bind_args[2] = 2;
        bind_args[3] = 0;
        dispatch(Number::PageBindShared as u64, &process, &thread, bind_args).unwrap();

        let source = process.handles.get(source_handle).unwrap().as_mapping().unwrap();
        let target = process.handles.get(target_handle).unwrap().as_mapping().unwrap();
        assert_eq!(target.frame_for_page(0).unwrap(), source.frame_for_page(0).unwrap());
    }

    #[test]
    fn futex_associate_then_thread_kill_runs_the_death_futex() {
        let (process, thread) = test_process();
        let prebound = MappingFlags::PREBOUND.bits() as u64;
        let handle = dispatch(Number::PageAllocate as u64, &process, &thread, [1, prebound, 0, 0, 0, 0]).unwrap();
        let mapping = process.handles.get(handle).unwrap().as_mapping().unwrap();
        let vaddr = process.address_space.insert_mapping(mapping, 0, 1, 0).unwrap();

        let mut associate_args = [0u64; 6];
        associate_args[0] = vaddr.as_usize() as u64;
        associate_args[1] = 0;
        associate_args[2] = 0xBEEF;
        dispatch(Number::FutexAssociate as u64, &process, &thread, associate_args).unwrap();

        SCHEDULER.kill(&thread);
        // No observable-memory assertion here (this crate's `AddressSpace`
        // doesn't back real memory, see `kernel::vm`'s design notes); the
        // wiring itself is exercised directly in `kernel::scheduler`'s tests.
    }
}
