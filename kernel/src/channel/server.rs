/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! `fchannel_server` (§4.E "Server channels"): a listening endpoint clients
//! connect to.

use alloc::{collections::VecDeque, sync::Arc};

use crate::{
    error::Status,
    scheduler::Thread,
    sync::{BlockMode, Mutex, Semaphore},
    waitqueue::WaitQueue,
};

use super::ChannelHalf;

/// The default ring capacity given to channel pairs created by `connect`.
/// A real implementation takes this from `kernel::config::BootConfig`.
const DEFAULT_PAIR_CAPACITY: usize = 32;

/// A listening endpoint. Clients `connect` and receive one half of a fresh
/// pair immediately; the other half queues here until the server `accept`s
/// it.
pub struct ChannelServer {
    pending: Mutex<VecDeque<Arc<ChannelHalf>>>,
    arrival_sem: Semaphore,
    closed: machine::sync::IrqSafeSpinLock<bool>,

    pub client_arrival: WaitQueue,
    pub queue_empty: WaitQueue,
    pub close: WaitQueue,
}

impl ChannelServer {
    /// `server_create() → sh`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(VecDeque::new()),
            arrival_sem: Semaphore::new(0),
            closed: machine::sync::IrqSafeSpinLock::new(false),
            client_arrival: WaitQueue::new(),
            queue_empty: WaitQueue::new(),
            close: WaitQueue::new(),
        })
    }

    /// `connect(server, flags) → channel`: create a fresh pair, queue one
    /// half for the server to accept, and hand the other to the caller.
    pub fn connect(self: &Arc<Self>, thread: &Arc<Thread>) -> Result<Arc<ChannelHalf>, Status> {
        if *self.closed.lock() {
            return Err(Status::Closed);
        }
        let (server_half, client_half) = ChannelHalf::new_pair(DEFAULT_PAIR_CAPACITY);
        let mut state = self.pending.lock(thread);
        state.push_back(server_half);
        drop(state);
        self.arrival_sem.up();
        self.client_arrival.wake_many(1);
        Ok(client_half)
    }

    /// `server_accept(sh, flags) → h`.
    pub fn accept(self: &Arc<Self>, thread: &Arc<Thread>, mode: BlockMode) -> Result<Arc<ChannelHalf>, Status> {
        self.arrival_sem.down(thread, mode)?;
        let mut state = self.pending.lock(thread);
        let half = state.pop_front().expect("arrival_sem count tracks pending length");
        let now_empty = state.is_empty();
        drop(state);
        if now_empty {
            self.queue_empty.wake_all();
        }
        Ok(half)
    }

    /// `server_close(sh)`.
    pub fn close(&self) {
        *self.closed.lock() = true;
        self.close.wake_all();
    }

    /// Whether this server has a pending (unaccepted) connection, for the
    /// monitor's level-triggered recompute path (§4.F).
    pub fn has_pending_connection(&self) -> bool {
        self.arrival_sem.count() > 0
    }

    /// Whether `close` has been called on this server.
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_then_accept_hands_over_matching_halves() {
        let server = ChannelServer::new();
        let t = Thread::new();
        let client_half = server.connect(&t).unwrap();
        let server_half = server.accept(&t, BlockMode::Blocking).unwrap();

        client_half.send(&t, BlockMode::Blocking, super::super::Message::new(alloc::vec![7], alloc::vec::Vec::new()), true).unwrap();
        let received = server_half.receive(&t, BlockMode::Blocking).unwrap();
        assert_eq!(received.body, alloc::vec![7]);
    }

    #[test]
    fn accept_on_empty_queue_is_would_block_when_non_blocking() {
        let server = ChannelServer::new();
        let t = Thread::new();
        assert_eq!(server.accept(&t, BlockMode::NonBlocking), Err(Status::WouldBlock));
    }

    #[test]
    fn connect_after_close_is_refused() {
        let server = ChannelServer::new();
        let t = Thread::new();
        server.close();
        assert_eq!(server.connect(&t).err(), Some(Status::Closed));
    }
}
