/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS Developers
 */

//! `fchannel` (§4.E): bidirectional message-passing channel pairs.
//!
//! A pair is allocated together; each half owns a bounded ring of messages
//! and gates access with an insertion semaphore (slots available in the
//! *peer's* ring) and a removal semaphore (messages available in its own
//! ring). A shared counter, initially 2, tracks how many halves are still
//! open.

pub mod realm;
pub mod server;
pub mod wire;

pub use realm::Realm;
pub use server::ChannelServer;

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use machine::sync::IrqSafeSpinLock;

use crate::{
    error::Status,
    scheduler::{Thread, WakeCause, SCHEDULER},
    sync::{BlockMode, Mutex},
    vm::Mapping,
    waitqueue::WaitQueue,
};

/// One attachment slot in a message (§4.E "Message body & attachments").
pub enum Attachment {
    /// Placeholder; holds an ordering slot without carrying data.
    Null,
    /// Ownership transfer: the sender no longer references this half after
    /// a successful send.
    Channel(Arc<ChannelHalf>),
    /// Shared: both sides may hold a reference to the same descriptor.
    Mapping(Arc<Mapping>),
    /// Opaque bytes, inline or mapping-backed.
    Data(DataAttachment),
}

/// The two flavors of a `data` attachment (§4.E).
pub enum DataAttachment {
    /// Bytes copied into a kernel-owned buffer at send time.
    Inline(Vec<u8>),
    /// Bytes backed by a shared-memory mapping instead of being copied.
    Shared { mapping: Arc<Mapping>, length: usize },
}

/// A message in flight between two channel halves (§4.E).
pub struct Message {
    pub conversation_id: u64,
    pub message_id: u64,
    pub body: Vec<u8>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Build a message to send. `conversation_id` is only meaningful when
    /// the caller is replying to an existing conversation (`start_conversation
    /// = false` at send time); `message_id` is always assigned by `send`.
    pub fn new(body: Vec<u8>, attachments: Vec<Attachment>) -> Self {
        Self { conversation_id: 0, message_id: 0, body, attachments }
    }
}

struct ChannelInner {
    ring: VecDeque<Message>,
    closed_receive: bool,
}

/// One endpoint of a channel pair.
pub struct ChannelHalf {
    inner: Mutex<ChannelInner>,
    capacity: usize,
    insertion_sem: crate::sync::Semaphore,
    removal_sem: crate::sync::Semaphore,
    peer: IrqSafeSpinLock<Option<alloc::sync::Weak<ChannelHalf>>>,
    closure_count: Arc<AtomicUsize>,
    closed: core::sync::atomic::AtomicBool,
    next_message_id: AtomicU64,
    next_conversation_id: AtomicU64,

    pub message_arrival: WaitQueue,
    pub queue_empty: WaitQueue,
    pub queue_removal: WaitQueue,
    pub queue_full: WaitQueue,
    pub close: WaitQueue,
}

impl ChannelHalf {
    fn new(capacity: usize, closure_count: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ChannelInner { ring: VecDeque::new(), closed_receive: false }),
            capacity,
            insertion_sem: crate::sync::Semaphore::new(capacity as isize),
            removal_sem: crate::sync::Semaphore::new(0),
            peer: IrqSafeSpinLock::new(None),
            closure_count,
            closed: core::sync::atomic::AtomicBool::new(false),
            next_message_id: AtomicU64::new(1),
            next_conversation_id: AtomicU64::new(1),
            message_arrival: WaitQueue::new(),
            queue_empty: WaitQueue::new(),
            queue_removal: WaitQueue::new(),
            queue_full: WaitQueue::new(),
            close: WaitQueue::new(),
        })
    }

    /// `channel_create_pair()`: allocate both halves of a pair together.
    pub fn new_pair(capacity: usize) -> (Arc<Self>, Arc<Self>) {
        let closure_count = Arc::new(AtomicUsize::new(2));
        let a = Self::new(capacity, closure_count.clone());
        let b = Self::new(capacity, closure_count);
        *a.peer.lock() = Some(Arc::downgrade(&b));
        *b.peer.lock() = Some(Arc::downgrade(&a));
        (a, b)
    }

    /// The other half of the pair, if it's still alive.
    pub fn peer(&self) -> Option<Arc<ChannelHalf>> {
        self.peer.lock().as_ref().and_then(alloc::sync::Weak::upgrade)
    }

    /// `fchannel_next_conversation_id`: allocate a fresh conversation id for
    /// a message this half is about to start (id 0 is reserved for "not part
    /// of a conversation").
    pub fn next_conversation_id(&self) -> u64 {
        self.next_conversation_id.fetch_add(1, Ordering::Relaxed)
    }

    /// `send(channel, flags, message)` (§4.E step-by-step protocol).
    pub fn send(
        self: &Arc<Self>,
        thread: &Arc<Thread>,
        mode: BlockMode,
        mut message: Message,
        start_conversation: bool,
    ) -> Result<(), Status> {
        let peer = self.peer().ok_or(Status::Closed)?;

        // 1. Acquire a slot in the peer's ring.
        peer.insertion_sem.down(thread, mode)?;

        // 2. Lock the peer's mutex.
        let mut peer_state = peer.inner.lock(thread);
        if peer_state.closed_receive {
            drop(peer_state);
            peer.insertion_sem.up();
            return Err(Status::Closed);
        }

        // 3. Assign message id and (if requested) a fresh conversation id.
        message.message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        if start_conversation {
            message.conversation_id = self.next_conversation_id();
        }

        // 4. Enqueue into the peer's ring.
        let was_empty = peer_state.ring.is_empty();
        peer_state.ring.push_back(message);
        let now_full = peer_state.ring.len() >= peer.capacity;
        drop(peer_state);

        // 5. Unlock (already done), `up` the removal semaphore.
        peer.removal_sem.up();

        // 6. Wake one arrival waiter, plus queue_empty watchers on the
        // empty-to-non-empty transition.
        peer.message_arrival.wake_many(1);
        if was_empty {
            peer.queue_empty.wake_all();
        }
        if now_full {
            peer.queue_full.wake_all();
        }
        Ok(())
    }

    /// `receive(channel, flags)` (§4.E step-by-step protocol). A message
    /// already in the ring when the peer closes is still delivered; only
    /// once the ring runs dry does a receiver observe [`Status::Closed`]
    /// (half-close semantics, §4.E end-to-end scenario).
    pub fn receive(self: &Arc<Self>, thread: &Arc<Thread>, mode: BlockMode) -> Result<Message, Status> {
        // 1. Acquire a queued message, re-checking close on every attempt so
        // a message enqueued before close is still drained first.
        loop {
            if self.removal_sem.try_down() {
                break;
            }
            if self.inner.lock(thread).closed_receive {
                return Err(Status::Closed);
            }
            match mode {
                BlockMode::NonBlocking => return Err(Status::WouldBlock),
                BlockMode::Blocking | BlockMode::Interruptible => {
                    let interruptible = mode == BlockMode::Interruptible;
                    match SCHEDULER.wait_locked_checked(thread, self.removal_sem.waitq(), interruptible) {
                        WakeCause::Signaled => return Err(Status::Signaled),
                        WakeCause::Woken | WakeCause::TimedOut => continue,
                    }
                }
            }
        }

        // 2. Lock own mutex, dequeue.
        let mut state = self.inner.lock(thread);
        let message = state.ring.pop_front().expect("removal_sem count tracks ring length");
        let now_empty = state.ring.is_empty();
        drop(state);

        // 3 & 4. Wake queue_empty if applicable, unlock, release a slot, wake
        // a queue_removal waiter.
        if now_empty {
            self.queue_empty.wake_all();
        }
        self.insertion_sem.up();
        self.queue_removal.wake_many(1);

        // 5. Caller now owns the message and all its attachments.
        Ok(message)
    }

    /// `channel_close(h)`: mark the peer's receive side closed and record
    /// this half as no longer open.
    pub fn close(self: &Arc<Self>, thread: &Arc<Thread>) -> Result<(), Status> {
        if let Some(peer) = self.peer() {
            let mut peer_state = peer.inner.lock(thread);
            peer_state.closed_receive = true;
            drop(peer_state);
            peer.close.wake_all();
            peer.removal_sem.wake_waiters();
        }
        self.close.wake_all();
        self.closed.store(true, Ordering::Release);
        self.closure_count.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Block the calling thread until this half's `close_waitq` fires or the
    /// wait is interrupted/times out — the primitive behind a monitor item
    /// hooked to `close` and behind any direct wait-for-close caller.
    pub fn wait_for_close(self: &Arc<Self>, thread: &Arc<Thread>, interruptible: bool) -> WakeCause {
        SCHEDULER.wait_locked_checked(thread, &self.close, interruptible)
    }

    /// Whether this half has messages ready to dequeue, for the monitor's
    /// level-triggered recompute path (§4.F).
    pub fn has_pending_messages(&self) -> bool {
        self.removal_sem.count() > 0
    }

    /// Whether this half's ring is currently empty.
    pub fn is_receive_empty(&self) -> bool {
        self.removal_sem.count() == 0
    }

    /// Whether this half currently has room to accept a send.
    pub fn has_room(&self) -> bool {
        self.insertion_sem.count() > 0
    }

    /// Whether this half's ring is currently at capacity.
    pub fn is_full(&self) -> bool {
        self.insertion_sem.count() <= 0
    }

    /// Whether `close` has been called on this half.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc as StdArc, thread as std_thread, time::Duration};

    #[test]
    fn send_then_receive_round_trips_a_message() {
        let (a, b) = ChannelHalf::new_pair(4);
        let sender = Thread::new();
        let receiver = Thread::new();

        a.send(&sender, BlockMode::Blocking, Message::new(alloc::vec![1, 2, 3], Vec::new()), true).unwrap();
        let message = b.receive(&receiver, BlockMode::Blocking).unwrap();
        assert_eq!(message.body, alloc::vec![1, 2, 3]);
        assert_ne!(message.conversation_id, 0);
        assert_eq!(message.message_id, 1);
    }

    #[test]
    fn send_after_peer_close_reports_closed() {
        let (a, b) = ChannelHalf::new_pair(4);
        let t = Thread::new();
        b.close(&t).unwrap();
        let result = a.send(&t, BlockMode::Blocking, Message::new(Vec::new(), Vec::new()), true);
        assert_eq!(result, Err(Status::Closed));
    }

    #[test]
    fn send_blocks_until_peer_has_room() {
        let (a, b) = ChannelHalf::new_pair(1);
        let first_sender = Thread::new();
        a.send(&first_sender, BlockMode::Blocking, Message::new(alloc::vec![0], Vec::new()), true).unwrap();

        let a = StdArc::new(a);
        let a2 = a.clone();
        let second_sender = Thread::new();
        let handle = std_thread::spawn(move || {
            a2.send(&second_sender, BlockMode::Blocking, Message::new(alloc::vec![9], Vec::new()), true).unwrap();
        });

        std_thread::sleep(Duration::from_millis(20));
        let receiver = Thread::new();
        let first = b.receive(&receiver, BlockMode::Blocking).unwrap();
        assert_eq!(first.body, alloc::vec![0]);

        handle.join().unwrap();
        let second = b.receive(&receiver, BlockMode::Blocking).unwrap();
        assert_eq!(second.body, alloc::vec![9]);
    }

    #[test]
    fn non_blocking_send_reports_would_block_when_ring_is_full() {
        let (a, b) = ChannelHalf::new_pair(1);
        let t = Thread::new();
        a.send(&t, BlockMode::Blocking, Message::new(Vec::new(), Vec::new()), true).unwrap();
        let result = a.send(&t, BlockMode::NonBlocking, Message::new(Vec::new(), Vec::new()), true);
        assert_eq!(result, Err(Status::WouldBlock));
        let _ = b;
    }

    #[test]
    fn non_blocking_receive_reports_would_block_on_empty_ring() {
        let (a, _b) = ChannelHalf::new_pair(1);
        let t = Thread::new();
        assert_eq!(a.receive(&t, BlockMode::NonBlocking), Err(Status::WouldBlock));
    }

    #[test]
    fn half_close_delivers_queued_message_then_reports_closed() {
        let (a, b) = ChannelHalf::new_pair(4);
        let t = Thread::new();
        a.send(&t, BlockMode::Blocking, Message::new(alloc::vec![7], Vec::new()), true).unwrap();
        a.close(&t).unwrap();

        let message = b.receive(&t, BlockMode::NonBlocking).unwrap();
        assert_eq!(message.body, alloc::vec![7]);

        assert_eq!(b.receive(&t, BlockMode::NonBlocking), Err(Status::Closed));
    }

    #[test]
    fn blocking_receive_wakes_with_closed_when_peer_closes_with_empty_ring() {
        let (a, b) = ChannelHalf::new_pair(4);
        let b = StdArc::new(b);
        let b2 = b.clone();
        let receiver = Thread::new();
        let handle = std_thread::spawn(move || b2.receive(&receiver, BlockMode::Blocking));

        std_thread::sleep(Duration::from_millis(20));
        let closer = Thread::new();
        a.close(&closer).unwrap();

        assert_eq!(handle.join().unwrap(), Err(Status::Closed));
    }

    #[test]
    fn channel_attachment_transfers_ownership_on_receive() {
        let (a, b) = ChannelHalf::new_pair(2);
        let (inner_a, _inner_b) = ChannelHalf::new_pair(2);
        let t = Thread::new();
        a.send(&t, BlockMode::Blocking, Message::new(Vec::new(), alloc::vec![Attachment::Channel(inner_a)]), true).unwrap();
        let message = b.receive(&t, BlockMode::Blocking).unwrap();
        assert_eq!(message.attachments.len(), 1);
        assert!(matches!(message.attachments[0], Attachment::Channel(_)));
    }
}
