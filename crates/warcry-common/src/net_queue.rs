// net_queue.rs — packet queue between the receive thread and the game thread
//
// The platform transport receives datagrams on a dedicated I/O thread and
// enqueues them here; the engine drains the queue from the game loop. A
// bounded channel gives backpressure: under flood the producer drops rather
// than blocks, which the protocol tolerates by design.

use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::net::HostAddr;

/// A received datagram with its source address.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub from: HostAddr,
    pub data: Vec<u8>,
}

impl QueuedPacket {
    pub fn new(from: HostAddr, data: Vec<u8>) -> Self {
        Self { from, data }
    }
}

/// Handles typical burst traffic without excessive memory use.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Consumer end plus a factory for producer handles.
pub struct PacketQueue {
    sender: Sender<QueuedPacket>,
    receiver: Receiver<QueuedPacket>,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self { sender, receiver }
    }

    /// Producer handle for the I/O thread.
    pub fn sender(&self) -> PacketQueueSender {
        PacketQueueSender {
            sender: self.sender.clone(),
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<QueuedPacket> {
        self.receiver.try_recv().ok()
    }

    /// Receive with a millisecond budget. `None` on timeout.
    pub fn recv_timeout(&self, timeout_ms: u32) -> Option<QueuedPacket> {
        match self
            .receiver
            .recv_timeout(Duration::from_millis(timeout_ms as u64))
        {
            Ok(packet) => Some(packet),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Blocking receive. `None` once every producer handle is gone.
    pub fn recv(&self) -> Option<QueuedPacket> {
        self.receiver.recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

/// Producer handle, cloneable across threads.
#[derive(Clone)]
pub struct PacketQueueSender {
    sender: Sender<QueuedPacket>,
}

impl PacketQueueSender {
    /// Enqueue without blocking. Returns false when the queue is full
    /// (packet dropped) or the consumer is gone.
    pub fn try_send(&self, packet: QueuedPacket) -> bool {
        match self.sender.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
