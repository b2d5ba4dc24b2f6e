//! Pooled messages and byte buffers.
//!
//! Messages flow every frame, so neither the send nor the receive path may
//! churn allocations. Buffers are drawn from a free list and returned on
//! release; messages own a pooled payload buffer and give it back when
//! dropped. Both pools are cheap `Rc` handles shared across an endpoint's
//! sockets and connections - the cooperative single-threaded scheduler makes
//! them safe to touch from any task.

use std::cell::RefCell;
use std::rc::Rc;

use stagelink_core::RemoteId;

/// Delivery semantics selected for an outbound message.
///
/// In-process routing only: the wire does not carry the channel, because the
/// transport a frame arrived on already implies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Delivered in order, retried by the stream transport.
    ReliableOrdered,
    /// Best-effort, unordered, over the datagram transport.
    UnreliableUnordered,
}

/// Payloads above this size free their backing buffer on release; smaller
/// ones are truncated and retained for reuse.
pub const LARGE_PAYLOAD_THRESHOLD: usize = 8 * 1024;

/// Number of buffers the free list retains.
const POOL_CAPACITY: usize = 128;

/// A free list of reusable byte buffers.
///
/// `get` returns a buffer with at least the requested capacity; `release`
/// returns it. Buffers above [`LARGE_PAYLOAD_THRESHOLD`] are never retained.
#[derive(Clone, Default)]
pub struct BufferPool {
    free: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a buffer with at least `size` bytes of capacity, cleared.
    pub fn get(&self, size: usize) -> Vec<u8> {
        let mut free = self.free.borrow_mut();
        if let Some(pos) = free.iter().rposition(|buf| buf.capacity() >= size) {
            let mut buf = free.swap_remove(pos);
            buf.clear();
            return buf;
        }
        match free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.reserve(size);
                buf
            }
            None => Vec::with_capacity(size),
        }
    }

    /// Return a buffer to the pool.
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > LARGE_PAYLOAD_THRESHOLD {
            return;
        }
        let mut free = self.free.borrow_mut();
        if free.len() < POOL_CAPACITY {
            buf.clear();
            free.push(buf);
        }
    }

    /// Number of buffers currently retained.
    pub fn pooled(&self) -> usize {
        self.free.borrow().len()
    }
}

/// A pooled message bound for (or received from) one remote.
///
/// Obtained from [`MessagePool::acquire`], filled by the producer, and handed
/// to the transport, which takes ownership. Dropping the message is its
/// disposal: the payload buffer goes back to the pool (or is freed if large),
/// and ownership rules make any later access unrepresentable.
pub struct Message {
    remote: RemoteId,
    channel: Channel,
    payload: Option<Vec<u8>>,
    pool: MessagePool,
}

impl Message {
    /// The target (outbound) or source (inbound) remote id.
    pub fn remote(&self) -> RemoteId {
        self.remote
    }

    /// The delivery semantics for this message.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// The payload bytes.
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }

    /// Mutable access to the payload for filling.
    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        // Only None transiently inside Drop.
        self.payload.get_or_insert_with(Vec::new)
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload().len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(buf) = self.payload.take() {
            self.pool.buffers.release(buf);
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("remote", &self.remote)
            .field("channel", &self.channel)
            .field("len", &self.len())
            .finish()
    }
}

/// Pool handing out [`Message`]s with recycled payload buffers.
#[derive(Clone, Default)]
pub struct MessagePool {
    buffers: BufferPool,
}

impl MessagePool {
    /// Create a pool with its own buffer free list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool sharing an existing buffer free list.
    pub fn with_buffers(buffers: BufferPool) -> Self {
        Self { buffers }
    }

    /// Acquire a message whose payload is truncated to zero length with at
    /// least `expected_size` bytes of capacity.
    pub fn acquire(&self, remote: RemoteId, channel: Channel, expected_size: usize) -> Message {
        Message {
            remote,
            channel,
            payload: Some(self.buffers.get(expected_size)),
            pool: self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new();
        let mut buf = pool.get(64);
        buf.extend_from_slice(b"hello");
        pool.release(buf);
        assert_eq!(pool.pooled(), 1);

        let buf = pool.get(32);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_buffer_pool_capacity_request() {
        let pool = BufferPool::new();
        let buf = pool.get(4096);
        assert!(buf.capacity() >= 4096);
    }

    #[test]
    fn test_large_buffers_not_retained() {
        let pool = BufferPool::new();
        let buf = pool.get(LARGE_PAYLOAD_THRESHOLD + 1);
        pool.release(buf);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_message_acquire_truncated() {
        let pool = MessagePool::new();
        let remote = RemoteId::new(1, 2);

        let mut msg = pool.acquire(remote, Channel::ReliableOrdered, 128);
        msg.payload_mut().extend_from_slice(b"stale");
        drop(msg);

        let msg = pool.acquire(remote, Channel::ReliableOrdered, 16);
        assert!(msg.is_empty());
        assert_eq!(msg.remote(), remote);
        assert_eq!(msg.channel(), Channel::ReliableOrdered);
    }

    #[test]
    fn test_message_dispose_returns_buffer() {
        let buffers = BufferPool::new();
        let pool = MessagePool::with_buffers(buffers.clone());

        let msg = pool.acquire(RemoteId::new(1, 2), Channel::UnreliableUnordered, 64);
        assert_eq!(buffers.pooled(), 0);
        drop(msg);
        assert_eq!(buffers.pooled(), 1);
    }

    #[test]
    fn test_large_message_frees_buffer() {
        let buffers = BufferPool::new();
        let pool = MessagePool::with_buffers(buffers.clone());

        let mut msg = pool.acquire(
            RemoteId::new(1, 2),
            Channel::ReliableOrdered,
            LARGE_PAYLOAD_THRESHOLD * 2,
        );
        msg.payload_mut()
            .resize(LARGE_PAYLOAD_THRESHOLD * 2, 0xAB);
        drop(msg);
        assert_eq!(buffers.pooled(), 0);
    }
}
