//! Packet buffer pool.
//!
//! Datagrams are received into pool-allocated buffers so the receiver's hot
//! path never allocates; a caller that has finished reading a [`Packet`]
//! returns it with [`PacketPool::release`] instead of dropping it on the
//! floor. The pool is bounded: once it is full, returned buffers are simply
//! freed rather than grown without limit.

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::node::NodeId;

/// Datagram payload ceiling used unless [`crate::config::NetConfig::mtu`]
/// overrides it at startup.
pub const MAX_DATAGRAM_SIZE: usize = 1300;

/// Maximum number of idle buffers the pool keeps around between bursts of
/// traffic.
const FREE_LIST_CAPACITY: usize = 64;

/// A received datagram or framed message, plus the node it came from (`None`
/// while it is a freshly allocated scratch buffer with no sender yet).
pub struct Packet {
    pub sender: Option<NodeId>,
    pub data: BytesMut,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Free-list of reusable [`BytesMut`] buffers, each pre-sized to
/// `capacity`.
pub struct PacketPool {
    capacity: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl PacketPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Takes a buffer from the free list, or allocates a new one if the pool
    /// is currently empty.
    pub fn acquire(&self, sender: Option<NodeId>) -> Packet {
        let mut buf = self.free.lock().pop().unwrap_or_else(|| BytesMut::with_capacity(self.capacity));
        buf.clear();
        Packet { sender, data: buf }
    }

    /// Returns a packet's buffer to the free list once the caller is done
    /// reading it. Buffers beyond [`FREE_LIST_CAPACITY`] are dropped instead
    /// of retained, so a traffic spike does not pin memory forever.
    pub fn release(&self, packet: Packet) {
        let mut buf = packet.data;
        let mut free = self.free.lock();
        if free.len() < FREE_LIST_CAPACITY {
            buf.clear();
            free.push(buf);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_is_reused() {
        let pool = PacketPool::new(MAX_DATAGRAM_SIZE);
        let packet = pool.acquire(Some(NodeId(2)));
        assert_eq!(packet.sender, Some(NodeId(2)));
        pool.release(packet);
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.acquire(None);
        assert_eq!(pool.idle_count(), 0);
        pool.release(reused);
    }

    #[test]
    fn free_list_is_bounded() {
        let pool = PacketPool::new(MAX_DATAGRAM_SIZE);
        let packets: Vec<_> = (0..(FREE_LIST_CAPACITY + 10)).map(|_| pool.acquire(None)).collect();
        for packet in packets {
            pool.release(packet);
        }
        assert_eq!(pool.idle_count(), FREE_LIST_CAPACITY);
    }
}
