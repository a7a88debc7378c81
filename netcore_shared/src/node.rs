//! Node table.
//!
//! Tracks every peer the local endpoint currently knows about: its reliable
//! stream (server role only; a client has exactly one node, itself), its
//! datagram address, whether it has completed the JOIN handshake, its
//! display name, and per-node traffic counters. Node slots are a fixed-size
//! array rather than a growable collection because [`NodeId`] is the wire
//! identifier the control protocol and datagram headers both carry, and it
//! must stay stable and compact for the lifetime of a session.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::error::{NetError, NetResult};
use crate::transport::ReliableStream;

/// Upper bound on simultaneously tracked peers, independent of
/// [`crate::config::NetConfig::max_players`], which is an admission policy
/// applied on top of this hard table size.
pub const MAX_NODES: usize = 32;

/// Index into the node table. Also the wire value carried by `ENTER <hhhh>`
/// and embedded in datagram routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u8);

impl NodeId {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Traffic counters maintained per node, surfaced through the service's
/// send-queue inspection operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeCounters {
    pub pending_messages: u32,
    pub pending_bytes: u64,
}

/// A single tracked peer. `None` in the table means the slot is free.
pub struct Node {
    pub conn: Option<Arc<AsyncMutex<Box<dyn ReliableStream>>>>,
    pub datagram_addr: Option<SocketAddr>,
    pub has_joined: bool,
    pub name: String,
    pub counters: NodeCounters,
}

impl Node {
    fn empty() -> Self {
        Self {
            conn: None,
            datagram_addr: None,
            has_joined: false,
            name: String::new(),
            counters: NodeCounters::default(),
        }
    }

    fn is_free(&self) -> bool {
        self.conn.is_none()
    }
}

/// What happened to a slot when it was torn down, so the caller can decide
/// whether to cancel queued sends and post a lifecycle event.
#[derive(Debug, Clone, Copy)]
pub struct TerminateOutcome {
    pub was_joined: bool,
    pub datagram_addr: Option<SocketAddr>,
}

/// Fixed-size registry of [`MAX_NODES`] peer slots, guarded by a single
/// `parking_lot` mutex. Table operations are all O(1) or O(MAX_NODES) and
/// never held across an `.await`, so a blocking mutex is the right tool
/// here; the reliable stream each slot wraps uses an async mutex instead,
/// since send/receive on it does cross `.await` points.
pub struct NodeTable {
    nodes: parking_lot::Mutex<Vec<Node>>,
    max_players: usize,
    /// Server tables skip slot 0 when allocating (it denotes "the server"
    /// from a client's point of view and is never a connected peer on the
    /// server side); client tables allocate starting at 0, since a client's
    /// only node is the server itself.
    first_allocatable: usize,
}

impl NodeTable {
    /// Table for a server: node ids start at 1, slot 0 is never allocated.
    pub fn new(max_players: usize) -> Self {
        Self::with_first_allocatable(max_players, 1)
    }

    /// Table for a client: node 0 denotes the server, so it is the first
    /// (and, in practice, only) slot handed out.
    pub fn new_client(max_players: usize) -> Self {
        Self::with_first_allocatable(max_players, 0)
    }

    fn with_first_allocatable(max_players: usize, first_allocatable: usize) -> Self {
        let mut nodes = Vec::with_capacity(MAX_NODES);
        nodes.resize_with(MAX_NODES, Node::empty);
        Self {
            nodes: parking_lot::Mutex::new(nodes),
            max_players: max_players.min(MAX_NODES),
            first_allocatable,
        }
    }

    /// Allocates the first free slot (at or after [`Self::first_allocatable`])
    /// for a newly accepted stream connection, before the JOIN handshake has
    /// completed.
    pub fn register_new_socket(
        &self,
        conn: Box<dyn ReliableStream>,
    ) -> NetResult<NodeId> {
        let mut nodes = self.nodes.lock();
        let slot = nodes
            .iter()
            .enumerate()
            .skip(self.first_allocatable)
            .find(|(_, n)| n.is_free())
            .map(|(i, _)| i)
            .ok_or_else(|| NetError::Resource("node table full".to_string()))?;
        nodes[slot] = Node {
            conn: Some(Arc::new(AsyncMutex::new(conn))),
            datagram_addr: None,
            has_joined: false,
            name: String::new(),
            counters: NodeCounters::default(),
        };
        Ok(NodeId(slot as u8))
    }

    /// Completes the JOIN handshake for a slot already registered by
    /// [`Self::register_new_socket`], subject to the external admission
    /// policy (`max_players`).
    pub fn join_node(&self, id: NodeId, name: String) -> NetResult<()> {
        let mut nodes = self.nodes.lock();
        let joined_count = nodes.iter().filter(|n| n.has_joined).count();
        if joined_count >= self.max_players {
            return Err(NetError::Resource("server is full".to_string()));
        }
        let node = nodes
            .get_mut(id.as_usize())
            .ok_or_else(|| NetError::Protocol("node id out of range".to_string()))?;
        if node.is_free() {
            return Err(NetError::Protocol("join on unregistered node".to_string()));
        }
        node.has_joined = true;
        node.name = name;
        Ok(())
    }

    pub fn set_datagram_addr(&self, id: NodeId, addr: SocketAddr) {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get_mut(id.as_usize()) {
            node.datagram_addr = Some(addr);
        }
    }

    /// Zeroes a slot and reports what it held. Does not touch the send queue
    /// or post a lifecycle event; callers that need that orchestration
    /// (`NetService::terminate_node`) compose this primitive with
    /// [`crate::queue::SendQueue::cancel_node`] and
    /// [`crate::event::EventQueue::post`] themselves.
    pub fn terminate(&self, id: NodeId) -> TerminateOutcome {
        let mut nodes = self.nodes.lock();
        let outcome = nodes
            .get(id.as_usize())
            .map(|node| TerminateOutcome {
                was_joined: node.has_joined,
                datagram_addr: node.datagram_addr,
            })
            .unwrap_or(TerminateOutcome {
                was_joined: false,
                datagram_addr: None,
            });
        if let Some(node) = nodes.get_mut(id.as_usize()) {
            *node = Node::empty();
        }
        outcome
    }

    pub fn is_joined(&self, id: NodeId) -> bool {
        self.nodes
            .lock()
            .get(id.as_usize())
            .map(|n| n.has_joined)
            .unwrap_or(false)
    }

    pub fn get_node_name(&self, id: NodeId) -> Option<String> {
        self.nodes
            .lock()
            .get(id.as_usize())
            .filter(|n| n.has_joined)
            .map(|n| n.name.clone())
    }

    pub fn datagram_addr(&self, id: NodeId) -> Option<SocketAddr> {
        self.nodes.lock().get(id.as_usize()).and_then(|n| n.datagram_addr)
    }

    /// Finds the node whose datagram address matches `addr`, used by the
    /// receiver to route an inbound datagram to its owning [`NodeId`].
    pub fn resolve_addr(&self, addr: SocketAddr) -> Option<NodeId> {
        self.nodes
            .lock()
            .iter()
            .position(|n| n.datagram_addr == Some(addr))
            .map(|i| NodeId(i as u8))
    }

    pub fn connected_count(&self) -> usize {
        self.nodes.lock().iter().filter(|n| !n.is_free()).count()
    }

    pub fn joined_count(&self) -> usize {
        self.nodes.lock().iter().filter(|n| n.has_joined).count()
    }

    pub fn conn(&self, id: NodeId) -> Option<Arc<AsyncMutex<Box<dyn ReliableStream>>>> {
        self.nodes.lock().get(id.as_usize()).and_then(|n| n.conn.clone())
    }

    pub fn counters_snapshot(&self, id: NodeId) -> Option<NodeCounters> {
        self.nodes.lock().get(id.as_usize()).map(|n| n.counters)
    }

    pub fn increment_pending(&self, id: NodeId, bytes: u64) {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get_mut(id.as_usize()) {
            node.counters.pending_messages += 1;
            node.counters.pending_bytes += bytes;
        }
    }

    pub fn decrement_pending(&self, id: NodeId, bytes: u64) {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get_mut(id.as_usize()) {
            node.counters.pending_messages = node.counters.pending_messages.saturating_sub(1);
            node.counters.pending_bytes = node.counters.pending_bytes.saturating_sub(bytes);
        }
    }

    /// All currently joined node ids, in slot order.
    pub fn joined_ids(&self) -> Vec<NodeId> {
        self.nodes
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, n)| n.has_joined)
            .map(|(i, _)| NodeId(i as u8))
            .collect()
    }

    /// All occupied node ids, joined or still mid-handshake, in slot order.
    pub fn registered_ids(&self) -> Vec<NodeId> {
        self.nodes
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.is_free())
            .map(|(i, _)| NodeId(i as u8))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackStream;

    fn dummy_stream() -> Box<dyn ReliableStream> {
        // Tests exercise table bookkeeping only, never actual I/O, so a
        // stream that would error on use is fine here.
        struct Dummy;
        #[async_trait::async_trait]
        impl ReliableStream for Dummy {
            async fn recv_exact(&mut self, _buf: &mut [u8]) -> std::io::Result<()> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "unused"))
            }
            async fn send_all(&mut self, _buf: &[u8]) -> std::io::Result<()> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "unused"))
            }
            fn peer_addr(&self) -> std::io::Result<SocketAddr> {
                Ok("127.0.0.1:0".parse().unwrap())
            }
        }
        let _ = std::any::type_name::<LoopbackStream>();
        Box::new(Dummy)
    }

    #[test]
    fn register_join_terminate_round_trip() {
        let table = NodeTable::new(4);
        let id = table.register_new_socket(dummy_stream()).unwrap();
        assert!(!table.is_joined(id));

        table.join_node(id, "Alice".to_string()).unwrap();
        assert!(table.is_joined(id));
        assert_eq!(table.get_node_name(id), Some("Alice".to_string()));

        let outcome = table.terminate(id);
        assert!(outcome.was_joined);
        assert!(!table.is_joined(id));
        assert_eq!(table.connected_count(), 0);
    }

    #[test]
    fn join_rejects_when_admission_full() {
        let table = NodeTable::new(1);
        let a = table.register_new_socket(dummy_stream()).unwrap();
        let b = table.register_new_socket(dummy_stream()).unwrap();
        table.join_node(a, "A".to_string()).unwrap();
        assert!(table.join_node(b, "B".to_string()).is_err());
    }

    #[test]
    fn table_full_after_max_nodes_registrations() {
        let table = NodeTable::new(MAX_NODES);
        // Server tables skip slot 0, so only MAX_NODES - 1 are allocatable.
        for _ in 0..(MAX_NODES - 1) {
            table.register_new_socket(dummy_stream()).unwrap();
        }
        assert!(table.register_new_socket(dummy_stream()).is_err());
    }

    #[test]
    fn resolve_addr_finds_owning_node() {
        let table = NodeTable::new(4);
        let id = table.register_new_socket(dummy_stream()).unwrap();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        table.set_datagram_addr(id, addr);
        assert_eq!(table.resolve_addr(addr), Some(id));
    }

    #[test]
    fn server_table_skips_node_zero() {
        let table = NodeTable::new(4);
        let id = table.register_new_socket(dummy_stream()).unwrap();
        assert_eq!(id, NodeId(1));
    }

    #[test]
    fn client_table_allocates_node_zero() {
        let table = NodeTable::new_client(1);
        let id = table.register_new_socket(dummy_stream()).unwrap();
        assert_eq!(id, NodeId(0));
    }

    #[test]
    fn registered_ids_includes_unjoined_nodes() {
        let table = NodeTable::new(4);
        let mid_handshake = table.register_new_socket(dummy_stream()).unwrap();
        let joined = table.register_new_socket(dummy_stream()).unwrap();
        table.join_node(joined, "Bob".to_string()).unwrap();

        assert_eq!(table.registered_ids(), vec![mid_handshake, joined]);
        assert_eq!(table.joined_ids(), vec![joined]);
    }
}
