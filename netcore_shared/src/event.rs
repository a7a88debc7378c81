//! Lifecycle event queue.
//!
//! Every connection transition that the game module needs to react to
//! (a client joining, leaving, or a server connection dropping) is posted
//! here as a [`NetEvent`] rather than delivered through a callback, so the
//! main loop can drain it on its own schedule between ticks.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::node::NodeId;

/// A lifecycle transition posted by the control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    /// A node completed the JOIN handshake.
    ClientEntry { id: NodeId },
    /// A previously-joined node was terminated.
    ClientExit { id: NodeId },
    /// The client's connection to the server was lost.
    EndConnection { id: NodeId },
}

/// Thread-safe FIFO of [`NetEvent`]s, drained once per main-loop tick.
#[derive(Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<NetEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts an event for the consumer to observe on its next drain.
    pub fn post(&self, event: NetEvent) {
        self.events.lock().push_back(event);
    }

    /// Pops the oldest pending event, if any.
    pub fn poll(&self) -> Option<NetEvent> {
        self.events.lock().pop_front()
    }

    /// Drains every pending event in arrival order.
    pub fn drain(&self) -> Vec<NetEvent> {
        self.events.lock().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let q = EventQueue::new();
        q.post(NetEvent::ClientEntry { id: NodeId(1) });
        q.post(NetEvent::ClientExit { id: NodeId(1) });
        assert_eq!(q.poll(), Some(NetEvent::ClientEntry { id: NodeId(1) }));
        assert_eq!(q.poll(), Some(NetEvent::ClientExit { id: NodeId(1) }));
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn drain_empties_queue() {
        let q = EventQueue::new();
        q.post(NetEvent::EndConnection { id: NodeId(0) });
        q.post(NetEvent::EndConnection { id: NodeId(0) });
        assert_eq!(q.drain().len(), 2);
        assert!(q.is_empty());
    }
}
