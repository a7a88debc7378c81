//! Send queue and transmitter.
//!
//! Outbound datagrams are not written to the wire from the caller's task;
//! they are appended to a per-endpoint queue and drained by a single
//! transmitter task, mirroring the original engine's `sendqueue_t` plus its
//! dedicated transmitter thread. Routing a send through a queue rather than
//! writing inline is what makes [`SendQueue::cancel_node`] possible: a
//! terminated node's still-queued packets are nulled out in place instead of
//! being raced against an in-flight write.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
#[cfg(feature = "net-emulation")]
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{NetError, NetResult};
use crate::node::{NodeId, NodeTable};
use crate::pool::MAX_DATAGRAM_SIZE;
use crate::transport::DatagramSocket;

/// A queued outbound datagram. `target` is set to `None` to cancel an
/// already-queued send without having to splice it out of the deque, the
/// same trick `sendqueue_t` uses in the original transmitter.
struct SendQueueEntry {
    target: Option<NodeId>,
    addr: std::net::SocketAddr,
    data: Bytes,
    due_at: Option<Instant>,
}

struct QueueInner {
    entries: parking_lot::Mutex<VecDeque<SendQueueEntry>>,
    notify: Notify,
}

/// Per-endpoint outbound datagram queue. Unbounded, mirroring the original
/// engine's `malloc`'d `sendqueue_t` linked list: a caller appending to it
/// never waits on the transmitter to catch up.
pub struct SendQueue {
    inner: Arc<QueueInner>,
}

/// Orders two entries' due times for insertion: an entry with no `due_at`
/// (send as soon as possible) always ranks before one scheduled for a
/// future instant, and two scheduled entries rank by that instant.
fn due_after(a: Option<Instant>, b: Option<Instant>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x > y,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                entries: parking_lot::Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueues a datagram for a specific node, inserted in `due_at` order
    /// so the transmitter can always pop the earliest-due entry off the
    /// front. Never blocks: this queue has no capacity bound.
    /// `emulated_delay` is `Some` only when the `net-emulation` feature's
    /// randomized transmitter is in use.
    pub async fn enqueue(
        &self,
        target: NodeId,
        addr: std::net::SocketAddr,
        data: Bytes,
        emulated_delay: Option<Duration>,
    ) -> NetResult<()> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(NetError::DatagramTooLarge {
                len: data.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        let due_at = emulated_delay.map(|d| Instant::now() + d);
        let entry = SendQueueEntry {
            target: Some(target),
            addr,
            data,
            due_at,
        };
        {
            let mut entries = self.inner.entries.lock();
            let pos = entries.iter().position(|e| due_after(e.due_at, due_at)).unwrap_or(entries.len());
            entries.insert(pos, entry);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Nulls out every queued entry addressed to `target` so the
    /// transmitter silently drops them instead of sending to a node that no
    /// longer exists. Mirrors the original's pattern of clearing a
    /// `sendqueue_t` slot's target rather than removing it mid-iteration.
    pub fn cancel_node(&self, target: NodeId) {
        let mut entries = self.inner.entries.lock();
        for entry in entries.iter_mut() {
            if entry.target == Some(target) {
                entry.target = None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Pops the front entry if it is due. Entries are kept sorted by
    /// `due_at` on insertion, so the front is always the earliest-due one.
    fn pop_ready(&self) -> Option<SendQueueEntry> {
        let mut entries = self.inner.entries.lock();
        let now = Instant::now();
        match entries.front() {
            Some(front) if front.due_at.map(|due| due <= now).unwrap_or(true) => entries.pop_front(),
            _ => None,
        }
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains `queue` onto `socket` until the queue is dropped. Runs as its own
/// task, one per bound datagram socket, the same division of labor as the
/// original's dedicated transmitter thread.
pub async fn run_transmitter(
    queue: Arc<SendQueue>,
    socket: Arc<dyn DatagramSocket>,
    _nodes: Arc<NodeTable>,
) {
    loop {
        while let Some(entry) = queue.pop_ready() {
            let Some(_target) = entry.target else {
                debug!("dropping cancelled send-queue entry");
                continue;
            };
            if let Err(err) = socket.send_to(&entry.data, entry.addr).await {
                warn!(error = %err, "transmitter send failed");
            }
        }
        queue.inner.notify.notified().await;
    }
}

/// What [`emulated_delay`] decided for one outbound datagram.
#[cfg(feature = "net-emulation")]
pub enum EmulatedOutcome {
    /// Enqueue the datagram with the given artificial delay (possibly zero).
    Send(Duration),
    /// Discard the datagram outright; it is never enqueued.
    Drop,
}

/// Randomized stand-in for normal immediate enqueueing, enabled only under
/// the `net-emulation` feature. Grounded in the original engine's
/// `TRANSMIT_RANDOMIZER` debug path: every send is given a jittered delay
/// and a chance of being dropped outright, to exercise reordering and loss
/// handling without a real lossy network.
#[cfg(feature = "net-emulation")]
pub fn emulated_delay(cfg: &crate::config::EmulationConfig) -> Option<EmulatedOutcome> {
    if !cfg.enabled {
        return None;
    }
    let mut rng = rand::thread_rng();
    if cfg.drop_percent > 0 && rng.gen_range(0..100) < cfg.drop_percent as u32 {
        return Some(EmulatedOutcome::Drop);
    }
    let delay = if cfg.max_delay_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rng.gen_range(0..=cfg.max_delay_ms as u64))
    };
    Some(EmulatedOutcome::Send(delay))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> std::net::SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn enqueue_rejects_oversized_datagram() {
        let queue = SendQueue::new();
        let big = Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE + 1]);
        let err = queue.enqueue(NodeId(0), addr(), big, None).await.unwrap_err();
        assert!(matches!(err, NetError::DatagramTooLarge { .. }));
    }

    #[tokio::test]
    async fn cancel_node_nulls_matching_entries() {
        let queue = SendQueue::new();
        queue.enqueue(NodeId(1), addr(), Bytes::from_static(b"a"), None).await.unwrap();
        queue.enqueue(NodeId(2), addr(), Bytes::from_static(b"b"), None).await.unwrap();
        queue.cancel_node(NodeId(1));

        let first = queue.pop_ready().unwrap();
        assert_eq!(first.target, None);
        let second = queue.pop_ready().unwrap();
        assert_eq!(second.target, Some(NodeId(2)));
    }

    #[tokio::test]
    async fn queue_len_tracks_pending_entries() {
        let queue = SendQueue::new();
        assert!(queue.is_empty());
        queue.enqueue(NodeId(0), addr(), Bytes::from_static(b"x"), None).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn enqueue_keeps_entries_sorted_by_due_time() {
        let queue = SendQueue::new();
        queue
            .enqueue(NodeId(1), addr(), Bytes::from_static(b"late"), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        queue
            .enqueue(NodeId(2), addr(), Bytes::from_static(b"early"), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        queue.enqueue(NodeId(3), addr(), Bytes::from_static(b"now"), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let first = queue.pop_ready().unwrap();
        assert_eq!(first.target, Some(NodeId(3)));
        let second = queue.pop_ready().unwrap();
        assert_eq!(second.target, Some(NodeId(2)));
        let third = queue.pop_ready().unwrap();
        assert_eq!(third.target, Some(NodeId(1)));
    }

    #[tokio::test]
    async fn enqueue_never_blocks_past_any_fixed_capacity() {
        let queue = SendQueue::new();
        for i in 0..1000u32 {
            queue
                .enqueue(NodeId((i % 32) as u8), addr(), Bytes::from_static(b"x"), None)
                .await
                .unwrap();
        }
        assert_eq!(queue.len(), 1000);
    }
}
