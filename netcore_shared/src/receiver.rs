//! Receiver and inbound message queue.
//!
//! One task polls the shared datagram socket and routes each packet to its
//! owning node via [`NodeTable::resolve_addr`]; one task per reliable stream
//! reads length-prefixed frames. Both feed the same inbound channel so
//! callers drain a single [`NetMessage`] stream regardless of which channel
//! a message arrived on, mirroring the original's single `netmessage_t`
//! queue fed by both `N_UDPReceiver` and the stream-socket poller.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::node::{NodeId, NodeTable};
use crate::pool::{PacketPool, MAX_DATAGRAM_SIZE};
use crate::transport::{DatagramSocket, ReliableStream};

/// How often the datagram poll loop wakes up even with nothing to read,
/// matching the original receiver's 250ms poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A fully received message ready for the application to consume, tagged
/// with the node it arrived from.
#[derive(Debug, Clone)]
pub struct NetMessage {
    pub sender: NodeId,
    pub data: Bytes,
}

/// Inbound side of the message pipeline: a bounded channel plus the buffer
/// pool packets are read into.
pub struct InboundQueue {
    tx: mpsc::Sender<NetMessage>,
    rx: tokio::sync::Mutex<mpsc::Receiver<NetMessage>>,
    pool: Arc<PacketPool>,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            pool: Arc::new(PacketPool::new(MAX_DATAGRAM_SIZE)),
        }
    }

    pub fn pool(&self) -> Arc<PacketPool> {
        Arc::clone(&self.pool)
    }

    /// Pulls the next received message, or `None` if nothing is pending.
    pub async fn try_recv(&self) -> Option<NetMessage> {
        self.rx.lock().await.try_recv().ok()
    }

    /// Waits for the next received message.
    pub async fn recv(&self) -> Option<NetMessage> {
        self.rx.lock().await.recv().await
    }

    async fn push(&self, msg: NetMessage) {
        if self.tx.send(msg).await.is_err() {
            debug!("inbound queue receiver dropped");
        }
    }
}

/// Polls `socket` for datagrams, resolves the sender via `nodes`, and feeds
/// [`InboundQueue`]. Datagrams from an unrecognized address are discarded,
/// the same policy the original receiver applies to `channel < 0`.
pub async fn run_datagram_receiver(
    socket: Arc<dyn DatagramSocket>,
    nodes: Arc<NodeTable>,
    inbound: Arc<InboundQueue>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let recv = tokio::time::timeout(POLL_INTERVAL, socket.recv_from(&mut buf)).await;
        let (n, from) = match recv {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                warn!(error = %err, "datagram receive failed");
                continue;
            }
            Err(_) => continue, // poll tick, nothing arrived
        };

        let Some(sender) = nodes.resolve_addr(from) else {
            debug!(%from, "discarding datagram from unrecognized address");
            continue;
        };

        let mut data = BytesMut::with_capacity(n);
        data.extend_from_slice(&buf[..n]);
        inbound
            .push(NetMessage {
                sender,
                data: data.freeze(),
            })
            .await;
    }
}

/// Reads one length-prefixed frame from a reliable stream:
/// `[u16 big-endian length][payload]`.
pub async fn recv_reliable_frame(
    stream: &mut dyn ReliableStream,
) -> std::io::Result<Bytes> {
    let mut len_buf = [0u8; 2];
    stream.recv_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.recv_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

/// Writes one length-prefixed frame to a reliable stream.
pub async fn send_reliable_frame(
    stream: &mut dyn ReliableStream,
    payload: &[u8],
) -> std::io::Result<()> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "reliable frame too large")
    })?;
    let mut framed = Vec::with_capacity(2 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(payload);
    stream.send_all(&framed).await
}

/// Continuously reads frames from one peer's reliable stream and feeds
/// [`InboundQueue`] until the peer closes or errors, at which point it
/// returns so the caller can run node teardown.
pub async fn run_stream_reader(
    sender: NodeId,
    stream: Arc<tokio::sync::Mutex<Box<dyn ReliableStream>>>,
    inbound: Arc<InboundQueue>,
) {
    loop {
        let frame = {
            let mut guard = stream.lock().await;
            recv_reliable_frame(guard.as_mut()).await
        };
        match frame {
            Ok(data) => inbound.push(NetMessage { sender, data }).await,
            Err(err) => {
                debug!(%sender, error = %err, "reliable stream closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{EndpointTransport, LoopbackNetwork, LoopbackTransport};

    #[tokio::test]
    async fn reliable_frame_round_trips() {
        let net = LoopbackNetwork::new();
        let server = LoopbackTransport::new(Arc::clone(&net));
        let client = LoopbackTransport::new(Arc::clone(&net));
        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();

        let listener = server.open_tcp_listener(addr).await.unwrap();
        let (client_result, accept_result) =
            tokio::join!(client.connect_tcp(addr), listener.accept());
        let mut client_stream = client_result.unwrap();
        let (mut server_stream, _peer) = accept_result.unwrap();

        send_reliable_frame(server_stream.as_mut(), b"hello").await.unwrap();
        let received = recv_reliable_frame(client_stream.as_mut()).await.unwrap();
        assert_eq!(&received[..], b"hello");
    }
}
