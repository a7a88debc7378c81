//! Endpoint Transports.
//!
//! The original engine depended directly on SDL_net for every socket it
//! touched. That cross-cutting dependency is re-expressed here as a trait
//! seam: the control protocol, node table, and queue/receiver machinery are
//! written against [`ReliableStream`], [`DatagramSocket`] and
//! [`StreamListener`] rather than against `tokio::net` directly.
//!
//! [`TokioTransport`] is the production implementation. [`LoopbackTransport`]
//! wires two peers together with in-process channels so control-protocol and
//! queue behaviour can be unit-tested without binding real sockets.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

/// A reliable, ordered byte stream to exactly one peer.
#[async_trait]
pub trait ReliableStream: Send + Sync {
    async fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// An unreliable, unordered datagram endpoint shared by every peer.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Accepts incoming [`ReliableStream`] connections.
#[async_trait]
pub trait StreamListener: Send + Sync {
    async fn accept(&self) -> io::Result<(Box<dyn ReliableStream>, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Opens the sockets the core needs. Implementations do not retain any
/// protocol state; they are pure I/O factories.
#[async_trait]
pub trait EndpointTransport: Send + Sync {
    async fn open_tcp_listener(&self, addr: SocketAddr) -> io::Result<Box<dyn StreamListener>>;
    async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<Box<dyn ReliableStream>>;
    async fn open_udp(&self, addr: SocketAddr) -> io::Result<Box<dyn DatagramSocket>>;
}

// ─── Tokio implementation ───

#[async_trait]
impl ReliableStream for TcpStream {
    async fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.read_exact(buf).await.map(|_| ())
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_all(buf).await
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

struct TokioUdp(UdpSocket);

#[async_trait]
impl DatagramSocket for TokioUdp {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.0.send_to(buf, addr).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }
}

struct TokioListener(TcpListener);

#[async_trait]
impl StreamListener for TokioListener {
    async fn accept(&self) -> io::Result<(Box<dyn ReliableStream>, SocketAddr)> {
        let (stream, addr) = self.0.accept().await?;
        Ok((Box::new(stream), addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }
}

/// Production transport backed by real OS sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTransport;

#[async_trait]
impl EndpointTransport for TokioTransport {
    async fn open_tcp_listener(&self, addr: SocketAddr) -> io::Result<Box<dyn StreamListener>> {
        Ok(Box::new(TokioListener(TcpListener::bind(addr).await?)))
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<Box<dyn ReliableStream>> {
        Ok(Box::new(TcpStream::connect(addr).await?))
    }

    async fn open_udp(&self, addr: SocketAddr) -> io::Result<Box<dyn DatagramSocket>> {
        Ok(Box::new(TokioUdp(UdpSocket::bind(addr).await?)))
    }
}

// ─── In-process loopback implementation, for deterministic tests ───

type DatagramTx = mpsc::UnboundedSender<(SocketAddr, Bytes)>;
type DatagramRx = AsyncMutex<mpsc::UnboundedReceiver<(SocketAddr, Bytes)>>;

/// Shared registry a pair of [`LoopbackTransport`]s use to find each other.
/// Analogous to binding two real sockets on `127.0.0.1` except nothing ever
/// touches the OS network stack.
#[derive(Default)]
pub struct LoopbackNetwork {
    datagram_peers: Mutex<HashMap<SocketAddr, DatagramTx>>,
    stream_listeners: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<LoopbackStream>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// An in-memory duplex byte stream standing in for a TCP connection.
pub struct LoopbackStream {
    peer_addr: SocketAddr,
    read_half: tokio::io::DuplexStream,
}

#[async_trait]
impl ReliableStream for LoopbackStream {
    async fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.read_half.read_exact(buf).await.map(|_| ())
    }

    async fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.read_half.write_all(buf).await
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer_addr)
    }
}

struct LoopbackDatagram {
    local_addr: SocketAddr,
    net: Arc<LoopbackNetwork>,
    rx: DatagramRx,
}

#[async_trait]
impl DatagramSocket for LoopbackDatagram {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some((from, payload)) => {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                Ok((n, from))
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "loopback closed")),
        }
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let peer_tx = self
            .net
            .datagram_peers
            .lock()
            .get(&addr)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no such datagram peer"))?;
        peer_tx
            .send((self.local_addr, Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

struct LoopbackListener {
    local_addr: SocketAddr,
    rx: AsyncMutex<mpsc::UnboundedReceiver<LoopbackStream>>,
}

#[async_trait]
impl StreamListener for LoopbackListener {
    async fn accept(&self) -> io::Result<(Box<dyn ReliableStream>, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(stream) => {
                let addr = stream.peer_addr;
                Ok((Box::new(stream), addr))
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "loopback closed")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

/// Deterministic, in-process stand-in for [`TokioTransport`] used by unit
/// tests that exercise the control protocol without binding real sockets.
pub struct LoopbackTransport {
    net: Arc<LoopbackNetwork>,
}

impl LoopbackTransport {
    pub fn new(net: Arc<LoopbackNetwork>) -> Self {
        Self { net }
    }
}

#[async_trait]
impl EndpointTransport for LoopbackTransport {
    async fn open_tcp_listener(&self, addr: SocketAddr) -> io::Result<Box<dyn StreamListener>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.net.stream_listeners.lock().insert(addr, tx);
        Ok(Box::new(LoopbackListener {
            local_addr: addr,
            rx: AsyncMutex::new(rx),
        }))
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> io::Result<Box<dyn ReliableStream>> {
        let listener_tx = self
            .net
            .stream_listeners
            .lock()
            .get(&addr)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no listener"))?;

        let (client_half, server_half) = tokio::io::duplex(64 * 1024);
        let client_addr = "127.0.0.1:0".parse().unwrap();
        listener_tx
            .send(LoopbackStream {
                peer_addr: client_addr,
                read_half: server_half,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "listener gone"))?;

        Ok(Box::new(LoopbackStream {
            peer_addr: addr,
            read_half: client_half,
        }))
    }

    async fn open_udp(&self, addr: SocketAddr) -> io::Result<Box<dyn DatagramSocket>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.net.datagram_peers.lock().insert(addr, tx);
        Ok(Box::new(LoopbackDatagram {
            local_addr: addr,
            net: Arc::clone(&self.net),
            rx: AsyncMutex::new(rx),
        }))
    }
}
