//! Service façade.
//!
//! `NetService` is the single entry point the rest of the engine talks to:
//! it owns the Node Table, the Send Queue, the inbound message pipeline, and
//! the transmitter/receiver tasks, and exposes the public operations named
//! in the external interface (`init_service`, `send_data`, `listen`, ...).
//! Everything in [`crate::node`], [`crate::queue`], [`crate::receiver`] and
//! [`crate::control`] is deliberately transport- and policy-agnostic; this
//! module is where those pieces are wired together and where admission
//! policy (`max_players`) and lifecycle events actually get applied.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
#[cfg(feature = "net-emulation")]
use tracing::debug;
use tracing::{info, warn};

use crate::config::NetConfig;
use crate::control::{
    self, extract_server_info, format_enter, format_join, format_time_reply, parse_command,
    parse_enter, read_line, read_until_end_marker, write_line, ControlCommand, ServerInfo,
};
use crate::error::{NetError, NetResult};
use crate::event::{EventQueue, NetEvent};
use crate::node::{NodeId, NodeTable};
use crate::pool::{Packet, MAX_DATAGRAM_SIZE};
use crate::queue::{run_transmitter, SendQueue};
use crate::receiver::{run_datagram_receiver, run_stream_reader, InboundQueue, NetMessage};
use crate::transport::{DatagramSocket, EndpointTransport, ReliableStream, StreamListener};

/// Reserved on the client: node 0 always denotes the server.
pub const SERVER_NODE: NodeId = NodeId(0);

/// Which role this service instance plays. Only a server accepts incoming
/// stream connections; a client has exactly one node (the server, slot 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

struct LocatedHost {
    addr: SocketAddr,
    info: ServerInfo,
}

/// Background tasks owned by the service, joined on shutdown.
struct Workers {
    transmitter: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

/// The networking core's service instance.
pub struct NetService {
    role: Role,
    config: NetConfig,
    transport: Arc<dyn EndpointTransport>,
    nodes: Arc<NodeTable>,
    send_queue: Arc<SendQueue>,
    inbound: Arc<InboundQueue>,
    events: Arc<EventQueue>,
    datagram_socket: Arc<dyn DatagramSocket>,
    listener: parking_lot::Mutex<Option<Arc<dyn StreamListener>>>,
    online: Arc<AtomicBool>,
    started_at: Instant,
    workers: parking_lot::Mutex<Option<Workers>>,
    located: parking_lot::Mutex<Option<LocatedHost>>,
    /// Per-connection control-session and stream-reader tasks, joined on
    /// shutdown alongside `workers` so no task the core started outlives it.
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Runs [`run_stream_reader`] to completion, then tears the node down:
/// the server posts `ClientExit` (the same event an explicit `BYE` or kick
/// produces), while the client posts `EndConnection` to tell the game loop
/// its link to the server is gone. Free-standing rather than a method so it
/// can be driven from a spawned task without requiring `Arc<NetService>`.
async fn drive_stream_reader(
    role: Role,
    id: NodeId,
    conn: Arc<AsyncMutex<Box<dyn ReliableStream>>>,
    inbound: Arc<InboundQueue>,
    nodes: Arc<NodeTable>,
    send_queue: Arc<SendQueue>,
    events: Arc<EventQueue>,
) {
    run_stream_reader(id, conn, inbound).await;
    let outcome = nodes.terminate(id);
    send_queue.cancel_node(id);
    if outcome.was_joined {
        match role {
            Role::Client => events.post(NetEvent::EndConnection { id }),
            Role::Server => events.post(NetEvent::ClientExit { id }),
        }
    }
}

impl NetService {
    /// Opens the sockets this role needs and starts the transmitter and
    /// receiver tasks. Any socket failure fails the whole call; no partial
    /// service is left running. Ports `0` in `config` are substituted with
    /// the documented defaults ([`crate::config::DEFAULT_TCP_PORT`] /
    /// [`crate::config::DEFAULT_UDP_PORT`]) before binding.
    pub async fn init_service(
        role: Role,
        config: NetConfig,
        transport: Arc<dyn EndpointTransport>,
    ) -> anyhow::Result<Self> {
        let control_port = config.resolved_control_port();
        let data_port = config.resolved_data_port();
        Self::init_service_on_ports(role, config, transport, control_port, data_port).await
    }

    /// Test-only entry point that binds true OS-assigned ephemeral ports
    /// (`0`) rather than substituting the production defaults, so
    /// concurrent test processes never collide on a well-known port.
    pub async fn init_service_ephemeral(
        role: Role,
        config: NetConfig,
        transport: Arc<dyn EndpointTransport>,
    ) -> anyhow::Result<Self> {
        Self::init_service_on_ports(role, config, transport, 0, 0).await
    }

    async fn init_service_on_ports(
        role: Role,
        config: NetConfig,
        transport: Arc<dyn EndpointTransport>,
        control_port: u16,
        data_port: u16,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let bind_ip: std::net::IpAddr = if role == Role::Server {
            config.ip_address.parse().unwrap_or(std::net::IpAddr::from([0, 0, 0, 0]))
        } else {
            std::net::IpAddr::from([0, 0, 0, 0])
        };

        let listener = if role == Role::Server {
            let addr = SocketAddr::new(bind_ip, control_port);
            Some(
                transport
                    .open_tcp_listener(addr)
                    .await
                    .with_context(|| format!("binding control listener on {addr}"))?
                    .into(),
            )
        } else {
            None
        };

        let datagram_addr = SocketAddr::new(bind_ip, data_port);
        let datagram_socket: Arc<dyn DatagramSocket> = transport
            .open_udp(datagram_addr)
            .await
            .with_context(|| format!("binding datagram socket on {datagram_addr}"))?
            .into();

        let nodes = Arc::new(match role {
            Role::Server => NodeTable::new(config.max_players),
            Role::Client => NodeTable::new_client(config.max_players),
        });
        let send_queue = Arc::new(SendQueue::new());
        let inbound = Arc::new(InboundQueue::new(256));
        let events = Arc::new(EventQueue::new());
        let online = Arc::new(AtomicBool::new(true));

        let transmitter = tokio::spawn(run_transmitter(
            Arc::clone(&send_queue),
            Arc::clone(&datagram_socket),
            Arc::clone(&nodes),
        ));
        let receiver = tokio::spawn(run_datagram_receiver(
            Arc::clone(&datagram_socket),
            Arc::clone(&nodes),
            Arc::clone(&inbound),
        ));

        info!(?role, addr = %datagram_addr, "networking core online");

        Ok(Self {
            role,
            config,
            transport,
            nodes,
            send_queue,
            inbound,
            events,
            datagram_socket,
            listener: parking_lot::Mutex::new(listener),
            online,
            started_at: Instant::now(),
            workers: parking_lot::Mutex::new(Some(Workers { transmitter, receiver })),
            located: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Flips `online` off, wakes the transmitter, joins the worker tasks and
    /// every per-connection task this instance ever spawned, and terminates
    /// every registered node (joined or still mid-handshake) so lifecycle
    /// events fire for any peer that was still connected and no socket the
    /// core opened is left behind.
    pub async fn shutdown_service(&self) {
        self.online.store(false, Ordering::SeqCst);
        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            workers.transmitter.abort();
            workers.receiver.abort();
            let _ = workers.transmitter.await;
            let _ = workers.receiver.await;
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        for id in self.nodes.registered_ids() {
            self.terminate_node(id);
        }
        info!("networking core shut down");
    }

    pub fn is_available(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn joined_count(&self) -> usize {
        self.nodes.joined_count()
    }

    /// Whether this instance has any peer bound to a non-loopback address;
    /// a thin convenience the game module uses to decide whether to print
    /// internet-facing connection info.
    pub fn using_internet(&self) -> bool {
        self.nodes.joined_ids().into_iter().any(|id| {
            self.nodes
                .datagram_addr(id)
                .map(|addr| !addr.ip().is_loopback())
                .unwrap_or(false)
        })
    }

    pub fn get_protocol_name(&self) -> &'static str {
        "netcore/1"
    }

    /// The control listener's bound address, for a server that resolved an
    /// OS-assigned ephemeral port at startup.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().and_then(|l| l.local_addr().ok())
    }

    // ─── Discovery (client) ───

    /// Opens a stream to `addr`, asks `INFO`, and records the parsed
    /// `ServerInfo` as the single located host.
    pub async fn look_for_hosts(&self, addr: SocketAddr) -> NetResult<()> {
        let mut stream = self
            .transport
            .connect_tcp(addr)
            .await
            .map_err(|_| NetError::Resource(format!("could not connect to {addr}")))?;
        write_line(stream.as_mut(), "INFO\n").await?;
        let reply = read_until_end_marker(stream.as_mut(), Duration::from_secs(5)).await?;
        match extract_server_info(&reply) {
            Some(info) => {
                *self.located.lock() = Some(LocatedHost { addr, info });
                Ok(())
            }
            None => Err(NetError::Protocol("reply missing BEGIN/END markers".to_string())),
        }
    }

    pub fn get_host_count(&self) -> usize {
        if self.located.lock().is_some() {
            1
        } else {
            0
        }
    }

    pub fn get_host_info(&self, index: usize) -> Option<ServerInfo> {
        if index != 0 {
            return None;
        }
        self.located.lock().as_ref().map(|h| h.info.clone())
    }

    /// Serves `INFO\n`/`TIME\n` for a not-yet-joined peer, replying
    /// `BEGIN\n...\nEND\n` / the elapsed-seconds line.
    pub async fn reply_info(&self, stream: &mut dyn ReliableStream) -> NetResult<()> {
        let info = ServerInfo {
            name: self.config.player_name.clone(),
            game: "netcore".to_string(),
            player_count: self.nodes.joined_count(),
            max_players: self.config.max_players,
            can_join: self.nodes.joined_count() < self.config.max_players,
        };
        let body = format!("BEGIN\n{}END\n", info.to_lines());
        write_line(stream, &body).await
    }

    pub async fn reply_time(&self, stream: &mut dyn ReliableStream) -> NetResult<()> {
        write_line(stream, &format_time_reply(self.started_at.elapsed())).await
    }

    // ─── Connection lifecycle (client) ───

    /// Opens a stream to the located host, performs the `JOIN` handshake,
    /// and on success binds node 0 to the server's datagram address.
    pub async fn connect(&self, player_name: &str) -> NetResult<()> {
        let (addr, _info) = {
            let guard = self.located.lock();
            let host = guard.as_ref().ok_or_else(|| NetError::Protocol("no located host".to_string()))?;
            (host.addr, host.info.clone())
        };

        let mut stream = self
            .transport
            .connect_tcp(addr)
            .await
            .map_err(|_| NetError::Resource(format!("could not connect to {addr}")))?;

        let recv_udp_port = self.datagram_socket.local_addr().map(|a| a.port()).unwrap_or(0);
        write_line(stream.as_mut(), &format_join(recv_udp_port, player_name)).await?;

        let reply = read_line(stream.as_mut()).await?;
        let server_udp_port = match parse_enter(&reply) {
            Ok(port) => port,
            Err(err) => {
                control::log_rejected_command(&reply, &err);
                return Err(err);
            }
        };

        let server_addr = SocketAddr::new(addr.ip(), server_udp_port);
        let id = self
            .nodes
            .register_new_socket(stream)
            .map_err(|_| NetError::Resource("node table full".to_string()))?;
        self.nodes.set_datagram_addr(id, server_addr);
        self.nodes
            .join_node(id, player_name.to_string())
            .map_err(|e| {
                self.nodes.terminate(id);
                e
            })?;
        self.events.post(NetEvent::ClientEntry { id });

        if let Some(conn) = self.nodes.conn(id) {
            let handle = tokio::spawn(drive_stream_reader(
                self.role,
                id,
                conn,
                Arc::clone(&self.inbound),
                Arc::clone(&self.nodes),
                Arc::clone(&self.send_queue),
                Arc::clone(&self.events),
            ));
            self.tasks.lock().push(handle);
        }
        Ok(())
    }

    /// Tears node 0 down and closes the stream, the client-side mirror of
    /// `terminate_node` on the server.
    pub fn disconnect(&self) {
        self.terminate_node(SERVER_NODE);
    }

    // ─── Connection lifecycle (server) ───

    pub fn server_open(&self) -> bool {
        self.listener.lock().is_some()
    }

    pub fn server_close(&self) {
        *self.listener.lock() = None;
    }

    /// Accepts one pending connection, if any, registering it as an
    /// unjoined node. Non-blocking: returns immediately with `Ok(None)`
    /// when nothing is waiting, since listening is driven by `listen`'s
    /// cooperative poll rather than a dedicated accept task.
    pub async fn try_accept(&self) -> NetResult<Option<NodeId>> {
        let listener = self.listener.lock().clone();
        let Some(listener) = listener else {
            return Ok(None);
        };
        let accept = listener.accept();
        match tokio::time::timeout(Duration::from_millis(0), accept).await {
            Ok(Ok((stream, _peer))) => {
                let id = self
                    .nodes
                    .register_new_socket(stream)
                    .map_err(|_| NetError::Resource("node table full".to_string()))?;
                Ok(Some(id))
            }
            Ok(Err(err)) => {
                warn!(error = %err, "accept failed");
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    /// Drives one tick of the stream-socket poller: accepts any pending
    /// connections and spawns a control session per newly accepted node to
    /// service its pre-JOIN commands. Once a node completes `JOIN`, the
    /// control session hands reading off to [`run_stream_reader`] and exits.
    pub async fn listen(self: &Arc<Self>) -> NetResult<()> {
        if self.role == Role::Server {
            while let Some(id) = self.try_accept().await? {
                info!(%id, "accepted control connection");
                let service = Arc::clone(self);
                let handle = tokio::spawn(async move { service.run_control_session(id).await });
                self.tasks.lock().push(handle);
            }
        }
        Ok(())
    }

    /// Services one newly accepted node's pre-JOIN control dialog until it
    /// either joins (at which point `service_control_command` has already
    /// spawned the post-JOIN reader) or the connection is terminated.
    async fn run_control_session(self: Arc<Self>, id: NodeId) {
        loop {
            match self.service_control_command(id).await {
                Ok(()) => {
                    if self.nodes.is_joined(id) {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }

    /// Reads and dispatches exactly one control command from an unjoined
    /// node's stream; on success that may transition the node to joined.
    pub async fn service_control_command(&self, id: NodeId) -> NetResult<()> {
        let conn = self.nodes.conn(id).ok_or_else(|| NetError::Protocol("unknown node".to_string()))?;
        let mut guard = conn.lock().await;
        let line = read_line(guard.as_mut()).await?;
        let command = match parse_command(&line) {
            Ok(cmd) => cmd,
            Err(err) => {
                control::log_rejected_command(&line, &err);
                let _ = write_line(guard.as_mut(), "Huh?\n").await;
                drop(guard);
                self.terminate_node(id);
                return Err(err);
            }
        };

        match command {
            ControlCommand::Info => self.reply_info(guard.as_mut()).await,
            ControlCommand::Time => self.reply_time(guard.as_mut()).await,
            ControlCommand::Bye => {
                drop(guard);
                self.terminate_node(id);
                Ok(())
            }
            ControlCommand::Join { udp_port, name } => {
                let peer_ip = guard
                    .peer_addr()
                    .map(|a| a.ip())
                    .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0]));
                match self.nodes.join_node(id, name) {
                    Ok(()) => {
                        self.nodes.set_datagram_addr(id, SocketAddr::new(peer_ip, udp_port));
                        let local_udp = self.datagram_socket.local_addr().map(|a| a.port()).unwrap_or(0);
                        write_line(guard.as_mut(), &format_enter(local_udp)).await?;
                        drop(guard);
                        self.events.post(NetEvent::ClientEntry { id });
                        if let Some(conn) = self.nodes.conn(id) {
                            let handle = tokio::spawn(drive_stream_reader(
                                self.role,
                                id,
                                conn,
                                Arc::clone(&self.inbound),
                                Arc::clone(&self.nodes),
                                Arc::clone(&self.send_queue),
                                Arc::clone(&self.events),
                            ));
                            self.tasks.lock().push(handle);
                        }
                        Ok(())
                    }
                    Err(err) => {
                        let _ = write_line(guard.as_mut(), "BYE\n").await;
                        drop(guard);
                        self.terminate_node(id);
                        Err(err)
                    }
                }
            }
        }
    }

    /// Zeroes the node slot, nulls its queued sends, and posts
    /// `ClientExit` if it had completed JOIN. This is the orchestration
    /// layer `NodeTable::terminate` deliberately leaves out.
    pub fn terminate_node(&self, id: NodeId) {
        let outcome = self.nodes.terminate(id);
        self.send_queue.cancel_node(id);
        if outcome.was_joined {
            self.events.post(NetEvent::ClientExit { id });
        }
    }

    pub fn get_node_name(&self, id: NodeId) -> Option<String> {
        self.nodes.get_node_name(id)
    }

    // ─── Data plane ───

    /// Enqueues an unreliable datagram for `dst`. Oversized payloads are
    /// logged and refused, never truncated; the service being offline is
    /// likewise a silent no-op — this call never blocks on network I/O and
    /// never surfaces a hard error to game logic.
    pub async fn send_data(&self, dst: NodeId, data: &[u8]) {
        if !self.is_available() {
            return;
        }
        if data.len() > self.config.mtu.min(MAX_DATAGRAM_SIZE) {
            warn!(len = data.len(), mtu = self.config.mtu, "send_data payload exceeds mtu, dropping");
            return;
        }
        let Some(addr) = self.nodes.datagram_addr(dst) else {
            return;
        };
        if !self.nodes.is_joined(dst) {
            return;
        }
        let bytes = Bytes::copy_from_slice(data);
        self.nodes.increment_pending(dst, bytes.len() as u64);

        #[cfg(feature = "net-emulation")]
        {
            match crate::queue::emulated_delay(&self.config.emulation) {
                Some(crate::queue::EmulatedOutcome::Drop) => {
                    debug!(%dst, "net-emulation dropped outbound datagram");
                    self.nodes.decrement_pending(dst, bytes.len() as u64);
                    return;
                }
                Some(crate::queue::EmulatedOutcome::Send(delay)) => {
                    if let Err(err) = self.send_queue.enqueue(dst, addr, bytes, Some(delay)).await {
                        warn!(%dst, error = %err, "send_data failed to enqueue");
                        self.nodes.decrement_pending(dst, data.len() as u64);
                    }
                    return;
                }
                None => {}
            }
        }

        if let Err(err) = self.send_queue.enqueue(dst, addr, bytes, None).await {
            warn!(%dst, error = %err, "send_data failed to enqueue");
            self.nodes.decrement_pending(dst, data.len() as u64);
        }
    }

    /// Sends a reliable, length-framed message directly on `dst`'s stream
    /// socket, bypassing the queue entirely. Payloads over `u16::MAX` bytes
    /// are a programmer error and panic, per the documented fatal case.
    pub async fn send_data_reliable(&self, dst: NodeId, data: &[u8]) -> NetResult<()> {
        assert!(
            data.len() <= u16::MAX as usize,
            "send_data_reliable: payload of {} bytes exceeds u16::MAX",
            data.len()
        );
        let conn = self.nodes.conn(dst).ok_or(NetError::PeerClosed)?;
        let mut guard = conn.lock().await;
        crate::receiver::send_reliable_frame(guard.as_mut(), data)
            .await
            .map_err(|_| NetError::PeerClosed)
    }

    /// Pops the next inbound message, if any.
    pub async fn get_packet(&self) -> Option<NetMessage> {
        self.inbound.try_recv().await
    }

    /// Returns a pool-allocated packet buffer to the free list.
    pub fn return_buffer(&self, packet: Packet) {
        self.inbound.pool().release(packet);
    }

    pub fn get_send_queue_count(&self) -> usize {
        self.send_queue.len()
    }

    pub fn get_send_queue_size(&self, id: NodeId) -> u64 {
        self.nodes.counters_snapshot(id).map(|c| c.pending_bytes).unwrap_or(0)
    }

    /// Drains pending lifecycle events for the main loop to act on.
    pub fn drain_events(&self) -> Vec<NetEvent> {
        self.events.drain()
    }
}
