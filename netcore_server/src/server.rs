//! Server wrapper around the networking core.
//!
//! Owns a [`NetService`] in the [`Role::Server`] role, a stdin console
//! command channel, and the fixed-timestep tick loop that drives
//! `listen`/`get_packet`/lifecycle-event draining. The simulation itself is
//! out of scope for this crate; `on_message` is the seam a game module
//! would hook to interpret `NetMessage` payloads.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::Context;
use netcore_shared::config::NetConfig;
use netcore_shared::event::NetEvent;
use netcore_shared::node::NodeId;
use netcore_shared::receiver::NetMessage;
use netcore_shared::service::{NetService, Role};
use netcore_shared::transport::{EndpointTransport, TokioTransport};
use tokio::sync::mpsc;
use tracing::info;

/// The server process's view of the networking core, plus the stdin
/// console channel the binary wires up.
pub struct NetServer {
    pub cfg: NetConfig,
    service: Arc<NetService>,
    tick: u64,
    console_rx: Option<mpsc::Receiver<String>>,
}

impl NetServer {
    pub async fn new(cfg: NetConfig) -> anyhow::Result<Self> {
        let transport: Arc<dyn EndpointTransport> = Arc::new(TokioTransport);
        let service = NetService::init_service(Role::Server, cfg.clone(), transport)
            .await
            .context("init networking core")?;
        Ok(Self {
            cfg,
            service: Arc::new(service),
            tick: 0,
            console_rx: None,
        })
    }

    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn connected_count(&self) -> usize {
        self.service.joined_count()
    }

    /// Executes one fixed tick: drains console input, services the control
    /// listener, and drains lifecycle events. Inbound game messages are
    /// left in the queue for the caller to pull with `get_packet`, since
    /// interpreting them is outside this crate's scope.
    pub async fn step(&mut self) -> anyhow::Result<Vec<NetEvent>> {
        self.process_console_commands().await;
        self.service.listen().await.context("listen")?;
        self.tick += 1;
        Ok(self.service.drain_events())
    }

    async fn process_console_commands(&mut self) {
        let lines: Vec<String> = if let Some(rx) = &mut self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };
        for line in lines {
            for reply in self.exec_console(&line) {
                println!("{reply}");
            }
        }
    }

    /// Executes a console command, returning the lines to print. `kick`
    /// and `status` are the two operational hooks a running server needs;
    /// a richer console (cvars, `map`, etc.) is out of scope here.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.trim().split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Vec::new();
        };
        match cmd {
            "status" => vec![
                format!("tick: {}", self.tick),
                format!("connected clients: {}", self.connected_count()),
                format!("queued datagrams: {}", self.service.get_send_queue_count()),
                format!("available: {}", self.service.is_available()),
            ],
            "kick" => match tokens.get(1).and_then(|s| s.parse::<u8>().ok()) {
                Some(raw) => {
                    self.service.terminate_node(NodeId(raw));
                    vec![format!("kicked node {raw}")]
                }
                None => vec!["usage: kick <node-id>".to_string()],
            },
            "quit" | "exit" => {
                info!("server shutting down");
                std::process::exit(0);
            }
            _ => vec![format!("unknown command: {cmd}")],
        }
    }

    pub fn service(&self) -> &NetService {
        &self.service
    }

    /// The control listener's bound address, including the OS-assigned port
    /// when the server was started with `control_port: 0`.
    pub fn control_addr(&self) -> Option<std::net::SocketAddr> {
        self.service.control_addr()
    }

    pub async fn get_packet(&self) -> Option<NetMessage> {
        self.service.get_packet().await
    }

    pub async fn shutdown(&mut self) {
        self.service.shutdown_service().await;
    }
}

/// Binds a server on OS-assigned ephemeral ports, for integration tests.
pub async fn bind_ephemeral() -> anyhow::Result<NetServer> {
    let cfg = NetConfig {
        ip_address: IpAddr::V4(Ipv4Addr::LOCALHOST).to_string(),
        control_port: 0,
        data_port: 0,
        ..Default::default()
    };
    let transport: Arc<dyn EndpointTransport> = Arc::new(TokioTransport);
    let service = NetService::init_service_ephemeral(Role::Server, cfg.clone(), transport).await?;
    Ok(NetServer {
        cfg,
        service: Arc::new(service),
        tick: 0,
        console_rx: None,
    })
}
