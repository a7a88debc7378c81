//! Client wrapper around the networking core.
//!
//! Owns a [`NetService`] in the [`Role::Client`] role plus the console
//! command dispatch the binary drives from stdin. Discovery, JOIN, and
//! teardown are thin pass-throughs to `NetService`; this module's own job
//! is turning a typed connection state into console feedback.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use netcore_shared::config::NetConfig;
use netcore_shared::event::NetEvent;
use netcore_shared::receiver::NetMessage;
use netcore_shared::service::{NetService, Role};
use netcore_shared::transport::{EndpointTransport, TokioTransport};
use tracing::info;

/// Client connection state, mirroring the handshake's observable stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Discovering,
    Connected,
}

/// High-level networking client driven by the stdin console loop.
pub struct NetClient {
    pub cfg: NetConfig,
    pub state: ClientState,
    service: NetService,
}

impl NetClient {
    pub async fn new(cfg: NetConfig) -> anyhow::Result<Self> {
        let transport: Arc<dyn EndpointTransport> = Arc::new(TokioTransport);
        let service = NetService::init_service(Role::Client, cfg.clone(), transport)
            .await
            .context("init networking core")?;
        Ok(Self {
            cfg,
            state: ClientState::Disconnected,
            service,
        })
    }

    /// Runs discovery against `addr`, then performs the JOIN handshake.
    pub async fn connect(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        self.state = ClientState::Discovering;
        self.service.look_for_hosts(addr).await.context("look_for_hosts")?;
        if let Some(info) = self.service.get_host_info(0) {
            info!(name = %info.name, players = info.player_count, max = info.max_players, "found host");
        }
        self.service
            .connect(&self.cfg.player_name)
            .await
            .context("join handshake")?;
        self.state = ClientState::Connected;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.service.disconnect();
        self.state = ClientState::Disconnected;
    }

    pub async fn get_packet(&self) -> Option<NetMessage> {
        self.service.get_packet().await
    }

    pub fn drain_events(&self) -> Vec<NetEvent> {
        self.service.drain_events()
    }

    /// Sends an unreliable message to the server (node 0).
    pub async fn send(&self, data: &[u8]) {
        self.service.send_data(netcore_shared::service::SERVER_NODE, data).await;
    }

    /// Executes a console command, returning the lines to print.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.trim().split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Vec::new();
        };
        match cmd {
            "status" => vec![
                format!("state: {:?}", self.state),
                format!("available: {}", self.service.is_available()),
            ],
            "disconnect" => {
                self.disconnect();
                vec!["disconnected".to_string()]
            }
            "quit" | "exit" => std::process::exit(0),
            _ => vec![format!("unknown command: {cmd}")],
        }
    }

    pub async fn shutdown(&mut self) {
        self.service.shutdown_service().await;
    }
}
