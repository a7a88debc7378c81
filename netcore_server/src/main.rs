//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p netcore_server -- [--addr 127.0.0.1] [--control-port 13209] [--data-port 13209] [--max-players 16]
//!
//! Listens for client control connections, admits them through the JOIN
//! handshake, and services the datagram channel for joined peers.
//!
//! Console commands:
//!   status          - Show queue depth and connection count
//!   kick <node-id>  - Terminate a connected node
//!   quit            - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use netcore_server::server::NetServer;
use netcore_shared::config::NetConfig;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::info;

fn parse_args() -> NetConfig {
    let mut cfg = NetConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.ip_address = args[i + 1].clone();
                i += 2;
            }
            "--control-port" if i + 1 < args.len() => {
                cfg.control_port = args[i + 1].parse().unwrap_or(0);
                i += 2;
            }
            "--data-port" if i + 1 < args.len() => {
                cfg.data_port = args[i + 1].parse().unwrap_or(0);
                i += 2;
            }
            "--max-players" if i + 1 < args.len() => {
                cfg.max_players = args[i + 1].parse().unwrap_or(cfg.max_players);
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    info!(addr = %cfg.ip_address, control_port = cfg.resolved_control_port(), data_port = cfg.resolved_data_port(), "starting server");

    let mut server = NetServer::new(cfg).await.context("init networking core")?;

    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status', 'kick <node-id>', or 'quit'.");
    println!();

    let tick_interval = Duration::from_millis(16);
    let mut next_tick = Instant::now();

    loop {
        let events = server.step().await?;
        for event in events {
            info!(?event, "lifecycle event");
        }
        while let Some(message) = server.get_packet().await {
            tracing::debug!(sender = %message.sender, len = message.data.len(), "inbound message");
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
