//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p netcore_client -- [--addr 127.0.0.1:13209] [--name Player]
//!
//! Discovers a host, performs the JOIN handshake, and services the console
//! command loop while draining lifecycle events and inbound messages.
//!
//! Console commands:
//!   status      - Show connection state
//!   disconnect  - Leave the server
//!   quit        - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::net::SocketAddr;

use anyhow::Context;
use netcore_client::client::NetClient;
use netcore_shared::config::NetConfig;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::info;

struct Args {
    cfg: NetConfig,
    addr: SocketAddr,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut cfg = NetConfig::default();
    let mut addr_str = "127.0.0.1:13209".to_string();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                addr_str = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    let addr = addr_str.parse().context("parse --addr")?;
    Ok(Args { cfg, addr })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { cfg, addr } = parse_args()?;
    info!(%addr, name = %cfg.player_name, "connecting to host");

    let mut client = NetClient::new(cfg).await.context("init networking core")?;
    client.connect(addr).await.context("connect")?;
    info!("connected");

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

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

    println!("Connected. Type 'status', 'disconnect', or 'quit'.");
    println!();

    let tick_interval = Duration::from_millis(16);
    let mut next_tick = Instant::now();

    loop {
        while let Ok(line) = console_rx.try_recv() {
            for reply in client.exec_console(&line) {
                println!("{reply}");
            }
        }

        for event in client.drain_events() {
            info!(?event, "lifecycle event");
        }

        while let Some(message) = client.get_packet().await {
            tracing::debug!(sender = %message.sender, len = message.data.len(), "inbound message");
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
