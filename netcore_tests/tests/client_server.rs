//! Full socket-based integration tests for client <-> server communication.

use std::time::Duration;

use netcore_client::client::NetClient;
use netcore_server::server::bind_ephemeral;
use netcore_shared::config::NetConfig;
use netcore_shared::event::NetEvent;
use netcore_shared::service::SERVER_NODE;

/// Full integration: spawn server, connect client through discovery + JOIN,
/// exchange an unreliable datagram, then disconnect and observe the
/// lifecycle events on both ends.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_server_full_roundtrip() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let mut server = bind_ephemeral().await?;
    let server_addr = server.control_addr().expect("server control listener bound");

    // Drive the server's accept + control-session loop in the background.
    let server_task = tokio::spawn(async move {
        for _ in 0..200 {
            let events = server.step().await?;
            if server.connected_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = &events;
        }
        Ok::<_, anyhow::Error>(server)
    });

    let client_cfg = NetConfig {
        player_name: "TestPlayer".to_string(),
        ..Default::default()
    };
    let mut client = NetClient::new(client_cfg).await?;
    client.connect(server_addr).await?;

    // Exchange an unreliable datagram once the transmitter/receiver tasks
    // have had a moment to settle.
    client.send(b"ping").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut server = server_task.await??;
    let received = server.get_packet().await;
    assert!(received.is_some(), "server never received client datagram");
    let message = received.unwrap();
    assert_eq!(&message.data[..], b"ping");

    // Reply on the data plane and confirm the client sees it.
    server.service().send_data(message.sender, b"pong").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let reply = client.get_packet().await;
    assert!(reply.is_some(), "client never received server reply");
    assert_eq!(&reply.unwrap().data[..], b"pong");

    client.disconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let client_events = client.drain_events();
    assert!(
        client_events.iter().any(|e| matches!(e, NetEvent::ClientExit { id } if *id == SERVER_NODE)),
        "client did not observe its own disconnect as a ClientExit on node 0"
    );

    server.shutdown().await;
    Ok(())
}
