use std::time::Duration;

use netcore_server::server::bind_ephemeral;

/// Smoke test: a freshly bound server can run a few ticks with no
/// connected peers without panicking or erroring.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let mut server = bind_ephemeral().await?;
    for _ in 0..3 {
        server.step().await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server.connected_count(), 0);
    server.shutdown().await;
    Ok(())
}
