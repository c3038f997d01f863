//! Resilient reconnect after the remote end disappears (spec §8
//! scenario E7): `retry_count` climbs while the peer is unreachable and
//! resets to zero once a new connection succeeds.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::StreamExt;
use meshline::{BridgeClient, BridgeClientConfig};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;

async fn bind_same_addr(addr: SocketAddr) -> TcpListener {
    for _ in 0..40 {
        if let Ok(listener) = TcpListener::bind(addr).await {
            return listener;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("could not rebind {addr} after the original listener was dropped");
}

#[tokio::test]
async fn client_retries_while_the_server_is_down_and_reconnects_once_it_returns() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Accept exactly one connection, then drop both the stream and the
    // listener — simulating the server process disappearing.
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let _ = accept_async(stream).await;
        }
    });

    let client = BridgeClient::spawn(
        BridgeClientConfig::new(format!("ws://{addr}")).with_conntick(Duration::from_millis(200)),
    );
    client.connect();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.is_connected(), "client should connect to the initial listener");

    // The accept task above already returned (and dropped the listener
    // and socket) by the time the handshake completed, so the next
    // heartick/send will find the transport gone and conntick retries
    // will fail until we rebind below.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!client.is_connected(), "client should have noticed the dropped connection");
    let retries_while_down = client.retry_count();
    assert!(retries_while_down > 0, "client should have attempted at least one reconnect while the server was down");

    let listener = bind_same_addr(addr).await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        // Keep the connection open so the client observes it as live.
        while ws.next().await.is_some() {}
    });

    tokio::time::timeout(Duration::from_secs(3), async {
        while !client.is_connected() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("client did not reconnect once the server came back");

    assert_eq!(client.retry_count(), 0, "retry_count should reset on a successful reconnect");
    client.close();
}
