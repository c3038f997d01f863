//! Round-trip echo and heartbeat echo (spec §8 scenarios E1, E2).

mod support;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meshline::{routes, BridgeClient, BridgeClientConfig, ClusterDispatcher, MessageServer, Packet, ResponseEnvelope, ServerConfig};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn echo_route_upper_cases_the_message_and_responds() {
    let server = MessageServer::new(ServerConfig::default(), ClusterDispatcher::new(None));
    server
        .set_router(
            "echo",
            Arc::new(|server, session, packet| {
                Box::pin(async move {
                    let upper = packet.message.as_str().unwrap_or_default().to_uppercase();
                    server.response(&session, &packet, ResponseEnvelope::ok(json!(upper)));
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            }),
        )
        .await;

    let url = support::spawn(server).await;
    let client = BridgeClient::spawn(BridgeClientConfig::new(url));
    client.connect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.is_connected());

    let response = client.request("echo", json!("hi")).await.unwrap();
    assert!(response.is_success());
    assert_eq!(response.data, json!("HI"));
    client.close();
}

#[tokio::test]
async fn heartick_is_echoed_back_verbatim_and_refreshes_the_session() {
    let server = MessageServer::new(ServerConfig::default(), ClusterDispatcher::new(None));
    let url = support::spawn(server).await;

    let (mut socket, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let sent = Packet::new(routes::HEARTICK, 7, json!(1000));
    socket.send(Message::Text(serde_json::to_string(&sent).unwrap().into())).await.unwrap();

    let echoed = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("heartick was not echoed back in time")
        .unwrap()
        .unwrap();
    let Message::Text(text) = echoed else {
        panic!("expected a text frame");
    };
    let received: Packet = serde_json::from_str(&text).unwrap();
    assert_eq!(received, sent);
}
