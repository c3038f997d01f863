//! Duplicate-`reqId` rejection, UID-bind displacement, and heartbeat
//! timeout (spec §8 scenarios E3, E4, E5).

mod support;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meshline::{close_codes, ClusterDispatcher, MessageServer, Packet, ServerConfig, Uid};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsSocket = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn send_packet(socket: &mut WsSocket, route: &str, req_id: u64, message: serde_json::Value) {
    let packet = Packet::new(route, req_id, message);
    let text = serde_json::to_string(&packet).unwrap();
    socket.send(Message::Text(text.into())).await.unwrap();
}

/// Reads frames until the socket closes, returning the close code.
async fn read_close_code(socket: &mut WsSocket) -> u16 {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("connection did not close in time")
        {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("connection dropped without a close frame"),
        }
    }
}

#[tokio::test]
async fn duplicate_req_id_closes_with_repeat_error() {
    let server = MessageServer::new(ServerConfig::default(), ClusterDispatcher::new(None));
    server
        .set_router(
            "noop",
            Arc::new(|_server, _session, _packet| {
                Box::pin(async move {}) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            }),
        )
        .await;

    let url = support::spawn(server).await;
    let (mut socket, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();

    send_packet(&mut socket, "noop", 1, json!(null)).await;
    send_packet(&mut socket, "noop", 1, json!(null)).await;

    assert_eq!(read_close_code(&mut socket).await, close_codes::REPEAT_ERROR);
}

#[tokio::test]
async fn binding_the_same_uid_twice_displaces_the_older_session() {
    let server = MessageServer::new(ServerConfig::default(), ClusterDispatcher::new(None));
    server
        .set_router(
            "bind",
            Arc::new(|server, session, packet| {
                Box::pin(async move {
                    let uid = packet.message["uid"].as_str().unwrap_or_default().to_owned();
                    let who = packet.message["who"].clone();
                    server.bind_uid(&session, Uid::new(uid), true).await;
                    session.context_set("who", who).await;
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            }),
        )
        .await;

    let url = support::spawn(server.clone()).await;

    let (mut socket_a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    send_packet(&mut socket_a, "bind", 1, json!({"uid": "u1", "who": "A"})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut socket_b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    send_packet(&mut socket_b, "bind", 1, json!({"uid": "u1", "who": "B"})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(read_close_code(&mut socket_a).await, close_codes::NEWBIND);

    let bound = server.state().get_by_uid(&Uid::new("u1")).await.expect("uid should still be bound");
    assert_eq!(bound.context_get("who").await, Some(json!("B")));
}

#[tokio::test]
async fn a_session_that_stops_sending_heartbeats_is_closed_for_timeout() {
    let config = ServerConfig::default()
        .with_cycle(Duration::from_millis(10_000))
        .with_timeout(Duration::from_millis(30_000));
    config.validate().unwrap();
    let server = MessageServer::new(config, ClusterDispatcher::new(None));

    let url = support::spawn(server).await;
    let (mut socket, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();
    send_packet(&mut socket, meshline::routes::HEARTICK, 1, json!(1)).await;

    // Drain the heartick echo, then go silent and wait out the timeout.
    let _ = tokio::time::timeout(Duration::from_secs(2), socket.next()).await;

    let code = tokio::time::timeout(Duration::from_secs(45), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
                Some(Ok(_)) => continue,
                _ => panic!("connection dropped without a close frame"),
            }
        }
    })
    .await
    .expect("session was not closed for timeout within 45s");

    assert_eq!(code, close_codes::TIMEOUT);
}
