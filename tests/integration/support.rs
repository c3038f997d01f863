//! Shared harness for the end-to-end scenario suites (spec §8): spins
//! up a real `MessageServer` behind an axum `Router` on an ephemeral
//! loopback port, the same way `services/meshline-server/src/main.rs`
//! wires the handler into its router, just bound to port 0 for test
//! isolation.
#![allow(dead_code)]

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use meshline::{ws_handler, MessageServer};
use tokio::net::TcpListener;

pub async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Starts `server`'s background machinery and serves it on `listener`,
/// returning the `ws://.../ws` URL new connections should dial.
pub async fn serve(server: MessageServer, listener: TcpListener) -> String {
    let addr = listener.local_addr().unwrap();
    server.start().await;
    let app = Router::new().route("/ws", get(ws_handler)).with_state(server);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
    });
    format!("ws://{addr}/ws")
}

/// Convenience for single-server scenarios that don't need the bound
/// address ahead of constructing the server.
pub async fn spawn(server: MessageServer) -> String {
    let (listener, _addr) = bind().await;
    serve(server, listener).await
}
