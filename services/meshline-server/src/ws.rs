//! The axum WebSocket handler and per-connection receive pipeline
//! (spec §4.4 "Connection accept" / "Receive pipeline").
//!
//! Grounded on `services/server/src/ws_forwarder.rs`'s accept-then-loop
//! shape and `ws_common.rs`'s small per-frame helpers, generalized from
//! a single forwarder protocol to the five-way reserved-route dispatch
//! this spec requires.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use meshline_protocol::envelope::InnerEnvelope;
use meshline_protocol::{close_codes, codec, routes, Packet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::MessageServer;
use crate::session::{Outbound, Session};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<MessageServer>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = resolve_ip(&headers, addr, server.config().forwarded_header.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, server, ip))
}

/// Prefer the configured forwarding header over the raw TCP peer
/// address, then normalize the result (spec §3 "ip").
fn resolve_ip(headers: &HeaderMap, addr: SocketAddr, forwarded_header: Option<&str>) -> String {
    let raw = forwarded_header
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| addr.ip().to_string());
    normalize_ip(&raw)
}

/// IPv6-to-IPv4 stripping and loopback collapsing (spec §3 "ip").
fn normalize_ip(ip: &str) -> String {
    if let Some(mapped) = ip.strip_prefix("::ffff:") {
        return mapped.to_owned();
    }
    if ip == "::1" {
        return "127.0.0.1".to_owned();
    }
    ip.to_owned()
}

/// A pipeline failure names the close code and a short diagnostic; a
/// clean shutdown (peer hangup, graceful close) carries neither.
enum Ended {
    Closed { code: u16, reason: &'static str },
    Disconnected,
}

async fn handle_socket(socket: WebSocket, server: MessageServer, ip: String) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    let id = server.next_session_id();
    let session = Session::new(id, ip, outbound_tx);
    server.state().insert_socket(session.clone()).await;
    info!(session_id = id, ip = %session.ip, "session connected");

    let outcome = loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(Outbound::Packet(packet)) => {
                        if send_packet(&mut sink, &server, &packet).await.is_err() {
                            break Ended::Disconnected;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = sink.send(close_message(code, reason)).await;
                        break Ended::Closed { code, reason: "closed by the application" };
                    }
                    None => break Ended::Disconnected,
                }
            }

            incoming = stream.next() => {
                let Some(incoming) = incoming else {
                    break Ended::Disconnected;
                };
                match incoming {
                    Ok(Message::Close(_)) => break Ended::Disconnected,
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(message) => {
                        if let Some((code, reason)) = handle_frame(&server, &session, message).await {
                            let _ = sink.send(close_message(code, reason)).await;
                            break Ended::Closed { code, reason };
                        }
                    }
                    Err(err) => {
                        warn!(session_id = id, error = %err, "websocket transport error");
                        break Ended::Disconnected;
                    }
                }
            }
        }
    };

    match outcome {
        Ended::Closed { code, reason } => session.close(code, reason),
        Ended::Disconnected => session.close(close_codes::SOCKET_ERROR, "connection loop exited"),
    }
    server.handle_session_closed(session).await;
    info!(session_id = id, "session closed");
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_owned().into(),
    }))
}

async fn send_packet(
    sink: &mut (impl futures_util::Sink<Message> + Unpin),
    server: &MessageServer,
    packet: &Packet,
) -> Result<(), ()> {
    let password = server.config().password.as_deref();
    let binary = server.config().binary;
    let frame = match codec::encode(packet, password, binary) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "failed to encode outbound packet");
            return Ok(());
        }
    };
    let message = match frame {
        codec::EncodedFrame::Text(text) => Message::Text(text.into()),
        codec::EncodedFrame::Binary(bytes) => Message::Binary(bytes.into()),
    };
    sink.send(message).await.map_err(|_| ())
}

/// Runs one inbound frame through the receive pipeline (spec §4.4).
/// Returns `Some((code, reason))` if the session must be closed.
async fn handle_frame(server: &MessageServer, session: &Arc<Session>, message: Message) -> Option<(u16, &'static str)> {
    let wire = match &message {
        Message::Text(text) => codec::WireFrame::Text(text.as_str()),
        Message::Binary(bytes) => codec::WireFrame::Binary(bytes.as_ref()),
        _ => return None,
    };

    let password = server.config().password.as_deref();
    let value = match codec::decode(wire, password) {
        Ok(value) => value,
        Err(err) => {
            debug!(session_id = session.id, error = %err, "codec decode failed");
            return Some((close_codes::PARSE_ERROR, "codec decode failed"));
        }
    };

    let packet = match Packet::from_value(value) {
        Ok(packet) => packet,
        Err(err) => {
            debug!(session_id = session.id, error = %err, "packet shape validation failed");
            return Some((close_codes::FORMAT_ERROR, "packet shape validation failed"));
        }
    };

    if !session.update_req_id(packet.req_id, server.config().req_id_cache).await {
        return Some((close_codes::REPEAT_ERROR, "duplicate reqId"));
    }

    dispatch(server, session, packet).await
}

async fn dispatch(server: &MessageServer, session: &Arc<Session>, packet: Packet) -> Option<(u16, &'static str)> {
    match packet.route.as_str() {
        routes::HEARTICK => {
            session.update_heart().await;
            session.send(packet);
            None
        }
        routes::INNER_P2P => {
            let envelope = match decode_and_verify_inner(server, &packet) {
                Ok(envelope) => envelope,
                Err(_) => return Some((close_codes::SIGN_ERROR, "inner P2P envelope failed verification")),
            };
            if let Some(uid) = envelope.tid {
                server.push_session(&uid.into(), &envelope.route, envelope.message).await;
            }
            None
        }
        routes::INNER_GRP => {
            let envelope = match decode_and_verify_inner(server, &packet) {
                Ok(envelope) => envelope,
                Err(_) => return Some((close_codes::SIGN_ERROR, "inner GRP envelope failed verification")),
            };
            if let Some(gid) = envelope.tid {
                server.push_channel(&gid, &envelope.route, envelope.message).await;
            }
            None
        }
        routes::INNER_ALL => {
            let envelope = match decode_and_verify_inner(server, &packet) {
                Ok(envelope) => envelope,
                Err(_) => return Some((close_codes::SIGN_ERROR, "inner ALL envelope failed verification")),
            };
            server.broadcast(&envelope.route, envelope.message).await;
            None
        }
        routes::INNER_RMC => {
            let envelope = match decode_and_verify_inner(server, &packet) {
                Ok(envelope) => envelope,
                Err(_) => return Some((close_codes::SIGN_ERROR, "inner RMC envelope failed verification")),
            };
            let Some(handler) = server.remote_handler(&envelope.route).await else {
                return Some((close_codes::REMOTE_ERROR, "no remote handler for route"));
            };
            // Outer `reqId` is preserved so the handler can correlate a
            // `$response$` back to the caller (spec §4.4 `$innerRMC$`).
            let inner_packet = Packet::new(envelope.route, packet.req_id, envelope.message);
            handler(server.clone(), session.clone(), inner_packet).await;
            None
        }
        _ => {
            let Some(handler) = server.route_handler(&packet.route).await else {
                return Some((close_codes::ROUTE_ERROR, "no handler for route"));
            };
            handler(server.clone(), session.clone(), packet).await;
            None
        }
    }
}

fn decode_and_verify_inner(server: &MessageServer, packet: &Packet) -> Result<InnerEnvelope, ()> {
    let envelope: InnerEnvelope = serde_json::from_value(packet.message.clone()).map_err(|_| ())?;
    let secret = server.config().secret.as_deref().unwrap_or("");
    if envelope.verify(secret) {
        Ok(envelope)
    } else {
        Err(())
    }
}
