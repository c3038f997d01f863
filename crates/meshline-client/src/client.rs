//! The resilient, reconnecting WebSocket client (spec §2).
//!
//! A [`BridgeClient`] is a handle: the socket, the pending-request
//! table and the reconnect/heartbeat timers all live on a single
//! background task, so nothing about connection state needs a lock.
//! Handles talk to that task over an mpsc command channel, mirroring
//! the single-owner session loop style of `services/receiver/src/session.rs`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use meshline_protocol::{self as protocol, close_codes, EncodedFrame, Packet, ResponseEnvelope, WireFrame};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::BridgeClientConfig;
use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Listeners = Arc<RwLock<HashMap<String, broadcast::Sender<Value>>>>;

const LISTENER_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;

/// Lifecycle events a caller can observe alongside the request/response
/// and pub/sub surfaces (spec §4.2 "Lifecycle... installs lifecycle
/// callbacks (open, close, error, retry, per-second tick)").
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The socket finished its WebSocket handshake.
    Open,
    /// The socket was torn down, whether by the peer, a transport
    /// error, or an explicit `disconnect()`.
    Close,
    /// A transport-level failure (send or receive).
    Error(String),
    /// A reconnect attempt fired; carries the new retry count.
    Retry(u64),
    /// The 1 Hz tick (spec §4.2 Tick step 5), carrying `timerInc` and
    /// the current round-trip delay estimate in milliseconds.
    Tick { timer_inc: u64, net_delay_ms: i64 },
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

enum Command {
    Connect,
    Disconnect,
    Send {
        route: String,
        message: Value,
    },
    Request {
        route: String,
        message: Value,
        responder: oneshot::Sender<ResponseEnvelope>,
    },
    Shutdown,
}

/// A handle to a running Bridge Client. Cheap to clone; every clone
/// talks to the same background actor and the same listener table.
#[derive(Clone)]
pub struct BridgeClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_req_id: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
    expired: Arc<AtomicBool>,
    retry_count: Arc<AtomicU64>,
    net_delay_ms: Arc<AtomicI64>,
    listeners: Listeners,
    events_tx: broadcast::Sender<ClientEvent>,
}

impl BridgeClient {
    /// Spawn the background actor and return a handle to it. The actor
    /// starts disconnected; call [`connect`](Self::connect) (or rely on
    /// `connect_on_spawn`) to bring the socket up.
    pub fn spawn(config: BridgeClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let expired = Arc::new(AtomicBool::new(false));
        let retry_count = Arc::new(AtomicU64::new(0));
        let net_delay_ms = Arc::new(AtomicI64::new(0));
        let listeners: Listeners = Arc::new(RwLock::new(HashMap::new()));
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = Actor {
            config,
            socket: None,
            pending: HashMap::new(),
            connected: connected.clone(),
            expired: expired.clone(),
            retry_count: retry_count.clone(),
            net_delay_ms: net_delay_ms.clone(),
            listeners: listeners.clone(),
            events_tx: events_tx.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            cmd_tx,
            next_req_id: Arc::new(AtomicU64::new(1)),
            connected,
            expired,
            retry_count,
            net_delay_ms,
            listeners,
            events_tx,
        }
    }

    pub fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect);
    }

    /// Terminal: stops the reconnect ticker and closes the socket with
    /// code 4104 (spec §4.2 "disconnect sets expired (terminal)...
    /// after disconnect, the instance is dead and must not be
    /// revived"). Further calls on this handle (or its clones) fail
    /// with [`ClientError::ActorGone`] once the actor has drained the
    /// command.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    /// Stop the actor entirely. Further calls on this handle (or its
    /// clones) fail with [`ClientError::ActorGone`].
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// True once `disconnect()` (or `close()`) has been called; a
    /// terminal client never reconnects (spec §4.2 "expired" flag).
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Relaxed)
    }

    pub fn retry_count(&self) -> u64 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// The most recent round-trip delay estimate, updated from both
    /// `$heartick$` echoes and `$response$` deliveries (spec §4.2
    /// "State — `netDelay`").
    pub fn net_delay_ms(&self) -> i64 {
        self.net_delay_ms.load(Ordering::Relaxed)
    }

    /// Subscribe to lifecycle events (open/close/error/retry/tick).
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    /// Fire-and-forget send. Silently dropped if the actor is not
    /// currently connected — the caller gets no delivery guarantee,
    /// matching the framework's no-durable-delivery stance.
    pub fn send(&self, route: impl Into<String>, message: Value) -> Result<(), ClientError> {
        self.cmd_tx
            .send(Command::Send {
                route: route.into(),
                message,
            })
            .map_err(|_| ClientError::ActorGone)
    }

    /// Send a request and await its `$response$`. If the connection is
    /// down when called, the request is still registered and will
    /// resolve with a gateway-timeout envelope once its deadline
    /// elapses, rather than failing immediately — a request issued just
    /// before a reconnect still gets a deterministic outcome.
    pub async fn request(
        &self,
        route: impl Into<String>,
        message: Value,
    ) -> Result<ResponseEnvelope, ClientError> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                route: route.into(),
                message,
                responder,
            })
            .map_err(|_| ClientError::ActorGone)?;
        rx.await.map_err(|_| ClientError::ActorGone)
    }

    /// Subscribe to every inbound message published on `route`.
    /// Delivery is best-effort: a subscriber that falls behind the
    /// channel's capacity misses messages rather than stalling the
    /// actor.
    pub async fn subscribe(&self, route: impl Into<String>) -> broadcast::Receiver<Value> {
        let route = route.into();
        let mut listeners = self.listeners.write().await;
        let tx = listeners
            .entry(route)
            .or_insert_with(|| broadcast::channel(LISTENER_CAPACITY).0);
        tx.subscribe()
    }

    /// Resolve to the next message published on `route`, then stop
    /// listening. Useful for one-shot server pushes outside the
    /// request/response cycle.
    pub async fn subscribe_once(&self, route: impl Into<String>) -> oneshot::Receiver<Value> {
        let mut rx = self.subscribe(route).await;
        let (tx, rx_once) = oneshot::channel();
        tokio::spawn(async move {
            if let Ok(msg) = rx.recv().await {
                let _ = tx.send(msg);
            }
        });
        rx_once
    }

    /// Generate the next request id. Exposed so callers embedding their
    /// own correlation (rather than `request()`'s oneshot) can still
    /// draw from the same counter.
    pub fn next_req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }
}

struct Actor {
    config: BridgeClientConfig,
    socket: Option<WsStream>,
    pending: HashMap<u64, (oneshot::Sender<ResponseEnvelope>, Instant)>,
    connected: Arc<AtomicBool>,
    expired: Arc<AtomicBool>,
    retry_count: Arc<AtomicU64>,
    net_delay_ms: Arc<AtomicI64>,
    listeners: Listeners,
    events_tx: broadcast::Sender<ClientEvent>,
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut heartick = tokio::time::interval(self.config.heartick);
        let mut conntick = tokio::time::interval(self.config.conntick);
        let mut sweep_tick = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut next_client_req_id: u64 = 1;
        let mut timer_inc: u64 = 0;

        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            self.expired.store(true, Ordering::SeqCst);
                            self.socket = None;
                            self.set_connected(false);
                            self.emit(ClientEvent::Close);
                            break;
                        }
                        Some(Command::Connect) => self.try_connect().await,
                        Some(Command::Disconnect) => {
                            // Terminal: stops the ticker (the loop ends
                            // below) and never revives (spec §4.2).
                            self.expired.store(true, Ordering::SeqCst);
                            self.send_close(close_codes::CLIENT_CALL, "disconnect() called").await;
                            self.emit(ClientEvent::Close);
                            break;
                        }
                        Some(Command::Send { route, message }) => {
                            let req_id = next_client_req_id;
                            next_client_req_id += 1;
                            self.send_packet(&route, req_id, message).await;
                        }
                        Some(Command::Request { route, message, responder }) => {
                            let req_id = next_client_req_id;
                            next_client_req_id += 1;
                            self.pending.insert(req_id, (responder, Instant::now()));
                            self.send_packet(&route, req_id, message).await;
                        }
                    }
                }

                msg = recv_next(&mut self.socket) => {
                    self.handle_inbound(msg).await;
                }

                _ = heartick.tick() => {
                    if self.connected.load(Ordering::Relaxed) {
                        let req_id = next_client_req_id;
                        next_client_req_id += 1;
                        self.send_packet(protocol::routes::HEARTICK, req_id, Value::from(now_millis())).await;
                    }
                }

                _ = conntick.tick() => {
                    if !self.connected.load(Ordering::Relaxed) {
                        let attempt = self.retry_count.fetch_add(1, Ordering::Relaxed) + 1;
                        self.emit(ClientEvent::Retry(attempt));
                        self.send_close(close_codes::CLIENT_RETRY, "replacing stale socket before retry").await;
                        self.try_connect().await;
                    }
                }

                _ = sweep_tick.tick() => {
                    timer_inc += 1;
                    self.sweep_expired_requests();
                    self.emit(ClientEvent::Tick {
                        timer_inc,
                        net_delay_ms: self.net_delay_ms.load(Ordering::Relaxed),
                    });
                }
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Sends an explicit close frame carrying `code` if a socket is
    /// live, then drops it (spec §4.2 Tick step 4 "close any stale
    /// socket with code 4101"; §4.2 Lifecycle "closes the socket with
    /// code 4104"). Best-effort: a send failure here just means the
    /// transport was already gone.
    async fn send_close(&mut self, code: u16, reason: &str) {
        if let Some(socket) = self.socket.as_mut() {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: Utf8Bytes::from(reason.to_owned()),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
        }
        self.socket = None;
        self.set_connected(false);
    }

    async fn try_connect(&mut self) {
        if self.connected.load(Ordering::Relaxed) {
            return;
        }
        let outcome = if self.config.accept_invalid_certs {
            tokio_tungstenite::connect_async_tls_with_config(
                &self.config.url,
                None,
                false,
                Some(insecure_connector()),
            )
            .await
        } else {
            tokio_tungstenite::connect_async(&self.config.url).await
        };
        match outcome {
            Ok((stream, _response)) => {
                info!(url = %self.config.url, "bridge client connected");
                self.socket = Some(stream);
                self.set_connected(true);
                self.retry_count.store(0, Ordering::Relaxed);
                self.emit(ClientEvent::Open);
            }
            Err(err) => {
                warn!(url = %self.config.url, error = %err, "bridge client connect failed, will retry");
            }
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    async fn send_packet(&mut self, route: &str, req_id: u64, message: Value) {
        let Some(socket) = self.socket.as_mut() else {
            debug!(route, "dropping send, not connected");
            return;
        };
        let packet = Packet::new(route, req_id, message);
        let frame = match protocol::encode(&packet, self.config.password.as_deref(), self.config.binary) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(route, error = %err, "failed to encode outbound packet");
                return;
            }
        };
        let wire = match frame {
            EncodedFrame::Text(text) => Message::Text(text.into()),
            EncodedFrame::Binary(bytes) => Message::Binary(bytes.into()),
        };
        if let Err(err) = socket.send(wire).await {
            warn!(route, error = %err, "failed to send, dropping connection");
            self.emit(ClientEvent::Error(err.to_string()));
            self.send_close(close_codes::CLIENT_ERROR, "transport error").await;
        }
    }

    async fn handle_inbound(&mut self, msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>) {
        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                warn!(error = %err, "websocket error, dropping connection");
                self.emit(ClientEvent::Error(err.to_string()));
                self.send_close(close_codes::CLIENT_ERROR, "transport error").await;
                return;
            }
            None => {
                info!("peer closed connection");
                self.socket = None;
                self.set_connected(false);
                self.emit(ClientEvent::Close);
                return;
            }
        };

        let frame = match &msg {
            Message::Text(text) => WireFrame::Text(text.as_str()),
            Message::Binary(bytes) => WireFrame::Binary(bytes.as_ref()),
            Message::Close(_) => {
                self.socket = None;
                self.set_connected(false);
                self.emit(ClientEvent::Close);
                return;
            }
            _ => return,
        };

        let value = match protocol::decode(frame, self.config.password.as_deref()) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "failed to decode inbound frame");
                return;
            }
        };
        let packet = match Packet::from_value(value) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, "inbound frame was not a well-formed packet");
                return;
            }
        };

        if packet.route == protocol::routes::RESPONSE {
            if let Some((responder, sent_at)) = self.pending.remove(&packet.req_id) {
                self.net_delay_ms.store(sent_at.elapsed().as_millis() as i64, Ordering::Relaxed);
                let envelope: ResponseEnvelope = match serde_json::from_value(packet.message) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(error = %err, "$response$ payload did not match ResponseEnvelope");
                        return;
                    }
                };
                let _ = responder.send(envelope);
            }
            return;
        }

        if packet.route == protocol::routes::HEARTICK {
            if let Ok(sent_at) = serde_json::from_value::<i64>(packet.message.clone()) {
                self.net_delay_ms.store(now_millis() - sent_at, Ordering::Relaxed);
            }
            debug!("heartick acknowledged by peer");
            return;
        }

        let listeners = self.listeners.read().await;
        if let Some(tx) = listeners.get(&packet.route) {
            let _ = tx.send(packet.message);
        }
    }

    fn sweep_expired_requests(&mut self) {
        let timeout = self.config.timeout;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, (_, sent_at))| sent_at.elapsed() >= timeout)
            .map(|(req_id, _)| *req_id)
            .collect();
        for req_id in expired {
            if let Some((responder, _)) = self.pending.remove(&req_id) {
                let _ = responder.send(ResponseEnvelope::gateway_timeout());
            }
        }
    }
}

async fn recv_next(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// A TLS connector that accepts any server certificate, for peer
/// cluster links over `wss://` (spec §6 "peer Bridge Clients accept
/// self-signed certificates"). Never used for the plaintext-config
/// default path.
fn insecure_connector() -> tokio_tungstenite::Connector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    tokio_tungstenite::Connector::Rustls(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// A one-shot echo server: accepts a single connection, answers
    /// every non-heartick packet with a `$response$` that mirrors the
    /// request payload back as the response data.
    async fn start_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else { continue };
                let value: Value = serde_json::from_str(&text).unwrap();
                let packet = Packet::from_value(value).unwrap();
                if packet.route == protocol::routes::HEARTICK {
                    continue;
                }
                let response = Packet::new(
                    protocol::routes::RESPONSE,
                    packet.req_id,
                    serde_json::to_value(ResponseEnvelope::ok(packet.message)).unwrap(),
                );
                let out = serde_json::to_string(&response).unwrap();
                if ws.send(Message::Text(out.into())).await.is_err() {
                    break;
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn request_round_trips_through_echo_server() {
        let url = start_echo_server().await;
        let client = BridgeClient::spawn(BridgeClientConfig::new(url));
        client.connect();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(client.is_connected());

        let response = client.request("echo", serde_json::json!("hi")).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.data, serde_json::json!("hi"));
        client.close();
    }

    #[tokio::test]
    async fn request_resolves_to_gateway_timeout_when_never_connected() {
        let client = BridgeClient::spawn(
            BridgeClientConfig::new("ws://127.0.0.1:9".to_owned())
                .with_timeout(Duration::from_millis(500))
                .with_conntick(Duration::from_secs(30)),
        );
        let response = client.request("echo", serde_json::json!(1)).await.unwrap();
        assert_eq!(response.code, ResponseEnvelope::GATEWAY_TIMEOUT);
        client.close();
    }

    #[tokio::test]
    async fn subscribe_receives_pushed_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let push = Packet::new("chat.announce", 0, serde_json::json!({"text": "hello"}));
            let out = serde_json::to_string(&push).unwrap();
            let _ = ws.send(Message::Text(out.into())).await;
            // Keep the task alive long enough for the client to read it.
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let client = BridgeClient::spawn(BridgeClientConfig::new(format!("ws://{addr}")));
        let mut rx = client.subscribe("chat.announce").await;
        client.connect();

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("did not receive pushed message in time")
            .unwrap();
        assert_eq!(msg, serde_json::json!({"text": "hello"}));
        client.close();
    }

    #[tokio::test]
    async fn disconnect_is_terminal_and_never_reconnects() {
        let url = start_echo_server().await;
        let client = BridgeClient::spawn(
            BridgeClientConfig::new(url).with_conntick(Duration::from_millis(50)),
        );
        client.connect();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(client.is_connected());

        client.disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.is_expired());
        assert!(!client.is_connected());

        // conntick would otherwise have fired several times by now; a
        // terminal client must never revive.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn request_round_trip_updates_net_delay() {
        let url = start_echo_server().await;
        let client = BridgeClient::spawn(BridgeClientConfig::new(url));
        client.connect();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(client.net_delay_ms(), 0);
        let response = client.request("echo", serde_json::json!("hi")).await.unwrap();
        assert!(response.is_success());
        assert!(client.net_delay_ms() >= 0);
        client.close();
    }

    #[tokio::test]
    async fn events_surface_open_and_close() {
        let url = start_echo_server().await;
        let client = BridgeClient::spawn(BridgeClientConfig::new(url));
        let mut events = client.events();
        client.connect();

        let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("no lifecycle event observed in time")
            .unwrap();
        assert!(matches!(first, ClientEvent::Open));

        client.disconnect();
        let mut saw_close = false;
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            if matches!(event, ClientEvent::Close) {
                saw_close = true;
                break;
            }
        }
        assert!(saw_close, "expected a Close event after disconnect()");
    }
}
