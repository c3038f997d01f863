//! The Message Server: registries, dispatch tables, supervisor, and
//! push primitives (spec §4.4).
//!
//! `MessageServer` is a cheap `Clone` handle passed into every axum
//! route the same way `AppState` is passed via `State(...)` in
//! `services/server/src/ws_forwarder.rs` — all the heavier state lives
//! behind the `Arc`s it holds.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meshline_protocol::{close_codes, routes, Packet, ResponseEnvelope};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::error;

use crate::cluster::ClusterDispatcher;
use crate::config::ServerConfig;
use crate::registry::ServerState;
use crate::session::{Session, SessionId, Uid};

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// A user route or remote-procedure handler (spec §4.4 `setRouter` /
/// `setRemote`): invoked as `(server, session, packet)`.
pub type RouteHandler = Arc<dyn Fn(MessageServer, Arc<Session>, Packet) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Copy, Debug, Default)]
pub struct SupervisorCounts {
    pub live: usize,
    pub bound: usize,
}

pub type SupervisorCallback = Arc<dyn Fn(SupervisorCounts) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(MessageServer, Arc<Session>) -> BoxFuture<'static, ()> + Send + Sync>;

/// `setRouter`/`setRemote` tables as `route -> handler` maps (spec §9
/// "Dynamic handler registries"). User and remote tables are kept
/// separate rather than tagged-union'd into one, since a route can
/// never legally appear in both (user routes never collide with the
/// reserved `$innerRMC$` dispatch, per spec §6 "Reserved routes").
#[derive(Clone)]
pub struct MessageServer {
    config: Arc<ServerConfig>,
    state: Arc<ServerState>,
    cluster: Arc<ClusterDispatcher>,
    routers: Arc<RwLock<HashMap<String, RouteHandler>>>,
    remotes: Arc<RwLock<HashMap<String, RouteHandler>>>,
    supervisor_cb: Arc<RwLock<Option<SupervisorCallback>>>,
    closer_cb: Arc<RwLock<Option<CloseCallback>>>,
    next_session_id: Arc<AtomicU64>,
    supervisor_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl MessageServer {
    pub fn new(config: ServerConfig, cluster: ClusterDispatcher) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(ServerState::default()),
            cluster: Arc::new(cluster),
            routers: Arc::new(RwLock::new(HashMap::new())),
            remotes: Arc::new(RwLock::new(HashMap::new())),
            supervisor_cb: Arc::new(RwLock::new(None)),
            closer_cb: Arc::new(RwLock::new(None)),
            next_session_id: Arc::new(AtomicU64::new(1)),
            supervisor_handle: Arc::new(RwLock::new(None)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn cluster(&self) -> &ClusterDispatcher {
        &self.cluster
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub async fn set_router(&self, route: impl Into<String>, handler: RouteHandler) {
        self.routers.write().await.insert(route.into(), handler);
    }

    pub async fn set_remote(&self, route: impl Into<String>, handler: RouteHandler) {
        self.remotes.write().await.insert(route.into(), handler);
    }

    pub async fn set_listeners(&self, supervisor: Option<SupervisorCallback>, closer: Option<CloseCallback>) {
        *self.supervisor_cb.write().await = supervisor;
        *self.closer_cb.write().await = closer;
    }

    pub(crate) async fn route_handler(&self, route: &str) -> Option<RouteHandler> {
        self.routers.read().await.get(route).cloned()
    }

    pub(crate) async fn remote_handler(&self, route: &str) -> Option<RouteHandler> {
        self.remotes.read().await.get(route).cloned()
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register the connection handler, start the supervisor ticker,
    /// and connect every peer Bridge Client (spec §4.4 "On start").
    /// The axum listener itself is driven by the caller's
    /// `axum::serve` call; this only brings up the server's own
    /// background machinery.
    pub async fn start(&self) {
        self.cluster.start();
        let server = self.clone();
        let handle = tokio::spawn(async move { server.run_supervisor().await });
        *self.supervisor_handle.write().await = Some(handle);
    }

    /// Stop the supervisor ticker, disconnect every peer, and close
    /// every live session (spec §4.4 "On close").
    pub async fn close(&self) {
        if let Some(handle) = self.supervisor_handle.write().await.take() {
            handle.abort();
        }
        self.cluster.close();
        for session in self.state.all_sockets().await {
            session.close(close_codes::SOCKET_ERROR, "server shutting down");
        }
    }

    async fn run_supervisor(&self) {
        let mut ticker = tokio::time::interval(self.config.cycle);
        loop {
            ticker.tick().await;
            self.run_supervisor_once().await;
        }
    }

    async fn run_supervisor_once(&self) {
        let sockets = self.state.all_sockets().await;
        let mut live = 0usize;
        for session in &sockets {
            if session.is_expired(self.config.timeout).await {
                session.close(close_codes::TIMEOUT, "heartbeat timeout");
            } else {
                live += 1;
            }
        }
        let bound = self.state.bound_count().await;
        let Some(callback) = self.supervisor_cb.read().await.clone() else {
            return;
        };
        let counts = SupervisorCounts { live, bound };
        // Spec §7 "Supervisor callback exceptions: caught, logged,
        // swallowed; the ticker continues."
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(counts))) {
            error!(?panic, "supervisor callback panicked, ticker continues");
        }
    }

    /// Invoked once a session's socket has actually closed (spec §4.4
    /// "Close handler"): run the user's closer, quit every channel,
    /// unbind any UID, then remove from `sockets`.
    pub(crate) async fn handle_session_closed(&self, session: Arc<Session>) {
        let callback = self.closer_cb.read().await.clone();
        if let Some(callback) = callback {
            callback(self.clone(), session.clone()).await;
        }
        self.state.quit_all_channels(&session).await;
        self.state.unbind_uid(&session).await;
        self.state.remove_socket(session.id).await;
    }

    pub async fn bind_uid(&self, session: &Arc<Session>, uid: Uid, close_old: bool) {
        self.state.bind_uid(session, uid, close_old).await;
    }

    pub async fn unbind_uid(&self, session: &Arc<Session>) {
        self.state.unbind_uid(session).await;
    }

    pub async fn join_channel(&self, session: &Arc<Session>, gid: impl Into<String>) {
        self.state.join_channel(session, gid).await;
    }

    pub async fn quit_channel(&self, session: &Arc<Session>, gid: &str) {
        self.state.quit_channel(session, gid).await;
    }

    /// `$response$` reusing the request packet's `reqId` (spec §4.4
    /// `response`).
    pub fn response(&self, session: &Arc<Session>, req: &Packet, envelope: ResponseEnvelope) -> bool {
        let message = serde_json::to_value(envelope).unwrap_or(Value::Null);
        session.send(Packet::new(routes::RESPONSE, req.req_id, message))
    }

    /// Silently a no-op if `uid` is not locally bound (spec §4.4
    /// `pushSession`).
    pub async fn push_session(&self, uid: &Uid, route: &str, message: Value) {
        if let Some(session) = self.state.get_by_uid(uid).await {
            session.send(Packet::new(route, 0, message));
        }
    }

    pub async fn push_session_batch(&self, uids: &[Uid], route: &str, message: Value) {
        for uid in uids {
            self.push_session(uid, route, message.clone()).await;
        }
    }

    pub async fn push_channel(&self, gid: &str, route: &str, message: Value) {
        for session in self.state.channel_members(gid).await {
            session.send(Packet::new(route, 0, message.clone()));
        }
    }

    /// Re-encodes per member via a caller-supplied per-recipient
    /// transform (spec §4.4 `pushChannelCustom`).
    pub async fn push_channel_custom(
        &self,
        gid: &str,
        route: &str,
        base: &Value,
        transform: impl Fn(&Arc<Session>, &Value) -> Value,
    ) {
        for session in self.state.channel_members(gid).await {
            let message = transform(&session, base);
            session.send(Packet::new(route, 0, message));
        }
    }

    /// Iterates all UID-bound sessions; sessions without a UID are not
    /// broadcast targets (spec §4.4 — an intentional filter).
    pub async fn broadcast(&self, route: &str, message: Value) {
        for session in self.state.broadcast_targets().await {
            session.send(Packet::new(route, 0, message.clone()));
        }
    }
}
