//! Inter-node cluster dispatch (spec §4.5): P2P, GRP, ALL, RMC.
//!
//! Peer links ride the exact same [`meshline_client::BridgeClient`]
//! abstraction end-user clients use (spec §4.5 "a Bridge Client is
//! constructed toward `ws(s)://peer`") — grounded on `AppState`'s
//! `forwarder_command_senders` registry in `state.rs` (a string key to
//! a live-connection handle), generalized here to a list of peers per
//! group.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meshline_client::{BridgeClient, BridgeClientConfig};
use meshline_config::FleetConfig;
use meshline_protocol::{envelope::InnerEnvelope, routes, ResponseEnvelope};
use rand::Rng;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::ServerConfig;

/// One peer node entry (spec §3 "Peer node").
#[derive(Clone)]
pub struct Peer {
    pub group: String,
    pub url: String,
    pub client: BridgeClient,
}

/// Picks a single peer to dispatch to, given the full peer list for a
/// group and the inner envelope about to be sent (spec §4.5
/// `ClusterDispatchCallback`). Absent a callback, P2P/GRP/ALL fan out
/// to every peer in the group and RMC picks uniformly at random (spec
/// §4.5 "Why broadcast to every peer by default").
pub type ClusterDispatchCallback = Arc<dyn Fn(&[Peer], Option<&str>, &InnerEnvelope) -> usize + Send + Sync>;

pub struct ClusterDispatcher {
    secret: Option<String>,
    groups: HashMap<String, Vec<Peer>>,
    dispatch_callback: RwLock<Option<ClusterDispatchCallback>>,
}

impl ClusterDispatcher {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret,
            groups: HashMap::new(),
            dispatch_callback: RwLock::new(None),
        }
    }

    /// Build one Bridge Client per peer named in `fleet.linked_peers()`
    /// — the set of groups and their members is fixed at startup from
    /// configuration (spec §3 "Peer node"). `heartick = floor(cycle /
    /// 1000)` seconds and `conntick = 2` seconds, per spec §4.5.
    pub fn from_fleet(fleet: &FleetConfig, local: &ServerConfig, ws_path: &str) -> Self {
        let mut dispatcher = Self::new(local.secret.clone());
        let heartick = Duration::from_secs((local.cycle.as_millis() / 1000).max(1) as u64);

        for (group, nodes) in &fleet.nodes {
            if !fleet.links.contains(group) {
                continue;
            }
            let mut peers = Vec::with_capacity(nodes.len());
            for node in nodes {
                let url = node.ws_url(ws_path);
                let config = BridgeClientConfig::new(url.clone())
                    .with_binary(local.binary)
                    .with_heartick(heartick)
                    .with_conntick(Duration::from_secs(2))
                    .with_accept_invalid_certs(node.ssls.is_some());
                let config = match &local.password {
                    Some(password) => config.with_password(password.clone()),
                    None => config,
                };
                peers.push(Peer {
                    group: group.clone(),
                    url,
                    client: BridgeClient::spawn(config),
                });
            }
            dispatcher.groups.insert(group.clone(), peers);
        }
        dispatcher
    }

    pub async fn set_dispatch_callback(&self, callback: Option<ClusterDispatchCallback>) {
        *self.dispatch_callback.write().await = callback;
    }

    /// Open every peer Bridge Client (spec §4.4 "On start").
    pub fn start(&self) {
        for peers in self.groups.values() {
            for peer in peers {
                peer.client.connect();
            }
        }
    }

    /// Tear down every peer Bridge Client (spec §4.4 "On close").
    pub fn close(&self) {
        for peers in self.groups.values() {
            for peer in peers {
                peer.client.disconnect();
            }
        }
    }

    pub fn peers_for(&self, group: &str) -> &[Peer] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    async fn dispatch(&self, group: &str, route: &str, envelope: InnerEnvelope) {
        let peers = self.peers_for(group);
        if peers.is_empty() {
            return;
        }
        let callback = self.dispatch_callback.read().await.clone();
        let payload = match serde_json::to_value(&envelope) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        match callback {
            Some(callback) => {
                let idx = callback(peers, envelope.tid.as_deref(), &envelope);
                if let Some(peer) = peers.get(idx) {
                    let _ = peer.client.send(route, payload);
                }
            }
            // No dispatch hint: the server can't know which peer hosts
            // the target, so it fans out to every peer in the group;
            // peers that don't host the target simply no-op (spec
            // §4.5 "Why broadcast to every peer by default").
            None => {
                for peer in peers {
                    let _ = peer.client.send(route, payload.clone());
                }
            }
        }
    }

    fn sign(&self, route: impl Into<String>, message: Value, tid: Option<String>) -> InnerEnvelope {
        let secret = self.secret.as_deref().unwrap_or_default();
        InnerEnvelope::new(tid, route, message, secret)
    }

    pub async fn push_cluster_session(&self, group: &str, uid: &str, route: &str, message: Value) {
        let envelope = self.sign(route, message, Some(uid.to_owned()));
        self.dispatch(group, routes::INNER_P2P, envelope).await;
    }

    pub async fn push_cluster_channel(&self, group: &str, gid: &str, route: &str, message: Value) {
        let envelope = self.sign(route, message, Some(gid.to_owned()));
        self.dispatch(group, routes::INNER_GRP, envelope).await;
    }

    pub async fn cluster_broadcast(&self, group: &str, route: &str, message: Value) {
        let envelope = self.sign(route, message, None);
        self.dispatch(group, routes::INNER_ALL, envelope).await;
    }

    /// Fire-and-forget RMC (spec §4.5 "`callRemote` is fire-and-forget").
    pub async fn call_remote(&self, group: &str, route: &str, message: Value) {
        let Some(peer) = self.pick_random_peer(group) else {
            return;
        };
        let envelope = self.sign(route, message, None);
        if let Ok(payload) = serde_json::to_value(&envelope) {
            let _ = peer.client.send(routes::INNER_RMC, payload);
        }
    }

    /// Always resolves to a [`ResponseEnvelope`] — the caller never
    /// distinguishes transport failure from an application error, the
    /// `code` field carries that (spec §4.5 `callRemoteForResult`).
    pub async fn call_remote_for_result(&self, group: &str, route: &str, message: Value) -> ResponseEnvelope {
        let Some(peer) = self.pick_random_peer(group) else {
            return ResponseEnvelope::error(502, Value::String("no peer available in group".to_owned()));
        };
        let envelope = self.sign(route, message, None);
        let payload = match serde_json::to_value(&envelope) {
            Ok(payload) => payload,
            Err(err) => return ResponseEnvelope::error(500, Value::String(err.to_string())),
        };
        peer.client
            .request(routes::INNER_RMC, payload)
            .await
            .unwrap_or_else(|err| ResponseEnvelope::error(502, Value::String(err.to_string())))
    }

    fn pick_random_peer(&self, group: &str) -> Option<&Peer> {
        let peers = self.peers_for(group);
        if peers.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..peers.len());
        peers.get(idx)
    }
}
