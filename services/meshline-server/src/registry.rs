//! The four process-local registries (spec §3 "Server registries").
//!
//! Grounded directly on `services/server/src/state.rs`'s `AppState`:
//! one `RwLock`-guarded map per concern on a single struct, with
//! `register_x`/`unregister_x`-shaped methods rather than exposing the
//! maps themselves.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::session::{Session, SessionId, Uid};

/// `{count, members}` per spec §3. `count` is derived, never stored
/// separately, so it can never drift from `members.len()` (spec §8
/// invariant 4).
#[derive(Default)]
pub struct Channel {
    members: HashMap<SessionId, Arc<Session>>,
}

impl Channel {
    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.members.values()
    }
}

/// The four registries named in spec §3, guarded independently — they
/// are never mutated atomically together anywhere in the spec (a
/// session's removal from `sockets` and its unbind from `sessions`
/// happen as two sequential steps in the close handler).
#[derive(Default)]
pub struct ServerState {
    sockets: RwLock<HashMap<SessionId, Arc<Session>>>,
    sessions: RwLock<HashMap<Uid, Arc<Session>>>,
    channels: RwLock<HashMap<String, Channel>>,
}

impl ServerState {
    pub async fn insert_socket(&self, session: Arc<Session>) {
        self.sockets.write().await.insert(session.id, session);
    }

    pub async fn remove_socket(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sockets.write().await.remove(&id)
    }

    pub async fn get_socket(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sockets.read().await.get(&id).cloned()
    }

    pub async fn all_sockets(&self) -> Vec<Arc<Session>> {
        self.sockets.read().await.values().cloned().collect()
    }

    pub async fn live_count(&self) -> usize {
        self.sockets.read().await.len()
    }

    pub async fn bound_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn get_by_uid(&self, uid: &Uid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(uid).cloned()
    }

    /// spec §4.4 `bindUid(session, uid, closeOld)`: if another session
    /// currently holds `uid`, unbind it first — so its own close
    /// handler's `unbindUid` call later is a no-op and can't erase the
    /// binding we are about to install — then close it if `close_old`.
    /// Only after that do we unbind any prior UID the incoming session
    /// held and install the new mapping (spec §9 "Open question —
    /// close during binding").
    pub async fn bind_uid(&self, session: &Arc<Session>, uid: Uid, close_old: bool) {
        let displaced = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&uid)
        };
        if let Some(displaced) = displaced {
            if !Arc::ptr_eq(&displaced, session) {
                displaced.set_uid(None).await;
                if close_old {
                    displaced.close(
                        meshline_protocol::close_codes::NEWBIND,
                        "displaced by a newer bind of the same UID",
                    );
                }
            }
        }

        if let Some(prior) = session.uid().await {
            if prior != uid {
                let mut sessions = self.sessions.write().await;
                let still_ours = matches!(sessions.get(&prior), Some(existing) if Arc::ptr_eq(existing, session));
                if still_ours {
                    sessions.remove(&prior);
                }
            }
        }

        session.set_uid(Some(uid.clone())).await;
        self.sessions.write().await.insert(uid, session.clone());
    }

    /// Idempotent (spec §4.3 `unbindUid`).
    pub async fn unbind_uid(&self, session: &Arc<Session>) {
        if let Some(uid) = session.uid().await {
            let mut sessions = self.sessions.write().await;
            let still_ours = matches!(sessions.get(&uid), Some(existing) if Arc::ptr_eq(existing, session));
            if still_ours {
                sessions.remove(&uid);
            }
            drop(sessions);
            session.set_uid(None).await;
        }
    }

    /// Created lazily on first join; idempotent for a session already a
    /// member (spec §3 "Channel").
    pub async fn join_channel(&self, session: &Arc<Session>, gid: impl Into<String>) {
        let gid = gid.into();
        if !session.mark_channel_joined(gid.clone()).await {
            return;
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(gid)
            .or_default()
            .members
            .insert(session.id, session.clone());
    }

    /// Removed from the registry the instant its member count reaches
    /// zero (spec §3 "Channel").
    pub async fn quit_channel(&self, session: &Arc<Session>, gid: &str) {
        if !session.mark_channel_quit(gid).await {
            return;
        }
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(gid) {
            channel.members.remove(&session.id);
            if channel.members.is_empty() {
                channels.remove(gid);
            }
        }
    }

    pub async fn quit_all_channels(&self, session: &Arc<Session>) {
        for gid in session.channel_ids().await {
            self.quit_channel(session, &gid).await;
        }
    }

    pub async fn channel_members(&self, gid: &str) -> Vec<Arc<Session>> {
        self.channels
            .read()
            .await
            .get(gid)
            .map(|channel| channel.members().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn channel_count(&self, gid: &str) -> usize {
        self.channels.read().await.get(gid).map(Channel::count).unwrap_or(0)
    }

    /// Only UID-bound sessions are broadcast targets (spec §4.4 — an
    /// intentional filter).
    pub async fn broadcast_targets(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }
}
