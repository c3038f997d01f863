//! Per-connection server-side state (spec §4.3).
//!
//! A [`Session`] is held as an `Arc` in every registry that needs to
//! reach it (`sockets`, `sessions`, each joined [`crate::registry::Channel`]),
//! so its mutable fields live behind one `Mutex` rather than being
//! split across locks — the same "small owned registry entry" shape as
//! `services/receiver/src/session.rs`'s `Session`, generalized with the
//! extra bookkeeping this spec's session carries.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshline_protocol::Packet;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

pub type SessionId = u64;

/// Stable identity of a logical user (GLOSSARY "UID"). UIDs are
/// compared and indexed by their string projection (spec §9 "UID
/// polymorphism") — this newtype *is* that projection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uid(String);

impl Uid {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Uid {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// An item handed from anywhere in the process to the connection task
/// that physically owns this session's socket.
pub enum Outbound {
    Packet(Packet),
    Close { code: u16, reason: String },
}

struct Inner {
    uid: Option<Uid>,
    context: HashMap<String, Value>,
    channels: HashSet<String>,
    recent_req_ids: VecDeque<u64>,
    last_heart: Instant,
}

/// Server-side state for one live WebSocket connection (spec §3
/// "Session").
pub struct Session {
    pub id: SessionId,
    pub ip: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(id: SessionId, ip: impl Into<String>, outbound: mpsc::UnboundedSender<Outbound>) -> Arc<Self> {
        Arc::new(Self {
            id,
            ip: ip.into(),
            outbound,
            closed: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                uid: None,
                context: HashMap::new(),
                channels: HashSet::new(),
                recent_req_ids: VecDeque::new(),
                last_heart: Instant::now(),
            }),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Hand a packet to the connection task owning the socket. Returns
    /// whether the frame was accepted — only true while the session is
    /// still open (spec §4.3 `send` contract).
    pub fn send(&self, packet: Packet) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.send(Outbound::Packet(packet)).is_ok()
    }

    /// Idempotent: closing an already-closed session is a no-op (spec
    /// §4.3 `close` contract).
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    pub async fn uid(&self) -> Option<Uid> {
        self.inner.lock().await.uid.clone()
    }

    pub(crate) async fn set_uid(&self, uid: Option<Uid>) {
        self.inner.lock().await.uid = uid;
    }

    pub async fn context_set(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().await.context.insert(key.into(), value);
    }

    pub async fn context_get(&self, key: &str) -> Option<Value> {
        self.inner.lock().await.context.get(key).cloned()
    }

    /// Returns `true` if this is a novel join (caller should update the
    /// channel registry); joining twice is idempotent (spec §3).
    pub(crate) async fn mark_channel_joined(&self, gid: String) -> bool {
        self.inner.lock().await.channels.insert(gid)
    }

    pub(crate) async fn mark_channel_quit(&self, gid: &str) -> bool {
        self.inner.lock().await.channels.remove(gid)
    }

    pub async fn channel_ids(&self) -> Vec<String> {
        self.inner.lock().await.channels.iter().cloned().collect()
    }

    /// Returns `true` (novel) and records `req_id`, or `false`
    /// (duplicate — caller must close with 4003) per spec §4.3. On
    /// overflow the oldest half of the ring is dropped (spec §3
    /// `recentReqIds`).
    pub async fn update_req_id(&self, req_id: u64, capacity: usize) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.recent_req_ids.contains(&req_id) {
            return false;
        }
        inner.recent_req_ids.push_back(req_id);
        if inner.recent_req_ids.len() > capacity {
            let drop_count = inner.recent_req_ids.len() / 2;
            for _ in 0..drop_count {
                inner.recent_req_ids.pop_front();
            }
        }
        true
    }

    pub async fn update_heart(&self) {
        self.inner.lock().await.last_heart = Instant::now();
    }

    pub async fn is_expired(&self, timeout: Duration) -> bool {
        self.inner.lock().await.last_heart.elapsed() > timeout
    }
}
