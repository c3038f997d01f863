//! `$response$` and inner cluster envelopes (spec §3).

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The `message` field of a `$response$` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub code: i32,
    pub data: Value,
}

impl ResponseEnvelope {
    pub const OK: i32 = 200;
    pub const GATEWAY_TIMEOUT: i32 = 504;

    pub fn ok(data: Value) -> Self {
        Self {
            code: Self::OK,
            data,
        }
    }

    pub fn error(code: i32, data: Value) -> Self {
        Self { code, data }
    }

    pub fn gateway_timeout() -> Self {
        Self::error(Self::GATEWAY_TIMEOUT, Value::String("Gateway Timeout".to_owned()))
    }

    pub fn is_success(&self) -> bool {
        self.code == Self::OK
    }
}

/// The `message` field of `$innerP2P$`/`$innerGRP$`/`$innerALL$`/`$innerRMC$`.
///
/// `tid` is the target identity: a UID for P2P, a group id for GRP,
/// omitted for ALL/RMC. `sign` is `MD5(route ∥ word ∥ secret)`; every
/// inner packet must verify at the recipient or the sender's
/// connection is closed with 4004.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    pub route: String,
    pub message: Value,
    pub word: String,
    pub sign: String,
}

impl InnerEnvelope {
    /// Build a freshly-signed envelope for an outbound cluster dispatch.
    pub fn new(tid: Option<String>, route: impl Into<String>, message: Value, secret: &str) -> Self {
        let route = route.into();
        let word = Uuid::new_v4().to_string();
        let sign = sign(&route, &word, secret);
        Self {
            tid,
            route,
            message,
            word,
            sign,
        }
    }

    /// Recompute the expected signature and compare against `self.sign`.
    pub fn verify(&self, secret: &str) -> bool {
        sign(&self.route, &self.word, secret) == self.sign
    }
}

/// `MD5(route ∥ word ∥ secret)`, hex-encoded.
pub fn sign(route: &str, word: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(route.as_bytes());
    hasher.update(word.as_bytes());
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
