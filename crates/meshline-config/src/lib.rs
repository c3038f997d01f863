//! Parses the per-process environment the deployment descriptor
//! compiler (out of scope here) is said to produce, into a typed
//! [`FleetConfig`].
//!
//! The core only ever consumes this environment as opaque
//! configuration; it does not know how it was produced. As in
//! `services/forwarder/src/config.rs`, raw/optional fields are parsed
//! first and validated/defaulted into a strict struct, so a caller
//! gets one precise [`FleetConfigError`] instead of a panic.

use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

/// TLS material referenced by `APP_SSLS` / a peer's `ssls` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SslMaterial {
    pub key: String,
    pub cert: String,
}

/// One peer node entry under a group in `APP_NODES`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerNode {
    pub host: String,
    pub inip: String,
    pub port: u16,
    #[serde(default)]
    pub ssls: Option<SslMaterial>,
}

impl PeerNode {
    /// The `ws://` or `wss://` endpoint this peer's Bridge Client
    /// should connect to, derived from whether it carries TLS material.
    pub fn ws_url(&self, path: &str) -> String {
        let scheme = if self.ssls.is_some() { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{}", self.host, self.port, path)
    }
}

/// The fully parsed `APP_*` environment for this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetConfig {
    pub dir: String,
    pub env: String,
    pub name: String,
    pub host: String,
    pub inip: String,
    pub port: u16,
    pub ssls: Option<SslMaterial>,
    pub links: Vec<String>,
    pub nodes: HashMap<String, Vec<PeerNode>>,
}

impl FleetConfig {
    /// Peers of this node — the union of every group named in `links`,
    /// resolved against `nodes`. A link naming a group absent from
    /// `nodes` contributes no peers (not an error: the group may simply
    /// have no members in this environment).
    pub fn linked_peers(&self) -> Vec<&PeerNode> {
        self.links
            .iter()
            .filter_map(|group| self.nodes.get(group))
            .flatten()
            .collect()
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

#[derive(Debug, Error)]
pub enum FleetConfigError {
    #[error("missing required environment variable {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("could not parse JSON for {field}: {source}")]
    Json {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Load the fleet configuration from the real process environment.
pub fn load_fleet_config() -> Result<FleetConfig, FleetConfigError> {
    load_fleet_config_from(|key| std::env::var(key).ok())
}

/// Load the fleet configuration from an injected getter — lets tests
/// supply a fake environment without touching real process state.
pub fn load_fleet_config_from(
    get: impl Fn(&str) -> Option<String>,
) -> Result<FleetConfig, FleetConfigError> {
    let required = |key: &'static str| get(key).ok_or(FleetConfigError::MissingField(key));

    let dir = required("APP_DIR")?;
    let env = required("APP_ENV")?;
    let name = required("APP_NAME")?;
    let host = required("APP_HOST")?;
    let inip = get("APP_INIP").unwrap_or_else(|| host.clone());

    let port_str = required("APP_PORT")?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| FleetConfigError::InvalidValue {
            field: "APP_PORT",
            reason: format!("`{port_str}` is not a valid port number"),
        })?;

    let ssls = match get("APP_SSLS") {
        None => None,
        Some(raw) if raw.is_empty() => None,
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|source| FleetConfigError::Json {
            field: "APP_SSLS",
            source,
        })?),
    };

    let links: Vec<String> = match get("APP_LINKS") {
        None => Vec::new(),
        Some(raw) if raw.is_empty() => Vec::new(),
        Some(raw) => serde_json::from_str(&raw).map_err(|source| FleetConfigError::Json {
            field: "APP_LINKS",
            source,
        })?,
    };

    let nodes: HashMap<String, Vec<PeerNode>> = match get("APP_NODES") {
        None => HashMap::new(),
        Some(raw) if raw.is_empty() => HashMap::new(),
        Some(raw) => serde_json::from_str(&raw).map_err(|source| FleetConfigError::Json {
            field: "APP_NODES",
            source,
        })?,
    };

    Ok(FleetConfig {
        dir,
        env,
        name,
        host,
        inip,
        port,
        ssls,
        links,
        nodes,
    })
}
