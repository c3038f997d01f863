//! Resilient, reconnecting WebSocket client for the messaging fabric.
//!
//! A [`BridgeClient`] owns a single socket on a background actor task
//! and exposes request/response calls, fire-and-forget sends, and
//! route-keyed pub/sub subscriptions to callers. It never gives up on
//! a dropped connection short of an explicit [`BridgeClient::disconnect`]
//! or [`BridgeClient::close`] — it just keeps retrying on `conntick`.

pub mod client;
pub mod config;
pub mod error;

pub use client::{BridgeClient, ClientEvent};
pub use config::BridgeClientConfig;
pub use error::ClientError;
