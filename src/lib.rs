//! Clustered WebSocket messaging fabric.
//!
//! This crate is a thin prelude over the workspace's library crates:
//! the wire packet format and codec ([`meshline_protocol`]), the
//! resilient reconnecting client ([`meshline_client`]), the fleet
//! configuration parser ([`meshline_config`]), and the server-side
//! session registry and routed dispatch ([`meshline_server`]). The
//! binary that actually runs a node lives in `services/meshline-server`.

pub use meshline_client::{BridgeClient, BridgeClientConfig, ClientError, ClientEvent};
pub use meshline_config::{load_fleet_config, load_fleet_config_from, FleetConfig, FleetConfigError, PeerNode, SslMaterial};
pub use meshline_protocol::{
    close_codes, codec, envelope, packet, routes, CodecError, EncodedFrame, InnerEnvelope, Packet, PacketError,
    ResponseEnvelope, WireFrame,
};
pub use meshline_server::{
    Channel, CloseCallback, ClusterDispatchCallback, ClusterDispatcher, MessageServer, Outbound, Peer, RouteHandler,
    ServerConfig, ServerConfigError, ServerState, Session, SessionId, SupervisorCallback, SupervisorCounts, Uid,
    ws_handler,
};
