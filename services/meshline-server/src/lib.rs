//! Session registry, routed dispatch, and cluster supervisor for the
//! messaging fabric (spec §4.4 "Message Server").

pub mod cluster;
pub mod config;
pub mod registry;
pub mod server;
pub mod session;
pub mod ws;

pub use cluster::{ClusterDispatchCallback, ClusterDispatcher, Peer};
pub use config::{ServerConfig, ServerConfigError};
pub use registry::{Channel, ServerState};
pub use server::{CloseCallback, MessageServer, RouteHandler, SupervisorCallback, SupervisorCounts};
pub use session::{Outbound, Session, SessionId, Uid};
pub use ws::ws_handler;
