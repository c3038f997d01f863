//! Framework-reserved WebSocket close codes (spec §6).
//!
//! 4001-4100 are server-originated, 4101-4200 client-originated.
//! 4201-4999 is left free for application use.

/// Codec failure while decoding an inbound frame.
pub const PARSE_ERROR: u16 = 4001;
/// Packet decoded but failed shape validation.
pub const FORMAT_ERROR: u16 = 4002;
/// `reqId` already present in the session's recent-request ring.
pub const REPEAT_ERROR: u16 = 4003;
/// Inner cluster envelope signature did not verify.
pub const SIGN_ERROR: u16 = 4004;
/// `$innerRMC$` targeted a route with no registered remote handler.
pub const REMOTE_ERROR: u16 = 4005;
/// A user route with no registered handler.
pub const ROUTE_ERROR: u16 = 4006;
/// Underlying socket error.
pub const SOCKET_ERROR: u16 = 4007;
/// Session exceeded the heartbeat timeout.
pub const TIMEOUT: u16 = 4008;
/// Session was displaced by a newer bind of the same UID.
pub const NEWBIND: u16 = 4009;

/// Client replacing a stale socket before reconnecting.
pub const CLIENT_RETRY: u16 = 4101;
/// Client observed the remote side close the connection.
pub const CLIENT_CLOSE: u16 = 4102;
/// Client-side transport error.
pub const CLIENT_ERROR: u16 = 4103;
/// Explicit `disconnect()` call — terminal.
pub const CLIENT_CALL: u16 = 4104;
