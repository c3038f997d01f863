//! The sole unit crossing every WebSocket edge (spec §3).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A single framed message.
///
/// `route` addresses the dispatch target; reserved routes are fenced
/// with `$` on both ends (see [`crate::routes`]). `req_id` correlates
/// a request with its eventual `$response$`. `message` is an arbitrary
/// JSON-representable application payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    pub route: String,
    pub req_id: u64,
    pub message: Value,
}

impl Packet {
    pub fn new(route: impl Into<String>, req_id: u64, message: Value) -> Self {
        Self {
            route: route.into(),
            req_id,
            message,
        }
    }

    /// Validate the shape invariant from spec §3: `route` is a
    /// non-empty string, `reqId` is a number, `message` is present and
    /// not a null sentinel. Loosely-typed JSON (as produced by the
    /// codec before any struct is assumed) is checked field-by-field so
    /// that malformed packets surface as [`PacketError`] rather than a
    /// serde type-mismatch error — those two failure classes map to
    /// distinct close codes (4001 vs 4002) upstream.
    pub fn from_value(value: Value) -> Result<Self, PacketError> {
        let Value::Object(mut obj) = value else {
            return Err(PacketError::NotAnObject);
        };

        let route = match obj.remove("route") {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::String(_)) => return Err(PacketError::EmptyRoute),
            Some(_) => return Err(PacketError::RouteNotString),
            None => return Err(PacketError::MissingField("route")),
        };

        let req_id = match obj.remove("reqId") {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or(PacketError::ReqIdNotUnsignedInteger)?,
            Some(_) => return Err(PacketError::ReqIdNotNumber),
            None => return Err(PacketError::MissingField("reqId")),
        };

        let message = match obj.remove("message") {
            Some(Value::Null) | None => return Err(PacketError::MissingMessage),
            Some(v) => v,
        };

        Ok(Packet {
            route,
            req_id,
            message,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("decoded payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("`route` must be a non-empty string")]
    EmptyRoute,
    #[error("`route` must be a string")]
    RouteNotString,
    #[error("`reqId` must be a number")]
    ReqIdNotNumber,
    #[error("`reqId` must be a non-negative integer")]
    ReqIdNotUnsignedInteger,
    #[error("`message` must be present and non-null")]
    MissingMessage,
}
