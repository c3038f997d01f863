//! Wire packet format and encrypted framing for the messaging fabric.
//!
//! This crate is the single source of truth for the bytes that cross a
//! WebSocket edge: the [`Packet`] envelope, the `$response$` and inner
//! cluster envelopes, the reserved route names, the encode/decode
//! codec (with its optional AES-256-CBC encrypted framing), and the
//! framework's reserved close codes. Both the client and server crates
//! depend on this one so they can never drift on wire shape.

pub mod close_codes;
pub mod codec;
pub mod envelope;
pub mod packet;
pub mod routes;

pub use codec::{decode, encode, CodecError, EncodedFrame, WireFrame};
pub use envelope::{InnerEnvelope, ResponseEnvelope};
pub use packet::{Packet, PacketError};
