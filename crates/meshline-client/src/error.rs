use meshline_protocol::{CodecError, PacketError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("the bridge client actor has shut down")]
    ActorGone,
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("request timed out waiting for $response$")]
    Timeout,
}
