//! Packet encode/decode and the encrypted framing envelope (spec §4.1).
//!
//! Plaintext mode (no password) emits/parses compact JSON. Encrypted
//! mode derives a per-message key from a random salt via
//! `HMAC-SHA256(salt, password)` and encrypts the JSON with
//! AES-256-CBC/PKCS#7, framing as `salt ∥ iv ∥ ciphertext`.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use crate::packet::Packet;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;

/// An inbound frame as received off the wire, before decoding.
pub enum WireFrame<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

/// An outbound frame, ready to be sent as either a text or binary
/// WebSocket message depending on what the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedFrame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not valid base64")]
    Encoding,
    #[error("frame is too short to contain salt and iv")]
    Truncated,
    #[error("HMAC key derivation failed")]
    KeyDerivation,
    #[error("AES-CBC decryption or padding check failed")]
    Decryption,
}

/// Encode a packet. `password` switches on the encrypted envelope;
/// `binary` (only meaningful when encrypting) picks the outbound frame
/// kind.
pub fn encode(packet: &Packet, password: Option<&str>, binary: bool) -> Result<EncodedFrame, CodecError> {
    let json = serde_json::to_string(packet)?;

    let Some(password) = password else {
        return Ok(EncodedFrame::Text(json));
    };

    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut iv);

    let key = derive_key(&salt, password)?;
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(json.as_bytes());

    let mut framed = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
    framed.extend_from_slice(&salt);
    framed.extend_from_slice(&iv);
    framed.extend_from_slice(&ciphertext);

    if binary {
        Ok(EncodedFrame::Binary(framed))
    } else {
        Ok(EncodedFrame::Text(base64_encode(&framed)))
    }
}

/// Decode a frame to the raw JSON value it carried. Shape validation
/// (is it actually a well-formed [`Packet`]) is a separate step — see
/// [`Packet::from_value`] — so that codec failures (4001) and format
/// failures (4002) stay distinguishable upstream.
pub fn decode(frame: WireFrame<'_>, password: Option<&str>) -> Result<Value, CodecError> {
    let Some(password) = password else {
        let bytes: &[u8] = match frame {
            WireFrame::Text(s) => s.as_bytes(),
            WireFrame::Binary(b) => b,
        };
        if bytes.is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        return Ok(serde_json::from_slice(bytes)?);
    };

    let framed = match frame {
        WireFrame::Binary(b) => b.to_vec(),
        WireFrame::Text(s) => base64_decode(s)?,
    };

    if framed.len() < SALT_LEN + IV_LEN {
        return Err(CodecError::Truncated);
    }
    let (salt, rest) = framed.split_at(SALT_LEN);
    let (iv, ciphertext) = rest.split_at(IV_LEN);

    let key = derive_key(salt, password)?;
    let plaintext = Aes256CbcDec::new(&key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CodecError::Decryption)?;

    Ok(serde_json::from_slice(&plaintext)?)
}

fn derive_key(salt: &[u8], password: &str) -> Result<[u8; 32], CodecError> {
    let mut mac =
        HmacSha256::new_from_slice(password.as_bytes()).map_err(|_| CodecError::KeyDerivation)?;
    mac.update(salt);
    let mut key = [0u8; 32];
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(key)
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(text: &str) -> Result<Vec<u8>, CodecError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|_| CodecError::Encoding)
}
