//! WebSocket opening handshake (RFC 6455 Section 4.2).

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("upgrade request must use GET")]
    NotGet,
    #[error("missing or invalid Upgrade header")]
    MissingUpgrade,
    #[error("Connection header does not list upgrade")]
    MissingConnectionUpgrade,
    #[error("unsupported Sec-WebSocket-Version {0:?}")]
    UnsupportedVersion(Option<String>),
    #[error("missing or malformed Sec-WebSocket-Key")]
    InvalidKey,
    #[error("connection closed before the upgrade")]
    ConnectionClosed,
}

/// Compute the `Sec-WebSocket-Accept` value per RFC 6455 Section 4.2.2.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Checks an upgrade request and returns its client key.
pub fn validate_upgrade_request(request: &Request) -> Result<&str, HandshakeError> {
    if request.method != Method::GET {
        return Err(HandshakeError::NotGet);
    }
    if !request.header_has_token("Upgrade", "websocket") {
        return Err(HandshakeError::MissingUpgrade);
    }
    if !request.header_has_token("Connection", "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }

    match request.header("Sec-WebSocket-Version") {
        Some("13") => {}
        other => return Err(HandshakeError::UnsupportedVersion(other.map(str::to_string))),
    }

    let key = request
        .header("Sec-WebSocket-Key")
        .map(str::trim)
        .ok_or(HandshakeError::InvalidKey)?;
    match BASE64.decode(key) {
        Ok(decoded) if decoded.len() == 16 => Ok(key),
        _ => Err(HandshakeError::InvalidKey),
    }
}

/// The 101 response accepting `request`.
pub fn switching_protocols(request: &Request) -> Result<Response, HandshakeError> {
    let key = validate_upgrade_request(request)?;
    Ok(ResponseBuilder::new(StatusCode::SwitchingProtocols)
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Accept", compute_accept_key(key))
        .build())
}
