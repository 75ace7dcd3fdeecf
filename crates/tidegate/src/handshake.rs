//! The HTTP → WebSocket upgrade handshake, RFC 6455 Section 4.
//!
//! The gate half of the handshake lives in the server: recognize a valid
//! upgrade request, derive the `Sec-WebSocket-Accept` value, and emit a
//! bit-exact `101 Switching Protocols` response before the socket is handed
//! to the session layer.

use base64::prelude::*;
use sha1::{Digest, Sha1};

use crate::http::{Method, Request};

/// The GUID appended to the client key before hashing, RFC 6455
/// Section 4.2.2.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` value for a client key:
/// `base64(SHA1(key ++ GUID))`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Whether a request satisfies every upgrade precondition:
///
/// - method is `GET` over HTTP/1.1 or later,
/// - `Host` is present,
/// - `Upgrade` contains the `websocket` token,
/// - `Connection` contains the `Upgrade` token,
/// - `Sec-WebSocket-Version` and `Sec-WebSocket-Key` are present.
///
/// Header names match case-insensitively; the `Upgrade`/`Connection` values
/// match by case-insensitive token containment.
pub fn is_upgrade_request(req: &Request) -> bool {
    req.method == Method::Get
        && req.version.at_least(1, 1)
        && req.header("Host").is_some()
        && req.header_has_token("Upgrade", "websocket")
        && req.header_has_token("Connection", "Upgrade")
        && req.header("Sec-WebSocket-Version").is_some()
        && req
            .header("Sec-WebSocket-Key")
            .map(|key| !key.is_empty())
            .unwrap_or(false)
}

/// Serializes the `101 Switching Protocols` response head.
pub(crate) fn switching_protocols_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}
