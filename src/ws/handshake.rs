//! The `101 Switching Protocols` upgrade handshake (RFC 6455 §4.2).
//!
//! Runs synchronously inside a user handler — there is no dedicated upgrade
//! thread, since the handshake is pure computation over already-parsed
//! request headers.

use crate::{http::types::StatusCode, Handled, Request, Response};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::{Digest, Sha1};
use std::{error, fmt};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Attempts to upgrade `req`/`resp` to a WebSocket connection.
///
/// On success, `resp` is left finalised with status `101 Switching
/// Protocols`, `Upgrade: websocket`, and `Sec-WebSocket-Accept` set; the
/// worker adds the `Connection: upgrade` header itself (see the crate-level
/// gather-write documentation). The returned [`Handled`] is the same value
/// your handler must return to finish the response.
///
/// On failure, `resp` is left untouched — the caller decides how to respond
/// (usually `400 Bad Request`).
///
/// # Examples
/// ```
/// use nimbus_http::{ws, Handled, Request, Response, StatusCode};
///
/// fn handle(req: &Request, resp: &mut Response) -> Handled {
///     match ws::handshake::upgrade(req, resp) {
///         Ok(handled) => handled,
///         Err(_) => resp.status(StatusCode::BadRequest).body("expected a WebSocket upgrade"),
///     }
/// }
/// ```
pub fn upgrade(req: &Request, resp: &mut Response) -> Result<Handled, Error> {
    let upgrade_header = req.header(b"upgrade").ok_or(Error::NotAnUpgradeRequest)?;
    if !upgrade_header.eq_ignore_ascii_case(b"websocket") {
        return Err(Error::NotAnUpgradeRequest);
    }

    let key = req
        .header(b"sec-websocket-key")
        .ok_or(Error::MissingKey)?;

    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(GUID);
    let accept = STANDARD.encode(hasher.finalize());

    resp.mark_ws_upgrade();
    Ok(resp
        .status(StatusCode::SwitchingProtocols)
        .header("upgrade", "websocket")
        .header("sec-websocket-accept", accept)
        .body(""))
}

/// Why a handshake attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No `Upgrade: websocket` header was present (or it named something else).
    NotAnUpgradeRequest,
    /// The request was missing `Sec-WebSocket-Key`.
    MissingKey,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotAnUpgradeRequest => write!(f, "request did not ask for a WebSocket upgrade"),
            Error::MissingKey => write!(f, "missing Sec-WebSocket-Key header"),
        }
    }
}
