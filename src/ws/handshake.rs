//! Opening handshake (RFC 6455 Section 4) for the client role.
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! Sec-WebSocket-Extensions: permessage-deflate
//! ```
//!
//! The server must answer `HTTP/1.1 101` with a `Sec-WebSocket-Accept` digest of our key, and
//! may agree to compression by echoing `permessage-deflate`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest as _, Sha1};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt as _, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _,
};

use super::error::WsError;
use super::transport::Endpoint;
use crate::Result;

/// RFC 6455 GUID for Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const SWITCHING_PROTOCOLS: &str = "HTTP/1.1 101";

const MAX_RESPONSE_HEAD: u64 = 16 * 1024;
const MAX_RESPONSE_HEADERS: usize = 64;

/// What the server agreed to during the upgrade.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// permessage-deflate is active for the lifetime of this connection
    pub compression: bool,
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// ```
/// use chatsocket::ws::handshake::accept_key;
///
/// assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A fresh random 16-byte key, base64 encoded.
fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    STANDARD.encode(nonce)
}

/// Runs the upgrade over `stream` and returns what was negotiated.
///
/// `stream` must be buffered: whatever the server sends right after the response head stays in
/// the buffer for the frame reader.
pub async fn perform<S>(
    stream: &mut S,
    endpoint: &Endpoint,
    headers: &[(String, String)],
) -> Result<Negotiated>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    stream
        .write_all(build_request(endpoint, &key, headers).as_bytes())
        .await?;
    stream.flush().await?;

    let mut budget = MAX_RESPONSE_HEAD;
    let status_line = read_line(stream, &mut budget).await?;
    if !status_line.starts_with(SWITCHING_PROTOCOLS) {
        return Err(WsError::HandshakeRejected { status_line }.into());
    }

    let mut response_headers = Vec::new();
    loop {
        let line = read_line(stream, &mut budget).await?;
        if line.is_empty() {
            break;
        }
        if response_headers.len() == MAX_RESPONSE_HEADERS {
            return Err(WsError::InvalidResponse("too many headers".to_owned()).into());
        }
        if let Some((name, value)) = line.split_once(':') {
            response_headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }
    }

    validate(&key, &response_headers).map_err(Into::into)
}

/// Serializes the upgrade request. Caller headers follow the protocol headers.
#[must_use]
pub fn build_request(endpoint: &Endpoint, key: &str, headers: &[(String, String)]) -> String {
    let mut request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Extensions: {PERMESSAGE_DEFLATE}\r\n",
        path = endpoint.path(),
        host = endpoint.authority(),
    );
    for (name, value) in headers {
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

/// Checks the response headers against the key we sent.
pub fn validate(
    key: &str,
    headers: &[(String, String)],
) -> std::result::Result<Negotiated, WsError> {
    let expected = accept_key(key);
    let accept = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Sec-WebSocket-Accept"))
        .map(|(_, value)| value.as_str());

    if accept != Some(expected.as_str()) {
        return Err(WsError::AcceptMismatch {
            expected,
            actual: accept.map(str::to_owned),
        });
    }

    let compression = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("Sec-WebSocket-Extensions"))
        .any(|(_, value)| offers_deflate(value));

    Ok(Negotiated { compression })
}

/// Whether a `Sec-WebSocket-Extensions` value lists permessage-deflate, with or without
/// parameters.
fn offers_deflate(value: &str) -> bool {
    value.split(',').any(|extension| {
        extension
            .split(';')
            .next()
            .is_some_and(|name| name.trim().eq_ignore_ascii_case(PERMESSAGE_DEFLATE))
    })
}

/// Reads one CRLF (or bare LF) terminated line, charging it against `budget`.
async fn read_line<S: AsyncBufRead + Unpin>(stream: &mut S, budget: &mut u64) -> Result<String> {
    let mut line = Vec::new();
    let read = (&mut *stream)
        .take(*budget)
        .read_until(b'\n', &mut line)
        .await?;
    *budget = budget.saturating_sub(read as u64);

    if !line.ends_with(b"\n") {
        if read == 0 || *budget > 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            )
            .into());
        }
        return Err(WsError::InvalidResponse("response head too large".to_owned()).into());
    }

    while line.last().is_some_and(|byte| matches!(byte, b'\r' | b'\n')) {
        line.pop();
    }

    String::from_utf8(line).map_err(|_utf8| {
        WsError::InvalidResponse("response head is not UTF-8".to_owned()).into()
    })
}
