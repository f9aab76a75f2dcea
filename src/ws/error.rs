#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// The upgrade response did not start with `HTTP/1.1 101`
    HandshakeRejected {
        /// Raw status line sent by the server
        status_line: String,
    },
    /// `Sec-WebSocket-Accept` was missing or did not match the key we sent
    AcceptMismatch {
        /// Digest computed from our `Sec-WebSocket-Key`
        expected: String,
        /// Value sent by the server, if any
        actual: Option<String>,
    },
    /// The upgrade response could not be parsed
    InvalidResponse(String),
    /// No PONG arrived before the keepalive deadline
    PongTimeout,
    /// WebSocket connection was closed
    ConnectionClosed,
    /// A single frame declared a payload above the configured limit
    FrameTooLarge {
        /// Declared payload length
        len: u64,
        /// Configured limit
        max: usize,
    },
    /// A reassembled or inflated message grew above the configured limit
    MessageTooLarge {
        /// Configured limit
        max: usize,
    },
    /// A completed text message was not valid UTF-8
    InvalidUtf8,
    /// Inflating or deflating a permessage-deflate payload failed
    Compression(io::Error),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeRejected { status_line } => {
                write!(f, "WebSocket upgrade rejected: {status_line}")
            }
            Self::AcceptMismatch {
                expected,
                actual: Some(actual),
            } => write!(
                f,
                "Sec-WebSocket-Accept mismatch: expected {expected}, got {actual}"
            ),
            Self::AcceptMismatch {
                expected,
                actual: None,
            } => write!(f, "Sec-WebSocket-Accept missing, expected {expected}"),
            Self::InvalidResponse(reason) => write!(f, "Invalid upgrade response: {reason}"),
            Self::PongTimeout => write!(f, "No PONG received before the keepalive deadline"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "Frame payload of {len} bytes exceeds limit of {max}")
            }
            Self::MessageTooLarge { max } => write!(f, "Message exceeds limit of {max} bytes"),
            Self::InvalidUtf8 => write!(f, "Invalid UTF-8 in text message"),
            Self::Compression(e) => write!(f, "permessage-deflate failure: {e}"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Compression(e) => Some(e),
            _ => None,
        }
    }
}
