//! Core traits at the seams of the WebSocket client.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::transport::Endpoint;
use crate::Result;
use crate::error::Error;

/// Receives everything the client has to say about a connection.
///
/// Callbacks run on the connection's read task, so they should hand work off rather than
/// block.
///
/// # Example
///
/// ```
/// use chatsocket::error::Error;
/// use chatsocket::ws::Listener;
///
/// struct Printer;
///
/// impl Listener for Printer {
///     fn on_message(&self, text: String) {
///         let _ = text;
///     }
///
///     fn on_failure(&self, error: Error) {
///         let _ = error;
///     }
/// }
/// ```
pub trait Listener: Send + Sync + 'static {
    /// The upgrade succeeded and frames may now flow.
    fn on_open(&self) {}

    /// A complete, decoded text message arrived.
    fn on_message(&self, text: String);

    /// A connection attempt or a live connection failed. Not called for failures that follow a
    /// close this client asked for, nor for a close initiated by the peer.
    fn on_failure(&self, error: Error) {
        let _ = error;
    }
}

/// Byte stream a WebSocket runs over.
///
/// Implemented for anything that reads and writes asynchronously, so TLS sessions, plain TCP
/// sockets and in-memory pipes all qualify.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens transports to an [`Endpoint`].
///
/// Errors of [`Kind::Tls`](crate::error::Kind::Tls) are treated as fatal by the client and stop
/// reconnection; any other error is retried.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedTransport>;
}
