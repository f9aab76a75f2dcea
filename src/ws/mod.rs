//! Core WebSocket infrastructure.
//!
//! A client speaks RFC 6455 directly over a [`Transport`]: the upgrade handshake, frame
//! encoding and masking, fragmentation, permessage-deflate and the control frames are all
//! handled here rather than by a WebSocket library.
//!
//! # Architecture
//!
//! - [`Client`]: Connection lifecycle, reconnection and the public operations
//! - [`handshake`]: HTTP/1.1 upgrade request and response validation
//! - [`frame`]: Frame reader and writer for one connection
//! - [`deflate`]: permessage-deflate without context takeover
//! - `keepalive` (internal): PING schedule and PONG deadline
//! - [`transport`]: Endpoints and the TCP and TLS [`Connector`]s
//!
//! # Example
//!
//! ```no_run
//! use chatsocket::ws::{Client, Listener, config::Config};
//!
//! struct Printer;
//!
//! impl Listener for Printer {
//!     fn on_message(&self, text: String) {
//!         println!("< {text}");
//!     }
//! }
//!
//! # async fn run() -> chatsocket::Result<()> {
//! let config = Config::builder().keepalive(true).build();
//! let client = Client::new("wss://irc-ws.chat.example.tv:443", Printer, config)?;
//! client.start().await
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod deflate;
pub mod error;
pub mod frame;
pub mod handshake;
pub(crate) mod keepalive;
pub mod traits;
pub mod transport;

pub use connection::{Client, ConnectionState};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
pub use transport::Endpoint;
