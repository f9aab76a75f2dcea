#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Constant;
use bon::Builder;
use rustls::ClientConfig;

const DEFAULT_PING_INTERVAL_DURATION: Duration = Duration::from_secs(270);
const DEFAULT_PONG_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_CLOSE_TIMEOUT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_RECONNECT_DELAY_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Configuration for WebSocket client behavior.
///
/// ```
/// use std::time::Duration;
///
/// use chatsocket::ws::config::Config;
///
/// let config = Config::builder()
///     .keepalive(true)
///     .headers(vec![("Authorization".to_owned(), "OAuth token".to_owned())])
///     .pong_timeout(Duration::from_secs(5))
///     .build();
///
/// assert!(config.keepalive());
/// ```
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Extra headers written into the upgrade request, in order
    #[builder(default)]
    pub(crate) headers: Vec<(String, String)>,
    /// Whether this client sends PINGs and enforces the PONG deadline
    #[builder(default)]
    pub(crate) keepalive: bool,
    /// Idle time between a connection opening (or the last PONG) and the next PING
    #[builder(default = DEFAULT_PING_INTERVAL_DURATION)]
    pub(crate) ping_interval: Duration,
    /// Maximum time to wait for PONG response before considering connection dead
    #[builder(default = DEFAULT_PONG_TIMEOUT_DURATION)]
    pub(crate) pong_timeout: Duration,
    /// How long [`disconnect`](crate::ws::Client::disconnect) waits for the peer to finish the
    /// closing handshake before the socket is closed anyway
    #[builder(default = DEFAULT_CLOSE_TIMEOUT_DURATION)]
    pub(crate) close_timeout: Duration,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub(crate) reconnect: ReconnectConfig,
    /// Certificate trust used for `wss` endpoints
    #[builder(default)]
    pub(crate) trust: Trust,
    /// Largest payload accepted in a single inbound frame
    #[builder(default = DEFAULT_MAX_FRAME_SIZE)]
    pub(crate) max_frame_size: usize,
    /// Largest inbound message accepted after reassembly and inflation
    #[builder(default = DEFAULT_MAX_MESSAGE_SIZE)]
    pub(crate) max_message_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    #[must_use]
    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    #[must_use]
    pub fn pong_timeout(&self) -> Duration {
        self.pong_timeout
    }

    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

/// Configuration for automatic reconnection behavior.
///
/// Reconnection is unbounded: the client keeps retrying until it is stopped or a TLS failure
/// occurs.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Pause between the end of one connection attempt and the start of the next
    pub delay: Duration,
}

impl ReconnectConfig {
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY_DURATION,
        }
    }
}

impl From<ReconnectConfig> for Constant {
    fn from(config: ReconnectConfig) -> Self {
        Constant::new(config.delay)
    }
}

/// Where server certificates for `wss` endpoints are anchored.
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub enum Trust {
    /// The operating system's trust store, falling back to the bundled Mozilla roots when the
    /// platform store is unavailable or empty
    #[default]
    Platform,
    /// A caller-supplied TLS configuration, used as is
    Custom(Arc<ClientConfig>),
}
