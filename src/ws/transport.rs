use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use url::{Position, Url};

use super::config::Trust;
use super::traits::{BoxedTransport, Connector};
use crate::Result;
use crate::error::{Error, Kind};

const WSS_PORT: u16 = 443;
const WS_PORT: u16 = 80;

/// Where a client connects, parsed once from its URL and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    path: String,
    tls: bool,
}

impl Endpoint {
    /// Parses `wss://host[:port]/path?query` (or `ws://` for plain TCP).
    ///
    /// ```
    /// use chatsocket::ws::Endpoint;
    ///
    /// let endpoint = Endpoint::parse("wss://irc-ws.chat.example.tv/socket?v=2").unwrap();
    /// assert_eq!(endpoint.host(), "irc-ws.chat.example.tv");
    /// assert_eq!(endpoint.port(), 443);
    /// assert_eq!(endpoint.path(), "/socket?v=2");
    /// assert!(endpoint.is_tls());
    /// ```
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)?;

        let (tls, default_port) = match url.scheme() {
            "wss" | "https" => (true, WSS_PORT),
            "ws" | "http" => (false, WS_PORT),
            other => {
                return Err(Error::validation(format!(
                    "unsupported scheme {other}, expected ws or wss"
                )));
            }
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::validation(format!("{raw} has no host")))?
            .to_owned();

        Ok(Self {
            host,
            port: url.port().unwrap_or(default_port),
            path: url[Position::BeforePath..Position::AfterQuery].to_owned(),
            tls,
        })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Request target for the upgrade, always starting with `/`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Value of the `Host` header: the port is only spelled out when it is not the default.
    #[must_use]
    pub fn authority(&self) -> String {
        let default_port = if self.tls { WSS_PORT } else { WS_PORT };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Host without IPv6 brackets, as expected by DNS resolution and SNI.
    fn bare_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(&self.host)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "wss" } else { "ws" };
        write!(f, "{scheme}://{}{}", self.authority(), self.path)
    }
}

async fn connect_tcp(endpoint: &Endpoint) -> Result<TcpStream> {
    let stream = TcpStream::connect((endpoint.bare_host(), endpoint.port())).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Plain TCP, used for `ws://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedTransport> {
        Ok(Box::new(connect_tcp(endpoint).await?))
    }
}

/// TLS over TCP, used for `wss://` endpoints.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish_non_exhaustive()
    }
}

impl TlsConnector {
    pub fn new(trust: &Trust) -> Result<Self> {
        let config = match trust {
            Trust::Platform => Arc::new(platform_config()?),
            Trust::Custom(config) => Arc::clone(config),
        };

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(config),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedTransport> {
        let server_name = ServerName::try_from(endpoint.bare_host().to_owned())
            .map_err(|e| Error::validation(format!("invalid server name: {e}")))?;
        let tcp = connect_tcp(endpoint).await?;

        let stream = self
            .inner
            .connect(server_name, tcp)
            .await
            .map_err(Error::tls)?;

        Ok(Box::new(stream))
    }
}

/// Builds a client configuration anchored in the platform trust store.
fn platform_config() -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    #[cfg(feature = "tracing")]
    for e in &native.errors {
        tracing::warn!(error = %e, "Unable to load platform certificate");
    }
    let (added, _ignored) = roots.add_parsable_certificates(native.certs);

    if added == 0 {
        #[cfg(feature = "tracing")]
        tracing::debug!("Platform trust store is empty, using bundled webpki roots");
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::with_source(Kind::Internal, e))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn wss_defaults_to_port_443() {
        let endpoint = Endpoint::parse("wss://chat.example.com/ws").unwrap();

        assert!(endpoint.is_tls());
        assert_eq!(endpoint.port(), 443);
        assert_eq!(endpoint.path(), "/ws");
        assert_eq!(endpoint.authority(), "chat.example.com");
    }

    #[test]
    fn missing_path_becomes_root() {
        let endpoint = Endpoint::parse("wss://chat.example.com").unwrap();
        assert_eq!(endpoint.path(), "/");
    }

    #[test]
    fn explicit_port_is_kept_in_authority() {
        let endpoint = Endpoint::parse("ws://127.0.0.1:9001/echo").unwrap();

        assert!(!endpoint.is_tls());
        assert_eq!(endpoint.port(), 9001);
        assert_eq!(endpoint.authority(), "127.0.0.1:9001");
        assert_eq!(endpoint.to_string(), "ws://127.0.0.1:9001/echo");
    }

    #[test]
    fn ipv6_hosts_are_unbracketed_for_dialing() {
        let endpoint = Endpoint::parse("ws://[::1]:9001/").unwrap();

        assert_eq!(endpoint.host(), "[::1]");
        assert_eq!(endpoint.bare_host(), "::1");
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let error = Endpoint::parse("ftp://example.com/").unwrap_err();
        assert_eq!(error.kind(), Kind::Validation);
    }

    #[tokio::test]
    async fn tcp_connector_reaches_a_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hi").await.unwrap();
        });

        let endpoint = Endpoint::parse(&format!("ws://{addr}/")).unwrap();
        let mut transport = TcpConnector.connect(&endpoint).await.unwrap();
        let mut greeting = [0; 2];
        transport.read_exact(&mut greeting).await.unwrap();

        assert_eq!(&greeting, b"hi");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn failed_tls_handshake_is_a_tls_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Not a TLS server: answer the ClientHello with plaintext and hang up.
            let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });

        let connector = TlsConnector::new(&Trust::Platform).unwrap();
        let endpoint = Endpoint::parse(&format!("wss://localhost:{}/", addr.port())).unwrap();

        let error = connector.connect(&endpoint).await.err().unwrap();
        assert_eq!(error.kind(), Kind::Tls);
        assert!(error.is_fatal(), "tls failures must stop reconnection");
    }
}
